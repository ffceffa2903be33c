mod cli;
mod snapshot;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use coverband_client::{
    BackgroundReporter, ClientConfig, CoverageOptions, CoverageType, SaveOutcome, ServiceStore,
};
use snapshot::{read_report, FileDelta};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env().context("invalid Coverband configuration")?;
    if let Some(url) = &cli.url {
        config = config.with_base_url(url)?;
    }
    if cli.api_key.is_some() {
        config = config.with_api_key(cli.api_key.clone());
    }
    let store = Arc::new(if cli.simple {
        ServiceStore::simple(config)
    } else {
        ServiceStore::persistent(config)
    });
    info!(
        transport = %store.transport_kind(),
        url = %store.config().base_url,
        runtime_env = %store.config().runtime_env,
        "coverband reporter ready"
    );

    let force = cli.force;
    let reports = matches!(cli.command, Commands::Push { .. } | Commands::Views { .. });
    if reports && store.config().service_disabled() && !force {
        warn_disabled(store.config());
        return Ok(());
    }

    match cli.command {
        Commands::Push { file, eager } => {
            let report = read_report(&file)?;
            if eager {
                store.set_type(CoverageType::EagerLoading);
            }
            match store.save_report(report).await {
                SaveOutcome::Sent => info!(file = %file.display(), "coverage report sent"),
                SaveOutcome::Skipped => {
                    info!(file = %file.display(), "coverage report empty; nothing sent")
                }
                SaveOutcome::Dropped => bail!("coverage report was not delivered"),
            }
        }
        Commands::Fetch {
            coverage_type,
            env_filter,
        } => {
            let coverage_type: CoverageType = coverage_type.parse()?;
            let snapshot = store
                .coverage(
                    Some(coverage_type),
                    CoverageOptions {
                        override_type: None,
                        env_filter,
                    },
                )
                .await;
            match snapshot {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => bail!("could not retrieve coverage"),
            }
        }
        Commands::Views { paths } => {
            let tracker = store.view_tracker();
            for path in paths {
                tracker.track(path);
            }
            if tracker.report_views_tracked().await == SaveOutcome::Dropped {
                bail!("tracked views were not delivered");
            }
        }
        Commands::Watch { file } => {
            let source = Arc::new(FileDelta::new(file));
            let views = Some(Arc::new(store.view_tracker()));
            let cancel = CancellationToken::new();
            let handle = if force {
                store.config().schedule().map(|schedule| {
                    let cancel = cancel.clone();
                    BackgroundReporter::spawn(store.clone(), source, views, schedule, cancel)
                })
            } else {
                BackgroundReporter::start(store.clone(), source, views, cancel.clone())
            };
            let Some(handle) = handle else {
                warn_disabled(store.config());
                return Ok(());
            };

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            info!("shutting down; sending final report");
            cancel.cancel();
            handle.await.context("background reporter panicked")?;
        }
    }

    Ok(())
}

fn warn_disabled(config: &ClientConfig) {
    warn!(
        runtime_env = %config.runtime_env,
        "Coverband is not reporting in this environment; \
         set COVERBAND_ENABLE_DEV_MODE or COVERBAND_ENABLE_TEST_MODE, or pass --force"
    );
}

fn init_tracing() {
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
