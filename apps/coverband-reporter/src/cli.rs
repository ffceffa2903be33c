use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "coverband-reporter")]
#[command(about = "Push coverage deltas and tracked views to the Coverband collector")]
pub struct Cli {
    /// Collector base URL (defaults to COVERBAND_URL or https://coverband.io)
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// API token sent as Coverband-Token
    #[arg(long, global = true, env = "COVERBAND_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Open a new connection per request instead of reusing one
    #[arg(long, global = true)]
    pub simple: bool,

    /// Report even where the environment disables the service
    #[arg(long, global = true)]
    pub force: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one coverage report read from a JSON file ({"path": [counters]})
    Push {
        #[arg(short, long)]
        file: PathBuf,

        /// Tag the report as collected while the app was loading
        #[arg(long)]
        eager: bool,
    },
    /// Print the collector's coverage snapshot
    Fetch {
        /// eager_loading or runtime
        #[arg(short = 't', long = "type", default_value = "runtime")]
        coverage_type: String,

        #[arg(long)]
        env_filter: Option<String>,
    },
    /// Report a list of rendered views
    Views {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Re-read a cumulative coverage file on the background schedule and send
    /// what grew since the last read, until interrupted
    Watch {
        #[arg(short, long)]
        file: PathBuf,
    },
}
