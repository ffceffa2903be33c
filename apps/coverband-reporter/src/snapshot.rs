use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use coverband_client::{CoverageReport, DeltaSource};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::warn;

/// Turns a coverage file that holds cumulative counters into per-tick deltas.
///
/// Each read is diffed against the previous one. The previous snapshot
/// advances on every read, so a delta whose send is dropped is not resent.
pub struct FileDelta {
    path: PathBuf,
    previous: Mutex<CoverageReport>,
}

impl FileDelta {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            previous: Mutex::new(CoverageReport::new()),
        }
    }
}

impl DeltaSource for FileDelta {
    fn take_delta(&self) -> CoverageReport {
        let current = match read_report(&self.path) {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "failed to read coverage file");
                return CoverageReport::new();
            }
        };
        let mut previous = self.previous.lock();
        let delta = diff_reports(&previous, &current);
        *previous = current;
        delta
    }
}

pub fn read_report(path: &Path) -> Result<CoverageReport> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a coverage report", path.display()))
}

/// Files seen for the first time are passed through whole. Known files are
/// kept only if some counter grew.
pub fn diff_reports(previous: &CoverageReport, current: &CoverageReport) -> CoverageReport {
    current
        .iter()
        .filter_map(|(path, counters)| match previous.get(path) {
            None => Some((path.clone(), counters.clone())),
            Some(before) => {
                let delta = diff_counters(counters, Some(before));
                has_hits(&delta).then(|| (path.clone(), delta))
            }
        })
        .collect()
}

fn diff_counters(current: &Value, previous: Option<&Value>) -> Value {
    match (current, previous) {
        (Value::Number(now), Some(Value::Number(before))) => {
            match (now.as_u64(), before.as_u64()) {
                (Some(now), Some(before)) if now >= before => Value::from(now - before),
                // A counter that went backwards was reset; the new value is the delta.
                _ => current.clone(),
            }
        }
        (Value::Array(now), Some(Value::Array(before))) => Value::Array(
            now.iter()
                .enumerate()
                .map(|(idx, value)| diff_counters(value, before.get(idx)))
                .collect(),
        ),
        (Value::Object(now), Some(Value::Object(before))) => Value::Object(
            now.iter()
                .map(|(key, value)| (key.clone(), diff_counters(value, before.get(key))))
                .collect::<Map<String, Value>>(),
        ),
        _ => current.clone(),
    }
}

fn has_hits(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_f64().is_some_and(|n| n > 0.0),
        Value::Array(items) => items.iter().any(has_hits),
        Value::Object(map) => map.values().any(has_hits),
        _ => false,
    }
}
