//! `env_logger` bootstrap plus the optional line-delimited JSON metrics log.

use crate::controller::{ControlMode, ManualCommand};
use crate::domain::{PerRoad, Road};
use crate::metrics::RoadMetrics;
use crate::predictor::Prediction;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Initializes `env_logger` from `RUST_LOG` if set (it always wins, matching
/// `env_logger`'s own precedence), otherwise from the config's level hint.
pub fn init(level_hint: &str) {
    let builder_env = env_logger::Env::default().default_filter_or(level_hint.to_string());
    env_logger::Builder::from_env(builder_env).init();
}

#[derive(Debug, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ManualEvent {
    ModeChange { mode: ControlMode },
    ManualApply { command: ManualCommand, duration: u64 },
    ManualExpire,
    ManualCancel,
    EmergencyInterrupt { road: Road },
}

#[derive(Debug, Serialize)]
struct DecisionCycleRecord<'a> {
    timestamp: u64,
    simulation_time: u64,
    metrics: &'a PerRoad<RoadMetrics>,
    signal: Road,
    predictions: &'a PerRoad<Prediction>,
}

#[derive(Debug, Serialize)]
struct ManualEventRecord<'a> {
    timestamp: u64,
    simulation_time: u64,
    #[serde(flatten)]
    event: &'a ManualEvent,
}

/// Appends one JSON object per line to the configured metrics log path. A
/// write failure is logged and otherwise ignored — the metrics log is a
/// diagnostic aid, never load-bearing for the tick loop.
pub struct MetricsLog {
    path: Option<std::path::PathBuf>,
}

impl MetricsLog {
    pub fn new(path: Option<impl AsRef<Path>>) -> Self {
        Self {
            path: path.map(|p| p.as_ref().to_path_buf()),
        }
    }

    fn append_line(&self, line: &str) {
        let Some(path) = &self.path else { return };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(err) = result {
            log::warn!("failed to write metrics log at {:?}: {err}", path);
        }
    }

    pub fn record_decision_cycle(
        &self,
        timestamp: u64,
        simulation_time: u64,
        metrics: &PerRoad<RoadMetrics>,
        signal: Road,
        predictions: &PerRoad<Prediction>,
    ) {
        if self.path.is_none() {
            return;
        }
        let record = DecisionCycleRecord {
            timestamp,
            simulation_time,
            metrics,
            signal,
            predictions,
        };
        match serde_json::to_string(&record) {
            Ok(line) => self.append_line(&line),
            Err(err) => log::warn!("failed to serialize decision-cycle record: {err}"),
        }
    }

    pub fn record_manual_event(&self, timestamp: u64, simulation_time: u64, event: &ManualEvent) {
        if self.path.is_none() {
            return;
        }
        let record = ManualEventRecord {
            timestamp,
            simulation_time,
            event,
        };
        match serde_json::to_string(&record) {
            Ok(line) => self.append_line(&line),
            Err(err) => log::warn!("failed to serialize manual-event record: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::per_road;
    use crate::predictor::{CongestionLevel, QueueTrend};

    #[test]
    fn disabled_log_is_a_no_op() {
        let log = MetricsLog::new(None::<&Path>);
        log.record_manual_event(0, 0, &ManualEvent::ManualCancel);
        // No assertion beyond "does not panic" — there is no path to write to.
    }

    #[test]
    fn enabled_log_appends_one_line_per_call() {
        let path = std::env::temp_dir().join(format!("signal_controller_metrics_test_{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let log = MetricsLog::new(Some(&path));
        let metrics = per_road(|_| RoadMetrics {
            waiting_count: 0,
            avg_wait_time: 0.0,
            cleared_last_interval: 0,
            arrival_rate_vpm: 0.0,
            departure_rate_vpm: 0.0,
            time_since_last_green: 0,
            congestion_percent: 0.0,
            eta_clear_seconds: 0.0,
        });
        let predictions = per_road(|_| Prediction {
            queue_trend: QueueTrend::Stable,
            arrivals_10s: 0.0,
            arrivals_30s: 0.0,
            heavy_prob: 0.0,
            congestion_level: CongestionLevel::Low,
            predicted_eta_clear: 0.0,
        });
        log.record_decision_cycle(1, 1, &metrics, Road::North, &predictions);
        log.record_manual_event(2, 2, &ManualEvent::ManualCancel);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let _ = std::fs::remove_file(&path);
    }
}
