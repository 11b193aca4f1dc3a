//! Short-horizon predictor: a 30-sample queue history per road feeding a
//! trend classifier, an arrival forecast, and a heavy-traffic probability.

use crate::domain::{per_road, PerRoad, Road};
use crate::metrics::RoadMetrics;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const HISTORY_LEN: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueTrend {
    Increasing,
    Stable,
    Decreasing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CongestionLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Prediction {
    pub queue_trend: QueueTrend,
    pub arrivals_10s: f64,
    pub arrivals_30s: f64,
    pub heavy_prob: f64,
    pub congestion_level: CongestionLevel,
    pub predicted_eta_clear: f64,
}

impl Prediction {
    /// `predictionBias(road, weight=0.3)` from the composite scoring formula.
    pub fn bias(&self, weight: f64) -> f64 {
        weight * self.heavy_prob
    }
}

fn clamp(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

/// Ring buffer of recent waiting-count samples for one road.
#[derive(Debug, Default)]
struct History {
    samples: VecDeque<u32>,
}

impl History {
    fn push(&mut self, waiting_count: u32) {
        if self.samples.len() == HISTORY_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(waiting_count);
    }

    /// `(slope, trend)`, per §4.3: fewer than two samples is always `stable`.
    fn slope_and_trend(&self) -> (f64, QueueTrend) {
        if self.samples.len() < 2 {
            return (0.0, QueueTrend::Stable);
        }
        let first = *self.samples.front().unwrap() as f64;
        let last = *self.samples.back().unwrap() as f64;
        let slope = (last - first) / (self.samples.len() - 1) as f64;
        let trend = if slope > 0.5 {
            QueueTrend::Increasing
        } else if slope < -0.5 {
            QueueTrend::Decreasing
        } else {
            QueueTrend::Stable
        };
        (slope, trend)
    }
}

/// Maintains the 30-sample history for all four roads and derives a
/// `Prediction` from each tick's `RoadMetrics`.
pub struct Predictor {
    history: PerRoad<History>,
}

impl Predictor {
    pub fn new() -> Self {
        Self {
            history: per_road(|_| History::default()),
        }
    }

    pub fn update(&mut self, road: Road, metrics: &RoadMetrics) -> Prediction {
        let history = self.history.get_mut(&road).expect("all four roads present");
        history.push(metrics.waiting_count);
        let (slope, queue_trend) = history.slope_and_trend();

        let arrivals_10s = metrics.arrival_rate_vpm / 60.0 * 10.0;
        let arrivals_30s = metrics.arrival_rate_vpm / 60.0 * 30.0;

        let trend_norm = clamp((slope + 5.0) / 10.0 * 100.0, 0.0, 100.0);
        let flow_norm = clamp(
            ((metrics.arrival_rate_vpm - metrics.departure_rate_vpm) + 30.0) / 60.0 * 100.0,
            0.0,
            100.0,
        );
        let heavy_prob = clamp(
            0.5 * metrics.congestion_percent + 0.3 * trend_norm + 0.2 * flow_norm,
            0.0,
            100.0,
        );

        let congestion_level = if heavy_prob < 30.0 {
            CongestionLevel::Low
        } else if heavy_prob < 60.0 {
            CongestionLevel::Medium
        } else {
            CongestionLevel::High
        };

        let predicted_eta_clear = if slope > 0.5 {
            (metrics.eta_clear_seconds * (1.0 + heavy_prob / 100.0)).min(300.0)
        } else {
            metrics.eta_clear_seconds.min(300.0)
        };

        Prediction {
            queue_trend,
            arrivals_10s,
            arrivals_30s,
            heavy_prob,
            congestion_level,
            predicted_eta_clear,
        }
    }
}

impl Default for Predictor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics_with_waiting(waiting_count: u32) -> RoadMetrics {
        RoadMetrics {
            waiting_count,
            avg_wait_time: 0.0,
            cleared_last_interval: 0,
            arrival_rate_vpm: 0.0,
            departure_rate_vpm: 6.0,
            time_since_last_green: 0,
            congestion_percent: (waiting_count as f64 / 40.0 * 100.0).min(100.0),
            eta_clear_seconds: waiting_count as f64 / 0.1,
        }
    }

    #[test]
    fn fewer_than_two_samples_is_stable() {
        let mut p = Predictor::new();
        let pred = p.update(Road::North, &metrics_with_waiting(5));
        assert_eq!(pred.queue_trend, QueueTrend::Stable);
    }

    #[test]
    fn strictly_increasing_queue_eventually_trends_increasing() {
        let mut p = Predictor::new();
        let mut last = QueueTrend::Stable;
        for i in 0..35u32 {
            let pred = p.update(Road::East, &metrics_with_waiting(i));
            last = pred.queue_trend;
        }
        assert_eq!(last, QueueTrend::Increasing);
    }

    #[test]
    fn heavy_prob_and_eta_stay_in_bounds() {
        let mut p = Predictor::new();
        for i in 0..40u32 {
            let pred = p.update(Road::South, &metrics_with_waiting(i % 40));
            assert!(pred.heavy_prob >= 0.0 && pred.heavy_prob <= 100.0);
            assert!(pred.predicted_eta_clear <= 300.0);
        }
    }
}
