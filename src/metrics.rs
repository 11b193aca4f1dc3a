//! Per-tick metrics accumulator: waiting time, sliding arrival/departure
//! windows, and the derived `RoadMetrics` the predictor and controller read.

use crate::domain::{per_road, PerRoad, Road};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// Vehicles below this speed (m/s) count as waiting.
pub const WAITING_SPEED_MPS: f64 = 2.0;
/// Queue length used to normalize `congestionPercent`.
pub const MAX_QUEUE: f64 = 40.0;
/// Width of the arrival/departure rate window, in simulated seconds.
const RATE_WINDOW_SECS: u64 = 60;

/// Derived, per-road snapshot recomputed every tick from raw accumulator state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoadMetrics {
    pub waiting_count: u32,
    pub avg_wait_time: f64,
    pub cleared_last_interval: u32,
    pub arrival_rate_vpm: f64,
    pub departure_rate_vpm: f64,
    pub time_since_last_green: u64,
    pub congestion_percent: f64,
    pub eta_clear_seconds: f64,
}

impl Default for RoadMetrics {
    /// The all-zero reading a road has before its first `update` call.
    fn default() -> Self {
        Self {
            waiting_count: 0,
            avg_wait_time: 0.0,
            cleared_last_interval: 0,
            arrival_rate_vpm: 0.0,
            departure_rate_vpm: 0.0,
            time_since_last_green: 0,
            congestion_percent: 0.0,
            eta_clear_seconds: 0.0,
        }
    }
}

/// One approach's raw accumulator state.
#[derive(Debug, Default)]
struct RoadAccumulator {
    /// Accumulated seconds below `WAITING_SPEED_MPS`, keyed by vehicle id.
    /// Entries persist across ticks so a vehicle that sped up but hasn't left
    /// the approach yet keeps its history; only departure clears an entry.
    /// `waiting_count` itself is a fresh per-tick scan, not this map's length.
    waiting_time: std::collections::HashMap<String, u64>,
    current_on_edge: HashSet<String>,
    arrival_timestamps: VecDeque<u64>,
    departure_timestamps: VecDeque<u64>,
    last_green_time: u64,
    cleared_last_interval: u32,
}

impl RoadAccumulator {
    /// Drop window entries older than `(t - RATE_WINDOW_SECS, t]` so the
    /// deques never grow past the window they describe.
    fn trim_windows(&mut self, t: u64) {
        let floor = t.saturating_sub(RATE_WINDOW_SECS);
        while matches!(self.arrival_timestamps.front(), Some(&ts) if ts <= floor) {
            self.arrival_timestamps.pop_front();
        }
        while matches!(self.departure_timestamps.front(), Some(&ts) if ts <= floor) {
            self.departure_timestamps.pop_front();
        }
    }

    fn rate_vpm(timestamps: &VecDeque<u64>, t: u64) -> f64 {
        let window_start = t.saturating_sub(RATE_WINDOW_SECS);
        let count = timestamps.iter().filter(|&&ts| ts > window_start && ts <= t).count();
        let minutes = ((t - window_start) as f64 / 60.0).max(1.0 / 60.0).max(1.0);
        count as f64 / minutes
    }
}

/// Per-road vehicle state the simulator adapter reports each tick: which
/// vehicle ids are currently on the approach and how fast each is moving.
pub struct TickObservation<'a> {
    pub vehicles_on_edge: &'a HashSet<String>,
    pub speed_of: &'a dyn Fn(&str) -> Option<f64>,
}

/// Maintains waiting time and arrival/departure history for all four roads.
pub struct MetricsAccumulator {
    roads: PerRoad<RoadAccumulator>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self {
            roads: per_road(|_| RoadAccumulator::default()),
        }
    }

    /// Runs one tick of the accumulation algorithm for `road` and returns its
    /// freshly derived `RoadMetrics`. Must be called once per road per tick.
    pub fn update(&mut self, road: Road, t: u64, observation: &TickObservation<'_>) -> RoadMetrics {
        let acc = self.roads.get_mut(&road).expect("all four roads present");

        let now: HashSet<String> = observation.vehicles_on_edge.clone();
        let departed: Vec<String> = acc.current_on_edge.difference(&now).cloned().collect();
        let arrived: Vec<String> = now.difference(&acc.current_on_edge).cloned().collect();

        acc.cleared_last_interval = departed.len() as u32;
        for _ in &departed {
            acc.departure_timestamps.push_back(t);
        }
        for _ in &arrived {
            acc.arrival_timestamps.push_back(t);
        }

        let mut currently_waiting: Vec<String> = Vec::new();
        for vehicle_id in &now {
            let speed = (observation.speed_of)(vehicle_id).unwrap_or(f64::MAX);
            if speed < WAITING_SPEED_MPS {
                *acc.waiting_time.entry(vehicle_id.clone()).or_insert(0) += 1;
                currently_waiting.push(vehicle_id.clone());
            }
        }
        for vehicle_id in &departed {
            acc.waiting_time.remove(vehicle_id);
        }

        acc.current_on_edge = now;
        acc.trim_windows(t);

        let waiting_count = currently_waiting.len() as u32;
        let avg_wait_time = if waiting_count == 0 {
            0.0
        } else {
            let total: u64 = currently_waiting
                .iter()
                .filter_map(|id| acc.waiting_time.get(id))
                .sum();
            total as f64 / waiting_count as f64
        };
        let arrival_rate_vpm = RoadAccumulator::rate_vpm(&acc.arrival_timestamps, t);
        let departure_rate_vpm = RoadAccumulator::rate_vpm(&acc.departure_timestamps, t);
        let time_since_last_green = t.saturating_sub(acc.last_green_time);
        let congestion_percent = (waiting_count as f64 / MAX_QUEUE * 100.0).min(100.0);
        let eta_clear_seconds = waiting_count as f64 / (departure_rate_vpm / 60.0).max(0.1);

        RoadMetrics {
            waiting_count,
            avg_wait_time,
            cleared_last_interval: acc.cleared_last_interval,
            arrival_rate_vpm,
            departure_rate_vpm,
            time_since_last_green,
            congestion_percent,
            eta_clear_seconds,
        }
    }

    /// Records that `road` was just given green at simulated time `t`; resets
    /// the starvation clock the next `update` will read.
    pub fn mark_green(&mut self, road: Road, t: u64) {
        self.roads.get_mut(&road).expect("all four roads present").last_green_time = t;
    }
}

impl Default for MetricsAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
