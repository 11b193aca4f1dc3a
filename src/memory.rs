//! Append-only `(state, action, reward)` journal with similarity-and-decay
//! recall, used to bias the controller's normal-decision-boundary choice
//! toward roads that paid off in similar past situations.

use crate::domain::{per_road, PerRoad, Road};
use crate::metrics::RoadMetrics;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Width of the decay window, in simulated seconds (roughly 15 minutes).
const DECAY_HALFLIFE_SECS: f64 = 900.0;
/// `k` used by the per-tick similarity recall.
const RECALL_K: usize = 5;
/// `k` used by the legacy nearest-neighbor fallback.
const LEGACY_K: usize = 10;

/// The six-dimensional fingerprint `stateVector(road, metrics)` from §4.4.
pub type StateVector = [f64; 6];

pub fn state_vector(metrics: &RoadMetrics) -> StateVector {
    [
        metrics.waiting_count as f64,
        metrics.avg_wait_time,
        metrics.congestion_percent,
        metrics.time_since_last_green as f64,
        metrics.arrival_rate_vpm,
        metrics.departure_rate_vpm,
    ]
}

pub fn fingerprint(road_metrics: &PerRoad<RoadMetrics>) -> PerRoad<StateVector> {
    per_road(|r| state_vector(&road_metrics[&r]))
}

/// One persisted `(state, action, reward)` experience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    #[serde(rename = "time")]
    pub sim_time: u64,
    pub state_queues: PerRoad<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_vector: Option<PerRoad<StateVector>>,
    pub action_road: Road,
    pub action_duration: u64,
    pub reward: f64,
    pub reason: String,
}

fn cosine_similarity(a: &StateVector, b: &StateVector) -> f64 {
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        // Two all-zero states (e.g. both roads idle) are identical, not unrelated.
        if a == b {
            1.0
        } else {
            0.0
        }
    } else {
        (dot / (norm_a * norm_b)).max(0.0)
    }
}

fn degraded_similarity(current: i64, past: i64) -> f64 {
    1.0 / (1.0 + (current - past).unsigned_abs() as f64)
}

/// Mean per-road similarity between the current fingerprint and one record,
/// using cosine similarity when the record carries a full `state_vector`
/// and falling back to the degraded queue-distance metric otherwise.
fn record_similarity(record: &MemoryRecord, current: &PerRoad<StateVector>, current_queues: &PerRoad<i64>) -> f64 {
    let sum: f64 = Road::ALL
        .iter()
        .map(|&road| match &record.state_vector {
            Some(vectors) => cosine_similarity(&vectors[&road], &current[&road]),
            None => degraded_similarity(current_queues[&road], record.state_queues[&road]),
        })
        .sum();
    sum / Road::ALL.len() as f64
}

fn decay(current_time: u64, record_time: u64) -> f64 {
    let age = current_time.saturating_sub(record_time) as f64;
    (-age / DECAY_HALFLIFE_SECS).exp()
}

/// Weighted-reward aggregate for one candidate road, over the top-`k`
/// similarity-ranked records whose action was that road.
#[derive(Debug, Clone, Copy)]
pub struct RoadRecall {
    pub weighted_reward: f64,
    pub match_count: usize,
    /// Highest `simScore * decay` seen among the contributing records —
    /// the value the controller's confidence gate is evaluated against.
    pub max_confidence: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RecallResult {
    pub per_road: HashMap<Road, RoadRecall>,
}

impl RecallResult {
    /// The road with the highest weighted reward among roads that cleared
    /// `threshold` on `max_confidence` — "any road must have at least one
    /// match whose simScore*decay >= threshold" (REDESIGN FLAGS #2).
    pub fn confident_best(&self, threshold: f64) -> Option<(Road, f64)> {
        self.per_road
            .iter()
            .filter(|(_, recall)| recall.max_confidence >= threshold)
            .map(|(&road, recall)| (road, recall.weighted_reward))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// Append-only `(state, action, reward)` log, file-backed with an
/// in-memory fallback if the file cannot be read or written.
pub struct MemoryStore {
    path: PathBuf,
    records: Vec<MemoryRecord>,
    max_records: usize,
    degraded: bool,
}

impl MemoryStore {
    /// Loads the journal at `path`, or starts empty if it doesn't exist yet.
    /// A corrupt or unreadable journal degrades to an empty in-memory store
    /// rather than failing startup — the controller must still run without
    /// recall (§7, Memory store I/O failure).
    pub fn load(path: impl AsRef<Path>, max_records: usize) -> Self {
        let path = path.as_ref().to_path_buf();
        let (records, degraded) = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Vec<MemoryRecord>>(&contents) {
                Ok(records) => (records, false),
                Err(err) => {
                    log::error!("memory journal at {:?} is corrupt, starting empty: {err}", path);
                    (Vec::new(), true)
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (Vec::new(), false),
            Err(err) => {
                log::error!("could not read memory journal at {:?}: {err}", path);
                (Vec::new(), true)
            }
        };
        Self {
            path,
            records,
            max_records,
            degraded,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Appends `record` and rewrites the journal file. On write failure the
    /// store degrades to in-memory-only and logs; the record is never lost
    /// from the in-memory sequence.
    pub fn add(&mut self, record: MemoryRecord) {
        self.records.push(record);
        if self.records.len() > self.max_records {
            let overflow = self.records.len() - self.max_records;
            self.records.drain(0..overflow);
        }
        if let Err(err) = self.flush() {
            log::error!("failed to persist memory journal to {:?}: {err}", self.path);
            self.degraded = true;
        }
    }

    fn flush(&self) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(&self.records)
            .expect("MemoryRecord serialization cannot fail");
        fs::write(&self.path, json)
    }

    /// Similarity-and-decay retrieval: ranks all records by `simScore * decay`
    /// and aggregates weighted reward per `actionRoad` over the top `k`.
    pub fn recall(&self, current_metrics: &PerRoad<RoadMetrics>, current_time: u64) -> RecallResult {
        if self.records.is_empty() {
            return RecallResult::default();
        }
        let current_vectors = fingerprint(current_metrics);
        let current_queues: PerRoad<i64> =
            per_road(|r| current_metrics[&r].waiting_count as i64);

        let mut scored: Vec<(f64, &MemoryRecord)> = self
            .records
            .iter()
            .map(|record| {
                let sim = record_similarity(record, &current_vectors, &current_queues);
                let d = decay(current_time, record.sim_time);
                (sim * d, record)
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(RECALL_K);

        let mut per_road: HashMap<Road, (f64, f64, usize, f64)> = HashMap::new();
        for (score, record) in &scored {
            let entry = per_road.entry(record.action_road).or_insert((0.0, 0.0, 0, 0.0));
            entry.0 += record.reward * score; // numerator
            entry.1 += score; // denominator
            entry.2 += 1; // match count
            entry.3 = entry.3.max(*score); // max confidence
        }

        let per_road = per_road
            .into_iter()
            .map(|(road, (num, denom, count, max_conf))| {
                let weighted_reward = num / denom.max(f64::EPSILON);
                (
                    road,
                    RoadRecall {
                        weighted_reward,
                        match_count: count,
                        max_confidence: max_conf,
                    },
                )
            })
            .collect();

        RecallResult { per_road }
    }

    /// Legacy nearest-neighbor fallback: Euclidean distance over the four
    /// raw queue values, `k=10`, highest average reward wins. Used only by
    /// offline tooling (the memory-summary endpoint), never the tick's
    /// per-second decision path.
    pub fn legacy_nearest_neighbor_action(&self, current_queues: &PerRoad<i64>) -> Option<(Road, u64)> {
        if self.records.is_empty() {
            return None;
        }
        let mut by_distance: Vec<(f64, &MemoryRecord)> = self
            .records
            .iter()
            .map(|record| {
                let dist_sq: i64 = Road::ALL
                    .iter()
                    .map(|&r| {
                        let d = current_queues[&r] - record.state_queues[&r];
                        d * d
                    })
                    .sum();
                ((dist_sq as f64).sqrt(), record)
            })
            .collect();
        by_distance.sort_by(|a, b| a.0.total_cmp(&b.0));
        by_distance.truncate(LEGACY_K);

        let mut totals: HashMap<Road, (f64, usize)> = HashMap::new();
        for (_, record) in &by_distance {
            let entry = totals.entry(record.action_road).or_insert((0.0, 0));
            entry.0 += record.reward;
            entry.1 += 1;
        }
        let (&best_road, _) = totals
            .iter()
            .max_by(|a, b| (a.1 .0 / a.1 .1 as f64).total_cmp(&(b.1 .0 / b.1 .1 as f64)))?;
        let q = current_queues[&best_road] as f64;
        let duration = (10.0 + q * 0.7).clamp(10.0, 45.0) as u64;
        Some((best_road, duration))
    }
}

/// Aggregate view served by `GET /memory/summary`: average reward per road
/// over the whole journal and the road with the best average.
#[derive(Debug, Clone, Serialize)]
pub struct MemorySummary {
    pub records: usize,
    pub avg_reward_by_road: PerRoad<f64>,
    pub best_road: Option<Road>,
}

impl MemoryStore {
    pub fn summary(&self) -> MemorySummary {
        let mut totals: HashMap<Road, (f64, usize)> = HashMap::new();
        for record in &self.records {
            let entry = totals.entry(record.action_road).or_insert((0.0, 0));
            entry.0 += record.reward;
            entry.1 += 1;
        }
        let avg_reward_by_road = per_road(|r| {
            totals.get(&r).map(|&(sum, count)| sum / count as f64).unwrap_or(0.0)
        });
        let best_road = totals
            .iter()
            .max_by(|a, b| (a.1 .0 / a.1 .1 as f64).total_cmp(&(b.1 .0 / b.1 .1 as f64)))
            .map(|(&road, _)| road);
        MemorySummary {
            records: self.records.len(),
            avg_reward_by_road,
            best_road,
        }
    }
}
