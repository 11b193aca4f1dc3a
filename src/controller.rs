//! The layered-priority decision engine: emergency preemption, manual
//! override, starvation protection, memory-based recall, composite-score
//! fallback, gap-out, hold. Invoked exactly once per tick.

use crate::adapter::EmergencyState;
use crate::domain::{per_road, MovementGroup, PerRoad, Road, VehicleClass};
use crate::memory::{MemoryRecord, MemoryStore, RecallResult};
use crate::metrics::RoadMetrics;
use crate::predictor::Prediction;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Re-decide at least this often, in simulated seconds.
pub const DECISION_CYCLE: u64 = 5;
/// A road idle this long (seconds) must be served next.
pub const MAX_RED_TIME: u64 = 90;
/// Consecutive empty ticks on the current green before gap-out fires.
const GAP_OUT_STREAK: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManualCommand {
    NsGreen,
    EwGreen,
    AllRed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlMode {
    Auto,
    Manual,
}

/// Why the controller made the decision it made this tick, tagged so it
/// serializes cleanly across the HTTP/WebSocket boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum DecisionMethod {
    Emergency,
    Manual,
    Starvation,
    Memory,
    Fallback,
    GapOut,
    Hold,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionInfo {
    pub method: DecisionMethod,
    pub reason: String,
}

/// A command from the HTTP surface into the tick actor, carried over the
/// single-producer `mpsc` channel described in the process bootstrap.
#[derive(Debug, Clone, Copy)]
pub enum ManualRequest {
    Apply { command: ManualCommand, duration_secs: u64 },
    Cancel,
}

/// Full controller state, carried across ticks within one simulation session.
pub struct ControllerState {
    pub current_green: Road,
    pub remaining_green: i64,
    pub mode: ControlMode,
    pub manual_cmd: Option<ManualCommand>,
    manual_until: Option<Instant>,
    manual_alternate_ns: bool,
    last_action_road: Road,
    last_action_duration: u64,
    pre_action_queues: PerRoad<f64>,
    pre_action_metrics: PerRoad<RoadMetrics>,
    pub last_green_time: PerRoad<u64>,
    no_wait_counter: PerRoad<u32>,
    since_last_decision: u64,
}

impl ControllerState {
    pub fn new(initial_green: Road) -> Self {
        Self {
            current_green: initial_green,
            remaining_green: 0,
            mode: ControlMode::Auto,
            manual_cmd: None,
            manual_until: None,
            manual_alternate_ns: true,
            last_action_road: initial_green,
            last_action_duration: 0,
            pre_action_queues: per_road(|_| 0.0),
            pre_action_metrics: per_road(|_| RoadMetrics::default()),
            last_green_time: per_road(|_| 0),
            no_wait_counter: per_road(|_| 0),
            since_last_decision: 0,
        }
    }

    pub fn set_manual(&mut self, command: ManualCommand, duration_secs: u64, now: Instant) {
        self.mode = ControlMode::Manual;
        self.manual_cmd = Some(command);
        self.manual_until = Some(now + std::time::Duration::from_secs(duration_secs));
    }

    pub fn cancel_manual(&mut self) {
        self.mode = ControlMode::Auto;
        self.manual_cmd = None;
        self.manual_until = None;
    }

    pub fn is_manual_active(&self, now: Instant) -> bool {
        self.mode == ControlMode::Manual && self.manual_until.map_or(false, |until| now < until)
    }

    pub fn remaining_manual_secs(&self, now: Instant) -> Option<u64> {
        self.manual_until
            .map(|until| until.saturating_duration_since(now).as_secs())
    }
}

fn weighted_queue(counts: &crate::domain::RoadCounts) -> f64 {
    VehicleClass::ALL.iter().map(|&c| c.weight() * counts.count(c) as f64).sum()
}

fn composite_score(
    road: Road,
    current_green: Road,
    metrics: &RoadMetrics,
    prediction: &Prediction,
) -> f64 {
    let switch_penalty = if road == current_green { 1.2 } else { 0.0 };
    1.0 * metrics.waiting_count as f64
        + 0.8 * metrics.avg_wait_time
        + 0.6 * metrics.time_since_last_green as f64
        + 0.4 * metrics.congestion_percent
        + 0.3 * prediction.bias(0.3)
        - switch_penalty
}

fn dynamic_duration(metrics: &RoadMetrics) -> u64 {
    (10.0 + 1.0 * metrics.waiting_count as f64 + 0.5 * metrics.avg_wait_time).clamp(10.0, 60.0) as u64
}

fn starvation_candidate(last_green_time: &PerRoad<u64>, current_green: Road, t: u64) -> Option<Road> {
    Road::ALL
        .iter()
        .copied()
        .filter(|&r| r != current_green)
        .filter(|&r| t.saturating_sub(last_green_time[&r]) > MAX_RED_TIME)
        .max_by_key(|&r| t.saturating_sub(last_green_time[&r]))
}

fn reward_for(before: &PerRoad<f64>, after: &PerRoad<f64>, acted: Road) -> f64 {
    let acted_gain = before[&acted] - after[&acted];
    let others: Vec<Road> = Road::ALL.iter().copied().filter(|&r| r != acted).collect();
    let others_mean: f64 = others.iter().map(|&r| after[&r] - before[&r]).sum::<f64>() / others.len() as f64;
    acted_gain - 0.5 * others_mean
}

/// All per-tick inputs the controller needs, already derived by the earlier
/// pipeline stages.
pub struct TickInputs<'a> {
    pub t: u64,
    pub counts: &'a PerRoad<crate::domain::RoadCounts>,
    pub metrics: &'a PerRoad<RoadMetrics>,
    pub predictions: &'a PerRoad<Prediction>,
    pub emergency: EmergencyState,
    pub now: Instant,
}

/// The decision engine itself: pure state plus a `decide` entry point. Memory
/// reads/writes are threaded through explicitly rather than owned, so the
/// controller can be exercised in tests without a file-backed store.
pub struct Controller {
    pub state: ControllerState,
}

impl Controller {
    pub fn new(initial_green: Road) -> Self {
        Self {
            state: ControllerState::new(initial_green),
        }
    }

    /// Applies an HTTP-surface manual request. Called from the tick actor
    /// after draining the `mpsc` command channel, never directly from a
    /// request handler.
    pub fn apply_manual_request(&mut self, request: ManualRequest, now: Instant) {
        match request {
            ManualRequest::Apply { command, duration_secs } => {
                self.state.set_manual(command, duration_secs, now);
            }
            ManualRequest::Cancel => self.state.cancel_manual(),
        }
    }

    /// Runs the full priority stack for one tick and returns the resulting
    /// decision plus any `MemoryRecord` closed this tick (to be persisted by
    /// the caller via `MemoryStore::add`).
    pub fn decide(&mut self, inputs: &TickInputs<'_>, memory: &MemoryStore) -> (DecisionInfo, Option<MemoryRecord>) {
        let s = &mut self.state;
        let mut closed_record = None;

        // 1. Pre-tick bookkeeping.
        s.remaining_green = (s.remaining_green - 1).max(0);
        s.since_last_decision += 1;

        let weighted: PerRoad<f64> = per_road(|r| weighted_queue(&inputs.counts[&r]));

        // 2. Emergency preemption.
        if inputs.emergency.active {
            let road = inputs.emergency.road.expect("active emergency carries a road");
            if road != s.current_green && (s.remaining_green <= 4 || s.since_last_decision >= DECISION_CYCLE) {
                s.cancel_manual();
                closed_record = Some(close_action(s, &weighted, inputs.t, "emergency_interrupt"));
                s.current_green = road;
                s.remaining_green = 5i64.max(10);
                s.since_last_decision = 0;
                s.last_green_time.insert(road, inputs.t);
                s.last_action_road = road;
                s.pre_action_queues = weighted.clone();
                s.pre_action_metrics = inputs.metrics.clone();
                return (
                    DecisionInfo {
                        method: DecisionMethod::Emergency,
                        reason: format!("emergency vehicle on {road}"),
                    },
                    closed_record,
                );
            }
        }

        // 3. Manual override.
        if s.mode == ControlMode::Manual {
            if !s.is_manual_active(inputs.now) {
                s.cancel_manual();
            } else {
                let command = s.manual_cmd.expect("manual mode always carries a command");
                let reason = match command {
                    ManualCommand::AllRed => "manual all-red".to_string(),
                    ManualCommand::NsGreen | ManualCommand::EwGreen => {
                        if s.since_last_decision >= DECISION_CYCLE || s.remaining_green <= 0 {
                            let group = if command == ManualCommand::NsGreen { MovementGroup::Ns } else { MovementGroup::Ew };
                            let roads = group.roads();
                            let next = if s.manual_alternate_ns { roads[0] } else { roads[1] };
                            s.manual_alternate_ns = !s.manual_alternate_ns;
                            s.current_green = next;
                            let manual_remaining = s.remaining_manual_secs(inputs.now).unwrap_or(30);
                            s.remaining_green = 30u64.min(manual_remaining).max(1) as i64;
                            s.since_last_decision = 0;
                            s.last_green_time.insert(next, inputs.t);
                        }
                        format!("manual {:?} on {}", command, s.current_green)
                    }
                };
                return (
                    DecisionInfo {
                        method: DecisionMethod::Manual,
                        reason,
                    },
                    closed_record,
                );
            }
        }

        // 4. Normal decision boundary.
        if s.remaining_green <= 0 || s.since_last_decision >= DECISION_CYCLE {
            closed_record = Some(close_action(s, &weighted, inputs.t, "phase_end"));

            let (chosen, method, reason) = if let Some(road) = starvation_candidate(&s.last_green_time, s.current_green, inputs.t) {
                (road, DecisionMethod::Starvation, format!("{road} starved past {MAX_RED_TIME}s"))
            } else {
                let recall: RecallResult = memory.recall(inputs.metrics, inputs.t);
                if let Some((road, reward)) = recall.confident_best(0.7) {
                    (road, DecisionMethod::Memory, format!("recalled reward {reward:.2} for {road}"))
                } else {
                    let best = Road::ALL
                        .iter()
                        .copied()
                        .map(|r| (r, composite_score(r, s.current_green, &inputs.metrics[&r], &inputs.predictions[&r])))
                        .max_by(|a, b| a.1.total_cmp(&b.1))
                        .expect("four roads always present");
                    (best.0, DecisionMethod::Fallback, format!("composite score {:.2} for {}", best.1, best.0))
                }
            };

            s.current_green = chosen;
            s.remaining_green = dynamic_duration(&inputs.metrics[&chosen]) as i64;
            s.since_last_decision = 0;
            s.last_green_time.insert(chosen, inputs.t);
            s.last_action_road = chosen;
            s.last_action_duration = s.remaining_green as u64;
            s.pre_action_queues = weighted;
            s.pre_action_metrics = inputs.metrics.clone();

            return (DecisionInfo { method, reason }, closed_record);
        }

        // 5. Gap-out mid-phase.
        let current_waiting = inputs.metrics[&s.current_green].waiting_count;
        if current_waiting == 0 {
            *s.no_wait_counter.entry(s.current_green).or_insert(0) += 1;
        } else {
            s.no_wait_counter.insert(s.current_green, 0);
        }
        if s.no_wait_counter[&s.current_green] >= GAP_OUT_STREAK && s.mode == ControlMode::Auto {
            s.remaining_green = 0;
            return (
                DecisionInfo {
                    method: DecisionMethod::GapOut,
                    reason: format!("{} empty for {GAP_OUT_STREAK} ticks", s.current_green),
                },
                closed_record,
            );
        }

        // 6. Hold.
        (
            DecisionInfo {
                method: DecisionMethod::Hold,
                reason: format!("holding {}", s.current_green),
            },
            closed_record,
        )
    }
}

fn close_action(s: &ControllerState, after: &PerRoad<f64>, t: u64, reason: &str) -> MemoryRecord {
    let reward = reward_for(&s.pre_action_queues, after, s.last_action_road);
    let state_queues = per_road(|r| s.pre_action_queues[&r] as i64);
    MemoryRecord {
        sim_time: t,
        state_queues,
        state_vector: Some(crate::memory::fingerprint(&s.pre_action_metrics)),
        action_road: s.last_action_road,
        action_duration: s.last_action_duration,
        reward,
        reason: reason.to_string(),
    }
}

/// Decides whether a green change between `from` and `to` needs an
/// intervening `ALL_RED` tick: true exactly when they belong to different
/// movement groups (§4.5 safe transition).
pub fn needs_all_red_transition(from: Road, to: Road) -> bool {
    from.group() != to.group()
}
