//! Process bootstrap: loads config, connects the simulator adapter, and wires
//! the tick actor (metrics + predictor + memory + controller) to the
//! axum HTTP/WebSocket surface over an mpsc command channel and a broadcast
//! status channel (§4.9, §5).

use clap::Parser;
use signal_controller::adapter::{self, mock::MockSimulatorLink, EmergencyState, PhaseCommand, PhaseMapping, SimulatorLink};
use signal_controller::config::Config;
use signal_controller::controller::{
    needs_all_red_transition, ControlMode, Controller, DecisionInfo, DecisionMethod, ManualCommand, ManualRequest,
    TickInputs,
};
use signal_controller::domain::{per_road, PerRoad, Road};
use signal_controller::http::{self, AppState, StatusSnapshot, SurfaceCommand};
use signal_controller::logging::{self, ManualEvent, MetricsLog};
use signal_controller::memory::MemoryStore;
use signal_controller::metrics::{MetricsAccumulator, RoadMetrics, TickObservation};
use signal_controller::predictor::{CongestionLevel, Predictor, Prediction, QueueTrend};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, Duration};

#[derive(Parser, Debug)]
#[command(name = "signal_controller", about = "Adaptive traffic-signal controller for a single four-way intersection")]
struct Cli {
    /// Path to the TOML config file. Overrides SIGNAL_CONTROLLER_CONFIG and the default config.toml.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Run a fixed number of ticks against the bundled mock simulator link, print a summary, and exit.
    /// Skips the HTTP surface entirely — useful for smoke-testing a config without a real simulator.
    #[arg(long)]
    dry_run: Option<u64>,
}

fn default_prediction() -> Prediction {
    Prediction {
        queue_trend: QueueTrend::Stable,
        arrivals_10s: 0.0,
        arrivals_30s: 0.0,
        heavy_prob: 0.0,
        congestion_level: CongestionLevel::Low,
        predicted_eta_clear: 0.0,
    }
}

fn wallclock_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Tracks what the adapter has actually been told, one tick behind the
/// controller's own `current_green` when a cross-group transition is under
/// way, so the all-red tick required by §4.5 is never skipped.
enum PhaseOutput {
    Settled(Road),
    AwaitingGreen(Road),
}

/// The tick actor: owns the adapter and every core component, runs the §4
/// pipeline once per second, and reports status/memory summaries for the
/// HTTP surface to read.
struct TickActor {
    link: MockSimulatorLink,
    mapping: PhaseMapping,
    memory: MemoryStore,
    metrics_log: MetricsLog,
    metrics_acc: MetricsAccumulator,
    predictor: Predictor,
    controller: Controller,
    phase_output: PhaseOutput,
    t: u64,
    running: bool,
}

impl TickActor {
    fn new(link: MockSimulatorLink, mapping: PhaseMapping, memory: MemoryStore, metrics_log: MetricsLog) -> Self {
        let initial_green = Road::South;
        Self {
            link,
            mapping,
            memory,
            metrics_log,
            metrics_acc: MetricsAccumulator::new(),
            predictor: Predictor::new(),
            controller: Controller::new(initial_green),
            phase_output: PhaseOutput::Settled(initial_green),
            t: 0,
            running: true,
        }
    }

    fn read_counts_and_metrics(&mut self) -> (PerRoad<signal_controller::domain::RoadCounts>, PerRoad<RoadMetrics>) {
        let counts = per_road(|r| adapter::read_counts(&self.link, r));
        let metrics = per_road(|r| {
            let ids: HashSet<String> = self.link.vehicle_ids_on(r).into_iter().collect();
            let speed_of = |id: &str| self.link.vehicle_speed(id);
            let observation = TickObservation {
                vehicles_on_edge: &ids,
                speed_of: &speed_of,
            };
            self.metrics_acc.update(r, self.t, &observation)
        });
        (counts, metrics)
    }

    /// Applies the controller's decided green to the simulator, inserting the
    /// mandatory `ALL_RED` tick whenever the decision crosses movement groups.
    fn apply_phase_output(&mut self) {
        let manual_all_red = self.controller.state.mode == ControlMode::Manual
            && self.controller.state.manual_cmd == Some(ManualCommand::AllRed)
            && self.controller.state.is_manual_active(Instant::now());

        if manual_all_red {
            adapter::apply_phase(&mut self.link, &self.mapping, PhaseCommand::AllRed, 1);
            return;
        }

        let desired = self.controller.state.current_green;
        let duration = self.controller.state.remaining_green.max(1) as u64;

        match self.phase_output {
            PhaseOutput::Settled(applied) if !needs_all_red_transition(applied, desired) => {
                adapter::apply_phase(&mut self.link, &self.mapping, PhaseCommand::Group(desired.group()), duration);
                if applied != desired {
                    self.metrics_acc.mark_green(desired, self.t);
                }
                self.phase_output = PhaseOutput::Settled(desired);
            }
            PhaseOutput::Settled(_) => {
                adapter::apply_phase(&mut self.link, &self.mapping, PhaseCommand::AllRed, 1);
                self.phase_output = PhaseOutput::AwaitingGreen(desired);
            }
            PhaseOutput::AwaitingGreen(target) => {
                adapter::apply_phase(&mut self.link, &self.mapping, PhaseCommand::Group(target.group()), duration);
                self.metrics_acc.mark_green(target, self.t);
                self.phase_output = PhaseOutput::Settled(target);
            }
        }
    }

    /// Runs one full tick of the §2 data flow and returns the resulting status.
    fn tick(&mut self) -> Option<StatusSnapshot> {
        if let Err(err) = self.link.step() {
            log::error!("simulator connection lost: {err}");
            self.running = false;
            return None;
        }
        self.t += 1;

        let emergency: EmergencyState = adapter::detect_emergency(&self.link);
        let (counts, metrics) = self.read_counts_and_metrics();
        let predictions: PerRoad<Prediction> = per_road(|r| self.predictor.update(r, &metrics[&r]));

        let was_manual_active = self.controller.state.mode == ControlMode::Manual
            && self.controller.state.is_manual_active(Instant::now());

        let inputs = TickInputs {
            t: self.t,
            counts: &counts,
            metrics: &metrics,
            predictions: &predictions,
            emergency,
            now: Instant::now(),
        };
        let (decision, closed_record) = self.controller.decide(&inputs, &self.memory);

        if was_manual_active && self.controller.state.mode == ControlMode::Auto {
            self.metrics_log.record_manual_event(wallclock_secs(), self.t, &ManualEvent::ManualExpire);
        }
        if decision.method == DecisionMethod::Emergency {
            self.metrics_log.record_manual_event(
                wallclock_secs(),
                self.t,
                &ManualEvent::EmergencyInterrupt { road: self.controller.state.current_green },
            );
        }

        if let Some(record) = closed_record {
            self.memory.add(record);
        }

        self.apply_phase_output();
        self.metrics_log
            .record_decision_cycle(wallclock_secs(), self.t, &metrics, self.controller.state.current_green, &predictions);

        Some(StatusSnapshot {
            current_green: self.controller.state.current_green,
            remaining_green: self.controller.state.remaining_green,
            mode: self.controller.state.mode,
            manual_cmd: self.controller.state.manual_cmd,
            remaining_manual: self.controller.state.remaining_manual_secs(Instant::now()),
            last_decision: decision,
            metrics,
            predictions,
            sim_time: self.t,
        })
    }
}

fn initial_snapshot() -> StatusSnapshot {
    StatusSnapshot {
        current_green: Road::South,
        remaining_green: 0,
        mode: ControlMode::Auto,
        manual_cmd: None,
        remaining_manual: None,
        last_decision: DecisionInfo { method: DecisionMethod::Hold, reason: "startup".to_string() },
        metrics: per_road(|_| RoadMetrics::default()),
        predictions: per_road(|_| default_prediction()),
        sim_time: 0,
    }
}

/// Runs a fixed number of ticks against the mock simulator link with no HTTP
/// surface, for local smoke-testing of a config file. Prints a one-line
/// summary per tick to stdout.
fn run_dry(mut actor: TickActor, ticks: u64) {
    for _ in 0..ticks {
        if !actor.running {
            break;
        }
        if let Some(status) = actor.tick() {
            println!(
                "t={:>4} green={:<5} remaining={:>3} method={:?} reason={}",
                status.sim_time, status.current_green, status.remaining_green, status.last_decision.method, status.last_decision.reason
            );
        }
    }
}

async fn run_tick_loop(
    mut actor: TickActor,
    status: Arc<RwLock<StatusSnapshot>>,
    status_tx: broadcast::Sender<StatusSnapshot>,
    memory_summary: Arc<RwLock<signal_controller::memory::MemorySummary>>,
    mut command_rx: mpsc::Receiver<SurfaceCommand>,
) {
    let mut ticker = interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;

        while let Ok(command) = command_rx.try_recv() {
            match command {
                SurfaceCommand::Manual(request) => {
                    let event = match &request {
                        ManualRequest::Apply { command, duration_secs } => ManualEvent::ManualApply {
                            command: *command,
                            duration: *duration_secs,
                        },
                        ManualRequest::Cancel => ManualEvent::ManualCancel,
                    };
                    actor.controller.apply_manual_request(request, Instant::now());
                    actor.metrics_log.record_manual_event(wallclock_secs(), actor.t, &event);
                    actor.metrics_log.record_manual_event(
                        wallclock_secs(),
                        actor.t,
                        &ManualEvent::ModeChange { mode: actor.controller.state.mode },
                    );
                }
                SurfaceCommand::Start => actor.running = true,
                SurfaceCommand::Stop => actor.running = false,
            }
        }

        if !actor.running {
            continue;
        }

        let Some(snapshot) = actor.tick() else {
            break;
        };
        *memory_summary.write().await = actor.memory.summary();
        *status.write().await = snapshot.clone();
        let _ = status_tx.send(snapshot);
    }

    actor.link.disconnect();
    log::info!("tick loop stopped, adapter disconnected");
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };
    logging::init(&config.logging.level);

    let mut link = MockSimulatorLink::new();
    if let Err(err) = link.connect() {
        log::error!("could not connect to simulator: {err}");
        std::process::exit(1);
    }
    let mapping = adapter::infer_phase_mapping(&link.traffic_light_phases());
    if !mapping.inferred {
        log::warn!("phase inference failed at startup, falling back to NS=0, EW=2");
    }

    let memory = MemoryStore::load(&config.memory.path, config.memory.max_records);
    if memory.is_degraded() {
        log::error!("memory journal at {:?} failed to load cleanly, starting degraded", config.memory.path);
    }
    let metrics_log = MetricsLog::new(config.logging.metrics_log_path.as_ref());

    let actor = TickActor::new(link, mapping, memory, metrics_log);

    if let Some(ticks) = cli.dry_run {
        run_dry(actor, ticks);
        return;
    }

    let (command_tx, command_rx) = mpsc::channel(32);
    let (status_tx, _status_rx) = broadcast::channel(64);
    let status = Arc::new(RwLock::new(initial_snapshot()));
    let memory_summary = Arc::new(RwLock::new(actor.memory.summary()));

    let app_state = Arc::new(AppState {
        command_tx,
        status: status.clone(),
        status_broadcast: status_tx.clone(),
        memory_summary: memory_summary.clone(),
    });

    let router = http::router(app_state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let bind_addr: std::net::SocketAddr = config.http_bind.parse().expect("validated at config load");
    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("could not bind http surface to {bind_addr}: {err}");
            std::process::exit(1);
        }
    };
    log::info!("http surface listening on {bind_addr}");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            log::error!("http server exited: {err}");
        }
    });

    run_tick_loop(actor, status, status_tx, memory_summary, command_rx).await;
    server.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_actor() -> TickActor {
        let mut link = MockSimulatorLink::new();
        link.connect().unwrap();
        let mapping = adapter::infer_phase_mapping(&link.traffic_light_phases());
        let dir = std::env::temp_dir().join(format!("main_test_mem_{}", std::process::id()));
        let _ = std::fs::remove_file(&dir);
        let memory = MemoryStore::load(&dir, 100);
        TickActor::new(link, mapping, memory, MetricsLog::new(None::<&std::path::Path>))
    }

    /// §4.5: a cross-group green change must write `ALL_RED` to the adapter
    /// for exactly one tick before the new group's green is ever applied.
    #[test]
    fn cross_group_transition_passes_through_all_red() {
        let mut actor = test_actor();
        actor.controller.state.current_green = Road::South;
        actor.phase_output = PhaseOutput::Settled(Road::South);
        actor.apply_phase_output();
        assert!(matches!(actor.phase_output, PhaseOutput::Settled(Road::South)));

        actor.controller.state.current_green = Road::East;
        actor.controller.state.remaining_green = 15;
        actor.apply_phase_output();
        assert!(matches!(actor.phase_output, PhaseOutput::AwaitingGreen(Road::East)));
        assert_eq!(actor.link.actual_state().tls_string, adapter::ALL_RED_STATE);

        actor.apply_phase_output();
        assert!(matches!(actor.phase_output, PhaseOutput::Settled(Road::East)));
        assert_eq!(actor.link.actual_state().green_group, Some(Road::East.group()));
    }

    /// Same-group changes (e.g. north -> south) never need the all-red tick.
    #[test]
    fn same_group_transition_applies_directly() {
        let mut actor = test_actor();
        actor.controller.state.current_green = Road::North;
        actor.phase_output = PhaseOutput::Settled(Road::North);
        actor.apply_phase_output();

        actor.controller.state.current_green = Road::South;
        actor.controller.state.remaining_green = 10;
        actor.apply_phase_output();
        assert!(matches!(actor.phase_output, PhaseOutput::Settled(Road::South)));
        assert_eq!(actor.link.actual_state().green_group, Some(Road::South.group()));
    }
}
