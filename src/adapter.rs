//! The simulator adapter: the only part of this crate that talks to the
//! external microscopic traffic simulator. Specified here behind the
//! `SimulatorLink` trait per the simulator's opaque remote-control protocol
//! (§6); a production build plugs a real client in behind the same trait.

use crate::domain::{MovementGroup, Road, RoadCounts, VehicleClass};
use std::collections::HashMap;

/// The traffic-light identifier used for every call into the simulator.
pub const TLS_ID: &str = "center";
/// The all-red signal string written by `ALL_RED` phase application.
pub const ALL_RED_STATE: &str = "rrrrrrrrrrrr";

fn edge_id(road: Road) -> &'static str {
    match road {
        Road::North => "north_in",
        Road::East => "east_in",
        Road::South => "south_in",
        Road::West => "west_in",
    }
}

/// A green signal for one controlled link, as reported by the simulator's
/// traffic-light program (`trafficLightProgramPhases`/`trafficLightControlledLinks`).
#[derive(Debug, Clone, Copy)]
pub struct ControlledLink {
    pub approach: Road,
    pub is_green: bool,
}

/// One phase of the simulator's native traffic-light program.
#[derive(Debug, Clone)]
pub struct SimPhase {
    pub index: usize,
    pub links: Vec<ControlledLink>,
}

/// The group this crate just asked the adapter to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseCommand {
    Group(MovementGroup),
    AllRed,
}

/// The live signal state read back from the simulator.
#[derive(Debug, Clone)]
pub struct ActualState {
    pub phase_index: usize,
    pub tls_string: String,
    pub green_group: Option<MovementGroup>,
    pub green_roads: Vec<Road>,
}

/// Emergency-vehicle scan result: `active` plus the first approach (scanned
/// in `{north,east,south,west}` order) carrying one.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmergencyState {
    pub active: bool,
    pub road: Option<Road>,
}

/// The narrow interface the core decision engine consumes. Every method maps
/// onto one or more calls of the simulator's opaque remote-control channel
/// (§6): `step`, `edgeVehicleIds`, `vehicleClass`, `vehicleSpeed`,
/// `trafficLightProgramPhases`, `trafficLightControlledLinks`, `setPhase`,
/// `setPhaseDuration`, `setRYGState`, `simMinExpectedNumber`.
pub trait SimulatorLink {
    fn connect(&mut self) -> Result<(), AdapterError>;
    fn disconnect(&mut self);
    fn step(&mut self) -> Result<(), AdapterError>;
    fn is_running(&self) -> bool;

    fn vehicle_ids_on(&self, road: Road) -> Vec<String>;
    fn vehicle_class(&self, vehicle_id: &str) -> Option<String>;
    fn vehicle_speed(&self, vehicle_id: &str) -> Option<f64>;

    fn traffic_light_phases(&self) -> Vec<SimPhase>;
    fn set_phase(&mut self, phase_index: usize);
    fn set_phase_duration(&mut self, seconds: u64);
    fn set_ryg_state(&mut self, state: &str);
    fn actual_state(&self) -> ActualState;
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("simulator connection is not available")]
    ConnectionLost,
    #[error("transient read failure for {0}")]
    TransientRead(String),
}

/// Counts per vehicle class, aggregated over all four approaches.
pub type CountsByRoad = HashMap<Road, RoadCounts>;

/// Infers which native phase index corresponds to `NS` green and which to
/// `EW` green, by counting green controlled-links whose approach belongs to
/// each group and picking the max. Falls back to `NS=0, EW=2` if the program
/// has no phase with any green link in the group (§4.1 / §7 phase-inference
/// failure).
pub fn infer_phase_mapping(phases: &[SimPhase]) -> PhaseMapping {
    let mut best_ns: Option<(usize, usize)> = None; // (phase_index, green_count)
    let mut best_ew: Option<(usize, usize)> = None;

    for phase in phases {
        let ns_greens = phase
            .links
            .iter()
            .filter(|l| l.is_green && l.approach.group() == MovementGroup::Ns)
            .count();
        let ew_greens = phase
            .links
            .iter()
            .filter(|l| l.is_green && l.approach.group() == MovementGroup::Ew)
            .count();
        if ns_greens > 0 && best_ns.map_or(true, |(_, c)| ns_greens > c) {
            best_ns = Some((phase.index, ns_greens));
        }
        if ew_greens > 0 && best_ew.map_or(true, |(_, c)| ew_greens > c) {
            best_ew = Some((phase.index, ew_greens));
        }
    }

    match (best_ns, best_ew) {
        (Some((ns, _)), Some((ew, _))) => PhaseMapping {
            ns_phase: ns,
            ew_phase: ew,
            inferred: true,
        },
        _ => {
            log::warn!("phase inference failed, falling back to NS=0, EW=2");
            PhaseMapping {
                ns_phase: 0,
                ew_phase: 2,
                inferred: false,
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PhaseMapping {
    pub ns_phase: usize,
    pub ew_phase: usize,
    pub inferred: bool,
}

impl PhaseMapping {
    pub fn phase_for(&self, group: MovementGroup) -> usize {
        match group {
            MovementGroup::Ns => self.ns_phase,
            MovementGroup::Ew => self.ew_phase,
        }
    }
}

/// A vehicle id whose lowercased form contains `emergency` or `ambulance`
/// triggers detection; the first approach scanned in `{north,east,south,west}`
/// order wins.
pub fn detect_emergency(link: &dyn SimulatorLink) -> EmergencyState {
    for &road in &Road::ALL {
        for vehicle_id in link.vehicle_ids_on(road) {
            let lower = vehicle_id.to_lowercase();
            if lower.contains("emergency") || lower.contains("ambulance") {
                return EmergencyState {
                    active: true,
                    road: Some(road),
                };
            }
        }
    }
    EmergencyState::default()
}

/// Reads per-class counts for `road`, skipping any vehicle whose class or
/// speed query transiently fails rather than aborting the tick (§7).
pub fn read_counts(link: &dyn SimulatorLink, road: Road) -> RoadCounts {
    let mut counts = RoadCounts::new();
    for vehicle_id in link.vehicle_ids_on(road) {
        match link.vehicle_class(&vehicle_id) {
            Some(class_name) => counts.increment(VehicleClass::from_external(&class_name)),
            None => {
                log::warn!("transient read failure for vehicle class of {vehicle_id}, skipping");
            }
        }
    }
    counts
}

/// Applies a phase command to the simulator: `ALL_RED` writes the all-red
/// signal string; a movement group sets the inferred native phase and its
/// duration. The caller (the controller) is responsible for safe transition
/// sequencing (§4.5) — this function only ever applies what it's told.
pub fn apply_phase(
    link: &mut dyn SimulatorLink,
    mapping: &PhaseMapping,
    command: PhaseCommand,
    duration_secs: u64,
) {
    match command {
        PhaseCommand::AllRed => link.set_ryg_state(ALL_RED_STATE),
        PhaseCommand::Group(group) => {
            link.set_phase(mapping.phase_for(group));
            link.set_phase_duration(duration_secs);
        }
    }
}

/// An in-memory mock `SimulatorLink` used by tests and the bundled demo
/// harness. Vehicles are injected directly rather than read off a wire.
pub mod mock {
    use super::*;
    use std::collections::HashMap as Map;

    #[derive(Debug, Clone)]
    pub struct MockVehicle {
        pub class: String,
        pub speed: f64,
    }

    pub struct MockSimulatorLink {
        running: bool,
        vehicles: Map<Road, Map<String, MockVehicle>>,
        phase_index: usize,
        ryg_state: String,
        phases: Vec<SimPhase>,
    }

    impl MockSimulatorLink {
        pub fn new() -> Self {
            let phases = vec![
                SimPhase {
                    index: 0,
                    links: vec![
                        ControlledLink { approach: Road::North, is_green: true },
                        ControlledLink { approach: Road::South, is_green: true },
                        ControlledLink { approach: Road::East, is_green: false },
                        ControlledLink { approach: Road::West, is_green: false },
                    ],
                },
                SimPhase {
                    index: 1,
                    links: vec![
                        ControlledLink { approach: Road::North, is_green: false },
                        ControlledLink { approach: Road::South, is_green: false },
                        ControlledLink { approach: Road::East, is_green: false },
                        ControlledLink { approach: Road::West, is_green: false },
                    ],
                },
                SimPhase {
                    index: 2,
                    links: vec![
                        ControlledLink { approach: Road::North, is_green: false },
                        ControlledLink { approach: Road::South, is_green: false },
                        ControlledLink { approach: Road::East, is_green: true },
                        ControlledLink { approach: Road::West, is_green: true },
                    ],
                },
            ];
            Self {
                running: false,
                vehicles: Road::ALL.iter().map(|&r| (r, Map::new())).collect(),
                phase_index: 0,
                ryg_state: String::new(),
                phases,
            }
        }

        pub fn set_vehicle(&mut self, road: Road, id: &str, class: &str, speed: f64) {
            self.vehicles
                .entry(road)
                .or_default()
                .insert(id.to_string(), MockVehicle { class: class.to_string(), speed });
        }

        pub fn remove_vehicle(&mut self, road: Road, id: &str) {
            self.vehicles.entry(road).or_default().remove(id);
        }

        pub fn clear_road(&mut self, road: Road) {
            self.vehicles.entry(road).or_default().clear();
        }
    }

    impl Default for MockSimulatorLink {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SimulatorLink for MockSimulatorLink {
        fn connect(&mut self) -> Result<(), AdapterError> {
            self.running = true;
            Ok(())
        }

        fn disconnect(&mut self) {
            self.running = false;
        }

        fn step(&mut self) -> Result<(), AdapterError> {
            if !self.running {
                return Err(AdapterError::ConnectionLost);
            }
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running
        }

        fn vehicle_ids_on(&self, road: Road) -> Vec<String> {
            self.vehicles.get(&road).map(|m| m.keys().cloned().collect()).unwrap_or_default()
        }

        fn vehicle_class(&self, vehicle_id: &str) -> Option<String> {
            self.vehicles
                .values()
                .find_map(|m| m.get(vehicle_id))
                .map(|v| v.class.clone())
        }

        fn vehicle_speed(&self, vehicle_id: &str) -> Option<f64> {
            self.vehicles
                .values()
                .find_map(|m| m.get(vehicle_id))
                .map(|v| v.speed)
        }

        fn traffic_light_phases(&self) -> Vec<SimPhase> {
            self.phases.clone()
        }

        fn set_phase(&mut self, phase_index: usize) {
            self.phase_index = phase_index;
        }

        fn set_phase_duration(&mut self, _seconds: u64) {}

        fn set_ryg_state(&mut self, state: &str) {
            self.ryg_state = state.to_string();
        }

        fn actual_state(&self) -> ActualState {
            let mapping = infer_phase_mapping(&self.phases);
            let green_group = if self.phase_index == mapping.ns_phase {
                Some(MovementGroup::Ns)
            } else if self.phase_index == mapping.ew_phase {
                Some(MovementGroup::Ew)
            } else {
                None
            };
            let green_roads = green_group.map(|g| g.roads().to_vec()).unwrap_or_default();
            ActualState {
                phase_index: self.phase_index,
                tls_string: self.ryg_state.clone(),
                green_group,
                green_roads,
            }
        }
    }
}
