//! Closed enumerations and small value types shared by every core module.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One of the four approaches to the intersection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Road {
    North,
    East,
    South,
    West,
}

impl Road {
    pub const ALL: [Road; 4] = [Road::North, Road::East, Road::South, Road::West];

    /// The approach served by the opposite direction of the same movement group.
    pub fn opposite(self) -> Road {
        match self {
            Road::North => Road::South,
            Road::South => Road::North,
            Road::East => Road::West,
            Road::West => Road::East,
        }
    }

    pub fn group(self) -> MovementGroup {
        match self {
            Road::North | Road::South => MovementGroup::Ns,
            Road::East | Road::West => MovementGroup::Ew,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Road::North => "north",
            Road::East => "east",
            Road::South => "south",
            Road::West => "west",
        }
    }
}

impl std::fmt::Display for Road {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The two non-conflicting pairs of approaches a single green phase can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementGroup {
    Ns,
    Ew,
}

impl MovementGroup {
    pub fn roads(self) -> [Road; 2] {
        match self {
            MovementGroup::Ns => [Road::North, Road::South],
            MovementGroup::Ew => [Road::East, Road::West],
        }
    }

    pub fn contains(self, road: Road) -> bool {
        self.roads().contains(&road)
    }
}

/// A vehicle category as used internally by the controller's weighted-queue scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Car,
    Bike,
    Bus,
    Truck,
    Lorry,
    Auto,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 6] = [
        VehicleClass::Car,
        VehicleClass::Bike,
        VehicleClass::Bus,
        VehicleClass::Truck,
        VehicleClass::Lorry,
        VehicleClass::Auto,
    ];

    /// Weight used by the controller's weighted-queue pressure scalar.
    pub fn weight(self) -> f64 {
        match self {
            VehicleClass::Bike => 1.0,
            VehicleClass::Car | VehicleClass::Auto => 2.0,
            VehicleClass::Bus | VehicleClass::Truck | VehicleClass::Lorry => 4.0,
        }
    }

    /// Maps the simulator's external class name onto an internal class.
    /// Unknown names default to `Car`, per the simulator's vehicle-class map.
    pub fn from_external(name: &str) -> VehicleClass {
        match name {
            "passenger" => VehicleClass::Car,
            "bicycle" => VehicleClass::Bike,
            "bus" => VehicleClass::Bus,
            "truck" => VehicleClass::Truck,
            "trailer" => VehicleClass::Lorry,
            "taxi" => VehicleClass::Auto,
            _ => VehicleClass::Car,
        }
    }
}

/// Per-class vehicle counts observed on one approach during a tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoadCounts {
    counts: HashMap<VehicleClass, u32>,
}

impl RoadCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, class: VehicleClass) {
        *self.counts.entry(class).or_insert(0) += 1;
    }

    pub fn count(&self, class: VehicleClass) -> u32 {
        *self.counts.get(&class).unwrap_or(&0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    /// Class-weighted sum of vehicle counts, a single scalar representing
    /// pressure on the approach these counts were taken from.
    pub fn weighted_queue(&self) -> f64 {
        VehicleClass::ALL
            .iter()
            .map(|&class| class.weight() * self.count(class) as f64)
            .sum()
    }
}

/// `north`/`south`/`east`/`west`-keyed map, the shape most per-road data in
/// this crate is carried in.
pub type PerRoad<T> = HashMap<Road, T>;

/// Build a `PerRoad` map by evaluating `f` for each of the four roads.
pub fn per_road<T>(mut f: impl FnMut(Road) -> T) -> PerRoad<T> {
    Road::ALL.iter().map(|&r| (r, f(r))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposite_is_an_involution() {
        for &road in &Road::ALL {
            assert_eq!(road.opposite().opposite(), road);
            assert_ne!(road.opposite(), road);
        }
    }

    #[test]
    fn groups_partition_the_four_roads() {
        assert_eq!(Road::North.group(), MovementGroup::Ns);
        assert_eq!(Road::South.group(), MovementGroup::Ns);
        assert_eq!(Road::East.group(), MovementGroup::Ew);
        assert_eq!(Road::West.group(), MovementGroup::Ew);
    }

    #[test]
    fn unknown_external_class_defaults_to_car() {
        assert_eq!(VehicleClass::from_external("motorbike"), VehicleClass::Car);
        assert_eq!(VehicleClass::from_external("trailer"), VehicleClass::Lorry);
    }

    #[test]
    fn weighted_queue_sums_class_weights() {
        let mut counts = RoadCounts::new();
        counts.increment(VehicleClass::Car);
        counts.increment(VehicleClass::Car);
        counts.increment(VehicleClass::Bus);
        // 2 cars * 2.0 + 1 bus * 4.0 = 8.0
        assert_eq!(counts.weighted_queue(), 8.0);
    }
}
