// src/types.rs

use serde::{Deserialize, Serialize};

// ============================================================================
// Approaches and signal groups
// ============================================================================

/// One of the four incoming directions at the intersection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Approach {
    North,
    East,
    South,
    West,
}

impl Approach {
    /// Fixed iteration order used everywhere metrics are assembled.
    pub const ALL: [Approach; 4] = [
        Approach::North,
        Approach::East,
        Approach::South,
        Approach::West,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Approach::North => "north",
            Approach::East => "east",
            Approach::South => "south",
            Approach::West => "west",
        }
    }

    /// Single-letter form used in snapshots.
    pub fn letter(&self) -> &'static str {
        match self {
            Approach::North => "N",
            Approach::East => "E",
            Approach::South => "S",
            Approach::West => "W",
        }
    }

    pub fn group(&self) -> PhaseGroup {
        match self {
            Approach::North | Approach::South => PhaseGroup::NorthSouth,
            Approach::East | Approach::West => PhaseGroup::EastWest,
        }
    }

    pub fn opposite(&self) -> Approach {
        match self {
            Approach::North => Approach::South,
            Approach::South => Approach::North,
            Approach::East => Approach::West,
            Approach::West => Approach::East,
        }
    }
}

impl std::fmt::Display for Approach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Opposing approach pairs. Transitions between groups require an all-red
/// clearance second; transitions within a group are direct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseGroup {
    NorthSouth,
    EastWest,
}

/// Fixed four-slot container keyed by `Approach`. Serialises as a four-key
/// object, one key per approach name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApproachMap<T> {
    pub north: T,
    pub east: T,
    pub south: T,
    pub west: T,
}

impl<T> ApproachMap<T> {
    pub fn from_fn(mut f: impl FnMut(Approach) -> T) -> Self {
        Self {
            north: f(Approach::North),
            east: f(Approach::East),
            south: f(Approach::South),
            west: f(Approach::West),
        }
    }

    pub fn get(&self, approach: Approach) -> &T {
        match approach {
            Approach::North => &self.north,
            Approach::East => &self.east,
            Approach::South => &self.south,
            Approach::West => &self.west,
        }
    }

    pub fn get_mut(&mut self, approach: Approach) -> &mut T {
        match approach {
            Approach::North => &mut self.north,
            Approach::East => &mut self.east,
            Approach::South => &mut self.south,
            Approach::West => &mut self.west,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Approach, &T)> {
        Approach::ALL.iter().map(move |&a| (a, self.get(a)))
    }
}

// ============================================================================
// Vehicles
// ============================================================================

/// Opaque stable identifier scoped to the lifetime of a vehicle in the
/// simulation. Never persisted beyond the vehicle's presence on an approach.
pub type VehicleId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Car,
    Bike,
    Bus,
    Truck,
    Lorry,
    Auto,
    Emergency,
}

impl VehicleClass {
    /// Map a raw simulator type tag to a class. The emergency rule is exact:
    /// only the tag `"emergency"` produces `Emergency`. Unknown tags fall
    /// back to `Car`.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "emergency" => VehicleClass::Emergency,
            "passenger" | "car" => VehicleClass::Car,
            "bicycle" | "bike" => VehicleClass::Bike,
            "bus" => VehicleClass::Bus,
            "truck" => VehicleClass::Truck,
            "trailer" | "lorry" => VehicleClass::Lorry,
            "taxi" | "auto" => VehicleClass::Auto,
            _ => VehicleClass::Car,
        }
    }

    /// Weight applied when aggregating per-class counts into a queue length.
    pub fn queue_weight(&self) -> u32 {
        match self {
            VehicleClass::Bike => 1,
            VehicleClass::Car | VehicleClass::Auto => 2,
            VehicleClass::Bus | VehicleClass::Truck | VehicleClass::Lorry => 4,
            VehicleClass::Emergency => 4,
        }
    }
}

/// Per-approach vehicle tally by class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleCounts {
    pub car: u32,
    pub bike: u32,
    pub bus: u32,
    pub truck: u32,
    pub lorry: u32,
    pub auto: u32,
    #[serde(default)]
    pub emergency: u32,
}

impl VehicleCounts {
    pub fn add(&mut self, class: VehicleClass) {
        match class {
            VehicleClass::Car => self.car += 1,
            VehicleClass::Bike => self.bike += 1,
            VehicleClass::Bus => self.bus += 1,
            VehicleClass::Truck => self.truck += 1,
            VehicleClass::Lorry => self.lorry += 1,
            VehicleClass::Auto => self.auto += 1,
            VehicleClass::Emergency => self.emergency += 1,
        }
    }

    /// Weighted queue length: heavier vehicle classes count for more.
    pub fn weighted_queue(&self) -> u32 {
        self.bike * VehicleClass::Bike.queue_weight()
            + self.car * VehicleClass::Car.queue_weight()
            + self.auto * VehicleClass::Auto.queue_weight()
            + self.bus * VehicleClass::Bus.queue_weight()
            + self.truck * VehicleClass::Truck.queue_weight()
            + self.lorry * VehicleClass::Lorry.queue_weight()
            + self.emergency * VehicleClass::Emergency.queue_weight()
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Derived per-approach metrics, immutable within a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RoadMetrics {
    pub waiting_count: u32,
    pub avg_wait_time: f64,
    pub cleared_last_interval: u32,
    pub arrival_rate_vpm: f64,
    pub departure_rate_vpm: f64,
    pub time_since_last_green: f64,
    pub congestion_percent: f64,
    pub eta_clear_seconds: f64,
}

pub type MetricsSet = ApproachMap<RoadMetrics>;

// ============================================================================
// Predictions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueTrend {
    Increasing,
    Stable,
    Decreasing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CongestionLevel {
    Low,
    Medium,
    High,
}

impl CongestionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CongestionLevel::Low => "LOW",
            CongestionLevel::Medium => "MEDIUM",
            CongestionLevel::High => "HIGH",
        }
    }
}

/// Short-horizon forecast for one approach.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub queue_trend: QueueTrend,
    pub arrivals_10s: f64,
    pub arrivals_30s: f64,
    pub heavy_traffic_probability: f64,
    pub congestion_level: CongestionLevel,
    pub predicted_eta_clear_seconds: f64,
}

impl Default for Prediction {
    fn default() -> Self {
        Self {
            queue_trend: QueueTrend::Stable,
            arrivals_10s: 0.0,
            arrivals_30s: 0.0,
            heavy_traffic_probability: 0.0,
            congestion_level: CongestionLevel::Low,
            predicted_eta_clear_seconds: 0.0,
        }
    }
}

pub type PredictionSet = ApproachMap<Prediction>;

// ============================================================================
// Signal state machine
// ============================================================================

/// Signal head state. Exactly one approach may hold green at any time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SignalState {
    Green { approach: Approach, remaining: u32 },
    AllRed { remaining: u32 },
    Transitioning { from: Approach, to: Approach },
}

impl SignalState {
    pub fn green_approach(&self) -> Option<Approach> {
        match self {
            SignalState::Green { approach, .. } => Some(*approach),
            _ => None,
        }
    }

    pub fn remaining(&self) -> u32 {
        match self {
            SignalState::Green { remaining, .. } | SignalState::AllRed { remaining } => *remaining,
            SignalState::Transitioning { .. } => 0,
        }
    }
}

// ============================================================================
// Operating mode and overrides
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Auto,
    Manual,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "AUTO",
            Mode::Manual => "MANUAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManualCommand {
    NsGreen,
    EwGreen,
    AllRed,
}

impl ManualCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManualCommand::NsGreen => "NS_GREEN",
            ManualCommand::EwGreen => "EW_GREEN",
            ManualCommand::AllRed => "ALL_RED",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualInfo {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<ManualCommand>,
    pub remaining_seconds: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EmergencyInfo {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approach: Option<Approach>,
}

// ============================================================================
// Decisions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMethod {
    Emergency,
    Manual,
    Starvation,
    Memory,
    Fallback,
    GapOut,
    Hold,
    Idle,
}

impl DecisionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionMethod::Emergency => "emergency",
            DecisionMethod::Manual => "manual",
            DecisionMethod::Starvation => "starvation",
            DecisionMethod::Memory => "memory",
            DecisionMethod::Fallback => "fallback",
            DecisionMethod::GapOut => "gap_out",
            DecisionMethod::Hold => "hold",
            DecisionMethod::Idle => "idle",
        }
    }
}

/// Tagged explanation produced by every controller tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionInfo {
    pub method: DecisionMethod,
    pub reason: String,
}

impl DecisionInfo {
    pub fn new(method: DecisionMethod, reason: impl Into<String>) -> Self {
        Self {
            method,
            reason: reason.into(),
        }
    }

    pub fn idle() -> Self {
        Self::new(DecisionMethod::Idle, "simulation not started")
    }
}
