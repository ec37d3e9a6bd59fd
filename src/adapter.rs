// src/adapter.rs
//
// Narrow boundary to the external microscopic simulator. Every operation is
// fail-safe: a backend fault is logged at debug level and mapped to an
// empty/default value, so a single bad tick never kills the control loop.

use crate::types::{
    Approach, ApproachMap, EmergencyInfo, VehicleClass, VehicleCounts, VehicleId,
};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Raw transport to a running simulator. Implemented by the built-in
/// synthetic backend and by bridges to external simulators.
pub trait SimulatorBackend: Send {
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self);
    /// Advance the simulation by one second.
    fn step(&mut self) -> Result<()>;
    fn vehicles_on_edge(&mut self, approach: Approach) -> Result<Vec<VehicleId>>;
    /// Speed in m/s.
    fn vehicle_speed(&mut self, id: &str) -> Result<f64>;
    /// Raw vehicle type tag as the simulator reports it.
    fn vehicle_type(&mut self, id: &str) -> Result<String>;
    fn set_green(&mut self, approach: Approach, duration_secs: u32) -> Result<()>;
    fn set_all_red(&mut self, duration_secs: u32) -> Result<()>;
}

/// Fail-safe wrapper around a `SimulatorBackend`.
///
/// Caches observations per simulated second so each vehicle list / speed /
/// type is fetched from the backend at most once per step. Owns the
/// simulation clock: `current_time` advances only on a successful step.
pub struct SimulatorAdapter {
    backend: Box<dyn SimulatorBackend>,
    time: u64,
    edge_cache: ApproachMap<Option<HashSet<VehicleId>>>,
    speed_cache: HashMap<VehicleId, Option<f64>>,
    class_cache: HashMap<VehicleId, VehicleClass>,
    // Green held back by a cross-group all-red clearance; flushed on the
    // next successful step.
    pending_green: Option<(Approach, u32)>,
}

impl SimulatorAdapter {
    pub fn new(backend: Box<dyn SimulatorBackend>) -> Self {
        Self {
            backend,
            time: 0,
            edge_cache: ApproachMap::default(),
            speed_cache: HashMap::new(),
            class_cache: HashMap::new(),
            pending_green: None,
        }
    }

    /// Connect the backend. Unlike the per-tick operations this propagates
    /// the error: a failed `start` must surface to the caller.
    pub fn connect(&mut self) -> Result<()> {
        self.backend.connect()
    }

    pub fn disconnect(&mut self) {
        self.backend.disconnect();
    }

    /// Advance the simulator by one second. On success the clock ticks, the
    /// observation caches are invalidated, and any clearance-delayed green
    /// is issued.
    pub fn step(&mut self) {
        match self.backend.step() {
            Ok(()) => {
                self.time += 1;
                self.invalidate_observations();
                if let Some((approach, duration)) = self.pending_green.take() {
                    self.set_green(approach, duration);
                }
            }
            Err(e) => {
                debug!("simulator step failed: {e}");
            }
        }
    }

    /// Monotone non-decreasing simulated seconds.
    pub fn current_time(&self) -> u64 {
        self.time
    }

    /// Vehicle identifiers currently on the approach's incoming edge.
    /// Empty set on backend failure.
    pub fn list_vehicles_on_edge(&mut self, approach: Approach) -> HashSet<VehicleId> {
        if let Some(cached) = self.edge_cache.get(approach) {
            return cached.clone();
        }
        let vehicles = match self.backend.vehicles_on_edge(approach) {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                debug!("vehicle listing failed on {approach}: {e}");
                HashSet::new()
            }
        };
        *self.edge_cache.get_mut(approach) = Some(vehicles.clone());
        vehicles
    }

    /// Speed in m/s, or `None` when the backend cannot report it.
    pub fn vehicle_speed(&mut self, id: &str) -> Option<f64> {
        if let Some(cached) = self.speed_cache.get(id) {
            return *cached;
        }
        let speed = match self.backend.vehicle_speed(id) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!("speed query failed for {id}: {e}");
                None
            }
        };
        self.speed_cache.insert(id.to_string(), speed);
        speed
    }

    /// Vehicle class, defaulting to `Car` when the backend cannot report it.
    pub fn vehicle_class(&mut self, id: &str) -> VehicleClass {
        if let Some(cached) = self.class_cache.get(id) {
            return *cached;
        }
        let class = match self.backend.vehicle_type(id) {
            Ok(tag) => VehicleClass::from_tag(&tag),
            Err(e) => {
                debug!("type query failed for {id}: {e}");
                VehicleClass::Car
            }
        };
        self.class_cache.insert(id.to_string(), class);
        class
    }

    pub fn set_green(&mut self, approach: Approach, duration_secs: u32) {
        if let Err(e) = self.backend.set_green(approach, duration_secs) {
            debug!("set_green({approach}, {duration_secs}s) failed: {e}");
        }
    }

    pub fn set_all_red(&mut self, duration_secs: u32) {
        if let Err(e) = self.backend.set_all_red(duration_secs) {
            debug!("set_all_red({duration_secs}s) failed: {e}");
        }
    }

    /// Switch the green from one approach to another. Crossing between the
    /// NS and EW groups inserts a 1-second all-red clearance; the new green
    /// is issued on the next step. Same-group switches are direct.
    pub fn apply_safe_transition(
        &mut self,
        from: Option<Approach>,
        to: Approach,
        duration_secs: u32,
    ) {
        match from {
            Some(prev) if prev.group() != to.group() => {
                info!("clearance: all-red 1s before {to} green");
                self.set_all_red(1);
                self.pending_green = Some((to, duration_secs));
            }
            _ => self.set_green(to, duration_secs),
        }
    }

    /// First approach (N,E,S,W order) carrying an emergency-class vehicle.
    pub fn detect_emergency(&mut self) -> EmergencyInfo {
        for approach in Approach::ALL {
            let vehicles = self.list_vehicles_on_edge(approach);
            for id in &vehicles {
                if self.vehicle_class(id) == VehicleClass::Emergency {
                    return EmergencyInfo {
                        active: true,
                        approach: Some(approach),
                    };
                }
            }
        }
        EmergencyInfo::default()
    }

    /// Per-class tallies for every approach.
    pub fn counts(&mut self) -> ApproachMap<VehicleCounts> {
        ApproachMap::from_fn(|approach| {
            let vehicles = self.list_vehicles_on_edge(approach);
            let mut counts = VehicleCounts::default();
            for id in &vehicles {
                counts.add(self.vehicle_class(id));
            }
            counts
        })
    }

    /// Clear all internal caches and the clock. Called on (re)start.
    pub fn reset(&mut self) {
        self.time = 0;
        self.pending_green = None;
        self.invalidate_observations();
        self.class_cache.clear();
    }

    fn invalidate_observations(&mut self) {
        self.edge_cache = ApproachMap::default();
        self.speed_cache.clear();
    }
}

// ============================================================================
// Test backend
// ============================================================================


#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;

    fn adapter_with_world() -> (SimulatorAdapter, std::sync::Arc<std::sync::Mutex<MockWorld>>) {
        let (backend, world) = MockBackend::new();
        (SimulatorAdapter::new(Box::new(backend)), world)
    }

    #[test]
    fn test_clock_advances_only_on_successful_step() {
        let (mut adapter, world) = adapter_with_world();
        adapter.step();
        adapter.step();
        assert_eq!(adapter.current_time(), 2);

        world.lock().unwrap().fail_comms = true;
        adapter.step();
        assert_eq!(adapter.current_time(), 2);
    }

    #[test]
    fn test_failed_observation_returns_empty_defaults() {
        let (mut adapter, world) = adapter_with_world();
        world.lock().unwrap().place(Approach::North, "v1", 0.0, "car");
        world.lock().unwrap().fail_comms = true;

        assert!(adapter.list_vehicles_on_edge(Approach::North).is_empty());
        assert_eq!(adapter.vehicle_speed("v1"), None);
        assert_eq!(adapter.vehicle_class("v1"), VehicleClass::Car);
    }

    #[test]
    fn test_cross_group_transition_inserts_clearance() {
        let (mut adapter, world) = adapter_with_world();
        adapter.apply_safe_transition(Some(Approach::North), Approach::East, 20);
        {
            let w = world.lock().unwrap();
            assert_eq!(w.commands, vec![BackendCommand::AllRed(1)]);
        }
        // Green flushes on the next step
        adapter.step();
        let w = world.lock().unwrap();
        assert_eq!(w.last_green(), Some((Approach::East, 20)));
    }

    #[test]
    fn test_same_group_transition_is_direct() {
        let (mut adapter, world) = adapter_with_world();
        adapter.apply_safe_transition(Some(Approach::North), Approach::South, 15);
        let w = world.lock().unwrap();
        assert_eq!(w.commands, vec![BackendCommand::Green(Approach::South, 15)]);
    }

    #[test]
    fn test_first_green_from_all_red_is_direct() {
        let (mut adapter, world) = adapter_with_world();
        adapter.apply_safe_transition(None, Approach::West, 10);
        let w = world.lock().unwrap();
        assert_eq!(w.commands, vec![BackendCommand::Green(Approach::West, 10)]);
    }

    #[test]
    fn test_emergency_detection_by_class() {
        let (mut adapter, world) = adapter_with_world();
        {
            let mut w = world.lock().unwrap();
            w.place(Approach::North, "car1", 5.0, "passenger");
            w.place(Approach::South, "amb1", 8.0, "emergency");
        }
        let info = adapter.detect_emergency();
        assert!(info.active);
        assert_eq!(info.approach, Some(Approach::South));
    }

    #[test]
    fn test_counts_by_class() {
        let (mut adapter, world) = adapter_with_world();
        {
            let mut w = world.lock().unwrap();
            w.place(Approach::East, "c1", 3.0, "passenger");
            w.place(Approach::East, "c2", 3.0, "car");
            w.place(Approach::East, "b1", 3.0, "bicycle");
            w.place(Approach::East, "t1", 3.0, "trailer");
        }
        let counts = adapter.counts();
        let east = counts.get(Approach::East);
        assert_eq!(east.car, 2);
        assert_eq!(east.bike, 1);
        assert_eq!(east.lorry, 1);
    }

    #[test]
    fn test_observation_cache_refreshes_after_step() {
        let (mut adapter, world) = adapter_with_world();
        world.lock().unwrap().place(Approach::North, "v1", 1.0, "car");
        assert_eq!(adapter.list_vehicles_on_edge(Approach::North).len(), 1);

        // Mutating the world mid-tick is invisible until the next step
        world.lock().unwrap().place(Approach::North, "v2", 1.0, "car");
        assert_eq!(adapter.list_vehicles_on_edge(Approach::North).len(), 1);

        adapter.step();
        assert_eq!(adapter.list_vehicles_on_edge(Approach::North).len(), 2);
    }
}
