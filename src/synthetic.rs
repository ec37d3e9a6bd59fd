// src/synthetic.rs
//
// Built-in synthetic simulator backend. Generates per-approach vehicle
// demand from configured rates, stops vehicles on red, discharges them on
// green, and can inject a timed emergency vehicle. Deterministic for a
// fixed seed, which is what the end-to-end tests rely on.

use crate::adapter::SimulatorBackend;
use crate::config::SimulatorConfig;
use crate::types::{Approach, ApproachMap, VehicleId};
use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

/// m/s for free-flowing traffic.
const CRUISE_SPEED: f64 = 10.0;
/// m/s for vehicles held at a red signal.
const HALT_SPEED: f64 = 0.2;
/// Vehicles discharged per green second.
const SATURATION_FLOW: usize = 1;
/// Ticks an emergency vehicle stays on its edge before crossing.
const EMERGENCY_DWELL_TICKS: u64 = 12;

#[derive(Debug, Clone)]
struct SyntheticVehicle {
    id: VehicleId,
    tag: &'static str,
    arrived_at: u64,
}

pub struct SyntheticBackend {
    config: SimulatorConfig,
    rng: StdRng,
    connected: bool,
    time: u64,
    next_id: u64,
    lanes: ApproachMap<Vec<SyntheticVehicle>>,
    green: Option<Approach>,
    green_remaining: u32,
    all_red_remaining: u32,
    emergency_injected: bool,
}

impl SyntheticBackend {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            connected: false,
            time: 0,
            next_id: 0,
            lanes: ApproachMap::default(),
            green: None,
            green_remaining: 0,
            all_red_remaining: 0,
            emergency_injected: false,
        }
    }

    fn spawn_class(&mut self) -> &'static str {
        // Rough urban mix; heavier classes are rarer
        match self.rng.gen_range(0..100u32) {
            0..=54 => "passenger",
            55..=69 => "bicycle",
            70..=79 => "taxi",
            80..=87 => "bus",
            88..=94 => "truck",
            _ => "trailer",
        }
    }

    fn spawn_arrivals(&mut self) {
        for approach in Approach::ALL {
            let per_second = (self.config.demand_vpm.get(approach) / 60.0).clamp(0.0, 1.0);
            if self.rng.gen_bool(per_second) {
                let tag = self.spawn_class();
                let id = format!("veh_{}", self.next_id);
                self.next_id += 1;
                let arrived_at = self.time;
                self.lanes.get_mut(approach).push(SyntheticVehicle {
                    id,
                    tag,
                    arrived_at,
                });
            }
        }

        if let Some(at) = self.config.emergency_at_sec {
            if !self.emergency_injected && self.time >= at {
                self.emergency_injected = true;
                let approach = self.config.emergency_approach;
                let id = format!("emergency_{}", self.next_id);
                let arrived_at = self.time;
                self.next_id += 1;
                self.lanes.get_mut(approach).push(SyntheticVehicle {
                    id,
                    tag: "emergency",
                    arrived_at,
                });
                info!("synthetic emergency injected on {approach}");
            }
        }
    }

    fn discharge(&mut self) {
        // Emergency vehicles cross on their own once they have dwelt
        for approach in Approach::ALL {
            let time = self.time;
            self.lanes.get_mut(approach).retain(|v| {
                !(v.tag == "emergency" && time.saturating_sub(v.arrived_at) >= EMERGENCY_DWELL_TICKS)
            });
        }

        if self.all_red_remaining > 0 {
            return;
        }
        let Some(green) = self.green else {
            return;
        };
        if self.green_remaining == 0 {
            return;
        }
        let lane = self.lanes.get_mut(green);
        let discharged = SATURATION_FLOW.min(lane.len());
        lane.drain(..discharged);
    }

    fn speed_of(&self, approach: Approach, vehicle: &SyntheticVehicle) -> f64 {
        if vehicle.tag == "emergency" {
            return CRUISE_SPEED + 1.0;
        }
        let green_here =
            self.all_red_remaining == 0 && self.green == Some(approach) && self.green_remaining > 0;
        if green_here || self.time == vehicle.arrived_at {
            CRUISE_SPEED
        } else {
            HALT_SPEED
        }
    }

    fn find(&self, id: &str) -> Option<(Approach, &SyntheticVehicle)> {
        for approach in Approach::ALL {
            if let Some(vehicle) = self.lanes.get(approach).iter().find(|v| v.id == id) {
                return Some((approach, vehicle));
            }
        }
        None
    }
}

impl SimulatorBackend for SyntheticBackend {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        info!(
            "synthetic simulator ready (seed={}, endpoint={:?})",
            self.config.seed, self.config.endpoint
        );
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn step(&mut self) -> Result<()> {
        if !self.connected {
            bail!("not connected");
        }
        self.time += 1;
        if self.all_red_remaining > 0 {
            self.all_red_remaining -= 1;
        } else if self.green_remaining > 0 {
            self.green_remaining -= 1;
        }
        self.spawn_arrivals();
        self.discharge();
        Ok(())
    }

    fn vehicles_on_edge(&mut self, approach: Approach) -> Result<Vec<VehicleId>> {
        if !self.connected {
            bail!("not connected");
        }
        Ok(self
            .lanes
            .get(approach)
            .iter()
            .map(|v| v.id.clone())
            .collect())
    }

    fn vehicle_speed(&mut self, id: &str) -> Result<f64> {
        match self.find(id) {
            Some((approach, vehicle)) => Ok(self.speed_of(approach, vehicle)),
            None => bail!("unknown vehicle {id}"),
        }
    }

    fn vehicle_type(&mut self, id: &str) -> Result<String> {
        match self.find(id) {
            Some((_, vehicle)) => Ok(vehicle.tag.to_string()),
            None => bail!("unknown vehicle {id}"),
        }
    }

    fn set_green(&mut self, approach: Approach, duration_secs: u32) -> Result<()> {
        self.green = Some(approach);
        self.green_remaining = duration_secs;
        self.all_red_remaining = 0;
        Ok(())
    }

    fn set_all_red(&mut self, duration_secs: u32) -> Result<()> {
        self.all_red_remaining = duration_secs;
        Ok(())
    }
}
