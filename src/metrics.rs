// src/metrics.rs
//
// Per-approach traffic metrics derived from raw vehicle observations.
// Tracking is updated every simulated second; metric computation is pure
// and side-effect free so it can run at any cadence.

use crate::adapter::SimulatorAdapter;
use crate::types::{Approach, ApproachMap, MetricsSet, RoadMetrics, VehicleId};
use std::collections::{HashMap, HashSet, VecDeque};

/// Below this speed (m/s) a vehicle counts as waiting.
pub const WAITING_SPEED_THRESHOLD: f64 = 2.0;
/// Sliding window for arrival/departure rates.
pub const RATE_WINDOW_SECS: u64 = 60;
/// Queue size treated as 100% congestion.
pub const MAX_QUEUE_PER_APPROACH: u32 = 40;
/// Floor for discharge-rate divisions.
const MIN_DISCHARGE_RATE: f64 = 0.1;

#[derive(Debug, Default)]
struct ApproachTracking {
    in_edge: HashSet<VehicleId>,
    wait_accum: HashMap<VehicleId, f64>,
    waiting_ids: HashSet<VehicleId>,
    arrivals: VecDeque<u64>,
    departures: VecDeque<u64>,
    last_green_time: Option<u64>,
    // Departures since the last decision boundary (running), and the
    // snapshot taken at the boundary (exposed in metrics).
    cleared_pending: u32,
    cleared_snapshot: u32,
}

impl ApproachTracking {
    fn evict_window(&mut self, now: u64) {
        let cutoff = now.saturating_sub(RATE_WINDOW_SECS);
        while self.arrivals.front().is_some_and(|&t| t <= cutoff) {
            self.arrivals.pop_front();
        }
        while self.departures.front().is_some_and(|&t| t <= cutoff) {
            self.departures.pop_front();
        }
    }
}

pub struct MetricsEngine {
    tracking: ApproachMap<ApproachTracking>,
}

impl MetricsEngine {
    pub fn new() -> Self {
        Self {
            tracking: ApproachMap::default(),
        }
    }

    /// Ingest one second of observations. Detects arrivals and departures,
    /// accumulates waiting time for slow vehicles, and maintains the
    /// 60-second rate windows.
    pub fn update_tracking(&mut self, adapter: &mut SimulatorAdapter, now: u64) {
        for approach in Approach::ALL {
            let current = adapter.list_vehicles_on_edge(approach);
            let tracking = self.tracking.get_mut(approach);

            for id in current.difference(&tracking.in_edge) {
                tracking.arrivals.push_back(now);
                tracking.wait_accum.insert(id.clone(), 0.0);
            }

            let departed: Vec<VehicleId> = tracking
                .in_edge
                .difference(&current)
                .cloned()
                .collect();
            for id in &departed {
                tracking.departures.push_back(now);
                tracking.cleared_pending += 1;
                tracking.wait_accum.remove(id);
            }

            tracking.waiting_ids.clear();
            for id in &current {
                let waiting = adapter
                    .vehicle_speed(id)
                    .is_some_and(|speed| speed < WAITING_SPEED_THRESHOLD);
                if waiting {
                    *tracking.wait_accum.entry(id.clone()).or_insert(0.0) += 1.0;
                    tracking.waiting_ids.insert(id.clone());
                }
            }

            tracking.evict_window(now);
            tracking.in_edge = current;
        }
    }

    /// Record that an approach was granted green at `now`.
    pub fn note_green(&mut self, approach: Approach, now: u64) {
        self.tracking.get_mut(approach).last_green_time = Some(now);
    }

    /// Departures recorded on an approach strictly after `since`. Only valid
    /// for spans inside the 60-second rate window.
    pub fn departures_since(&self, approach: Approach, since: u64) -> u32 {
        self.tracking
            .get(approach)
            .departures
            .iter()
            .filter(|&&t| t > since)
            .count() as u32
    }

    /// Close the current decision interval: expose the departures counted
    /// since the previous boundary and restart the accumulator.
    pub fn roll_interval(&mut self) {
        for approach in Approach::ALL {
            let tracking = self.tracking.get_mut(approach);
            tracking.cleared_snapshot = tracking.cleared_pending;
            tracking.cleared_pending = 0;
        }
    }

    /// Compute the full metric set from tracking state. Pure; every division
    /// is floored and every field is non-negative.
    pub fn compute_metrics(&self, now: u64) -> MetricsSet {
        ApproachMap::from_fn(|approach| {
            let tracking = self.tracking.get(approach);

            let waiting_count = tracking.waiting_ids.len() as u32;

            let avg_wait_time = if tracking.waiting_ids.is_empty() {
                0.0
            } else {
                let total: f64 = tracking
                    .waiting_ids
                    .iter()
                    .filter_map(|id| tracking.wait_accum.get(id))
                    .sum();
                total / tracking.waiting_ids.len() as f64
            };

            // Observed window: shorter than 60s until a minute has elapsed
            let window_secs = now.clamp(1, RATE_WINDOW_SECS) as f64;
            let arrival_rate_vpm = tracking.arrivals.len() as f64 * 60.0 / window_secs;
            let departure_rate_vpm = tracking.departures.len() as f64 * 60.0 / window_secs;

            let time_since_last_green = match tracking.last_green_time {
                Some(granted) => now.saturating_sub(granted) as f64,
                None => 0.0,
            };

            let congestion_percent =
                (waiting_count as f64 / MAX_QUEUE_PER_APPROACH as f64 * 100.0).min(100.0);

            let discharge_per_sec = (departure_rate_vpm / 60.0).max(MIN_DISCHARGE_RATE);
            let eta_clear_seconds = waiting_count as f64 / discharge_per_sec;

            RoadMetrics {
                waiting_count,
                avg_wait_time,
                cleared_last_interval: tracking.cleared_snapshot,
                arrival_rate_vpm,
                departure_rate_vpm,
                time_since_last_green,
                congestion_percent,
                eta_clear_seconds,
            }
        })
    }

    pub fn reset(&mut self) {
        self.tracking = ApproachMap::default();
    }
}
