// src/pipeline/control_loop.rs
//
// The single worker that owns every mutable piece of the controller:
// adapter, metrics, predictor, memory, decision state. One tick per
// simulated second; external commands are drained from the queue between
// ticks, never mid-tick.

use crate::adapter::{SimulatorAdapter, SimulatorBackend};
use crate::config::Config;
use crate::controller::{DecisionController, PhaseAction};
use crate::memory::{self, ExperienceMemory};
use crate::metrics::MetricsEngine;
use crate::pipeline::command::{ControlError, ControlHandle, ControlRequest, ModeStatus};
use crate::pipeline::event_log::EventLogger;
use crate::pipeline::snapshot::{SignalSummary, Snapshot, SnapshotPublisher};
use crate::prediction::TrafficPredictor;
use crate::types::{Approach, ApproachMap, DecisionInfo, EmergencyInfo};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum LoopError {
    /// Internal consistency failure. Fatal: the loop goes all-red and stops.
    #[error("loop invariant violated: {0}")]
    InvariantViolation(String),
}

/// Experience awaiting its delayed reward: the reward for a grant is
/// observed at the next phase selection.
struct PendingExperience {
    state: Vec<f64>,
    approach: Approach,
    granted_at: u64,
}

pub struct ControlLoop {
    adapter: SimulatorAdapter,
    metrics: MetricsEngine,
    predictor: TrafficPredictor,
    memory: ExperienceMemory,
    controller: DecisionController,
    publisher: SnapshotPublisher,
    events: EventLogger,
    requests: mpsc::Receiver<ControlRequest>,
    running: bool,
    decision_cycle: u32,
    ticks_since_roll: u32,
    pending_experience: Option<PendingExperience>,
    emergency_was_active: bool,
    last_decision: DecisionInfo,
}

impl ControlLoop {
    pub fn new(config: Config, backend: Box<dyn SimulatorBackend>) -> (Self, ControlHandle) {
        let (request_tx, request_rx) = mpsc::channel(crate::pipeline::command::COMMAND_QUEUE_DEPTH);
        let (publisher, status_rx) = SnapshotPublisher::new();
        let handle = ControlHandle::new(request_tx, status_rx, publisher.stream_sender());

        let memory = match &config.memory.path {
            Some(path) => match ExperienceMemory::open(path, config.memory.capacity) {
                Ok(memory) => {
                    if !memory.is_empty() {
                        info!("experience store: {} records loaded", memory.len());
                    }
                    memory
                }
                Err(e) => {
                    warn!("experience store unavailable ({e}), continuing in memory");
                    ExperienceMemory::in_memory(config.memory.capacity)
                }
            },
            None => ExperienceMemory::in_memory(config.memory.capacity),
        };

        let events = match config.events.path.as_deref() {
            Some(path) => EventLogger::new(Some(path)),
            None => EventLogger::disabled(),
        };
        let decision_cycle = config.control.decision_cycle_secs.max(1);

        let control_loop = Self {
            adapter: SimulatorAdapter::new(backend),
            metrics: MetricsEngine::new(),
            predictor: TrafficPredictor::new(),
            memory,
            controller: DecisionController::new(config.control),
            publisher,
            events,
            requests: request_rx,
            running: false,
            decision_cycle,
            ticks_since_roll: 0,
            pending_experience: None,
            emergency_was_active: false,
            last_decision: DecisionInfo::idle(),
        };
        (control_loop, handle)
    }

    /// Drive ticks at one simulated second per wall second and serve the
    /// command queue. Returns when shut down or on a fatal invariant error.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    match request {
                        Some(request) => {
                            if self.handle_command(request) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = interval.tick(), if self.running => {
                    // Everything already queued is applied, in order, before
                    // this tick runs; commands never land mid-tick.
                    let mut shutdown = false;
                    while let Ok(request) = self.requests.try_recv() {
                        if self.handle_command(request) {
                            shutdown = true;
                            break;
                        }
                    }
                    if shutdown {
                        break;
                    }
                    if !self.running {
                        continue;
                    }
                    if let Err(e) = self.tick() {
                        error!("fatal: {e}");
                        self.adapter.set_all_red(5);
                        self.events.log(
                            "loop_fault",
                            self.adapter.current_time(),
                            json!({ "error": e.to_string() }),
                        );
                        self.running = false;
                        break;
                    }
                }
            }
        }
        self.adapter.disconnect();
    }

    /// Apply one queued control request. Returns true on shutdown.
    pub(crate) fn handle_command(&mut self, request: ControlRequest) -> bool {
        match request {
            ControlRequest::Start(reply) => {
                let _ = reply.send(self.do_start());
            }
            ControlRequest::Stop(reply) => {
                self.do_stop();
                let _ = reply.send(());
            }
            ControlRequest::SetMode(mode, reply) => {
                let result = self
                    .controller
                    .set_mode(mode, self.emergency_was_active)
                    .map(|()| {
                        self.events.log(
                            "mode_change",
                            self.adapter.current_time(),
                            json!({ "mode": mode.as_str() }),
                        );
                        self.mode_status()
                    });
                let _ = reply.send(result);
            }
            ControlRequest::ApplyManual {
                command,
                duration_secs,
                reply,
            } => {
                let now = self.adapter.current_time();
                let result = self
                    .controller
                    .apply_manual(command, duration_secs, now, self.emergency_was_active)
                    .map(|()| {
                        self.events.log(
                            "manual_apply",
                            now,
                            json!({ "command": command.as_str(), "duration": duration_secs }),
                        );
                    });
                let _ = reply.send(result);
            }
            ControlRequest::CancelManual(reply) => {
                self.controller.cancel_manual();
                self.events.log(
                    "manual_cancel",
                    self.adapter.current_time(),
                    json!({ "mode": "AUTO" }),
                );
                let _ = reply.send(self.mode_status());
            }
            ControlRequest::MemorySummary(reply) => {
                let _ = reply.send(self.memory.summary());
            }
            ControlRequest::Shutdown(reply) => {
                self.do_stop();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    pub(crate) fn do_start(&mut self) -> Result<(), ControlError> {
        if self.running {
            return Ok(());
        }
        self.adapter
            .connect()
            .map_err(|e| ControlError::SimulatorUnavailable(e.to_string()))?;

        self.adapter.reset();
        self.metrics.reset();
        self.predictor.reset();
        self.controller.reset();
        self.ticks_since_roll = 0;
        self.pending_experience = None;
        self.emergency_was_active = false;
        self.last_decision = DecisionInfo::idle();
        self.running = true;

        self.events.log("simulation_start", 0, json!({}));
        info!("control loop running");
        Ok(())
    }

    fn do_stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.adapter.disconnect();
        self.events
            .log("simulation_stop", self.adapter.current_time(), json!({}));
        info!("control loop stopped");
    }

    /// One simulated second: observe, derive, decide, actuate, publish.
    pub(crate) fn tick(&mut self) -> Result<(), LoopError> {
        self.adapter.step();
        let now = self.adapter.current_time();

        self.metrics.update_tracking(&mut self.adapter, now);
        let emergency = self.adapter.detect_emergency();

        self.ticks_since_roll += 1;
        if self.ticks_since_roll >= self.decision_cycle {
            self.metrics.roll_interval();
            self.ticks_since_roll = 0;
        }

        let metric_set = self.metrics.compute_metrics(now);
        let predictions = self.predictor.predict(&metric_set, now);
        let counts = self.adapter.counts();
        let queues = ApproachMap::from_fn(|a| counts.get(a).weighted_queue());

        let outcome = self.controller.tick_and_decide(
            now,
            &metric_set,
            &predictions,
            &queues,
            &emergency,
            &self.memory,
        );

        if outcome.manual_cleared_by_emergency {
            self.events.log(
                "emergency_interrupt",
                now,
                json!({ "approach": emergency.approach }),
            );
        }
        if outcome.manual_expired {
            self.events
                .log("manual_expire", now, json!({ "mode": "AUTO" }));
        }
        if emergency.active && !self.emergency_was_active {
            self.events.log(
                "emergency_detected",
                now,
                json!({ "approach": emergency.approach }),
            );
        }
        self.emergency_was_active = emergency.active;

        match outcome.action {
            PhaseAction::Grant {
                approach,
                duration,
                from,
            } => {
                // The previous phase just ended: observe its delayed reward
                if let Some(pending) = self.pending_experience.take() {
                    let reward = self.phase_reward(&pending, &metric_set);
                    self.memory
                        .record(pending.state, pending.approach, reward, now, "phase_end");
                }

                self.adapter.apply_safe_transition(from, approach, duration);
                self.metrics.note_green(approach, now);
                self.pending_experience = Some(PendingExperience {
                    state: memory::state_vector(&metric_set),
                    approach,
                    granted_at: now,
                });

                self.events.log(
                    "decision",
                    now,
                    json!({
                        "method": outcome.decision.method.as_str(),
                        "reason": outcome.decision.reason.as_str(),
                        "approach": approach.name(),
                        "duration": duration,
                    }),
                );
            }
            PhaseAction::HoldAllRed => self.adapter.set_all_red(1),
            PhaseAction::NoChange => {}
        }

        self.check_invariants(&emergency)?;

        self.last_decision = outcome.decision.clone();
        let snapshot = self.build_snapshot(now, counts, queues, metric_set, predictions, emergency);
        self.publisher.publish(snapshot);
        Ok(())
    }

    /// Delayed one-step reward: vehicles discharged during the phase minus
    /// a penalty for the queue left behind, clipped to [-100, 100].
    fn phase_reward(&self, pending: &PendingExperience, metrics: &crate::types::MetricsSet) -> f64 {
        let discharged = self
            .metrics
            .departures_since(pending.approach, pending.granted_at) as f64;
        let left_waiting = metrics.get(pending.approach).waiting_count as f64;
        (discharged - 0.5 * left_waiting).clamp(-100.0, 100.0)
    }

    fn check_invariants(&self, emergency: &EmergencyInfo) -> Result<(), LoopError> {
        let manual = self.controller.manual_info(self.adapter.current_time());
        if manual.active && emergency.active {
            return Err(LoopError::InvariantViolation(
                "manual override survived emergency preemption".to_string(),
            ));
        }
        if self.controller.remaining_green() > 24 * 3600 {
            return Err(LoopError::InvariantViolation(format!(
                "green remaining {}s is out of range",
                self.controller.remaining_green()
            )));
        }
        Ok(())
    }

    fn mode_status(&self) -> ModeStatus {
        ModeStatus {
            mode: self.controller.mode(),
            manual: self.controller.manual_info(self.adapter.current_time()),
        }
    }

    fn build_snapshot(
        &self,
        now: u64,
        counts: ApproachMap<crate::types::VehicleCounts>,
        queues: ApproachMap<u32>,
        metrics: crate::types::MetricsSet,
        prediction: crate::types::PredictionSet,
        emergency: EmergencyInfo,
    ) -> Snapshot {
        Snapshot {
            time: now,
            signal: SignalSummary::from_state(self.controller.signal_state()),
            mode: self.controller.mode(),
            manual: self.controller.manual_info(now),
            emergency,
            decision: self.last_decision.clone(),
            counts,
            queues,
            metrics,
            prediction,
        }
    }
}
