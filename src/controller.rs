// src/controller.rs
//
// Phase decision arbiter. Merges metrics, predictions and recalled
// experience into one phase decision per tick under a strict priority
// hierarchy: emergency > manual override > starvation protection >
// memory recall > composite scoring.

use crate::config::ControllerConfig;
use crate::memory::{self, ExperienceMemory};
use crate::pipeline::command::ControlError;
use crate::types::{
    Approach, ApproachMap, DecisionInfo, DecisionMethod, EmergencyInfo, ManualCommand, ManualInfo,
    MetricsSet, Mode, PredictionSet, SignalState,
};
use tracing::info;

// Composite scoring weights
const WEIGHT_QUEUE: f64 = 1.0;
const WEIGHT_WAIT: f64 = 0.8;
const WEIGHT_FAIR: f64 = 0.6;
const WEIGHT_CONG: f64 = 0.4;
const WEIGHT_PRED: f64 = 0.3;
const WEIGHT_SWITCH: f64 = 1.2;

// Dynamic green duration coefficients
const ALPHA_WAITING: f64 = 1.0;
const BETA_WAIT_TIME: f64 = 0.5;

/// Seconds of a manual window served per sub-phase before the paired
/// approach takes over.
const MANUAL_SUBPHASE_SECS: u32 = 30;

/// What the control loop must do with the signal heads this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseAction {
    /// Grant a new green; `from` is the green it replaces.
    Grant {
        approach: Approach,
        duration: u32,
        from: Option<Approach>,
    },
    /// Manual ALL_RED: re-assert red on every head.
    HoldAllRed,
    /// Keep whatever is currently applied.
    NoChange,
}

#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub decision: DecisionInfo,
    pub action: PhaseAction,
    pub manual_expired: bool,
    pub manual_cleared_by_emergency: bool,
}

impl TickOutcome {
    fn hold(decision: DecisionInfo) -> Self {
        Self {
            decision,
            action: PhaseAction::NoChange,
            manual_expired: false,
            manual_cleared_by_emergency: false,
        }
    }
}

pub struct DecisionController {
    config: ControllerConfig,
    current_green: Option<Approach>,
    remaining_green: u32,
    /// Ticks since the last phase selection; gates the forced checks.
    since_last_selection: u32,
    gap_out_counter: u32,
    /// Set for the tick on which a cross-group grant was issued.
    clearance: Option<(Approach, Approach)>,
    mode: Mode,
    manual_command: Option<ManualCommand>,
    manual_until: Option<u64>,
}

impl DecisionController {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            current_green: None,
            remaining_green: 0,
            since_last_selection: 0,
            gap_out_counter: 0,
            clearance: None,
            mode: Mode::Auto,
            manual_command: None,
            manual_until: None,
        }
    }

    pub fn reset(&mut self) {
        let config = self.config.clone();
        *self = Self::new(config);
    }

    // ------------------------------------------------------------------
    // Status accessors
    // ------------------------------------------------------------------

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn current_green(&self) -> Option<Approach> {
        self.current_green
    }

    pub fn remaining_green(&self) -> u32 {
        self.remaining_green
    }

    pub fn signal_state(&self) -> SignalState {
        if let Some((from, to)) = self.clearance {
            return SignalState::Transitioning { from, to };
        }
        match self.current_green {
            Some(approach) => SignalState::Green {
                approach,
                remaining: self.remaining_green,
            },
            None => SignalState::AllRed {
                remaining: self.remaining_green,
            },
        }
    }

    pub fn manual_info(&self, now: u64) -> ManualInfo {
        ManualInfo {
            active: self.mode == Mode::Manual,
            command: self.manual_command,
            remaining_seconds: self.manual_remaining(now),
        }
    }

    fn manual_remaining(&self, now: u64) -> u32 {
        match (self.mode, self.manual_until) {
            (Mode::Manual, Some(until)) => until.saturating_sub(now) as u32,
            _ => 0,
        }
    }

    // ------------------------------------------------------------------
    // Control interface
    // ------------------------------------------------------------------

    pub fn set_mode(&mut self, mode: Mode, emergency_active: bool) -> Result<(), ControlError> {
        if emergency_active {
            return Err(ControlError::EmergencyActive);
        }
        match mode {
            Mode::Auto => self.cancel_manual(),
            Mode::Manual => self.mode = Mode::Manual,
        }
        Ok(())
    }

    pub fn apply_manual(
        &mut self,
        command: ManualCommand,
        duration_secs: u32,
        now: u64,
        emergency_active: bool,
    ) -> Result<(), ControlError> {
        if emergency_active {
            return Err(ControlError::EmergencyActive);
        }
        if self.mode != Mode::Manual {
            return Err(ControlError::InvalidCommand(
                "manual commands require MANUAL mode".to_string(),
            ));
        }
        if !(10..=120).contains(&duration_secs) {
            return Err(ControlError::ConstraintViolation(format!(
                "manual duration must be 10-120s, got {duration_secs}"
            )));
        }
        self.manual_command = Some(command);
        self.manual_until = Some(now + duration_secs as u64);
        info!(
            "manual override: {} for {duration_secs}s",
            command.as_str()
        );
        Ok(())
    }

    pub fn cancel_manual(&mut self) {
        self.mode = Mode::Auto;
        self.manual_command = None;
        self.manual_until = None;
    }

    // ------------------------------------------------------------------
    // Decision logic
    // ------------------------------------------------------------------

    /// Evaluate the decision hierarchy for one tick. A new phase selection
    /// happens only when the running green expires or a higher-priority
    /// event (emergency, manual, starvation, gap-out) forces one.
    pub fn tick_and_decide(
        &mut self,
        now: u64,
        metrics: &MetricsSet,
        predictions: &PredictionSet,
        queues: &ApproachMap<u32>,
        emergency: &EmergencyInfo,
        memory: &ExperienceMemory,
    ) -> TickOutcome {
        self.remaining_green = self.remaining_green.saturating_sub(1);
        self.since_last_selection += 1;
        self.clearance = None;

        let cadence_due = self.since_last_selection >= self.config.decision_cycle_secs;
        let mut manual_cleared_by_emergency = false;
        let mut manual_expired = false;

        // === EMERGENCY PREEMPTION ===
        if let (true, Some(target)) = (emergency.active, emergency.approach) {
            if self.mode == Mode::Manual {
                self.cancel_manual();
                manual_cleared_by_emergency = true;
                info!("manual override cleared by emergency on {target}");
            }

            if self.current_green == Some(target) {
                // Hold the green until the emergency vehicle clears the edge
                if self.remaining_green == 0 {
                    self.remaining_green = self.config.emergency_min_green_secs;
                }
                let mut outcome = TickOutcome::hold(DecisionInfo::new(
                    DecisionMethod::Emergency,
                    format!("emergency vehicle on {target}, holding green"),
                ));
                outcome.manual_cleared_by_emergency = manual_cleared_by_emergency;
                return outcome;
            }

            if self.remaining_green <= 4 || cadence_due {
                let duration = self.green_duration(target, metrics, self.config.emergency_min_green_secs);
                let action = self.grant(target, duration);
                return TickOutcome {
                    decision: DecisionInfo::new(
                        DecisionMethod::Emergency,
                        format!("emergency preemption: {target} ({duration}s green)"),
                    ),
                    action,
                    manual_expired: false,
                    manual_cleared_by_emergency,
                };
            }
            // Gate still closed: fall through so the running green keeps
            // counting down toward the preemption window.
        }

        // === MANUAL OVERRIDE ===
        if self.mode == Mode::Manual {
            if self.manual_until.is_some_and(|until| now >= until) {
                self.cancel_manual();
                manual_expired = true;
                info!("manual override expired, returning to AUTO");
                // Continue into automatic selection below
            } else if let Some(command) = self.manual_command {
                let remaining_window = self.manual_remaining(now);
                let mut outcome = match command {
                    ManualCommand::AllRed => {
                        self.current_green = None;
                        self.remaining_green = 0;
                        self.gap_out_counter = 0;
                        TickOutcome {
                            decision: DecisionInfo::new(
                                DecisionMethod::Manual,
                                format!("manual ALL_RED ({remaining_window}s remaining)"),
                            ),
                            action: PhaseAction::HoldAllRed,
                            manual_expired: false,
                            manual_cleared_by_emergency: false,
                        }
                    }
                    ManualCommand::NsGreen => {
                        self.manual_subphase(Approach::North, remaining_window)
                    }
                    ManualCommand::EwGreen => {
                        self.manual_subphase(Approach::East, remaining_window)
                    }
                };
                outcome.manual_cleared_by_emergency = manual_cleared_by_emergency;
                return outcome;
            }
            // MANUAL mode without a pending command behaves as AUTO
        }

        // === STARVATION PROTECTION ===
        if self.remaining_green == 0 || cadence_due {
            if let Some(starved) = self.find_starved(metrics) {
                let since = metrics.get(starved).time_since_last_green;
                let duration = self.green_duration(starved, metrics, self.config.min_green_secs);
                let action = self.grant(starved, duration);
                return TickOutcome {
                    decision: DecisionInfo::new(
                        DecisionMethod::Starvation,
                        format!(
                            "starvation protection: {starved} red for {since:.0}s (limit {}s)",
                            self.config.max_red_secs
                        ),
                    ),
                    action,
                    manual_expired,
                    manual_cleared_by_emergency,
                };
            }
        }

        // === SCHEDULED SELECTION ===
        if self.remaining_green == 0 {
            let total_demand: u32 = queues.iter().map(|(_, q)| *q).sum();
            if total_demand == 0 {
                // Nothing anywhere: rest in all-red instead of cycling
                // empty greens.
                self.current_green = None;
                self.gap_out_counter = 0;
                return TickOutcome {
                    decision: DecisionInfo::new(
                        DecisionMethod::Hold,
                        "no demand, all approaches red",
                    ),
                    action: PhaseAction::NoChange,
                    manual_expired,
                    manual_cleared_by_emergency,
                };
            }

            let (decision, action) = self.select_phase(now, metrics, predictions, memory);
            return TickOutcome {
                decision,
                action,
                manual_expired,
                manual_cleared_by_emergency,
            };
        }

        // === GAP-OUT ===
        if let Some(green) = self.current_green {
            if metrics.get(green).waiting_count == 0 {
                self.gap_out_counter += 1;
            } else {
                self.gap_out_counter = 0;
            }
            if self.gap_out_counter >= self.config.gap_out_ticks {
                self.remaining_green = 0;
                self.gap_out_counter = 0;
                return TickOutcome {
                    decision: DecisionInfo::new(
                        DecisionMethod::GapOut,
                        format!("gap-out: no waiting vehicles on {green}"),
                    ),
                    action: PhaseAction::NoChange,
                    manual_expired,
                    manual_cleared_by_emergency,
                };
            }

            return TickOutcome {
                decision: DecisionInfo::new(
                    DecisionMethod::Hold,
                    format!("holding {green} ({}s remaining)", self.remaining_green),
                ),
                action: PhaseAction::NoChange,
                manual_expired,
                manual_cleared_by_emergency,
            };
        }

        TickOutcome {
            decision: DecisionInfo::new(DecisionMethod::Hold, "all approaches red"),
            action: PhaseAction::NoChange,
            manual_expired,
            manual_cleared_by_emergency,
        }
    }

    /// Memory recall with composite-scoring fallback.
    fn select_phase(
        &mut self,
        now: u64,
        metrics: &MetricsSet,
        predictions: &PredictionSet,
        memory: &ExperienceMemory,
    ) -> (DecisionInfo, PhaseAction) {
        let state = memory::state_vector(metrics);
        let matches = memory.find_similar(&state, now);

        if ExperienceMemory::is_confident(&matches) {
            let rewards = ExperienceMemory::weighted_rewards_by_approach(&matches);
            let mut best: Option<Approach> = None;
            for approach in Approach::ALL {
                let stat = rewards.get(approach);
                if stat.matches == 0 {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some(current) => {
                        stat.weighted_reward > rewards.get(current).weighted_reward
                    }
                };
                if better {
                    best = Some(approach);
                }
            }
            if let Some(chosen) = best {
                let stat = *rewards.get(chosen);
                let duration = self.green_duration(chosen, metrics, self.config.min_green_secs);
                let action = self.grant(chosen, duration);
                let level = predictions.get(chosen).congestion_level;
                return (
                    DecisionInfo::new(
                        DecisionMethod::Memory,
                        format!(
                            "memory recall: {chosen} (reward={:.1}, matches={}, predicted={})",
                            stat.weighted_reward,
                            stat.matches,
                            level.as_str()
                        ),
                    ),
                    action,
                );
            }
        }

        let chosen = self.best_by_composite(metrics, predictions);
        let score = self.composite_score(chosen, metrics, predictions);
        let duration = self.green_duration(chosen, metrics, self.config.min_green_secs);
        let action = self.grant(chosen, duration);
        let level = predictions.get(chosen).congestion_level;
        (
            DecisionInfo::new(
                DecisionMethod::Fallback,
                format!(
                    "composite score: {chosen} (score={score:.1}, predicted={})",
                    level.as_str()
                ),
            ),
            action,
        )
    }

    fn composite_score(
        &self,
        approach: Approach,
        metrics: &MetricsSet,
        predictions: &PredictionSet,
    ) -> f64 {
        let m = metrics.get(approach);
        let switch_penalty = if self.current_green == Some(approach) {
            1.0
        } else {
            0.0
        };
        WEIGHT_QUEUE * m.waiting_count as f64
            + WEIGHT_WAIT * m.avg_wait_time
            + WEIGHT_FAIR * m.time_since_last_green
            + WEIGHT_CONG * m.congestion_percent
            + WEIGHT_PRED * (predictions.get(approach).heavy_traffic_probability / 100.0)
            - WEIGHT_SWITCH * switch_penalty
    }

    /// Highest composite score; ties broken by larger waiting count, then
    /// by approach name.
    fn best_by_composite(&self, metrics: &MetricsSet, predictions: &PredictionSet) -> Approach {
        let mut best = Approach::North;
        let mut best_score = f64::NEG_INFINITY;
        for approach in Approach::ALL {
            let score = self.composite_score(approach, metrics, predictions);
            let replace = score > best_score
                || (score == best_score
                    && (metrics.get(approach).waiting_count
                        > metrics.get(best).waiting_count
                        || (metrics.get(approach).waiting_count
                            == metrics.get(best).waiting_count
                            && approach.name() < best.name())));
            if replace {
                best = approach;
                best_score = score;
            }
        }
        best
    }

    /// Approach overdue for service, if any. The current green never counts.
    fn find_starved(&self, metrics: &MetricsSet) -> Option<Approach> {
        let mut starved: Option<(Approach, f64)> = None;
        for approach in Approach::ALL {
            if self.current_green == Some(approach) {
                continue;
            }
            let since = metrics.get(approach).time_since_last_green;
            if since > self.config.max_red_secs as f64 {
                let worse = starved.map_or(true, |(_, worst)| since > worst);
                if worse {
                    starved = Some((approach, since));
                }
            }
        }
        starved.map(|(approach, _)| approach)
    }

    /// green_time = min_green + alpha * waiting + beta * avg_wait,
    /// clamped to [floor, max_green].
    fn green_duration(&self, approach: Approach, metrics: &MetricsSet, floor: u32) -> u32 {
        let m = metrics.get(approach);
        let duration = self.config.min_green_secs as f64
            + ALPHA_WAITING * m.waiting_count as f64
            + BETA_WAIT_TIME * m.avg_wait_time;
        (duration as u32).clamp(floor, self.config.max_green_secs)
    }

    fn manual_subphase(&mut self, first: Approach, window: u32) -> TickOutcome {
        let second = first.opposite();
        let in_group = self
            .current_green
            .is_some_and(|g| g == first || g == second);
        if !in_group || self.remaining_green == 0 {
            let next = if self.current_green == Some(first) {
                second
            } else {
                first
            };
            let duration = MANUAL_SUBPHASE_SECS.min(window.max(1));
            let action = self.grant(next, duration);
            return TickOutcome {
                decision: DecisionInfo::new(
                    DecisionMethod::Manual,
                    format!(
                        "manual {}: {next} ({window}s remaining)",
                        self.manual_command.map(|c| c.as_str()).unwrap_or("?")
                    ),
                ),
                action,
                manual_expired: false,
                manual_cleared_by_emergency: false,
            };
        }

        TickOutcome::hold(DecisionInfo::new(
            DecisionMethod::Manual,
            format!(
                "manual {}: holding {} ({window}s remaining)",
                self.manual_command.map(|c| c.as_str()).unwrap_or("?"),
                self.current_green.map(|g| g.name()).unwrap_or("none"),
            ),
        ))
    }

    fn grant(&mut self, approach: Approach, duration: u32) -> PhaseAction {
        let from = self.current_green;
        if let Some(prev) = from {
            if prev.group() != approach.group() {
                self.clearance = Some((prev, approach));
            }
        }
        self.current_green = Some(approach);
        self.remaining_green = duration;
        self.since_last_selection = 0;
        self.gap_out_counter = 0;
        info!("green: {approach} for {duration}s");
        PhaseAction::Grant {
            approach,
            duration,
            from,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RoadMetrics;

    fn controller() -> DecisionController {
        DecisionController::new(ControllerConfig::default())
    }

    fn empty_memory() -> ExperienceMemory {
        ExperienceMemory::in_memory(100)
    }

    fn metrics(f: impl Fn(Approach) -> RoadMetrics) -> MetricsSet {
        MetricsSet::from_fn(f)
    }

    fn waiting_only(counts: [u32; 4]) -> MetricsSet {
        metrics(|a| {
            let idx = Approach::ALL.iter().position(|&x| x == a).unwrap();
            RoadMetrics {
                waiting_count: counts[idx],
                ..Default::default()
            }
        })
    }

    fn queues_from(metrics: &MetricsSet) -> ApproachMap<u32> {
        ApproachMap::from_fn(|a| metrics.get(a).waiting_count * 2)
    }

    fn decide(
        controller: &mut DecisionController,
        now: u64,
        metrics: &MetricsSet,
        emergency: &EmergencyInfo,
        memory: &ExperienceMemory,
    ) -> TickOutcome {
        let queues = queues_from(metrics);
        controller.tick_and_decide(
            now,
            metrics,
            &PredictionSet::default(),
            &queues,
            emergency,
            memory,
        )
    }

    #[test]
    fn test_first_tick_selects_by_composite_score() {
        let mut controller = controller();
        let memory = empty_memory();
        let set = waiting_only([3, 12, 0, 1]);

        let outcome = decide(&mut controller, 1, &set, &EmergencyInfo::default(), &memory);
        assert_eq!(outcome.decision.method, DecisionMethod::Fallback);
        match outcome.action {
            PhaseAction::Grant { approach, duration, from } => {
                assert_eq!(approach, Approach::East);
                assert_eq!(from, None);
                // 10 + 12 waiting
                assert_eq!(duration, 22);
            }
            other => panic!("expected grant, got {other:?}"),
        }
        assert_eq!(controller.current_green(), Some(Approach::East));
    }

    #[test]
    fn test_running_green_is_not_preempted_by_score() {
        let mut controller = controller();
        let memory = empty_memory();
        let set = waiting_only([3, 12, 0, 1]);
        decide(&mut controller, 1, &set, &EmergencyInfo::default(), &memory);

        // North suddenly outscores east, but the green has time left
        let set = waiting_only([30, 2, 0, 1]);
        for t in 2..=8 {
            let outcome = decide(&mut controller, t, &set, &EmergencyInfo::default(), &memory);
            assert_eq!(outcome.action, PhaseAction::NoChange);
            assert_eq!(outcome.decision.method, DecisionMethod::Hold);
        }
        assert_eq!(controller.current_green(), Some(Approach::East));
    }

    #[test]
    fn test_equal_scores_tie_break_lexicographically() {
        let mut controller = controller();
        let memory = empty_memory();

        // Identical demand everywhere: equal scores, equal waiting, so the
        // lexicographically first approach name wins
        let set = waiting_only([5, 5, 5, 5]);
        let outcome = decide(&mut controller, 1, &set, &EmergencyInfo::default(), &memory);
        match outcome.action {
            PhaseAction::Grant { approach, .. } => assert_eq!(approach, Approach::East),
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn test_prediction_bias_breaks_equal_demand() {
        let mut controller = controller();
        let memory = empty_memory();
        let set = waiting_only([0, 8, 0, 8]);
        let mut predictions = PredictionSet::default();
        predictions.get_mut(Approach::East).heavy_traffic_probability = 20.0;
        predictions.get_mut(Approach::West).heavy_traffic_probability = 80.0;

        let queues = queues_from(&set);
        let outcome = controller.tick_and_decide(
            1,
            &set,
            &predictions,
            &queues,
            &EmergencyInfo::default(),
            &memory,
        );
        match outcome.action {
            PhaseAction::Grant { approach, .. } => assert_eq!(approach, Approach::West),
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn test_green_duration_clamps() {
        let controller = controller();
        // Empty approach: floor
        let set = waiting_only([0, 0, 0, 0]);
        assert_eq!(
            controller.green_duration(Approach::North, &set, 10),
            10
        );
        // Heavy approach: ceiling
        let set = metrics(|_| RoadMetrics {
            waiting_count: 40,
            avg_wait_time: 80.0,
            ..Default::default()
        });
        assert_eq!(
            controller.green_duration(Approach::North, &set, 10),
            60
        );
    }

    #[test]
    fn test_starvation_preempts_running_green() {
        let mut controller = controller();
        let memory = empty_memory();

        // Grant north a long green
        let set = metrics(|a| match a {
            Approach::North => RoadMetrics {
                waiting_count: 30,
                avg_wait_time: 40.0,
                ..Default::default()
            },
            _ => RoadMetrics::default(),
        });
        let outcome = decide(&mut controller, 1, &set, &EmergencyInfo::default(), &memory);
        assert!(matches!(outcome.action, PhaseAction::Grant { approach: Approach::North, .. }));

        // West has been red past the limit; east nearly as long
        let set = metrics(|a| match a {
            Approach::North => RoadMetrics {
                waiting_count: 30,
                ..Default::default()
            },
            Approach::West => RoadMetrics {
                waiting_count: 1,
                time_since_last_green: 95.0,
                ..Default::default()
            },
            Approach::East => RoadMetrics {
                waiting_count: 1,
                time_since_last_green: 92.0,
                ..Default::default()
            },
            _ => RoadMetrics::default(),
        });

        // The forced check runs at the 5-tick cadence
        let mut granted = None;
        for t in 2..=7 {
            let outcome = decide(&mut controller, t, &set, &EmergencyInfo::default(), &memory);
            if let PhaseAction::Grant { approach, .. } = outcome.action {
                granted = Some((t, approach, outcome.decision.clone()));
                break;
            }
        }
        let (t, approach, decision) = granted.expect("starvation grant expected");
        assert!(t <= 6);
        // Worst starvation wins the tie
        assert_eq!(approach, Approach::West);
        assert_eq!(decision.method, DecisionMethod::Starvation);
    }

    #[test]
    fn test_memory_recall_when_confident() {
        let mut controller = controller();
        let mut memory = empty_memory();
        let set = waiting_only([6, 2, 9, 1]);

        // Fresh, identical experience strongly favouring south
        let state = memory::state_vector(&set);
        memory.record(state.clone(), Approach::South, 25.0, 95, "phase_end");
        memory.record(state.clone(), Approach::North, -5.0, 95, "phase_end");

        let outcome = decide(&mut controller, 100, &set, &EmergencyInfo::default(), &memory);
        assert_eq!(outcome.decision.method, DecisionMethod::Memory);
        match outcome.action {
            PhaseAction::Grant { approach, .. } => assert_eq!(approach, Approach::South),
            other => panic!("expected grant, got {other:?}"),
        }
        assert!(outcome.decision.reason.contains("reward=25.0"));
    }

    #[test]
    fn test_stale_memory_falls_back_to_scoring() {
        let mut controller = controller();
        let mut memory = empty_memory();
        let set = waiting_only([6, 2, 9, 1]);

        // Same experience but hours old: decay kills the confidence
        let state = memory::state_vector(&set);
        memory.record(state, Approach::North, 25.0, 0, "phase_end");

        let outcome = decide(&mut controller, 7200, &set, &EmergencyInfo::default(), &memory);
        assert_eq!(outcome.decision.method, DecisionMethod::Fallback);
        match outcome.action {
            PhaseAction::Grant { approach, .. } => assert_eq!(approach, Approach::South),
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn test_emergency_preempts_within_five_ticks() {
        let mut controller = controller();
        let memory = empty_memory();
        let set = waiting_only([20, 1, 1, 1]);

        // North holds a long green
        decide(&mut controller, 1, &set, &EmergencyInfo::default(), &memory);
        assert_eq!(controller.current_green(), Some(Approach::North));
        assert!(controller.remaining_green() > 10);

        let emergency = EmergencyInfo {
            active: true,
            approach: Some(Approach::South),
        };
        let mut switch_tick = None;
        for t in 2..=7 {
            let outcome = decide(&mut controller, t, &set, &emergency, &memory);
            if let PhaseAction::Grant { approach, duration, .. } = outcome.action {
                assert_eq!(approach, Approach::South);
                assert!(duration >= 15);
                assert_eq!(outcome.decision.method, DecisionMethod::Emergency);
                switch_tick = Some(t);
                break;
            }
        }
        // Detected at t=2, preempted by t=6 (5 ticks)
        assert!(switch_tick.unwrap() <= 6);
    }

    #[test]
    fn test_emergency_holds_green_without_gap_out() {
        let mut controller = controller();
        let memory = empty_memory();
        let set = waiting_only([0, 0, 5, 0]);

        let emergency = EmergencyInfo {
            active: true,
            approach: Some(Approach::South),
        };
        decide(&mut controller, 1, &set, &emergency, &memory);
        assert_eq!(controller.current_green(), Some(Approach::South));

        // Ambulance moving at speed: zero waiting for many ticks, green must
        // not gap out while the emergency is present.
        let set = waiting_only([0, 0, 0, 0]);
        for t in 2..=10 {
            let outcome = decide(&mut controller, t, &set, &emergency, &memory);
            assert_eq!(outcome.decision.method, DecisionMethod::Emergency);
            assert_eq!(controller.current_green(), Some(Approach::South));
        }
    }

    #[test]
    fn test_emergency_clears_manual() {
        let mut controller = controller();
        let memory = empty_memory();
        let set = waiting_only([1, 1, 1, 1]);

        controller.set_mode(Mode::Manual, false).unwrap();
        controller
            .apply_manual(ManualCommand::NsGreen, 60, 10, false)
            .unwrap();
        let outcome = decide(&mut controller, 11, &set, &EmergencyInfo::default(), &memory);
        assert_eq!(outcome.decision.method, DecisionMethod::Manual);

        let emergency = EmergencyInfo {
            active: true,
            approach: Some(Approach::East),
        };
        let outcome = decide(&mut controller, 12, &set, &emergency, &memory);
        assert!(outcome.manual_cleared_by_emergency);
        assert_eq!(controller.mode(), Mode::Auto);
        assert!(!controller.manual_info(12).active);

        // Emergency and manual are never both reported active
        let manual = controller.manual_info(12);
        assert!(!(manual.active && emergency.active));
    }

    #[test]
    fn test_manual_ns_alternates_on_subphase_expiry() {
        let mut controller = controller();
        let memory = empty_memory();
        let set = waiting_only([2, 2, 2, 2]);

        controller.set_mode(Mode::Manual, false).unwrap();
        controller
            .apply_manual(ManualCommand::NsGreen, 120, 0, false)
            .unwrap();

        let outcome = decide(&mut controller, 1, &set, &EmergencyInfo::default(), &memory);
        match outcome.action {
            PhaseAction::Grant { approach, duration, .. } => {
                assert_eq!(approach, Approach::North);
                assert_eq!(duration, 30);
            }
            other => panic!("expected grant, got {other:?}"),
        }

        // Holds north for the 30s sub-phase, then flips to south
        let mut flipped_at = None;
        for t in 2..=40 {
            let outcome = decide(&mut controller, t, &set, &EmergencyInfo::default(), &memory);
            assert_eq!(outcome.decision.method, DecisionMethod::Manual);
            if let PhaseAction::Grant { approach, .. } = outcome.action {
                assert_eq!(approach, Approach::South);
                flipped_at = Some(t);
                break;
            }
        }
        assert_eq!(flipped_at, Some(31));
    }

    #[test]
    fn test_manual_expires_by_simulated_time() {
        let mut controller = controller();
        let memory = empty_memory();
        let set = waiting_only([2, 2, 2, 2]);

        controller.set_mode(Mode::Manual, false).unwrap();
        controller
            .apply_manual(ManualCommand::AllRed, 20, 10, false)
            .unwrap();

        let outcome = decide(&mut controller, 11, &set, &EmergencyInfo::default(), &memory);
        assert_eq!(outcome.action, PhaseAction::HoldAllRed);
        assert!(controller.manual_info(11).active);
        assert_eq!(controller.manual_info(11).remaining_seconds, 19);

        // At exactly T+D the override expires and AUTO resumes
        let outcome = decide(&mut controller, 30, &set, &EmergencyInfo::default(), &memory);
        assert!(outcome.manual_expired);
        assert_eq!(controller.mode(), Mode::Auto);
        assert!(!controller.manual_info(30).active);
        assert!(matches!(outcome.action, PhaseAction::Grant { .. }));
    }

    #[test]
    fn test_apply_manual_validation() {
        let mut controller = controller();

        // AUTO mode rejects manual commands
        let err = controller
            .apply_manual(ManualCommand::NsGreen, 30, 0, false)
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidCommand(_)));

        controller.set_mode(Mode::Manual, false).unwrap();
        let err = controller
            .apply_manual(ManualCommand::NsGreen, 5, 0, false)
            .unwrap_err();
        assert!(matches!(err, ControlError::ConstraintViolation(_)));
        let err = controller
            .apply_manual(ManualCommand::NsGreen, 121, 0, false)
            .unwrap_err();
        assert!(matches!(err, ControlError::ConstraintViolation(_)));

        // Emergency blocks both set_mode and apply_manual
        let err = controller
            .apply_manual(ManualCommand::NsGreen, 30, 0, true)
            .unwrap_err();
        assert!(matches!(err, ControlError::EmergencyActive));
        let err = controller.set_mode(Mode::Auto, true).unwrap_err();
        assert!(matches!(err, ControlError::EmergencyActive));
    }

    #[test]
    fn test_set_mode_is_idempotent() {
        let mut controller = controller();
        controller.set_mode(Mode::Auto, false).unwrap();
        controller.set_mode(Mode::Auto, false).unwrap();
        assert_eq!(controller.mode(), Mode::Auto);

        controller.set_mode(Mode::Manual, false).unwrap();
        controller.set_mode(Mode::Manual, false).unwrap();
        assert_eq!(controller.mode(), Mode::Manual);
    }

    #[test]
    fn test_gap_out_after_three_empty_ticks() {
        let mut controller = controller();
        let memory = empty_memory();

        // East granted with a queue; give every road a little demand so the
        // no-demand guard stays out of the way.
        let busy = waiting_only([1, 10, 1, 1]);
        decide(&mut controller, 1, &busy, &EmergencyInfo::default(), &memory);
        assert_eq!(controller.current_green(), Some(Approach::East));

        // East drains: three consecutive empty ticks end the phase
        let drained = waiting_only([1, 0, 1, 1]);
        let o2 = decide(&mut controller, 2, &drained, &EmergencyInfo::default(), &memory);
        assert_eq!(o2.decision.method, DecisionMethod::Hold);
        let o3 = decide(&mut controller, 3, &drained, &EmergencyInfo::default(), &memory);
        assert_eq!(o3.decision.method, DecisionMethod::Hold);
        let o4 = decide(&mut controller, 4, &drained, &EmergencyInfo::default(), &memory);
        assert_eq!(o4.decision.method, DecisionMethod::GapOut);
        assert_eq!(controller.remaining_green(), 0);

        // Next tick re-runs selection
        let o5 = decide(&mut controller, 5, &drained, &EmergencyInfo::default(), &memory);
        assert!(matches!(o5.action, PhaseAction::Grant { .. }));
    }

    #[test]
    fn test_gap_out_counter_resets_on_traffic() {
        let mut controller = controller();
        let memory = empty_memory();

        let busy = waiting_only([1, 10, 1, 1]);
        decide(&mut controller, 1, &busy, &EmergencyInfo::default(), &memory);

        let drained = waiting_only([1, 0, 1, 1]);
        decide(&mut controller, 2, &drained, &EmergencyInfo::default(), &memory);
        decide(&mut controller, 3, &drained, &EmergencyInfo::default(), &memory);
        // A vehicle shows up: the counter starts over
        let refilled = waiting_only([1, 2, 1, 1]);
        decide(&mut controller, 4, &refilled, &EmergencyInfo::default(), &memory);

        let o5 = decide(&mut controller, 5, &drained, &EmergencyInfo::default(), &memory);
        assert_eq!(o5.decision.method, DecisionMethod::Hold);
    }

    #[test]
    fn test_no_demand_rests_in_all_red() {
        let mut controller = controller();
        let memory = empty_memory();
        let empty = waiting_only([0, 0, 0, 0]);

        let outcome = decide(&mut controller, 1, &empty, &EmergencyInfo::default(), &memory);
        assert_eq!(outcome.decision.method, DecisionMethod::Hold);
        assert_eq!(outcome.action, PhaseAction::NoChange);
        assert_eq!(controller.current_green(), None);
        assert!(matches!(
            controller.signal_state(),
            SignalState::AllRed { .. }
        ));
    }

    #[test]
    fn test_cross_group_grant_reports_transition() {
        let mut controller = controller();
        let memory = empty_memory();

        decide(
            &mut controller,
            1,
            &waiting_only([10, 0, 0, 0]),
            &EmergencyInfo::default(),
            &memory,
        );
        assert_eq!(controller.current_green(), Some(Approach::North));

        // Force east via emergency to cross groups
        let emergency = EmergencyInfo {
            active: true,
            approach: Some(Approach::East),
        };
        let mut crossed = false;
        for t in 2..=7 {
            decide(&mut controller, t, &waiting_only([10, 0, 0, 0]), &emergency, &memory);
            if let SignalState::Transitioning { from, to } = controller.signal_state() {
                assert_eq!(from, Approach::North);
                assert_eq!(to, Approach::East);
                crossed = true;
                break;
            }
        }
        assert!(crossed);
    }
}
