// src/prediction.rs
//
// Short-horizon traffic forecasting: queue trends, arrival forecasts, a
// heavy-traffic probability heuristic, and an adjusted clearance ETA.
// Lightweight and explainable; no learned model.

use crate::types::{
    Approach, ApproachMap, CongestionLevel, MetricsSet, Prediction, PredictionSet, QueueTrend,
};
use std::collections::VecDeque;

/// Seconds of queue history kept per approach.
const HISTORY_WINDOW_SECS: u64 = 30;
/// Absolute queue delta separating increasing/decreasing from stable.
const TREND_DELTA: f64 = 2.0;

// Heavy-traffic probability weights
const WEIGHT_CONGESTION: f64 = 0.5;
const WEIGHT_TREND: f64 = 0.3;
const WEIGHT_FLOW: f64 = 0.2;
/// Net flow (arrival − departure, vpm) treated as saturating.
const FLOW_SPAN_VPM: f64 = 30.0;

const PROBABILITY_MEDIUM: f64 = 30.0;
const PROBABILITY_HIGH: f64 = 60.0;

pub struct TrafficPredictor {
    queue_history: ApproachMap<VecDeque<(u64, u32)>>,
}

impl TrafficPredictor {
    pub fn new() -> Self {
        Self {
            queue_history: ApproachMap::default(),
        }
    }

    /// Compute predictions for all approaches. Appends the current waiting
    /// counts to the per-approach history first; entries older than 30
    /// seconds are evicted.
    pub fn predict(&mut self, metrics: &MetricsSet, now: u64) -> PredictionSet {
        for approach in Approach::ALL {
            let history = self.queue_history.get_mut(approach);
            history.push_back((now, metrics.get(approach).waiting_count));
            let cutoff = now.saturating_sub(HISTORY_WINDOW_SECS);
            while history.front().is_some_and(|&(t, _)| t < cutoff) {
                history.pop_front();
            }
        }

        ApproachMap::from_fn(|approach| self.predict_approach(approach, metrics))
    }

    fn predict_approach(&self, approach: Approach, metrics: &MetricsSet) -> Prediction {
        let m = metrics.get(approach);
        let (slope, queue_trend) = self.trend(approach);

        let arrivals_10s = m.arrival_rate_vpm / 6.0;
        let arrivals_30s = m.arrival_rate_vpm / 2.0;

        let heavy_traffic_probability = self.heavy_probability(m, queue_trend);
        let congestion_level = Self::classify(heavy_traffic_probability);

        // Growing queues push the clearance estimate out
        let predicted_eta_clear_seconds = if queue_trend == QueueTrend::Increasing {
            m.eta_clear_seconds + slope.max(0.0) * 10.0
        } else {
            m.eta_clear_seconds
        };

        Prediction {
            queue_trend,
            arrivals_10s,
            arrivals_30s,
            heavy_traffic_probability,
            congestion_level,
            predicted_eta_clear_seconds,
        }
    }

    /// Raw queue slope (vehicles/second) and trend class from the delta
    /// between the newest and oldest history entries.
    fn trend(&self, approach: Approach) -> (f64, QueueTrend) {
        let history = self.queue_history.get(approach);
        let (Some(&(t_old, q_old)), Some(&(t_new, q_new))) = (history.front(), history.back())
        else {
            return (0.0, QueueTrend::Stable);
        };
        if history.len() < 2 {
            return (0.0, QueueTrend::Stable);
        }

        let delta = q_new as f64 - q_old as f64;
        let span = (t_new.saturating_sub(t_old)).max(1) as f64;
        let slope = delta / span;

        let class = if delta > TREND_DELTA {
            QueueTrend::Increasing
        } else if delta < -TREND_DELTA {
            QueueTrend::Decreasing
        } else {
            QueueTrend::Stable
        };
        (slope, class)
    }

    fn heavy_probability(&self, m: &crate::types::RoadMetrics, trend: QueueTrend) -> f64 {
        let c_norm = m.congestion_percent / 100.0;
        let t_norm: f64 = match trend {
            QueueTrend::Increasing => 1.0,
            QueueTrend::Stable => 0.0,
            QueueTrend::Decreasing => -1.0,
        };
        let t_norm = t_norm.max(0.0);
        let f_norm =
            ((m.arrival_rate_vpm - m.departure_rate_vpm) / FLOW_SPAN_VPM).clamp(0.0, 1.0);

        let p = 100.0 * (WEIGHT_CONGESTION * c_norm + WEIGHT_TREND * t_norm + WEIGHT_FLOW * f_norm);
        p.clamp(0.0, 100.0)
    }

    fn classify(probability: f64) -> CongestionLevel {
        if probability >= PROBABILITY_HIGH {
            CongestionLevel::High
        } else if probability >= PROBABILITY_MEDIUM {
            CongestionLevel::Medium
        } else {
            CongestionLevel::Low
        }
    }

    pub fn reset(&mut self) {
        self.queue_history = ApproachMap::default();
    }
}
