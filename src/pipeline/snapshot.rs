// src/pipeline/snapshot.rs
//
// Read-only view of one control tick, published to observers. The publish
// path never blocks the control loop: the watch cell holds only the latest
// value and lagging stream subscribers skip ahead instead of stalling the
// sender.

use crate::types::{
    ApproachMap, DecisionInfo, EmergencyInfo, ManualInfo, MetricsSet, Mode, PredictionSet,
    SignalState, VehicleCounts,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

/// Streamed snapshots buffered per subscriber before old entries drop.
const STREAM_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSummary {
    /// "N" | "E" | "S" | "W" | "none"
    pub green_approach: String,
    pub remaining_seconds: u32,
    pub state: SignalState,
}

impl SignalSummary {
    pub fn from_state(state: SignalState) -> Self {
        Self {
            green_approach: state
                .green_approach()
                .map(|a| a.letter().to_string())
                .unwrap_or_else(|| "none".to_string()),
            remaining_seconds: state.remaining(),
            state,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: u64,
    pub signal: SignalSummary,
    pub mode: Mode,
    pub manual: ManualInfo,
    pub emergency: EmergencyInfo,
    pub decision: DecisionInfo,
    pub counts: ApproachMap<VehicleCounts>,
    pub queues: ApproachMap<u32>,
    pub metrics: MetricsSet,
    pub prediction: PredictionSet,
}

impl Snapshot {
    /// Pre-start placeholder returned by `get_status` before the first tick.
    pub fn idle() -> Self {
        Self {
            time: 0,
            signal: SignalSummary::from_state(SignalState::AllRed { remaining: 0 }),
            mode: Mode::Auto,
            manual: ManualInfo::default(),
            emergency: EmergencyInfo::default(),
            decision: DecisionInfo::idle(),
            counts: ApproachMap::default(),
            queues: ApproachMap::default(),
            metrics: MetricsSet::default(),
            prediction: PredictionSet::default(),
        }
    }
}

/// Fan-out for snapshots: a watch cell with the latest value plus a
/// broadcast stream for subscribers that want every tick.
pub struct SnapshotPublisher {
    watch_tx: watch::Sender<Snapshot>,
    stream_tx: broadcast::Sender<Snapshot>,
}

impl SnapshotPublisher {
    pub fn new() -> (Self, watch::Receiver<Snapshot>) {
        let (watch_tx, watch_rx) = watch::channel(Snapshot::idle());
        let (stream_tx, _) = broadcast::channel(STREAM_CAPACITY);
        (
            Self {
                watch_tx,
                stream_tx,
            },
            watch_rx,
        )
    }

    /// Never blocks: absent or slow subscribers are not the loop's problem.
    pub fn publish(&self, snapshot: Snapshot) {
        let _ = self.stream_tx.send(snapshot.clone());
        self.watch_tx.send_replace(snapshot);
    }

    pub fn stream_sender(&self) -> broadcast::Sender<Snapshot> {
        self.stream_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_summary_strings() {
        let green = SignalSummary::from_state(SignalState::Green {
            approach: crate::types::Approach::East,
            remaining: 12,
        });
        assert_eq!(green.green_approach, "E");
        assert_eq!(green.remaining_seconds, 12);

        let red = SignalSummary::from_state(SignalState::AllRed { remaining: 1 });
        assert_eq!(red.green_approach, "none");
    }

    #[test]
    fn test_publish_updates_watch_and_stream() {
        let (publisher, watch_rx) = SnapshotPublisher::new();
        let mut stream = publisher.stream_sender().subscribe();

        let mut snapshot = Snapshot::idle();
        snapshot.time = 42;
        publisher.publish(snapshot);

        assert_eq!(watch_rx.borrow().time, 42);
        assert_eq!(stream.try_recv().unwrap().time, 42);
    }

    #[test]
    fn test_lagging_subscriber_skips_instead_of_stalling() {
        let (publisher, _watch_rx) = SnapshotPublisher::new();
        let mut stream = publisher.stream_sender().subscribe();

        // Overrun the per-subscriber buffer without ever reading
        for t in 0..(STREAM_CAPACITY as u64 + 10) {
            let mut snapshot = Snapshot::idle();
            snapshot.time = t;
            publisher.publish(snapshot);
        }

        // The reader observes a lag marker, then resumes at a newer entry
        match stream.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => assert!(skipped > 0),
            other => panic!("expected lag, got {other:?}"),
        }
        assert!(stream.try_recv().unwrap().time >= 10);
    }

    #[test]
    fn test_snapshot_schema_keys() {
        let json = serde_json::to_value(Snapshot::idle()).unwrap();
        for key in [
            "time", "signal", "mode", "manual", "emergency", "decision", "counts", "queues",
            "metrics", "prediction",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(json["signal"]["green_approach"], "none");
        assert_eq!(json["mode"], "AUTO");
        assert_eq!(json["decision"]["method"], "idle");
        // Four approach keys in each per-approach map
        assert!(json["metrics"]["north"].is_object());
        assert!(json["prediction"]["west"].is_object());
    }
}
