// src/memory.rs
//
// Experience memory: append-only (state, action, reward) records with
// similarity-based recall. Matches are weighted by cosine similarity and an
// exponential age decay so stale experience fades out of decisions.

use crate::types::{Approach, ApproachMap, MetricsSet};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Six metrics per approach, four approaches, fixed N,E,S,W order.
pub const STATE_VECTOR_LEN: usize = 24;

/// Minimum cosine similarity for a usable match.
const SIMILARITY_THRESHOLD: f64 = 0.5;
/// Matches retrieved per query.
const TOP_K: usize = 5;
/// Age decay time constant (seconds).
const DECAY_TAU_SECS: f64 = 900.0;
/// Best combined weight required before memory drives a decision.
const CONFIDENCE_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceRecord {
    pub state_vector: Vec<f64>,
    pub chosen_approach: Approach,
    pub reward: f64,
    /// Simulation time the experience was recorded.
    pub timestamp: u64,
    #[serde(default)]
    pub note: String,
}

/// Flatten a metric set into the 24-float state vector.
pub fn state_vector(metrics: &MetricsSet) -> Vec<f64> {
    let mut vector = Vec::with_capacity(STATE_VECTOR_LEN);
    for approach in Approach::ALL {
        let m = metrics.get(approach);
        vector.extend_from_slice(&[
            m.waiting_count as f64,
            m.avg_wait_time,
            m.congestion_percent,
            m.time_since_last_green,
            m.arrival_rate_vpm,
            m.departure_rate_vpm,
        ]);
    }
    vector
}

#[derive(Debug, Clone)]
pub struct ScoredMatch {
    pub similarity: f64,
    pub decay: f64,
    pub record: ExperienceRecord,
}

impl ScoredMatch {
    pub fn weight(&self) -> f64 {
        self.similarity * self.decay
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RewardStat {
    pub weighted_reward: f64,
    pub matches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemorySummary {
    pub records: usize,
    pub count_by_approach: ApproachMap<usize>,
    pub avg_reward_by_approach: ApproachMap<f64>,
    pub best_approach: Option<Approach>,
}

pub struct ExperienceMemory {
    records: VecDeque<ExperienceRecord>,
    capacity: usize,
    path: Option<PathBuf>,
}

impl ExperienceMemory {
    /// Volatile store, no file backing.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
            path: None,
        }
    }

    /// File-backed store. Existing records are loaded; lines that fail to
    /// parse are skipped so format evolution never blocks startup.
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut records = VecDeque::new();
        if path.exists() {
            let file = fs::File::open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            for line in BufReader::new(file).lines() {
                let line = line.unwrap_or_default();
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ExperienceRecord>(&line) {
                    Ok(record) => records.push_back(record),
                    Err(e) => debug!("skipping unreadable experience record: {e}"),
                }
            }
        }

        let capacity = capacity.max(1);
        while records.len() > capacity {
            records.pop_front();
        }

        Ok(Self {
            records,
            capacity,
            path: Some(path),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append one experience. The in-memory copy is authoritative; a failed
    /// file append is logged and otherwise ignored.
    pub fn record(
        &mut self,
        state_vector: Vec<f64>,
        chosen_approach: Approach,
        reward: f64,
        now: u64,
        note: impl Into<String>,
    ) {
        let record = ExperienceRecord {
            state_vector,
            chosen_approach,
            reward,
            timestamp: now,
            note: note.into(),
        };

        if let Some(path) = &self.path {
            if let Err(e) = append_line(path, &record) {
                warn!("experience store write failed: {e}");
            }
        }

        self.records.push_back(record);
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    /// Up to `TOP_K` records with cosine similarity above the threshold,
    /// ranked by similarity x age decay.
    pub fn find_similar(&self, state: &[f64], now: u64) -> Vec<ScoredMatch> {
        let mut matches: Vec<ScoredMatch> = self
            .records
            .iter()
            .filter_map(|record| {
                let similarity = cosine_similarity(state, &record.state_vector);
                if similarity < SIMILARITY_THRESHOLD {
                    return None;
                }
                Some(ScoredMatch {
                    similarity,
                    decay: decay_factor(record.timestamp, now),
                    record: record.clone(),
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.weight()
                .partial_cmp(&a.weight())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(TOP_K);
        matches
    }

    /// A memory-based decision is trusted only when the best match carries
    /// enough combined weight.
    pub fn is_confident(matches: &[ScoredMatch]) -> bool {
        matches
            .first()
            .is_some_and(|best| best.weight() >= CONFIDENCE_THRESHOLD)
    }

    /// Weighted mean reward per approach over a match set.
    pub fn weighted_rewards_by_approach(matches: &[ScoredMatch]) -> ApproachMap<RewardStat> {
        let mut sums: ApproachMap<(f64, f64, usize)> = ApproachMap::default();
        for m in matches {
            let entry = sums.get_mut(m.record.chosen_approach);
            entry.0 += m.record.reward * m.weight();
            entry.1 += m.weight();
            entry.2 += 1;
        }
        ApproachMap::from_fn(|approach| {
            let (reward_sum, weight_sum, count) = *sums.get(approach);
            RewardStat {
                weighted_reward: if weight_sum > 1e-9 {
                    reward_sum / weight_sum
                } else {
                    0.0
                },
                matches: count,
            }
        })
    }

    /// Diagnostic aggregate over the whole store.
    pub fn summary(&self) -> MemorySummary {
        let mut count_by_approach: ApproachMap<usize> = ApproachMap::default();
        let mut reward_sums: ApproachMap<f64> = ApproachMap::default();
        for record in &self.records {
            *count_by_approach.get_mut(record.chosen_approach) += 1;
            *reward_sums.get_mut(record.chosen_approach) += record.reward;
        }

        let avg_reward_by_approach = ApproachMap::from_fn(|approach| {
            let count = *count_by_approach.get(approach);
            if count > 0 {
                reward_sums.get(approach) / count as f64
            } else {
                0.0
            }
        });

        let best_approach = Approach::ALL
            .iter()
            .filter(|&&a| *count_by_approach.get(a) > 0)
            .max_by(|&&a, &&b| {
                avg_reward_by_approach
                    .get(a)
                    .partial_cmp(avg_reward_by_approach.get(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied();

        MemorySummary {
            records: self.records.len(),
            count_by_approach,
            avg_reward_by_approach,
            best_approach,
        }
    }
}

fn append_line(path: &PathBuf, record: &ExperienceRecord) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let line = serde_json::to_string(record)?;
    writeln!(file, "{line}")?;
    Ok(())
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if mag_a < 1e-12 || mag_b < 1e-12 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

/// exp(-age / tau); clock skew into the future decays nothing.
fn decay_factor(recorded_at: u64, now: u64) -> f64 {
    let age = now.saturating_sub(recorded_at) as f64;
    (-age / DECAY_TAU_SECS).exp()
}
