// src/config.rs
//
// Runtime configuration. Loaded once at startup from YAML; every section
// has defaults so a missing file or section never aborts the process.

use crate::types::Approach;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub simulator: SimulatorConfig,
    pub control: ControllerConfig,
    pub memory: MemoryConfig,
    pub events: EventLogConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Config::default())
        }
    }
}

/// Simulator addressing and the built-in synthetic backend's knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Opaque endpoint string handed to the backend (a scenario file path
    /// for an external simulator; ignored by the synthetic backend).
    pub endpoint: String,
    /// RNG seed for the synthetic backend. Fixed seed = reproducible runs.
    pub seed: u64,
    /// Mean demand per approach in vehicles per minute (synthetic backend).
    pub demand_vpm: DemandProfile,
    /// Inject an emergency vehicle at this simulated second, if set.
    pub emergency_at_sec: Option<u64>,
    pub emergency_approach: Approach,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            seed: 42,
            demand_vpm: DemandProfile::default(),
            emergency_at_sec: None,
            emergency_approach: Approach::South,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemandProfile {
    pub north: f64,
    pub east: f64,
    pub south: f64,
    pub west: f64,
}

impl DemandProfile {
    pub fn get(&self, approach: Approach) -> f64 {
        match approach {
            Approach::North => self.north,
            Approach::East => self.east,
            Approach::South => self.south,
            Approach::West => self.west,
        }
    }
}

impl Default for DemandProfile {
    fn default() -> Self {
        // Asymmetric by default so the controller has something to adapt to
        Self {
            north: 10.0,
            east: 5.0,
            south: 14.0,
            west: 6.0,
        }
    }
}

/// Decision-controller tuning. Weights for the composite score live with the
/// controller itself; these are the operational limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Seconds between scheduled phase re-evaluations.
    pub decision_cycle_secs: u32,
    pub min_green_secs: u32,
    pub max_green_secs: u32,
    /// Floor applied to greens granted by emergency preemption.
    pub emergency_min_green_secs: u32,
    /// Starvation protection threshold: max seconds an approach stays red.
    pub max_red_secs: u32,
    /// Consecutive empty ticks on the served approach before gap-out.
    pub gap_out_ticks: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            decision_cycle_secs: 5,
            min_green_secs: 10,
            max_green_secs: 60,
            emergency_min_green_secs: 15,
            max_red_secs: 90,
            gap_out_ticks: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Experience store path. `None` keeps experience in memory only.
    pub path: Option<String>,
    /// In-memory record cap; oldest records are evicted past this.
    pub capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            path: Some("data/memory.jsonl".to_string()),
            capacity: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Event log path (JSONL). `None` disables persisted events.
    pub path: Option<String>,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: Some("data/events.jsonl".to_string()),
        }
    }
}
