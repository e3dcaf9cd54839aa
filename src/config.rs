use std::env;
use std::time::Duration;

use tracing::warn;

use crate::scheduler::SchedulerMode;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_opt(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable setting, using default");
            default
        }),
        None => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_opt(key).as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        Some(other) => {
            warn!(key, value = other, "unparseable flag, using default");
            default
        }
        None => default,
    }
}

/// Configuration for a `TimeAuthority` and the clocks it creates.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub mode: SchedulerMode,
    /// Seed for the root generator of every clock worker thread.
    pub seed: String,
    /// Below this remaining wait a realtime worker spins instead of parking.
    pub spin_threshold: Duration,
    /// Offline: run entries scheduled during an advance in that same
    /// advance when they fall inside it. Off holds them for the next one.
    pub recursive_offline: bool,
    /// Offline: give up an advance after this many clock slices.
    pub max_offline_slices: usize,
    /// Tempo of new tempo clocks, in beats per second.
    pub default_tempo: f64,
    pub default_beats_per_bar: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::Realtime,
            seed: "default".to_string(),
            spin_threshold: Duration::from_millis(1),
            recursive_offline: true,
            max_offline_slices: 200_000,
            default_tempo: 1.0,
            default_beats_per_bar: 4.0,
        }
    }
}

impl EngineConfig {
    /// Offline defaults; handy for tests and rendering.
    pub fn offline() -> Self {
        Self {
            mode: SchedulerMode::Offline,
            ..Self::default()
        }
    }

    /// Read `CLOCKS_*` variables, falling back to the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        let mode = match env_or("CLOCKS_MODE", "realtime").parse() {
            Ok(mode) => mode,
            Err(other) => {
                warn!(mode = %other, "unknown CLOCKS_MODE, using realtime");
                d.mode
            }
        };
        let spin_us = env_parse(
            "CLOCKS_SPIN_THRESHOLD_US",
            d.spin_threshold.as_micros() as u64,
        );
        let tempo = env_parse("CLOCKS_TEMPO", d.default_tempo);
        let beats_per_bar = env_parse("CLOCKS_BEATS_PER_BAR", d.default_beats_per_bar);

        Self {
            mode,
            seed: env_or("CLOCKS_SEED", &d.seed),
            spin_threshold: Duration::from_micros(spin_us),
            recursive_offline: env_bool("CLOCKS_RECURSIVE", d.recursive_offline),
            max_offline_slices: env_parse("CLOCKS_MAX_SLICES", d.max_offline_slices),
            default_tempo: if tempo.is_finite() && tempo > 0.0 {
                tempo
            } else {
                d.default_tempo
            },
            default_beats_per_bar: if beats_per_bar.is_finite() && beats_per_bar > 0.0 {
                beats_per_bar
            } else {
                d.default_beats_per_bar
            },
        }
    }
}
