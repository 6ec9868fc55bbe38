//! Pool sizing and persisted realtime memory settings.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::atom::DEFAULT_MAX_ATOM_SIZE;
use crate::error::PoolError;
use crate::ring::DEFAULT_RING_CAPACITY;

/// Preallocation bounds for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolBounds {
    pub min_preallocated: usize,
    pub max_preallocated: usize,
}

impl PoolBounds {
    pub const EXTERNAL_NOTES: Self = Self::new(32, 152);
    pub const POST_RT_EVENTS: Self = Self::new(512, 512);

    pub const fn new(min_preallocated: usize, max_preallocated: usize) -> Self {
        Self {
            min_preallocated,
            max_preallocated,
        }
    }

    /// Bounds for per-voice event lists: a full block of events for every
    /// voice is preallocated, and the pool may grow to four times that.
    pub fn for_polyphony(voices: usize, block_size: usize) -> Self {
        let min = voices.max(1).saturating_mul(block_size.max(1));
        Self::new(min, min.saturating_mul(4))
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.min_preallocated > self.max_preallocated {
            return Err(PoolError::InvalidBounds {
                min: self.min_preallocated,
                max: self.max_preallocated,
            });
        }
        Ok(())
    }
}

/// Persisted settings for the host's realtime memory consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtMemSettings {
    /// Pool behind notes injected from the UI.
    pub external_notes: PoolBounds,
    /// Pool shared by the post-realtime event lists.
    pub post_rt_events: PoolBounds,
    /// Ring size in bytes of each atom queue.
    pub atom_queue_capacity: usize,
    /// Largest atom body accepted by the queues.
    pub max_atom_size: usize,
}

impl Default for RtMemSettings {
    fn default() -> Self {
        Self {
            external_notes: PoolBounds::EXTERNAL_NOTES,
            post_rt_events: PoolBounds::POST_RT_EVENTS,
            atom_queue_capacity: DEFAULT_RING_CAPACITY,
            max_atom_size: DEFAULT_MAX_ATOM_SIZE,
        }
    }
}

impl RtMemSettings {
    pub fn validate(&self) -> Result<(), PoolError> {
        self.external_notes.validate()?;
        self.post_rt_events.validate()?;
        if self.atom_queue_capacity < 2 {
            return Err(PoolError::RingTooSmall(self.atom_queue_capacity));
        }
        Ok(())
    }
}

fn settings_path() -> Option<PathBuf> {
    let mut base = dirs::config_dir()?;
    base.push("HarmoniqStudio");
    if !base.exists() {
        let _ = fs::create_dir_all(&base);
    }
    base.push("rtmem.json");
    Some(base)
}

/// Reads and validates settings from `path`.
pub fn load_from(path: &Path) -> anyhow::Result<RtMemSettings> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let settings: RtMemSettings = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}

/// Writes `settings` to `path` as pretty JSON.
pub fn save_to(path: &Path, settings: &RtMemSettings) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

/// Load settings from disk. Returns defaults if loading fails.
pub fn load() -> RtMemSettings {
    let Some(path) = settings_path() else {
        return RtMemSettings::default();
    };
    if !path.exists() {
        return RtMemSettings::default();
    }
    match load_from(&path) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::warn!(?err, "invalid rtmem settings, using defaults");
            RtMemSettings::default()
        }
    }
}

/// Save settings to disk.
pub fn save(settings: &RtMemSettings) {
    let Some(path) = settings_path() else {
        return;
    };
    if let Err(err) = save_to(&path, settings) {
        tracing::warn!(?err, "failed to write rtmem settings");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polyphony_bounds_scale_with_voices() {
        let bounds = PoolBounds::for_polyphony(8, 64);
        assert_eq!(bounds, PoolBounds::new(512, 2048));
        assert_eq!(PoolBounds::for_polyphony(0, 0), PoolBounds::new(1, 4));
        assert!(bounds.validate().is_ok());
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let err = PoolBounds::new(10, 2).validate().unwrap_err();
        assert_eq!(err, PoolError::InvalidBounds { min: 10, max: 2 });
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtmem.json");
        let settings = RtMemSettings {
            external_notes: PoolBounds::new(16, 64),
            max_atom_size: 1024,
            ..RtMemSettings::default()
        };
        save_to(&path, &settings).unwrap();
        assert_eq!(load_from(&path).unwrap(), settings);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtmem.json");
        fs::write(&path, r#"{ "max_atom_size": 256 }"#).unwrap();
        let settings = load_from(&path).unwrap();
        assert_eq!(settings.max_atom_size, 256);
        assert_eq!(settings.post_rt_events, PoolBounds::POST_RT_EVENTS);
    }

    #[test]
    fn invalid_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtmem.json");
        fs::write(&path, "not json").unwrap();
        assert!(load_from(&path).is_err());

        let inverted = r#"{ "external_notes": { "min_preallocated": 9, "max_preallocated": 1 } }"#;
        fs::write(&path, inverted).unwrap();
        let err = load_from(&path).unwrap_err();
        assert!(err.downcast_ref::<PoolError>().is_some());

        assert!(load_from(&dir.path().join("absent.json")).is_err());
    }
}
