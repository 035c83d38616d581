// src/config.rs
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::detect::DetectorConfig;
use crate::gesture::ClassifierConfig;
use crate::tracking::FlowConfig;

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CasterConfig {
    pub camera: CameraConfig,
    pub preprocess: PreprocessConfig,
    pub detector: DetectorConfig,
    pub tracker: FlowConfig,
    pub classifier: ClassifierConfig,
    pub session: SessionConfig,
    pub actuator: ActuatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Mirror frames horizontally so the overlay matches the caster's view.
    pub mirror: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: 640,
            height: 480,
            fps: 24,
            mirror: true,
        }
    }
}

/// Optional grayscale conditioning, applied as equalize, blur, dilate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub equalize: bool,
    pub blur_sigma: Option<f32>,
    pub dilate_radius: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultPolicy {
    /// End the session and release the camera and viewer.
    Close,
    /// Drop the epoch and go back to detection.
    Restart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub epoch_ms: u64,
    /// Displacements at or above this many pixels are classified but not traced.
    pub movement_threshold: f32,
    pub window_title: String,
    pub fault_policy: FaultPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            epoch_ms: 3000,
            movement_threshold: 80.0,
            window_title: "Wand Caster".to_string(),
            fault_policy: FaultPolicy::Close,
        }
    }
}

impl SessionConfig {
    pub fn epoch(&self) -> Duration {
        Duration::from_millis(self.epoch_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActuatorBackend {
    DryRun,
    Pigpio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    pub backend: ActuatorBackend,
    /// pigpio daemon socket address.
    pub address: String,
    pub switch_pin: u32,
    pub trinket_pin: u32,
    pub pulse_hold_ms: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            backend: ActuatorBackend::DryRun,
            address: "127.0.0.1:8888".to_string(),
            switch_pin: 16,
            trinket_pin: 12,
            pulse_hold_ms: 1000,
        }
    }
}

impl ActuatorConfig {
    pub fn pulse_hold(&self) -> Duration {
        Duration::from_millis(self.pulse_hold_ms)
    }
}

impl CasterConfig {
    /// Loads `path` if given, else the per-user config file if it exists,
    /// else the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        tracing::debug!("loaded config from {}", path.display());
        Ok(config)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "wandcaster", "wand_caster")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_wand_rig() {
        let config = CasterConfig::default();
        assert_eq!((config.camera.width, config.camera.height), (640, 480));
        assert_eq!(config.camera.fps, 24);
        assert_eq!(config.session.epoch(), Duration::from_secs(3));
        assert_eq!(config.session.movement_threshold, 80.0);
        assert_eq!(config.session.fault_policy, FaultPolicy::Close);
        assert_eq!(config.actuator.switch_pin, 16);
        assert_eq!(config.actuator.trinket_pin, 12);
        assert_eq!(config.actuator.pulse_hold(), Duration::from_secs(1));
        assert_eq!(config.classifier.max_classified_tracks, 15);
        assert_eq!(config.detector.max_candidates, 20);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "session": {{ "epoch_ms": 1500, "fault_policy": "restart" }},
                 "actuator": {{ "backend": "pigpio", "address": "10.0.0.2:8888" }} }}"#
        )
        .unwrap();

        let config = CasterConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.session.epoch(), Duration::from_millis(1500));
        assert_eq!(config.session.fault_policy, FaultPolicy::Restart);
        assert_eq!(config.session.movement_threshold, 80.0);
        assert_eq!(config.actuator.backend, ActuatorBackend::Pigpio);
        assert_eq!(config.actuator.address, "10.0.0.2:8888");
        assert_eq!(config.actuator.switch_pin, 16);
        assert_eq!(config.camera.width, 640);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(CasterConfig::load(Some(file.path())).is_err());
    }
}
