//! Configuration management for igf.
//!
//! This module provides:
//! - TOML-based configuration with logical sections
//! - Atomic file writes (write to temp, then rename)
//! - Single-key updates that rewrite one section and keep user comments
//! - Validation on load with automatic defaults
//! - Field-level diffs that feed the stage change counters
//!
//! # Example
//!
//! ```no_run
//! use igf_core::config::ConfigManager;
//!
//! let mut config = ConfigManager::new(".config/igf.toml");
//! config.load_or_create().unwrap();
//!
//! println!("Frame rate: {}", config.settings().timing.frame_rate);
//!
//! config.set_value("timing.frame_rate", "15").unwrap();
//! ```

mod manager;
mod settings;

pub use manager::{ConfigError, ConfigManager, ConfigResult};
pub use settings::{
    BehaviorSettings, CaptionPosition, CaptionSettings, ConfigSection, EffectsSettings,
    FrameTiming, LoggingSettings, OutputKind, OutputSettings, PathSettings, Settings,
    SizeSettings, TimingSettings, MAX_FRAMES, RANDOM_START,
};
