// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Static configuration of the upload engine and its channels.
use std::collections::HashSet;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::Samples;
use crate::device_traits::ModuleKind;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct SanitizationChange {
    pub field: &'static str,
    pub original: String,
    pub sanitized: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderSettings {
    /// Compensation pulses are a multiple of this many samples.
    pub compensation_granularity: Samples,
    /// Idle wait of the worker when the queue is empty.
    pub idle_backoff_ms: u64,
    /// Wait before a pending job is escalated during playback lookup.
    pub lookup_grace_ms: u64,
    /// Priority added to a pending job on each escalation.
    pub escalation_step: i64,
    pub await_timeout_ms: u64,
    /// Number of failed uploads remembered for playback lookups.
    pub max_failed_records: usize,
}

impl Default for UploaderSettings {
    fn default() -> Self {
        UploaderSettings {
            compensation_granularity: 10,
            idle_backoff_ms: 5,
            lookup_grace_ms: 50,
            escalation_step: 100,
            await_timeout_ms: 1000,
            max_failed_records: 64,
        }
    }
}

impl UploaderSettings {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Configuration(e.to_string()))
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn lookup_grace(&self) -> Duration {
        Duration::from_millis(self.lookup_grace_ms)
    }

    pub fn await_timeout(&self) -> Duration {
        Duration::from_millis(self.await_timeout_ms)
    }

    /// Replace values the engine cannot run with and report what was changed.
    pub fn sanitize(&mut self) -> Vec<SanitizationChange> {
        let defaults = UploaderSettings::default();
        let mut changes = vec![];
        let non_zero = [
            (
                "compensation_granularity",
                &mut self.compensation_granularity,
                1,
            ),
            ("idle_backoff_ms", &mut self.idle_backoff_ms, 1),
            ("lookup_grace_ms", &mut self.lookup_grace_ms, 1),
        ];
        for (field, value, sanitized) in non_zero {
            if *value == 0 {
                changes.push(SanitizationChange {
                    field,
                    original: value.to_string(),
                    sanitized: sanitized.to_string(),
                    reason: "Must be greater than zero.".to_string(),
                });
                *value = sanitized;
            }
        }
        if self.escalation_step <= 0 {
            changes.push(SanitizationChange {
                field: "escalation_step",
                original: self.escalation_step.to_string(),
                sanitized: defaults.escalation_step.to_string(),
                reason: "Escalation must raise the priority.".to_string(),
            });
            self.escalation_step = defaults.escalation_step;
        }
        changes
    }
}

/// Location and limits of one AWG output channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    /// Name of the module the channel lives on.
    pub module: String,
    pub channel_number: u32,
    #[serde(default)]
    pub module_kind: ModuleKind,
    /// Samples prepended to the first and appended to the last segment.
    #[serde(default)]
    pub delay: (Samples, Samples),
    /// Maximum output amplitude in volts, the module maximum when unset.
    #[serde(default)]
    pub amplitude: Option<f64>,
    /// Voltage range available for DC compensation pulses.
    #[serde(default)]
    pub compensation_limits: Option<(f64, f64)>,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, module: impl Into<String>, channel_number: u32) -> Self {
        ChannelConfig {
            name: name.into(),
            module: module.into(),
            channel_number,
            module_kind: ModuleKind::default(),
            delay: (0, 0),
            amplitude: None,
            compensation_limits: None,
        }
    }

    pub fn with_delay(mut self, pre: Samples, post: Samples) -> Self {
        self.delay = (pre, post);
        self
    }

    pub fn with_amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = Some(amplitude);
        self
    }

    pub fn with_compensation_limits(mut self, min: f64, max: f64) -> Self {
        self.compensation_limits = Some((min, max));
        self
    }

    /// Amplitude limit used when converting samples for upload.
    pub fn amplitude_limit(&self) -> f64 {
        self.amplitude
            .unwrap_or(self.module_kind.traits().max_amplitude)
    }

    fn validate(&self) -> Result<()> {
        let traits = self.module_kind.traits();
        if self.channel_number == 0 || self.channel_number > traits.channel_count {
            return Err(Error::Configuration(format!(
                "Channel '{}': channel number {} is outside 1..={}",
                self.name, self.channel_number, traits.channel_count
            )));
        }
        if let Some(amplitude) = self.amplitude {
            if !(amplitude > 0.0 && amplitude <= traits.max_amplitude) {
                return Err(Error::Configuration(format!(
                    "Channel '{}': amplitude {} V is outside (0, {}]",
                    self.name, amplitude, traits.max_amplitude
                )));
            }
        }
        if let Some((min, max)) = self.compensation_limits {
            if !(min.is_finite() && max.is_finite() && min <= 0.0 && max >= 0.0) {
                return Err(Error::Configuration(format!(
                    "Channel '{}': compensation limits ({min}, {max}) must enclose 0 V",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Ordered mapping of channel names to their configuration.
#[derive(Debug, Clone, Default)]
pub struct ChannelMap {
    channels: IndexMap<String, ChannelConfig>,
}

impl ChannelMap {
    pub fn new(configs: impl IntoIterator<Item = ChannelConfig>) -> Result<Self> {
        let mut channels = IndexMap::new();
        let mut locations = HashSet::new();
        for config in configs {
            config.validate()?;
            if !locations.insert((config.module.clone(), config.channel_number)) {
                return Err(Error::Configuration(format!(
                    "Channel '{}': {} channel {} is already assigned",
                    config.name, config.module, config.channel_number
                )));
            }
            if channels.contains_key(&config.name) {
                return Err(Error::Configuration(format!(
                    "Duplicate channel name '{}'",
                    config.name
                )));
            }
            channels.insert(config.name.clone(), config);
        }
        Ok(ChannelMap { channels })
    }

    /// Parse a JSON array of channel configurations.
    pub fn from_json(json: &str) -> Result<Self> {
        let configs: Vec<ChannelConfig> =
            serde_json::from_str(json).map_err(|e| Error::Configuration(e.to_string()))?;
        Self::new(configs)
    }

    pub fn get(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChannelConfig)> {
        self.channels.iter().map(|(name, cfg)| (name.as_str(), cfg))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        let mut seen = HashSet::new();
        self.channels
            .values()
            .map(|cfg| cfg.module.as_str())
            .filter(move |module| seen.insert(*module))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
