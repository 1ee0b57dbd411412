// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::Samples;
use crate::allocator::SlotId;

/// Module specific constants used for rendering and memory management.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleTraits {
    /// Number of hardware waveform slots.
    pub slot_count: usize,
    pub channel_count: u32,
    /// Sample rate at rate divisor 0.
    pub max_sample_rate: f64,
    /// Rate divisor `n >= 1` plays at `divided_base_rate / n`.
    pub divided_base_rate: f64,
    /// Maximum output amplitude in volts.
    pub max_amplitude: f64,
}

pub const M3202A_TRAITS: ModuleTraits = ModuleTraits {
    slot_count: 50,
    channel_count: 4,
    max_sample_rate: 1e9,
    divided_base_rate: 200e6,
    max_amplitude: 1.5,
};

impl ModuleTraits {
    pub fn sample_rate(&self, rate_divisor: u32) -> f64 {
        if rate_divisor == 0 {
            self.max_sample_rate
        } else {
            self.divided_base_rate / f64::from(rate_divisor)
        }
    }

    /// Duration of one sample played at `rate_divisor`, in samples at the maximum rate.
    pub fn ticks_per_sample(&self, rate_divisor: u32) -> Samples {
        (self.max_sample_rate / self.sample_rate(rate_divisor)).round() as Samples
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKind {
    #[default]
    M3202A,
}

impl ModuleKind {
    pub fn traits(&self) -> &'static ModuleTraits {
        match self {
            ModuleKind::M3202A => &M3202A_TRAITS,
        }
    }
}

/// How a waveform queue entry is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Wait for the software / trigger program start.
    External,
    /// Start as soon as the previous entry has finished.
    Auto,
}

impl TriggerMode {
    /// Value written to the driver's queue configuration.
    pub fn driver_code(self) -> u32 {
        match self {
            TriggerMode::Auto => 0,
            TriggerMode::External => 1,
        }
    }
}

/// Driver of one physical AWG module.
///
/// Channels are addressed by their hardware channel number.
pub trait AwgModule: Send + Sync {
    fn name(&self) -> &str;

    fn traits(&self) -> &ModuleTraits;

    fn set_output_range(&self, channel: u32, min: f64, max: f64) -> anyhow::Result<()>;

    fn configure_queue(
        &self,
        channel: u32,
        slot: SlotId,
        trigger: TriggerMode,
        start_delay: u32,
        repeat_count: u32,
        rate_divisor: u32,
    ) -> anyhow::Result<()>;

    fn flush_queue(&self, channel: u32) -> anyhow::Result<()>;
}
