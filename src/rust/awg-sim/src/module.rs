// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};

use awg_log::debug;
use awg_uploader::Result;
use awg_uploader::allocator::{SlotAllocator, SlotId, WaveformReference};
use awg_uploader::device_traits::{AwgModule, ModuleKind, ModuleTraits, TriggerMode};

use crate::{EventLog, SimEvent, lock};

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub slot: SlotId,
    pub trigger: TriggerMode,
    pub start_delay: u32,
    pub repeat: u32,
    pub rate_divisor: u32,
}

#[derive(Debug, Default)]
struct ChannelState {
    // (amplitude, offset)
    output: Option<(f64, f64)>,
    queue: Vec<QueueEntry>,
}

/// An M3202A-like module with host-side waveform memory.
#[derive(Debug)]
pub struct SimulatedModule {
    name: String,
    traits: ModuleTraits,
    allocator: Arc<SlotAllocator>,
    channels: Mutex<HashMap<u32, ChannelState>>,
    log: EventLog,
}

impl SimulatedModule {
    pub fn new(name: impl Into<String>, kind: ModuleKind, log: EventLog) -> Self {
        let traits = kind.traits().clone();
        Self::with_traits(name, traits, log)
    }

    pub fn with_traits(name: impl Into<String>, traits: ModuleTraits, log: EventLog) -> Self {
        let name = name.into();
        let allocator = Arc::new(SlotAllocator::new(name.clone(), traits.slot_count));
        SimulatedModule {
            name,
            traits,
            allocator,
            channels: Mutex::new(HashMap::new()),
            log,
        }
    }

    pub fn allocator(&self) -> &Arc<SlotAllocator> {
        &self.allocator
    }

    /// Store a waveform in a free slot.
    pub fn upload_waveform(&self, samples: Vec<i16>) -> Result<WaveformReference> {
        let waveform = WaveformReference::allocate(&self.allocator, samples)?;
        debug!(
            "{}.upload_waveform({}, {})",
            self.name,
            waveform.slot(),
            waveform.size()
        );
        Ok(waveform)
    }

    pub fn queue(&self, channel: u32) -> Vec<QueueEntry> {
        lock(&self.channels)
            .get(&channel)
            .map(|state| state.queue.clone())
            .unwrap_or_default()
    }

    /// (amplitude, offset) last programmed on `channel`.
    pub fn output(&self, channel: u32) -> Option<(f64, f64)> {
        lock(&self.channels)
            .get(&channel)
            .and_then(|state| state.output)
    }

    fn check_channel(&self, channel: u32) -> anyhow::Result<()> {
        if channel == 0 || channel > self.traits.channel_count {
            bail!("{}: channel {} does not exist", self.name, channel);
        }
        Ok(())
    }
}

impl AwgModule for SimulatedModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn traits(&self) -> &ModuleTraits {
        &self.traits
    }

    fn set_output_range(&self, channel: u32, min: f64, max: f64) -> anyhow::Result<()> {
        self.check_channel(channel)?;
        let amplitude = (max - min) / 2.0;
        let offset = (max + min) / 2.0;
        if max.abs().max(min.abs()) > self.traits.max_amplitude {
            bail!(
                "{}: output range ({}, {}) V exceeds {} V",
                self.name,
                min,
                max,
                self.traits.max_amplitude
            );
        }
        debug!(
            "{}.set_channel_amplitude({}, {}), offset {}",
            self.name, amplitude, channel, offset
        );
        lock(&self.channels).entry(channel).or_default().output = Some((amplitude, offset));
        self.log.record(SimEvent::OutputRange {
            module: self.name.clone(),
            channel,
            amplitude,
            offset,
        });
        Ok(())
    }

    fn configure_queue(
        &self,
        channel: u32,
        slot: SlotId,
        trigger: TriggerMode,
        start_delay: u32,
        repeat_count: u32,
        rate_divisor: u32,
    ) -> anyhow::Result<()> {
        self.check_channel(channel)?;
        if !self.allocator.is_allocated(slot) {
            return Err(awg_uploader::Error::InvalidSlot {
                device: self.name.clone(),
                slot,
            })
            .with_context(|| format!("{}: cannot queue waveform on channel {}", self.name, channel));
        }
        debug!(
            "{}.awg_queue_waveform({}, {}, {}, {}, {}, {})",
            self.name,
            channel,
            slot,
            trigger.driver_code(),
            start_delay,
            repeat_count,
            rate_divisor
        );
        let entry = QueueEntry {
            slot,
            trigger,
            start_delay,
            repeat: repeat_count,
            rate_divisor,
        };
        lock(&self.channels)
            .entry(channel)
            .or_default()
            .queue
            .push(entry.clone());
        self.log.record(SimEvent::Queue {
            module: self.name.clone(),
            channel,
            entry,
        });
        Ok(())
    }

    fn flush_queue(&self, channel: u32) -> anyhow::Result<()> {
        self.check_channel(channel)?;
        debug!("{}.awg_flush({})", self.name, channel);
        lock(&self.channels).entry(channel).or_default().queue.clear();
        self.log.record(SimEvent::Flush {
            module: self.name.clone(),
            channel,
        });
        Ok(())
    }
}
