// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Interface to the native conversion and upload layer.

use indexmap::IndexMap;

use crate::allocator::{SlotId, WaveformReference};
use crate::settings::ChannelMap;
use crate::waveform_cache::WaveformCache;

/// Output voltage range of a channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputRange {
    pub min: f64,
    pub max: f64,
}

impl OutputRange {
    pub fn new(min: f64, max: f64) -> Self {
        OutputRange { min, max }
    }

    /// Half of the peak-to-peak range.
    pub fn amplitude(&self) -> f64 {
        (self.max - self.min) / 2.0
    }

    pub fn offset(&self) -> f64 {
        (self.max + self.min) / 2.0
    }
}

/// A segment stored in device memory together with how it is to be played.
#[derive(Debug)]
pub struct UploadedSegment {
    pub waveform: WaveformReference,
    pub repeat: u32,
    pub rate_divisor: u32,
}

impl UploadedSegment {
    pub fn slot(&self) -> SlotId {
        self.waveform.slot()
    }
}

#[derive(Debug)]
pub struct ChannelUploadData {
    pub output_range: OutputRange,
    /// Segments in playback order.
    pub segments: Vec<UploadedSegment>,
}

impl ChannelUploadData {
    /// (slot, repeat count, rate divisor) of each segment in playback order.
    pub fn queue_entries(&self) -> Vec<(SlotId, u32, u32)> {
        self.segments
            .iter()
            .map(|s| (s.slot(), s.repeat, s.rate_divisor))
            .collect()
    }
}

/// Upload result of one job, keyed by channel name.
pub type UploadData = IndexMap<String, ChannelUploadData>;

/// Converts rendered waveforms to the device format and stores them in device memory.
///
/// The call is synchronous; implementations backed by DMA or their own threads
/// must complete the transfer before returning.
pub trait NativeUploader: Send {
    fn upload(&mut self, cache: WaveformCache, channels: &ChannelMap) -> anyhow::Result<UploadData>;
}
