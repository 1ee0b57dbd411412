// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Per-channel accumulation of rendered segments and DC compensation.
//!
//! Integrals are expressed in volt-samples at the module's maximum sample rate,
//! the same unit as playback durations. The compensation pulse is appended to
//! every channel with a common, quantized length so that all channels stay
//! sample aligned.

use indexmap::IndexMap;

use awg_log::warn;

use crate::Samples;
use crate::grid::{ceil_to_grid, ceil_to_samples};
use crate::settings::ChannelMap;
use crate::{Error, Result};

/// Integrals below this magnitude need no compensation.
const INTEGRAL_TOLERANCE: f64 = 1e-9;

/// One segment of one channel, as produced by the renderer.
#[derive(Debug, Clone)]
pub struct RenderedSegment {
    pub samples: Vec<f64>,
    /// (min, max) voltage of the segment.
    pub extrema: (f64, f64),
    /// Integral of a single repetition.
    pub integral: f64,
    pub repeat: u32,
    pub rate_divisor: u32,
    pub ticks_per_sample: Samples,
}

impl RenderedSegment {
    pub fn new(samples: Vec<f64>, extrema: (f64, f64), integral: f64) -> Self {
        RenderedSegment {
            samples,
            extrema,
            integral,
            repeat: 1,
            rate_divisor: 0,
            ticks_per_sample: 1,
        }
    }

    pub fn with_playback(mut self, repeat: u32, rate_divisor: u32, ticks_per_sample: Samples) -> Self {
        self.repeat = repeat;
        self.rate_divisor = rate_divisor;
        self.ticks_per_sample = ticks_per_sample;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedSegment {
    pub samples: Vec<f64>,
    pub repeat: u32,
    pub rate_divisor: u32,
    pub ticks_per_sample: Samples,
}

impl CachedSegment {
    /// Playback duration including repetitions.
    pub fn duration(&self) -> Samples {
        self.samples.len() as Samples * Samples::from(self.repeat) * self.ticks_per_sample
    }
}

/// Rendered data of one channel.
#[derive(Debug, Clone)]
pub struct ChannelWaveforms {
    segments: Vec<CachedSegment>,
    envelope: Option<(f64, f64)>,
    integral: f64,
    compensation_limits: Option<(f64, f64)>,
    compensation_level: Option<f64>,
}

impl ChannelWaveforms {
    fn new(compensation_limits: Option<(f64, f64)>) -> Self {
        ChannelWaveforms {
            segments: vec![],
            envelope: None,
            integral: 0.0,
            compensation_limits,
            compensation_level: None,
        }
    }

    fn push(&mut self, segment: CachedSegment, extrema: (f64, f64), integral: f64) {
        self.envelope = Some(match self.envelope {
            Some((min, max)) => (min.min(extrema.0), max.max(extrema.1)),
            None => extrema,
        });
        self.integral += integral;
        self.segments.push(segment);
    }

    pub fn segments(&self) -> &[CachedSegment] {
        &self.segments
    }

    /// (min, max) voltage over all segments, `None` when nothing was added.
    pub fn envelope(&self) -> Option<(f64, f64)> {
        self.envelope
    }

    /// Net integral over all segments, including the compensation pulse once generated.
    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Voltage of the compensation pulse, if this channel was compensated.
    pub fn compensation_level(&self) -> Option<f64> {
        self.compensation_level
    }

    pub fn npt(&self) -> Samples {
        self.segments.iter().map(CachedSegment::duration).sum()
    }

    /// Samples needed to null the integral within the compensation limits.
    fn required_compensation(&self, channel: &str) -> Option<Samples> {
        if self.integral.abs() <= INTEGRAL_TOLERANCE {
            return None;
        }
        let (min, max) = self.compensation_limits?;
        let level = if self.integral > 0.0 { min } else { max };
        if level == 0.0 {
            warn!(
                "Channel '{}': compensation limits ({}, {}) cannot null an integral of {}",
                channel,
                min,
                max,
                self.integral
            );
            return None;
        }
        Some(ceil_to_samples(self.integral.abs() / level.abs()))
    }
}

/// Rendered waveforms of one upload job, keyed by channel name.
#[derive(Debug, Clone)]
pub struct WaveformCache {
    channels: IndexMap<String, ChannelWaveforms>,
    granularity: Samples,
    compensation_duration: Option<Samples>,
}

impl WaveformCache {
    pub fn new(channels: &ChannelMap, granularity: Samples) -> Self {
        WaveformCache {
            channels: channels
                .iter()
                .map(|(name, cfg)| (name.to_string(), ChannelWaveforms::new(cfg.compensation_limits)))
                .collect(),
            granularity: granularity.max(1),
            compensation_duration: None,
        }
    }

    /// Append a segment to a channel. Segments must be added in sequence order.
    pub fn add_segment(&mut self, channel: &str, segment: RenderedSegment) -> Result<()> {
        if self.compensation_duration.is_some() {
            return Err(Error::new(
                "Cannot add segments after the DC compensation was generated",
            ));
        }
        if segment.repeat == 0 {
            return Err(Error::new(format!(
                "Channel '{channel}': segment repeat count must be at least 1"
            )));
        }
        let Some(waveforms) = self.channels.get_mut(channel) else {
            return Err(Error::new(format!("Unknown channel '{channel}'")));
        };
        let integral = segment.integral * f64::from(segment.repeat);
        let cached = CachedSegment {
            samples: segment.samples,
            repeat: segment.repeat,
            rate_divisor: segment.rate_divisor,
            ticks_per_sample: segment.ticks_per_sample,
        };
        waveforms.push(cached, segment.extrema, integral);
        Ok(())
    }

    /// Append the DC compensation pulse to every channel.
    ///
    /// The pulse length is the smallest multiple of the granularity that lets
    /// every channel with compensation limits null its integral. Channels without
    /// limits, or without an integral, are padded with zeros of the same length.
    /// Returns the pulse length, 0 when no channel needs compensation.
    pub fn generate_dc_compensation(&mut self) -> Result<Samples> {
        if self.compensation_duration.is_some() {
            return Err(Error::new("DC compensation was already generated"));
        }
        let required: Vec<Option<Samples>> = self
            .channels
            .iter()
            .map(|(name, waveforms)| waveforms.required_compensation(name))
            .collect();
        let longest = required.iter().flatten().copied().max().unwrap_or(0);
        let duration = ceil_to_grid(longest, self.granularity);
        self.compensation_duration = Some(duration);
        if duration == 0 {
            return Ok(0);
        }
        for (waveforms, required) in self.channels.values_mut().zip(required) {
            let level = match required {
                Some(_) => -waveforms.integral / duration as f64,
                None => 0.0,
            };
            if required.is_some() {
                waveforms.compensation_level = Some(level);
            }
            let segment = CachedSegment {
                samples: vec![level; duration as usize],
                repeat: 1,
                rate_divisor: 0,
                ticks_per_sample: 1,
            };
            waveforms.push(segment, (level, level), level * duration as f64);
        }
        Ok(duration)
    }

    /// Length of the compensation pulse, `None` before it was generated.
    pub fn compensation_duration(&self) -> Option<Samples> {
        self.compensation_duration
    }

    /// Total playback length of the job: the longest channel.
    pub fn npt(&self) -> Samples {
        self.channels
            .values()
            .map(ChannelWaveforms::npt)
            .max()
            .unwrap_or(0)
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelWaveforms> {
        self.channels.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChannelWaveforms)> {
        self.channels.iter().map(|(name, w)| (name.as_str(), w))
    }

    pub fn into_channels(self) -> IndexMap<String, ChannelWaveforms> {
        self.channels
    }
}
