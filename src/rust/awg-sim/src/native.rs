// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Conversion to 16-bit samples and upload into simulated module memory.

use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use indexmap::IndexMap;

use awg_uploader::device_traits::AwgModule;
use awg_uploader::native::{
    ChannelUploadData, NativeUploader, OutputRange, UploadData, UploadedSegment,
};
use awg_uploader::settings::ChannelMap;
use awg_uploader::waveform_cache::WaveformCache;

use crate::module::SimulatedModule;

/// Places every cached segment in its own slot of the channel's module.
pub struct SimulatedUploader {
    modules: IndexMap<String, Arc<SimulatedModule>>,
}

impl SimulatedUploader {
    pub fn new(modules: impl IntoIterator<Item = Arc<SimulatedModule>>) -> Self {
        SimulatedUploader {
            modules: modules
                .into_iter()
                .map(|module| (module.name().to_string(), module))
                .collect(),
        }
    }
}

impl NativeUploader for SimulatedUploader {
    fn upload(&mut self, cache: WaveformCache, channels: &ChannelMap) -> anyhow::Result<UploadData> {
        let mut upload_data = UploadData::new();
        for (name, waveforms) in cache.into_channels() {
            let config = channels
                .get(&name)
                .ok_or_else(|| anyhow!("Channel '{name}' is not configured"))?;
            let module = self
                .modules
                .get(&config.module)
                .ok_or_else(|| anyhow!("Module '{}' is not available", config.module))?;
            let Some((min, max)) = waveforms.envelope() else {
                continue;
            };
            let limit = config.amplitude_limit();
            if min < -limit || max > limit {
                bail!(
                    "Channel '{name}': voltage range ({min}, {max}) V exceeds the amplitude limit of {limit} V"
                );
            }
            let output_range = OutputRange::new(min, max);
            let mut segments = Vec::with_capacity(waveforms.segments().len());
            for segment in waveforms.segments() {
                let samples = to_short(&segment.samples, &output_range)
                    .with_context(|| format!("Channel '{name}'"))?;
                segments.push(UploadedSegment {
                    waveform: module.upload_waveform(samples)?,
                    repeat: segment.repeat,
                    rate_divisor: segment.rate_divisor,
                });
            }
            upload_data.insert(
                name,
                ChannelUploadData {
                    output_range,
                    segments,
                },
            );
        }
        Ok(upload_data)
    }
}

/// Normalize voltages to the full 16-bit range of the output range.
/// Samples may exceed the range by this much due to rounding.
const RANGE_TOLERANCE: f64 = 1e-9;

fn to_short(samples: &[f64], range: &OutputRange) -> anyhow::Result<Vec<i16>> {
    if let Some(v) = samples
        .iter()
        .find(|v| **v < range.min - RANGE_TOLERANCE || **v > range.max + RANGE_TOLERANCE)
    {
        bail!(
            "sample {v} V is outside the output range ({}, {}) V",
            range.min,
            range.max
        );
    }
    let amplitude = range.amplitude();
    if amplitude == 0.0 {
        return Ok(vec![0; samples.len()]);
    }
    let offset = range.offset();
    let full_scale = f64::from(i16::MAX);
    Ok(samples
        .iter()
        .map(|v| {
            ((v - offset) / amplitude * full_scale)
                .round()
                .clamp(-full_scale, full_scale) as i16
        })
        .collect())
}
