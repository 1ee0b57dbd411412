// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Segment renderers backed by explicit sample data.

use std::collections::HashMap;

use anyhow::{anyhow, bail};

use awg_uploader::Samples;
use awg_uploader::renderer::SegmentRenderer;
use awg_uploader::upload_job::SweepIndex;

/// A segment defined by its samples per channel.
///
/// Samples are taken as given at whatever rate the segment is played; channels
/// without data render zeros of the segment length. An optional sweep scales the
/// samples by the factor selected with the first sweep index.
#[derive(Debug, Clone, Default)]
pub struct SampledSegment {
    channels: HashMap<String, Vec<f64>>,
    sweep: Vec<f64>,
}

impl SampledSegment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constant(channel: impl Into<String>, level: f64, length: usize) -> Self {
        Self::new().with_channel(channel, vec![level; length])
    }

    pub fn with_channel(mut self, channel: impl Into<String>, samples: Vec<f64>) -> Self {
        self.channels.insert(channel.into(), samples);
        self
    }

    pub fn with_sweep(mut self, scales: Vec<f64>) -> Self {
        self.sweep = scales;
        self
    }

    pub fn len(&self) -> usize {
        self.channels.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn scale(&self, index: &SweepIndex) -> anyhow::Result<f64> {
        if self.sweep.is_empty() {
            return Ok(1.0);
        }
        let position = index.as_slice().first().copied().unwrap_or(0);
        self.sweep.get(position).copied().ok_or_else(|| {
            anyhow!(
                "Sweep index {index} is out of range for {} points",
                self.sweep.len()
            )
        })
    }

    fn samples(&self, channel: &str, index: &SweepIndex) -> anyhow::Result<Vec<f64>> {
        let scale = self.scale(index)?;
        Ok(match self.channels.get(channel) {
            Some(samples) => samples.iter().map(|v| v * scale).collect(),
            None => vec![0.0; self.len()],
        })
    }
}

impl SegmentRenderer for SampledSegment {
    fn render(
        &self,
        channel: &str,
        index: &SweepIndex,
        pre_delay: Samples,
        post_delay: Samples,
        _sample_rate: f64,
    ) -> anyhow::Result<Vec<f64>> {
        let samples = self.samples(channel, index)?;
        let mut rendered = vec![0.0; pre_delay as usize];
        rendered.extend(samples);
        rendered.extend(std::iter::repeat_n(0.0, post_delay as usize));
        Ok(rendered)
    }

    fn v_min(&self, channel: &str, index: &SweepIndex, _sample_rate: f64) -> anyhow::Result<f64> {
        let samples = self.samples(channel, index)?;
        Ok(samples.into_iter().reduce(f64::min).unwrap_or(0.0))
    }

    fn v_max(&self, channel: &str, index: &SweepIndex, _sample_rate: f64) -> anyhow::Result<f64> {
        let samples = self.samples(channel, index)?;
        Ok(samples.into_iter().reduce(f64::max).unwrap_or(0.0))
    }

    fn integrate(
        &self,
        channel: &str,
        index: &SweepIndex,
        _pre_delay: Samples,
        _post_delay: Samples,
        sample_rate: f64,
    ) -> anyhow::Result<f64> {
        let samples = self.samples(channel, index)?;
        Ok(samples.iter().sum::<f64>() / sample_rate)
    }
}

/// A segment whose rendering always fails.
#[derive(Debug, Clone)]
pub struct FailingSegment {
    message: String,
}

impl FailingSegment {
    pub fn new(message: impl Into<String>) -> Self {
        FailingSegment {
            message: message.into(),
        }
    }
}

impl SegmentRenderer for FailingSegment {
    fn render(
        &self,
        _channel: &str,
        _index: &SweepIndex,
        _pre_delay: Samples,
        _post_delay: Samples,
        _sample_rate: f64,
    ) -> anyhow::Result<Vec<f64>> {
        bail!("{}", self.message)
    }

    fn v_min(&self, _: &str, _: &SweepIndex, _: f64) -> anyhow::Result<f64> {
        bail!("{}", self.message)
    }

    fn v_max(&self, _: &str, _: &SweepIndex, _: f64) -> anyhow::Result<f64> {
        bail!("{}", self.message)
    }

    fn integrate(&self, _: &str, _: &SweepIndex, _: Samples, _: Samples, _: f64) -> anyhow::Result<f64> {
        bail!("{}", self.message)
    }
}
