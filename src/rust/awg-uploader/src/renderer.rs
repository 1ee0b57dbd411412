// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;

use crate::Samples;
use crate::upload_job::SweepIndex;

/// A segment of a pulse sequence that can be sampled per channel.
///
/// The pulse math lives behind this trait. Every method receives the channel
/// name and the sweep index selecting one point of a parameter sweep.
pub trait SegmentRenderer: Debug + Send + Sync {
    /// Sample the segment, padded with `pre_delay` and `post_delay` samples.
    fn render(
        &self,
        channel: &str,
        index: &SweepIndex,
        pre_delay: Samples,
        post_delay: Samples,
        sample_rate: f64,
    ) -> anyhow::Result<Vec<f64>>;

    fn v_min(&self, channel: &str, index: &SweepIndex, sample_rate: f64) -> anyhow::Result<f64>;

    fn v_max(&self, channel: &str, index: &SweepIndex, sample_rate: f64) -> anyhow::Result<f64>;

    /// Time integral of one rendering of the segment, in volt-seconds.
    fn integrate(
        &self,
        channel: &str,
        index: &SweepIndex,
        pre_delay: Samples,
        post_delay: Samples,
        sample_rate: f64,
    ) -> anyhow::Result<f64>;
}
