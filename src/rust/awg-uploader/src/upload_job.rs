// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::Samples;
use crate::native::UploadData;
use crate::renderer::SegmentRenderer;
use crate::trigger::TriggerBinding;
use crate::{Error, Result};

/// Globally unique identifier of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceId(Uuid);

impl SequenceId {
    pub fn new() -> Self {
        SequenceId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SequenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SequenceId {
    fn from(value: Uuid) -> Self {
        SequenceId(value)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Selects one point of a parameter sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SweepIndex(Vec<usize>);

impl SweepIndex {
    pub fn new(index: impl Into<Vec<usize>>) -> Self {
        SweepIndex(index.into())
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

impl From<Vec<usize>> for SweepIndex {
    fn from(value: Vec<usize>) -> Self {
        SweepIndex(value)
    }
}

impl<const N: usize> From<[usize; N]> for SweepIndex {
    fn from(value: [usize; N]) -> Self {
        SweepIndex(value.to_vec())
    }
}

impl fmt::Display for SweepIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "({})", items.join(", "))
    }
}

/// Identity of an upload: sequence id plus sweep index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub id: SequenceId,
    pub index: SweepIndex,
}

impl JobKey {
    pub fn new(id: SequenceId, index: impl Into<SweepIndex>) -> Self {
        JobKey {
            id,
            index: index.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} index {}", self.id, self.index)
    }
}

/// One entry of a sequence: a segment and how the hardware should play it.
#[derive(Debug, Clone)]
pub struct SequenceElement {
    pub segment: Arc<dyn SegmentRenderer>,
    pub repeat: u32,
    pub rate_divisor: u32,
}

impl SequenceElement {
    pub fn new(segment: Arc<dyn SegmentRenderer>, repeat: u32, rate_divisor: u32) -> Self {
        SequenceElement {
            segment,
            repeat,
            rate_divisor,
        }
    }
}

/// A request to render and upload one point of a sequence.
///
/// Created by the client, filled in by the upload worker and read-only once it
/// has been completed.
#[derive(Debug)]
pub struct UploadJob {
    key: JobKey,
    sequence: Vec<SequenceElement>,
    repeat_count: u32,
    neutralize: bool,
    priority: i64,
    playback_duration: Samples,
    upload_data: Option<UploadData>,
    trigger: Option<TriggerBinding>,
}

impl UploadJob {
    pub fn new(
        id: SequenceId,
        index: impl Into<SweepIndex>,
        sequence: Vec<SequenceElement>,
        repeat_count: u32,
    ) -> Self {
        UploadJob {
            key: JobKey::new(id, index),
            sequence,
            repeat_count,
            neutralize: true,
            priority: 0,
            playback_duration: 0,
            upload_data: None,
            trigger: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Whether a DC compensation pulse is appended to the sequence.
    pub fn with_neutralize(mut self, neutralize: bool) -> Self {
        self.neutralize = neutralize;
        self
    }

    pub fn with_trigger_program(mut self, trigger: TriggerBinding) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn id(&self) -> SequenceId {
        self.key.id
    }

    pub fn index(&self) -> &SweepIndex {
        &self.key.index
    }

    pub fn sequence(&self) -> &[SequenceElement] {
        &self.sequence
    }

    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    pub fn neutralize(&self) -> bool {
        self.neutralize
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    /// Sequence length including compensation, 0 until the job was rendered.
    pub fn playback_duration(&self) -> Samples {
        self.playback_duration
    }

    pub fn upload_data(&self) -> Option<&UploadData> {
        self.upload_data.as_ref()
    }

    pub fn trigger(&self) -> Option<&TriggerBinding> {
        self.trigger.as_ref()
    }

    pub(crate) fn escalate(&mut self, delta: i64) {
        self.priority = self.priority.saturating_add(delta);
    }

    pub(crate) fn set_playback_duration(&mut self, duration: Samples) {
        self.playback_duration = duration;
    }

    pub(crate) fn set_upload_data(&mut self, upload_data: UploadData) {
        self.upload_data = Some(upload_data);
    }

    /// Return all device memory held by this job.
    pub fn release(mut self) -> Result<()> {
        let mut first_error: Option<Error> = None;
        for (_, channel) in self.upload_data.take().into_iter().flatten() {
            for segment in channel.segments {
                if let Err(err) = segment.waveform.release() {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
