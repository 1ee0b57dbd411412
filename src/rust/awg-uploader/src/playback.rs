// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Playback of uploaded sequences.
//!
//! Playing a sequence programs the output range and the waveform queue of every
//! channel and only then starts the trigger program. The first queue entry of a
//! channel waits for the external trigger, all following entries start
//! automatically after their predecessor, so a single trigger plays the whole
//! sequence.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;

use awg_log::{debug, warn};

use crate::device_traits::{AwgModule, TriggerMode};
use crate::native::ChannelUploadData;
use crate::settings::{ChannelMap, UploaderSettings};
use crate::trigger::{StartContext, TriggerBinding, TriggerProgram};
use crate::upload_job::{SequenceId, SweepIndex, UploadJob};
use crate::uploader::Uploader;
use crate::{Error, Result};

/// Queue entries never use a start delay.
const START_DELAY: u32 = 0;

pub struct PlaybackCoordinator {
    modules: IndexMap<String, Arc<dyn AwgModule>>,
    channels: ChannelMap,
    default_trigger: Option<TriggerBinding>,
    await_timeout: Duration,
}

impl PlaybackCoordinator {
    pub fn new(
        modules: impl IntoIterator<Item = Arc<dyn AwgModule>>,
        channels: ChannelMap,
        settings: &UploaderSettings,
    ) -> Result<Self> {
        let modules: IndexMap<String, Arc<dyn AwgModule>> = modules
            .into_iter()
            .map(|module| (module.name().to_string(), module))
            .collect();
        for (name, config) in channels.iter() {
            let Some(module) = modules.get(&config.module) else {
                return Err(Error::Configuration(format!(
                    "Channel '{name}' refers to unknown module '{}'",
                    config.module
                )));
            };
            if config.channel_number > module.traits().channel_count {
                return Err(Error::Configuration(format!(
                    "Channel '{name}': module '{}' has no channel {}",
                    config.module, config.channel_number
                )));
            }
        }
        Ok(PlaybackCoordinator {
            modules,
            channels,
            default_trigger: None,
            await_timeout: settings.await_timeout(),
        })
    }

    /// Trigger program used for jobs that do not carry their own.
    pub fn with_default_trigger(mut self, program: Arc<dyn TriggerProgram>) -> Self {
        self.default_trigger = Some(TriggerBinding::new(program));
        self
    }

    pub fn with_await_timeout(mut self, timeout: Duration) -> Self {
        self.await_timeout = timeout;
        self
    }

    pub fn modules(&self) -> &IndexMap<String, Arc<dyn AwgModule>> {
        &self.modules
    }

    /// Wait for the upload of `id` / `index`, program all modules and start playback.
    pub fn play(
        &self,
        uploader: &Uploader,
        id: SequenceId,
        index: &SweepIndex,
    ) -> Result<Arc<UploadJob>> {
        let job = uploader.await_upload(id, index, self.await_timeout)?;
        self.program_modules(&job)?;
        self.start(&job)?;
        Ok(job)
    }

    /// Set output ranges and fill the waveform queues of every uploaded channel.
    pub fn program_modules(&self, job: &UploadJob) -> Result<()> {
        let Some(upload_data) = job.upload_data() else {
            return Err(Error::new(format!("Sequence {} has no upload data", job.key())));
        };
        // Resolve everything before touching the hardware.
        let targets = upload_data
            .iter()
            .map(|(name, data)| {
                let config = self.channels.get(name).ok_or_else(|| {
                    Error::Configuration(format!("Uploaded channel '{name}' is not configured"))
                })?;
                let module = self.modules.get(&config.module).ok_or_else(|| {
                    Error::Configuration(format!("Unknown module '{}'", config.module))
                })?;
                Ok((module, config.channel_number, data))
            })
            .collect::<Result<Vec<_>>>()?;

        for (module, channel, data) in targets {
            program_channel(module.as_ref(), channel, data)?;
            debug!(
                "{} channel {}: queued {} waveforms",
                module.name(),
                channel,
                data.segments.len()
            );
        }
        Ok(())
    }

    fn start(&self, job: &UploadJob) -> Result<()> {
        let context = StartContext {
            modules: &self.modules,
            channels: &self.channels,
        };
        match job.trigger().or(self.default_trigger.as_ref()) {
            Some(trigger) => trigger.start(&context).map_err(Error::TriggerProgram),
            None => {
                warn!(
                    "No trigger program for {}: modules are armed but not started",
                    job.key()
                );
                Ok(())
            }
        }
    }
}

fn program_channel(module: &dyn AwgModule, channel: u32, data: &ChannelUploadData) -> anyhow::Result<()> {
    module.flush_queue(channel)?;
    module.set_output_range(channel, data.output_range.min, data.output_range.max)?;
    let mut trigger = TriggerMode::External;
    for segment in &data.segments {
        module.configure_queue(
            channel,
            segment.slot(),
            trigger,
            START_DELAY,
            segment.repeat,
            segment.rate_divisor,
        )?;
        trigger = TriggerMode::Auto;
    }
    Ok(())
}
