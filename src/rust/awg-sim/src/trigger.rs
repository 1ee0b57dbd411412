// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::sync::Mutex;

use awg_uploader::Samples;
use awg_uploader::trigger::TriggerProgram;

use crate::{EventLog, SimEvent, lock};

/// Trigger program that records its calls in the event log.
#[derive(Debug)]
pub struct RecordingTriggerProgram {
    log: EventLog,
    compiled: Mutex<Option<(Samples, u32)>>,
}

impl RecordingTriggerProgram {
    pub fn new(log: EventLog) -> Self {
        RecordingTriggerProgram {
            log,
            compiled: Mutex::new(None),
        }
    }

    /// (duration, repeat count) of the last compilation.
    pub fn compiled(&self) -> Option<(Samples, u32)> {
        *lock(&self.compiled)
    }
}

impl TriggerProgram for RecordingTriggerProgram {
    fn compile(&self, duration: Samples, repeat_count: u32) -> anyhow::Result<()> {
        *lock(&self.compiled) = Some((duration, repeat_count));
        self.log.record(SimEvent::Compile {
            duration,
            repeat_count,
        });
        Ok(())
    }

    fn load(&self) -> anyhow::Result<()> {
        if lock(&self.compiled).is_none() {
            anyhow::bail!("Trigger program loaded before it was compiled");
        }
        self.log.record(SimEvent::Load);
        Ok(())
    }

    fn start(&self) -> anyhow::Result<()> {
        self.log.record(SimEvent::Start);
        Ok(())
    }
}
