// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Simulated AWG hardware for the upload engine.
//!
//! Modules keep their waveform memory and queues in host memory and record
//! every driver call in a shared [`EventLog`], so the order in which playback
//! programs the hardware can be inspected.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use awg_uploader::Samples;

pub mod module;
pub mod native;
pub mod segments;
pub mod trigger;

pub use module::{QueueEntry, SimulatedModule};
pub use native::SimulatedUploader;
pub use segments::{FailingSegment, SampledSegment};
pub use trigger::RecordingTriggerProgram;

#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    Flush {
        module: String,
        channel: u32,
    },
    OutputRange {
        module: String,
        channel: u32,
        amplitude: f64,
        offset: f64,
    },
    Queue {
        module: String,
        channel: u32,
        entry: QueueEntry,
    },
    Compile {
        duration: Samples,
        repeat_count: u32,
    },
    Load,
    Start,
}

/// Ordered record of simulated hardware calls, shared between modules and trigger programs.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<SimEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: SimEvent) {
        lock(&self.events).push(event);
    }

    pub fn events(&self) -> Vec<SimEvent> {
        lock(&self.events).clone()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
