// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Waveform memory slots of a single device.
//!
//! The pool size is the hardware slot count; there is no defragmentation and no
//! ordering guarantee on which free slot is handed out next.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use awg_log::{debug, warn};

use crate::utils::lock;
use crate::{Error, Result};

pub type SlotId = u32;

#[derive(Debug)]
struct SlotState {
    free: VecDeque<SlotId>,
    // slot -> size in samples
    used: HashMap<SlotId, usize>,
}

/// Tracks free and used waveform slots of one device.
#[derive(Debug)]
pub struct SlotAllocator {
    device: String,
    capacity: usize,
    state: Mutex<SlotState>,
}

impl SlotAllocator {
    pub fn new(device: impl Into<String>, capacity: usize) -> Self {
        let capacity_id = SlotId::try_from(capacity).unwrap_or(SlotId::MAX);
        SlotAllocator {
            device: device.into(),
            capacity,
            state: Mutex::new(SlotState {
                free: (0..capacity_id).collect(),
                used: HashMap::new(),
            }),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Assign a free slot to a waveform of `size` samples.
    pub fn allocate(&self, size: usize) -> Result<SlotId> {
        let mut state = lock(&self.state);
        let Some(slot) = state.free.pop_front() else {
            return Err(Error::OutOfMemory {
                device: self.device.clone(),
                size,
            });
        };
        state.used.insert(slot, size);
        debug!("{}: allocated slot {} ({} samples)", self.device, slot, size);
        Ok(slot)
    }

    /// Return a slot to the pool, yielding the size it was allocated with.
    pub fn free(&self, slot: SlotId) -> Result<usize> {
        let mut state = lock(&self.state);
        let Some(size) = state.used.remove(&slot) else {
            return Err(Error::InvalidSlot {
                device: self.device.clone(),
                slot,
            });
        };
        state.free.push_back(slot);
        debug!("{}: freed slot {} ({} samples)", self.device, slot, size);
        Ok(size)
    }

    pub fn is_allocated(&self, slot: SlotId) -> bool {
        lock(&self.state).used.contains_key(&slot)
    }

    pub fn used_count(&self) -> usize {
        lock(&self.state).used.len()
    }

    pub fn free_count(&self) -> usize {
        lock(&self.state).free.len()
    }
}

/// Handle to a waveform stored in a device slot.
///
/// The reference owns both the slot and the raw sample buffer. Releasing it,
/// explicitly with [`WaveformReference::release`] or by dropping it, returns the
/// slot to its allocator.
pub struct WaveformReference {
    slot: SlotId,
    size: usize,
    allocator: Arc<SlotAllocator>,
    samples: Option<Vec<i16>>,
}

impl WaveformReference {
    /// Allocate a slot for `samples` and take ownership of the buffer.
    pub fn allocate(allocator: &Arc<SlotAllocator>, samples: Vec<i16>) -> Result<Self> {
        let size = samples.len();
        let slot = allocator.allocate(size)?;
        Ok(WaveformReference {
            slot,
            size,
            allocator: Arc::clone(allocator),
            samples: Some(samples),
        })
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn device(&self) -> &str {
        self.allocator.device()
    }

    pub fn samples(&self) -> &[i16] {
        self.samples.as_deref().unwrap_or_default()
    }

    /// Give the slot back to the allocator and drop the sample buffer.
    pub fn release(mut self) -> Result<()> {
        self.samples = None;
        self.allocator.free(self.slot).map(|_| ())
    }
}

impl Drop for WaveformReference {
    fn drop(&mut self) {
        if self.samples.take().is_some() {
            if let Err(err) = self.allocator.free(self.slot) {
                warn!("Failed to release waveform: {}", err);
            }
        }
    }
}

impl fmt::Debug for WaveformReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaveformReference")
            .field("device", &self.allocator.device())
            .field("slot", &self.slot)
            .field("size", &self.size)
            .finish()
    }
}
