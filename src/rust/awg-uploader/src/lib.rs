// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous waveform upload engine for multi-channel AWG modules.
//!
//! Upload jobs are admitted into a priority queue, rendered and DC compensated
//! by a single background worker, converted and placed into device memory by a
//! native uploader, and finally played back by the [`playback::PlaybackCoordinator`],
//! which programs the waveform queues of every module before starting the
//! trigger program.

pub mod allocator;
pub mod device_traits;
pub mod error;
pub mod grid;
pub mod job_queue;
pub mod native;
pub mod playback;
pub mod renderer;
pub mod settings;
pub mod trigger;
pub mod upload_job;
pub mod uploader;
pub(crate) mod utils;
pub mod waveform_cache;

pub use error::{Error, Result};

/// Time and length unit of the engine: samples at a module's maximum sample rate.
pub type Samples = u64;
