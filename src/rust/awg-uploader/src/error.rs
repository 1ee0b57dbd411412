// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Display;

use crate::allocator::SlotId;
use crate::upload_job::JobKey;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Out of waveform memory on '{device}': no free slot for {size} samples")]
    OutOfMemory { device: String, size: usize },
    #[error("Slot {slot} is not allocated on '{device}'")]
    InvalidSlot { device: String, slot: SlotId },
    #[error(
        "Sequence {key} not placed for upload. Always make sure to first upload a sequence and then do the playback"
    )]
    UploadNotFound { key: JobKey },
    #[error("Failed to render channel '{channel}'")]
    RenderFailure {
        channel: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Native conversion or upload failed")]
    NativeUploadFailure(#[source] anyhow::Error),
    #[error("Trigger program failed")]
    TriggerProgram(#[source] anyhow::Error),
    #[error("Upload of sequence {key} failed: {reason}")]
    UploadFailed { key: JobKey, reason: String },
    #[error("Sequence {key} is already queued for upload")]
    DuplicateJob { key: JobKey },
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("The uploader has been shut down")]
    ShutDown,
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    pub fn new<T>(msg: T) -> Self
    where
        T: Display,
    {
        Error::Anyhow(anyhow::anyhow!(msg.to_string()))
    }

    /// Map an error reported by a native uploader.
    ///
    /// Native uploaders allocate device memory through [`crate::allocator::SlotAllocator`],
    /// so allocator errors travel back wrapped in `anyhow` and are restored here.
    pub fn from_native(error: anyhow::Error) -> Self {
        match error.downcast::<Error>() {
            Ok(inner) => inner,
            Err(other) => Error::NativeUploadFailure(other),
        }
    }
}

/// Create a formatted error message including the chain of causes.
pub fn create_error_message(error: &(dyn std::error::Error + 'static)) -> String {
    let mut causes = vec![];
    let mut source = error.source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }
    if causes.is_empty() {
        return format!("{error}");
    }
    format!("{error}\nCaused by:\n  {}", causes.join("\n  "))
}
