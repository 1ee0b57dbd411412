// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Pending upload jobs ordered by a mutable priority.
//!
//! The queue is a flat collection that is fully scanned on extraction. Pending
//! depths are a handful of jobs and priorities change while jobs wait, which
//! makes a rescan cheaper than maintaining a heap.

use std::cmp::Reverse;

use crate::upload_job::{JobKey, UploadJob};

#[derive(Debug)]
struct PendingJob {
    arrival: u64,
    job: UploadJob,
}

#[derive(Debug, Default)]
pub struct JobQueue {
    pending: Vec<PendingJob>,
    next_arrival: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, job: UploadJob) {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.pending.push(PendingJob { arrival, job });
    }

    /// Remove the job with the highest priority; the earliest arrival wins ties.
    pub fn take_highest_priority(&mut self) -> Option<UploadJob> {
        let position = self
            .pending
            .iter()
            .enumerate()
            .max_by_key(|(_, p)| (p.job.priority(), Reverse(p.arrival)))
            .map(|(position, _)| position)?;
        Some(self.pending.swap_remove(position).job)
    }

    /// Raise the priority of a pending job. Returns `false` if the job is not pending.
    pub fn promote(&mut self, key: &JobKey, delta: i64) -> bool {
        match self.pending.iter_mut().find(|p| p.job.key() == key) {
            Some(pending) => {
                pending.job.escalate(delta);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &JobKey) -> bool {
        self.pending.iter().any(|p| p.job.key() == key)
    }

    pub fn priority_of(&self, key: &JobKey) -> Option<i64> {
        self.pending
            .iter()
            .find(|p| p.job.key() == key)
            .map(|p| p.job.priority())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove all pending jobs in arrival order.
    pub fn drain(&mut self) -> Vec<UploadJob> {
        self.pending.sort_by_key(|p| p.arrival);
        self.pending.drain(..).map(|p| p.job).collect()
    }
}
