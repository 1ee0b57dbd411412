// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Background upload worker and the state it shares with the control thread.
//!
//! A single worker thread drains the [`JobQueue`] in priority order. Each job is
//! rendered into a [`WaveformCache`], DC compensated, handed to the
//! [`NativeUploader`] and finally published in the completed collection, where
//! [`Uploader::await_upload`] picks it up. A job key is present in at most one of
//! the pending queue, the in-flight slot and the completed collection.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use awg_log::{debug, diagnostic, info, warn};

use crate::error::create_error_message;
use crate::job_queue::JobQueue;
use crate::native::NativeUploader;
use crate::settings::{ChannelMap, UploaderSettings};
use crate::upload_job::{JobKey, SequenceId, SweepIndex, UploadJob};
use crate::utils::lock;
use crate::waveform_cache::{RenderedSegment, WaveformCache};
use crate::{Error, Result};

/// Longest single condition-variable wait of a lookup.
const MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct State {
    queue: JobQueue,
    in_flight: Option<JobKey>,
    completed: IndexMap<JobKey, Arc<UploadJob>>,
    failed: VecDeque<(JobKey, String)>,
    running: bool,
}

impl State {
    fn is_known(&self, key: &JobKey) -> bool {
        self.queue.contains(key) || self.in_flight.as_ref() == Some(key)
    }

    fn take_failure(&mut self, key: &JobKey) -> Option<String> {
        let position = self.failed.iter().position(|(k, _)| k == key)?;
        self.failed.remove(position).map(|(_, reason)| reason)
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    // Signalled on submission, completion, failure and shutdown.
    changed: Condvar,
    settings: UploaderSettings,
}

impl Shared {
    fn wait_timeout<'a>(&self, guard: MutexGuard<'a, State>, timeout: Duration) -> MutexGuard<'a, State> {
        self.changed
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }
}

/// Owner of the upload worker thread.
///
/// Dropping the uploader stops the worker after its current job.
pub struct Uploader {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Uploader {
    /// Validate the configuration and start the worker thread.
    pub fn start(
        mut settings: UploaderSettings,
        channels: ChannelMap,
        native: Box<dyn NativeUploader>,
    ) -> Result<Self> {
        if channels.is_empty() {
            return Err(Error::Configuration(
                "At least one channel is required".to_string(),
            ));
        }
        for change in settings.sanitize() {
            warn!(
                "Setting '{}' changed from {} to {}: {}",
                change.field,
                change.original,
                change.sanitized,
                change.reason
            );
        }
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: JobQueue::new(),
                in_flight: None,
                completed: IndexMap::new(),
                failed: VecDeque::new(),
                running: true,
            }),
            changed: Condvar::new(),
            settings,
        });
        let worker = UploadWorker {
            shared: Arc::clone(&shared),
            channels,
            native,
        };
        let handle = std::thread::Builder::new()
            .name("awg-uploader".into())
            .spawn(move || worker.run())
            .map_err(|e| Error::new(format!("Failed to spawn upload worker: {e}")))?;
        Ok(Uploader {
            shared,
            worker: Some(handle),
        })
    }

    pub fn settings(&self) -> &UploaderSettings {
        &self.shared.settings
    }

    /// Queue a job for upload.
    ///
    /// A completed job with the same key is replaced; its device memory is
    /// released once no playback holds it anymore.
    pub fn submit(&self, job: UploadJob) -> Result<()> {
        let replaced = {
            let mut state = lock(&self.shared.state);
            if !state.running {
                return Err(Error::ShutDown);
            }
            let key = job.key().clone();
            if state.is_known(&key) {
                return Err(Error::DuplicateJob { key });
            }
            let replaced = state.completed.shift_remove(&key);
            state.take_failure(&key);
            debug!("Queued {} with priority {}", key, job.priority());
            state.queue.submit(job);
            replaced
        };
        self.shared.changed.notify_all();
        if replaced.is_some() {
            debug!("Replaced a completed upload");
        }
        Ok(())
    }

    /// Raise the priority of a pending job. Returns `false` once the job left the queue.
    pub fn promote(&self, id: SequenceId, index: &SweepIndex, delta: i64) -> bool {
        let key = JobKey::new(id, index.clone());
        lock(&self.shared.state).queue.promote(&key, delta)
    }

    /// Wait for the upload of `id` / `index` to complete.
    ///
    /// The job is escalated each time the lookup grace period passes while it
    /// is still pending. Fails with [`Error::UploadFailed`] as soon as the worker
    /// reports a failure and with [`Error::UploadNotFound`] once `timeout` expired.
    pub fn await_upload(
        &self,
        id: SequenceId,
        index: &SweepIndex,
        timeout: Duration,
    ) -> Result<Arc<UploadJob>> {
        let key = JobKey::new(id, index.clone());
        let grace = self.shared.settings.lookup_grace();
        let start = Instant::now();
        // `None` when the instant is not representable: wait without deadline / escalation.
        let deadline = start.checked_add(timeout);
        let mut next_escalation = start.checked_add(grace);
        let mut state = lock(&self.shared.state);
        loop {
            if let Some(job) = state.completed.get(&key) {
                return Ok(Arc::clone(job));
            }
            if let Some(reason) = state.take_failure(&key) {
                return Err(Error::UploadFailed { key, reason });
            }
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return Err(Error::UploadNotFound { key });
            }
            if next_escalation.is_some_and(|escalation| now >= escalation) {
                let step = self.shared.settings.escalation_step;
                if state.queue.promote(&key, step) {
                    let priority = state.queue.priority_of(&key).unwrap_or_default();
                    info!("Upload of {} not ready, raised its priority to {}", key, priority);
                }
                next_escalation = now.checked_add(grace);
            }
            let wait = [deadline, next_escalation]
                .into_iter()
                .flatten()
                .map(|wake| wake.saturating_duration_since(now))
                .min()
                .unwrap_or(MAX_WAIT)
                .min(MAX_WAIT);
            state = self.shared.wait_timeout(state, wait);
        }
    }

    /// Remove a completed upload, releasing its device memory once it is no longer played.
    pub fn discard(&self, id: SequenceId, index: &SweepIndex) -> Option<Arc<UploadJob>> {
        let key = JobKey::new(id, index.clone());
        lock(&self.shared.state).completed.shift_remove(&key)
    }

    pub fn is_pending(&self, id: SequenceId, index: &SweepIndex) -> bool {
        let key = JobKey::new(id, index.clone());
        lock(&self.shared.state).is_known(&key)
    }

    pub fn is_completed(&self, id: SequenceId, index: &SweepIndex) -> bool {
        let key = JobKey::new(id, index.clone());
        lock(&self.shared.state).completed.contains_key(&key)
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    pub fn completed_keys(&self) -> Vec<JobKey> {
        lock(&self.shared.state).completed.keys().cloned().collect()
    }

    /// Stop the worker after its current job and wait for it to exit.
    ///
    /// Jobs still pending are dropped.
    pub fn shutdown(&mut self) {
        let dropped = {
            let mut state = lock(&self.shared.state);
            state.running = false;
            state.queue.drain()
        };
        self.shared.changed.notify_all();
        for job in &dropped {
            warn!("Upload of {} cancelled by shutdown", job.key());
        }
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("Upload worker terminated abnormally");
            }
        }
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct UploadWorker {
    shared: Arc<Shared>,
    channels: ChannelMap,
    native: Box<dyn NativeUploader>,
}

impl UploadWorker {
    fn run(mut self) {
        info!("Upload worker started");
        while let Some(job) = self.next_job() {
            let key = job.key().clone();
            let result = catch_unwind(AssertUnwindSafe(|| self.process(job))).unwrap_or_else(|_| {
                Err(Error::new("Upload worker panicked while processing the job"))
            });
            {
                let mut state = lock(&self.shared.state);
                state.in_flight = None;
                match result {
                    Ok(job) => {
                        state.completed.insert(key, Arc::new(job));
                    }
                    Err(err) => {
                        let reason = create_error_message(&err);
                        warn!("Upload of {} failed: {}", key, reason);
                        let max_records = self.shared.settings.max_failed_records;
                        if max_records > 0 {
                            if state.failed.len() >= max_records {
                                state.failed.pop_front();
                            }
                            state.failed.push_back((key, reason));
                        }
                    }
                }
            }
            self.shared.changed.notify_all();
        }
        info!("Upload worker stopped");
    }

    /// Block until a job is available; `None` after shutdown.
    fn next_job(&self) -> Option<UploadJob> {
        let backoff = self.shared.settings.idle_backoff();
        let mut state = lock(&self.shared.state);
        loop {
            if !state.running {
                return None;
            }
            if let Some(job) = state.queue.take_highest_priority() {
                state.in_flight = Some(job.key().clone());
                return Some(job);
            }
            state = self.shared.wait_timeout(state, backoff);
        }
    }

    fn process(&mut self, mut job: UploadJob) -> Result<UploadJob> {
        let start = Instant::now();
        let mut cache = self.render(&job)?;
        let rendered = start.elapsed();

        cache.generate_dc_compensation()?;
        job.set_playback_duration(cache.npt());
        let compensated = start.elapsed();

        if let Some(trigger) = job.trigger() {
            trigger
                .compile(job.playback_duration(), job.repeat_count())
                .map_err(Error::TriggerProgram)?;
        }

        let upload_data = self
            .native
            .upload(cache, &self.channels)
            .map_err(Error::from_native)?;
        job.set_upload_data(upload_data);

        diagnostic!(
            "Uploaded {} ({} samples) in {:?}: rendering {:?}, compensation {:?}, native upload {:?}",
            job.key(),
            job.playback_duration(),
            start.elapsed(),
            rendered,
            compensated - rendered,
            start.elapsed() - compensated
        );
        Ok(job)
    }

    fn render(&self, job: &UploadJob) -> Result<WaveformCache> {
        let mut cache = WaveformCache::new(
            &self.channels,
            self.shared.settings.compensation_granularity,
        );
        let last = job.sequence().len().saturating_sub(1);
        let index = job.index();
        for (i, element) in job.sequence().iter().enumerate() {
            for (channel, config) in self.channels.iter() {
                let traits = config.module_kind.traits();
                let pre_delay = if i == 0 { config.delay.0 } else { 0 };
                let post_delay = if i == last { config.delay.1 } else { 0 };
                let sample_rate = traits.sample_rate(element.rate_divisor);
                let render_failure = |source| Error::RenderFailure {
                    channel: channel.to_string(),
                    source,
                };

                let segment = &element.segment;
                let samples = segment
                    .render(channel, index, pre_delay, post_delay, sample_rate)
                    .map_err(render_failure)?;
                let integral = if job.neutralize() {
                    // volt-seconds to volt-samples at the maximum rate
                    segment
                        .integrate(channel, index, pre_delay, post_delay, sample_rate)
                        .map_err(render_failure)?
                        * traits.max_sample_rate
                } else {
                    0.0
                };
                let v_min = segment
                    .v_min(channel, index, sample_rate)
                    .map_err(render_failure)?;
                let v_max = segment
                    .v_max(channel, index, sample_rate)
                    .map_err(render_failure)?;
                // delay padding plays 0 V
                let (v_min, v_max) = if pre_delay > 0 || post_delay > 0 {
                    (v_min.min(0.0), v_max.max(0.0))
                } else {
                    (v_min, v_max)
                };

                let rendered = RenderedSegment::new(samples, (v_min, v_max), integral).with_playback(
                    element.repeat,
                    element.rate_divisor,
                    traits.ticks_per_sample(element.rate_divisor),
                );
                cache.add_segment(channel, rendered)?;
            }
        }
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{SlotAllocator, WaveformReference};
    use crate::native::{ChannelUploadData, OutputRange, UploadData, UploadedSegment};
    use crate::renderer::SegmentRenderer;
    use crate::settings::ChannelConfig;
    use crate::upload_job::SequenceElement;
    use std::collections::HashSet;

    #[derive(Debug)]
    struct Flat {
        level: f64,
        length: u64,
        fail: bool,
    }

    impl SegmentRenderer for Flat {
        fn render(
            &self,
            _channel: &str,
            _index: &SweepIndex,
            pre_delay: u64,
            post_delay: u64,
            _sample_rate: f64,
        ) -> anyhow::Result<Vec<f64>> {
            if self.fail {
                anyhow::bail!("pulse amplitude out of range");
            }
            let mut samples = vec![0.0; pre_delay as usize];
            samples.extend(std::iter::repeat_n(self.level, self.length as usize));
            samples.extend(std::iter::repeat_n(0.0, post_delay as usize));
            Ok(samples)
        }

        fn v_min(&self, _: &str, _: &SweepIndex, _: f64) -> anyhow::Result<f64> {
            Ok(self.level)
        }

        fn v_max(&self, _: &str, _: &SweepIndex, _: f64) -> anyhow::Result<f64> {
            Ok(self.level)
        }

        fn integrate(
            &self,
            _: &str,
            _: &SweepIndex,
            _: u64,
            _: u64,
            sample_rate: f64,
        ) -> anyhow::Result<f64> {
            Ok(self.level * self.length as f64 / sample_rate)
        }
    }

    struct SlowUploader {
        allocator: Arc<SlotAllocator>,
        delay: Duration,
    }

    impl NativeUploader for SlowUploader {
        fn upload(&mut self, cache: WaveformCache, _: &ChannelMap) -> anyhow::Result<UploadData> {
            std::thread::sleep(self.delay);
            let mut data = UploadData::new();
            for (name, waveforms) in cache.into_channels() {
                let (min, max) = waveforms.envelope().unwrap_or((0.0, 0.0));
                let segments = waveforms
                    .segments()
                    .iter()
                    .map(|s| {
                        Ok(UploadedSegment {
                            waveform: WaveformReference::allocate(
                                &self.allocator,
                                vec![0; s.samples.len()],
                            )?,
                            repeat: s.repeat,
                            rate_divisor: s.rate_divisor,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                data.insert(
                    name,
                    ChannelUploadData {
                        output_range: OutputRange::new(min, max),
                        segments,
                    },
                );
            }
            Ok(data)
        }
    }

    fn start(capacity: usize, delay: Duration) -> (Uploader, Arc<SlotAllocator>) {
        let allocator = Arc::new(SlotAllocator::new("AWG1", capacity));
        let channels = ChannelMap::new([
            ChannelConfig::new("P1", "AWG1", 1).with_compensation_limits(-1.0, 1.0)
        ])
        .unwrap();
        let settings = UploaderSettings {
            lookup_grace_ms: 10,
            ..Default::default()
        };
        let native = SlowUploader {
            allocator: Arc::clone(&allocator),
            delay,
        };
        let uploader = Uploader::start(settings, channels, Box::new(native)).unwrap();
        (uploader, allocator)
    }

    fn flat_job(level: f64, fail: bool) -> UploadJob {
        let segment = Arc::new(Flat {
            level,
            length: 104,
            fail,
        });
        UploadJob::new(
            SequenceId::new(),
            [0],
            vec![SequenceElement::new(segment, 1, 0)],
            1,
        )
    }

    #[test]
    fn test_job_is_rendered_compensated_and_uploaded() {
        let (uploader, allocator) = start(10, Duration::ZERO);
        let job = flat_job(0.5, false);
        let (id, index) = (job.id(), job.index().clone());
        uploader.submit(job).unwrap();

        let done = uploader
            .await_upload(id, &index, Duration::from_secs(5))
            .unwrap();
        // 52 V*samples need 52 samples at -1 V, rounded up to 60
        assert_eq!(done.playback_duration(), 164);
        let p1 = &done.upload_data().unwrap()["P1"];
        assert_eq!(p1.segments.len(), 2);
        assert_eq!(p1.output_range.max, 0.5);
        assert!((p1.output_range.min + 52.0 / 60.0).abs() < 1e-9);
        assert_eq!(allocator.used_count(), 2);

        drop(done);
        assert!(uploader.discard(id, &index).is_some());
        assert_eq!(allocator.used_count(), 0);
        assert!(!uploader.is_completed(id, &index));
    }

    #[test]
    fn test_failed_job_is_reported_and_worker_continues() {
        let (uploader, _) = start(10, Duration::ZERO);
        let bad = flat_job(0.1, true);
        let good = flat_job(0.1, false);
        let (bad_id, bad_index) = (bad.id(), bad.index().clone());
        let (good_id, good_index) = (good.id(), good.index().clone());
        uploader.submit(bad).unwrap();
        uploader.submit(good).unwrap();

        let err = uploader
            .await_upload(bad_id, &bad_index, Duration::from_secs(5))
            .unwrap_err();
        match err {
            Error::UploadFailed { reason, .. } => {
                assert!(reason.contains("Failed to render channel 'P1'"));
                assert!(reason.contains("pulse amplitude out of range"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(
            uploader
                .await_upload(good_id, &good_index, Duration::from_secs(5))
                .is_ok()
        );
        assert!(!uploader.is_pending(bad_id, &bad_index));
        assert!(!uploader.is_completed(bad_id, &bad_index));
    }

    #[test]
    fn test_out_of_memory_aborts_only_that_job() {
        let (uploader, _) = start(2, Duration::ZERO);
        let first = flat_job(0.2, false);
        let second = flat_job(0.2, false);
        let (first_id, first_index) = (first.id(), first.index().clone());
        let (second_id, second_index) = (second.id(), second.index().clone());
        uploader.submit(first).unwrap();
        uploader
            .await_upload(first_id, &first_index, Duration::from_secs(5))
            .unwrap();
        uploader.submit(second).unwrap();
        let err = uploader
            .await_upload(second_id, &second_index, Duration::from_secs(5))
            .unwrap_err();
        match err {
            Error::UploadFailed { reason, .. } => assert!(reason.contains("Out of waveform memory")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(uploader.is_completed(first_id, &first_index));
    }

    #[test]
    fn test_await_unknown_upload_times_out() {
        let (uploader, _) = start(10, Duration::ZERO);
        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        let err = uploader
            .await_upload(SequenceId::new(), &SweepIndex::new([1]), timeout)
            .unwrap_err();
        assert!(matches!(err, Error::UploadNotFound { .. }));
        assert!(start.elapsed() >= timeout);
    }

    #[test]
    fn test_release_discarded_job() {
        let (uploader, allocator) = start(10, Duration::ZERO);
        let job = flat_job(0.3, false);
        let (id, index) = (job.id(), job.index().clone());
        uploader.submit(job).unwrap();
        drop(uploader.await_upload(id, &index, Duration::from_secs(5)).unwrap());
        assert_eq!(allocator.used_count(), 2);

        let discarded = uploader.discard(id, &index).unwrap();
        let job = Arc::try_unwrap(discarded).unwrap();
        job.release().unwrap();
        assert_eq!(allocator.used_count(), 0);
        assert!(uploader.discard(id, &index).is_none());
    }

    #[test]
    fn test_await_without_deadline() {
        let (uploader, _) = start(10, Duration::from_millis(20));
        let job = flat_job(0.2, false);
        let (id, index) = (job.id(), job.index().clone());
        uploader.submit(job).unwrap();
        let done = uploader.await_upload(id, &index, Duration::MAX).unwrap();
        assert_eq!(done.key(), &JobKey::new(id, index));
    }

    #[test]
    fn test_unrepresentable_grace_period_disables_escalation() {
        let channels = ChannelMap::new([ChannelConfig::new("P1", "AWG1", 1)]).unwrap();
        let settings = UploaderSettings::from_json(r#"{"lookup_grace_ms": 18446744073709551615}"#).unwrap();
        let native = SlowUploader {
            allocator: Arc::new(SlotAllocator::new("AWG1", 4)),
            delay: Duration::ZERO,
        };
        let uploader = Uploader::start(settings, channels, Box::new(native)).unwrap();
        let err = uploader
            .await_upload(SequenceId::new(), &SweepIndex::new([0]), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Error::UploadNotFound { .. }));
    }

    #[test]
    fn test_waiting_escalates_pending_job() {
        let (uploader, _) = start(10, Duration::from_millis(150));
        uploader.submit(flat_job(0.1, false)).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let other = flat_job(0.1, false).with_priority(5);
        let wanted = flat_job(0.1, false);
        let (other_id, other_index) = (other.id(), other.index().clone());
        let (id, index) = (wanted.id(), wanted.index().clone());
        uploader.submit(other).unwrap();
        uploader.submit(wanted).unwrap();

        uploader
            .await_upload(id, &index, Duration::from_secs(5))
            .unwrap();
        assert!(uploader.is_pending(other_id, &other_index));
        assert!(!uploader.is_completed(other_id, &other_index));
    }

    #[test]
    fn test_duplicate_submission() {
        let (uploader, _) = start(10, Duration::from_millis(100));
        let job = flat_job(0.0, false);
        let (id, index) = (job.id(), job.index().clone());
        uploader.submit(job).unwrap();
        let again = UploadJob::new(id, index.clone(), vec![], 1);
        assert!(matches!(
            uploader.submit(again),
            Err(Error::DuplicateJob { .. })
        ));
    }

    #[test]
    fn test_rearm_replaces_completed_upload() {
        let (uploader, allocator) = start(10, Duration::ZERO);
        let id = SequenceId::new();
        let segment: Arc<dyn SegmentRenderer> = Arc::new(Flat {
            level: 0.0,
            length: 10,
            fail: false,
        });
        let make = || UploadJob::new(id, [3], vec![SequenceElement::new(Arc::clone(&segment), 1, 0)], 1);
        let index = SweepIndex::new([3]);
        uploader.submit(make()).unwrap();
        let first = uploader
            .await_upload(id, &index, Duration::from_secs(5))
            .unwrap();
        let first_slot = first.upload_data().unwrap()["P1"].segments[0].slot();

        uploader.submit(make()).unwrap();
        let second = uploader
            .await_upload(id, &index, Duration::from_secs(5))
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(uploader.completed_keys().len(), 1);

        // The replaced upload keeps its slot while it is still referenced.
        assert!(allocator.is_allocated(first_slot));
        drop(first);
        assert!(!allocator.is_allocated(first_slot));
    }

    #[test]
    fn test_submit_after_shutdown() {
        let (mut uploader, _) = start(10, Duration::ZERO);
        uploader.shutdown();
        assert!(matches!(
            uploader.submit(flat_job(0.0, false)),
            Err(Error::ShutDown)
        ));
    }

    #[test]
    fn test_slots_unique_across_jobs() {
        let (uploader, _) = start(50, Duration::ZERO);
        let keys: Vec<_> = (0..10)
            .map(|_| {
                let job = flat_job(0.0, false);
                let key = (job.id(), job.index().clone());
                uploader.submit(job).unwrap();
                key
            })
            .collect();
        let mut slots = HashSet::new();
        for (id, index) in &keys {
            let job = uploader
                .await_upload(*id, index, Duration::from_secs(5))
                .unwrap();
            for (_, channel) in job.upload_data().unwrap() {
                for (slot, _, _) in channel.queue_entries() {
                    assert!(slots.insert(slot));
                }
            }
        }
        assert_eq!(slots.len(), 10);
    }
}
