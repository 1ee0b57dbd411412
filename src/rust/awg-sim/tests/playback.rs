// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use awg_sim::{RecordingTriggerProgram, SampledSegment, SimEvent};
use awg_uploader::Error;
use awg_uploader::device_traits::{AwgModule, TriggerMode};
use awg_uploader::playback::PlaybackCoordinator;
use awg_uploader::settings::ChannelConfig;
use awg_uploader::trigger::{TriggerBinding, TriggerProgram};
use awg_uploader::upload_job::{SequenceElement, SequenceId, SweepIndex, UploadJob};

use common::Rig;

fn rig() -> Rig {
    Rig::new([
        ChannelConfig::new("P1", "AWG1", 1),
        ChannelConfig::new("P2", "AWG1", 2),
    ])
}

fn two_segment_job(id: SequenceId) -> UploadJob {
    let pulse = Arc::new(SampledSegment::new().with_channel("P1", vec![-0.5, 0.5]));
    let hold = Arc::new(SampledSegment::constant("P1", 0.25, 4));
    UploadJob::new(
        id,
        [0],
        vec![
            SequenceElement::new(pulse, 1, 0),
            SequenceElement::new(hold, 10, 2),
        ],
        1,
    )
}

fn position(events: &[SimEvent], matches: impl Fn(&SimEvent) -> bool) -> usize {
    events.iter().position(matches).unwrap()
}

#[test]
fn test_play_programs_queues_before_start() {
    let rig = rig();
    let program = Arc::new(RecordingTriggerProgram::new(rig.log.clone()));
    let id = SequenceId::new();
    let job = two_segment_job(id).with_trigger_program(TriggerBinding::new(Arc::clone(&program) as Arc<dyn TriggerProgram>));
    rig.uploader.submit(job).unwrap();

    let played = rig
        .coordinator()
        .play(&rig.uploader, id, &SweepIndex::new([0]))
        .unwrap();
    assert_eq!(program.compiled(), Some((played.playback_duration(), 1)));

    let module = rig.module("AWG1");
    let queue = module.queue(1);
    assert_eq!(
        queue.iter().map(|e| e.trigger).collect::<Vec<_>>(),
        [TriggerMode::External, TriggerMode::Auto]
    );
    assert_eq!(
        queue.iter().map(|e| (e.repeat, e.rate_divisor, e.start_delay)).collect::<Vec<_>>(),
        [(1, 0, 0), (10, 2, 0)]
    );
    assert_eq!(module.output(1), Some((0.5, 0.0)));
    assert_eq!(module.output(2), Some((0.0, 0.0)));
    assert_eq!(module.queue(2).len(), 2);

    let events = rig.log.events();
    let flush = position(&events, |e| {
        matches!(e, SimEvent::Flush { channel: 1, .. })
    });
    let range = position(&events, |e| {
        matches!(e, SimEvent::OutputRange { channel: 1, .. })
    });
    let first_queue = position(&events, |e| {
        matches!(e, SimEvent::Queue { channel: 1, .. })
    });
    let last_queue = events
        .iter()
        .rposition(|e| matches!(e, SimEvent::Queue { .. }))
        .unwrap();
    let load = position(&events, |e| *e == SimEvent::Load);
    let start = position(&events, |e| *e == SimEvent::Start);
    assert!(flush < range && range < first_queue);
    assert!(last_queue < load && load < start);
}

#[test]
fn test_replay_flushes_previous_queue() {
    let rig = rig();
    let id = SequenceId::new();
    rig.uploader.submit(two_segment_job(id)).unwrap();
    let coordinator = rig.coordinator();
    let index = SweepIndex::new([0]);
    coordinator.play(&rig.uploader, id, &index).unwrap();
    coordinator.play(&rig.uploader, id, &index).unwrap();
    assert_eq!(rig.module("AWG1").queue(1).len(), 2);
}

#[test]
fn test_custom_start_function() {
    let rig = rig();
    let program = Arc::new(RecordingTriggerProgram::new(rig.log.clone()));
    let seen_modules = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&seen_modules);
    let binding = TriggerBinding::new(program).with_start_function(move |program, context| {
        seen.store(context.modules.len(), Ordering::SeqCst);
        program.start()
    });
    let id = SequenceId::new();
    rig.uploader
        .submit(two_segment_job(id).with_trigger_program(binding))
        .unwrap();
    rig.coordinator()
        .play(&rig.uploader, id, &SweepIndex::new([0]))
        .unwrap();

    assert_eq!(seen_modules.load(Ordering::SeqCst), 1);
    let events = rig.log.events();
    assert!(events.contains(&SimEvent::Start));
    assert!(!events.contains(&SimEvent::Load));
}

#[test]
fn test_default_trigger_used_without_job_trigger() {
    let rig = rig();
    let program = Arc::new(RecordingTriggerProgram::new(rig.log.clone()));
    program.compile(1000, 1).unwrap();
    let coordinator = rig.coordinator().with_default_trigger(Arc::clone(&program) as Arc<dyn TriggerProgram>);
    let id = SequenceId::new();
    rig.uploader.submit(two_segment_job(id)).unwrap();
    coordinator
        .play(&rig.uploader, id, &SweepIndex::new([0]))
        .unwrap();

    assert_eq!(program.compiled(), Some((1000, 1)));
    let events = rig.log.events();
    assert!(events.contains(&SimEvent::Load));
    assert!(events.contains(&SimEvent::Start));
}

#[test]
fn test_play_without_trigger_only_arms() {
    let rig = rig();
    let id = SequenceId::new();
    rig.uploader.submit(two_segment_job(id)).unwrap();
    rig.coordinator()
        .play(&rig.uploader, id, &SweepIndex::new([0]))
        .unwrap();
    let events = rig.log.events();
    assert!(!events.contains(&SimEvent::Start));
    assert_eq!(rig.module("AWG1").queue(1).len(), 2);
}

#[test]
fn test_play_unknown_sequence() {
    let rig = rig();
    let coordinator = rig
        .coordinator()
        .with_await_timeout(Duration::from_millis(50));
    let err = coordinator
        .play(&rig.uploader, SequenceId::new(), &SweepIndex::new([3]))
        .unwrap_err();
    assert!(matches!(err, Error::UploadNotFound { .. }));
    assert!(rig.log.events().is_empty());
}

#[test]
fn test_failed_upload_is_reported_by_play() {
    let rig = Rig::new([ChannelConfig::new("P1", "AWG1", 1).with_amplitude(0.2)]);
    let id = SequenceId::new();
    rig.uploader.submit(two_segment_job(id)).unwrap();
    let err = rig
        .coordinator()
        .play(&rig.uploader, id, &SweepIndex::new([0]))
        .unwrap_err();
    assert!(matches!(err, Error::UploadFailed { .. }));
    assert!(rig.module("AWG1").queue(1).is_empty());
    // waiting again no longer sees the failure
    let err = rig
        .uploader
        .await_upload(id, &SweepIndex::new([0]), Duration::from_millis(20))
        .unwrap_err();
    assert!(matches!(err, Error::UploadNotFound { .. }));
}

#[test]
fn test_coordinator_rejects_unknown_module() {
    let rig = Rig::new([
        ChannelConfig::new("P1", "AWG1", 1),
        ChannelConfig::new("B1", "AWG2", 1),
    ]);
    let only_first = [Arc::clone(rig.module("AWG1")) as Arc<dyn AwgModule>];
    let err = PlaybackCoordinator::new(only_first, rig.channels.clone(), &rig.settings)
        .err()
        .unwrap();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("unknown module 'AWG2'"));
}
