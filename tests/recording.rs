mod common;

use std::sync::Arc;

use camstream::{StreamId, StreamState, VideoStatus};
use common::{backends, context, dial_source, registry, wait_for, Dial, MemoryEncoders, MemorySink};

const CAM0: StreamId = StreamId::Camera(0);

fn booted(dial: &Dial, encoders: &MemoryEncoders) -> camstream::StreamRegistry {
    let reg = registry(backends(dial), context(Arc::new(MemorySink::default()), encoders));
    reg.try_boot(&[dial_source()]).unwrap();
    assert!(wait_for(|| reg.current_frame(CAM0).is_some()));
    reg
}

#[test]
fn empty_filename_leaves_recording_alone() {
    let dial = Dial::new(16, 12);
    let encoders = MemoryEncoders::default();
    let reg = booted(&dial, &encoders);

    let active = reg.record_video(CAM0, "take1.y4m");
    assert_eq!(active.status(), VideoStatus::StreamingOut);

    let bad = reg.record_video(CAM0, "");
    assert_eq!(bad.status(), VideoStatus::Error);
    assert!(!bad.err().is_empty());
    assert_eq!(active.status(), VideoStatus::StreamingOut);
    assert_eq!(reg.recording_filename(CAM0).as_deref(), Some("take1.y4m"));
}

#[test]
fn new_recording_closes_the_previous_one() {
    let dial = Dial::new(16, 12);
    let encoders = MemoryEncoders::default();
    let reg = booted(&dial, &encoders);

    let first = reg.record_video(CAM0, "a.y4m");
    assert!(Arc::ptr_eq(&first, &reg.record_video(CAM0, "a.y4m")));

    let second = reg.record_video(CAM0, "b.y4m");
    assert_eq!(first.status(), VideoStatus::Closed);
    assert_eq!(second.status(), VideoStatus::StreamingOut);
    assert!(reg.is_recording(CAM0));

    assert!(reg.stop_recording(CAM0));
    assert_eq!(second.status(), VideoStatus::Closed);
    assert!(!reg.is_recording(CAM0));
    assert!(!reg.stop_recording(CAM0));
}

#[test]
fn size_change_mid_recording_is_an_error() {
    let dial = Dial::new(16, 12);
    let encoders = MemoryEncoders::default();
    let reg = booted(&dial, &encoders);

    let req = reg.record_video(CAM0, "a.y4m");
    assert_eq!(req.dimensions(), Some((16, 12)));
    assert!(wait_for(|| encoders.frames.lock().unwrap().len() > 2));

    dial.resize(20, 10);
    assert!(wait_for(|| req.status() == VideoStatus::Error));
    assert!(!req.err().is_empty());
    assert!(encoders.frames.lock().unwrap().iter().all(|&d| d == (16, 12)));
    assert!(!reg.is_recording(CAM0));
}

#[test]
fn stop_flag_is_honoured_by_the_worker() {
    let dial = Dial::new(16, 12);
    let encoders = MemoryEncoders::default();
    let reg = booted(&dial, &encoders);

    let req = reg.record_video(CAM0, "a.y4m");
    req.request_stop();
    assert!(wait_for(|| req.status() == VideoStatus::Closed));
    assert!(reg.recording_filename(CAM0).is_none());
    assert_eq!(reg.state(CAM0), StreamState::Polling);
}

#[test]
fn unknown_stream_gets_a_failed_recording() {
    let dial = Dial::new(16, 12);
    let reg = booted(&dial, &MemoryEncoders::default());
    let req = reg.record_video(StreamId::Camera(5), "a.y4m");
    assert_eq!(req.status(), VideoStatus::Error);
    assert_eq!(req.stream(), StreamId::Camera(5));
}

#[test]
fn composite_can_be_recorded() {
    let dial = Dial::new(16, 12);
    let encoders = MemoryEncoders::default();
    let reg = booted(&dial, &encoders);
    assert!(wait_for(|| reg.current_frame(StreamId::Composite).is_some()));

    let req = reg.record_video(StreamId::Composite, "comp.y4m");
    assert_eq!(req.dimensions(), Some((64, 36)));
    assert!(wait_for(|| encoders.frames.lock().unwrap().len() > 3));
    assert_eq!(req.status(), VideoStatus::StreamingOut);
}
