mod common;

use std::sync::Arc;

use camstream::{
    BackendKind, BackendRegistry, BootError, ImageFileSink, Platform, ProcessingType, SnapProcess, SnapshotStatus,
    SourceConfig, StreamId, StreamParam, StreamRegistry, StreamState,
};
use common::{backends, context, dial_source, registry, wait_for, Dial, MemoryEncoders, MemorySink};
use image::{GrayImage, Luma};

const CAM0: StreamId = StreamId::Camera(0);

/// A still image with a bright square, so thresholding has something to find.
fn still_image(dir: &std::path::Path) -> String {
    let path = dir.join("still.png");
    GrayImage::from_fn(64, 48, |x, y| {
        Luma([if (20..44).contains(&x) && (12..36).contains(&y) { 235 } else { 25 }])
    })
    .save(&path)
    .unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn static_image_snapshot_is_filled() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(ImageFileSink::in_dir(dir.path()));
    let reg = registry(BackendRegistry::default(), context(sink, &MemoryEncoders::default()));
    reg.try_boot(&[SourceConfig::static_image(still_image(dir.path()))]).unwrap();

    assert!(wait_for(|| reg.state(CAM0) == StreamState::Polling));
    let req = reg.request_snapshot(CAM0, "out.png", SnapProcess::Indifferent);
    assert!(wait_for(|| req.status() != SnapshotStatus::Requested));

    assert_eq!(req.status(), SnapshotStatus::Filled, "err: {}", req.err());
    assert!(req.frame_id() >= 1);
    assert!(req.frame_id() <= reg.camera_feed_changes(CAM0));
    assert!(dir.path().join("out.png").exists());

    let sidecar = std::fs::read_to_string(dir.path().join("out.png.json")).unwrap();
    let meta: serde_json::Value = serde_json::from_str(&sidecar).unwrap();
    assert_eq!(meta["stream_name"], "CAM0");
    assert_eq!(meta["stream_type"], "static");
    assert_eq!(meta["frame_id"], req.frame_id().to_string());

    assert!(reg.shutdown());
}

#[test]
fn processing_toggle_changes_published_frame() {
    let dir = tempfile::tempdir().unwrap();
    let reg = registry(
        BackendRegistry::default(),
        context(Arc::new(MemorySink::default()), &MemoryEncoders::default()),
    );
    reg.try_boot(&[SourceConfig::static_image(still_image(dir.path()))]).unwrap();

    assert!(wait_for(|| reg.current_frame(CAM0).is_some()));
    let raw = reg.current_frame(CAM0).unwrap();
    assert!(!reg.is_thresholded(CAM0));

    assert!(reg.set_processing_type(CAM0, ProcessingType::StaticThreshold));
    assert!(reg.set_param(CAM0, StreamParam::StaticThreshold, 128.0));
    assert!(reg.is_thresholded(CAM0));
    assert_eq!(reg.processing_type(CAM0), ProcessingType::StaticThreshold);

    let seen = reg.camera_feed_changes(CAM0);
    assert!(wait_for(|| reg.camera_feed_changes(CAM0) > seen + 1));
    let processed = reg.current_frame(CAM0).unwrap();
    assert_ne!(processed.data, raw.data);

    // The composite never processes
    assert!(!reg.set_processing_type(StreamId::Composite, ProcessingType::StaticThreshold));
    assert!(!reg.is_thresholded(StreamId::Composite));
}

#[test]
fn snapshot_all_covers_every_stream() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::default());
    let reg = registry(BackendRegistry::default(), context(sink.clone(), &MemoryEncoders::default()));
    let mut processed = SourceConfig::static_image(still_image(dir.path()));
    processed.processing = camstream::config::ProcessingSetting::Named(ProcessingType::TwoStdDevFromMean);
    reg.try_boot(&[SourceConfig::static_image(still_image(dir.path())), processed])
        .unwrap();
    assert!(wait_for(|| reg.state(StreamId::Camera(1)) == StreamState::Polling));

    reg.set_all_snap_caption("PATIENT 7");
    let reqs = reg.request_snapshot_all("shots/a.png");
    let names: Vec<_> = reqs.iter().map(|r| r.filename().to_string()).collect();
    assert_eq!(
        names,
        [
            "shots/a_CAM0RAW.png",
            "shots/a_CAM1RAW.png",
            "shots/a_CAM1IMPROC.png",
            "shots/a_COMPRAW.png",
        ]
    );
    assert!(wait_for(|| reqs.iter().all(|r| r.status() == SnapshotStatus::Filled)));

    let saved = sink.saved.lock().unwrap();
    let comp = saved.iter().find(|(f, _)| f.contains("COMP")).unwrap();
    assert_eq!(comp.1["stream_type"], "composite");
    let improc = saved.iter().find(|(f, _)| f.contains("IMPROC")).unwrap();
    assert_eq!(improc.1["threshold_method"], ProcessingType::TwoStdDevFromMean.to_string());
}

#[test]
fn clearing_requests_cancels_held_handles() {
    let dial = Dial::new(16, 12);
    dial.online.store(false, std::sync::atomic::Ordering::SeqCst);
    let reg = registry(
        backends(&dial),
        context(Arc::new(MemorySink::default()), &MemoryEncoders::default()),
    );
    reg.try_boot(&[dial_source()]).unwrap();

    let a = reg.request_snapshot(CAM0, "a.png", SnapProcess::Indifferent);
    let b = reg.request_snapshot(CAM0, "b.png", SnapProcess::HasTo);
    assert_eq!(reg.clear_snapshot_requests(CAM0), 2);

    for req in [&a, &b] {
        assert_eq!(req.status(), SnapshotStatus::Error);
        assert!(req.is_cancelled());
    }
    assert_eq!(reg.clear_snapshot_requests(CAM0), 0);

    // Cancelled stays cancelled once frames flow
    dial.online.store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(wait_for(|| reg.camera_feed_changes(CAM0) > 2));
    assert!(a.is_cancelled());
    assert_eq!(a.frame_id(), 0);
}

#[test]
fn camera_reconnects_after_losing_device() {
    let dial = Dial::new(16, 12);
    let reg = registry(
        backends(&dial),
        context(Arc::new(MemorySink::default()), &MemoryEncoders::default()),
    );
    reg.try_boot(&[dial_source()]).unwrap();
    assert!(wait_for(|| reg.stream_dimensions(CAM0) == Some((16, 12))));
    assert_eq!(reg.state(CAM0), StreamState::Polling);

    dial.online.store(false, std::sync::atomic::Ordering::SeqCst);
    assert!(wait_for(|| reg.state(CAM0) != StreamState::Polling));
    assert_eq!(reg.ms_frame_time(CAM0), 0);

    dial.online.store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(wait_for(|| reg.state(CAM0) == StreamState::Polling));
    assert!(wait_for(|| reg.stream_frame_count(CAM0) > 0));
}

#[test]
fn platform_rejection_starts_no_workers() {
    let reg = StreamRegistry::new(
        Platform::Embedded,
        BackendRegistry::default(),
        context(Arc::new(MemorySink::default()), &MemoryEncoders::default()),
    );
    let sources = [SourceConfig::static_image("a.png"), SourceConfig::default()];
    let err = reg.try_boot(&sources).unwrap_err();
    assert!(matches!(
        err,
        BootError::Platform {
            index: 1,
            kind: BackendKind::UsbIndex,
            ..
        }
    ));
    assert!(!reg.is_booted());
    assert_eq!(reg.state(StreamId::Composite), StreamState::Unknown);

    // A per-OS override makes the same source legal
    let fixed = SourceConfig {
        linux_poll: Some(BackendKind::StaticImage),
        ..SourceConfig::default()
    };
    reg.try_boot(&[sources[0].clone(), fixed]).unwrap();
    assert_eq!(reg.poll_type(StreamId::Camera(1)), BackendKind::StaticImage);
}

#[test]
fn shutdown_is_idempotent_and_final() {
    let dial = Dial::new(8, 8);
    let reg = registry(
        backends(&dial),
        context(Arc::new(MemorySink::default()), &MemoryEncoders::default()),
    );
    reg.try_boot(&[dial_source(), dial_source()]).unwrap();
    assert!(wait_for(|| reg.state(StreamId::Camera(1)) == StreamState::Polling));

    assert!(reg.shutdown());
    assert!(reg.shutdown());
    assert!(!reg.is_booted());
    assert_eq!(reg.state(CAM0), StreamState::Unknown);
    assert!(reg.current_frame(CAM0).is_none());
    assert!(matches!(reg.try_boot(&[dial_source()]), Err(BootError::ShutDown)));
}

#[test]
fn composite_params_are_validated() {
    let dial = Dial::new(8, 8);
    let reg = registry(
        backends(&dial),
        context(Arc::new(MemorySink::default()), &MemoryEncoders::default()),
    );
    reg.try_boot(&[dial_source()]).unwrap();

    assert_eq!(reg.get_param(StreamId::Composite, StreamParam::CompositeWidth), Some(64.0));
    assert!(!reg.set_param(StreamId::Composite, StreamParam::CompositeWidth, 0.0));
    assert!(reg.set_param(StreamId::Composite, StreamParam::CompositeWidth, 80.0));
    assert!(wait_for(|| reg
        .current_frame(StreamId::Composite)
        .is_some_and(|f| f.width() == 80)));

    // Sizes the canvas can't allocate are refused and the worker keeps going
    assert!(!reg.set_param(StreamId::Composite, StreamParam::CompositeWidth, 1e30));
    assert!(!reg.set_param(StreamId::Composite, StreamParam::CompositeHeight, f64::INFINITY));
    assert_eq!(reg.get_param(StreamId::Composite, StreamParam::CompositeWidth), Some(80.0));
    let seen = reg.camera_feed_changes(StreamId::Composite);
    assert!(wait_for(|| reg.camera_feed_changes(StreamId::Composite) > seen + 2));
    assert_eq!(reg.state(StreamId::Composite), StreamState::Polling);

    // Cameras don't have a canvas
    assert!(!reg.set_param(CAM0, StreamParam::CompositeHeight, 10.0));
    assert_eq!(reg.get_param(CAM0, StreamParam::CompositeHeight), None);
    assert!(reg.set_param(CAM0, StreamParam::Alpha, 0.5));
    assert_eq!(reg.get_param(CAM0, StreamParam::Alpha), Some(0.5));
}
