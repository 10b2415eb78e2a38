//! DFU 1.1 download sequencing against the scripted device.

mod common;

use common::{MockTransport, RecordedEvents, descriptor, identification};
use udfu::{DfuAttributes, DfuEngine, DfuError, DfuState, ErrorCode};

fn engine_with(mock: MockTransport, transfer_size: u16) -> DfuEngine<MockTransport> {
    DfuEngine::new(
        mock,
        descriptor(DfuAttributes::CAN_DOWNLOAD, transfer_size, false),
        identification(false),
    )
    .unwrap()
}

#[test]
fn test_download_chunks_and_progress() {
    let mut engine = engine_with(MockTransport::new(), 4);
    let mut events = RecordedEvents::default();

    engine
        .download(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], &mut events)
        .unwrap();

    let written = &engine.transport().written;
    assert_eq!(written.len(), 3);
    assert_eq!(written[0], (0, vec![1, 2, 3, 4]));
    assert_eq!(written[1], (1, vec![5, 6, 7, 8]));
    assert_eq!(written[2], (2, vec![9, 10]));

    assert_eq!(events.progress, vec![(40, 4), (80, 8), (100, 10)]);
}

#[test]
fn test_every_chunk_observes_exactly_one_dnload_idle() {
    let mut mock = MockTransport::new();
    mock.busy_polls = 2;
    let mut engine = engine_with(mock, 2);
    let mut events = RecordedEvents::default();

    engine.download(&[0; 10], &mut events).unwrap();

    // per chunk: one DNLOAD, then statuses ending in exactly one
    // dfuDNLOAD-IDLE observation before the next DNLOAD
    let log = &engine.transport().log;
    let mut idle_seen = 0;
    let mut chunks = 0;
    for entry in log.iter().skip_while(|e| !e.starts_with("DNLOAD")) {
        if entry.starts_with("DNLOAD:") {
            if chunks > 0 {
                assert_eq!(idle_seen, 1, "chunk not acknowledged exactly once");
            }
            chunks += 1;
            idle_seen = 0;
        } else if entry == "STATUS:dfuDNLOAD-IDLE" {
            idle_seen += 1;
        }
    }
    assert_eq!(chunks, 5);
    assert_eq!(idle_seen, 1);

    // the busy polls were honoured too
    let busy = log.iter().filter(|e| *e == "STATUS:dfuDNBUSY").count();
    assert_eq!(busy, 10);
}

#[test]
fn test_download_requires_capability() {
    let mock = MockTransport::new();
    let mut engine = DfuEngine::new(
        mock,
        descriptor(DfuAttributes::CAN_UPLOAD, 64, false),
        identification(false),
    )
    .unwrap();
    assert!(matches!(
        engine.download(&[0; 4], &mut RecordedEvents::default()),
        Err(DfuError::DownloadNotSupported)
    ));
    assert!(engine.transport().log.is_empty());
}

#[test]
fn test_device_error_is_reported_and_raised() {
    let mut mock = MockTransport::new();
    mock.fail_block = Some(1);
    mock.fail_error = ErrorCode::ErrWrite;
    let mut engine = engine_with(mock, 2);
    let mut events = RecordedEvents::default();

    let err = engine.download(&[0; 8], &mut events).unwrap_err();
    assert!(matches!(
        err,
        DfuError::InvalidState {
            expected: DfuState::DnloadIdle,
            actual: DfuState::Error,
        }
    ));
    assert_eq!(events.errors, vec!["device is unable to write memory"]);
}

#[test]
fn test_failed_transfer_aborts_best_effort() {
    let mut mock = MockTransport::new();
    mock.reject_block = Some(2);
    let mut engine = engine_with(mock, 2);

    let err = engine
        .download(&[0; 8], &mut RecordedEvents::default())
        .unwrap_err();
    assert!(matches!(err, DfuError::PersistentTransfer(_)));

    // the engine left the device recoverable
    let log = &engine.transport().log;
    assert_eq!(log.last().map(String::as_str), Some("ABORT"));
}

#[test]
fn test_reset_to_idle_clears_error_and_notifies() {
    let mut mock = MockTransport::new();
    mock.state = DfuState::Error;
    mock.error = ErrorCode::ErrVendor;
    mock.i_string = 5;
    mock.vendor_string = Some((5, "flash is locked".to_string()));
    let mut engine = engine_with(mock, 64);
    let mut events = RecordedEvents::default();

    engine.reset_to_idle(&mut events).unwrap();

    assert_eq!(events.errors, vec!["flash is locked"]);
    let log = &engine.transport().log;
    assert!(log.contains(&"CLRSTATUS".to_string()));
}

#[test]
fn test_reset_to_idle_aborts_stale_session() {
    let mut mock = MockTransport::new();
    mock.state = DfuState::DnloadIdle;
    let mut engine = engine_with(mock, 64);

    engine.reset_to_idle(&mut RecordedEvents::default()).unwrap();

    let log = &engine.transport().log;
    assert!(log.contains(&"ABORT".to_string()));
}

#[test]
fn test_reset_to_idle_rejects_unexpected_state() {
    let mut mock = MockTransport::new();
    mock.state = DfuState::AppIdle;
    let mut engine = engine_with(mock, 64);

    assert!(matches!(
        engine.reset_to_idle(&mut RecordedEvents::default()),
        Err(DfuError::InvalidState {
            expected: DfuState::Idle,
            actual: DfuState::AppIdle,
        })
    ));
}

#[test]
fn test_unsupported_version_rejected() {
    let mut descriptor = descriptor(DfuAttributes::CAN_DOWNLOAD, 64, false);
    descriptor.dfu_version = udfu::Version(1, 0);
    assert!(matches!(
        DfuEngine::new(MockTransport::new(), descriptor, identification(false)),
        Err(DfuError::UnsupportedDfuVersion(_))
    ));
}
