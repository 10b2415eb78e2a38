//! Reconfiguration, manifestation, and upload paths that survive the device
//! leaving the bus.

mod common;

use common::{MockTransport, RecordedEvents, descriptor, identification};
use udfu::{DfuAttributes, DfuEngine, DfuError, DfuState, Transport};

fn engine_with(
    mock: MockTransport,
    attributes: DfuAttributes,
    transfer_size: u16,
) -> DfuEngine<MockTransport> {
    DfuEngine::new(
        mock,
        descriptor(attributes, transfer_size, false),
        identification(false),
    )
    .unwrap()
}

#[test]
fn test_reconfigure_swallows_detach_stall_when_will_detach() {
    let mut mock = MockTransport::new();
    mock.state = DfuState::AppIdle;
    mock.vanish_on_detach = true;
    let mut engine = engine_with(
        mock,
        DfuAttributes::CAN_DOWNLOAD | DfuAttributes::WILL_DETACH,
        64,
    );

    engine.reconfigure().unwrap();

    let mock = engine.transport();
    assert_eq!(mock.detaches.len(), 1);
    assert!(!mock.is_open());
    // the device resets itself, no bus reset from our side
    assert_eq!(mock.bus_resets, 0);
}

#[test]
fn test_reconfigure_propagates_detach_stall_otherwise() {
    let mut mock = MockTransport::new();
    mock.state = DfuState::AppIdle;
    mock.vanish_on_detach = true;
    let mut engine = engine_with(mock, DfuAttributes::CAN_DOWNLOAD, 64);

    assert!(engine.reconfigure().is_err());
}

#[test]
fn test_reconfigure_resets_bus_when_device_stays() {
    let mut mock = MockTransport::new();
    mock.state = DfuState::AppIdle;
    let mut engine = engine_with(mock, DfuAttributes::CAN_DOWNLOAD, 64);

    engine.reconfigure().unwrap();

    let mock = engine.transport();
    assert_eq!(mock.detaches.len(), 1);
    assert_eq!(mock.bus_resets, 1);
    assert!(!mock.is_open());
}

#[test]
fn test_reconfigure_requires_application_mode() {
    let mut engine = engine_with(MockTransport::new(), DfuAttributes::CAN_DOWNLOAD, 64);
    assert!(matches!(
        engine.reconfigure(),
        Err(DfuError::InvalidState {
            expected: DfuState::AppIdle,
            actual: DfuState::Idle,
        })
    ));
}

#[test]
fn test_manifest_tolerant_polls_to_idle_and_resets() {
    let mut mock = MockTransport::new();
    mock.state = DfuState::DnloadIdle;
    mock.manifest_polls = 3;
    mock.manifest_terminal = DfuState::Idle;
    let mut engine = engine_with(
        mock,
        DfuAttributes::CAN_DOWNLOAD | DfuAttributes::MANIFESTATION_TOLERANT,
        64,
    );

    engine.manifest().unwrap();

    let mock = engine.transport();
    assert!(mock.log.contains(&"DNLOAD:ZLP".to_string()));
    let manifest_polls = mock
        .log
        .iter()
        .filter(|e| *e == "STATUS:dfuMANIFEST")
        .count();
    assert_eq!(manifest_polls, 3);
    assert_eq!(mock.bus_resets, 1);
    assert!(!mock.is_open());
}

#[test]
fn test_manifest_intolerant_waits_for_reset() {
    let mut mock = MockTransport::new();
    mock.state = DfuState::DnloadIdle;
    mock.manifest_terminal = DfuState::ManifestWaitReset;
    let mut engine = engine_with(mock, DfuAttributes::CAN_DOWNLOAD, 64);

    engine.manifest().unwrap();

    let mock = engine.transport();
    assert_eq!(mock.bus_resets, 1);
    assert!(!mock.is_open());
}

#[test]
fn test_manifest_detaching_device_may_vanish() {
    let mut mock = MockTransport::new();
    mock.state = DfuState::DnloadIdle;
    mock.vanish_in_manifest = true;
    let mut engine = engine_with(
        mock,
        DfuAttributes::CAN_DOWNLOAD | DfuAttributes::WILL_DETACH,
        64,
    );

    // the device tears down its own stack; the error is tolerated
    engine.manifest().unwrap();
    assert!(!engine.transport().is_open());
}

#[test]
fn test_manifest_vanishing_is_an_error_when_tolerant() {
    let mut mock = MockTransport::new();
    mock.state = DfuState::DnloadIdle;
    mock.vanish_in_manifest = true;
    let mut engine = engine_with(
        mock,
        DfuAttributes::CAN_DOWNLOAD
            | DfuAttributes::MANIFESTATION_TOLERANT
            | DfuAttributes::WILL_DETACH,
        64,
    );

    assert!(engine.manifest().is_err());
}

#[test]
fn test_manifest_wrong_terminal_state() {
    let mut mock = MockTransport::new();
    mock.state = DfuState::DnloadIdle;
    mock.manifest_terminal = DfuState::Idle;
    let mut engine = engine_with(mock, DfuAttributes::CAN_DOWNLOAD, 64);

    assert!(matches!(
        engine.manifest(),
        Err(DfuError::InvalidState {
            expected: DfuState::ManifestWaitReset,
            actual: DfuState::Idle,
        })
    ));
}

#[test]
fn test_upload_stops_on_short_transfer() {
    let mut mock = MockTransport::new();
    mock.upload_data = (0..100u8).collect();
    mock.transfer_size = 64;
    let mut engine = engine_with(mock, DfuAttributes::CAN_UPLOAD, 64);

    let data = engine.upload(None, &mut RecordedEvents::default()).unwrap();

    assert_eq!(data, (0..100u8).collect::<Vec<u8>>());
    let mock = engine.transport();
    assert!(mock.log.contains(&"UPLOAD:0:64".to_string()));
    assert!(mock.log.contains(&"UPLOAD:1:64".to_string()));
    // the short second read ended the session, no zero-length close
    assert!(!mock.log.contains(&"UPLOAD:2:0".to_string()));
}

#[test]
fn test_upload_closes_session_after_full_final_read() {
    let mut mock = MockTransport::new();
    mock.upload_data = vec![0xA5; 128];
    mock.transfer_size = 64;
    let mut engine = engine_with(mock, DfuAttributes::CAN_UPLOAD, 64);

    let data = engine
        .upload(Some(128), &mut RecordedEvents::default())
        .unwrap();

    assert_eq!(data.len(), 128);
    // the final read was a full transfer unit, so a zero-length upload
    // closed the session
    assert!(
        engine
            .transport()
            .log
            .contains(&"UPLOAD:2:0".to_string())
    );
}

#[test]
fn test_upload_requires_capability() {
    let mut engine = engine_with(MockTransport::new(), DfuAttributes::CAN_DOWNLOAD, 64);
    assert!(matches!(
        engine.upload(None, &mut RecordedEvents::default()),
        Err(DfuError::UploadNotSupported)
    ));
}
