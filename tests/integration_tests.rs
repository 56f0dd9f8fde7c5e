//! End-to-end tests: a full stack on a mock driver, exercised the way a
//! host application and a diagnostic tester would.

use ecustack::driver::mock::{MockCan, MockNv};
use ecustack::network::{NmControlBits, NmPdu, NmState, WakeReason};
use ecustack::stack::{EcuStack, StackConfig};
use ecustack::transport::encode_can_id;
use ecustack::types::Frame;

const ECU_PHYS: u8 = 0x10;
const TESTER: u8 = 0xF1;

type Stack = EcuStack<MockCan, MockNv>;

fn build_stack() -> Stack {
    let mut stack = EcuStack::new(StackConfig::default(), MockCan::new(), MockNv::new()).unwrap();
    stack.power_on().unwrap();
    pump(&mut stack);
    stack
}

/// Runs service passes until idle, confirming every transmitted frame back
/// into the stack. Returns the frames sent during the run.
fn pump(stack: &mut Stack) -> Vec<Frame> {
    let mut sent = Vec::new();
    for _ in 0..128 {
        stack.service().unwrap();
        let batch = stack.driver_mut().take_sent();
        for frame in &batch {
            stack.on_msg_sent(frame.id);
        }
        sent.extend(batch);
        if !stack.has_pending_work() {
            return sent;
        }
    }
    panic!("stack did not reach idle");
}

fn run_ms(stack: &mut Stack, ms: u32) -> Vec<Frame> {
    let mut sent = Vec::new();
    for _ in 0..ms {
        stack.tick();
        if stack.has_pending_work() {
            sent.extend(pump(stack));
        }
    }
    sent
}

/// Injects a physically addressed tester frame.
fn inject_tester_frame(stack: &mut Stack, data: &[u8]) {
    let frame = Frame {
        id: encode_can_id(false, ECU_PHYS, TESTER),
        data: data.to_vec(),
        is_extended: true,
        ..Default::default()
    };
    stack.driver_mut().inject(frame);
    stack.on_msg_received();
}

/// Frames addressed to the tester (diagnostic responses).
fn diag_frames(sent: &[Frame]) -> Vec<&Frame> {
    let id = encode_can_id(false, TESTER, ECU_PHYS);
    sent.iter().filter(|f| f.id == id).collect()
}

/// Reassembles one multi-frame message from captured response frames.
fn reassemble(frames: &[&Frame]) -> Vec<u8> {
    let ff = frames[0];
    assert_eq!(ff.data[0] & 0xF0, 0x10);
    let length = ((ff.data[0] as usize & 0x0F) << 8) | ff.data[1] as usize;
    let mut payload = ff.data[2..].to_vec();
    for cf in &frames[1..] {
        assert_eq!(cf.data[0] & 0xF0, 0x20);
        payload.extend_from_slice(&cf.data[1..]);
    }
    payload.truncate(length);
    payload
}

#[test]
fn test_single_frame_diagnostic_round_trip() {
    let mut stack = build_stack();
    stack.uds_mut().register_did(0xF190, vec![0x01, 0x02]);

    inject_tester_frame(&mut stack, &[0x03, 0x22, 0xF1, 0x90]);
    let sent = pump(&mut stack);

    let responses = diag_frames(&sent);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].data, vec![0x05, 0x62, 0xF1, 0x90, 0x01, 0x02]);
}

#[test]
fn test_unknown_did_answered_negatively() {
    let mut stack = build_stack();
    inject_tester_frame(&mut stack, &[0x03, 0x22, 0x00, 0x01]);
    let sent = pump(&mut stack);
    let responses = diag_frames(&sent);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].data, vec![0x03, 0x7F, 0x22, 0x31]);
}

#[test]
fn test_multi_frame_response_is_segmented() {
    let mut stack = build_stack();
    let record: Vec<u8> = (0..20).collect();
    stack.uds_mut().register_did(0xF190, record.clone());

    inject_tester_frame(&mut stack, &[0x03, 0x22, 0xF1, 0x90]);
    let mut sent = pump(&mut stack);
    // Only the first frame until the tester grants flow control
    assert_eq!(diag_frames(&sent).len(), 1);

    inject_tester_frame(&mut stack, &[0x30, 0x00, 0x00]);
    sent.extend(pump(&mut stack));

    let responses = diag_frames(&sent);
    let payload = reassemble(&responses);
    let mut expected = vec![0x62, 0xF1, 0x90];
    expected.extend_from_slice(&record);
    assert_eq!(payload, expected);
}

#[test]
fn test_multi_frame_request_is_reassembled() {
    let mut stack = build_stack();
    stack.uds_mut().register_did(0x0100, vec![0xAA]);
    stack.uds_mut().register_did(0x0200, vec![0xBB]);

    // ReadDataByIdentifier with four DIDs: 9 bytes, needs segmentation
    inject_tester_frame(&mut stack, &[0x10, 0x09, 0x22, 0x01, 0x00, 0x0F, 0x0F, 0x0F]);
    let sent = pump(&mut stack);
    // Stack answers the first frame with flow control
    assert_eq!(diag_frames(&sent).len(), 1);
    assert_eq!(diag_frames(&sent)[0].data[0], 0x30);

    inject_tester_frame(&mut stack, &[0x21, 0x0E, 0x02, 0x00]);
    let sent = pump(&mut stack);
    let responses = diag_frames(&sent);
    assert_eq!(responses.len(), 1);
    assert_eq!(
        responses[0].data,
        vec![0x07, 0x62, 0x01, 0x00, 0xAA, 0x02, 0x00, 0xBB]
    );
}

#[test]
fn test_response_pending_keep_alive_over_can() {
    let mut stack = build_stack();
    stack
        .uds_mut()
        .register_routine(0x0102, Box::new(|_, _| ecustack::uds::RoutineOutcome::Pending));

    inject_tester_frame(&mut stack, &[0x02, 0x10, 0x03]);
    pump(&mut stack);

    inject_tester_frame(&mut stack, &[0x04, 0x31, 0x01, 0x01, 0x02]);
    let sent = pump(&mut stack);
    assert!(diag_frames(&sent).is_empty());
    assert!(stack.uds().is_processing());

    let sent = run_ms(&mut stack, 50);
    let responses = diag_frames(&sent);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].data, vec![0x03, 0x7F, 0x31, 0x78]);

    stack.processing_done(Ok(vec![0x01, 0x01, 0x02, 0x55]));
    let sent = pump(&mut stack);
    let responses = diag_frames(&sent);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].data, vec![0x05, 0x71, 0x01, 0x01, 0x02, 0x55]);
    assert!(!stack.uds().is_processing());
}

#[test]
fn test_nm_wake_and_sleep_cycle() {
    let mut stack = build_stack();
    assert_eq!(stack.nm().state(), NmState::Sleep);

    stack.nm_mut().set_wake_reason(WakeReason::LOCAL);
    stack.request_network();
    let sent = pump(&mut stack);
    assert_eq!(stack.nm().state(), NmState::RepeatMessage);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id, 0x510);
    let pdu = NmPdu::decode(&sent[0].data).unwrap();
    assert!(pdu.control.contains(NmControlBits::ACTIVE_WAKEUP));

    run_ms(&mut stack, 1600);
    assert_eq!(stack.nm().state(), NmState::Normal);

    stack.release_network();
    pump(&mut stack);
    assert_eq!(stack.nm().state(), NmState::ReadySleep);

    run_ms(&mut stack, 1500);
    assert_eq!(stack.nm().state(), NmState::PrepareSleep);
    run_ms(&mut stack, 1500);
    assert_eq!(stack.nm().state(), NmState::Sleep);
}

#[test]
fn test_nm_frames_and_diagnostics_are_routed_independently() {
    let mut stack = build_stack();
    stack.uds_mut().register_did(0xF190, vec![0x42]);

    // Peer NM PDU and a diagnostic request back to back
    let peer = NmPdu {
        node_id: 0x22,
        control: NmControlBits::empty(),
        user_data: [0; 6],
    };
    stack.driver_mut().inject(Frame {
        id: 0x522,
        data: peer.encode().to_vec(),
        ..Default::default()
    });
    stack.on_msg_received();
    inject_tester_frame(&mut stack, &[0x03, 0x22, 0xF1, 0x90]);
    let sent = pump(&mut stack);

    assert_eq!(stack.nm().state(), NmState::RepeatMessage);
    let responses = diag_frames(&sent);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].data, vec![0x04, 0x62, 0xF1, 0x90, 0x42]);
}

#[test]
fn test_bus_off_aborts_transport_transfer() {
    let mut stack = build_stack();
    // Start a multi-frame reception
    inject_tester_frame(&mut stack, &[0x10, 0x09, 0x22, 0x01, 0x00, 0x02, 0x00, 0x03]);
    pump(&mut stack);
    assert!(stack.transport().is_rx_multi_frame());

    stack.on_bus_off();
    pump(&mut stack);
    assert!(!stack.transport().is_rx_multi_frame());
}

#[test]
fn test_orderly_shutdown() {
    let mut stack = build_stack();
    assert!(!stack.is_terminated());
    stack.trigger_shutdown();
    stack.service().unwrap();
    assert!(stack.is_terminated());
    stack.power_off().unwrap();
}
