//! Pipe Integration Tests
//!
//! Drives pipes through the manual transport to pin down submission,
//! completion, event and resubmission behavior.
//!
//! # Test Scenarios
//! - Open/close lifecycle and scope activity
//! - Synchronous and asynchronous submission
//! - Short packets and transfer error mapping
//! - Control pipes and setup packets
//! - Event dispatch and listener management
//! - Resubmission policies
//! - Abort semantics
//! - End to end through the loopback backend
//!
//! Run with: `cargo test -p engine --test pipe_tests`

use common::create_event_bridge;
use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, create_mock_bulk_data, create_mock_bulk_endpoint,
    create_mock_interrupt_endpoint, with_timeout,
};
use engine::test_utils::{ManualTransport, RecordingListener, TEST_SCOPE, open_test_pipe};
use engine::{
    CompositeIrp, ControlIrp, ForwardListener, Irp, Pipe, PipeError, ScopeRegistry,
    TransportSettings, UsbIrp, build_transport,
};
use protocol::constants::REQUEST_GET_DESCRIPTOR;
use protocol::{Endpoint, PipeEvent, UsbError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn bulk_out() -> Endpoint {
    create_mock_bulk_endpoint(0x01)
}

fn bulk_in() -> Endpoint {
    create_mock_bulk_endpoint(0x81)
}

/// Complete the oldest outstanding transfer after `delay`, from another thread
fn complete_later(
    transport: &Arc<ManualTransport>,
    delay: Duration,
    payload: Vec<u8>,
) -> thread::JoinHandle<()> {
    let transport = transport.clone();
    thread::spawn(move || {
        let handle = transport.wait_for_pending(1).expect("transfer submitted")[0];
        thread::sleep(delay);
        transport.complete_ok(handle, &payload);
    })
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[test]
fn test_open_and_close_are_idempotent() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport);

    assert!(pipe.is_open());
    pipe.open().unwrap();
    assert!(pipe.is_open());

    pipe.close().unwrap();
    assert!(!pipe.is_open());
    pipe.close().unwrap();
    assert!(!pipe.is_open());
}

#[test]
fn test_open_requires_active_scope() {
    let scopes = Arc::new(ScopeRegistry::new());
    let pipe = Pipe::new(bulk_out(), TEST_SCOPE, scopes.clone(), ManualTransport::new()).unwrap();

    assert!(!pipe.is_active());
    assert_eq!(pipe.open(), Err(PipeError::NotActive));

    scopes.activate(TEST_SCOPE);
    pipe.open().unwrap();
    assert!(pipe.is_open());

    // Deactivating the scope hides the open flag
    scopes.deactivate(TEST_SCOPE);
    assert!(!pipe.is_open());
    assert_eq!(
        pipe.async_submit(&Irp::new(vec![0; 4])),
        Err(PipeError::NotActive)
    );
}

#[test]
fn test_submit_on_closed_pipe() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());
    pipe.close().unwrap();

    let irp = Irp::new(vec![0; 4]);
    assert_eq!(pipe.async_submit(&irp), Err(PipeError::NotOpen));
    assert!(!irp.is_active());
    assert_eq!(transport.submission_count(), 0);
}

#[test]
fn test_close_with_active_submission_fails() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());

    let irp = pipe.async_submit_buffer(vec![0; 4]).unwrap();
    assert_eq!(
        pipe.close(),
        Err(PipeError::SubmissionsPending { active: 1 })
    );

    let handle = transport.wait_for_pending(1).unwrap()[0];
    transport.complete_ok(handle, &[]);
    assert!(irp.wait_until_complete(Some(DEFAULT_TEST_TIMEOUT)));

    // Active count drops before waiters are released
    pipe.close().unwrap();
}

// ============================================================================
// Submission Tests
// ============================================================================

#[test]
fn test_sync_submit_buffer_returns_after_completion() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_in(), transport.clone());
    let completer = complete_later(&transport, Duration::from_millis(100), vec![9, 8, 7]);

    let mut buffer = [0u8; 8];
    let start = Instant::now();
    let actual = pipe.sync_submit_buffer(&mut buffer).unwrap();

    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(actual, 3);
    assert!(actual <= buffer.len());
    assert_eq!(&buffer[..3], &[9, 8, 7]);
    completer.join().unwrap();
}

#[test]
fn test_sync_submit_out_reports_full_length() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());
    let completer = complete_later(&transport, Duration::ZERO, Vec::new());

    let irp = Irp::new(create_mock_bulk_data(64));
    assert_eq!(pipe.sync_submit(&irp).unwrap(), 64);
    assert!(irp.is_complete());
    assert!(!irp.is_active());
    assert_eq!(transport.submissions()[0].data, create_mock_bulk_data(64));
    completer.join().unwrap();
}

#[test]
fn test_active_irp_rejected() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport);

    let irp = Irp::new(vec![0; 4]);
    pipe.async_submit(&irp).unwrap();
    assert_eq!(pipe.async_submit(&irp), Err(PipeError::IrpActive));
    assert_eq!(irp.set_length(Some(2)), Err(PipeError::IrpActive));
}

#[test]
fn test_offset_and_length_define_window() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());

    let irp = Irp::with_range(vec![0, 1, 2, 3, 4, 5, 6, 7], 2, 4, true).unwrap();
    pipe.async_submit(&irp).unwrap();

    let submitted = &transport.submissions()[0];
    assert_eq!(submitted.offset, 2);
    assert_eq!(submitted.length, 4);
    assert_eq!(submitted.data, vec![2, 3, 4, 5]);
}

#[test]
fn test_sequence_numbers_increase() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport);

    let first = pipe.async_submit_buffer(vec![0; 1]).unwrap();
    let second = pipe.async_submit_buffer(vec![0; 1]).unwrap();
    assert!(second.sequence_number() > first.sequence_number());
}

#[test]
fn test_list_reaches_transport_in_order() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());

    let irps: Vec<Irp> = (0..4u8).map(|i| Irp::new(vec![i; 2])).collect();
    pipe.async_submit_list(&irps).unwrap();

    let data: Vec<Vec<u8>> = transport.submissions().into_iter().map(|s| s.data).collect();
    assert_eq!(data, vec![vec![0, 0], vec![1, 1], vec![2, 2], vec![3, 3]]);

    let seqs: Vec<u64> = irps.iter().map(Irp::sequence_number).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_list_with_duplicate_is_rejected_atomically() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());

    let irp = Irp::new(vec![0; 2]);
    let other = Irp::new(vec![0; 2]);
    assert_eq!(
        pipe.async_submit_list(&[other.clone(), irp.clone(), irp.clone()]),
        Err(PipeError::IrpActive)
    );
    assert!(!irp.is_active());
    assert!(!other.is_active());
    assert_eq!(transport.submission_count(), 0);
    assert_eq!(pipe.active_submissions(), 0);
}

#[test]
fn test_sync_submit_list_reports_first_failure() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());

    let completer = {
        let transport = transport.clone();
        thread::spawn(move || {
            let handles = transport.wait_for_pending(3).unwrap();
            transport.complete_ok(handles[0], &[]);
            transport.complete_err(handles[1], UsbError::Timeout);
            transport.complete_err(handles[2], UsbError::Halted);
        })
    };

    let irps: Vec<Irp> = (0..3).map(|_| Irp::new(vec![0; 2])).collect();
    assert_eq!(
        pipe.sync_submit_list(&irps),
        Err(PipeError::Transfer(UsbError::Timeout))
    );
    assert_eq!(irps[0].error(), None);
    assert_eq!(irps[2].error(), Some(UsbError::Halted));
    completer.join().unwrap();
}

// ============================================================================
// Completion Tests
// ============================================================================

#[test]
fn test_short_packet_rejected() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_in(), transport.clone());
    let completer = complete_later(&transport, Duration::ZERO, vec![1, 2, 3]);

    let irp = Irp::with_range(vec![0; 8], 0, 8, false).unwrap();
    assert_eq!(
        pipe.sync_submit(&irp),
        Err(PipeError::Transfer(UsbError::IncompleteTransfer))
    );
    assert_eq!(irp.actual_length(), 3);
    assert_eq!(irp.error(), Some(UsbError::IncompleteTransfer));
    completer.join().unwrap();
}

#[test]
fn test_buffer_submission_accepts_short_packets() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_in(), transport.clone());

    let irp = pipe.async_submit_buffer(vec![0; 8]).unwrap();
    assert!(irp.accepts_short_packet());

    let handle = transport.wait_for_pending(1).unwrap()[0];
    transport.complete_ok(handle, &[5]);
    assert!(irp.wait_until_complete(Some(DEFAULT_TEST_TIMEOUT)));
    assert_eq!(irp.error(), None);
    assert_eq!(irp.transferred_data(), vec![5]);
}

#[test]
fn test_transport_errors_map_directly() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());

    for error in [
        UsbError::Busy,
        UsbError::NoBandwidth,
        UsbError::Halted,
        UsbError::Timeout,
        UsbError::Io,
    ] {
        let irp = pipe.async_submit_buffer(vec![0; 4]).unwrap();
        let handle = *transport.wait_for_pending(1).unwrap().last().unwrap();
        transport.complete_err(handle, error);
        assert!(irp.wait_until_complete(Some(DEFAULT_TEST_TIMEOUT)));
        assert_eq!(irp.error(), Some(error));
    }
}

#[test]
fn test_begin_rejection_completes_irp() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());
    transport.reject_next(UsbError::NoBandwidth);

    let irp = Irp::new(vec![1, 2, 3]);
    assert_eq!(
        pipe.sync_submit(&irp),
        Err(PipeError::Transfer(UsbError::NoBandwidth))
    );
    // Buffer came back from the transport
    assert_eq!(irp.data(), vec![1, 2, 3]);
    assert_eq!(pipe.active_submissions(), 0);
}

#[test]
fn test_over_reported_length_is_clamped() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_in(), transport.clone());

    let irp = pipe.async_submit_buffer(vec![0; 4]).unwrap();
    let handle = transport.wait_for_pending(1).unwrap()[0];
    transport.complete_raw(handle, 4096, None);

    assert!(irp.wait_until_complete(Some(DEFAULT_TEST_TIMEOUT)));
    assert_eq!(irp.actual_length(), 4);
}

#[test]
fn test_wait_timeout_then_unbounded_wait() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());

    let irp = pipe.async_submit_buffer(vec![0; 4]).unwrap();
    let completer = complete_later(&transport, Duration::from_millis(200), Vec::new());

    assert!(!irp.wait_until_complete(Some(Duration::from_millis(50))));
    assert!(irp.wait_until_complete(None));
    assert!(irp.is_complete());
    completer.join().unwrap();
}

#[test]
fn test_concurrent_waiters_all_released() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());
    let irp = pipe.async_submit_buffer(vec![0; 4]).unwrap();

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let irp = irp.clone();
            thread::spawn(move || irp.wait_until_complete(Some(DEFAULT_TEST_TIMEOUT)))
        })
        .collect();

    let handle = transport.wait_for_pending(1).unwrap()[0];
    transport.complete_ok(handle, &[]);

    for waiter in waiters {
        assert!(waiter.join().unwrap());
    }
}

// ============================================================================
// Control Pipe Tests
// ============================================================================

#[test]
fn test_control_pipe_requires_setup() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(Endpoint::default_control(), transport.clone());

    assert!(matches!(
        pipe.async_submit(&Irp::new(vec![0; 8])),
        Err(PipeError::InvalidArgument(_))
    ));
    assert!(matches!(
        pipe.async_submit_buffer(vec![0; 8]),
        Err(PipeError::InvalidArgument(_))
    ));
    assert_eq!(transport.submission_count(), 0);
}

#[test]
fn test_control_transfer_carries_setup_packet() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(Endpoint::default_control(), transport.clone());
    let completer = complete_later(&transport, Duration::ZERO, vec![0x12, 0x01]);

    let irp = ControlIrp::with_fields(0x80, REQUEST_GET_DESCRIPTOR, 0x0100, 0, vec![0; 18]);
    assert_eq!(pipe.sync_submit(&irp).unwrap(), 2);

    let setup = transport.submissions()[0].setup.expect("setup packet");
    assert_eq!(setup.request_type, 0x80);
    assert_eq!(setup.request, REQUEST_GET_DESCRIPTOR);
    assert_eq!(setup.value, 0x0100);
    assert_eq!(setup.length, 18);
    completer.join().unwrap();
}

#[test]
fn test_control_length_must_fit_setup() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(Endpoint::default_control(), transport);

    let irp = ControlIrp::with_fields(0x40, 0x01, 0, 0, vec![0; 70_000]);
    assert!(matches!(
        pipe.async_submit(&irp),
        Err(PipeError::InvalidArgument(_))
    ));
    assert!(!irp.is_active());
}

// ============================================================================
// Event Tests
// ============================================================================

#[test]
fn test_data_and_error_events() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_in(), transport.clone());
    let listener = RecordingListener::new();
    pipe.add_shared_listener(listener.clone());

    let ok = pipe.async_submit_buffer(vec![0; 4]).unwrap();
    let failed = pipe.async_submit_buffer(vec![0; 4]).unwrap();
    let handles = transport.wait_for_pending(2).unwrap();
    transport.complete_ok(handles[0], &[1, 2]);
    transport.complete_err(handles[1], UsbError::Halted);

    assert!(listener.wait_for_events(2));
    let events = listener.events();
    match &events[0] {
        PipeEvent::Data(event) => {
            assert_eq!(event.sequence_number, ok.sequence_number());
            assert_eq!(event.data, vec![1, 2]);
            assert_eq!(event.endpoint.as_u8(), 0x81);
        }
        other => panic!("expected data event, got {:?}", other),
    }
    match &events[1] {
        PipeEvent::Error(event) => {
            assert_eq!(event.sequence_number, failed.sequence_number());
            assert_eq!(event.error, UsbError::Halted);
        }
        other => panic!("expected error event, got {:?}", other),
    }
}

#[test]
fn test_event_policy_suppresses_event() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());
    let listener = RecordingListener::new();
    pipe.add_shared_listener(listener.clone());

    let quiet = Irp::new(vec![0; 2]);
    quiet.set_event_policy(|_: &dyn UsbIrp| false);
    let loud = Irp::new(vec![0; 2]);
    pipe.async_submit_list(&[quiet, loud.clone()]).unwrap();

    for handle in transport.wait_for_pending(2).unwrap() {
        transport.complete_ok(handle, &[]);
    }

    assert!(loud.wait_until_complete(Some(DEFAULT_TEST_TIMEOUT)));
    assert!(listener.wait_for_events(1));
    assert_eq!(listener.sequence_numbers(), vec![loud.sequence_number()]);
}

#[test]
fn test_listeners_in_registration_order_and_removal() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut ids = Vec::new();
    for tag in 0..3 {
        let order = order.clone();
        ids.push(pipe.add_listener(move |_: &PipeEvent| order.lock().unwrap().push(tag)));
    }
    assert!(pipe.remove_listener(ids[1]));

    let irp = Irp::new(vec![0; 2]);
    let completer = complete_later(&transport, Duration::ZERO, Vec::new());
    pipe.sync_submit(&irp).unwrap();
    completer.join().unwrap();

    assert_eq!(*order.lock().unwrap(), vec![0, 2]);
}

#[test]
fn test_panicking_listener_keeps_worker_alive() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());
    pipe.add_listener(|_: &PipeEvent| panic!("listener failure"));
    let listener = RecordingListener::new();
    pipe.add_shared_listener(listener.clone());

    for round in 1..=2 {
        let irp = pipe.async_submit_buffer(vec![0; 2]).unwrap();
        let handle = *transport.wait_for_pending(1).unwrap().last().unwrap();
        transport.complete_ok(handle, &[]);
        assert!(irp.wait_until_complete(Some(DEFAULT_TEST_TIMEOUT)));
        assert!(listener.wait_for_events(round));
    }
}

#[test]
fn test_blocking_call_from_listener_is_rejected() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());
    let pipe = Arc::new(pipe);
    let seen = Arc::new(Mutex::new(None));

    let weak = Arc::downgrade(&pipe);
    let recorded = seen.clone();
    pipe.add_listener(move |_: &PipeEvent| {
        if let Some(pipe) = weak.upgrade() {
            *recorded.lock().unwrap() = Some(pipe.sync_submit(&Irp::new(vec![0; 1])));
        }
    });

    let irp = pipe.async_submit_buffer(vec![0; 2]).unwrap();
    let handle = transport.wait_for_pending(1).unwrap()[0];
    transport.complete_ok(handle, &[]);
    assert!(irp.wait_until_complete(Some(DEFAULT_TEST_TIMEOUT)));

    assert_eq!(
        *seen.lock().unwrap(),
        Some(Err(PipeError::CompletionContext))
    );
}

#[tokio::test]
async fn test_forward_listener_reaches_async_consumer() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_in(), transport.clone());
    let (forwarder, stream) = create_event_bridge(8);
    pipe.add_listener(ForwardListener::new(forwarder));

    let irp = pipe.async_submit_buffer(vec![0; 4]).unwrap();
    let handle = transport.wait_for_pending(1).unwrap()[0];
    transport.complete_ok(handle, &[4, 2]);

    let event = with_timeout(DEFAULT_TEST_TIMEOUT, stream.recv_event())
        .await
        .expect("event in time")
        .expect("channel open");
    assert_eq!(event.sequence_number(), irp.sequence_number());
    assert!(!event.is_error());
}

// ============================================================================
// Resubmission Tests
// ============================================================================

#[test]
fn test_resubmission_after_event() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(create_mock_interrupt_endpoint(0x81), transport.clone());
    let listener = RecordingListener::new();
    pipe.add_shared_listener(listener.clone());

    let irp = Irp::new(vec![0; 4]);
    irp.set_resubmit(true).unwrap();
    pipe.async_submit(&irp).unwrap();
    let first_seq = irp.sequence_number();

    transport.complete_ok(transport.wait_for_pending(1).unwrap()[0], &[1]);
    assert!(transport.wait_for_submissions(2));
    transport.complete_ok(transport.pending()[0], &[2]);
    assert!(transport.wait_for_submissions(3));

    // Each activation got its own number, events fired in order
    assert!(listener.wait_for_events(2));
    let seqs = listener.sequence_numbers();
    assert_eq!(seqs[0], first_seq);
    assert!(seqs[1] > seqs[0]);
    assert!(irp.sequence_number() > seqs[1]);
    assert!(irp.is_active());

    // Default error policy ends the loop
    transport.complete_err(transport.pending()[0], UsbError::Halted);
    assert!(irp.wait_until_complete(Some(DEFAULT_TEST_TIMEOUT)));
    assert!(!irp.resubmit());
    assert_eq!(transport.submission_count(), 3);
    assert_eq!(pipe.active_submissions(), 0);
}

#[test]
fn test_error_policy_false_stops_after_one_attempt() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());
    let consulted = Arc::new(AtomicUsize::new(0));

    let irp = Irp::new(vec![0; 4]);
    irp.set_resubmit(true).unwrap();
    let counter = consulted.clone();
    irp.set_resubmit_error_policy(move |_: &dyn UsbIrp| {
        counter.fetch_add(1, Ordering::SeqCst);
        false
    });

    let completer = {
        let transport = transport.clone();
        thread::spawn(move || {
            let handle = transport.wait_for_pending(1).unwrap()[0];
            transport.complete_err(handle, UsbError::Timeout);
        })
    };
    assert_eq!(
        pipe.sync_submit(&irp),
        Err(PipeError::Transfer(UsbError::Timeout))
    );
    completer.join().unwrap();

    assert_eq!(irp.sequence_number(), 1);
    assert_eq!(consulted.load(Ordering::SeqCst), 1);
    assert_eq!(transport.submission_count(), 1);
    assert!(!irp.resubmit());
}

#[test]
fn test_error_policy_true_retries() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());

    let irp = Irp::new(vec![0; 4]);
    irp.set_resubmit(true).unwrap();
    irp.set_resubmit_error_policy(|irp: &dyn UsbIrp| irp.error() == Some(UsbError::Timeout));
    pipe.async_submit(&irp).unwrap();

    transport.complete_err(transport.wait_for_pending(1).unwrap()[0], UsbError::Timeout);
    assert!(transport.wait_for_submissions(2));
    transport.complete_err(transport.pending()[0], UsbError::Halted);

    assert!(irp.wait_until_complete(Some(DEFAULT_TEST_TIMEOUT)));
    assert_eq!(irp.error(), Some(UsbError::Halted));
    assert_eq!(transport.submission_count(), 2);
}

#[test]
fn test_data_policy_replaces_buffer() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());

    let irp = Irp::new(vec![1; 4]);
    irp.set_resubmit(true).unwrap();
    irp.set_resubmit_data_policy(|_: &dyn UsbIrp| Some(vec![0xAA; 2]));
    pipe.async_submit(&irp).unwrap();

    transport.complete_ok(transport.wait_for_pending(1).unwrap()[0], &[]);
    assert!(transport.wait_for_submissions(2));

    let resubmitted = &transport.submissions()[1];
    assert_eq!(resubmitted.data, vec![0xAA; 2]);
    assert_eq!(resubmitted.length, 2);
}

#[test]
fn test_sync_submit_released_by_resubmitting_irp() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());
    let completer = complete_later(&transport, Duration::from_millis(20), Vec::new());

    let irp = Irp::new(vec![0; 4]);
    irp.set_resubmit(true).unwrap();
    assert_eq!(pipe.sync_submit(&irp).unwrap(), 4);
    completer.join().unwrap();

    // Still looping on the transport
    assert!(transport.wait_for_submissions(2));
    assert!(irp.is_active());
    pipe.abort_all_submissions().unwrap();
    assert!(!irp.is_active());
}

// ============================================================================
// Abort Tests
// ============================================================================

#[test]
fn test_abort_cancels_in_flight_and_keeps_finished_results() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_in(), transport.clone());

    let done = pipe.async_submit_buffer(vec![0; 2]).unwrap();
    let running = pipe.async_submit_buffer(vec![0; 2]).unwrap();
    let handles = transport.wait_for_pending(2).unwrap();
    transport.complete_ok(handles[0], &[7, 7]);
    assert!(done.wait_until_complete(Some(DEFAULT_TEST_TIMEOUT)));

    pipe.abort_all_submissions().unwrap();

    assert_eq!(done.error(), None);
    assert_eq!(done.transferred_data(), vec![7, 7]);
    assert_eq!(running.error(), Some(UsbError::Cancelled));
    assert!(!running.is_active());
    assert_eq!(transport.cancelled(), vec![handles[1]]);
    assert_eq!(pipe.active_submissions(), 0);

    // Pipe accepts work again
    pipe.async_submit_buffer(vec![0; 2]).unwrap();
}

#[test]
fn test_submissions_rejected_while_aborting() {
    let transport = ManualTransport::new();
    transport.hold_cancellations();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());
    let pipe = Arc::new(pipe);

    let irp = pipe.async_submit_buffer(vec![0; 2]).unwrap();
    let handle = transport.wait_for_pending(1).unwrap()[0];

    let aborter = {
        let pipe = pipe.clone();
        thread::spawn(move || pipe.abort_all_submissions())
    };
    assert!(transport.wait_for_cancellations(1));

    assert_eq!(
        pipe.async_submit(&Irp::new(vec![0; 2])),
        Err(PipeError::PipeClosed)
    );
    assert!(!aborter.is_finished());

    transport.complete_err(handle, UsbError::Cancelled);
    aborter.join().unwrap().unwrap();
    assert_eq!(irp.error(), Some(UsbError::Cancelled));
}

#[test]
fn test_dropping_pipe_cancels_active_submissions() {
    let transport = ManualTransport::new();
    transport.hold_cancellations();
    let (pipe, _scopes) = open_test_pipe(bulk_in(), transport.clone());
    let listener = RecordingListener::new();
    pipe.add_shared_listener(listener.clone());

    let running = pipe.async_submit_buffer(vec![0; 4]).unwrap();
    let handle = transport.wait_for_pending(1).unwrap()[0];
    drop(pipe);

    assert!(running.wait_until_complete(Some(DEFAULT_TEST_TIMEOUT)));
    assert!(!running.is_active());
    assert_eq!(running.error(), Some(UsbError::Cancelled));
    assert_eq!(transport.cancelled(), vec![handle]);
    assert!(matches!(
        listener.events().as_slice(),
        [PipeEvent::Error(event)] if event.error == UsbError::Cancelled
    ));

    // A completion arriving after the pipe is gone changes nothing
    transport.complete_ok(handle, &[1, 2, 3, 4]);
    assert_eq!(running.error(), Some(UsbError::Cancelled));
    running.recycle().unwrap();
    running.set_data(vec![0; 4]).unwrap();
}

#[test]
fn test_dropping_pipe_cancels_queued_composite_children() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport.clone());

    let composite = CompositeIrp::new(vec![Irp::new(vec![1]), Irp::new(vec![2])]);
    let queued = Irp::new(vec![3]);
    pipe.async_submit_composite(&composite).unwrap();
    pipe.async_submit(&queued).unwrap();
    assert!(transport.wait_for_pending(1).is_some());
    drop(pipe);

    assert!(composite.wait_until_complete(Some(DEFAULT_TEST_TIMEOUT)));
    assert_eq!(composite.error(), Some(UsbError::Cancelled));
    assert!(composite.children().iter().all(|child| !child.is_active()));
    assert_eq!(queued.error(), Some(UsbError::Cancelled));
    assert!(!queued.is_active());
    assert_eq!(transport.submission_count(), 1);
}

#[test]
fn test_abort_on_idle_pipe_returns() {
    let transport = ManualTransport::new();
    let (pipe, _scopes) = open_test_pipe(bulk_out(), transport);
    pipe.abort_all_submissions().unwrap();
}

// ============================================================================
// Loopback Tests
// ============================================================================

#[test]
fn test_loopback_round_trip() {
    let settings = TransportSettings {
        latency_ms: 5,
        ..TransportSettings::default()
    };
    let transport = build_transport(&settings).unwrap();
    let (out_pipe, _out_scopes) = open_test_pipe(bulk_out(), transport.clone());
    let (in_pipe, _in_scopes) = open_test_pipe(bulk_in(), transport);

    // Read first: it waits until data is written
    let read = in_pipe.async_submit_buffer(vec![0; 32]).unwrap();
    let payload = create_mock_bulk_data(20);
    assert_eq!(out_pipe.sync_submit(&Irp::new(payload.clone())).unwrap(), 20);

    assert!(read.wait_until_complete(Some(DEFAULT_TEST_TIMEOUT)));
    assert_eq!(read.transferred_data(), payload);
}

#[test]
fn test_loopback_abort_cancels_waiting_read() {
    let transport = build_transport(&TransportSettings::default()).unwrap();
    let (in_pipe, _scopes) = open_test_pipe(bulk_in(), transport);

    let read = in_pipe.async_submit_buffer(vec![0; 8]).unwrap();
    assert!(!read.wait_until_complete(Some(Duration::from_millis(20))));

    in_pipe.abort_all_submissions().unwrap();
    assert_eq!(read.error(), Some(UsbError::Cancelled));
}
