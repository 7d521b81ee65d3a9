use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use relay_transport::{MockHandle, MockScript, MockTransport, SessionOutcome};
use telemetry_daemon::config::RetryPolicy;
use telemetry_daemon::connection_manager::ConnectionManager;
use telemetry_types::{ConnectionError, ConnectionState, TransportError};
use tokio_util::sync::CancellationToken;

fn script() -> MockScript {
    MockScript {
        empty_discovery_polls: 0,
        session_outcomes: VecDeque::new(),
        generate_data: false,
        ..MockScript::default()
    }
}

fn manager_with(
    script: MockScript,
    discovery: RetryPolicy,
    session: RetryPolicy,
    cancel: CancellationToken,
) -> (ConnectionManager, MockHandle) {
    let (transport, handle) = MockTransport::new(script);
    (
        ConnectionManager::new(Box::new(transport), discovery, session, cancel),
        handle,
    )
}

fn manager(script: MockScript) -> (ConnectionManager, MockHandle) {
    manager_with(
        script,
        RetryPolicy::unbounded(0),
        RetryPolicy::unbounded(0),
        CancellationToken::new(),
    )
}

#[test]
fn initialization_errors_are_retried_until_success() {
    let (mut cm, handle) = manager(MockScript {
        session_outcomes: VecDeque::from(vec![SessionOutcome::InitializationError; 3]),
        ..script()
    });

    cm.connect().unwrap();

    assert_eq!(handle.session_attempts(), 4);
    assert_eq!(cm.initialization_retries(), 3);
    assert_eq!(handle.live_links(), 1);
    assert_eq!(handle.disposed_links(), 0);
    assert!(handle.session_open());

    cm.teardown();
    assert_eq!(handle.disposed_links(), 1);
    assert_eq!(handle.live_links(), 0);
}

#[test]
fn rejection_disposes_once_and_stops_trying() {
    let (mut cm, handle) = manager(MockScript {
        session_outcomes: VecDeque::from([
            SessionOutcome::InitializationError,
            SessionOutcome::Rejected(7),
            SessionOutcome::Success,
        ]),
        ..script()
    });

    let err = cm.connect().unwrap_err();
    assert!(matches!(
        err,
        ConnectionError::SessionRejected(TransportError::Rejected { code: 7, .. })
    ));
    assert_eq!(handle.session_attempts(), 2);
    assert_eq!(handle.disposed_links(), 1);
    assert!(matches!(cm.state(), ConnectionState::Failed(_)));
    assert!(cm.session().is_none());

    cm.teardown();
    assert_eq!(handle.disposed_links(), 1);
    assert!(handle.manager_shut_down());
    assert_eq!(cm.state(), &ConnectionState::TornDown);
    assert_eq!(cm.last_error(), Some(&err));
}

#[test]
fn rejection_on_first_attempt_is_not_retried() {
    let (mut cm, handle) = manager(MockScript {
        session_outcomes: VecDeque::from([SessionOutcome::Rejected(0x0B), SessionOutcome::Success]),
        ..script()
    });

    let err = cm.connect().unwrap_err();
    assert!(matches!(
        err,
        ConnectionError::SessionRejected(TransportError::Rejected { code: 0x0B, .. })
    ));
    assert_eq!(handle.session_attempts(), 1);
    assert_eq!(handle.disposed_links(), 1);
    assert_eq!(cm.initialization_retries(), 0);
    assert!(!handle.session_open());
}

#[test]
fn no_bonded_relay_is_fatal() {
    let (mut cm, handle) = manager(MockScript {
        bonded_relays: vec![],
        ..script()
    });
    assert_eq!(cm.connect(), Err(ConnectionError::NoRelayBonded));
    assert!(handle.connect_attempts().is_empty());
}

#[test]
fn usb_relay_is_bonded_during_scan() {
    let (mut cm, _handle) = manager(MockScript {
        bonded_relays: vec![],
        usb_relays: vec!["R-USB".to_string()],
        ..script()
    });
    let relays = cm.scan_for_relays().unwrap();
    assert_eq!(relays.len(), 1);
    assert_eq!(relays[0].serial_number, "R-USB");
}

#[test]
fn unbonded_relays_are_not_candidates() {
    let (mut cm, handle) = manager(MockScript {
        bonded_relays: vec![],
        usb_relays: vec!["R-USB".to_string()],
        usb_bonding_fails: true,
        ..script()
    });
    assert_eq!(cm.connect(), Err(ConnectionError::NoRelayBonded));
    assert!(handle.connect_attempts().is_empty());
    assert!(matches!(cm.state(), ConnectionState::Failed(_)));
}

#[test]
fn every_relay_refusing_is_fatal() {
    let (mut cm, handle) = manager(MockScript {
        bonded_relays: vec!["R-1".into(), "R-2".into()],
        unreachable_relays: vec!["R-1".into(), "R-2".into()],
        ..script()
    });
    assert_eq!(
        cm.connect(),
        Err(ConnectionError::RelayConnectFailed { attempted: 2 })
    );
    assert_eq!(handle.connect_attempts().len(), 2);
    assert_eq!(handle.discovery_polls(), 0);
}

#[test]
fn discovery_keeps_polling_until_a_device_appears() {
    let (mut cm, handle) = manager(MockScript {
        empty_discovery_polls: 25,
        ..script()
    });
    let relays = cm.scan_for_relays().unwrap();
    cm.connect_relay(&relays).unwrap();
    let device = cm.discover_device().unwrap();
    assert_eq!(device.serial_number, "MOCK-INS-01");
    assert_eq!(handle.discovery_polls(), 26);
}

#[test]
fn bounded_discovery_gives_up() {
    let (mut cm, handle) = manager_with(
        MockScript {
            empty_discovery_polls: 100,
            ..script()
        },
        RetryPolicy::max_attempts(3),
        RetryPolicy::unbounded(0),
        CancellationToken::new(),
    );
    assert_eq!(
        cm.connect(),
        Err(ConnectionError::RetriesExhausted {
            stage: "device discovery",
            attempts: 3
        })
    );
    assert_eq!(handle.discovery_polls(), 3);

    // the relay link survives until teardown
    assert_eq!(handle.live_links(), 1);
    cm.teardown();
    assert_eq!(handle.disposed_links(), 1);
}

#[test]
fn cancellation_interrupts_discovery() {
    let cancel = CancellationToken::new();
    let (mut cm, handle) = manager_with(
        MockScript {
            empty_discovery_polls: u32::MAX,
            ..script()
        },
        RetryPolicy::unbounded(10),
        RetryPolicy::unbounded(0),
        cancel.clone(),
    );

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(80));
        cancel.cancel();
    });
    assert_eq!(cm.connect(), Err(ConnectionError::Cancelled));
    canceller.join().unwrap();
    assert!(handle.discovery_polls() >= 1);

    cm.teardown();
    assert_eq!(handle.disposed_links(), 1);
}

#[test]
fn bounded_session_start_gives_up() {
    let (mut cm, handle) = manager_with(
        MockScript {
            session_outcomes: VecDeque::from(vec![SessionOutcome::InitializationError; 10]),
            ..script()
        },
        RetryPolicy::unbounded(0),
        RetryPolicy::max_attempts(2),
        CancellationToken::new(),
    );
    assert_eq!(
        cm.connect(),
        Err(ConnectionError::RetriesExhausted {
            stage: "session start",
            attempts: 2
        })
    );
    assert_eq!(handle.session_attempts(), 2);
    assert_eq!(cm.initialization_retries(), 2);
}

#[test]
fn teardown_is_idempotent() {
    let (mut cm, handle) = manager(script());
    cm.connect().unwrap();
    cm.teardown();
    cm.teardown();
    drop(cm);
    assert_eq!(handle.disposed_links(), 1);
    assert!(handle.manager_shut_down());
}
