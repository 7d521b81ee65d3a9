//! Establishes and owns the telemetry session.
//!
//! The connection sequence is USB scan, bonded-relay check, relay connect,
//! device discovery and session start. Only initialization errors are
//! retried; every other failure ends in [`ConnectionState::Failed`]. The
//! manager owns the relay link for its whole lifetime and is the only place
//! that disposes it.

use std::thread;
use std::time::{Duration, Instant};

use flume::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_transport::{RelayLink, RelayManager};
use telemetry_types::{
    ConnectWarnings, ConnectionError, ConnectionEvent, ConnectionState, DiscoveredDevice,
    RelayInstrument,
};

use crate::config::RetryPolicy;

const PAUSE_SLICE: Duration = Duration::from_millis(50);

pub struct ConnectionManager {
    manager: Option<Box<dyn RelayManager>>,
    link: Option<Box<dyn RelayLink>>,
    state: ConnectionState,
    last_error: Option<ConnectionError>,
    initialization_retries: u32,
    discovery_policy: RetryPolicy,
    session_policy: RetryPolicy,
    cancel: CancellationToken,
    events: Option<Sender<ConnectionEvent>>,
}

impl ConnectionManager {
    pub fn new(
        manager: Box<dyn RelayManager>,
        discovery_policy: RetryPolicy,
        session_policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager: Some(manager),
            link: None,
            state: ConnectionState::Idle,
            last_error: None,
            initialization_retries: 0,
            discovery_policy,
            session_policy,
            cancel,
            events: None,
        }
    }

    /// Publish progress events on `tx` in addition to logging them.
    pub fn with_events(mut self, tx: Sender<ConnectionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// The error that moved the manager to `Failed`, kept across teardown.
    pub fn last_error(&self) -> Option<&ConnectionError> {
        self.last_error.as_ref()
    }

    /// Initialization errors absorbed while opening the session.
    pub fn initialization_retries(&self) -> u32 {
        self.initialization_retries
    }

    /// The live session, available only while `Connected`.
    pub fn session(&self) -> Option<&dyn RelayLink> {
        match self.state {
            ConnectionState::Connected => self.link.as_deref(),
            _ => None,
        }
    }

    fn publish(&self, event: ConnectionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!("Connection state {} -> {}", self.state, next);
        self.state = next.clone();
        self.publish(ConnectionEvent::StateChanged(next));
    }

    fn fail(&mut self, err: ConnectionError) -> ConnectionError {
        error!("Connection failed: {}", err);
        self.last_error = Some(err.clone());
        self.transition(ConnectionState::Failed(err.clone()));
        err
    }

    /// Sleeps for `duration` unless cancelled first.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }

    /// Bonds any relay plugged in over USB, then lists the bonded relays.
    pub fn scan_for_relays(&mut self) -> Result<Vec<RelayInstrument>, ConnectionError> {
        self.transition(ConnectionState::ScanningForRelays);
        let Some(manager) = self.manager.as_mut() else {
            return Err(self.fail(ConnectionError::NotConnected));
        };

        info!("Checking USB for unbonded relays");
        if let Err(e) = manager.scan_usb() {
            warn!("USB relay scan failed: {}", e);
        }
        let mut relays = match manager.known_relays() {
            Ok(relays) => relays,
            Err(e) => return Err(self.fail(ConnectionError::Transport(e))),
        };

        self.transition(ConnectionState::RelayBondingCheck);
        relays.retain(|relay| {
            if !relay.is_bonded() {
                warn!("Skipping unbonded relay {}", relay.serial_number);
            }
            relay.is_bonded()
        });
        if relays.is_empty() {
            return Err(self.fail(ConnectionError::NoRelayBonded));
        }
        info!(
            "Bonded relays found: {}",
            relays
                .iter()
                .map(|r| r.serial_number.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.publish(ConnectionEvent::RelaysFound(relays.clone()));
        Ok(relays)
    }

    /// Tries each candidate in order and keeps the first link that connects.
    pub fn connect_relay(&mut self, candidates: &[RelayInstrument]) -> Result<(), ConnectionError> {
        self.transition(ConnectionState::ConnectingRelay);
        let Some(manager) = self.manager.as_mut() else {
            return Err(self.fail(ConnectionError::NotConnected));
        };

        let mut connected = None;
        let mut results = Vec::with_capacity(candidates.len());
        for relay in candidates {
            match manager.connect(relay) {
                Ok(link) => {
                    info!("Connected to relay {}", relay.serial_number);
                    results.push((relay.serial_number.clone(), true));
                    connected = Some(link);
                    break;
                }
                Err(e) => {
                    warn!("Connecting to relay {} failed: {}", relay.serial_number, e);
                    results.push((relay.serial_number.clone(), false));
                }
            }
        }
        for (serial_number, connected) in results {
            self.publish(ConnectionEvent::RelayConnectResult {
                serial_number,
                connected,
            });
        }

        match connected {
            Some(link) => {
                self.link = Some(link);
                Ok(())
            }
            None => Err(self.fail(ConnectionError::RelayConnectFailed {
                attempted: candidates.len(),
            })),
        }
    }

    /// Polls the connected relay until an implanted device is in range.
    ///
    /// A failed poll counts as an empty one. The loop is bounded only by the
    /// discovery policy and cancellation.
    pub fn discover_device(&mut self) -> Result<DiscoveredDevice, ConnectionError> {
        if self.link.is_none() {
            return Err(self.fail(ConnectionError::NotConnected));
        }
        self.transition(ConnectionState::DiscoveringDevice);
        info!("Searching for the implanted device; keep the relay close to it");

        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.fail(ConnectionError::Cancelled));
            }
            attempts += 1;

            let polled = match self.link.as_mut() {
                Some(link) => link.discover(),
                None => return Err(self.fail(ConnectionError::NotConnected)),
            };
            match polled {
                Ok(devices) if !devices.is_empty() => {
                    for device in &devices {
                        info!("Implanted device found: {}", device);
                    }
                    let first = devices[0].clone();
                    self.publish(ConnectionEvent::DevicesDiscovered(devices));
                    return Ok(first);
                }
                Ok(_) => debug!("Discovery poll {} found nothing", attempts),
                Err(e) => warn!("Discovery poll {} failed: {}", attempts, e),
            }

            if !self.discovery_policy.allows_retry(attempts, started) {
                return Err(self.fail(ConnectionError::RetriesExhausted {
                    stage: "device discovery",
                    attempts,
                }));
            }
            self.pause(self.discovery_policy.poll_interval());
        }
    }

    /// Starts the session with `device`, repeating on initialization errors.
    ///
    /// A fatal error disposes the link at once. Cancellation and policy
    /// exhaustion leave the link for [`ConnectionManager::teardown`].
    pub fn open_session(&mut self, device: &DiscoveredDevice) -> Result<ConnectWarnings, ConnectionError> {
        if self.link.is_none() {
            return Err(self.fail(ConnectionError::NotConnected));
        }
        self.transition(ConnectionState::OpeningSession);
        info!("Starting a session with {}", device.serial_number);

        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.fail(ConnectionError::Cancelled));
            }
            attempts += 1;

            let outcome = match self.link.as_mut() {
                Some(link) => link.start_session(device),
                None => return Err(self.fail(ConnectionError::NotConnected)),
            };
            match outcome {
                Ok(warnings) => {
                    info!(
                        "Session open after {} attempt(s); initialization errors: {}; warnings: {}",
                        attempts, self.initialization_retries, warnings
                    );
                    self.publish(ConnectionEvent::SessionOpened {
                        attempts,
                        warnings: warnings.to_string(),
                    });
                    self.transition(ConnectionState::Connected);
                    return Ok(warnings);
                }
                Err(e) if e.is_retryable() => {
                    self.initialization_retries += 1;
                    info!("Initialization error count: {}", self.initialization_retries);
                    self.publish(ConnectionEvent::SessionAttemptFailed {
                        attempt: attempts,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    self.dispose_link();
                    return Err(self.fail(ConnectionError::SessionRejected(e)));
                }
            }

            if !self.session_policy.allows_retry(attempts, started) {
                return Err(self.fail(ConnectionError::RetriesExhausted {
                    stage: "session start",
                    attempts,
                }));
            }
            self.pause(self.session_policy.poll_interval());
        }
    }

    /// Runs the full sequence up to `Connected`.
    pub fn connect(&mut self) -> Result<(), ConnectionError> {
        let relays = self.scan_for_relays()?;
        self.connect_relay(&relays)?;
        let device = self.discover_device()?;
        self.open_session(&device)?;
        Ok(())
    }

    fn dispose_link(&mut self) {
        if let (Some(manager), Some(link)) = (self.manager.as_mut(), self.link.take()) {
            info!("Disposing link to relay {}", link.relay().serial_number);
            manager.dispose(link);
        }
    }

    /// Disposes the session and link if present, then releases the manager.
    /// Safe to call from any state and more than once.
    pub fn teardown(&mut self) {
        if self.state == ConnectionState::TornDown {
            return;
        }
        self.dispose_link();
        if let Some(mut manager) = self.manager.take() {
            manager.shutdown();
        }
        self.transition(ConnectionState::TornDown);
        info!("Connection torn down");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_transport::{MockHandle, MockScript, MockTransport};
    use std::collections::VecDeque;

    fn script() -> MockScript {
        MockScript {
            empty_discovery_polls: 0,
            session_outcomes: VecDeque::new(),
            generate_data: false,
            ..MockScript::default()
        }
    }

    fn manager(script: MockScript) -> (ConnectionManager, MockHandle) {
        let (transport, handle) = MockTransport::new(script);
        let cm = ConnectionManager::new(
            Box::new(transport),
            RetryPolicy::unbounded(0),
            RetryPolicy::unbounded(0),
            CancellationToken::new(),
        );
        (cm, handle)
    }

    #[test]
    fn connects_through_every_state() {
        let (tx, rx) = flume::unbounded();
        let (cm, _handle) = manager(script());
        let mut cm = cm.with_events(tx);
        cm.connect().unwrap();
        assert_eq!(cm.state(), &ConnectionState::Connected);
        assert!(cm.session().is_some());

        let states: Vec<ConnectionState> = rx
            .try_iter()
            .filter_map(|e| match e {
                ConnectionEvent::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::ScanningForRelays,
                ConnectionState::RelayBondingCheck,
                ConnectionState::ConnectingRelay,
                ConnectionState::DiscoveringDevice,
                ConnectionState::OpeningSession,
                ConnectionState::Connected,
            ]
        );
    }

    #[test]
    fn empty_registry_is_fatal() {
        let (mut cm, _handle) = manager(MockScript {
            bonded_relays: vec![],
            ..script()
        });
        assert_eq!(cm.scan_for_relays(), Err(ConnectionError::NoRelayBonded));
        assert!(matches!(cm.state(), ConnectionState::Failed(_)));
    }

    #[test]
    fn first_reachable_relay_wins() {
        let (mut cm, handle) = manager(MockScript {
            bonded_relays: vec!["R-1".into(), "R-2".into(), "R-3".into()],
            unreachable_relays: vec!["R-1".into()],
            ..script()
        });
        let relays = cm.scan_for_relays().unwrap();
        cm.connect_relay(&relays).unwrap();
        assert_eq!(handle.connect_attempts(), vec!["R-1".to_string(), "R-2".to_string()]);
    }

    #[test]
    fn session_is_hidden_until_connected() {
        let (mut cm, _handle) = manager(script());
        let relays = cm.scan_for_relays().unwrap();
        cm.connect_relay(&relays).unwrap();
        assert!(cm.session().is_none());
    }

    #[test]
    fn operations_after_teardown_report_not_connected() {
        let (mut cm, handle) = manager(script());
        cm.teardown();
        assert!(handle.manager_shut_down());
        assert_eq!(cm.scan_for_relays(), Err(ConnectionError::NotConnected));
    }
}
