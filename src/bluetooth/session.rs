/// One scan-to-disconnect measurement cycle against the weight scale
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

use crate::bluetooth::adapter::{BleAdapter, BleError, WEIGHT_MEASUREMENT_UUID, WEIGHT_SERVICE_UUID};
use crate::bluetooth::decoder::decode_weight;
use crate::models::{CompletedRecord, FoldOutcome, PartialRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringService,
    DiscoveringCharacteristic,
    Subscribing,
    Accumulating,
    Finalizing,
    Aborting,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("scan failed: {0}")]
    Scan(BleError),
    #[error("scan ended before the scale was found")]
    ScanEnded,
    #[error("connect failed: {0}")]
    Connect(BleError),
    #[error("discovery failed: {0}")]
    Discovery(BleError),
    #[error("discovery returned unexpected {found} {what}")]
    UnexpectedTopology { what: &'static str, found: usize },
    #[error("subscribe failed: {0}")]
    Subscribe(BleError),
    #[error("notifications stopped before a full set of weights arrived")]
    NotificationsEnded,
    #[error("timed out while {0:?}")]
    Timeout(SessionState),
    #[error("shutdown requested")]
    Shutdown,
}

/// Result of asking the session to start a new cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Still looking for the scale; the running scan carries on.
    ContinuingScan,
    /// A previous cycle is past scanning and has not finished yet.
    Busy(SessionState),
}

/// Everything the cycle has acquired on the peripheral and must give back.
struct Held<A: BleAdapter> {
    scanning: bool,
    peripheral: Option<A::Peripheral>,
    connected: bool,
    characteristic: Option<A::Characteristic>,
    subscribed: bool,
}

impl<A: BleAdapter> Held<A> {
    fn new() -> Self {
        Held {
            scanning: false,
            peripheral: None,
            connected: false,
            characteristic: None,
            subscribed: false,
        }
    }
}

/// The measurement session for the configured scale
///
/// Clones share the same state, so the scheduler can keep one handle to
/// gate new cycles while a spawned task runs the current one. At most one
/// cycle runs at a time: [`ScaleSession::try_start`] only moves `Idle` to
/// `Scanning`.
pub struct ScaleSession<A: BleAdapter> {
    adapter: Arc<A>,
    target_name: Arc<str>,
    step_timeout: Duration,
    state: Arc<Mutex<SessionState>>,
    shutdown: watch::Receiver<bool>,
}

impl<A: BleAdapter> Clone for ScaleSession<A> {
    fn clone(&self) -> Self {
        ScaleSession {
            adapter: Arc::clone(&self.adapter),
            target_name: Arc::clone(&self.target_name),
            step_timeout: self.step_timeout,
            state: Arc::clone(&self.state),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<A: BleAdapter> ScaleSession<A> {
    /// # Arguments
    /// * `adapter` - BLE capability used for every operation
    /// * `target_name` - Advertised local name of the scale
    /// * `step_timeout` - Upper bound on each connect/discover/subscribe step
    ///   and on the gap between notifications
    /// * `shutdown` - Flips to `true` when the process is stopping
    pub fn new(
        adapter: Arc<A>,
        target_name: &str,
        step_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        ScaleSession {
            adapter,
            target_name: Arc::from(target_name),
            step_timeout,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            shutdown,
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn state(&self) -> SessionState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: SessionState) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state != next {
            debug!("Session {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// Claim the session for a new cycle
    ///
    /// Moves `Idle` to `Scanning` and returns [`StartOutcome::Started`]; the
    /// caller must then drive [`ScaleSession::run`]. Any other state leaves
    /// the session untouched.
    pub fn try_start(&self) -> StartOutcome {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        match *state {
            SessionState::Idle => {
                *state = SessionState::Scanning;
                debug!("Scanning started.");
                StartOutcome::Started
            }
            SessionState::Scanning => {
                debug!("Continuing existing scan.");
                StartOutcome::ContinuingScan
            }
            busy => {
                info!("Skipping scan: previous session is still busy ({:?})", busy);
                StartOutcome::Busy(busy)
            }
        }
    }

    /// Run one cycle from scanning to disconnect
    ///
    /// Every exit path releases what was acquired (scan, subscription,
    /// connection) and leaves the session `Idle`. A scale left connected or
    /// subscribed stops advertising until it is power-cycled.
    ///
    /// # Returns
    /// The completed record, or the error that aborted the cycle
    pub async fn run(&self) -> Result<CompletedRecord, SessionError> {
        let mut held = Held::new();
        let result = self.cycle(&mut held).await;

        match &result {
            Ok(_) => self.set_state(SessionState::Finalizing),
            Err(e) => {
                warn!("Aborting session: {}", e);
                self.set_state(SessionState::Aborting);
            }
        }
        self.release(held).await;
        self.set_state(SessionState::Idle);

        result
    }

    async fn cycle(&self, held: &mut Held<A>) -> Result<CompletedRecord, SessionError> {
        let mut discoveries = self.adapter.start_scan().await.map_err(SessionError::Scan)?;
        held.scanning = true;

        let peripheral = loop {
            // Scanning has no deadline; the scheduler keeps it going across ticks
            let discovered = self
                .interruptible(SessionState::Scanning, None, discoveries.next())
                .await?
                .ok_or(SessionError::ScanEnded)?;

            if discovered.local_name.as_deref() == Some(&*self.target_name) {
                break discovered.peripheral;
            }
            debug!(
                "Ignoring BLE device {}. Continuing to scan",
                discovered.local_name.as_deref().unwrap_or("<unnamed>")
            );
        };
        info!("Found {}", self.target_name);

        // Don't scan for more devices while talking to this one
        drop(discoveries);
        held.scanning = false;
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scanning: {}", e);
        }

        let peripheral = &*held.peripheral.insert(peripheral);
        match self
            .step(SessionState::Connecting, self.adapter.connect(peripheral))
            .await
        {
            Ok(Ok(())) => held.connected = true,
            Ok(Err(e)) => return Err(SessionError::Connect(e)),
            Err(interrupted) => {
                // The link may come up after we stopped waiting
                held.connected = true;
                return Err(interrupted);
            }
        }
        debug!("Connected");

        let services = self
            .step(
                SessionState::DiscoveringService,
                self.adapter.discover_services(peripheral, WEIGHT_SERVICE_UUID),
            )
            .await?
            .map_err(SessionError::Discovery)?;
        let service = exactly_one(services, "services")?;

        let characteristics = self
            .step(
                SessionState::DiscoveringCharacteristic,
                self.adapter
                    .discover_characteristics(&service, WEIGHT_MEASUREMENT_UUID),
            )
            .await?
            .map_err(SessionError::Discovery)?;
        let characteristic = &*held
            .characteristic
            .insert(exactly_one(characteristics, "characteristics")?);

        // Fresh record for this session, before any notification can arrive
        let mut partial = PartialRecord::new();
        let mut notifications = match self
            .step(SessionState::Subscribing, self.adapter.subscribe(characteristic))
            .await
        {
            Ok(Ok(notifications)) => {
                held.subscribed = true;
                notifications
            }
            Ok(Err(e)) => return Err(SessionError::Subscribe(e)),
            Err(interrupted) => {
                held.subscribed = true;
                return Err(interrupted);
            }
        };

        let record = loop {
            let payload = self
                .step(SessionState::Accumulating, notifications.next())
                .await?
                .ok_or(SessionError::NotificationsEnded)?;

            let measurement = match decode_weight(&payload) {
                Ok(measurement) => measurement,
                Err(e) => {
                    error!("Skipping weight measurement: {}", e);
                    continue;
                }
            };
            info!(
                "Received user {} weight(kg) {}",
                measurement.sensor_id.as_raw(),
                measurement.weight_kg
            );

            match partial.fold(measurement) {
                FoldOutcome::Complete(record) => break record,
                FoldOutcome::Stored => {}
                FoldOutcome::Restarted => {
                    info!("Scale restarted its report set; starting a fresh record")
                }
                FoldOutcome::IgnoredReset => debug!("Scale is resetting; report skipped"),
                FoldOutcome::IgnoredBeforeTotal => {
                    debug!("Skipping report until the start of a set")
                }
                FoldOutcome::IgnoredDuplicate => debug!(
                    "Duplicate report for user {} skipped",
                    measurement.sensor_id.as_raw()
                ),
            }
        };

        // Handler goes first so late notifications cannot race the unsubscribe
        drop(notifications);
        Ok(record)
    }

    /// Give back everything in `held`, tolerating individual failures.
    async fn release(&self, held: Held<A>) {
        if held.scanning {
            if let Err(e) = self.adapter.stop_scan().await {
                warn!("Failed to stop scanning: {}", e);
            }
        }

        if held.subscribed {
            if let Some(characteristic) = &held.characteristic {
                match timeout(self.step_timeout, self.adapter.unsubscribe(characteristic)).await {
                    Ok(Ok(())) => debug!("Unsubscribed"),
                    // go on - what else can we do?
                    Ok(Err(e)) => error!("Failed to unsubscribe: {}", e),
                    Err(_) => error!("Timed out unsubscribing"),
                }
            }
        }

        if held.connected {
            if let Some(peripheral) = &held.peripheral {
                match timeout(self.step_timeout, self.adapter.disconnect(peripheral)).await {
                    Ok(Ok(())) => debug!("Disconnected"),
                    Ok(Err(e)) => error!("Failed to disconnect: {}", e),
                    Err(_) => error!("Timed out disconnecting"),
                }
            }
        }
    }

    async fn step<F: Future>(&self, state: SessionState, fut: F) -> Result<F::Output, SessionError> {
        self.set_state(state);
        self.interruptible(state, Some(self.step_timeout), fut).await
    }

    /// Await `fut`, giving up on timeout or shutdown.
    async fn interruptible<F: Future>(
        &self,
        state: SessionState,
        limit: Option<Duration>,
        fut: F,
    ) -> Result<F::Output, SessionError> {
        let bounded = async {
            match limit {
                Some(limit) => timeout(limit, fut)
                    .await
                    .map_err(|_| SessionError::Timeout(state)),
                None => Ok(fut.await),
            }
        };

        tokio::select! {
            result = bounded => result,
            _ = shutdown_requested(self.shutdown.clone()) => Err(SessionError::Shutdown),
        }
    }
}

/// Resolves once the shutdown flag is set. Never resolves if the sender
/// is gone without setting it.
async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn exactly_one<T>(mut found: Vec<T>, what: &'static str) -> Result<T, SessionError> {
    if found.len() != 1 {
        return Err(SessionError::UnexpectedTopology {
            what,
            found: found.len(),
        });
    }
    found.pop().ok_or(SessionError::UnexpectedTopology { what, found: 0 })
}
