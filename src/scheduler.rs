/// Periodic driver for measurement sessions and uploads
use std::future::Future;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};

use crate::bluetooth::{BleAdapter, BleError, ScaleSession, StartOutcome};
use crate::models::CompletedRecord;
use crate::upload::{StreamKeys, UploadClient};
use crate::utils::format_datetime;

/// How long shutdown waits for the in-flight session to disconnect.
const SHUTDOWN_GRACE_SECS: u64 = 10;

pub struct Scheduler<A: BleAdapter> {
    session: ScaleSession<A>,
    uploader: UploadClient,
    keys: StreamKeys,
    period: Duration,
    shutdown_tx: watch::Sender<bool>,
    in_flight: Option<JoinHandle<()>>,
}

impl<A: BleAdapter> Scheduler<A> {
    /// # Arguments
    /// * `adapter` - BLE capability shared by every session
    /// * `target_name` - Advertised local name of the scale
    /// * `step_timeout` - Per-step bound handed to each session
    /// * `period` - Time between session starts
    /// * `uploader`, `keys` - Where completed records go
    pub fn new(
        adapter: Arc<A>,
        target_name: &str,
        step_timeout: Duration,
        period: Duration,
        uploader: UploadClient,
        keys: StreamKeys,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Scheduler {
            session: ScaleSession::new(adapter, target_name, step_timeout, shutdown_rx),
            uploader,
            keys,
            period,
            shutdown_tx,
            in_flight: None,
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> &ScaleSession<A> {
        &self.session
    }

    /// Fire a session now and then every period until `shutdown` resolves
    ///
    /// # Returns
    /// `Ok` after a requested shutdown, or the adapter error that makes
    /// further sessions impossible
    pub async fn run<S>(&mut self, shutdown: S) -> Result<(), BleError>
    where
        S: Future<Output = ()>,
    {
        info!(
            "Reading the scale every {} seconds",
            self.period.as_secs()
        );

        // First tick completes immediately
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("BLE adapter turned off unexpectedly: {}", e);
                        self.stop().await;
                        return Err(e);
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    self.stop().await;
                    return Ok(());
                }
            }
        }
    }

    /// Start a session unless one is still in flight.
    pub async fn tick(&mut self) -> Result<StartOutcome, BleError> {
        self.session.adapter().check_available().await?;

        let outcome = self.session.try_start();
        if outcome == StartOutcome::Started {
            self.in_flight = Some(self.spawn_session());
        }
        Ok(outcome)
    }

    fn spawn_session(&self) -> JoinHandle<()> {
        let session = self.session.clone();
        let uploader = self.uploader.clone();
        let keys = self.keys.clone();

        tokio::spawn(async move {
            match session.run().await {
                Ok(record) => {
                    log_record(&record);
                    // The session is already Idle; the upload does not hold it
                    tokio::spawn(upload_record(uploader, keys, record));
                }
                Err(e) => warn!("Session ended without a record: {}", e),
            }
        })
    }

    /// Ask the in-flight session to tear down and wait for it, bounded.
    async fn stop(&mut self) {
        // Nothing left to notify if every receiver is gone
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.in_flight.take() {
            match timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), task).await {
                Ok(Ok(())) => info!("Session released the scale"),
                Ok(Err(e)) => error!("Session task failed: {}", e),
                Err(_) => warn!(
                    "Session did not finish within {} seconds; exiting anyway",
                    SHUTDOWN_GRACE_SECS
                ),
            }
        }
    }
}

async fn upload_record(uploader: UploadClient, keys: StreamKeys, record: CompletedRecord) {
    match uploader.send(&keys, &record).await {
        Ok(()) => info!("Upload successful"),
        Err(e) => error!("Upload error: {}", e),
    }
}

fn log_record(record: &CompletedRecord) {
    info!("Weights read at {}:", format_datetime(&record.measured_at));
    info!("  Total: {:.3} kg", record.total_kg);
    info!("  Upper left: {:.3} kg", record.upper_left_kg);
    info!("  Upper right: {:.3} kg", record.upper_right_kg);
    info!("  Lower left: {:.3} kg", record.lower_left_kg);
    info!("  Lower right: {:.3} kg", record.lower_right_kg);
}
