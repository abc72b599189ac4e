/// Scripted in-memory adapter for exercising sessions without a radio
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::{stream, Stream};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::adapter::{
    channel_stream, BleAdapter, BleError, Discovered, Discoveries, Notifications,
    WEIGHT_MEASUREMENT_UUID, WEIGHT_SERVICE_UUID,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan,
    StopScan,
    Connect(String),
    DiscoverServices,
    DiscoverCharacteristics,
    Subscribe,
    /// The notification stream handed out by `subscribe` was dropped.
    HandlerDropped,
    Unsubscribe,
    Disconnect(String),
}

type CallLog = Arc<Mutex<Vec<Call>>>;

/// Test side of the fake: advertises devices and pushes notifications.
pub struct FakeRadio {
    discover_tx: mpsc::Sender<Discovered<String>>,
    notify_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl FakeRadio {
    /// Advertise a peripheral identified by its name.
    pub async fn advertise(&self, local_name: Option<&str>) {
        self.advertise_peripheral(local_name.unwrap_or("<unnamed>"), local_name)
            .await;
    }

    /// Report `peripheral` with whatever name is currently known for it.
    pub async fn advertise_peripheral(&self, peripheral: &str, local_name: Option<&str>) {
        let discovered = Discovered {
            local_name: local_name.map(str::to_string),
            peripheral: peripheral.to_string(),
        };
        self.discover_tx.send(discovered).await.unwrap();
    }

    pub async fn notify(&self, payload: Vec<u8>) {
        let tx = self.notify_tx.lock().unwrap().clone();
        tx.expect("notifications closed").send(payload).await.unwrap();
    }

    /// End the notification stream, as if the peripheral dropped it.
    pub fn close_notifications(&self) {
        self.notify_tx.lock().unwrap().take();
    }
}

/// Notification stream that logs when the session lets go of it.
struct TrackedNotifications {
    inner: Notifications,
    calls: CallLog,
}

impl Stream for TrackedNotifications {
    type Item = Vec<u8>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Vec<u8>>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

impl Drop for TrackedNotifications {
    fn drop(&mut self) {
        self.calls.lock().unwrap().push(Call::HandlerDropped);
    }
}

pub struct FakeAdapter {
    calls: CallLog,
    discover_rx: Mutex<Option<mpsc::Receiver<Discovered<String>>>>,
    notify_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    services: usize,
    characteristics: usize,
    fail_connect: bool,
    hang_connect: bool,
    fail_subscribe: bool,
    fail_teardown: bool,
    powered: AtomicBool,
}

impl FakeAdapter {
    pub fn new() -> (FakeAdapter, FakeRadio) {
        let (discover_tx, discover_rx) = mpsc::channel(64);
        let (notify_tx, notify_rx) = mpsc::channel(64);
        let adapter = FakeAdapter {
            calls: Arc::new(Mutex::new(Vec::new())),
            discover_rx: Mutex::new(Some(discover_rx)),
            notify_rx: Mutex::new(Some(notify_rx)),
            services: 1,
            characteristics: 1,
            fail_connect: false,
            hang_connect: false,
            fail_subscribe: false,
            fail_teardown: false,
            powered: AtomicBool::new(true),
        };
        let radio = FakeRadio {
            discover_tx,
            notify_tx: Mutex::new(Some(notify_tx)),
        };
        (adapter, radio)
    }

    pub fn with_services(mut self, count: usize) -> Self {
        self.services = count;
        self
    }

    pub fn with_characteristics(mut self, count: usize) -> Self {
        self.characteristics = count;
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn hanging_connect(mut self) -> Self {
        self.hang_connect = true;
        self
    }

    pub fn failing_subscribe(mut self) -> Self {
        self.fail_subscribe = true;
        self
    }

    /// Make both unsubscribe and disconnect report errors.
    pub fn failing_teardown(mut self) -> Self {
        self.fail_teardown = true;
        self
    }

    pub fn power_off(&self) {
        self.powered.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BleAdapter for FakeAdapter {
    type Peripheral = String;
    type Service = Uuid;
    type Characteristic = Uuid;

    async fn check_available(&self) -> Result<(), BleError> {
        if self.powered.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BleError::AdapterUnavailable("powered off".into()))
        }
    }

    async fn start_scan(&self) -> Result<Discoveries<String>, BleError> {
        self.record(Call::StartScan);
        match self.discover_rx.lock().unwrap().take() {
            Some(rx) => Ok(channel_stream(rx)),
            None => Ok(Box::pin(stream::pending())),
        }
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn connect(&self, peripheral: &String) -> Result<(), BleError> {
        self.record(Call::Connect(peripheral.clone()));
        if self.hang_connect {
            std::future::pending::<()>().await;
        }
        if self.fail_connect {
            return Err(BleError::Connect("peer refused".into()));
        }
        Ok(())
    }

    async fn discover_services(&self, _peripheral: &String, uuid: Uuid) -> Result<Vec<Uuid>, BleError> {
        self.record(Call::DiscoverServices);
        assert_eq!(uuid, WEIGHT_SERVICE_UUID);
        Ok(vec![uuid; self.services])
    }

    async fn discover_characteristics(&self, _service: &Uuid, uuid: Uuid) -> Result<Vec<Uuid>, BleError> {
        self.record(Call::DiscoverCharacteristics);
        assert_eq!(uuid, WEIGHT_MEASUREMENT_UUID);
        Ok(vec![uuid; self.characteristics])
    }

    async fn subscribe(&self, _characteristic: &Uuid) -> Result<Notifications, BleError> {
        self.record(Call::Subscribe);
        if self.fail_subscribe {
            return Err(BleError::Subscribe("notify not permitted".into()));
        }
        let inner: Notifications = match self.notify_rx.lock().unwrap().take() {
            Some(rx) => channel_stream(rx),
            None => Box::pin(stream::pending()),
        };
        Ok(Box::pin(TrackedNotifications {
            inner,
            calls: Arc::clone(&self.calls),
        }))
    }

    async fn unsubscribe(&self, _characteristic: &Uuid) -> Result<(), BleError> {
        self.record(Call::Unsubscribe);
        if self.fail_teardown {
            return Err(BleError::Subscribe("stop notify rejected".into()));
        }
        Ok(())
    }

    async fn disconnect(&self, peripheral: &String) -> Result<(), BleError> {
        self.record(Call::Disconnect(peripheral.clone()));
        if self.fail_teardown {
            return Err(BleError::Disconnect("link already gone".into()));
        }
        Ok(())
    }
}
