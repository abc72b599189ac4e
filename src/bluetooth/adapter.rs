/// The BLE capability the measurement session drives
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Weight Scale service (0x181D).
pub const WEIGHT_SERVICE_UUID: Uuid = uuid_from_u16(0x181D);
/// Weight Measurement characteristic (0x2A9D).
pub const WEIGHT_MEASUREMENT_UUID: Uuid = uuid_from_u16(0x2A9D);

/// Expand a 16-bit assigned number onto the Bluetooth base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    const BLUETOOTH_BASE: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
    Uuid::from_u128(BLUETOOTH_BASE | ((short as u128) << 96))
}

#[derive(Debug, Error)]
pub enum BleError {
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("scan failed: {0}")]
    Scan(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("GATT discovery failed: {0}")]
    Discovery(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("disconnect failed: {0}")]
    Disconnect(String),
}

/// A device seen while scanning.
#[derive(Debug, Clone)]
pub struct Discovered<P> {
    pub local_name: Option<String>,
    pub peripheral: P,
}

pub type Discoveries<P> = Pin<Box<dyn Stream<Item = Discovered<P>> + Send>>;

/// Raw characteristic values pushed by the peripheral. Dropping the
/// stream removes the handler.
pub type Notifications = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Turn a channel fed by a background task into a boxed stream.
pub fn channel_stream<T: Send + 'static>(
    rx: mpsc::Receiver<T>,
) -> Pin<Box<dyn Stream<Item = T> + Send>> {
    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// BLE central operations used by one measurement session.
///
/// Implementations are stateless from the session's point of view: the
/// session owns every handle it gets back and releases it itself.
#[async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    type Peripheral: Send + Sync + 'static;
    type Service: Send + Sync + 'static;
    type Characteristic: Send + Sync + 'static;

    /// Fails with [`BleError::AdapterUnavailable`] when the radio is off.
    async fn check_available(&self) -> Result<(), BleError>;

    async fn start_scan(&self) -> Result<Discoveries<Self::Peripheral>, BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    async fn connect(&self, peripheral: &Self::Peripheral) -> Result<(), BleError>;

    async fn discover_services(
        &self,
        peripheral: &Self::Peripheral,
        uuid: Uuid,
    ) -> Result<Vec<Self::Service>, BleError>;

    async fn discover_characteristics(
        &self,
        service: &Self::Service,
        uuid: Uuid,
    ) -> Result<Vec<Self::Characteristic>, BleError>;

    async fn subscribe(&self, characteristic: &Self::Characteristic)
        -> Result<Notifications, BleError>;

    async fn unsubscribe(&self, characteristic: &Self::Characteristic) -> Result<(), BleError>;

    async fn disconnect(&self, peripheral: &Self::Peripheral) -> Result<(), BleError>;
}
