/// BlueZ-backed implementation of the BLE adapter capability
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, Service};
use bluer::{AdapterEvent, Device, DeviceEvent, DeviceProperty};
use futures_util::stream::SelectAll;
use futures_util::{Stream, StreamExt};
use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::adapter::{channel_stream, BleAdapter, BleError, Discovered, Discoveries, Notifications};

const DISCOVERY_BUFFER: usize = 32;
const NOTIFICATION_BUFFER: usize = 32;

/// Name updates for one device, tagged with the device they belong to.
type NameChanges = Pin<Box<dyn Stream<Item = (Device, String)> + Send>>;

/// Watch a device's properties for the local name to show up
async fn name_changes(device: Device) -> bluer::Result<NameChanges> {
    let events = device.events().await?;
    Ok(Box::pin(events.filter_map(move |event| {
        let device = device.clone();
        async move {
            match event {
                DeviceEvent::PropertyChanged(DeviceProperty::Name(name)) => Some((device, name)),
                _ => None,
            }
        }
    })))
}

/// The default local Bluetooth adapter, driven through bluetoothd.
///
/// Discovery and notification sessions in bluer live as long as their
/// streams, so each one is held by a forwarding task that `stop_scan` and
/// `unsubscribe` abort.
pub struct BluezAdapter {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    notify_task: Mutex<Option<JoinHandle<()>>>,
}

impl BluezAdapter {
    /// Open a bluetoothd session and power on the default adapter
    ///
    /// # Returns
    /// The adapter, or [`BleError::AdapterUnavailable`] if there is no
    /// adapter or it cannot be powered on.
    pub async fn new() -> Result<Self, BleError> {
        let session = match bluer::Session::new().await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create Bluetooth session: {}", e);
                return Err(BleError::AdapterUnavailable(e.to_string()));
            }
        };

        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                error!("Failed to get default Bluetooth adapter: {}", e);
                return Err(BleError::AdapterUnavailable(e.to_string()));
            }
        };

        if let Err(e) = adapter.set_powered(true).await {
            error!("Failed to power on adapter: {}", e);
            return Err(BleError::AdapterUnavailable(e.to_string()));
        }

        // Low Energy only; the scale never shows up on BR/EDR
        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            duplicate_data: false,
            ..Default::default()
        };
        if let Err(e) = adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        Ok(BluezAdapter {
            _session: session,
            adapter,
            scan_task: Mutex::new(None),
            notify_task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    fn replace_task(slot: &Mutex<Option<JoinHandle<()>>>, task: Option<JoinHandle<()>>) {
        let previous = match slot.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, task),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), task),
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

#[async_trait]
impl BleAdapter for BluezAdapter {
    type Peripheral = Device;
    type Service = Service;
    type Characteristic = Characteristic;

    async fn check_available(&self) -> Result<(), BleError> {
        match self.adapter.is_powered().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BleError::AdapterUnavailable(format!(
                "adapter {} is powered off",
                self.adapter.name()
            ))),
            Err(e) => Err(BleError::AdapterUnavailable(e.to_string())),
        }
    }

    async fn start_scan(&self) -> Result<Discoveries<Device>, BleError> {
        let events = self
            .adapter
            .discover_devices()
            .await
            .map_err(|e| BleError::Scan(e.to_string()))?;

        let (tx, rx) = mpsc::channel(DISCOVERY_BUFFER);
        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            let mut events = Box::pin(events);
            // The name often comes in a later scan response, not with DeviceAdded
            let mut renamed: SelectAll<NameChanges> = SelectAll::new();
            let mut watched = HashSet::new();

            loop {
                let discovered = tokio::select! {
                    event = events.next() => {
                        let addr = match event {
                            Some(AdapterEvent::DeviceAdded(addr)) => addr,
                            Some(other) => {
                                debug!("Discovery event: {:?}", other);
                                continue;
                            }
                            None => break,
                        };
                        let device = match adapter.device(addr) {
                            Ok(device) => device,
                            Err(_) => continue,
                        };
                        let local_name = device.name().await.ok().flatten();
                        if local_name.is_none() && watched.insert(addr) {
                            match name_changes(device.clone()).await {
                                Ok(changes) => renamed.push(changes),
                                Err(e) => debug!("Cannot watch {} for a name: {}", addr, e),
                            }
                        }
                        Discovered {
                            local_name,
                            peripheral: device,
                        }
                    }
                    Some((device, name)) = renamed.next(), if !renamed.is_empty() => {
                        debug!("{} is now named {}", device.address(), name);
                        Discovered {
                            local_name: Some(name),
                            peripheral: device,
                        }
                    }
                };
                if tx.send(discovered).await.is_err() {
                    break;
                }
            }
        });
        Self::replace_task(&self.scan_task, Some(task));

        Ok(channel_stream(rx))
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        // Dropping the discovery stream ends the bluetoothd discovery session
        Self::replace_task(&self.scan_task, None);
        Ok(())
    }

    async fn connect(&self, peripheral: &Device) -> Result<(), BleError> {
        peripheral
            .connect()
            .await
            .map_err(|e| BleError::Connect(e.to_string()))
    }

    async fn discover_services(
        &self,
        peripheral: &Device,
        uuid: Uuid,
    ) -> Result<Vec<Service>, BleError> {
        let services = peripheral
            .services()
            .await
            .map_err(|e| BleError::Discovery(e.to_string()))?;

        let mut matching = Vec::new();
        for service in services {
            match service.uuid().await {
                Ok(service_uuid) if service_uuid == uuid => matching.push(service),
                Ok(_) => {}
                Err(e) => return Err(BleError::Discovery(e.to_string())),
            }
        }
        Ok(matching)
    }

    async fn discover_characteristics(
        &self,
        service: &Service,
        uuid: Uuid,
    ) -> Result<Vec<Characteristic>, BleError> {
        let characteristics = service
            .characteristics()
            .await
            .map_err(|e| BleError::Discovery(e.to_string()))?;

        let mut matching = Vec::new();
        for characteristic in characteristics {
            match characteristic.uuid().await {
                Ok(char_uuid) if char_uuid == uuid => matching.push(characteristic),
                Ok(_) => {}
                Err(e) => return Err(BleError::Discovery(e.to_string())),
            }
        }
        Ok(matching)
    }

    async fn subscribe(&self, characteristic: &Characteristic) -> Result<Notifications, BleError> {
        let notify = characteristic
            .notify()
            .await
            .map_err(|e| BleError::Subscribe(e.to_string()))?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let task = tokio::spawn(async move {
            let mut notify = Box::pin(notify);
            while let Some(value) = notify.next().await {
                if tx.send(value).await.is_err() {
                    break;
                }
            }
        });
        Self::replace_task(&self.notify_task, Some(task));

        Ok(channel_stream(rx))
    }

    async fn unsubscribe(&self, _characteristic: &Characteristic) -> Result<(), BleError> {
        // Dropping the notify stream makes bluer issue StopNotify
        Self::replace_task(&self.notify_task, None);
        Ok(())
    }

    async fn disconnect(&self, peripheral: &Device) -> Result<(), BleError> {
        peripheral
            .disconnect()
            .await
            .map_err(|e| BleError::Disconnect(e.to_string()))
    }
}
