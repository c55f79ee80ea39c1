use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, trace};

use super::transport::{
    AdapterPower, BleTransport, CharacteristicInfo, DeviceId, ServiceInfo, ServiceInventory,
    TransportEvent,
};
use crate::catalog::normalize_uuid;
use crate::error::TransportFault;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const PERIPHERAL_POLL_INTERVAL: Duration = Duration::from_millis(250);
const PERIPHERAL_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

type NotificationStream =
    std::pin::Pin<Box<dyn tokio_stream::Stream<Item = btleplug::api::ValueNotification> + Send>>;

/// Transport backend backed by `btleplug`.
pub struct BtleplugBackend {
    adapter: Adapter,
    events: broadcast::Sender<TransportEvent>,
    known: Arc<Mutex<HashMap<String, DeviceEntry>>>,
    pump_started: Arc<Mutex<bool>>,
    cancel: CancellationToken,
}

struct DeviceEntry {
    peripheral: Peripheral,
    characteristics: HashMap<String, Characteristic>,
    pump: Option<CancellationToken>,
}

impl BtleplugBackend {
    /// Creates the real BLE backend on the first available adapter.
    pub async fn new() -> Result<Self, TransportFault> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportFault::NoAdapters)?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            adapter,
            events,
            known: Arc::new(Mutex::new(HashMap::new())),
            pump_started: Arc::new(Mutex::new(false)),
            cancel: CancellationToken::new(),
        })
    }

    /// Polls the scan results until a peripheral advertising a name starting
    /// with `prefix` appears, and returns its identifier.
    ///
    /// Scanning stays a transport concern; the session core only ever sees
    /// the returned identifier.
    #[instrument(skip(self), level = "debug", fields(prefix))]
    pub async fn find_device(
        &self,
        prefix: &str,
        timeout: Duration,
    ) -> Result<DeviceId, TransportFault> {
        let deadline = Instant::now() + timeout;
        loop {
            for peripheral in self.adapter.peripherals().await? {
                let Some(properties) = peripheral.properties().await? else {
                    continue;
                };
                let matches = properties
                    .local_name
                    .as_deref()
                    .is_some_and(|name| name.starts_with(prefix));
                if matches {
                    let device = DeviceId::from(peripheral.id().to_string());
                    info!(%device, name = ?properties.local_name, "matched advertised name");
                    return Ok(device);
                }
            }

            if Instant::now() >= deadline {
                return Err(TransportFault::NoMatchingDevice {
                    prefix: prefix.to_string(),
                });
            }
            sleep(PERIPHERAL_POLL_INTERVAL).await;
        }
    }

    fn lock_known(&self) -> MutexGuard<'_, HashMap<String, DeviceEntry>> {
        self.known.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn lookup_peripheral(&self, device: &DeviceId) -> Result<Peripheral, TransportFault> {
        if let Some(entry) = self.lock_known().get(device.as_str()) {
            return Ok(entry.peripheral.clone());
        }

        let deadline = Instant::now() + PERIPHERAL_LOOKUP_TIMEOUT;
        loop {
            for peripheral in self.adapter.peripherals().await? {
                if peripheral.id().to_string() == device.as_str() {
                    return Ok(peripheral);
                }
            }

            if Instant::now() >= deadline {
                return Err(TransportFault::UnknownDevice {
                    device_id: device.to_string(),
                });
            }
            sleep(PERIPHERAL_POLL_INTERVAL).await;
        }
    }

    fn connected_characteristic(
        &self,
        device: &DeviceId,
        characteristic: &str,
    ) -> Result<(Peripheral, Characteristic), TransportFault> {
        let known = self.lock_known();
        let entry = known
            .get(device.as_str())
            .ok_or_else(|| TransportFault::UnknownDevice {
                device_id: device.to_string(),
            })?;
        let characteristic = entry
            .characteristics
            .get(&normalize_uuid(characteristic))
            .ok_or_else(|| TransportFault::UnknownDevice {
                device_id: device.to_string(),
            })?;
        Ok((entry.peripheral.clone(), characteristic.clone()))
    }

    async fn start_adapter_pump(&self) -> Result<(), TransportFault> {
        {
            let started = self
                .pump_started
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *started {
                return Ok(());
            }
        }

        let mut central_events = self.adapter.events().await?;
        {
            let mut started = self
                .pump_started
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *started {
                return Ok(());
            }
            *started = true;
        }

        let sender = self.events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    maybe_event = central_events.next() => match maybe_event {
                        Some(CentralEvent::DeviceDisconnected(id)) => {
                            let _ = sender.send(TransportEvent::Disconnected {
                                device: DeviceId::from(id.to_string()),
                            });
                        }
                        Some(CentralEvent::StateUpdate(state)) => {
                            let _ = sender.send(TransportEvent::AdapterState(
                                power_from_central_state(state),
                            ));
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });
        Ok(())
    }

    fn start_notification_pump(
        &self,
        device: &DeviceId,
        services_by_characteristic: HashMap<String, String>,
        mut notifications: NotificationStream,
    ) -> CancellationToken {
        let pump = self.cancel.child_token();
        let cancel = pump.clone();
        let sender = self.events.clone();
        let device = device.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    maybe_notification = notifications.next() => match maybe_notification {
                        Some(notification) => {
                            let characteristic =
                                notification.uuid.to_string().to_lowercase();
                            let Some(service) =
                                services_by_characteristic.get(&characteristic)
                            else {
                                trace!(
                                    %device,
                                    characteristic = characteristic.as_str(),
                                    "dropping notification for unknown characteristic"
                                );
                                continue;
                            };
                            let _ = sender.send(TransportEvent::Notification {
                                device: device.clone(),
                                service: service.clone(),
                                characteristic,
                                payload: notification.value,
                            });
                        }
                        None => break,
                    },
                }
            }
        });
        pump
    }
}

#[async_trait::async_trait]
impl BleTransport for BtleplugBackend {
    #[instrument(skip(self), level = "debug")]
    async fn start(&self) -> Result<(), TransportFault> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        self.start_adapter_pump().await
    }

    async fn adapter_state(&self) -> Result<AdapterPower, TransportFault> {
        let state = self.adapter.adapter_state().await?;
        Ok(power_from_central_state(state))
    }

    #[instrument(skip(self), level = "debug", fields(%device))]
    async fn connect(&self, device: &DeviceId) -> Result<(), TransportFault> {
        let peripheral = self.lookup_peripheral(device).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;

        let (characteristics, services_by_characteristic) =
            collect_characteristics(&peripheral);
        let notifications = peripheral.notifications().await?;
        let pump =
            self.start_notification_pump(device, services_by_characteristic, notifications);

        let previous = self.lock_known().insert(
            device.as_str().to_string(),
            DeviceEntry {
                peripheral,
                characteristics,
                pump: Some(pump),
            },
        );
        if let Some(previous_pump) = previous.and_then(|entry| entry.pump) {
            previous_pump.cancel();
        }
        info!(%device, "connected to peripheral");
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(%device))]
    async fn disconnect(&self, device: &DeviceId) -> Result<(), TransportFault> {
        let entry = self.lock_known().remove(device.as_str());
        let Some(entry) = entry else {
            return Ok(());
        };
        if let Some(pump) = entry.pump {
            pump.cancel();
        }
        if entry.peripheral.is_connected().await? {
            entry.peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn retrieve_services(
        &self,
        device: &DeviceId,
    ) -> Result<ServiceInventory, TransportFault> {
        let peripheral = self.lookup_peripheral(device).await?;
        Ok(collect_service_inventory(&peripheral))
    }

    #[instrument(skip(self), level = "trace", fields(%device, service, characteristic))]
    async fn start_notifications(
        &self,
        device: &DeviceId,
        service: &str,
        characteristic: &str,
    ) -> Result<(), TransportFault> {
        let (peripheral, characteristic) = self.connected_characteristic(device, characteristic)?;
        peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "trace", fields(%device, service, characteristic))]
    async fn stop_notifications(
        &self,
        device: &DeviceId,
        service: &str,
        characteristic: &str,
    ) -> Result<(), TransportFault> {
        let (peripheral, characteristic) = self.connected_characteristic(device, characteristic)?;
        peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    #[instrument(
        skip(self, payload),
        level = "trace",
        fields(%device, characteristic, payload_len = payload.len())
    )]
    async fn write(
        &self,
        device: &DeviceId,
        _service: &str,
        characteristic: &str,
        payload: &[u8],
    ) -> Result<(), TransportFault> {
        let (peripheral, characteristic) = self.connected_characteristic(device, characteristic)?;
        peripheral
            .write(&characteristic, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    #[instrument(
        skip(self, payload),
        level = "trace",
        fields(%device, characteristic, payload_len = payload.len())
    )]
    async fn write_without_response(
        &self,
        device: &DeviceId,
        _service: &str,
        characteristic: &str,
        payload: &[u8],
    ) -> Result<(), TransportFault> {
        let (peripheral, characteristic) = self.connected_characteristic(device, characteristic)?;
        peripheral
            .write(&characteristic, payload, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

impl Drop for BtleplugBackend {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn power_from_central_state(state: CentralState) -> AdapterPower {
    match state {
        CentralState::PoweredOn => AdapterPower::On,
        _ => AdapterPower::Off,
    }
}

fn collect_service_inventory(peripheral: &Peripheral) -> ServiceInventory {
    let mut services = Vec::new();
    for service in peripheral.services() {
        let mut characteristics = Vec::new();
        for characteristic in &service.characteristics {
            characteristics.push(CharacteristicInfo::new(
                characteristic.uuid.to_string().to_lowercase(),
                property_labels(characteristic.properties),
            ));
        }
        characteristics.sort_by(|left, right| left.uuid().cmp(right.uuid()));

        services.push(ServiceInfo::new(
            service.uuid.to_string().to_lowercase(),
            characteristics,
        ));
    }
    services.sort_by(|left, right| left.uuid().cmp(right.uuid()));
    ServiceInventory::new(services)
}

fn collect_characteristics(
    peripheral: &Peripheral,
) -> (HashMap<String, Characteristic>, HashMap<String, String>) {
    let mut characteristics = HashMap::new();
    let mut services_by_characteristic = HashMap::new();

    for service in peripheral.services() {
        let service_uuid = service.uuid.to_string().to_lowercase();
        for characteristic in &service.characteristics {
            let characteristic_uuid = characteristic.uuid.to_string().to_lowercase();
            characteristics
                .entry(characteristic_uuid.clone())
                .or_insert_with(|| characteristic.clone());
            services_by_characteristic
                .entry(characteristic_uuid)
                .or_insert_with(|| service_uuid.clone());
        }
    }

    (characteristics, services_by_characteristic)
}

fn property_labels(flags: CharPropFlags) -> Vec<String> {
    let labels: Vec<String> = flags
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect();
    if labels.is_empty() {
        vec!["none".to_string()]
    } else {
        labels
    }
}
