use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use bon::Builder;
use strum_macros::EnumString;
use tokio::sync::broadcast;
use tracing::instrument;

use super::transport::{
    AdapterPower, BleTransport, CharacteristicInfo, DeviceId, ServiceInfo, ServiceInventory,
    TransportEvent, WriteMode,
};
use crate::catalog;
use crate::error::{FixtureError, TransportFault};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_DEVICE_ID: &str = "AA:BB:CC:DD:EE:FF";

/// Named GATT inventories matching the built-in profile catalog.
#[derive(Debug, Clone, Copy, Eq, PartialEq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum CannedInventory {
    /// Serial-port-profile bridge: service `1101`, characteristic `ffe1`.
    SppFfe1,
    /// Vendor `ffe0` service with an `ffe1` write/notify characteristic.
    VendorFfe0,
    /// Transparent-UART service `e781…` with a `be78…` characteristic.
    TransparentUart,
}

impl CannedInventory {
    /// Builds the service inventory for this canned adapter.
    #[must_use]
    pub fn inventory(self) -> ServiceInventory {
        let (service, characteristic, properties): (&str, &str, &[&str]) = match self {
            Self::SppFfe1 => (
                catalog::SPP_SERVICE_UUID,
                catalog::FFE1_CHARACTERISTIC_UUID,
                &["write", "write_without_response", "notify"],
            ),
            Self::VendorFfe0 => (
                catalog::FFE0_SERVICE_UUID,
                catalog::FFE1_CHARACTERISTIC_UUID,
                &["write_without_response", "notify"],
            ),
            Self::TransparentUart => (
                catalog::E781_SERVICE_UUID,
                catalog::BE78_CHARACTERISTIC_UUID,
                &["write", "write_without_response", "notify"],
            ),
        };

        ServiceInventory::new(vec![ServiceInfo::new(
            service.to_string(),
            vec![CharacteristicInfo::new(
                characteristic.to_string(),
                properties
                    .iter()
                    .map(|property| (*property).to_string())
                    .collect(),
            )],
        )])
    }
}

/// Parsed service-inventory fixture: a canned inventory name or
/// `;`-separated `service:char=prop+prop,char=prop+prop` records.
#[derive(Debug, Clone, derive_more::Into)]
pub struct ServiceFixture {
    inventory: ServiceInventory,
}

impl FromStr for ServiceFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if let Ok(canned) = value.parse::<CannedInventory>() {
            return Ok(Self {
                inventory: canned.inventory(),
            });
        }

        let inventory = parse_service_fixture(value)?;
        Ok(Self { inventory })
    }
}

/// One step of a scripted reply to a characteristic write.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReplyStep {
    /// Emit one notification payload.
    Notify(Vec<u8>),
    /// Drop the link and emit a disconnect event.
    DropLink,
}

/// Scripted fake reaction to one characteristic write.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ReplyScript {
    steps: Vec<ReplyStep>,
}

impl ReplyScript {
    /// A script that emits the given notification payloads in order.
    #[must_use]
    pub fn chunks<I, P>(chunks: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        Self {
            steps: chunks
                .into_iter()
                .map(|chunk| ReplyStep::Notify(chunk.into()))
                .collect(),
        }
    }

    /// A script that emits nothing.
    #[must_use]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Appends a link drop after the scripted notifications.
    #[must_use]
    pub fn then_drop(mut self) -> Self {
        self.steps.push(ReplyStep::DropLink);
        self
    }
}

/// Parsed reply fixture: `;`-separated scripts of `,`-separated steps, each
/// a hex payload, `silence`, or `drop`.
#[derive(Debug, Clone, derive_more::Into)]
pub struct ReplyFixture {
    scripts: Vec<ReplyScript>,
}

impl FromStr for ReplyFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let scripts = value
            .split(';')
            .map(parse_reply_script)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { scripts })
    }
}

/// One characteristic write observed by the fake backend.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WriteRecord {
    pub service: String,
    pub characteristic: String,
    pub payload: Vec<u8>,
    pub mode: WriteMode,
}

/// Fixture-driven fake backend behaviour.
#[derive(Debug, Clone, Builder)]
pub struct FakeBackendConfig {
    /// Identifier the fake peripheral answers to.
    #[builder(default = DeviceId::from(DEFAULT_DEVICE_ID))]
    device: DeviceId,
    /// GATT inventory reported by `retrieve_services`.
    #[builder(default = CannedInventory::VendorFfe0.inventory())]
    inventory: ServiceInventory,
    /// Initial adapter radio power state.
    #[builder(default = true)]
    adapter_on: bool,
    /// Scripted replies consumed one per characteristic write.
    #[builder(default)]
    replies: Vec<ReplyScript>,
}

impl Default for FakeBackendConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug)]
struct FakeState {
    device: DeviceId,
    inventory: ServiceInventory,
    adapter_on: bool,
    connected: bool,
    notifying: Option<(String, String)>,
    notifications_started: Vec<(String, String)>,
    replies: VecDeque<ReplyScript>,
    written: Vec<WriteRecord>,
    fail_start: Option<String>,
    fail_connect: Option<String>,
    fail_write: Option<String>,
    fail_start_notifications: usize,
}

/// Transport backend backed by scripted fixtures instead of a radio.
///
/// Cloning returns another handle to the same fake peripheral, so tests keep
/// one handle for scripting while the session owns the other.
#[derive(Debug, Clone)]
pub struct FakeBackend {
    inner: Arc<Mutex<FakeState>>,
    events: broadcast::Sender<TransportEvent>,
}

impl FakeBackend {
    /// Creates a fake backend from fixture configuration.
    #[must_use]
    pub fn new(config: FakeBackendConfig) -> Self {
        let FakeBackendConfig {
            device,
            inventory,
            adapter_on,
            replies,
        } = config;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Mutex::new(FakeState {
                device,
                inventory,
                adapter_on,
                connected: false,
                notifying: None,
                notifications_started: Vec::new(),
                replies: replies.into(),
                written: Vec::new(),
                fail_start: None,
                fail_connect: None,
                fail_write: None,
                fail_start_notifications: 0,
            })),
            events,
        }
    }

    /// Returns the identifier of the fake peripheral.
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.lock().device.clone()
    }

    /// Queues one scripted reply for the next unanswered write.
    pub fn push_reply(&self, script: ReplyScript) {
        self.lock().replies.push_back(script);
    }

    /// Returns all writes observed so far.
    #[must_use]
    pub fn written(&self) -> Vec<WriteRecord> {
        self.lock().written.clone()
    }

    /// Returns the `(service, characteristic)` pairs notifications were
    /// started on, in call order.
    #[must_use]
    pub fn notifications_started(&self) -> Vec<(String, String)> {
        self.lock().notifications_started.clone()
    }

    /// Makes the next `start()` call fail.
    pub fn fail_transport_start(&self, reason: impl Into<String>) {
        self.lock().fail_start = Some(reason.into());
    }

    /// Makes the next `connect()` call fail.
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.lock().fail_connect = Some(reason.into());
    }

    /// Makes the next write fail.
    pub fn fail_next_write(&self, reason: impl Into<String>) {
        self.lock().fail_write = Some(reason.into());
    }

    /// Makes the next `count` `start_notifications` calls fail.
    pub fn fail_start_notifications(&self, count: usize) {
        self.lock().fail_start_notifications = count;
    }

    /// Emits an adapter power event and updates the reported state.
    pub fn emit_adapter_state(&self, power: AdapterPower) {
        self.lock().adapter_on = power.is_on();
        let _ = self.events.send(TransportEvent::AdapterState(power));
    }

    /// Drops the link and emits a disconnect event.
    pub fn emit_disconnected(&self) {
        let device = {
            let mut state = self.lock();
            state.connected = false;
            state.device.clone()
        };
        let _ = self.events.send(TransportEvent::Disconnected { device });
    }

    /// Emits one notification payload on the subscribed characteristic.
    pub fn emit_notification(&self, payload: &[u8]) {
        let (device, service, characteristic) = {
            let state = self.lock();
            let (service, characteristic) = state
                .notifying
                .clone()
                .unwrap_or_else(|| (String::new(), String::new()));
            (state.device.clone(), service, characteristic)
        };
        let _ = self.events.send(TransportEvent::Notification {
            device,
            service,
            characteristic,
            payload: payload.to_vec(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn perform_write(
        &self,
        device: &DeviceId,
        service: &str,
        characteristic: &str,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportFault> {
        let events = {
            let mut state = self.lock();
            if let Some(reason) = state.fail_write.take() {
                return Err(TransportFault::Scripted { reason });
            }
            if !state.connected || *device != state.device {
                return Err(TransportFault::UnknownDevice {
                    device_id: device.to_string(),
                });
            }

            state.written.push(WriteRecord {
                service: service.to_string(),
                characteristic: characteristic.to_string(),
                payload: payload.to_vec(),
                mode,
            });

            let script = state.replies.pop_front().unwrap_or_default();
            let (notify_service, notify_characteristic) = state
                .notifying
                .clone()
                .unwrap_or_else(|| (service.to_string(), characteristic.to_string()));

            let mut events = Vec::with_capacity(script.steps.len());
            for step in script.steps {
                match step {
                    ReplyStep::Notify(payload) => events.push(TransportEvent::Notification {
                        device: state.device.clone(),
                        service: notify_service.clone(),
                        characteristic: notify_characteristic.clone(),
                        payload,
                    }),
                    ReplyStep::DropLink => {
                        state.connected = false;
                        events.push(TransportEvent::Disconnected {
                            device: state.device.clone(),
                        });
                    }
                }
            }
            events
        };

        for event in events {
            let _ = self.events.send(event);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BleTransport for FakeBackend {
    async fn start(&self) -> Result<(), TransportFault> {
        if let Some(reason) = self.lock().fail_start.take() {
            return Err(TransportFault::Scripted { reason });
        }
        Ok(())
    }

    async fn adapter_state(&self) -> Result<AdapterPower, TransportFault> {
        let on = self.lock().adapter_on;
        Ok(if on { AdapterPower::On } else { AdapterPower::Off })
    }

    #[instrument(skip(self), level = "debug", fields(%device))]
    async fn connect(&self, device: &DeviceId) -> Result<(), TransportFault> {
        let mut state = self.lock();
        if let Some(reason) = state.fail_connect.take() {
            return Err(TransportFault::Scripted { reason });
        }
        if *device != state.device {
            return Err(TransportFault::UnknownDevice {
                device_id: device.to_string(),
            });
        }
        state.connected = true;
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(%device))]
    async fn disconnect(&self, device: &DeviceId) -> Result<(), TransportFault> {
        let emitted = {
            let mut state = self.lock();
            let was_connected = state.connected && *device == state.device;
            state.connected = false;
            state.notifying = None;
            was_connected.then(|| state.device.clone())
        };
        if let Some(device) = emitted {
            let _ = self.events.send(TransportEvent::Disconnected { device });
        }
        Ok(())
    }

    async fn retrieve_services(
        &self,
        device: &DeviceId,
    ) -> Result<ServiceInventory, TransportFault> {
        let state = self.lock();
        if !state.connected || *device != state.device {
            return Err(TransportFault::UnknownDevice {
                device_id: device.to_string(),
            });
        }
        Ok(state.inventory.clone())
    }

    async fn start_notifications(
        &self,
        device: &DeviceId,
        service: &str,
        characteristic: &str,
    ) -> Result<(), TransportFault> {
        let mut state = self.lock();
        if !state.connected || *device != state.device {
            return Err(TransportFault::UnknownDevice {
                device_id: device.to_string(),
            });
        }
        if state.fail_start_notifications > 0 {
            state.fail_start_notifications -= 1;
            return Err(TransportFault::Scripted {
                reason: "start_notifications rejected by fixture".to_string(),
            });
        }
        let pair = (service.to_string(), characteristic.to_string());
        state.notifications_started.push(pair.clone());
        state.notifying = Some(pair);
        Ok(())
    }

    async fn stop_notifications(
        &self,
        _device: &DeviceId,
        service: &str,
        characteristic: &str,
    ) -> Result<(), TransportFault> {
        let mut state = self.lock();
        if state.notifying.as_ref()
            == Some(&(service.to_string(), characteristic.to_string()))
        {
            state.notifying = None;
        }
        Ok(())
    }

    async fn write(
        &self,
        device: &DeviceId,
        service: &str,
        characteristic: &str,
        payload: &[u8],
    ) -> Result<(), TransportFault> {
        self.perform_write(device, service, characteristic, payload, WriteMode::WithResponse)
    }

    async fn write_without_response(
        &self,
        device: &DeviceId,
        service: &str,
        characteristic: &str,
        payload: &[u8],
    ) -> Result<(), TransportFault> {
        self.perform_write(
            device,
            service,
            characteristic,
            payload,
            WriteMode::WithoutResponse,
        )
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

fn parse_service_fixture(value: &str) -> Result<ServiceInventory, FixtureError> {
    if value.trim().is_empty() {
        return Err(FixtureError::EmptyFixture);
    }

    let services = value
        .split(';')
        .map(parse_service_record)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ServiceInventory::new(services))
}

fn parse_service_record(record: &str) -> Result<ServiceInfo, FixtureError> {
    let (service_uuid, characteristics) = record
        .split_once(':')
        .ok_or(FixtureError::InvalidServiceRecord)?;
    if service_uuid.trim().is_empty() {
        return Err(FixtureError::EmptyRecordField);
    }

    let characteristics = characteristics
        .split(',')
        .map(parse_characteristic_record)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ServiceInfo::new(
        service_uuid.trim().to_string(),
        characteristics,
    ))
}

fn parse_characteristic_record(record: &str) -> Result<CharacteristicInfo, FixtureError> {
    let (uuid, properties) = record
        .split_once('=')
        .ok_or(FixtureError::InvalidServiceRecord)?;
    if uuid.trim().is_empty() || properties.trim().is_empty() {
        return Err(FixtureError::EmptyRecordField);
    }

    Ok(CharacteristicInfo::new(
        uuid.trim().to_string(),
        properties
            .split('+')
            .map(|property| property.trim().to_string())
            .collect(),
    ))
}

fn parse_reply_script(script: &str) -> Result<ReplyScript, FixtureError> {
    let mut steps = Vec::new();
    for token in script.split(',') {
        let token = token.trim();
        match token {
            "silence" => {}
            "drop" => steps.push(ReplyStep::DropLink),
            _ if token.is_empty() => return Err(FixtureError::InvalidReplyStep),
            _ => steps.push(ReplyStep::Notify(hex::decode(token)?)),
        }
    }
    Ok(ReplyScript { steps })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("spp_ffe1", catalog::SPP_SERVICE_UUID)]
    #[case("vendor_ffe0", catalog::FFE0_SERVICE_UUID)]
    #[case("transparent_uart", catalog::E781_SERVICE_UUID)]
    fn canned_inventories_parse_by_name(#[case] name: &str, #[case] expected_service: &str) {
        let fixture: ServiceFixture = name.parse().expect("canned name should parse");

        let inventory: ServiceInventory = fixture.into();
        assert_eq!(expected_service, inventory.services()[0].uuid());
    }

    #[test]
    fn service_fixture_parses_records() {
        let fixture: ServiceFixture = "ffe0:ffe1=write_without_response+notify"
            .parse()
            .expect("record fixture should parse");

        let inventory: ServiceInventory = fixture.into();
        let service = &inventory.services()[0];
        assert_eq!("ffe0", service.uuid());
        assert_eq!("ffe1", service.characteristics()[0].uuid());
        assert!(service.characteristics()[0].has_property("notify"));
    }

    #[rstest]
    #[case("ffe0")]
    #[case("ffe0:ffe1")]
    #[case(":ffe1=notify")]
    fn service_fixture_rejects_malformed_records(#[case] fixture: &str) {
        let parsed = fixture.parse::<ServiceFixture>();
        assert_matches!(
            parsed,
            Err(FixtureError::InvalidServiceRecord | FixtureError::EmptyRecordField)
        );
    }

    #[test]
    fn reply_fixture_parses_steps() {
        let fixture: ReplyFixture = "4f4b3e;silence;drop"
            .parse()
            .expect("reply fixture should parse");

        let scripts: Vec<ReplyScript> = fixture.into();
        assert_eq!(
            vec![
                ReplyScript::chunks([vec![0x4F, 0x4B, 0x3E]]),
                ReplyScript::silence(),
                ReplyScript::silence().then_drop(),
            ],
            scripts
        );
    }

    #[test]
    fn reply_fixture_rejects_non_hex_steps() {
        let parsed = "zzzz".parse::<ReplyFixture>();
        assert_matches!(parsed, Err(FixtureError::InvalidHexPayload(_)));
    }

    #[tokio::test]
    async fn writes_consume_scripts_in_order_and_emit_notifications() {
        let fake = FakeBackend::new(
            FakeBackendConfig::builder()
                .replies(vec![ReplyScript::chunks([vec![0x31, 0x3E]])])
                .build(),
        );
        let device = fake.device_id();
        let mut events = fake.subscribe_events();

        fake.connect(&device).await.expect("connect should succeed");
        fake.start_notifications(&device, "ffe0", "ffe1")
            .await
            .expect("subscription should succeed");
        fake.write_without_response(&device, "ffe0", "ffe1", b"ATZ\r")
            .await
            .expect("write should succeed");

        let event = events.try_recv().expect("a notification should be queued");
        assert_eq!(
            TransportEvent::Notification {
                device: device.clone(),
                service: "ffe0".to_string(),
                characteristic: "ffe1".to_string(),
                payload: vec![0x31, 0x3E],
            },
            event
        );
        assert_eq!(1, fake.written().len());
        assert_eq!(WriteMode::WithoutResponse, fake.written()[0].mode);
    }

    #[tokio::test]
    async fn drop_step_disconnects_and_emits_event() {
        let fake = FakeBackend::new(
            FakeBackendConfig::builder()
                .replies(vec![ReplyScript::chunks([vec![0x31]]).then_drop()])
                .build(),
        );
        let device = fake.device_id();
        let mut events = fake.subscribe_events();

        fake.connect(&device).await.expect("connect should succeed");
        fake.write(&device, "ffe0", "ffe1", b"ATRV\r")
            .await
            .expect("write should succeed");

        assert_matches!(
            events.try_recv(),
            Ok(TransportEvent::Notification { .. })
        );
        assert_matches!(
            events.try_recv(),
            Ok(TransportEvent::Disconnected { .. })
        );
        let failed = fake.write(&device, "ffe0", "ffe1", b"ATRV\r").await;
        assert_matches!(failed, Err(TransportFault::UnknownDevice { .. }));
    }

    #[tokio::test]
    async fn failure_injection_rejects_the_next_call_only() {
        let fake = FakeBackend::new(FakeBackendConfig::default());
        let device = fake.device_id();

        fake.fail_next_connect("adapter busy");
        let failed = fake.connect(&device).await;
        assert_matches!(failed, Err(TransportFault::Scripted { reason }) if reason == "adapter busy");

        fake.connect(&device).await.expect("second connect should succeed");
    }
}
