use async_trait::async_trait;
use serde_with::SerializeDisplay;
use tokio::sync::broadcast;

use crate::error::TransportFault;

/// Opaque peripheral identifier assigned by the transport backend.
#[derive(Debug, Clone, Eq, PartialEq, Hash, derive_more::Display, derive_more::From, derive_more::Into, SerializeDisplay)]
pub struct DeviceId(String);

impl DeviceId {
    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Bluetooth adapter radio power state.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display, SerializeDisplay)]
pub enum AdapterPower {
    #[display("on")]
    On,
    #[display("off")]
    Off,
}

impl AdapterPower {
    /// Returns whether the radio is powered on.
    #[must_use]
    pub fn is_on(self) -> bool {
        matches!(self, Self::On)
    }
}

/// Write mode used for characteristic writes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display, SerializeDisplay)]
pub enum WriteMode {
    /// Use ATT write-with-response.
    #[display("with_response")]
    WithResponse,
    /// Use ATT write-without-response.
    #[display("without_response")]
    WithoutResponse,
}

/// Events emitted by transport backends.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportEvent {
    /// The adapter radio power state changed.
    AdapterState(AdapterPower),
    /// A peripheral dropped its link.
    Disconnected { device: DeviceId },
    /// A subscribed characteristic delivered a notification payload.
    Notification {
        device: DeviceId,
        service: String,
        characteristic: String,
        payload: Vec<u8>,
    },
}

/// A characteristic description discovered on a connected peripheral.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CharacteristicInfo {
    uuid: String,
    properties: Vec<String>,
}

impl CharacteristicInfo {
    /// Creates a characteristic description.
    #[must_use]
    pub fn new(uuid: String, properties: Vec<String>) -> Self {
        Self { uuid, properties }
    }

    /// Returns the characteristic UUID.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Returns property labels for this characteristic.
    #[must_use]
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    /// Returns whether a property label is advertised, compared case-insensitively.
    #[must_use]
    pub fn has_property(&self, property: &str) -> bool {
        self.properties
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(property))
    }
}

/// A GATT service with discovered characteristics.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServiceInfo {
    uuid: String,
    characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    /// Creates a service description.
    #[must_use]
    pub fn new(uuid: String, characteristics: Vec<CharacteristicInfo>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    /// Returns the service UUID.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Returns all characteristics in this service.
    #[must_use]
    pub fn characteristics(&self) -> &[CharacteristicInfo] {
        &self.characteristics
    }
}

/// The full service/characteristic map retrieved from a connected peripheral.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ServiceInventory {
    services: Vec<ServiceInfo>,
}

impl ServiceInventory {
    /// Creates a service inventory.
    #[must_use]
    pub fn new(services: Vec<ServiceInfo>) -> Self {
        Self { services }
    }

    /// Returns all discovered services.
    #[must_use]
    pub fn services(&self) -> &[ServiceInfo] {
        &self.services
    }
}

/// Low-level transport port to BLE operations and their event stream.
///
/// Backends are assumed serialized per device; the session core never issues
/// concurrent writes for the same peripheral.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Initialises the transport.
    async fn start(&self) -> Result<(), TransportFault>;

    /// Returns the current adapter radio power state.
    async fn adapter_state(&self) -> Result<AdapterPower, TransportFault>;

    /// Connects to a peripheral.
    async fn connect(&self, device: &DeviceId) -> Result<(), TransportFault>;

    /// Disconnects from a peripheral.
    async fn disconnect(&self, device: &DeviceId) -> Result<(), TransportFault>;

    /// Retrieves the full service/characteristic map of a connected peripheral.
    async fn retrieve_services(&self, device: &DeviceId)
    -> Result<ServiceInventory, TransportFault>;

    /// Subscribes to notifications on one characteristic.
    async fn start_notifications(
        &self,
        device: &DeviceId,
        service: &str,
        characteristic: &str,
    ) -> Result<(), TransportFault>;

    /// Unsubscribes notifications on one characteristic.
    async fn stop_notifications(
        &self,
        device: &DeviceId,
        service: &str,
        characteristic: &str,
    ) -> Result<(), TransportFault>;

    /// Writes a payload using ATT write-with-response.
    async fn write(
        &self,
        device: &DeviceId,
        service: &str,
        characteristic: &str,
        payload: &[u8],
    ) -> Result<(), TransportFault>;

    /// Writes a payload using ATT write-without-response.
    async fn write_without_response(
        &self,
        device: &DeviceId,
        service: &str,
        characteristic: &str,
        payload: &[u8],
    ) -> Result<(), TransportFault>;

    /// Returns a fresh receiver for the transport event stream.
    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;
}
