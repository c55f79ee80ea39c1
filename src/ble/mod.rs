mod btleplug_backend;
mod fake_backend;
mod transport;

pub use self::btleplug_backend::BtleplugBackend;
pub use self::fake_backend::{
    CannedInventory, FakeBackend, FakeBackendConfig, ReplyFixture, ReplyScript, ReplyStep,
    ServiceFixture, WriteRecord,
};
pub use self::transport::{
    AdapterPower, BleTransport, CharacteristicInfo, DeviceId, ServiceInfo, ServiceInventory,
    TransportEvent, WriteMode,
};
