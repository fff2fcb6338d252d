pub mod config;
pub mod device;
pub mod layout;
pub mod ota;
pub mod store;
pub mod url;
pub mod wifi;

pub use config::{ConfigUpdate, ConfigView, Credential, CredentialUpdate, DeviceConfig};
pub use device::{Device, DeviceAction, DeviceSettings, DeviceStatus, Indicator, UpdateError, UpdateOutcome};
pub use ota::{FirmwareSlots, MemorySlots, OtaError, OtaState, OtaStatus, SlotError, UpdateDescriptor};
pub use store::{BlockStorage, ConfigStore, MemoryStorage, StorageError};
pub use url::{ClientUrl, ParseError, UrlRecord};
pub use wifi::{ConnectionError, SimulatedRadio, WifiRadio, WifiSettings, WifiState, WifiStatus};
