pub mod application;
pub mod config;
pub mod credentials;
pub mod device;
pub mod discovery;
#[cfg(feature = "esp32")]
pub mod esp;
pub mod experiment;
pub mod failsafe;
pub mod identity;
pub mod ota;
pub mod partition;
pub mod provisioning;
pub mod sampling;
pub mod sensor;
pub mod sim;
pub mod topics;
pub mod types;
pub mod upload;
pub mod wifi;

pub use application::{AppInput, AppOutput, ThermometerApp};
pub use config::{DeviceConfig, ExperimentConfig, FailsafeConfig, NetworkConfig};
pub use credentials::{KeyValueStore, MacAddress, StoreError, WifiCredentialStore, WifiCredentials};
pub use device::{DeviceCommand, DeviceContext, DeviceReply};
pub use discovery::{BrokerAssignment, BrokerStore, DiscoveryResponder};
pub use experiment::{Command, ExperimentEngine, ExperimentEvent};
pub use failsafe::{Failsafe, FailsafeAction, TagPolicy};
pub use identity::{Delay, IdentityGate, IdentityResult, IdentityTag, TagStore};
pub use ota::{OtaError, OtaSession, OtaState, PushReply};
pub use partition::{FlashPartitions, PartitionDescriptor, PartitionManager, SlotId};
pub use sensor::{Sensor, SensorKind, SensorSettings, Temperature};
pub use topics::*;
pub use wifi::{ConnectStrategy, IpAssignment, WifiLink};
