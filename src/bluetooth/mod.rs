//! Bluetooth side of the bridge: device bookkeeping, channel setup and SDP
//! lookups, all driven by [`ConnectionSupervisor::handle_event`].

pub mod address;
pub mod channels;
pub mod device;
pub mod error;
pub mod registry;
pub mod sdp;
pub mod stack;
pub mod supervisor;

pub use address::BdAddr;
pub use device::{ChannelState, Device, LifecycleState};
pub use error::BridgeError;
pub use registry::{DeviceId, DeviceRegistry};
pub use stack::{BluetoothStack, StackEvent, StatusCode};
pub use supervisor::{ConnectionSupervisor, DeviceSnapshot, SupervisorStats};
