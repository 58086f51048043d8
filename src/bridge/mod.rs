//! Tokio runtime around the supervisor.

pub mod bridge_handle;
pub mod event_pump;
pub mod replay;

pub use bridge_handle::BridgeHandle;
pub use event_pump::{BridgeInput, PumpError};
