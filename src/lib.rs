//! Host side of a Bluetooth HID gamepad bridge: discovers controllers, brings up
//! their HID channels, identifies the model over SDP and decodes input reports
//! into a common gamepad state.

pub mod bluetooth;
pub mod bridge;
pub mod config;
pub mod gamepad;
pub mod hid;
pub mod platform;
