//! Boundary to the Bluetooth host stack
//!
//! The stack owns the radio, link keys, L2CAP signalling and the SDP wire format.
//! It pushes [`StackEvent`]s into the supervisor and accepts commands through
//! [`BluetoothStack`]. Every command answers synchronously with a status; the
//! outcome of anything asynchronous arrives later as an event.

use super::address::BdAddr;
use serde::{Deserialize, Serialize};

pub type ConnectionHandle = u16;
pub type ChannelId = u16;
pub type Psm = u16;

pub const STATUS_SUCCESS: u8 = 0x00;

/// Non-zero status returned by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[error("stack status 0x{0:02x}")]
pub struct StatusCode(pub u8);

impl StatusCode {
    /// Converts a raw status into a `Result`.
    pub fn check(status: u8) -> Result<(), StatusCode> {
        if status == STATUS_SUCCESS {
            Ok(())
        } else {
            Err(StatusCode(status))
        }
    }
}

/// Commands the supervisor issues to the stack.
pub trait BluetoothStack {
    fn register_service(&mut self, psm: Psm, mtu: u16) -> Result<(), StatusCode>;

    /// Starts an inquiry window of `duration` units of 1.28s.
    fn start_inquiry(&mut self, duration: u8) -> Result<(), StatusCode>;

    fn request_remote_name(
        &mut self,
        address: BdAddr,
        page_scan_repetition_mode: u8,
        clock_offset: u16,
    ) -> Result<(), StatusCode>;

    fn request_security_level(&mut self, handle: ConnectionHandle, level: u8) -> Result<(), StatusCode>;

    /// Starts an SDP service search attribute query. Attribute bytes arrive as
    /// [`StackEvent::SdpAttributeByte`], followed by [`StackEvent::SdpQueryComplete`].
    fn query_service(&mut self, address: BdAddr, service_class: u16) -> Result<(), StatusCode>;

    /// Requests an outgoing L2CAP channel and returns its local channel id.
    fn open_channel(&mut self, address: BdAddr, psm: Psm, mtu: u16) -> Result<ChannelId, StatusCode>;

    fn accept_channel(&mut self, cid: ChannelId) -> Result<(), StatusCode>;

    fn decline_channel(&mut self, cid: ChannelId) -> Result<(), StatusCode>;

    fn send_data(&mut self, cid: ChannelId, data: &[u8]) -> Result<(), StatusCode>;

    fn stored_link_keys(&mut self) -> Vec<BdAddr>;

    fn drop_link_key(&mut self, address: BdAddr);
}

impl<T: BluetoothStack + ?Sized> BluetoothStack for Box<T> {
    fn register_service(&mut self, psm: Psm, mtu: u16) -> Result<(), StatusCode> {
        (**self).register_service(psm, mtu)
    }

    fn start_inquiry(&mut self, duration: u8) -> Result<(), StatusCode> {
        (**self).start_inquiry(duration)
    }

    fn request_remote_name(
        &mut self,
        address: BdAddr,
        page_scan_repetition_mode: u8,
        clock_offset: u16,
    ) -> Result<(), StatusCode> {
        (**self).request_remote_name(address, page_scan_repetition_mode, clock_offset)
    }

    fn request_security_level(&mut self, handle: ConnectionHandle, level: u8) -> Result<(), StatusCode> {
        (**self).request_security_level(handle, level)
    }

    fn query_service(&mut self, address: BdAddr, service_class: u16) -> Result<(), StatusCode> {
        (**self).query_service(address, service_class)
    }

    fn open_channel(&mut self, address: BdAddr, psm: Psm, mtu: u16) -> Result<ChannelId, StatusCode> {
        (**self).open_channel(address, psm, mtu)
    }

    fn accept_channel(&mut self, cid: ChannelId) -> Result<(), StatusCode> {
        (**self).accept_channel(cid)
    }

    fn decline_channel(&mut self, cid: ChannelId) -> Result<(), StatusCode> {
        (**self).decline_channel(cid)
    }

    fn send_data(&mut self, cid: ChannelId, data: &[u8]) -> Result<(), StatusCode> {
        (**self).send_data(cid, data)
    }

    fn stored_link_keys(&mut self) -> Vec<BdAddr> {
        (**self).stored_link_keys()
    }

    fn drop_link_key(&mut self, address: BdAddr) {
        (**self).drop_link_key(address)
    }
}

/// Events delivered by the stack, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StackEvent {
    /// The stack finished powering up.
    StackReady,

    InquiryResult {
        address: BdAddr,
        #[serde(default)]
        page_scan_repetition_mode: u8,
        #[serde(default)]
        clock_offset: u16,
        class_of_device: u32,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        rssi: Option<i8>,
    },

    InquiryComplete,

    RemoteNameResult {
        address: BdAddr,
        status: u8,
        #[serde(default)]
        name: Option<String>,
    },

    /// Baseband connection request from a remote device.
    ConnectionRequest {
        address: BdAddr,
        class_of_device: u32,
    },

    ConnectionComplete {
        address: BdAddr,
        handle: ConnectionHandle,
        status: u8,
    },

    DisconnectionComplete {
        handle: ConnectionHandle,
        #[serde(default)]
        reason: u8,
    },

    /// One byte of an SDP attribute value.
    SdpAttributeByte {
        attribute_id: u16,
        offset: u16,
        attribute_length: u16,
        byte: u8,
    },

    /// A whole SDP attribute value; handled as the equivalent run of
    /// [`StackEvent::SdpAttributeByte`] events.
    SdpAttributeValue {
        attribute_id: u16,
        value: Vec<u8>,
    },

    SdpQueryComplete {
        status: u8,
    },

    /// Incoming L2CAP connection waiting for accept/decline.
    ChannelIncoming {
        address: BdAddr,
        psm: Psm,
        local_cid: ChannelId,
        handle: ConnectionHandle,
    },

    ChannelOpened {
        address: BdAddr,
        psm: Psm,
        local_cid: ChannelId,
        handle: ConnectionHandle,
        status: u8,
        #[serde(default)]
        incoming: bool,
    },

    ChannelClosed {
        local_cid: ChannelId,
    },

    ChannelData {
        local_cid: ChannelId,
        #[serde(default)]
        data: Vec<u8>,
    },
}

impl StackEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StackEvent::StackReady => "stack_ready",
            StackEvent::InquiryResult { .. } => "inquiry_result",
            StackEvent::InquiryComplete => "inquiry_complete",
            StackEvent::RemoteNameResult { .. } => "remote_name_result",
            StackEvent::ConnectionRequest { .. } => "connection_request",
            StackEvent::ConnectionComplete { .. } => "connection_complete",
            StackEvent::DisconnectionComplete { .. } => "disconnection_complete",
            StackEvent::SdpAttributeByte { .. } => "sdp_attribute_byte",
            StackEvent::SdpAttributeValue { .. } => "sdp_attribute_value",
            StackEvent::SdpQueryComplete { .. } => "sdp_query_complete",
            StackEvent::ChannelIncoming { .. } => "channel_incoming",
            StackEvent::ChannelOpened { .. } => "channel_opened",
            StackEvent::ChannelClosed { .. } => "channel_closed",
            StackEvent::ChannelData { .. } => "channel_data",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_check() {
        assert_eq!(StatusCode::check(0), Ok(()));
        assert_eq!(StatusCode::check(0x6A), Err(StatusCode(0x6A)));
        assert_eq!(StatusCode(0x6A).to_string(), "stack status 0x6a");
    }

    #[test]
    fn events_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Trace {
            events: Vec<StackEvent>,
        }

        let trace: Trace = toml::from_str(
            r#"
            [[events]]
            kind = "stack_ready"

            [[events]]
            kind = "inquiry_result"
            address = "AA:BB:CC:DD:EE:FF"
            class_of_device = 0x002508
            name = "Pad"

            [[events]]
            kind = "channel_data"
            local_cid = 0x41
            data = [0xA1, 0x01]
            "#,
        )
        .unwrap();

        assert_eq!(trace.events.len(), 3);
        assert_eq!(trace.events[0], StackEvent::StackReady);
        assert_eq!(
            trace.events[1],
            StackEvent::InquiryResult {
                address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
                page_scan_repetition_mode: 0,
                clock_offset: 0,
                class_of_device: 0x002508,
                name: Some("Pad".to_string()),
                rssi: None,
            }
        );
        assert_eq!(trace.events[2].kind(), "channel_data");
    }
}
