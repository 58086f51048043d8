//! Recorded stand-in for the Bluetooth stack.
//!
//! [`ReplayStack`] answers every command with success, hands out channel ids
//! from 0x40 upwards and keeps a log of what it was asked to do. A
//! [`ReplayTrace`] is the other half: stack events read from TOML.
//!
//! ```toml
//! link_keys = ["AA:BB:CC:DD:EE:FF"]
//!
//! [[events]]
//! kind = "stack_ready"
//!
//! [[events]]
//! kind = "inquiry_result"
//! address = "AA:BB:CC:DD:EE:FF"
//! class_of_device = 0x002508
//! name = "Wireless Controller"
//! ```

use crate::bluetooth::stack::{ChannelId, ConnectionHandle, Psm};
use crate::bluetooth::{BdAddr, BluetoothStack, DeviceSnapshot, StackEvent, StatusCode};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

const FIRST_CHANNEL_ID: ChannelId = 0x40;
/// Status used when queries or inquiries are refused.
const STATUS_BUSY: u8 = 0x0C;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackCommand {
    RegisterService {
        psm: Psm,
        mtu: u16,
    },
    StartInquiry {
        duration: u8,
    },
    RequestRemoteName {
        address: BdAddr,
        page_scan_repetition_mode: u8,
        clock_offset: u16,
    },
    RequestSecurityLevel {
        handle: ConnectionHandle,
        level: u8,
    },
    QueryService {
        address: BdAddr,
        service_class: u16,
    },
    OpenChannel {
        address: BdAddr,
        psm: Psm,
        mtu: u16,
    },
    AcceptChannel {
        cid: ChannelId,
    },
    DeclineChannel {
        cid: ChannelId,
    },
    SendData {
        cid: ChannelId,
        data: Vec<u8>,
    },
    DropLinkKey {
        address: BdAddr,
    },
}

#[derive(Debug, Clone)]
pub struct ReplayStack {
    link_keys: Vec<BdAddr>,
    commands: Vec<StackCommand>,
    next_cid: ChannelId,
    refuse_queries: bool,
    refuse_inquiry: bool,
}

impl Default for ReplayStack {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ReplayStack {
    pub fn new(link_keys: Vec<BdAddr>) -> Self {
        Self {
            link_keys,
            commands: Vec::new(),
            next_cid: FIRST_CHANNEL_ID,
            refuse_queries: false,
            refuse_inquiry: false,
        }
    }

    /// Makes `query_service` fail, as a stack with a busy SDP client would.
    pub fn refuse_queries(&mut self, refuse: bool) {
        self.refuse_queries = refuse;
    }

    /// Makes `start_inquiry` fail, as a controller that is still paging would.
    pub fn refuse_inquiry(&mut self, refuse: bool) {
        self.refuse_inquiry = refuse;
    }

    pub fn commands(&self) -> &[StackCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<StackCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn link_keys(&self) -> &[BdAddr] {
        &self.link_keys
    }

    fn record(&mut self, command: StackCommand) {
        info!("stack <- {:?}", command);
        self.commands.push(command);
    }
}

impl BluetoothStack for ReplayStack {
    fn register_service(&mut self, psm: Psm, mtu: u16) -> Result<(), StatusCode> {
        self.record(StackCommand::RegisterService { psm, mtu });
        Ok(())
    }

    fn start_inquiry(&mut self, duration: u8) -> Result<(), StatusCode> {
        if self.refuse_inquiry {
            debug!("Refusing inquiry");
            return Err(StatusCode(STATUS_BUSY));
        }
        self.record(StackCommand::StartInquiry { duration });
        Ok(())
    }

    fn request_remote_name(
        &mut self,
        address: BdAddr,
        page_scan_repetition_mode: u8,
        clock_offset: u16,
    ) -> Result<(), StatusCode> {
        self.record(StackCommand::RequestRemoteName {
            address,
            page_scan_repetition_mode,
            clock_offset,
        });
        Ok(())
    }

    fn request_security_level(&mut self, handle: ConnectionHandle, level: u8) -> Result<(), StatusCode> {
        self.record(StackCommand::RequestSecurityLevel { handle, level });
        Ok(())
    }

    fn query_service(&mut self, address: BdAddr, service_class: u16) -> Result<(), StatusCode> {
        if self.refuse_queries {
            debug!("Refusing SDP query for {}", address);
            return Err(StatusCode(STATUS_BUSY));
        }
        self.record(StackCommand::QueryService {
            address,
            service_class,
        });
        Ok(())
    }

    fn open_channel(&mut self, address: BdAddr, psm: Psm, mtu: u16) -> Result<ChannelId, StatusCode> {
        self.record(StackCommand::OpenChannel { address, psm, mtu });
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1).max(FIRST_CHANNEL_ID);
        Ok(cid)
    }

    fn accept_channel(&mut self, cid: ChannelId) -> Result<(), StatusCode> {
        self.record(StackCommand::AcceptChannel { cid });
        Ok(())
    }

    fn decline_channel(&mut self, cid: ChannelId) -> Result<(), StatusCode> {
        self.record(StackCommand::DeclineChannel { cid });
        Ok(())
    }

    fn send_data(&mut self, cid: ChannelId, data: &[u8]) -> Result<(), StatusCode> {
        self.record(StackCommand::SendData {
            cid,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn stored_link_keys(&mut self) -> Vec<BdAddr> {
        self.link_keys.clone()
    }

    fn drop_link_key(&mut self, address: BdAddr) {
        self.link_keys.retain(|a| *a != address);
        self.record(StackCommand::DropLinkKey { address });
    }
}

/// Stored link keys plus the events to feed, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReplayTrace {
    pub link_keys: Vec<BdAddr>,
    pub events: Vec<StackEvent>,
}

impl ReplayTrace {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse trace: {}", e))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read trace file {}: {}", path.display(), e))?;
        let trace = Self::from_toml(&content)?;
        info!(
            "Loaded trace {} with {} events and {} link keys",
            path.display(),
            trace.events.len(),
            trace.link_keys.len()
        );
        Ok(trace)
    }

    pub fn stack(&self) -> ReplayStack {
        ReplayStack::new(self.link_keys.clone())
    }
}

/// Device table left behind by a replay, written out as TOML.
#[derive(Debug, Serialize)]
pub struct ReplayReport<'a> {
    pub devices: &'a [DeviceSnapshot],
}

impl<'a> ReplayReport<'a> {
    pub fn new(devices: &'a [DeviceSnapshot]) -> Self {
        Self { devices }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize device report: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::LifecycleState;
    use crate::gamepad::GamepadState;
    use crate::hid::ControllerFamily;

    #[test]
    fn channel_ids_count_up_from_0x40() {
        let mut stack = ReplayStack::default();
        let address = BdAddr::new([1, 2, 3, 4, 5, 6]);
        assert_eq!(stack.open_channel(address, 0x11, 48), Ok(0x40));
        assert_eq!(stack.open_channel(address, 0x13, 48), Ok(0x41));
        assert_eq!(stack.commands().len(), 2);
    }

    #[test]
    fn dropped_keys_are_forgotten() {
        let a = BdAddr::new([1, 2, 3, 4, 5, 6]);
        let b = BdAddr::new([1, 2, 3, 4, 5, 7]);
        let mut stack = ReplayStack::new(vec![a, b]);
        stack.drop_link_key(a);
        assert_eq!(stack.stored_link_keys(), vec![b]);
        assert_eq!(stack.take_commands(), vec![StackCommand::DropLinkKey { address: a }]);
        assert!(stack.commands().is_empty());
    }

    #[test]
    fn trace_from_toml() {
        let trace = ReplayTrace::from_toml(
            r#"
            link_keys = ["AA:BB:CC:DD:EE:FF"]

            [[events]]
            kind = "stack_ready"

            [[events]]
            kind = "inquiry_result"
            address = "AA:BB:CC:DD:EE:FF"
            class_of_device = 0x002508
            name = "Wireless Controller"

            [[events]]
            kind = "channel_data"
            local_cid = 0x41
            data = [0xA1, 0x01, 0x80]
            "#,
        )
        .unwrap();

        let address: BdAddr = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(trace.link_keys, vec![address]);
        assert_eq!(trace.events.len(), 3);
        assert_eq!(trace.events[0], StackEvent::StackReady);
        assert_eq!(
            trace.events[2],
            StackEvent::ChannelData {
                local_cid: 0x41,
                data: vec![0xA1, 0x01, 0x80]
            }
        );
        assert_eq!(trace.stack().link_keys(), &[address]);
    }

    #[test]
    fn broken_trace_is_an_error() {
        assert!(ReplayTrace::from_toml("[[events]]\nkind = \"warp_drive\"").is_err());
    }

    #[test]
    fn report_lists_devices_as_toml() {
        let devices = vec![
            DeviceSnapshot {
                address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
                name: Some("Pad".to_string()),
                state: LifecycleState::Connected,
                family: Some(ControllerFamily::Ps4),
                class_of_device: 0x002508,
                vendor_id: 0x054C,
                product_id: 0x05C4,
                incoming: false,
                gamepad: GamepadState::default(),
            },
            DeviceSnapshot {
                address: "AA:BB:CC:DD:EE:01".parse().unwrap(),
                name: None,
                state: LifecycleState::RemoteNameRequest,
                family: None,
                class_of_device: 0x002540,
                vendor_id: 0,
                product_id: 0,
                incoming: true,
                gamepad: GamepadState::default(),
            },
        ];

        let report = ReplayReport::new(&devices).to_toml().unwrap();

        assert_eq!(report.matches("[[devices]]").count(), 2);
        assert!(report.contains(r#"address = "AA:BB:CC:DD:EE:FF""#));
        assert!(report.contains(r#"state = "connected""#));
        assert!(report.contains(r#"family = "ps4""#));
        assert!(report.contains(r#"state = "remote_name_request""#));
        assert!(report.contains("vendor_id = 1356"));
        assert_eq!(report.matches("name = ").count(), 1);
    }
}
