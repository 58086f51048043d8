//! Per-controller record and its lifecycle.

use super::address::BdAddr;
use super::error::BridgeError;
use super::stack::{ChannelId, ConnectionHandle};
use crate::gamepad::GamepadState;
use crate::hid::{ControllerFamily, ReportDescriptor};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

const COD_MAJOR_PERIPHERAL: u32 = 0x05;
const COD_MINOR_KEYBOARD: u32 = 0x10;
const COD_MINOR_JOYSTICK: u32 = 0x01;
const COD_MINOR_GAMEPAD: u32 = 0x02;

/// Whether a class of device looks like something we can drive: a peripheral
/// that is a joystick, a gamepad or a keyboard (iCade).
pub fn is_cod_supported(class_of_device: u32) -> bool {
    let major = (class_of_device >> 8) & 0x1F;
    let minor = (class_of_device >> 2) & 0x3F;
    if major != COD_MAJOR_PERIPHERAL {
        return false;
    }
    let device_type = minor & 0x0F;
    minor & COD_MINOR_KEYBOARD != 0
        || device_type == COD_MINOR_JOYSTICK
        || device_type == COD_MINOR_GAMEPAD
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Discovered,
    RemoteNameRequest,
    RemoteNameInquired,
    Connecting,
    Connected,
    Orphan,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Discovered, RemoteNameRequest | Connecting)
                | (RemoteNameRequest, RemoteNameInquired | Discovered | Connecting)
                | (RemoteNameInquired, Discovered | Connecting)
                | (Connecting, Connected | Orphan)
                | (Connected, Connecting | Orphan)
                | (Orphan, Discovered | Connecting)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Discovered => "DISCOVERED",
            LifecycleState::RemoteNameRequest => "REMOTE_NAME_REQUEST",
            LifecycleState::RemoteNameInquired => "REMOTE_NAME_INQUIRED",
            LifecycleState::Connecting => "CONNECTING",
            LifecycleState::Connected => "CONNECTED",
            LifecycleState::Orphan => "ORPHAN",
        };
        f.write_str(name)
    }
}

/// State of one L2CAP channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Closed,
    /// Requested (outgoing) or accepted (incoming), not yet reported open.
    Pending(ChannelId),
    Open(ChannelId),
}

impl ChannelState {
    /// Channel id, 0 when closed.
    pub fn cid(&self) -> ChannelId {
        match self {
            ChannelState::Closed => 0,
            ChannelState::Pending(cid) | ChannelState::Open(cid) => *cid,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelState::Closed)
    }
}

#[derive(Debug, Clone)]
pub struct Device {
    address: BdAddr,
    // Registration order, drives the remote name queue
    sequence: u64,
    name: Option<String>,
    class_of_device: u32,
    state: LifecycleState,
    incoming: bool,
    connection_handle: Option<ConnectionHandle>,
    control: ChannelState,
    interrupt: ChannelState,
    hid_descriptor: Vec<u8>,
    report_descriptor: Option<ReportDescriptor>,
    vendor_id: u16,
    product_id: u16,
    family: Option<ControllerFamily>,
    gamepad: GamepadState,
    page_scan_repetition_mode: u8,
    clock_offset: u16,
}

impl Device {
    pub(super) fn new(address: BdAddr, sequence: u64) -> Self {
        Self {
            address,
            sequence,
            name: None,
            class_of_device: 0,
            state: LifecycleState::Discovered,
            incoming: false,
            connection_handle: None,
            control: ChannelState::Closed,
            interrupt: ChannelState::Closed,
            hid_descriptor: Vec::new(),
            report_descriptor: None,
            vendor_id: 0,
            product_id: 0,
            family: None,
            gamepad: GamepadState::default(),
            page_scan_repetition_mode: 0,
            clock_offset: 0,
        }
    }

    pub fn address(&self) -> BdAddr {
        self.address
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_orphan(&self) -> bool {
        self.state == LifecycleState::Orphan
    }

    /// Moves to `next` if the lifecycle allows it.
    pub fn transition(&mut self, next: LifecycleState) -> Result<(), BridgeError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            warn!(
                "Rejected transition for {}: {} -> {}",
                self.address, self.state, next
            );
            return Err(BridgeError::InvalidTransition {
                address: self.address,
                from: self.state,
                to: next,
            });
        }
        debug!("{}: {} -> {}", self.address, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Rediscovery of an orphaned entry. Connection data from the old session is
    /// dropped; descriptor, ids and family are kept.
    pub(super) fn revive(&mut self, sequence: u64) {
        self.sequence = sequence;
        self.incoming = false;
        self.connection_handle = None;
        self.control = ChannelState::Closed;
        self.interrupt = ChannelState::Closed;
        self.gamepad = GamepadState::default();
        self.state = LifecycleState::Discovered;
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn has_name(&self) -> bool {
        self.name.is_some()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        info!("{} is named '{}'", self.address, name);
        self.name = Some(name);
    }

    pub fn class_of_device(&self) -> u32 {
        self.class_of_device
    }

    pub fn set_class_of_device(&mut self, class_of_device: u32) {
        self.class_of_device = class_of_device;
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn set_incoming(&mut self, incoming: bool) {
        self.incoming = incoming;
    }

    pub fn set_scan_parameters(&mut self, page_scan_repetition_mode: u8, clock_offset: u16) {
        self.page_scan_repetition_mode = page_scan_repetition_mode;
        self.clock_offset = clock_offset;
    }

    pub fn page_scan_repetition_mode(&self) -> u8 {
        self.page_scan_repetition_mode
    }

    pub fn clock_offset(&self) -> u16 {
        self.clock_offset
    }

    pub fn connection_handle(&self) -> Option<ConnectionHandle> {
        self.connection_handle
    }

    pub(super) fn set_connection_handle(&mut self, handle: Option<ConnectionHandle>) {
        self.connection_handle = handle;
    }

    pub fn control_channel(&self) -> ChannelState {
        self.control
    }

    pub fn interrupt_channel(&self) -> ChannelState {
        self.interrupt
    }

    pub fn control_cid(&self) -> ChannelId {
        self.control.cid()
    }

    pub fn interrupt_cid(&self) -> ChannelId {
        self.interrupt.cid()
    }

    pub(super) fn set_control_channel(&mut self, channel: ChannelState) {
        self.control = channel;
    }

    pub(super) fn set_interrupt_channel(&mut self, channel: ChannelState) {
        self.interrupt = channel;
    }

    pub fn has_hid_descriptor(&self) -> bool {
        !self.hid_descriptor.is_empty()
    }

    pub fn report_descriptor(&self) -> Option<&ReportDescriptor> {
        self.report_descriptor.as_ref()
    }

    /// Stores the raw descriptor and caches its parsed layout. A descriptor that
    /// fails to parse is still stored so it is not fetched again.
    pub fn set_hid_descriptor(&mut self, bytes: Vec<u8>) {
        match ReportDescriptor::parse(&bytes) {
            Ok(parsed) => self.report_descriptor = Some(parsed),
            Err(e) => {
                warn!("{}: unusable HID descriptor ({} bytes): {}", self.address, bytes.len(), e);
                self.report_descriptor = None;
            }
        }
        self.hid_descriptor = bytes;
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    pub fn set_ids(&mut self, vendor_id: u16, product_id: u16) {
        self.vendor_id = vendor_id;
        self.product_id = product_id;
    }

    pub fn family(&self) -> Option<ControllerFamily> {
        self.family
    }

    pub fn set_family(&mut self, family: Option<ControllerFamily>) {
        self.family = family;
    }

    pub fn gamepad(&self) -> &GamepadState {
        &self.gamepad
    }

    /// Everything the report dispatcher needs, borrowed at once.
    pub fn report_context(
        &mut self,
    ) -> (Option<&ReportDescriptor>, Option<ControllerFamily>, &mut GamepadState) {
        (self.report_descriptor.as_ref(), self.family, &mut self.gamepad)
    }
}
