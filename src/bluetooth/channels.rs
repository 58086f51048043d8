//! HID control/interrupt channel pair
//!
//! Outgoing connections open control first and chain the interrupt channel
//! when control reports open. Incoming connections are accepted per PSM. Removal
//! of a device is left to the caller (it also has to clean up the SDP token), so
//! the multiplexer only reports it through [`ChannelOutcome::Remove`].

use super::address::BdAddr;
use super::device::{ChannelState, LifecycleState};
use super::error::BridgeError;
use super::registry::{DeviceId, DeviceRegistry};
use super::stack::{BluetoothStack, ChannelId, ConnectionHandle, Psm, StatusCode};
use tracing::{debug, error, info, warn};

pub const PSM_HID_CONTROL: Psm = 0x0011;
pub const PSM_HID_INTERRUPT: Psm = 0x0013;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Control,
    Interrupt,
}

impl ChannelKind {
    pub fn from_psm(psm: Psm) -> Option<Self> {
        match psm {
            PSM_HID_CONTROL => Some(ChannelKind::Control),
            PSM_HID_INTERRUPT => Some(ChannelKind::Interrupt),
            _ => None,
        }
    }

    pub fn psm(self) -> Psm {
        match self {
            ChannelKind::Control => PSM_HID_CONTROL,
            ChannelKind::Interrupt => PSM_HID_INTERRUPT,
        }
    }
}

/// What the supervisor has to do after a channel event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOutcome {
    Ignored,
    Accepted(DeviceId),
    Declined,
    Opened { device: DeviceId, kind: ChannelKind },
    Closed(DeviceId),
    /// The device has to go; the caller removes it.
    Remove(DeviceId),
}

#[derive(Debug, Clone)]
pub struct ChannelMultiplexer {
    channel_mtu: u16,
    stale_link_key_statuses: Vec<u8>,
}

impl ChannelMultiplexer {
    pub fn new(channel_mtu: u16, stale_link_key_statuses: Vec<u8>) -> Self {
        Self {
            channel_mtu,
            stale_link_key_statuses,
        }
    }

    pub fn is_stale_link_key(&self, status: u8) -> bool {
        self.stale_link_key_statuses.contains(&status)
    }

    /// Registers both HID services so remote devices can reconnect to us.
    pub fn register_services<S: BluetoothStack + ?Sized>(
        &self,
        stack: &mut S,
        service_mtu: u16,
    ) -> Result<(), StatusCode> {
        stack.register_service(PSM_HID_INTERRUPT, service_mtu)?;
        stack.register_service(PSM_HID_CONTROL, service_mtu)?;
        Ok(())
    }

    /// Requests the control channel of `id`.
    pub fn open_control<S: BluetoothStack + ?Sized>(
        &self,
        registry: &mut DeviceRegistry,
        stack: &mut S,
        id: DeviceId,
    ) -> Result<ChannelId, BridgeError> {
        self.open(registry, stack, id, ChannelKind::Control)
    }

    fn open<S: BluetoothStack + ?Sized>(
        &self,
        registry: &mut DeviceRegistry,
        stack: &mut S,
        id: DeviceId,
        kind: ChannelKind,
    ) -> Result<ChannelId, BridgeError> {
        let address = registry
            .get(id)
            .map(|d| d.address())
            .ok_or(BridgeError::VacantSlot(id))?;
        let cid = stack
            .open_channel(address, kind.psm(), self.channel_mtu)
            .inspect_err(|status| error!("Connecting to HID {:?} of {} failed: {}", kind, address, status))?;
        debug!("Requested HID {:?} channel 0x{:04x} for {}", kind, cid, address);
        set_channel(registry, id, kind, ChannelState::Pending(cid));
        Ok(cid)
    }

    /// Remote side asks to open a channel.
    pub fn on_incoming<S: BluetoothStack + ?Sized>(
        &self,
        registry: &mut DeviceRegistry,
        stack: &mut S,
        address: BdAddr,
        psm: Psm,
        local_cid: ChannelId,
        handle: ConnectionHandle,
    ) -> ChannelOutcome {
        info!("Incoming L2CAP connection from {} psm 0x{:04x} cid 0x{:04x}", address, psm, local_cid);

        let id = match ChannelKind::from_psm(psm) {
            Some(ChannelKind::Control) => match registry.find_or_create(address) {
                Ok(id) => id,
                Err(e) => {
                    warn!("Declining HID Control from {}: {}", address, e);
                    return decline(stack, local_cid);
                }
            },
            Some(ChannelKind::Interrupt) => match registry.id_for_address(address) {
                Some(id) => id,
                None => {
                    warn!("Declining HID Interrupt from unknown device {}", address);
                    return decline(stack, local_cid);
                }
            },
            None => {
                warn!("Declining unknown psm 0x{:04x} from {}", psm, address);
                return decline(stack, local_cid);
            }
        };

        if let Err(status) = stack.accept_channel(local_cid) {
            warn!("Accepting channel 0x{:04x} of {} failed: {}", local_cid, address, status);
            return ChannelOutcome::Ignored;
        }

        if psm == PSM_HID_CONTROL {
            registry.set_connection_handle(id, handle);
            registry.set_control_channel(id, ChannelState::Pending(local_cid));
            if let Some(device) = registry.get_mut(id) {
                device.set_incoming(true);
            }
        } else {
            registry.set_interrupt_channel(id, ChannelState::Pending(local_cid));
        }
        ChannelOutcome::Accepted(id)
    }

    /// A channel finished opening, successfully or not.
    #[allow(clippy::too_many_arguments)]
    pub fn on_opened<S: BluetoothStack + ?Sized>(
        &self,
        registry: &mut DeviceRegistry,
        stack: &mut S,
        address: BdAddr,
        psm: Psm,
        local_cid: ChannelId,
        handle: ConnectionHandle,
        status: u8,
        incoming: bool,
    ) -> ChannelOutcome {
        if let Err(status) = StatusCode::check(status) {
            return self.on_open_failed(registry, stack, address, psm, local_cid, status);
        }

        let Some(id) = registry.id_for_address(address) else {
            warn!("Channel 0x{:04x} opened for unknown device {}", local_cid, address);
            return match registry.id_for_cid(local_cid) {
                Some(id) => ChannelOutcome::Remove(id),
                None => ChannelOutcome::Ignored,
            };
        };
        let Some(kind) = ChannelKind::from_psm(psm) else {
            debug!("Ignoring channel open on psm 0x{:04x}", psm);
            return ChannelOutcome::Ignored;
        };

        info!("HID {:?} channel 0x{:04x} open for {}", kind, local_cid, address);
        if handle != 0 {
            registry.set_connection_handle(id, handle);
        }
        set_channel(registry, id, kind, ChannelState::Open(local_cid));

        let outgoing = match registry.get_mut(id) {
            Some(device) => {
                if device.state() != LifecycleState::Connected {
                    // Rejections are logged by the device
                    let _ = device.transition(LifecycleState::Connecting);
                }
                !(incoming || device.is_incoming())
            }
            None => return ChannelOutcome::Ignored,
        };

        if outgoing {
            if local_cid == 0 {
                error!("Channel open for {} reported no local cid", address);
                return ChannelOutcome::Remove(id);
            }
            if kind == ChannelKind::Control && self.open(registry, stack, id, ChannelKind::Interrupt).is_err() {
                return ChannelOutcome::Remove(id);
            }
        }

        if let Some(device) = registry.get_mut(id) {
            if device.control_channel().is_open() && device.interrupt_channel().is_open() {
                let _ = device.transition(LifecycleState::Connected);
            }
        }
        ChannelOutcome::Opened { device: id, kind }
    }

    fn on_open_failed<S: BluetoothStack + ?Sized>(
        &self,
        registry: &mut DeviceRegistry,
        stack: &mut S,
        address: BdAddr,
        psm: Psm,
        local_cid: ChannelId,
        status: StatusCode,
    ) -> ChannelOutcome {
        let owner = registry
            .id_for_cid(local_cid)
            .or_else(|| registry.id_for_address(address));

        if self.is_stale_link_key(status.0) {
            warn!(
                "Channel to {} failed with {}, dropping stored link key",
                address, status
            );
            stack.drop_link_key(address);
            return owner.map_or(ChannelOutcome::Ignored, ChannelOutcome::Remove);
        }

        warn!("Opening psm 0x{:04x} to {} failed: {}", psm, address, status);
        if let (Some(id), Some(kind)) = (owner, ChannelKind::from_psm(psm)) {
            set_channel(registry, id, kind, ChannelState::Closed);
        }
        ChannelOutcome::Ignored
    }

    /// A channel closed. The device is kept: with one channel left it falls
    /// back to CONNECTING, with none it becomes an orphan.
    pub fn on_closed(&self, registry: &mut DeviceRegistry, local_cid: ChannelId) -> ChannelOutcome {
        let Some(id) = registry.id_for_cid(local_cid) else {
            debug!("Close for unknown channel 0x{:04x}", local_cid);
            return ChannelOutcome::Ignored;
        };
        let Some((control, interrupt)) = registry
            .get(id)
            .map(|d| (d.control_channel(), d.interrupt_channel()))
        else {
            return ChannelOutcome::Ignored;
        };

        if control.cid() == local_cid {
            registry.set_control_channel(id, ChannelState::Closed);
        }
        if interrupt.cid() == local_cid {
            registry.set_interrupt_channel(id, ChannelState::Closed);
        }

        let Some(device) = registry.get_mut(id) else {
            return ChannelOutcome::Ignored;
        };
        info!("Channel 0x{:04x} of {} closed", local_cid, device.address());
        let both_closed = device.control_channel().is_closed() && device.interrupt_channel().is_closed();
        match device.state() {
            LifecycleState::Connecting | LifecycleState::Connected if both_closed => {
                let _ = device.transition(LifecycleState::Orphan);
            }
            LifecycleState::Connected => {
                let _ = device.transition(LifecycleState::Connecting);
            }
            _ => {}
        }
        ChannelOutcome::Closed(id)
    }
}

fn set_channel(registry: &mut DeviceRegistry, id: DeviceId, kind: ChannelKind, channel: ChannelState) {
    match kind {
        ChannelKind::Control => registry.set_control_channel(id, channel),
        ChannelKind::Interrupt => registry.set_interrupt_channel(id, channel),
    }
}

fn decline<S: BluetoothStack + ?Sized>(stack: &mut S, cid: ChannelId) -> ChannelOutcome {
    if let Err(status) = stack.decline_channel(cid) {
        warn!("Declining channel 0x{:04x} failed: {}", cid, status);
    }
    ChannelOutcome::Declined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::replay::{ReplayStack, StackCommand};

    fn addr(last: u8) -> BdAddr {
        BdAddr::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last])
    }

    fn mux() -> ChannelMultiplexer {
        ChannelMultiplexer::new(48, vec![0x66, 0x6A])
    }

    #[test]
    fn outgoing_control_open_chains_interrupt() {
        let mut registry = DeviceRegistry::new(4);
        let mut stack = ReplayStack::default();
        let mux = mux();
        let id = registry.create(addr(1)).unwrap();

        let control = mux.open_control(&mut registry, &mut stack, id).unwrap();
        assert_eq!(registry.get(id).unwrap().control_channel(), ChannelState::Pending(control));

        let outcome = mux.on_opened(&mut registry, &mut stack, addr(1), PSM_HID_CONTROL, control, 0x0B, 0, false);
        assert_eq!(
            outcome,
            ChannelOutcome::Opened {
                device: id,
                kind: ChannelKind::Control
            }
        );
        let device = registry.get(id).unwrap();
        assert_eq!(device.state(), LifecycleState::Connecting);
        assert!(matches!(device.interrupt_channel(), ChannelState::Pending(_)));
        assert_eq!(
            stack.take_commands()[1],
            StackCommand::OpenChannel {
                address: addr(1),
                psm: PSM_HID_INTERRUPT,
                mtu: 48
            }
        );

        let interrupt = device.interrupt_cid();
        mux.on_opened(&mut registry, &mut stack, addr(1), PSM_HID_INTERRUPT, interrupt, 0x0B, 0, false);
        assert_eq!(registry.get(id).unwrap().state(), LifecycleState::Connected);
        assert_eq!(registry.id_for_handle(0x0B), Some(id));
    }

    #[test]
    fn stale_link_key_drops_credential_and_removes_entry() {
        let mut registry = DeviceRegistry::new(4);
        let mut stack = ReplayStack::default();
        let mux = mux();
        let id = registry.create(addr(1)).unwrap();
        let cid = mux.open_control(&mut registry, &mut stack, id).unwrap();
        stack.take_commands();

        let outcome = mux.on_opened(&mut registry, &mut stack, addr(1), PSM_HID_CONTROL, cid, 0, 0x66, false);

        assert_eq!(outcome, ChannelOutcome::Remove(id));
        assert_eq!(stack.take_commands(), vec![StackCommand::DropLinkKey { address: addr(1) }]);
    }

    #[test]
    fn other_failures_only_close_the_channel() {
        let mut registry = DeviceRegistry::new(4);
        let mut stack = ReplayStack::default();
        let mux = mux();
        let id = registry.create(addr(1)).unwrap();
        let cid = mux.open_control(&mut registry, &mut stack, id).unwrap();

        let outcome = mux.on_opened(&mut registry, &mut stack, addr(1), PSM_HID_CONTROL, cid, 0, 0x04, false);

        assert_eq!(outcome, ChannelOutcome::Ignored);
        assert!(registry.get(id).unwrap().control_channel().is_closed());
        assert_eq!(registry.id_for_cid(cid), None);
    }

    #[test]
    fn zero_local_cid_aborts_outgoing_device() {
        let mut registry = DeviceRegistry::new(4);
        let mut stack = ReplayStack::default();
        let id = registry.create(addr(1)).unwrap();

        let outcome = mux().on_opened(&mut registry, &mut stack, addr(1), PSM_HID_CONTROL, 0, 0, 0, false);
        assert_eq!(outcome, ChannelOutcome::Remove(id));
    }

    #[test]
    fn open_for_unknown_address_removes_channel_owner() {
        let mut registry = DeviceRegistry::new(4);
        let mut stack = ReplayStack::default();
        let mux = mux();
        let id = registry.create(addr(1)).unwrap();
        let cid = mux.open_control(&mut registry, &mut stack, id).unwrap();

        assert_eq!(
            mux.on_opened(&mut registry, &mut stack, addr(9), PSM_HID_CONTROL, cid, 0, 0, false),
            ChannelOutcome::Remove(id)
        );
        assert_eq!(
            mux.on_opened(&mut registry, &mut stack, addr(9), PSM_HID_CONTROL, 0x99, 0, 0, false),
            ChannelOutcome::Ignored
        );
    }

    #[test]
    fn incoming_requests_are_accepted_or_declined() {
        let mut registry = DeviceRegistry::new(1);
        let mut stack = ReplayStack::default();
        let mux = mux();

        // Interrupt before control has no device to attach to
        assert_eq!(
            mux.on_incoming(&mut registry, &mut stack, addr(1), PSM_HID_INTERRUPT, 0x41, 0x0B),
            ChannelOutcome::Declined
        );
        let outcome = mux.on_incoming(&mut registry, &mut stack, addr(1), PSM_HID_CONTROL, 0x40, 0x0B);
        let ChannelOutcome::Accepted(id) = outcome else {
            panic!("control not accepted: {:?}", outcome);
        };
        assert!(registry.get(id).unwrap().is_incoming());
        assert_eq!(
            mux.on_incoming(&mut registry, &mut stack, addr(1), PSM_HID_INTERRUPT, 0x41, 0x0B),
            ChannelOutcome::Accepted(id)
        );
        // Registry is full
        assert_eq!(
            mux.on_incoming(&mut registry, &mut stack, addr(2), PSM_HID_CONTROL, 0x42, 0x0C),
            ChannelOutcome::Declined
        );
        assert_eq!(
            mux.on_incoming(&mut registry, &mut stack, addr(1), 0x0001, 0x43, 0x0B),
            ChannelOutcome::Declined
        );

        assert_eq!(
            stack.take_commands(),
            vec![
                StackCommand::DeclineChannel { cid: 0x41 },
                StackCommand::AcceptChannel { cid: 0x40 },
                StackCommand::AcceptChannel { cid: 0x41 },
                StackCommand::DeclineChannel { cid: 0x42 },
                StackCommand::DeclineChannel { cid: 0x43 },
            ]
        );

        // Incoming devices do not chain the interrupt channel themselves
        mux.on_opened(&mut registry, &mut stack, addr(1), PSM_HID_CONTROL, 0x40, 0x0B, 0, true);
        assert!(stack.take_commands().is_empty());
        mux.on_opened(&mut registry, &mut stack, addr(1), PSM_HID_INTERRUPT, 0x41, 0x0B, 0, true);
        assert_eq!(registry.get(id).unwrap().state(), LifecycleState::Connected);
    }

    #[test]
    fn closing_channels_degrades_then_orphans() {
        let mut registry = DeviceRegistry::new(4);
        let mut stack = ReplayStack::default();
        let mux = mux();
        let id = registry.create(addr(1)).unwrap();
        mux.on_incoming(&mut registry, &mut stack, addr(1), PSM_HID_CONTROL, 0x40, 0x0B);
        mux.on_incoming(&mut registry, &mut stack, addr(1), PSM_HID_INTERRUPT, 0x41, 0x0B);
        mux.on_opened(&mut registry, &mut stack, addr(1), PSM_HID_CONTROL, 0x40, 0x0B, 0, true);
        mux.on_opened(&mut registry, &mut stack, addr(1), PSM_HID_INTERRUPT, 0x41, 0x0B, 0, true);

        assert_eq!(mux.on_closed(&mut registry, 0x41), ChannelOutcome::Closed(id));
        assert_eq!(registry.get(id).unwrap().state(), LifecycleState::Connecting);
        assert_eq!(mux.on_closed(&mut registry, 0x40), ChannelOutcome::Closed(id));
        assert_eq!(registry.get(id).unwrap().state(), LifecycleState::Orphan);
        assert_eq!(registry.len(), 1);
        assert_eq!(mux.on_closed(&mut registry, 0x40), ChannelOutcome::Ignored);
    }
}
