//! Fixed-capacity device table
//!
//! Devices live in an arena of slots addressed by [`DeviceId`]. Side tables map
//! addresses, connection handles and channel ids back to slots; the handle and
//! channel setters go through the registry so those tables stay in sync.

use super::address::BdAddr;
use super::device::{ChannelState, Device, LifecycleState};
use super::error::BridgeError;
use super::stack::{ChannelId, ConnectionHandle};
use std::collections::HashMap;
use tracing::{debug, error, info};

/// Stable handle to a registry slot. Only valid until the device is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(usize);

#[derive(Debug)]
pub struct DeviceRegistry {
    slots: Vec<Option<Device>>,
    capacity: usize,
    by_address: HashMap<BdAddr, DeviceId>,
    by_handle: HashMap<ConnectionHandle, DeviceId>,
    by_cid: HashMap<ChannelId, DeviceId>,
    next_sequence: u64,
}

impl DeviceRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            by_address: HashMap::new(),
            by_handle: HashMap::new(),
            by_cid: HashMap::new(),
            next_sequence: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Registers `address`. An orphaned entry for the same address is revived in
    /// place; any other live entry is an error.
    pub fn create(&mut self, address: BdAddr) -> Result<DeviceId, BridgeError> {
        if let Some(id) = self.id_for_address(address) {
            let sequence = self.next_sequence();
            match self.get_mut(id) {
                Some(device) if device.is_orphan() => device.revive(sequence),
                _ => return Err(BridgeError::AlreadyRegistered(address)),
            }
            info!("Reviving orphaned device {}", address);
            self.unindex_session(id);
            return Ok(id);
        }

        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => {
                error!("No more available device slots for {}", address);
                return Err(BridgeError::SlotsExhausted {
                    capacity: self.capacity,
                });
            }
        };

        let id = DeviceId(index);
        let sequence = self.next_sequence();
        self.slots[index] = Some(Device::new(address, sequence));
        self.by_address.insert(address, id);
        debug!("Created device {} in slot {}", address, index);
        Ok(id)
    }

    /// Existing entry for `address` (orphans included), or a new one.
    pub fn find_or_create(&mut self, address: BdAddr) -> Result<DeviceId, BridgeError> {
        match self.id_for_address(address) {
            Some(id) => Ok(id),
            None => self.create(address),
        }
    }

    pub fn remove(&mut self, id: DeviceId) -> Option<Device> {
        let device = self.slots.get_mut(id.0)?.take()?;
        self.by_address.remove(&device.address());
        self.unindex_session(id);
        info!("Removed device {}", device.address());
        Some(device)
    }

    fn unindex_session(&mut self, id: DeviceId) {
        self.by_handle.retain(|_, v| *v != id);
        self.by_cid.retain(|_, v| *v != id);
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.slots.get(id.0)?.as_ref()
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.slots.get_mut(id.0)?.as_mut()
    }

    pub fn id_for_address(&self, address: BdAddr) -> Option<DeviceId> {
        self.by_address.get(&address).copied()
    }

    pub fn id_for_handle(&self, handle: ConnectionHandle) -> Option<DeviceId> {
        self.by_handle.get(&handle).copied()
    }

    pub fn id_for_cid(&self, cid: ChannelId) -> Option<DeviceId> {
        self.by_cid.get(&cid).copied()
    }

    pub fn set_connection_handle(&mut self, id: DeviceId, handle: ConnectionHandle) {
        let Some(old) = self.get(id).map(|d| d.connection_handle()) else {
            return;
        };
        if let Some(old) = old {
            self.by_handle.remove(&old);
        }
        if let Some(device) = self.get_mut(id) {
            device.set_connection_handle(Some(handle));
        }
        self.by_handle.insert(handle, id);
    }

    pub fn set_control_channel(&mut self, id: DeviceId, channel: ChannelState) {
        let old = self.get(id).map(|d| d.control_channel());
        if let Some(device) = self.get_mut(id) {
            device.set_control_channel(channel);
        }
        self.reindex_channel(id, old, channel);
    }

    pub fn set_interrupt_channel(&mut self, id: DeviceId, channel: ChannelState) {
        let old = self.get(id).map(|d| d.interrupt_channel());
        if let Some(device) = self.get_mut(id) {
            device.set_interrupt_channel(channel);
        }
        self.reindex_channel(id, old, channel);
    }

    fn reindex_channel(&mut self, id: DeviceId, old: Option<ChannelState>, new: ChannelState) {
        let Some(old) = old else {
            return;
        };
        if old.cid() != 0 && old.cid() != new.cid() && self.by_cid.get(&old.cid()) == Some(&id) {
            self.by_cid.remove(&old.cid());
        }
        if new.cid() != 0 {
            self.by_cid.insert(new.cid(), id);
        }
    }

    /// The device in `state` that registered first.
    pub fn first_with_state(&self, state: LifecycleState) -> Option<DeviceId> {
        self.iter()
            .filter(|(_, d)| d.state() == state)
            .min_by_key(|(_, d)| d.sequence())
            .map(|(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &Device)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|d| (DeviceId(i), d)))
    }
}
