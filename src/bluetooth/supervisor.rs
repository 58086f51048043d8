//! Top-level handler for everything the Bluetooth stack reports.
//!
//! # Architecture
//!
//! The supervisor owns the device registry and drives three cooperating pieces:
//!
//! ```text
//!   StackEvent ──► ConnectionSupervisor::handle_event
//!                     │
//!                     ├── scan cycle: inquiry ─► name requests (one at a time) ─► inquiry
//!                     ├── ChannelMultiplexer: control + interrupt per device
//!                     ├── SdpQuerySerializer: descriptor ─► vendor/product, one device at a time
//!                     └── ReportDispatcher: interrupt payloads ─► GamepadState ─► Platform
//! ```
//!
//! # Errors
//!
//! Nothing here is fatal. Failures are logged, cleanup runs (token release,
//! slot removal, link key drop) and the next event is handled normally.
//!
//! # Example
//!
//! ```no_run
//! use padbridge::bluetooth::{ConnectionSupervisor, StackEvent};
//! use padbridge::bridge::replay::ReplayStack;
//! use padbridge::config::BluetoothConfig;
//! use padbridge::platform::ChannelPlatform;
//!
//! let (tx, _rx) = tokio::sync::mpsc::channel(16);
//! let mut supervisor =
//!     ConnectionSupervisor::new(ReplayStack::default(), ChannelPlatform::new(tx), &BluetoothConfig::default());
//! supervisor.handle_event(StackEvent::StackReady);
//! ```

use super::address::BdAddr;
use super::channels::{ChannelKind, ChannelMultiplexer, ChannelOutcome};
use super::device::{is_cod_supported, LifecycleState};
use super::error::BridgeError;
use super::registry::{DeviceId, DeviceRegistry};
use super::sdp::{QueryStep, SdpQuerySerializer, SdpResult};
use super::stack::{BluetoothStack, ChannelId, ConnectionHandle, StackEvent, StatusCode};
use crate::config::{BluetoothConfig, CredentialPolicy};
use crate::gamepad::{GamepadState, LedState};
use crate::hid::dispatcher::DispatchStats;
use crate::hid::parser::classify;
use crate::hid::{ControllerFamily, ReportDispatcher};
use crate::platform::Platform;
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Security level requested once the baseband link is up.
const BASELINE_SECURITY_LEVEL: u8 = 1;
/// Marks the clock offset of a remote name request as valid.
const CLOCK_OFFSET_VALID: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCycle {
    Idle,
    Inquiring,
    ResolvingNames,
}

/// Read-only view of one device for consumers outside the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub address: BdAddr,
    pub name: Option<String>,
    pub state: LifecycleState,
    pub family: Option<ControllerFamily>,
    pub class_of_device: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub incoming: bool,
    #[serde(skip)]
    pub gamepad: GamepadState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub events: u64,
    pub ignored_before_ready: u64,
    pub failures: u64,
    pub channels_accepted: u64,
    pub channels_declined: u64,
    pub reports: DispatchStats,
}

pub struct ConnectionSupervisor<S: BluetoothStack, P: Platform> {
    stack: S,
    platform: P,
    // Fixed at construction
    inquiry_duration: u8,
    service_mtu: u16,
    credential_policy: CredentialPolicy,

    registry: DeviceRegistry,
    sdp: SdpQuerySerializer,
    channels: ChannelMultiplexer,
    dispatcher: ReportDispatcher,

    ready: bool,
    scan: ScanCycle,
    events: u64,
    ignored_before_ready: u64,
    failures: u64,
    channels_accepted: u64,
    channels_declined: u64,
}

impl<S: BluetoothStack, P: Platform> ConnectionSupervisor<S, P> {
    pub fn new(stack: S, platform: P, config: &BluetoothConfig) -> Self {
        Self {
            stack,
            platform,
            inquiry_duration: config.inquiry_duration,
            service_mtu: config.service_mtu,
            credential_policy: config.credential_policy,
            registry: DeviceRegistry::new(config.max_devices),
            sdp: SdpQuerySerializer::new(config.max_attribute_size),
            channels: ChannelMultiplexer::new(config.channel_mtu, config.stale_link_key_statuses.clone()),
            dispatcher: ReportDispatcher::new(),
            ready: false,
            scan: ScanCycle::Idle,
            events: 0,
            ignored_before_ready: 0,
            failures: 0,
            channels_accepted: 0,
            channels_declined: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn scan_cycle(&self) -> ScanCycle {
        self.scan
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn sdp(&self) -> &SdpQuerySerializer {
        &self.sdp
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut S {
        &mut self.stack
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            events: self.events,
            ignored_before_ready: self.ignored_before_ready,
            failures: self.failures,
            channels_accepted: self.channels_accepted,
            channels_declined: self.channels_declined,
            reports: self.dispatcher.stats(),
        }
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.registry
            .iter()
            .map(|(_, d)| DeviceSnapshot {
                address: d.address(),
                name: d.name().map(str::to_string),
                state: d.state(),
                family: d.family(),
                class_of_device: d.class_of_device(),
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                incoming: d.is_incoming(),
                gamepad: d.gamepad().clone(),
            })
            .collect()
    }

    /// Single entry point for stack events. Events before [`StackEvent::StackReady`]
    /// are dropped.
    pub fn handle_event(&mut self, event: StackEvent) {
        self.events += 1;
        let was_ready = self.ready;
        let idle_before = self.scan == ScanCycle::Idle;
        if !self.ready && event != StackEvent::StackReady {
            self.ignored_before_ready += 1;
            debug!("Stack not ready, ignoring {}", event.kind());
            return;
        }

        let kind = event.kind();
        let result = match event {
            StackEvent::StackReady => {
                self.on_stack_ready();
                Ok(())
            }
            StackEvent::InquiryResult {
                address,
                page_scan_repetition_mode,
                clock_offset,
                class_of_device,
                name,
                rssi,
            } => self.on_inquiry_result(address, page_scan_repetition_mode, clock_offset, class_of_device, name, rssi),
            StackEvent::InquiryComplete => {
                self.on_inquiry_complete();
                Ok(())
            }
            StackEvent::RemoteNameResult { address, status, name } => {
                self.on_remote_name_result(address, status, name);
                Ok(())
            }
            StackEvent::ConnectionRequest {
                address,
                class_of_device,
            } => self.on_connection_request(address, class_of_device),
            StackEvent::ConnectionComplete {
                address,
                handle,
                status,
            } => self.on_connection_complete(address, handle, status),
            StackEvent::DisconnectionComplete { handle, reason } => {
                self.on_disconnection_complete(handle, reason);
                Ok(())
            }
            StackEvent::SdpAttributeByte {
                attribute_id,
                offset,
                attribute_length,
                byte,
            } => self.on_sdp_attribute_byte(attribute_id, offset, attribute_length, byte),
            StackEvent::SdpAttributeValue { attribute_id, value } => self.on_sdp_attribute_value(attribute_id, &value),
            StackEvent::SdpQueryComplete { status } => self.on_sdp_query_complete(status),
            StackEvent::ChannelIncoming {
                address,
                psm,
                local_cid,
                handle,
            } => {
                let outcome = self
                    .channels
                    .on_incoming(&mut self.registry, &mut self.stack, address, psm, local_cid, handle);
                self.after_channel_event(outcome)
            }
            StackEvent::ChannelOpened {
                address,
                psm,
                local_cid,
                handle,
                status,
                incoming,
            } => {
                let outcome = self.channels.on_opened(
                    &mut self.registry,
                    &mut self.stack,
                    address,
                    psm,
                    local_cid,
                    handle,
                    status,
                    incoming,
                );
                self.after_channel_event(outcome)
            }
            StackEvent::ChannelClosed { local_cid } => {
                let outcome = self.channels.on_closed(&mut self.registry, local_cid);
                self.after_channel_event(outcome)
            }
            StackEvent::ChannelData { local_cid, data } => {
                self.on_channel_data(local_cid, &data);
                Ok(())
            }
        };

        if let Err(e) = result {
            self.failures += 1;
            warn!("Handling {} failed: {}", kind, e);
        }
        if was_ready {
            self.resume_idle_work(idle_before);
        }
    }

    /// Restarts work a refused command left idle: the inquiry cycle and queued
    /// SDP queries.
    fn resume_idle_work(&mut self, idle_before: bool) {
        // An inquiry refused while handling this event is retried on the next one
        if idle_before && self.scan == ScanCycle::Idle {
            info!("Inquiry scan is idle, retrying");
            self.start_inquiry();
        }
        if !self.sdp.is_busy() && self.sdp.has_waiting() {
            self.start_next_query();
        }
    }

    fn on_stack_ready(&mut self) {
        if self.ready {
            debug!("Duplicate stack ready event");
            return;
        }
        info!("Bluetooth stack ready");
        self.ready = true;
        self.platform.on_bluetooth_ready();

        if let Err(status) = self.channels.register_services(&mut self.stack, self.service_mtu) {
            error!("Failed to register HID services: {}", status);
        }
        self.apply_credential_policy();
        self.start_inquiry();
    }

    fn apply_credential_policy(&mut self) {
        let keys = self.stack.stored_link_keys();
        for address in &keys {
            info!("Stored link key for {}", address);
        }

        let clear = match self.credential_policy {
            CredentialPolicy::Keep => false,
            CredentialPolicy::ClearOnUserRequest => self.platform.is_user_reset_requested(),
            CredentialPolicy::ClearAlways => true,
        };
        if clear && !keys.is_empty() {
            info!("Deleting {} stored link keys", keys.len());
            for address in keys {
                self.stack.drop_link_key(address);
            }
        }
    }

    fn start_inquiry(&mut self) {
        info!("Starting inquiry scan..");
        match self.stack.start_inquiry(self.inquiry_duration) {
            Ok(()) => self.scan = ScanCycle::Inquiring,
            Err(status) => {
                error!("Failed to start inquiry: {}", status);
                self.scan = ScanCycle::Idle;
            }
        }
    }

    fn on_inquiry_result(
        &mut self,
        address: BdAddr,
        page_scan_repetition_mode: u8,
        clock_offset: u16,
        class_of_device: u32,
        name: Option<String>,
        rssi: Option<i8>,
    ) -> Result<(), BridgeError> {
        info!(
            "Device found: {} with COD: 0x{:06x}, pageScan {}, clock offset 0x{:04x}, rssi {:?}",
            address, class_of_device, page_scan_repetition_mode, clock_offset, rssi
        );
        if !is_cod_supported(class_of_device) {
            debug!("{} is not a supported input device", address);
            return Ok(());
        }

        if let Some(existing) = self.registry.id_for_address(address).and_then(|id| self.registry.get(id)) {
            if !existing.is_orphan() {
                info!("Device {} already added", address);
                return Ok(());
            }
        }

        let id = self.registry.create(address)?;
        let Some(device) = self.registry.get_mut(id) else {
            return Err(BridgeError::VacantSlot(id));
        };
        device.set_class_of_device(class_of_device);
        device.set_scan_parameters(page_scan_repetition_mode, clock_offset);
        if !device.has_name() {
            match name {
                Some(name) => device.set_name(name),
                None => device.transition(LifecycleState::RemoteNameRequest)?,
            }
        }

        self.channels.open_control(&mut self.registry, &mut self.stack, id)?;
        Ok(())
    }

    fn on_inquiry_complete(&mut self) {
        info!("Inquiry complete");
        self.scan = ScanCycle::ResolvingNames;
        self.continue_remote_names();
    }

    /// Issues the next queued name request, or restarts the inquiry when the
    /// queue is empty.
    fn continue_remote_names(&mut self) {
        while let Some(id) = self.registry.first_with_state(LifecycleState::RemoteNameRequest) {
            let Some(device) = self.registry.get_mut(id) else {
                break;
            };
            if device.transition(LifecycleState::RemoteNameInquired).is_err() {
                break;
            }
            let address = device.address();
            info!("Get remote name of {}...", address);
            match self.stack.request_remote_name(
                address,
                device.page_scan_repetition_mode(),
                device.clock_offset() | CLOCK_OFFSET_VALID,
            ) {
                Ok(()) => return,
                Err(status) => {
                    warn!("Remote name request for {} failed: {}", address, status);
                    let _ = device.transition(LifecycleState::Discovered);
                }
            }
        }
        self.start_inquiry();
    }

    fn on_remote_name_result(&mut self, address: BdAddr, status: u8, name: Option<String>) {
        match self.registry.id_for_address(address).and_then(|id| self.registry.get_mut(id)) {
            Some(device) => {
                match (StatusCode::check(status), name) {
                    (Ok(()), Some(name)) => device.set_name(name),
                    (Ok(()), None) => warn!("Remote name of {} is empty", address),
                    (Err(status), _) => warn!("Failed to get name of {}: {}", address, status),
                }
                if device.state() == LifecycleState::RemoteNameInquired {
                    let _ = device.transition(LifecycleState::Discovered);
                }
            }
            None => warn!("Remote name result for unknown device {}", address),
        }

        if self.scan == ScanCycle::ResolvingNames {
            self.continue_remote_names();
        } else {
            debug!("Remote name result outside of the name phase");
        }
    }

    fn on_connection_request(&mut self, address: BdAddr, class_of_device: u32) -> Result<(), BridgeError> {
        info!("Connection request from {} with COD 0x{:06x}", address, class_of_device);
        let id = self.registry.find_or_create(address)?;
        if let Some(device) = self.registry.get_mut(id) {
            device.set_class_of_device(class_of_device);
            device.set_incoming(true);
        }
        Ok(())
    }

    fn on_connection_complete(
        &mut self,
        address: BdAddr,
        handle: ConnectionHandle,
        status: u8,
    ) -> Result<(), BridgeError> {
        if let Err(status) = StatusCode::check(status) {
            warn!("Connection to {} failed: {}", address, status);
            return Ok(());
        }
        let id = self
            .registry
            .id_for_address(address)
            .ok_or(BridgeError::UnknownDevice(address))?;
        info!("Connection complete for {} handle 0x{:04x}", address, handle);
        self.registry.set_connection_handle(id, handle);
        self.stack.request_security_level(handle, BASELINE_SECURITY_LEVEL)?;
        Ok(())
    }

    fn on_disconnection_complete(&mut self, handle: ConnectionHandle, reason: u8) {
        match self.registry.id_for_handle(handle).and_then(|id| self.registry.get(id)) {
            Some(device) => info!(
                "Disconnected {} (handle 0x{:04x}, reason 0x{:02x})",
                device.address(),
                handle,
                reason
            ),
            None => info!("Disconnected handle 0x{:04x}, reason 0x{:02x}", handle, reason),
        }
    }

    fn on_sdp_attribute_byte(
        &mut self,
        attribute_id: u16,
        offset: u16,
        attribute_length: u16,
        byte: u8,
    ) -> Result<(), BridgeError> {
        // After an abort the next query starts only once the stack finishes this one
        match self.sdp.on_attribute_byte(attribute_id, offset, attribute_length, byte) {
            Err(BridgeError::NoQueryTarget) => {
                debug!("SDP attribute byte without query target");
                Ok(())
            }
            other => other,
        }
    }

    fn on_sdp_attribute_value(&mut self, attribute_id: u16, value: &[u8]) -> Result<(), BridgeError> {
        let Ok(length) = u16::try_from(value.len()) else {
            if self.sdp.abandon().is_none() {
                debug!("SDP attribute value without query target");
                return Ok(());
            }
            return Err(BridgeError::AttributeOverflow {
                attribute_id,
                length: value.len(),
                limit: usize::from(u16::MAX),
            });
        };
        for (offset, byte) in (0..length).zip(value) {
            self.on_sdp_attribute_byte(attribute_id, offset, length, *byte)?;
            if self.sdp.holder().is_none() {
                break;
            }
        }
        Ok(())
    }

    fn on_sdp_query_complete(&mut self, status: u8) -> Result<(), BridgeError> {
        match self.sdp.on_query_complete(&mut self.stack, status) {
            Ok(QueryStep::Chained) => Ok(()),
            Ok(QueryStep::Drained) => {
                self.start_next_query();
                Ok(())
            }
            Ok(QueryStep::Completed(result)) => {
                self.commit_sdp_result(result);
                self.start_next_query();
                Ok(())
            }
            Err(BridgeError::NoQueryTarget) => {
                debug!("SDP query complete without query target");
                Ok(())
            }
            Err(e) => {
                self.start_next_query();
                Err(e)
            }
        }
    }

    fn commit_sdp_result(&mut self, result: SdpResult) {
        let Some(device) = self.registry.get_mut(result.device) else {
            warn!("SDP result for removed device {}", result.address);
            return;
        };
        if device.address() != result.address {
            warn!("SDP result for {} landed on {}", result.address, device.address());
            return;
        }
        if !device.has_hid_descriptor() {
            device.set_hid_descriptor(result.hid_descriptor);
        }
        device.set_ids(result.vendor_id, result.product_id);
        let family = classify(result.vendor_id, result.product_id, device.report_descriptor());
        match family {
            Some(family) => info!("{} classified as {}", result.address, family),
            None => warn!("No controller family for {}", result.address),
        }
        device.set_family(family);
        self.platform.try_assign_output_port(device);
    }

    /// Starts the next queued device that still lacks a descriptor. A device
    /// the stack refuses goes back to the head of the queue.
    fn start_next_query(&mut self) {
        if self.sdp.is_busy() {
            return;
        }
        while let Some(id) = self.sdp.next_waiting() {
            let Some(device) = self.registry.get(id) else {
                continue;
            };
            if device.has_hid_descriptor() || !device.interrupt_channel().is_open() {
                continue;
            }
            let address = device.address();
            match self.sdp.begin_descriptor_query(&mut self.stack, id, address) {
                Ok(()) => return,
                Err(BridgeError::Stack(status)) => {
                    warn!("Stack refused SDP query of {} ({}), keeping it queued", address, status);
                    self.sdp.requeue(id);
                    return;
                }
                Err(e) => warn!("Dropping queued SDP query of {}: {}", address, e),
            }
        }
    }

    fn after_channel_event(&mut self, outcome: ChannelOutcome) -> Result<(), BridgeError> {
        match outcome {
            ChannelOutcome::Ignored => Ok(()),
            ChannelOutcome::Accepted(_) => {
                self.channels_accepted += 1;
                Ok(())
            }
            ChannelOutcome::Declined => {
                self.channels_declined += 1;
                Ok(())
            }
            ChannelOutcome::Opened { device: id, kind } => {
                let Some(device) = self.registry.get(id) else {
                    return Err(BridgeError::VacantSlot(id));
                };
                if kind == ChannelKind::Interrupt && !device.has_hid_descriptor() {
                    let address = device.address();
                    match self.sdp.begin_descriptor_query(&mut self.stack, id, address) {
                        Ok(()) => {}
                        Err(BridgeError::QueryBusy { holder }) => {
                            info!("Queueing SDP query of {} behind {}", address, holder);
                            self.sdp.enqueue(id);
                        }
                        Err(BridgeError::Stack(status)) => {
                            warn!("Stack refused SDP query of {} ({}), queueing it", address, status);
                            self.sdp.enqueue(id);
                        }
                        Err(e) => warn!("SDP query for {} not started: {}", address, e),
                    }
                }
                if let Some(device) = self.registry.get(id) {
                    self.platform.try_assign_output_port(device);
                }
                Ok(())
            }
            ChannelOutcome::Closed(id) => {
                let orphaned = self.registry.get(id).is_some_and(|d| d.is_orphan());
                if orphaned {
                    // Its pending SDP work can never finish
                    self.sdp.forget(id);
                }
                Ok(())
            }
            ChannelOutcome::Remove(id) => {
                self.remove_device(id);
                Ok(())
            }
        }
    }

    fn on_channel_data(&mut self, local_cid: ChannelId, data: &[u8]) {
        let Some(id) = self.registry.id_for_cid(local_cid) else {
            warn!("Data on unknown channel 0x{:04x}", local_cid);
            return;
        };
        let Some(device) = self.registry.get_mut(id) else {
            return;
        };
        if device.interrupt_cid() != local_cid {
            debug!("Ignoring {} bytes on control channel of {}", data.len(), device.address());
            return;
        }
        if data.is_empty() {
            debug!("Discarding empty report from {}", device.address());
            return;
        }

        let (descriptor, family, gamepad) = device.report_context();
        let outcome = self.dispatcher.dispatch(data, descriptor, family, gamepad);
        if outcome.is_decoded() {
            self.platform.on_gamepad_report_ready(device);
        }
    }

    fn remove_device(&mut self, id: DeviceId) {
        self.sdp.forget(id);
        if let Some(device) = self.registry.remove(id) {
            self.platform.on_device_removed(device.address());
        }
    }

    /// Removes `address` from the registry. A query it holds is abandoned; the
    /// next device starts when the stack finishes it.
    pub fn evict(&mut self, address: BdAddr) -> Result<(), BridgeError> {
        let id = self
            .registry
            .id_for_address(address)
            .ok_or(BridgeError::UnknownDevice(address))?;
        info!("Evicting {}", address);
        self.remove_device(id);
        Ok(())
    }

    /// Sends a light bar / rumble update to `address` if its family supports it.
    pub fn set_led(&mut self, address: BdAddr, led: LedState) -> Result<(), BridgeError> {
        let device = self
            .registry
            .id_for_address(address)
            .and_then(|id| self.registry.get(id))
            .ok_or(BridgeError::UnknownDevice(address))?;
        let Some(family) = device.family() else {
            debug!("{} has no family yet, LED update skipped", address);
            return Ok(());
        };
        let Some(report) = family.parser().update_led(&led) else {
            debug!("{} does not support LED updates", family);
            return Ok(());
        };
        let channel = device.interrupt_channel();
        if !channel.is_open() {
            return Err(BridgeError::ChannelNotOpen(address));
        }
        self.stack.send_data(channel.cid(), &report)?;
        Ok(())
    }
}
