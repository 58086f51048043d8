//! Outward collaborator: whatever consumes decoded gamepads and owns the
//! physical output ports.
//!
//! [`ChannelPlatform`] forwards every notification as a [`PlatformEvent`] over a
//! bounded tokio channel. Sends never block the supervisor; a full queue drops
//! the notification.

use crate::bluetooth::{BdAddr, Device};
use crate::gamepad::GamepadState;
use crate::hid::ControllerFamily;
use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

pub trait Platform {
    fn on_bluetooth_ready(&mut self);

    /// A report was decoded into `device.gamepad()`.
    fn on_gamepad_report_ready(&mut self, device: &Device);

    fn is_user_reset_requested(&mut self) -> bool;

    /// Gives `device` an output port if one is free. Calling it again for a
    /// device that already has a port does nothing.
    fn try_assign_output_port(&mut self, device: &Device);

    fn on_device_removed(&mut self, _address: BdAddr) {}
}

impl<T: Platform + ?Sized> Platform for Box<T> {
    fn on_bluetooth_ready(&mut self) {
        (**self).on_bluetooth_ready()
    }

    fn on_gamepad_report_ready(&mut self, device: &Device) {
        (**self).on_gamepad_report_ready(device)
    }

    fn is_user_reset_requested(&mut self) -> bool {
        (**self).is_user_reset_requested()
    }

    fn try_assign_output_port(&mut self, device: &Device) {
        (**self).try_assign_output_port(device)
    }

    fn on_device_removed(&mut self, address: BdAddr) {
        (**self).on_device_removed(address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputPort {
    A,
    B,
}

impl OutputPort {
    pub const ALL: [OutputPort; 2] = [OutputPort::A, OutputPort::B];

    fn index(self) -> usize {
        match self {
            OutputPort::A => 0,
            OutputPort::B => 1,
        }
    }
}

impl fmt::Display for OutputPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputPort::A => f.write_str("A"),
            OutputPort::B => f.write_str("B"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GamepadReport {
    pub address: BdAddr,
    pub port: Option<OutputPort>,
    pub family: Option<ControllerFamily>,
    pub state: GamepadState,
    pub timestamp: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    BluetoothReady,
    GamepadReport(GamepadReport),
    PortAssigned { address: BdAddr, port: OutputPort },
    PortReleased { address: BdAddr, port: OutputPort },
}

pub struct ChannelPlatform {
    sender: mpsc::Sender<PlatformEvent>,
    ports: [Option<BdAddr>; 2],
    user_reset: bool,
    dropped: u64,
}

impl ChannelPlatform {
    pub fn new(sender: mpsc::Sender<PlatformEvent>) -> Self {
        Self {
            sender,
            ports: [None; 2],
            user_reset: false,
            dropped: 0,
        }
    }

    /// Answer for [`Platform::is_user_reset_requested`], e.g. a button held at boot.
    pub fn with_user_reset(mut self, requested: bool) -> Self {
        self.user_reset = requested;
        self
    }

    pub fn port_of(&self, address: BdAddr) -> Option<OutputPort> {
        OutputPort::ALL
            .into_iter()
            .find(|port| self.ports[port.index()] == Some(address))
    }

    /// Notifications lost to a full queue.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn send(&mut self, event: PlatformEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped += 1;
                warn!("Platform queue full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Platform receiver closed");
            }
        }
    }
}

impl Platform for ChannelPlatform {
    fn on_bluetooth_ready(&mut self) {
        info!("Bluetooth ready");
        self.send(PlatformEvent::BluetoothReady);
    }

    fn on_gamepad_report_ready(&mut self, device: &Device) {
        let report = GamepadReport {
            address: device.address(),
            port: self.port_of(device.address()),
            family: device.family(),
            state: device.gamepad().clone(),
            timestamp: Local::now(),
        };
        self.send(PlatformEvent::GamepadReport(report));
    }

    fn is_user_reset_requested(&mut self) -> bool {
        self.user_reset
    }

    fn try_assign_output_port(&mut self, device: &Device) {
        let address = device.address();
        if device.family().is_none() || self.port_of(address).is_some() {
            return;
        }
        let Some(port) = OutputPort::ALL
            .into_iter()
            .find(|port| self.ports[port.index()].is_none())
        else {
            debug!("No free output port for {}", address);
            return;
        };
        self.ports[port.index()] = Some(address);
        info!("Assigned {} to port {}", address, port);
        self.send(PlatformEvent::PortAssigned { address, port });
    }

    fn on_device_removed(&mut self, address: BdAddr) {
        if let Some(port) = self.port_of(address) {
            self.ports[port.index()] = None;
            info!("Released port {} from {}", port, address);
            self.send(PlatformEvent::PortReleased { address, port });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::DeviceRegistry;

    fn registry_with(families: &[Option<ControllerFamily>]) -> (DeviceRegistry, Vec<BdAddr>) {
        let mut registry = DeviceRegistry::new(families.len());
        let mut addresses = Vec::new();
        for (i, family) in families.iter().enumerate() {
            let address = BdAddr::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, i as u8]);
            let id = registry.create(address).unwrap();
            registry.get_mut(id).unwrap().set_family(*family);
            addresses.push(address);
        }
        (registry, addresses)
    }

    fn device(registry: &DeviceRegistry, address: BdAddr) -> &Device {
        let id = registry.id_for_address(address).unwrap();
        registry.get(id).unwrap()
    }

    #[test]
    fn ports_are_assigned_once_and_only_with_family() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut platform = ChannelPlatform::new(tx);
        let families = [
            None,
            Some(ControllerFamily::Ps4),
            Some(ControllerFamily::Android),
            Some(ControllerFamily::ICade),
        ];
        let (registry, addresses) = registry_with(&families);

        for address in &addresses {
            platform.try_assign_output_port(device(&registry, *address));
        }
        platform.try_assign_output_port(device(&registry, addresses[1]));

        assert_eq!(platform.port_of(addresses[0]), None);
        assert_eq!(platform.port_of(addresses[1]), Some(OutputPort::A));
        assert_eq!(platform.port_of(addresses[2]), Some(OutputPort::B));
        assert_eq!(platform.port_of(addresses[3]), None);
        assert_eq!(
            rx.try_recv().unwrap(),
            PlatformEvent::PortAssigned {
                address: addresses[1],
                port: OutputPort::A
            }
        );
        assert!(matches!(rx.try_recv().unwrap(), PlatformEvent::PortAssigned { .. }));
        assert!(rx.try_recv().is_err());

        platform.on_device_removed(addresses[1]);
        platform.try_assign_output_port(device(&registry, addresses[3]));
        assert_eq!(platform.port_of(addresses[3]), Some(OutputPort::A));
    }

    #[test]
    fn full_queue_drops_notifications() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut platform = ChannelPlatform::new(tx).with_user_reset(true);

        platform.on_bluetooth_ready();
        platform.on_bluetooth_ready();

        assert!(platform.is_user_reset_requested());
        assert_eq!(platform.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap(), PlatformEvent::BluetoothReady);
    }

    #[test]
    fn reports_carry_state_and_port() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut platform = ChannelPlatform::new(tx);
        let (registry, addresses) = registry_with(&[Some(ControllerFamily::Android)]);
        let device = device(&registry, addresses[0]);

        platform.try_assign_output_port(device);
        platform.on_gamepad_report_ready(device);

        rx.try_recv().unwrap();
        let PlatformEvent::GamepadReport(report) = rx.try_recv().unwrap() else {
            panic!("expected a gamepad report");
        };
        assert_eq!(report.address, addresses[0]);
        assert_eq!(report.port, Some(OutputPort::A));
        assert_eq!(report.family, Some(ControllerFamily::Android));
        assert_eq!(&report.state, device.gamepad());
    }
}
