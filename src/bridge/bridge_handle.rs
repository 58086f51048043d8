use super::event_pump::{run_pump_loop, BoxedSupervisor, BridgeInput, EventPump, PumpError};
use crate::bluetooth::{BdAddr, BluetoothStack, ConnectionSupervisor, DeviceSnapshot, StackEvent};
use crate::config::BridgeConfig;
use crate::gamepad::LedState;
use crate::platform::Platform;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Front door of the bridge runtime
///
/// Owns the sending side of the input channel and the task running the
/// [`EventPump`]. The supervisor itself never leaves that task; callers talk to
/// it only through messages and read it only through snapshots.
///
/// # Example
///
/// ```no_run
/// # async fn demo() -> Result<(), padbridge::bridge::PumpError> {
/// use padbridge::bluetooth::StackEvent;
/// use padbridge::bridge::{replay::ReplayStack, BridgeHandle};
/// use padbridge::config::BridgeConfig;
/// use padbridge::platform::ChannelPlatform;
///
/// let (platform_tx, _platform_rx) = tokio::sync::mpsc::channel(64);
/// let handle = BridgeHandle::spawn(
///     ReplayStack::default(),
///     ChannelPlatform::new(platform_tx),
///     &BridgeConfig::default(),
/// )?;
/// handle.send_event(StackEvent::StackReady).await?;
/// let devices = handle.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct BridgeHandle {
    input_sender: mpsc::Sender<BridgeInput>,
    snapshot_receiver: watch::Receiver<Vec<DeviceSnapshot>>,
    cancel: CancellationToken,
    task_handle: Option<JoinHandle<Result<(), PumpError>>>,
}

impl BridgeHandle {
    pub fn spawn<S, P>(stack: S, platform: P, config: &BridgeConfig) -> Result<Self, PumpError>
    where
        S: BluetoothStack + Send + 'static,
        P: Platform + Send + 'static,
    {
        let capacity = config.runtime.event_queue_capacity;
        if capacity == 0 {
            return Err(PumpError::InitializationError(
                "event queue capacity must be at least 1".to_string(),
            ));
        }

        let supervisor: BoxedSupervisor =
            ConnectionSupervisor::new(Box::new(stack), Box::new(platform), &config.bluetooth);
        let (input_sender, input_receiver) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let pump = EventPump::create(input_receiver, supervisor, cancel.clone())?;
        let snapshot_receiver = pump.subscribe();

        let stats_interval_secs = config.runtime.stats_interval_secs;
        info!("Spawning event pump task");
        let task_handle = tokio::spawn(async move {
            let result = run_pump_loop(pump, stats_interval_secs).await;
            match &result {
                Ok(()) => info!("Event pump task finished"),
                Err(e) => error!("Event pump task terminated with error: {}", e),
            }
            result
        });

        Ok(Self {
            input_sender,
            snapshot_receiver,
            cancel,
            task_handle: Some(task_handle),
        })
    }

    /// Sender for a stack driver that pushes events itself. The pump keeps
    /// running while any clone is alive.
    pub fn input_sender(&self) -> mpsc::Sender<BridgeInput> {
        self.input_sender.clone()
    }

    pub async fn send_event(&self, event: StackEvent) -> Result<(), PumpError> {
        self.send(BridgeInput::Event(event)).await
    }

    pub async fn evict(&self, address: BdAddr) -> Result<(), PumpError> {
        self.send(BridgeInput::Evict(address)).await
    }

    pub async fn set_led(&self, address: BdAddr, led: LedState) -> Result<(), PumpError> {
        self.send(BridgeInput::SetLed { address, led }).await
    }

    async fn send(&self, input: BridgeInput) -> Result<(), PumpError> {
        self.input_sender.send(input).await.map_err(|_| {
            warn!("Event pump is gone, input dropped");
            PumpError::InputClosed
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<DeviceSnapshot>> {
        self.snapshot_receiver.clone()
    }

    /// Latest published snapshots.
    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.snapshot_receiver.borrow().clone()
    }

    /// Lets the pump finish everything already queued, then returns the final
    /// snapshots.
    pub async fn close(self) -> Result<Vec<DeviceSnapshot>, PumpError> {
        let BridgeHandle {
            input_sender,
            snapshot_receiver,
            task_handle,
            ..
        } = self;
        drop(input_sender);
        debug!("Input sender dropped, waiting for event pump");
        if let Some(handle) = task_handle {
            join(handle).await?;
        }
        let snapshots = snapshot_receiver.borrow().clone();
        Ok(snapshots)
    }

    /// Stops the pump without draining the queue.
    pub async fn shutdown(&mut self) -> Result<(), PumpError> {
        debug!("Cancelling event pump");
        self.cancel.cancel();
        match self.task_handle.take() {
            Some(handle) => join(handle).await,
            None => {
                debug!("Event pump already shut down");
                Ok(())
            }
        }
    }
}

async fn join(handle: JoinHandle<Result<(), PumpError>>) -> Result<(), PumpError> {
    match handle.await {
        Ok(result) => result,
        Err(e) => {
            error!("Event pump task panicked: {}", e);
            Err(PumpError::TaskFailed(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::channels::{PSM_HID_CONTROL, PSM_HID_INTERRUPT};
    use crate::bluetooth::sdp::{ATTRIBUTE_HID_DESCRIPTOR_LIST, ATTRIBUTE_PRODUCT_ID, ATTRIBUTE_VENDOR_ID};
    use crate::bluetooth::LifecycleState;
    use crate::bridge::replay::ReplayStack;
    use crate::hid::descriptor::tests::GAMEPAD_DESCRIPTOR;
    use crate::hid::ControllerFamily;
    use crate::platform::{ChannelPlatform, OutputPort, PlatformEvent};

    fn trace(address: BdAddr) -> Vec<StackEvent> {
        let n = GAMEPAD_DESCRIPTOR.len();
        let mut list = vec![0x35, (n + 6) as u8, 0x35, (n + 4) as u8, 0x08, 0x22, 0x25, n as u8];
        list.extend_from_slice(GAMEPAD_DESCRIPTOR);

        let opened = |psm, local_cid| StackEvent::ChannelOpened {
            address,
            psm,
            local_cid,
            handle: 0x0B,
            status: 0,
            incoming: false,
        };
        vec![
            StackEvent::StackReady,
            StackEvent::InquiryResult {
                address,
                page_scan_repetition_mode: 1,
                clock_offset: 0,
                class_of_device: 0x002508,
                name: Some("Pad".to_string()),
                rssi: Some(-50),
            },
            // The replay stack hands out 0x40 for control, 0x41 for interrupt
            opened(PSM_HID_CONTROL, 0x40),
            opened(PSM_HID_INTERRUPT, 0x41),
            StackEvent::SdpAttributeValue {
                attribute_id: ATTRIBUTE_HID_DESCRIPTOR_LIST,
                value: list,
            },
            StackEvent::SdpQueryComplete { status: 0 },
            StackEvent::SdpAttributeValue {
                attribute_id: ATTRIBUTE_VENDOR_ID,
                value: vec![0x09, 0x18, 0xD1],
            },
            StackEvent::SdpAttributeValue {
                attribute_id: ATTRIBUTE_PRODUCT_ID,
                value: vec![0x09, 0x2C, 0x40],
            },
            StackEvent::SdpQueryComplete { status: 0 },
            StackEvent::ChannelData {
                local_cid: 0x41,
                data: vec![0xA1, 0x01, 0x80, 0x80, 0x80, 0x80, 0x18, 0x00, 0x00],
            },
        ]
    }

    #[tokio::test]
    async fn replayed_trace_ends_connected_and_reporting() {
        let address: BdAddr = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let (platform_tx, mut platform_rx) = mpsc::channel(64);
        let handle = BridgeHandle::spawn(
            ReplayStack::default(),
            ChannelPlatform::new(platform_tx),
            &BridgeConfig::default(),
        )
        .unwrap();

        for event in trace(address) {
            handle.send_event(event).await.unwrap();
        }
        let snapshots = handle.close().await.unwrap();

        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].state, LifecycleState::Connected);
        assert_eq!(snapshots[0].family, Some(ControllerFamily::Android));
        assert_eq!(snapshots[0].name.as_deref(), Some("Pad"));

        assert_eq!(platform_rx.recv().await, Some(PlatformEvent::BluetoothReady));
        assert_eq!(
            platform_rx.recv().await,
            Some(PlatformEvent::PortAssigned {
                address,
                port: OutputPort::A
            })
        );
        let Some(PlatformEvent::GamepadReport(report)) = platform_rx.recv().await else {
            panic!("expected a gamepad report");
        };
        assert_eq!(report.address, address);
        // The pump, and with it the platform sender, is gone
        assert_eq!(platform_rx.recv().await, None);
    }

    #[tokio::test]
    async fn shutdown_cancels_a_waiting_pump() {
        let (platform_tx, _platform_rx) = mpsc::channel(4);
        let mut handle = BridgeHandle::spawn(
            ReplayStack::default(),
            ChannelPlatform::new(platform_tx),
            &BridgeConfig::default(),
        )
        .unwrap();

        handle.shutdown().await.unwrap();
        assert!(matches!(
            handle.send_event(StackEvent::StackReady).await,
            Err(PumpError::InputClosed)
        ));
        handle.shutdown().await.unwrap();
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let (platform_tx, _platform_rx) = mpsc::channel(4);
        let mut config = BridgeConfig::default();
        config.runtime.event_queue_capacity = 0;
        assert!(matches!(
            BridgeHandle::spawn(ReplayStack::default(), ChannelPlatform::new(platform_tx), &config),
            Err(PumpError::InitializationError(_))
        ));
    }
}
