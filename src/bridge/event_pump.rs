//! Event pump: the task that owns the supervisor
//!
//! # State Machine
//!
//! ```text
//! Waiting ──► Dispatching(InputBatch) ──► Publishing ──► Waiting
//!    │
//!    └── input channel closed / cancelled ──► stop
//! ```
//!
//! Waiting blocks for the first input, then drains whatever else is queued into
//! one batch. Dispatching feeds the batch to the supervisor in arrival order.
//! Publishing pushes fresh device snapshots into the watch channel.

use crate::bluetooth::{BdAddr, BluetoothStack, ConnectionSupervisor, DeviceSnapshot, StackEvent};
use crate::gamepad::LedState;
use crate::platform::Platform;
use chrono::Local;
use statum::{machine, state};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type BoxedSupervisor = ConnectionSupervisor<Box<dyn BluetoothStack + Send>, Box<dyn Platform + Send>>;

/// Everything the pump accepts, on a single ordered channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeInput {
    Event(StackEvent),
    Evict(BdAddr),
    SetLed { address: BdAddr, led: LedState },
}

impl From<StackEvent> for BridgeInput {
    fn from(event: StackEvent) -> Self {
        BridgeInput::Event(event)
    }
}

#[derive(Debug, Clone)]
pub struct InputBatch {
    pub inputs: Vec<BridgeInput>,
}

#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("Failed to initialize event pump: {0}")]
    InitializationError(String),

    #[error("Input channel closed")]
    InputClosed,

    #[error("Event pump cancelled")]
    Cancelled,

    #[error("Event pump task failed: {0}")]
    TaskFailed(String),
}

#[state]
#[derive(Debug, Clone)]
pub enum PumpState {
    Waiting,
    Dispatching(InputBatch),
    Publishing,
}

#[machine]
pub struct EventPump<S: PumpState> {
    input_receiver: mpsc::Receiver<BridgeInput>,

    supervisor: BoxedSupervisor,

    snapshot_sender: watch::Sender<Vec<DeviceSnapshot>>,

    cancel: CancellationToken,

    // Counters since the last stats log
    cycles: u64,
    inputs: u64,
}

impl<S: PumpState> EventPump<S> {
    pub fn subscribe(&self) -> watch::Receiver<Vec<DeviceSnapshot>> {
        self.snapshot_sender.subscribe()
    }

    pub fn supervisor(&self) -> &BoxedSupervisor {
        &self.supervisor
    }

    /// Logs and resets the cycle counters.
    pub fn log_stats(&mut self, elapsed_seconds: i64) {
        let stats = self.supervisor.stats();
        info!(
            "Pump stats: {} cycles, {} inputs in {} seconds",
            self.cycles, self.inputs, elapsed_seconds
        );
        info!(
            "Supervisor: {} events, {} before ready, {} failures, channels {} accepted / {} declined, {} reports decoded, {} discarded, {} devices",
            stats.events,
            stats.ignored_before_ready,
            stats.failures,
            stats.channels_accepted,
            stats.channels_declined,
            stats.reports.decoded,
            stats.reports.discarded,
            self.supervisor.registry().len()
        );
        self.cycles = 0;
        self.inputs = 0;
    }
}

impl EventPump<Waiting> {
    pub fn create(
        input_receiver: mpsc::Receiver<BridgeInput>,
        supervisor: BoxedSupervisor,
        cancel: CancellationToken,
    ) -> Result<Self, PumpError> {
        let (snapshot_sender, _) = watch::channel(supervisor.snapshots());
        debug!("Created watch channel for device snapshots");
        Ok(Self::new(input_receiver, supervisor, snapshot_sender, cancel, 0, 0))
    }

    /// Waits for at least one input, then drains the queue into a batch.
    pub async fn wait_and_collect(mut self) -> Result<EventPump<Dispatching>, PumpError> {
        let first = tokio::select! {
            _ = self.cancel.cancelled() => {
                info!("Event pump cancelled");
                return Err(PumpError::Cancelled);
            }
            input = self.input_receiver.recv() => input.ok_or(PumpError::InputClosed)?,
        };

        let mut inputs = vec![first];
        loop {
            match self.input_receiver.try_recv() {
                Ok(input) => inputs.push(input),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    debug!("Input channel disconnected, dispatching last batch");
                    break;
                }
            }
        }
        debug!("Collected batch of {} inputs", inputs.len());

        Ok(self.transition_with(InputBatch { inputs }))
    }
}

impl EventPump<Dispatching> {
    pub fn dispatch(mut self) -> Result<EventPump<Publishing>, PumpError> {
        let inputs = match self.get_state_data() {
            Some(batch) => batch.inputs.clone(),
            None => {
                warn!("No input batch in state data");
                Vec::new()
            }
        };
        self.inputs += inputs.len() as u64;

        for input in inputs {
            match input {
                BridgeInput::Event(event) => self.supervisor.handle_event(event),
                BridgeInput::Evict(address) => {
                    if let Err(e) = self.supervisor.evict(address) {
                        warn!("Eviction of {} failed: {}", address, e);
                    }
                }
                BridgeInput::SetLed { address, led } => {
                    if let Err(e) = self.supervisor.set_led(address, led) {
                        warn!("LED update for {} failed: {}", address, e);
                    }
                }
            }
        }

        Ok(self.transition())
    }
}

impl EventPump<Publishing> {
    pub fn publish(mut self) -> Result<EventPump<Waiting>, PumpError> {
        let snapshots = self.supervisor.snapshots();
        debug!("Publishing {} device snapshots", snapshots.len());
        self.snapshot_sender.send_replace(snapshots);
        self.cycles += 1;
        Ok(self.transition())
    }
}

/// Runs the pump until every input sender is gone or it is cancelled.
pub async fn run_pump_loop(mut pump: EventPump<Waiting>, stats_interval_secs: u64) -> Result<(), PumpError> {
    let stats_interval = chrono::Duration::seconds(stats_interval_secs as i64);
    let mut last_stats_time = Local::now();

    info!("Entering event pump loop");
    loop {
        let dispatching = match pump.wait_and_collect().await {
            Ok(dispatching) => dispatching,
            Err(PumpError::InputClosed) => {
                info!("All input senders dropped, stopping event pump");
                return Ok(());
            }
            Err(PumpError::Cancelled) => return Ok(()),
            Err(e) => {
                error!("Event pump failed: {}", e);
                return Err(e);
            }
        };
        pump = dispatching.dispatch()?.publish()?;

        let now = Local::now();
        if now - last_stats_time > stats_interval {
            pump.log_stats((now - last_stats_time).num_seconds());
            last_stats_time = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::LifecycleState;
    use crate::bridge::replay::ReplayStack;
    use crate::config::BluetoothConfig;
    use crate::platform::ChannelPlatform;

    fn pump() -> (EventPump<Waiting>, mpsc::Sender<BridgeInput>, CancellationToken) {
        let (input_tx, input_rx) = mpsc::channel(16);
        let (platform_tx, _platform_rx) = mpsc::channel(16);
        let supervisor: BoxedSupervisor = ConnectionSupervisor::new(
            Box::new(ReplayStack::default()),
            Box::new(ChannelPlatform::new(platform_tx)),
            &BluetoothConfig::default(),
        );
        let cancel = CancellationToken::new();
        let pump = EventPump::create(input_rx, supervisor, cancel.clone()).unwrap();
        (pump, input_tx, cancel)
    }

    #[tokio::test]
    async fn one_cycle_dispatches_the_whole_queue() {
        let (pump, input_tx, _cancel) = pump();
        let snapshots = pump.subscribe();
        let address: BdAddr = "AA:BB:CC:DD:EE:FF".parse().unwrap();

        input_tx.send(StackEvent::StackReady.into()).await.unwrap();
        input_tx
            .send(
                StackEvent::InquiryResult {
                    address,
                    page_scan_repetition_mode: 0,
                    clock_offset: 0,
                    class_of_device: 0x002508,
                    name: Some("Pad".to_string()),
                    rssi: None,
                }
                .into(),
            )
            .await
            .unwrap();

        let dispatching = pump.wait_and_collect().await.unwrap();
        assert_eq!(dispatching.get_state_data().map(|b| b.inputs.len()), Some(2));
        let pump = dispatching.dispatch().unwrap().publish().unwrap();

        let published = snapshots.borrow().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].address, address);
        assert_eq!(published[0].state, LifecycleState::Discovered);
        assert!(pump.supervisor().is_ready());
    }

    #[tokio::test]
    async fn loop_stops_when_senders_are_dropped() {
        let (pump, input_tx, _cancel) = pump();
        input_tx.send(StackEvent::StackReady.into()).await.unwrap();
        drop(input_tx);

        run_pump_loop(pump, 30).await.unwrap();
    }

    #[tokio::test]
    async fn loop_stops_on_cancel() {
        let (pump, _input_tx, cancel) = pump();
        cancel.cancel();
        run_pump_loop(pump, 30).await.unwrap();
    }
}
