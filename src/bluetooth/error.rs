use super::address::BdAddr;
use super::device::LifecycleState;
use super::registry::DeviceId;
use super::stack::StatusCode;
use super::sdp::data_element::DataElementError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("No free device slots (capacity {capacity})")]
    SlotsExhausted { capacity: usize },

    #[error("Device slot {0:?} is empty")]
    VacantSlot(DeviceId),

    #[error("Device {0} is already registered")]
    AlreadyRegistered(BdAddr),

    #[error("Unknown device {0}")]
    UnknownDevice(BdAddr),

    #[error("Another SDP query is in progress for {holder}")]
    QueryBusy { holder: BdAddr },

    #[error("SDP attribute 0x{attribute_id:04x} needs {length} bytes, limit is {limit}")]
    AttributeOverflow {
        attribute_id: u16,
        length: usize,
        limit: usize,
    },

    #[error("SDP event received without a query target")]
    NoQueryTarget,

    #[error("Malformed SDP attribute 0x{attribute_id:04x}: {source}")]
    MalformedAttribute {
        attribute_id: u16,
        #[source]
        source: DataElementError,
    },

    #[error("SDP query returned no attribute 0x{0:04x}")]
    MissingAttribute(u16),

    #[error("Invalid lifecycle transition for {address}: {from:?} -> {to:?}")]
    InvalidTransition {
        address: BdAddr,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Device {0} has no open interrupt channel")]
    ChannelNotOpen(BdAddr),

    #[error("Stack error: {0}")]
    Stack(#[from] StatusCode),
}
