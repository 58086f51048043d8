//! HID report decoding
//!
//! Turns interrupt-channel payloads into [`crate::gamepad::GamepadState`] updates:
//!
//! 1. [`descriptor`] - report descriptor parsing (done once per device)
//! 2. [`report`] - usage extraction from a single input report
//! 3. [`parser`] - per controller family usage tables
//! 4. [`dispatcher`] - payload validation and the per report cycle
//!
//! ```text
//! payload ──► Dispatcher ──► extract_usages ──► ReportParser ──► GamepadState
//!            (0xA1 check)    (descriptor)       (family table)
//! ```

pub mod descriptor;
pub mod dispatcher;
pub mod parser;
pub mod report;
pub mod usage;

pub use descriptor::{FieldGlobals, ReportDescriptor};
pub use dispatcher::{DispatchOutcome, ReportDispatcher};
pub use parser::{ControllerFamily, ReportParser};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HidError {
    #[error("Report descriptor truncated at byte {offset}")]
    TruncatedDescriptor { offset: usize },

    #[error("Report field at byte {offset} is too large ({bits} bits)")]
    FieldTooLarge { offset: usize, bits: u64 },

    #[error("Pop item without matching push at byte {offset}")]
    UnbalancedPop { offset: usize },

    #[error("Report descriptor declares no input fields")]
    NoInputFields,

    #[error("Input report id {0} is not declared by the descriptor")]
    UnknownReportId(u8),

    #[error("Input report is empty")]
    EmptyReport,
}
