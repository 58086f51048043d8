//! Interrupt-channel payload dispatch.

use super::descriptor::ReportDescriptor;
use super::parser::ControllerFamily;
use super::report::extract_usages;
use super::HidError;
use crate::gamepad::GamepadState;
use tracing::{debug, trace};

/// DATA | INPUT transaction header carried by every input report.
pub const INPUT_REPORT_HEADER: u8 = 0xA1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The report went through the family parser.
    Decoded { usages: usize },
    Empty,
    NoDescriptor,
    NoFamily,
    NotInputReport(u8),
    Malformed(HidError),
}

impl DispatchOutcome {
    pub fn is_decoded(&self) -> bool {
        matches!(self, DispatchOutcome::Decoded { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub decoded: u64,
    pub discarded: u64,
}

/// Runs the per report cycle: validate, strip the header, extract usages,
/// `init_report`, then `parse_usage` for every usage in descriptor order.
#[derive(Debug, Default)]
pub struct ReportDispatcher {
    stats: DispatchStats,
}

impl ReportDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn dispatch(
        &mut self,
        payload: &[u8],
        descriptor: Option<&ReportDescriptor>,
        family: Option<ControllerFamily>,
        gamepad: &mut GamepadState,
    ) -> DispatchOutcome {
        let outcome = Self::decode(payload, descriptor, family, gamepad);
        if outcome.is_decoded() {
            self.stats.decoded += 1;
        } else {
            self.stats.discarded += 1;
            debug!("Discarding interrupt payload ({} bytes): {:?}", payload.len(), outcome);
        }
        outcome
    }

    fn decode(
        payload: &[u8],
        descriptor: Option<&ReportDescriptor>,
        family: Option<ControllerFamily>,
        gamepad: &mut GamepadState,
    ) -> DispatchOutcome {
        let Some((&header, report)) = payload.split_first() else {
            return DispatchOutcome::Empty;
        };
        let Some(descriptor) = descriptor else {
            return DispatchOutcome::NoDescriptor;
        };
        let Some(family) = family else {
            return DispatchOutcome::NoFamily;
        };
        if header != INPUT_REPORT_HEADER {
            return DispatchOutcome::NotInputReport(header);
        }

        let usages = match extract_usages(descriptor, report) {
            Ok(usages) => usages,
            Err(e) => return DispatchOutcome::Malformed(e),
        };

        let parser = family.parser();
        parser.init_report(gamepad);
        for usage in &usages {
            parser.parse_usage(gamepad, usage);
        }
        trace!("{} report: {}", parser.name(), gamepad.summary());

        DispatchOutcome::Decoded {
            usages: usages.len(),
        }
    }
}
