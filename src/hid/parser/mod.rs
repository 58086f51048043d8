//! Controller family parsers
//!
//! Each family maps `(usage page, usage, value)` triples into [`GamepadState`]
//! through its own table. Full-state families (Android, PS4) clear the dirty bits
//! at the start of every report; delta families (iCade) accumulate them.

pub mod android;
pub mod icade;
pub mod ps4;

use super::descriptor::{FieldGlobals, ReportDescriptor};
use super::report::UsageValue;
use super::usage::generic_desktop;
use crate::gamepad::{Dpad, GamepadState, LedState, AXIS_MAX, AXIS_MIN, AXIS_NORMALIZE_RANGE, PEDAL_NORMALIZE_RANGE};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Hat value reported for the "null" (released) position.
pub const HAT_NULL: u8 = 0xFF;

const VENDOR_SONY: u16 = 0x054C;
const PRODUCT_DUALSHOCK4: u16 = 0x05C4;
const PRODUCT_DUALSHOCK4_V2: u16 = 0x09CC;
const VENDOR_ICADE: u16 = 0x15E4;
const PRODUCT_ICADE: u16 = 0x0132;
const VENDOR_8BITTY: u16 = 0x0A5C;
const PRODUCT_8BITTY: u16 = 0x8502;

/// Decoding capabilities of one controller family.
pub trait ReportParser: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once before the usages of a report are parsed.
    fn init_report(&self, gamepad: &mut GamepadState);

    fn parse_usage(&self, gamepad: &mut GamepadState, usage: &UsageValue);

    /// Formats an output report (light bar, rumble) if the family supports one.
    /// The returned bytes are ready to send on the interrupt channel.
    fn update_led(&self, _led: &LedState) -> Option<Vec<u8>> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerFamily {
    Android,
    ICade,
    Ps4,
}

impl ControllerFamily {
    pub fn parser(&self) -> &'static dyn ReportParser {
        match self {
            ControllerFamily::Android => &android::AndroidParser,
            ControllerFamily::ICade => &icade::ICadeParser,
            ControllerFamily::Ps4 => &ps4::Ps4Parser,
        }
    }
}

impl fmt::Display for ControllerFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.parser().name())
    }
}

/// Picks a family from the vendor/product ids, falling back to the descriptor's
/// application collections.
pub fn classify(
    vendor_id: u16,
    product_id: u16,
    descriptor: Option<&ReportDescriptor>,
) -> Option<ControllerFamily> {
    match (vendor_id, product_id) {
        (VENDOR_SONY, PRODUCT_DUALSHOCK4 | PRODUCT_DUALSHOCK4_V2) => {
            return Some(ControllerFamily::Ps4)
        }
        (VENDOR_ICADE, PRODUCT_ICADE) | (VENDOR_8BITTY, PRODUCT_8BITTY) => {
            return Some(ControllerFamily::ICade)
        }
        _ => {}
    }

    if let Some(descriptor) = descriptor {
        if descriptor.is_gamepad() {
            return Some(ControllerFamily::Android);
        }
        if descriptor.is_keyboard() {
            return Some(ControllerFamily::ICade);
        }
    }

    (vendor_id != 0).then_some(ControllerFamily::Android)
}

/// Rescales `value` from the field's logical range into [`AXIS_MIN`, `AXIS_MAX`].
pub fn process_axis(globals: &FieldGlobals, value: i32) -> i32 {
    let min = i64::from(globals.logical_min);
    let mut max = i64::from(globals.logical_max);
    if max < min && globals.report_size > 0 && globals.report_size < 32 {
        max = (1i64 << globals.report_size) - 1;
    }
    let range = max - min + 1;
    if range <= 0 {
        return 0;
    }
    let normalized = (i64::from(value) - range / 2 - min) * AXIS_NORMALIZE_RANGE / range;
    normalized.clamp(i64::from(AXIS_MIN), i64::from(AXIS_MAX)) as i32
}

/// Rescales `value` from the field's logical range into `[0, 1023]`.
pub fn process_pedal(globals: &FieldGlobals, value: i32) -> i32 {
    let min = i64::from(globals.logical_min);
    let range = i64::from(globals.logical_max) - min + 1;
    if range <= 0 {
        return 0;
    }
    let normalized = (i64::from(value) - min) * PEDAL_NORMALIZE_RANGE / range;
    normalized.clamp(0, PEDAL_NORMALIZE_RANGE - 1) as i32
}

/// Hat position relative to the logical minimum, or [`HAT_NULL`] when the value
/// lies outside the logical range.
pub fn process_hat(globals: &FieldGlobals, value: i32) -> u8 {
    if value < globals.logical_min || value > globals.logical_max {
        return HAT_NULL;
    }
    u8::try_from(value - globals.logical_min).unwrap_or(HAT_NULL)
}

pub fn hat_to_dpad(hat: u8) -> Dpad {
    match hat {
        0 => Dpad::UP,
        1 => Dpad::UP | Dpad::RIGHT,
        2 => Dpad::RIGHT,
        3 => Dpad::RIGHT | Dpad::DOWN,
        4 => Dpad::DOWN,
        5 => Dpad::DOWN | Dpad::LEFT,
        6 => Dpad::LEFT,
        7 => Dpad::LEFT | Dpad::UP,
        _ => Dpad::empty(),
    }
}

/// Applies one of the individual D-pad usages. Returns false for any other usage.
pub fn process_dpad_usage(gamepad: &mut GamepadState, usage: u16, value: i32) -> bool {
    let direction = match usage {
        generic_desktop::DPAD_UP => Dpad::UP,
        generic_desktop::DPAD_DOWN => Dpad::DOWN,
        generic_desktop::DPAD_RIGHT => Dpad::RIGHT,
        generic_desktop::DPAD_LEFT => Dpad::LEFT,
        _ => return false,
    };
    gamepad.set_dpad_direction(direction, value != 0);
    true
}

pub(crate) fn log_unsupported(family: &str, usage: &UsageValue) {
    debug!(
        "{}: Unsupported page: 0x{:04x}, usage: 0x{:04x}, value=0x{:x}",
        family, usage.usage_page, usage.usage, usage.value
    );
}
