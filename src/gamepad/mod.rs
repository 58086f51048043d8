//! Canonical gamepad state
//!
//! Every controller family decodes into the same [`GamepadState`]. Consumers read it
//! after each completed report and use [`GamepadState::updated`] to find out which
//! fields the report touched.
//!
//! # Ranges
//!
//! ```text
//! axis_x / axis_y / axis_rx / axis_ry   [-512, 511]   centered at 0
//! brake / accelerator                   [0, 1023]
//! dpad                                  4-bit mask (Dpad)
//! ```

use bitflags::bitflags;

/// Lowest normalized axis value.
pub const AXIS_MIN: i32 = -512;
/// Highest normalized axis value.
pub const AXIS_MAX: i32 = 511;
/// Number of steps in the normalized axis range.
pub const AXIS_NORMALIZE_RANGE: i64 = 1024;
/// Number of steps in the normalized pedal range.
pub const PEDAL_NORMALIZE_RANGE: i64 = 1024;

bitflags! {
    /// Directional pad bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Dpad: u8 {
        const UP = 1 << 0;
        const DOWN = 1 << 1;
        const RIGHT = 1 << 2;
        const LEFT = 1 << 3;
    }
}

bitflags! {
    /// Face, shoulder, trigger and thumb buttons.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Buttons: u16 {
        const A = 1 << 0;
        const B = 1 << 1;
        const X = 1 << 2;
        const Y = 1 << 3;
        const SHOULDER_L = 1 << 4;
        const SHOULDER_R = 1 << 5;
        const TRIGGER_L = 1 << 6;
        const TRIGGER_R = 1 << 7;
        const THUMB_L = 1 << 8;
        const THUMB_R = 1 << 9;
    }
}

bitflags! {
    /// System level buttons (PS / home / back).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MiscButtons: u8 {
        const SYSTEM = 1 << 0;
        const BACK = 1 << 1;
        const HOME = 1 << 2;
    }
}

bitflags! {
    /// Dirty bits for the fields touched by the current report.
    ///
    /// Button bits start at bit 16 and follow the [`Buttons`] order; misc button bits
    /// start at bit 28 and follow the [`MiscButtons`] order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UpdatedFields: u32 {
        const DPAD = 1 << 0;
        const AXIS_X = 1 << 1;
        const AXIS_Y = 1 << 2;
        const AXIS_RX = 1 << 3;
        const AXIS_RY = 1 << 4;
        const BRAKE = 1 << 5;
        const ACCELERATOR = 1 << 6;
        const BATTERY = 1 << 7;

        const BUTTON_A = 1 << 16;
        const BUTTON_B = 1 << 17;
        const BUTTON_X = 1 << 18;
        const BUTTON_Y = 1 << 19;
        const BUTTON_SHOULDER_L = 1 << 20;
        const BUTTON_SHOULDER_R = 1 << 21;
        const BUTTON_TRIGGER_L = 1 << 22;
        const BUTTON_TRIGGER_R = 1 << 23;
        const BUTTON_THUMB_L = 1 << 24;
        const BUTTON_THUMB_R = 1 << 25;

        const MISC_BUTTON_SYSTEM = 1 << 28;
        const MISC_BUTTON_BACK = 1 << 29;
        const MISC_BUTTON_HOME = 1 << 30;
    }
}

impl UpdatedFields {
    const BUTTON_SHIFT: u32 = 16;
    const MISC_SHIFT: u32 = 28;

    pub fn for_buttons(buttons: Buttons) -> Self {
        Self::from_bits_truncate(u32::from(buttons.bits()) << Self::BUTTON_SHIFT)
    }

    pub fn for_misc_buttons(misc: MiscButtons) -> Self {
        Self::from_bits_truncate(u32::from(misc.bits()) << Self::MISC_SHIFT)
    }
}

/// Decoded state of one controller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GamepadState {
    pub dpad: Dpad,
    pub axis_x: i32,
    pub axis_y: i32,
    pub axis_rx: i32,
    pub axis_ry: i32,
    pub brake: i32,
    pub accelerator: i32,
    pub buttons: Buttons,
    pub misc_buttons: MiscButtons,
    pub battery: i32,
    pub updated: UpdatedFields,
}

impl GamepadState {
    /// Sets or clears `button` and marks it as updated.
    pub fn set_button(&mut self, button: Buttons, pressed: bool) {
        self.buttons.set(button, pressed);
        self.updated |= UpdatedFields::for_buttons(button);
    }

    /// Sets or clears a misc button and marks it as updated.
    pub fn set_misc_button(&mut self, button: MiscButtons, pressed: bool) {
        self.misc_buttons.set(button, pressed);
        self.updated |= UpdatedFields::for_misc_buttons(button);
    }

    /// Replaces the whole dpad mask.
    pub fn set_dpad(&mut self, dpad: Dpad) {
        self.dpad = dpad;
        self.updated |= UpdatedFields::DPAD;
    }

    /// Sets or clears a single dpad direction.
    pub fn set_dpad_direction(&mut self, direction: Dpad, pressed: bool) {
        self.dpad.set(direction, pressed);
        self.updated |= UpdatedFields::DPAD;
    }

    pub fn clear_updated(&mut self) {
        self.updated = UpdatedFields::empty();
    }

    /// One line summary for debug logs.
    pub fn summary(&self) -> String {
        format!(
            "dpad=0x{:02x} x={} y={} rx={} ry={} brake={} accel={} buttons=0x{:04x} misc=0x{:02x} battery={} updated=0x{:08x}",
            self.dpad.bits(),
            self.axis_x,
            self.axis_y,
            self.axis_rx,
            self.axis_ry,
            self.brake,
            self.accelerator,
            self.buttons.bits(),
            self.misc_buttons.bits(),
            self.battery,
            self.updated.bits()
        )
    }
}

/// Outbound light bar / rumble request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedState {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub rumble_small: u8,
    pub rumble_large: u8,
    /// Bright phase of a flash, in 10ms units. 0 disables flashing.
    pub flash_on: u8,
    /// Dark phase of a flash, in 10ms units.
    pub flash_off: u8,
}
