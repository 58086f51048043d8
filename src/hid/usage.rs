//! HID usage pages and usages used by the controller families.
//!
//! Values from the USB HID Usage Tables.

pub mod page {
    pub const GENERIC_DESKTOP: u16 = 0x01;
    pub const SIMULATION_CONTROLS: u16 = 0x02;
    pub const GENERIC_DEVICE_CONTROLS: u16 = 0x06;
    pub const KEYBOARD_KEYPAD: u16 = 0x07;
    pub const BUTTON: u16 = 0x09;
    pub const CONSUMER: u16 = 0x0C;
}

pub mod generic_desktop {
    pub const JOYSTICK: u16 = 0x04;
    pub const GAMEPAD: u16 = 0x05;
    pub const KEYBOARD: u16 = 0x06;
    pub const X: u16 = 0x30;
    pub const Y: u16 = 0x31;
    pub const Z: u16 = 0x32;
    pub const RX: u16 = 0x33;
    pub const RY: u16 = 0x34;
    pub const RZ: u16 = 0x35;
    pub const HAT_SWITCH: u16 = 0x39;
    pub const SYSTEM_MAIN_MENU: u16 = 0x85;
    pub const DPAD_UP: u16 = 0x90;
    pub const DPAD_DOWN: u16 = 0x91;
    pub const DPAD_RIGHT: u16 = 0x92;
    pub const DPAD_LEFT: u16 = 0x93;
}

pub mod simulation {
    pub const ACCELERATOR: u16 = 0xC4;
    pub const BRAKE: u16 = 0xC5;
}

pub mod generic_device {
    pub const BATTERY_STRENGTH: u16 = 0x20;
}

pub mod consumer {
    pub const FAST_FORWARD: u16 = 0xB3;
    pub const REWIND: u16 = 0xB4;
    pub const PLAY_PAUSE: u16 = 0xCD;
    pub const AC_SEARCH: u16 = 0x221;
    pub const AC_HOME: u16 = 0x223;
    pub const AC_BACK: u16 = 0x224;
}

/// Keyboard usages the iCade protocol is built on (one key per press/release edge).
pub mod keyboard {
    pub const RESERVED: u16 = 0x00;
    pub const A: u16 = 0x04;
    pub const C: u16 = 0x06;
    pub const D: u16 = 0x07;
    pub const E: u16 = 0x08;
    pub const F: u16 = 0x09;
    pub const G: u16 = 0x0A;
    pub const H: u16 = 0x0B;
    pub const I: u16 = 0x0C;
    pub const J: u16 = 0x0D;
    pub const K: u16 = 0x0E;
    pub const L: u16 = 0x0F;
    pub const M: u16 = 0x10;
    pub const N: u16 = 0x11;
    pub const O: u16 = 0x12;
    pub const P: u16 = 0x13;
    pub const Q: u16 = 0x14;
    pub const R: u16 = 0x15;
    pub const T: u16 = 0x17;
    pub const U: u16 = 0x18;
    pub const V: u16 = 0x19;
    pub const W: u16 = 0x1A;
    pub const X: u16 = 0x1B;
    pub const Y: u16 = 0x1C;
    pub const Z: u16 = 0x1D;
    pub const LEFT_CONTROL: u16 = 0xE0;
    pub const RIGHT_GUI: u16 = 0xE7;
}
