//! DualShock 4 in Bluetooth mode.

use super::{hat_to_dpad, log_unsupported, process_axis, process_dpad_usage, process_hat, process_pedal, ReportParser};
use crate::gamepad::{Buttons, GamepadState, LedState, MiscButtons, UpdatedFields};
use crate::hid::report::UsageValue;
use crate::hid::usage::{generic_desktop, generic_device, page};
use crc::{Crc, CRC_32_ISO_HDLC};

/// DATA | OUTPUT transaction header prefixed to output reports.
pub const OUTPUT_REPORT_HEADER: u8 = 0xA2;
const OUTPUT_REPORT_ID: u8 = 0x11;
const OUTPUT_REPORT_LEN: usize = 78;
// Bytes covered by the trailing checksum, after the header
const OUTPUT_REPORT_CRC_OFFSET: usize = OUTPUT_REPORT_LEN - 4;
const OUTPUT_DATA_OFFSET: usize = 6;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub struct Ps4Parser;

impl Ps4Parser {
    fn parse_generic_desktop(&self, gp: &mut GamepadState, usage: &UsageValue) {
        let globals = &usage.globals;
        match usage.usage {
            generic_desktop::X => {
                gp.axis_x = process_axis(globals, usage.value);
                gp.updated |= UpdatedFields::AXIS_X;
            }
            generic_desktop::Y => {
                gp.axis_y = process_axis(globals, usage.value);
                gp.updated |= UpdatedFields::AXIS_Y;
            }
            generic_desktop::Z => {
                gp.axis_rx = process_axis(globals, usage.value);
                gp.updated |= UpdatedFields::AXIS_RX;
            }
            generic_desktop::RZ => {
                gp.axis_ry = process_axis(globals, usage.value);
                gp.updated |= UpdatedFields::AXIS_RY;
            }
            // Analog L2 / R2
            generic_desktop::RX => {
                gp.brake = process_pedal(globals, usage.value);
                gp.updated |= UpdatedFields::BRAKE;
            }
            generic_desktop::RY => {
                gp.accelerator = process_pedal(globals, usage.value);
                gp.updated |= UpdatedFields::ACCELERATOR;
            }
            generic_desktop::HAT_SWITCH => {
                gp.set_dpad(hat_to_dpad(process_hat(globals, usage.value)));
            }
            generic_desktop::SYSTEM_MAIN_MENU => {
                gp.set_misc_button(MiscButtons::SYSTEM, usage.value != 0);
            }
            other => {
                if !process_dpad_usage(gp, other, usage.value) {
                    log_unsupported(self.name(), usage);
                }
            }
        }
    }

    fn parse_button(&self, gp: &mut GamepadState, usage: &UsageValue) {
        let pressed = usage.value != 0;
        match usage.usage {
            0x01 => gp.set_button(Buttons::X, pressed), // square
            0x02 => gp.set_button(Buttons::A, pressed), // cross
            0x03 => gp.set_button(Buttons::B, pressed), // circle
            0x04 => gp.set_button(Buttons::Y, pressed), // triangle
            0x05 => gp.set_button(Buttons::SHOULDER_L, pressed),
            0x06 => gp.set_button(Buttons::SHOULDER_R, pressed),
            0x07 => gp.set_button(Buttons::TRIGGER_L, pressed),
            0x08 => gp.set_button(Buttons::TRIGGER_R, pressed),
            0x09 => gp.set_misc_button(MiscButtons::BACK, pressed), // share
            0x0A => gp.set_misc_button(MiscButtons::HOME, pressed), // options
            0x0B => gp.set_button(Buttons::THUMB_L, pressed),
            0x0C => gp.set_button(Buttons::THUMB_R, pressed),
            0x0D => gp.set_misc_button(MiscButtons::SYSTEM, pressed),
            // touchpad click
            0x0E => {}
            _ => log_unsupported(self.name(), usage),
        }
    }
}

impl ReportParser for Ps4Parser {
    fn name(&self) -> &'static str {
        "PS4"
    }

    fn init_report(&self, gamepad: &mut GamepadState) {
        gamepad.clear_updated();
    }

    fn parse_usage(&self, gamepad: &mut GamepadState, usage: &UsageValue) {
        match usage.usage_page {
            page::GENERIC_DESKTOP => self.parse_generic_desktop(gamepad, usage),
            page::GENERIC_DEVICE_CONTROLS if usage.usage == generic_device::BATTERY_STRENGTH => {
                gamepad.battery = usage.value;
                gamepad.updated |= UpdatedFields::BATTERY;
            }
            page::BUTTON => self.parse_button(gamepad, usage),
            _ => log_unsupported(self.name(), usage),
        }
    }

    /// Output report 0x11: rumble, light bar color and flash timings, followed by a
    /// CRC-32 over the transaction header and the report body.
    fn update_led(&self, led: &LedState) -> Option<Vec<u8>> {
        let mut report = [0u8; OUTPUT_REPORT_LEN];
        report[0] = OUTPUT_REPORT_ID;
        report[1] = 0xC0; // HID + CRC, poll rate
        report[3] = 0x07; // enable rumble, light bar and flash

        let data = [
            led.rumble_small,
            led.rumble_large,
            led.red,
            led.green,
            led.blue,
            led.flash_on,
            led.flash_off,
        ];
        report[OUTPUT_DATA_OFFSET..OUTPUT_DATA_OFFSET + data.len()].copy_from_slice(&data);

        let mut digest = CRC32.digest();
        digest.update(&[OUTPUT_REPORT_HEADER]);
        digest.update(&report[..OUTPUT_REPORT_CRC_OFFSET]);
        let crc = digest.finalize();
        report[OUTPUT_REPORT_CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());

        let mut packet = Vec::with_capacity(OUTPUT_REPORT_LEN + 1);
        packet.push(OUTPUT_REPORT_HEADER);
        packet.extend_from_slice(&report);
        Some(packet)
    }
}
