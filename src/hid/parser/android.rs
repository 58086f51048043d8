//! Generic gamepads following the Android HID layout.

use super::{hat_to_dpad, log_unsupported, process_axis, process_dpad_usage, process_hat, process_pedal, ReportParser};
use crate::gamepad::{Buttons, GamepadState, MiscButtons, UpdatedFields};
use crate::hid::report::UsageValue;
use crate::hid::usage::{consumer, generic_desktop, generic_device, page, simulation};

pub struct AndroidParser;

impl AndroidParser {
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
            generic_desktop::HAT_SWITCH => {
                gp.set_dpad(hat_to_dpad(process_hat(globals, usage.value)));
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
            0x01 => gp.set_button(Buttons::A, pressed),
            0x02 => gp.set_button(Buttons::B, pressed),
            0x04 => gp.set_button(Buttons::X, pressed),
            0x05 => gp.set_button(Buttons::Y, pressed),
            0x07 => gp.set_button(Buttons::SHOULDER_L, pressed),
            0x08 => gp.set_button(Buttons::SHOULDER_R, pressed),
            // C, Z, shoulder Z and three misc buttons have no counterpart
            0x03 | 0x06 | 0x09..=0x0C => {}
            0x0D => gp.set_misc_button(MiscButtons::SYSTEM, pressed),
            0x0E => gp.set_button(Buttons::THUMB_L, pressed),
            0x0F => gp.set_button(Buttons::THUMB_R, pressed),
            _ => log_unsupported(self.name(), usage),
        }
    }

    fn parse_consumer(&self, gp: &mut GamepadState, usage: &UsageValue) {
        let pressed = usage.value != 0;
        match usage.usage {
            consumer::FAST_FORWARD | consumer::REWIND | consumer::PLAY_PAUSE | consumer::AC_SEARCH => {}
            consumer::AC_HOME => gp.set_misc_button(MiscButtons::HOME, pressed),
            consumer::AC_BACK => gp.set_misc_button(MiscButtons::BACK, pressed),
            _ => log_unsupported(self.name(), usage),
        }
    }
}

impl ReportParser for AndroidParser {
    fn name(&self) -> &'static str {
        "Android"
    }

    fn init_report(&self, gamepad: &mut GamepadState) {
        // Every report carries the full state
        gamepad.clear_updated();
    }

    fn parse_usage(&self, gamepad: &mut GamepadState, usage: &UsageValue) {
        match usage.usage_page {
            page::GENERIC_DESKTOP => self.parse_generic_desktop(gamepad, usage),
            page::SIMULATION_CONTROLS => match usage.usage {
                simulation::ACCELERATOR => {
                    gamepad.accelerator = process_pedal(&usage.globals, usage.value);
                    gamepad.updated |= UpdatedFields::ACCELERATOR;
                }
                simulation::BRAKE => {
                    gamepad.brake = process_pedal(&usage.globals, usage.value);
                    gamepad.updated |= UpdatedFields::BRAKE;
                }
                _ => log_unsupported(self.name(), usage),
            },
            page::GENERIC_DEVICE_CONTROLS if usage.usage == generic_device::BATTERY_STRENGTH => {
                gamepad.battery = usage.value;
                gamepad.updated |= UpdatedFields::BATTERY;
            }
            page::BUTTON => self.parse_button(gamepad, usage),
            page::CONSUMER => self.parse_consumer(gamepad, usage),
            _ => log_unsupported(self.name(), usage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gamepad::Dpad;
    use crate::hid::parser::tests::usage;

    #[test]
    fn init_report_resets_dirty_bits() {
        let parser = AndroidParser;
        let mut gp = GamepadState::default();

        parser.init_report(&mut gp);
        parser.parse_usage(&mut gp, &usage(page::GENERIC_DESKTOP, generic_desktop::X, 0));
        parser.parse_usage(&mut gp, &usage(page::BUTTON, 1, 1));
        assert_eq!(gp.updated, UpdatedFields::AXIS_X | UpdatedFields::BUTTON_A);

        parser.init_report(&mut gp);
        assert!(gp.updated.is_empty());
        parser.parse_usage(&mut gp, &usage(page::BUTTON, 2, 1));
        assert_eq!(gp.updated, UpdatedFields::BUTTON_B);
        assert_eq!(gp.buttons, Buttons::A | Buttons::B);
    }

    #[test]
    fn maps_axes_hat_and_pedals() {
        let parser = AndroidParser;
        let mut gp = GamepadState::default();
        parser.init_report(&mut gp);

        parser.parse_usage(&mut gp, &usage(page::GENERIC_DESKTOP, generic_desktop::X, 0));
        parser.parse_usage(&mut gp, &usage(page::GENERIC_DESKTOP, generic_desktop::Z, 128));
        parser.parse_usage(&mut gp, &usage(page::GENERIC_DESKTOP, generic_desktop::HAT_SWITCH, 3));
        parser.parse_usage(&mut gp, &usage(page::SIMULATION_CONTROLS, simulation::BRAKE, 0));

        assert_eq!(gp.axis_x, -512);
        assert_eq!(gp.axis_rx, 0);
        assert_eq!(gp.dpad, Dpad::RIGHT | Dpad::DOWN);
        assert_eq!(gp.brake, 0);
        assert_eq!(
            gp.updated,
            UpdatedFields::AXIS_X | UpdatedFields::AXIS_RX | UpdatedFields::DPAD | UpdatedFields::BRAKE
        );
    }

    #[test]
    fn unmapped_and_unknown_usages_are_ignored() {
        let parser = AndroidParser;
        let mut gp = GamepadState::default();
        parser.init_report(&mut gp);

        parser.parse_usage(&mut gp, &usage(page::BUTTON, 3, 1));
        parser.parse_usage(&mut gp, &usage(page::BUTTON, 0x20, 1));
        parser.parse_usage(&mut gp, &usage(page::CONSUMER, consumer::PLAY_PAUSE, 1));
        parser.parse_usage(&mut gp, &usage(0xFF00, 1, 1));

        assert_eq!(gp, GamepadState::default());
    }

    #[test]
    fn consumer_and_misc_buttons() {
        let parser = AndroidParser;
        let mut gp = GamepadState::default();
        parser.init_report(&mut gp);

        parser.parse_usage(&mut gp, &usage(page::CONSUMER, consumer::AC_HOME, 1));
        parser.parse_usage(&mut gp, &usage(page::CONSUMER, consumer::AC_BACK, 1));
        parser.parse_usage(&mut gp, &usage(page::BUTTON, 0x0D, 1));
        parser.parse_usage(&mut gp, &usage(page::BUTTON, 0x0F, 1));

        assert_eq!(
            gp.misc_buttons,
            MiscButtons::HOME | MiscButtons::BACK | MiscButtons::SYSTEM
        );
        assert_eq!(gp.buttons, Buttons::THUMB_R);
    }
}
