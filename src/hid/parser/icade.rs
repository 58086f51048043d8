//! iCade cabinets and compatible pads.
//!
//! These present themselves as keyboards and send one key per edge:
//!
//! ```text
//!  ↑      A C Y L
//! ← →
//!  ↓      B X Z R
//!
//! UP  on/off = w/e     A on/off = y/t  (button A)
//! RT  on/off = d/c     B on/off = h/r  (button B)
//! DN  on/off = x/z     C on/off = u/f  (button X)
//! LT  on/off = a/q     X on/off = j/n  (button Y)
//! L   on/off = o/g     (system)
//! Y, Z, R              unmapped
//! ```
//!
//! Reports are deltas, so the dirty bits are never reset between reports.

use super::{log_unsupported, ReportParser};
use crate::gamepad::{Buttons, Dpad, GamepadState, MiscButtons};
use crate::hid::report::UsageValue;
use crate::hid::usage::{keyboard, page};

pub struct ICadeParser;

enum KeyAction {
    Direction(Dpad, bool),
    Button(Buttons, bool),
    Misc(MiscButtons, bool),
    Ignore,
}

fn key_action(usage: u16) -> Option<KeyAction> {
    let action = match usage {
        keyboard::W => KeyAction::Direction(Dpad::UP, true),
        keyboard::E => KeyAction::Direction(Dpad::UP, false),
        keyboard::D => KeyAction::Direction(Dpad::RIGHT, true),
        keyboard::C => KeyAction::Direction(Dpad::RIGHT, false),
        keyboard::X => KeyAction::Direction(Dpad::DOWN, true),
        keyboard::Z => KeyAction::Direction(Dpad::DOWN, false),
        keyboard::A => KeyAction::Direction(Dpad::LEFT, true),
        keyboard::Q => KeyAction::Direction(Dpad::LEFT, false),
        keyboard::Y => KeyAction::Button(Buttons::A, true),
        keyboard::T => KeyAction::Button(Buttons::A, false),
        keyboard::H => KeyAction::Button(Buttons::B, true),
        keyboard::R => KeyAction::Button(Buttons::B, false),
        keyboard::U => KeyAction::Button(Buttons::X, true),
        keyboard::F => KeyAction::Button(Buttons::X, false),
        keyboard::J => KeyAction::Button(Buttons::Y, true),
        keyboard::N => KeyAction::Button(Buttons::Y, false),
        keyboard::O => KeyAction::Misc(MiscButtons::SYSTEM, true),
        keyboard::G => KeyAction::Misc(MiscButtons::SYSTEM, false),
        keyboard::I | keyboard::M | keyboard::K | keyboard::P | keyboard::L | keyboard::V => KeyAction::Ignore,
        keyboard::RESERVED => KeyAction::Ignore,
        keyboard::LEFT_CONTROL..=keyboard::RIGHT_GUI => KeyAction::Ignore,
        _ => return None,
    };
    Some(action)
}

impl ReportParser for ICadeParser {
    fn name(&self) -> &'static str {
        "iCade"
    }

    fn init_report(&self, _gamepad: &mut GamepadState) {}

    fn parse_usage(&self, gamepad: &mut GamepadState, usage: &UsageValue) {
        if usage.usage_page != page::KEYBOARD_KEYPAD {
            log_unsupported(self.name(), usage);
            return;
        }
        // Released bitmap keys carry no edge
        if usage.value == 0 {
            return;
        }

        match key_action(usage.usage) {
            Some(KeyAction::Direction(direction, on)) => gamepad.set_dpad_direction(direction, on),
            Some(KeyAction::Button(button, on)) => gamepad.set_button(button, on),
            Some(KeyAction::Misc(button, on)) => gamepad.set_misc_button(button, on),
            Some(KeyAction::Ignore) => {}
            None => log_unsupported(self.name(), usage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gamepad::UpdatedFields;
    use crate::hid::parser::tests::usage;

    fn key(code: u16) -> UsageValue {
        usage(page::KEYBOARD_KEYPAD, code, 1)
    }

    #[test]
    fn dirty_bits_accumulate_across_reports() {
        let parser = ICadeParser;
        let mut gp = GamepadState::default();

        parser.init_report(&mut gp);
        parser.parse_usage(&mut gp, &key(keyboard::W));
        parser.init_report(&mut gp);
        parser.parse_usage(&mut gp, &key(keyboard::Y));
        parser.init_report(&mut gp);
        parser.parse_usage(&mut gp, &key(keyboard::O));

        assert_eq!(
            gp.updated,
            UpdatedFields::DPAD | UpdatedFields::BUTTON_A | UpdatedFields::MISC_BUTTON_SYSTEM
        );
        assert_eq!(gp.dpad, Dpad::UP);
        assert_eq!(gp.buttons, Buttons::A);
        assert_eq!(gp.misc_buttons, MiscButtons::SYSTEM);
    }

    #[test]
    fn on_and_off_keys_pair_up() {
        let parser = ICadeParser;
        let mut gp = GamepadState::default();

        for code in [keyboard::D, keyboard::X, keyboard::H, keyboard::U, keyboard::J] {
            parser.parse_usage(&mut gp, &key(code));
        }
        assert_eq!(gp.dpad, Dpad::RIGHT | Dpad::DOWN);
        assert_eq!(gp.buttons, Buttons::B | Buttons::X | Buttons::Y);

        for code in [keyboard::C, keyboard::Z, keyboard::R, keyboard::F, keyboard::N] {
            parser.parse_usage(&mut gp, &key(code));
        }
        assert_eq!(gp.dpad, Dpad::empty());
        assert_eq!(gp.buttons, Buttons::empty());
    }

    #[test]
    fn modifiers_reserved_and_unmapped_keys_are_ignored() {
        let parser = ICadeParser;
        let mut gp = GamepadState::default();

        for code in [keyboard::RESERVED, keyboard::LEFT_CONTROL, 0xE3, keyboard::RIGHT_GUI, keyboard::I, keyboard::V] {
            parser.parse_usage(&mut gp, &key(code));
        }
        parser.parse_usage(&mut gp, &usage(page::KEYBOARD_KEYPAD, keyboard::W, 0));
        parser.parse_usage(&mut gp, &usage(page::BUTTON, 1, 1));

        assert_eq!(gp, GamepadState::default());
    }
}
