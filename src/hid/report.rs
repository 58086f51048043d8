//! Usage extraction from input reports.

use super::descriptor::{split_usage, FieldGlobals, FieldKind, ReportDescriptor, MAX_FIELD_BITS};
use super::HidError;
use tracing::{debug, trace};

/// One decoded control value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageValue {
    pub usage_page: u16,
    pub usage: u16,
    pub value: i32,
    pub globals: FieldGlobals,
}

/// Reads `size` bits starting at `bit` (little-endian bit order, as HID lays them out).
fn read_bits(data: &[u8], bit: usize, size: usize) -> u32 {
    (0..size).fold(0u32, |acc, i| {
        let pos = bit + i;
        let set = (data[pos / 8] >> (pos % 8)) & 1;
        acc | (u32::from(set) << i)
    })
}

fn sign_extend(raw: u32, size: u32) -> i32 {
    if size == 0 || size >= 32 {
        return raw as i32;
    }
    let shift = 32 - size;
    ((raw << shift) as i32) >> shift
}

/// Walks `payload` (report data with the transaction header already stripped)
/// and returns every usage it carries, in descriptor order.
pub fn extract_usages(
    descriptor: &ReportDescriptor,
    payload: &[u8],
) -> Result<Vec<UsageValue>, HidError> {
    if payload.is_empty() {
        return Err(HidError::EmptyReport);
    }

    let (report_id, data) = if descriptor.uses_report_ids() {
        let id = payload[0];
        if !descriptor.has_input_report(id) {
            return Err(HidError::UnknownReportId(id));
        }
        (id, &payload[1..])
    } else {
        (0, payload)
    };

    let available_bits = data.len() * 8;
    let mut usages = Vec::new();

    for field in descriptor.fields_for_report(report_id) {
        let size = field.globals.report_size;
        if field.kind == FieldKind::Constant || size == 0 {
            continue;
        }
        if size > MAX_FIELD_BITS {
            trace!("Skipping {}-bit field at bit {}", size, field.bit_offset);
            continue;
        }

        for index in 0..field.report_count {
            let bit = (field.bit_offset + index * size) as usize;
            if bit + size as usize > available_bits {
                debug!(
                    "Report {} truncated: field at bit {} needs {} bits, only {} available",
                    report_id, bit, size, available_bits
                );
                break;
            }

            let raw = read_bits(data, bit, size as usize);
            let value = if field.globals.logical_min < 0 {
                sign_extend(raw, size)
            } else {
                raw as i32
            };

            let extended = match field.kind {
                FieldKind::Variable => field.variable_usage(index),
                FieldKind::Array => field.array_usage(value),
                FieldKind::Constant => None,
            };
            let Some(extended) = extended else {
                continue;
            };
            let (usage_page, usage) = split_usage(extended);

            match field.kind {
                // Empty array slots report usage 0 (or an out of range index).
                FieldKind::Array if usage == 0 => continue,
                FieldKind::Array => usages.push(UsageValue {
                    usage_page,
                    usage,
                    value: 1,
                    globals: field.globals,
                }),
                _ => usages.push(UsageValue {
                    usage_page,
                    usage,
                    value,
                    globals: field.globals,
                }),
            }
        }
    }

    Ok(usages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::descriptor::tests::{GAMEPAD_DESCRIPTOR, KEYBOARD_DESCRIPTOR};
    use crate::hid::usage::{generic_desktop, keyboard, page};

    fn find(usages: &[UsageValue], usage_page: u16, usage: u16) -> Option<i32> {
        usages
            .iter()
            .find(|u| u.usage_page == usage_page && u.usage == usage)
            .map(|u| u.value)
    }

    #[test]
    fn bits_are_read_little_endian() {
        let data = [0b1010_0101, 0b0000_0011];
        assert_eq!(read_bits(&data, 0, 4), 0b0101);
        assert_eq!(read_bits(&data, 4, 4), 0b1010);
        assert_eq!(read_bits(&data, 6, 4), 0b1110);
    }

    #[test]
    fn negative_logical_minimum_sign_extends() {
        assert_eq!(sign_extend(0xFF, 8), -1);
        assert_eq!(sign_extend(0x7F, 8), 127);
        assert_eq!(sign_extend(0b1000, 4), -8);
    }

    #[test]
    fn extracts_gamepad_report() {
        let descriptor = ReportDescriptor::parse(GAMEPAD_DESCRIPTOR).unwrap();
        // id, x, y, z, rz, hat=2 with button 1, button 14
        let payload = [0x01, 0x00, 0xFF, 0x80, 0x7F, 0x12, 0x00, 0x02];
        let usages = extract_usages(&descriptor, &payload).unwrap();

        assert_eq!(find(&usages, page::GENERIC_DESKTOP, generic_desktop::X), Some(0));
        assert_eq!(find(&usages, page::GENERIC_DESKTOP, generic_desktop::Y), Some(255));
        assert_eq!(find(&usages, page::GENERIC_DESKTOP, generic_desktop::Z), Some(128));
        assert_eq!(
            find(&usages, page::GENERIC_DESKTOP, generic_desktop::HAT_SWITCH),
            Some(2)
        );
        assert_eq!(find(&usages, page::BUTTON, 1), Some(1));
        assert_eq!(find(&usages, page::BUTTON, 2), Some(0));
        assert_eq!(find(&usages, page::BUTTON, 14), Some(1));
        // 4 axes + hat + 14 buttons
        assert_eq!(usages.len(), 19);
    }

    #[test]
    fn unknown_report_id_is_rejected() {
        let descriptor = ReportDescriptor::parse(GAMEPAD_DESCRIPTOR).unwrap();
        assert_eq!(
            extract_usages(&descriptor, &[0x07, 0x00]),
            Err(HidError::UnknownReportId(7))
        );
    }

    #[test]
    fn truncated_report_yields_leading_fields_only() {
        let descriptor = ReportDescriptor::parse(GAMEPAD_DESCRIPTOR).unwrap();
        let usages = extract_usages(&descriptor, &[0x01, 0x10, 0x20]).unwrap();
        assert_eq!(usages.len(), 2);
        assert_eq!(find(&usages, page::GENERIC_DESKTOP, generic_desktop::Y), Some(0x20));
    }

    #[test]
    fn keyboard_array_skips_empty_slots() {
        let descriptor = ReportDescriptor::parse(KEYBOARD_DESCRIPTOR).unwrap();
        let payload = [0x00, 0x00, keyboard::W as u8, 0x00, 0x00, 0x00, 0x00, 0x00];
        let usages = extract_usages(&descriptor, &payload).unwrap();

        let keys: Vec<_> = usages
            .iter()
            .filter(|u| u.usage_page == page::KEYBOARD_KEYPAD && u.value == 1)
            .map(|u| u.usage)
            .collect();
        assert_eq!(keys, vec![keyboard::W]);
    }
}
