//! HID report descriptor parser
//!
//! Turns the descriptor bytes fetched over SDP into the list of input fields that
//! [`crate::hid::report`] walks for every interrupt-channel payload.
//!
//! Supported: short items, push/pop, report ids, 32-bit extended usages, usage
//! ranges and application collections. Long items are skipped. Output and feature
//! items are parsed for bookkeeping but do not produce fields.

use super::usage::{generic_desktop, page};
use super::HidError;
use std::collections::HashMap;
use tracing::{debug, trace};

const ITEM_TYPE_MAIN: u8 = 0;
const ITEM_TYPE_GLOBAL: u8 = 1;
const ITEM_TYPE_LOCAL: u8 = 2;

const LONG_ITEM_PREFIX: u8 = 0xFE;

mod main_tag {
    pub const INPUT: u8 = 0x8;
    pub const OUTPUT: u8 = 0x9;
    pub const COLLECTION: u8 = 0xA;
    pub const FEATURE: u8 = 0xB;
    pub const END_COLLECTION: u8 = 0xC;
}

mod global_tag {
    pub const USAGE_PAGE: u8 = 0x0;
    pub const LOGICAL_MINIMUM: u8 = 0x1;
    pub const LOGICAL_MAXIMUM: u8 = 0x2;
    pub const REPORT_SIZE: u8 = 0x7;
    pub const REPORT_ID: u8 = 0x8;
    pub const REPORT_COUNT: u8 = 0x9;
    pub const PUSH: u8 = 0xA;
    pub const POP: u8 = 0xB;
}

mod local_tag {
    pub const USAGE: u8 = 0x0;
    pub const USAGE_MINIMUM: u8 = 0x1;
    pub const USAGE_MAXIMUM: u8 = 0x2;
}

const INPUT_FLAG_CONSTANT: u32 = 1 << 0;
const INPUT_FLAG_VARIABLE: u32 = 1 << 1;

const COLLECTION_APPLICATION: u32 = 0x01;

/// Largest field element the report walker can read.
pub const MAX_FIELD_BITS: u32 = 32;

/// Builds a 32-bit extended usage (page in the high half).
pub fn extended_usage(usage_page: u16, usage: u16) -> u32 {
    (u32::from(usage_page) << 16) | u32::from(usage)
}

/// Splits an extended usage into (page, usage).
pub fn split_usage(extended: u32) -> (u16, u16) {
    ((extended >> 16) as u16, (extended & 0xFFFF) as u16)
}

/// Global values a parser needs to interpret a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldGlobals {
    pub logical_min: i32,
    pub logical_max: i32,
    pub report_size: u32,
}

impl FieldGlobals {
    pub fn new(logical_min: i32, logical_max: i32, report_size: u32) -> Self {
        Self {
            logical_min,
            logical_max,
            report_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// One value per usage.
    Variable,
    /// Each element holds the index of an active usage.
    Array,
    /// Padding.
    Constant,
}

/// One input main item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputField {
    pub report_id: u8,
    /// Offset in bits from the start of the report data (after the report id byte).
    pub bit_offset: u32,
    pub report_count: u32,
    pub kind: FieldKind,
    pub usages: Vec<u32>,
    pub usage_range: Option<(u32, u32)>,
    pub globals: FieldGlobals,
}

impl InputField {
    pub fn bit_len(&self) -> u32 {
        self.globals.report_size * self.report_count
    }

    /// Usage of the `index`-th element of a variable field.
    ///
    /// Explicit usages win over a range; the last explicit usage repeats for the
    /// remaining elements.
    pub fn variable_usage(&self, index: u32) -> Option<u32> {
        if let Some(last) = self.usages.last() {
            return Some(*self.usages.get(index as usize).unwrap_or(last));
        }
        let (min, max) = self.usage_range?;
        let usage = min.checked_add(index)?;
        (usage <= max).then_some(usage)
    }

    /// Usage selected by an array element holding `raw`.
    pub fn array_usage(&self, raw: i32) -> Option<u32> {
        let index = raw.checked_sub(self.globals.logical_min)?;
        if index < 0 || raw > self.globals.logical_max {
            return None;
        }
        let index = index as u32;
        if !self.usages.is_empty() {
            return self.usages.get(index as usize).copied();
        }
        let (min, max) = self.usage_range?;
        let usage = min.checked_add(index)?;
        (usage <= max).then_some(usage)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct GlobalState {
    usage_page: u16,
    logical_min: i32,
    logical_max: i32,
    logical_max_unsigned: u32,
    report_size: u32,
    report_count: u32,
    report_id: u8,
}

impl GlobalState {
    fn field_globals(&self) -> FieldGlobals {
        // Some controllers declare e.g. 0..0xFF with a one byte maximum, which reads
        // back as -1 once sign extended.
        let logical_max = if self.logical_max < self.logical_min {
            i32::try_from(self.logical_max_unsigned).unwrap_or(i32::MAX)
        } else {
            self.logical_max
        };
        FieldGlobals::new(self.logical_min, logical_max, self.report_size)
    }
}

#[derive(Debug, Default)]
struct LocalState {
    usages: Vec<u32>,
    usage_min: Option<u32>,
    usage_max: Option<u32>,
}

impl LocalState {
    fn resolve(&self, usage_page: u16, size: usize, value: u32) -> u32 {
        if size == 4 {
            value
        } else {
            extended_usage(usage_page, value as u16)
        }
    }

    fn range(&self) -> Option<(u32, u32)> {
        match (self.usage_min, self.usage_max) {
            (Some(min), Some(max)) if min <= max => Some((min, max)),
            _ => None,
        }
    }
}

struct Item {
    item_type: u8,
    tag: u8,
    size: usize,
    data: u32,
}

impl Item {
    fn signed(&self) -> i32 {
        match self.size {
            1 => self.data as u8 as i8 as i32,
            2 => self.data as u16 as i16 as i32,
            4 => self.data as i32,
            _ => 0,
        }
    }
}

/// Parsed input layout of a HID device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportDescriptor {
    fields: Vec<InputField>,
    uses_report_ids: bool,
    input_report_ids: Vec<u8>,
    applications: Vec<u32>,
}

impl ReportDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self, HidError> {
        let mut descriptor = ReportDescriptor::default();
        let mut global = GlobalState::default();
        let mut global_stack: Vec<GlobalState> = Vec::new();
        let mut local = LocalState::default();
        let mut offsets: HashMap<u8, u32> = HashMap::new();
        let mut depth: usize = 0;

        let mut pos = 0;
        while pos < bytes.len() {
            let prefix = bytes[pos];

            if prefix == LONG_ITEM_PREFIX {
                let size = *bytes
                    .get(pos + 1)
                    .ok_or(HidError::TruncatedDescriptor { offset: pos })?
                    as usize;
                trace!("Skipping long item of {} bytes at {}", size, pos);
                pos += 3 + size;
                continue;
            }

            let size = match prefix & 0x03 {
                0 => 0,
                1 => 1,
                2 => 2,
                _ => 4,
            };
            let data_bytes = bytes
                .get(pos + 1..pos + 1 + size)
                .ok_or(HidError::TruncatedDescriptor { offset: pos })?;
            let data = data_bytes
                .iter()
                .rev()
                .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
            let item = Item {
                item_type: (prefix >> 2) & 0x03,
                tag: prefix >> 4,
                size,
                data,
            };

            match item.item_type {
                ITEM_TYPE_MAIN => {
                    match item.tag {
                        main_tag::INPUT => {
                            let report_id = global.report_id;
                            let offset = offsets.entry(report_id).or_insert(0);
                            let bits = u64::from(global.report_size)
                                * u64::from(global.report_count);
                            if bits > u64::from(u16::MAX) * 8 {
                                return Err(HidError::FieldTooLarge { offset: pos, bits });
                            }

                            let kind = if item.data & INPUT_FLAG_CONSTANT != 0 {
                                FieldKind::Constant
                            } else if item.data & INPUT_FLAG_VARIABLE != 0 {
                                FieldKind::Variable
                            } else {
                                FieldKind::Array
                            };

                            descriptor.fields.push(InputField {
                                report_id,
                                bit_offset: *offset,
                                report_count: global.report_count,
                                kind,
                                usages: std::mem::take(&mut local.usages),
                                usage_range: local.range(),
                                globals: global.field_globals(),
                            });
                            *offset += bits as u32;

                            if !descriptor.input_report_ids.contains(&report_id) {
                                descriptor.input_report_ids.push(report_id);
                            }
                        }
                        main_tag::COLLECTION => {
                            depth += 1;
                            if item.data == COLLECTION_APPLICATION {
                                let usage = local
                                    .usages
                                    .first()
                                    .copied()
                                    .or(local.usage_min);
                                if let Some(usage) = usage {
                                    descriptor.applications.push(usage);
                                }
                            }
                        }
                        main_tag::END_COLLECTION => {
                            if depth == 0 {
                                debug!("End collection without open collection at {}", pos);
                            }
                            depth = depth.saturating_sub(1);
                        }
                        main_tag::OUTPUT | main_tag::FEATURE => {}
                        other => trace!("Ignoring main item tag 0x{:x} at {}", other, pos),
                    }
                    local = LocalState::default();
                }
                ITEM_TYPE_GLOBAL => match item.tag {
                    global_tag::USAGE_PAGE => global.usage_page = item.data as u16,
                    global_tag::LOGICAL_MINIMUM => global.logical_min = item.signed(),
                    global_tag::LOGICAL_MAXIMUM => {
                        global.logical_max = item.signed();
                        global.logical_max_unsigned = item.data;
                    }
                    global_tag::REPORT_SIZE => global.report_size = item.data,
                    global_tag::REPORT_COUNT => global.report_count = item.data,
                    global_tag::REPORT_ID => {
                        global.report_id = item.data as u8;
                        descriptor.uses_report_ids = true;
                    }
                    global_tag::PUSH => global_stack.push(global),
                    global_tag::POP => {
                        global = global_stack
                            .pop()
                            .ok_or(HidError::UnbalancedPop { offset: pos })?;
                    }
                    _ => {}
                },
                ITEM_TYPE_LOCAL => match item.tag {
                    local_tag::USAGE => {
                        let usage = local.resolve(global.usage_page, size, item.data);
                        local.usages.push(usage);
                    }
                    local_tag::USAGE_MINIMUM => {
                        local.usage_min = Some(local.resolve(global.usage_page, size, item.data));
                    }
                    local_tag::USAGE_MAXIMUM => {
                        local.usage_max = Some(local.resolve(global.usage_page, size, item.data));
                    }
                    _ => {}
                },
                _ => trace!("Reserved item type at {}", pos),
            }

            pos += 1 + size;
        }

        if descriptor.fields.is_empty() {
            return Err(HidError::NoInputFields);
        }

        debug!(
            "Parsed report descriptor: {} input fields, report ids {:?}, {} application collections",
            descriptor.fields.len(),
            descriptor.input_report_ids,
            descriptor.applications.len()
        );
        Ok(descriptor)
    }

    pub fn fields(&self) -> &[InputField] {
        &self.fields
    }

    pub fn uses_report_ids(&self) -> bool {
        self.uses_report_ids
    }

    pub fn has_input_report(&self, report_id: u8) -> bool {
        self.input_report_ids.contains(&report_id)
    }

    pub fn fields_for_report(&self, report_id: u8) -> impl Iterator<Item = &InputField> {
        self.fields.iter().filter(move |f| f.report_id == report_id)
    }

    pub fn has_application(&self, usage_page: u16, usage: u16) -> bool {
        self.applications
            .contains(&extended_usage(usage_page, usage))
    }

    pub fn is_gamepad(&self) -> bool {
        self.has_application(page::GENERIC_DESKTOP, generic_desktop::GAMEPAD)
            || self.has_application(page::GENERIC_DESKTOP, generic_desktop::JOYSTICK)
    }

    pub fn is_keyboard(&self) -> bool {
        self.has_application(page::GENERIC_DESKTOP, generic_desktop::KEYBOARD)
    }
}
