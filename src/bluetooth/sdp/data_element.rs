//! SDP data elements (Bluetooth Core, Vol 3, Part B, 3)
//!
//! Just enough decoding for the HID descriptor list and the PnP id attributes.
//! Every element is a header byte (type in the upper 5 bits, size index in the
//! lower 3) followed by an optional big-endian length and the payload.

const TYPE_NIL: u8 = 0;
const TYPE_UINT: u8 = 1;
const TYPE_INT: u8 = 2;
const TYPE_UUID: u8 = 3;
const TYPE_TEXT: u8 = 4;
const TYPE_BOOL: u8 = 5;
const TYPE_SEQUENCE: u8 = 6;
const TYPE_ALTERNATIVE: u8 = 7;
const TYPE_URL: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataElementError {
    #[error("Data element truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Unsupported data element type {0}")]
    UnknownType(u8),

    #[error("Expected {expected}, found {found}")]
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataElement<'a> {
    Nil,
    Uint(&'a [u8]),
    Int(&'a [u8]),
    Uuid(&'a [u8]),
    Text(&'a [u8]),
    Bool(bool),
    Sequence(&'a [u8]),
    Alternative(&'a [u8]),
    Url(&'a [u8]),
}

impl<'a> DataElement<'a> {
    /// Decodes the element at the start of `bytes`, returning it and the number
    /// of bytes it occupies.
    pub fn parse(bytes: &'a [u8]) -> Result<(Self, usize), DataElementError> {
        let header = *bytes.first().ok_or(DataElementError::Truncated {
            needed: 1,
            available: 0,
        })?;
        let element_type = header >> 3;
        let size_index = header & 0x07;

        let (header_len, data_len) = match size_index {
            0 if element_type == TYPE_NIL => (1, 0),
            0 => (1, 1),
            1 => (1, 2),
            2 => (1, 4),
            3 => (1, 8),
            4 => (1, 16),
            5 => (2, read_be(bytes, 1, 1)?),
            6 => (3, read_be(bytes, 1, 2)?),
            _ => (5, read_be(bytes, 1, 4)?),
        };

        let end = header_len + data_len;
        let data = bytes.get(header_len..end).ok_or(DataElementError::Truncated {
            needed: end,
            available: bytes.len(),
        })?;

        let element = match element_type {
            TYPE_NIL => DataElement::Nil,
            TYPE_UINT => DataElement::Uint(data),
            TYPE_INT => DataElement::Int(data),
            TYPE_UUID => DataElement::Uuid(data),
            TYPE_TEXT => DataElement::Text(data),
            TYPE_BOOL => DataElement::Bool(data.first().is_some_and(|b| *b != 0)),
            TYPE_SEQUENCE => DataElement::Sequence(data),
            TYPE_ALTERNATIVE => DataElement::Alternative(data),
            TYPE_URL => DataElement::Url(data),
            other => return Err(DataElementError::UnknownType(other)),
        };
        Ok((element, end))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DataElement::Nil => "nil",
            DataElement::Uint(_) => "uint",
            DataElement::Int(_) => "int",
            DataElement::Uuid(_) => "uuid",
            DataElement::Text(_) => "text",
            DataElement::Bool(_) => "bool",
            DataElement::Sequence(_) => "sequence",
            DataElement::Alternative(_) => "alternative",
            DataElement::Url(_) => "url",
        }
    }

    /// Children of a sequence or alternative.
    pub fn children(&self) -> Result<Elements<'a>, DataElementError> {
        match self {
            DataElement::Sequence(body) | DataElement::Alternative(body) => Ok(Elements { rest: body }),
            other => Err(DataElementError::UnexpectedType {
                expected: "sequence",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_u16(&self) -> Result<u16, DataElementError> {
        match self {
            DataElement::Uint(data) if data.len() == 2 => Ok(u16::from_be_bytes([data[0], data[1]])),
            other => Err(DataElementError::UnexpectedType {
                expected: "uint16",
                found: other.type_name(),
            }),
        }
    }
}

fn read_be(bytes: &[u8], at: usize, len: usize) -> Result<usize, DataElementError> {
    let field = bytes.get(at..at + len).ok_or(DataElementError::Truncated {
        needed: at + len,
        available: bytes.len(),
    })?;
    Ok(field.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b)))
}

/// Iterator over the elements of a sequence body.
pub struct Elements<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Elements<'a> {
    type Item = Result<DataElement<'a>, DataElementError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match DataElement::parse(self.rest) {
            Ok((element, used)) => {
                self.rest = &self.rest[used..];
                Some(Ok(element))
            }
            Err(e) => {
                self.rest = &[];
                Some(Err(e))
            }
        }
    }
}

/// Reads a uint16 attribute value (vendor id, product id).
pub fn parse_u16(value: &[u8]) -> Result<u16, DataElementError> {
    let (element, _) = DataElement::parse(value)?;
    element.as_u16()
}

/// Extracts the descriptor strings of a HID descriptor list attribute:
/// a sequence of `(descriptor type, descriptor)` sequences.
///
/// Entries that are not sequences, and members that are not strings, are skipped.
pub fn parse_hid_descriptor_list(value: &[u8]) -> Result<Vec<Vec<u8>>, DataElementError> {
    let (list, _) = DataElement::parse(value)?;
    let mut descriptors = Vec::new();
    for entry in list.children()? {
        let entry = entry?;
        if !matches!(entry, DataElement::Sequence(_)) {
            continue;
        }
        for member in entry.children()? {
            if let DataElement::Text(bytes) = member? {
                descriptors.push(bytes.to_vec());
            }
        }
    }
    Ok(descriptors)
}
