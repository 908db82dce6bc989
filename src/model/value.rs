use std::fmt;

use crate::error::AdsError;
use crate::model::symbol::PlcKind;

/// A decoded controller value.
///
/// `Empty` is the invalid/unresolved sentinel every failing accessor returns;
/// callers distinguish success from failure by checking for it or by
/// observing the session's error event stream.
#[derive(Clone, Debug, PartialEq)]
pub enum PlcValue {
    Empty,
    Bool(bool),
    Char8(u8),
    Int16(i16),
    Int32(i32),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
}

impl PlcValue {
    pub fn kind(&self) -> PlcKind {
        match self {
            PlcValue::Empty => PlcKind::Invalid,
            PlcValue::Bool(_) => PlcKind::Bool,
            PlcValue::Char8(_) => PlcKind::Char8,
            PlcValue::Int16(_) => PlcKind::Int16,
            PlcValue::Int32(_) => PlcKind::Int32,
            PlcValue::UInt16(_) => PlcKind::UInt16,
            PlcValue::UInt32(_) => PlcKind::UInt32,
            PlcValue::UInt64(_) => PlcKind::UInt64,
            PlcValue::Float32(_) => PlcKind::Float32,
            PlcValue::Float64(_) => PlcKind::Float64,
            PlcValue::String(_) => PlcKind::String,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, PlcValue::Empty)
    }

    /// Decodes `bytes` as a value of `kind`. Scalars are little-endian;
    /// narrow strings are NUL-terminated Latin-1, wide strings NUL-terminated
    /// UTF-16LE. Extra trailing bytes are ignored.
    pub(crate) fn decode(kind: PlcKind, bytes: &[u8]) -> Result<PlcValue, AdsError> {
        let need = |n: usize| {
            if bytes.len() < n {
                Err(AdsError::frame(format!(
                    "payload too short for {kind:?}: {} < {n} bytes",
                    bytes.len()
                )))
            } else {
                Ok(())
            }
        };

        let value = match kind {
            PlcKind::Bool => {
                need(1)?;
                PlcValue::Bool(bytes[0] != 0)
            }
            PlcKind::Char8 => {
                need(1)?;
                PlcValue::Char8(bytes[0])
            }
            PlcKind::Int16 => {
                need(2)?;
                PlcValue::Int16(i16::from_le_bytes([bytes[0], bytes[1]]))
            }
            PlcKind::UInt16 => {
                need(2)?;
                PlcValue::UInt16(u16::from_le_bytes([bytes[0], bytes[1]]))
            }
            PlcKind::Int32 => {
                need(4)?;
                PlcValue::Int32(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            PlcKind::UInt32 => {
                need(4)?;
                PlcValue::UInt32(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            PlcKind::Float32 => {
                need(4)?;
                PlcValue::Float32(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            PlcKind::UInt64 => {
                need(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                PlcValue::UInt64(u64::from_le_bytes(raw))
            }
            PlcKind::Float64 => {
                need(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                PlcValue::Float64(f64::from_le_bytes(raw))
            }
            PlcKind::String => {
                let text: String = bytes
                    .iter()
                    .take_while(|byte| **byte != 0)
                    .map(|&byte| byte as char)
                    .collect();
                PlcValue::String(text)
            }
            PlcKind::WString => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .take_while(|unit| *unit != 0)
                    .collect();
                PlcValue::String(String::from_utf16_lossy(&units))
            }
            PlcKind::Invalid | PlcKind::Opaque(_) => {
                return Err(AdsError::frame(format!("cannot decode {kind:?} payload")))
            }
        };

        Ok(value)
    }

    /// Encodes the value as exactly `size` bytes of `kind`, zero-padded.
    /// The value must already be converted to `kind` (see [`convert_to`]).
    ///
    /// [`convert_to`]: PlcValue::convert_to
    pub(crate) fn encode(&self, kind: PlcKind, size: u32) -> Result<Vec<u8>, AdsError> {
        let mismatch = || AdsError::Convert {
            value: self.to_string(),
            kind,
        };

        let mut bytes = match (self, kind) {
            (PlcValue::Bool(b), PlcKind::Bool) => vec![u8::from(*b)],
            (PlcValue::Char8(v), PlcKind::Char8) => vec![*v],
            (PlcValue::Int16(v), PlcKind::Int16) => v.to_le_bytes().to_vec(),
            (PlcValue::Int32(v), PlcKind::Int32) => v.to_le_bytes().to_vec(),
            (PlcValue::UInt16(v), PlcKind::UInt16) => v.to_le_bytes().to_vec(),
            (PlcValue::UInt32(v), PlcKind::UInt32) => v.to_le_bytes().to_vec(),
            (PlcValue::UInt64(v), PlcKind::UInt64) => v.to_le_bytes().to_vec(),
            (PlcValue::Float32(v), PlcKind::Float32) => v.to_le_bytes().to_vec(),
            (PlcValue::Float64(v), PlcKind::Float64) => v.to_le_bytes().to_vec(),
            (PlcValue::String(s), PlcKind::String) => {
                let mut raw: Vec<u8> = s
                    .chars()
                    .map(|c| if (c as u32) < 256 { c as u8 } else { b'?' })
                    .collect();
                raw.truncate(size.saturating_sub(1) as usize);
                raw
            }
            (PlcValue::String(s), PlcKind::WString) => {
                let mut raw = Vec::with_capacity(size as usize);
                for unit in s.encode_utf16() {
                    if raw.len() + 2 >= size as usize {
                        break;
                    }
                    raw.extend_from_slice(&unit.to_le_bytes());
                }
                raw
            }
            _ => return Err(mismatch()),
        };

        bytes.resize(size as usize, 0);
        Ok(bytes)
    }

    /// Converts this value to `kind`, applying a total, explicit rule set:
    /// numeric-to-numeric uses Rust `as` cast semantics (float-to-int
    /// saturates, int-to-int truncates), any number converts to `Bool` via
    /// `!= 0`, and strings convert through parse/format. Unconvertible input
    /// is an error, never a silent drop.
    pub fn convert_to(&self, kind: PlcKind) -> Result<PlcValue, AdsError> {
        macro_rules! to_number {
            ($ty:ty, $variant:ident) => {
                match self {
                    PlcValue::Bool(b) => Ok(PlcValue::$variant(u8::from(*b) as $ty)),
                    PlcValue::Char8(v) => Ok(PlcValue::$variant(*v as $ty)),
                    PlcValue::Int16(v) => Ok(PlcValue::$variant(*v as $ty)),
                    PlcValue::Int32(v) => Ok(PlcValue::$variant(*v as $ty)),
                    PlcValue::UInt16(v) => Ok(PlcValue::$variant(*v as $ty)),
                    PlcValue::UInt32(v) => Ok(PlcValue::$variant(*v as $ty)),
                    PlcValue::UInt64(v) => Ok(PlcValue::$variant(*v as $ty)),
                    PlcValue::Float32(v) => Ok(PlcValue::$variant(*v as $ty)),
                    PlcValue::Float64(v) => Ok(PlcValue::$variant(*v as $ty)),
                    PlcValue::String(s) => s
                        .trim()
                        .parse::<$ty>()
                        .map(PlcValue::$variant)
                        .map_err(|_| self.convert_err(kind)),
                    PlcValue::Empty => Err(self.convert_err(kind)),
                }
            };
        }

        match kind {
            PlcKind::Bool => self.to_bool(),
            PlcKind::Char8 => to_number!(u8, Char8),
            PlcKind::Int16 => to_number!(i16, Int16),
            PlcKind::Int32 => to_number!(i32, Int32),
            PlcKind::UInt16 => to_number!(u16, UInt16),
            PlcKind::UInt32 => to_number!(u32, UInt32),
            PlcKind::UInt64 => to_number!(u64, UInt64),
            PlcKind::Float32 => to_number!(f32, Float32),
            PlcKind::Float64 => to_number!(f64, Float64),
            PlcKind::String | PlcKind::WString => self.to_text(kind),
            PlcKind::Invalid | PlcKind::Opaque(_) => Err(self.convert_err(kind)),
        }
    }

    fn to_bool(&self) -> Result<PlcValue, AdsError> {
        let truthy = match self {
            PlcValue::Bool(b) => *b,
            PlcValue::Char8(v) => *v != 0,
            PlcValue::Int16(v) => *v != 0,
            PlcValue::Int32(v) => *v != 0,
            PlcValue::UInt16(v) => *v != 0,
            PlcValue::UInt32(v) => *v != 0,
            PlcValue::UInt64(v) => *v != 0,
            PlcValue::Float32(v) => *v != 0.0,
            PlcValue::Float64(v) => *v != 0.0,
            PlcValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                other => other
                    .parse::<f64>()
                    .map(|v| v != 0.0)
                    .map_err(|_| self.convert_err(PlcKind::Bool))?,
            },
            PlcValue::Empty => return Err(self.convert_err(PlcKind::Bool)),
        };

        Ok(PlcValue::Bool(truthy))
    }

    fn to_text(&self, kind: PlcKind) -> Result<PlcValue, AdsError> {
        match self {
            PlcValue::Empty => Err(self.convert_err(kind)),
            PlcValue::String(s) => Ok(PlcValue::String(s.clone())),
            other => Ok(PlcValue::String(other.to_string())),
        }
    }

    fn convert_err(&self, kind: PlcKind) -> AdsError {
        AdsError::Convert {
            value: self.to_string(),
            kind,
        }
    }
}

impl fmt::Display for PlcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlcValue::Empty => write!(f, "<empty>"),
            PlcValue::Bool(v) => write!(f, "{v}"),
            PlcValue::Char8(v) => write!(f, "{v}"),
            PlcValue::Int16(v) => write!(f, "{v}"),
            PlcValue::Int32(v) => write!(f, "{v}"),
            PlcValue::UInt16(v) => write!(f, "{v}"),
            PlcValue::UInt32(v) => write!(f, "{v}"),
            PlcValue::UInt64(v) => write!(f, "{v}"),
            PlcValue::Float32(v) => write!(f, "{v}"),
            PlcValue::Float64(v) => write!(f, "{v}"),
            PlcValue::String(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for PlcValue {
    fn from(v: bool) -> Self {
        PlcValue::Bool(v)
    }
}

impl From<i16> for PlcValue {
    fn from(v: i16) -> Self {
        PlcValue::Int16(v)
    }
}

impl From<i32> for PlcValue {
    fn from(v: i32) -> Self {
        PlcValue::Int32(v)
    }
}

impl From<u16> for PlcValue {
    fn from(v: u16) -> Self {
        PlcValue::UInt16(v)
    }
}

impl From<u32> for PlcValue {
    fn from(v: u32) -> Self {
        PlcValue::UInt32(v)
    }
}

impl From<u64> for PlcValue {
    fn from(v: u64) -> Self {
        PlcValue::UInt64(v)
    }
}

impl From<f32> for PlcValue {
    fn from(v: f32) -> Self {
        PlcValue::Float32(v)
    }
}

impl From<f64> for PlcValue {
    fn from(v: f64) -> Self {
        PlcValue::Float64(v)
    }
}

impl From<&str> for PlcValue {
    fn from(v: &str) -> Self {
        PlcValue::String(v.to_string())
    }
}

impl From<String> for PlcValue {
    fn from(v: String) -> Self {
        PlcValue::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::PlcValue;
    use crate::model::symbol::PlcKind;

    #[test]
    fn decodes_scalars_little_endian() {
        assert_eq!(
            PlcValue::decode(PlcKind::Int16, &[0x05, 0x00]).unwrap(),
            PlcValue::Int16(5)
        );
        assert_eq!(
            PlcValue::decode(PlcKind::Int16, &[0xFF, 0xFF]).unwrap(),
            PlcValue::Int16(-1)
        );
        assert_eq!(
            PlcValue::decode(PlcKind::UInt32, &[0x01, 0x00, 0x00, 0x80]).unwrap(),
            PlcValue::UInt32(0x8000_0001)
        );
        assert_eq!(
            PlcValue::decode(PlcKind::Float32, &1.5f32.to_le_bytes()).unwrap(),
            PlcValue::Float32(1.5)
        );
        assert_eq!(
            PlcValue::decode(PlcKind::Bool, &[2]).unwrap(),
            PlcValue::Bool(true)
        );
    }

    #[test]
    fn decode_rejects_short_payload() {
        assert!(PlcValue::decode(PlcKind::Float64, &[0; 4]).is_err());
    }

    #[test]
    fn decodes_nul_terminated_strings() {
        assert_eq!(
            PlcValue::decode(PlcKind::String, b"abc\0garbage").unwrap(),
            PlcValue::String("abc".to_string())
        );

        let wide = [b'h', 0, b'i', 0, 0, 0, 0xFF, 0xFF];
        assert_eq!(
            PlcValue::decode(PlcKind::WString, &wide).unwrap(),
            PlcValue::String("hi".to_string())
        );
    }

    #[test]
    fn encode_pads_to_declared_size() {
        let bytes = PlcValue::Int16(5).encode(PlcKind::Int16, 2).unwrap();
        assert_eq!(bytes, vec![0x05, 0x00]);

        let bytes = PlcValue::String("ab".to_string())
            .encode(PlcKind::String, 6)
            .unwrap();
        assert_eq!(bytes, vec![b'a', b'b', 0, 0, 0, 0]);
    }

    #[test]
    fn encode_truncates_oversized_strings() {
        let bytes = PlcValue::String("abcdef".to_string())
            .encode(PlcKind::String, 4)
            .unwrap();
        // room for three characters plus the terminator
        assert_eq!(bytes, vec![b'a', b'b', b'c', 0]);
    }

    #[test]
    fn encode_wide_string_utf16le() {
        let bytes = PlcValue::String("hi".to_string())
            .encode(PlcKind::WString, 8)
            .unwrap();
        assert_eq!(bytes, vec![b'h', 0, b'i', 0, 0, 0, 0, 0]);
    }

    #[test]
    fn numeric_conversion_follows_cast_semantics() {
        // any non-zero number is a true Bool
        assert_eq!(
            PlcValue::Int32(300).convert_to(PlcKind::Bool).unwrap(),
            PlcValue::Bool(true)
        );
        assert_eq!(
            PlcValue::Int32(0).convert_to(PlcKind::Bool).unwrap(),
            PlcValue::Bool(false)
        );

        // float to int saturates
        assert_eq!(
            PlcValue::Float64(1e9).convert_to(PlcKind::Int16).unwrap(),
            PlcValue::Int16(i16::MAX)
        );

        // int to smaller int truncates
        assert_eq!(
            PlcValue::Int32(0x1_0005).convert_to(PlcKind::Int16).unwrap(),
            PlcValue::Int16(5)
        );

        assert_eq!(
            PlcValue::Bool(true).convert_to(PlcKind::Float32).unwrap(),
            PlcValue::Float32(1.0)
        );
    }

    #[test]
    fn string_conversions_parse_and_format() {
        assert_eq!(
            PlcValue::String("12".to_string())
                .convert_to(PlcKind::Int16)
                .unwrap(),
            PlcValue::Int16(12)
        );
        assert_eq!(
            PlcValue::String("true".to_string())
                .convert_to(PlcKind::Bool)
                .unwrap(),
            PlcValue::Bool(true)
        );
        assert_eq!(
            PlcValue::Float32(1.5).convert_to(PlcKind::String).unwrap(),
            PlcValue::String("1.5".to_string())
        );
    }

    #[test]
    fn unconvertible_input_is_an_error() {
        assert!(PlcValue::String("abc".to_string())
            .convert_to(PlcKind::Int16)
            .is_err());
        assert!(PlcValue::Empty.convert_to(PlcKind::Bool).is_err());
        assert!(PlcValue::Int16(1).convert_to(PlcKind::Opaque(8)).is_err());
    }
}
