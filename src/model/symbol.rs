use std::fmt;
use std::str::FromStr;

use crate::error::AdsError;

/// AMS routing address of a controller: six-byte NetId plus an ADS port.
///
/// Parsed from the textual `"b0.b1.b2.b3.b4.b5:port"` form, e.g.
/// `"192.168.0.1.1.1:851"` for the first PLC runtime on a default route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AmsAddr {
    pub net_id: [u8; 6],
    pub port: u16,
}

impl FromStr for AmsAddr {
    type Err = AdsError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let bad = || AdsError::BadNetId {
            input: input.to_string(),
        };

        let (net_part, port_part) = input.split_once(':').ok_or_else(bad)?;
        let port = port_part.parse::<u16>().map_err(|_| bad())?;

        let mut net_id = [0u8; 6];
        let mut octets = net_part.split('.');
        for byte in &mut net_id {
            *byte = octets
                .next()
                .and_then(|octet| octet.parse::<u8>().ok())
                .ok_or_else(bad)?;
        }
        if octets.next().is_some() {
            return Err(bad());
        }

        Ok(AmsAddr { net_id, port })
    }
}

impl fmt::Display for AmsAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [b0, b1, b2, b3, b4, b5] = self.net_id;
        write!(f, "{b0}.{b1}.{b2}.{b3}.{b4}.{b5}:{}", self.port)
    }
}

/// Controller run state as reported by `ReadState` and the device-state
/// notification. Only `Run` is accepted for a live session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdsState {
    Invalid,
    Idle,
    Reset,
    Init,
    Start,
    Run,
    Stop,
    SaveCfg,
    LoadCfg,
    PowerFail,
    PowerGood,
    Error,
    Shutdown,
    Suspend,
    Resume,
    Config,
    Reconfig,
    Unknown(u16),
}

impl AdsState {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => AdsState::Invalid,
            1 => AdsState::Idle,
            2 => AdsState::Reset,
            3 => AdsState::Init,
            4 => AdsState::Start,
            5 => AdsState::Run,
            6 => AdsState::Stop,
            7 => AdsState::SaveCfg,
            8 => AdsState::LoadCfg,
            9 => AdsState::PowerFail,
            10 => AdsState::PowerGood,
            11 => AdsState::Error,
            12 => AdsState::Shutdown,
            13 => AdsState::Suspend,
            14 => AdsState::Resume,
            15 => AdsState::Config,
            16 => AdsState::Reconfig,
            other => AdsState::Unknown(other),
        }
    }

    pub fn is_run(&self) -> bool {
        matches!(self, AdsState::Run)
    }
}

/// Symbol metadata as reported by the controller's symbol table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SymbolInfo {
    pub group: u32,
    pub offset: u32,
    pub size: u32,
    pub name: String,
    pub symbol_type: String,
    pub comment: String,
}

/// Decoded semantic type of a symbol value.
///
/// `Invalid` marks an unresolved or disconnected handle. `Opaque` marks a
/// symbol accessed through the fixed-size typed-blob path (struct types).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlcKind {
    Invalid,
    Bool,
    Char8,
    Int16,
    Int32,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    String,
    WString,
    Opaque(u32),
}

impl PlcKind {
    /// Byte length of a scalar value of this kind; strings and opaque blobs
    /// take their length from the symbol metadata instead.
    pub fn scalar_len(&self) -> Option<u32> {
        match self {
            PlcKind::Bool | PlcKind::Char8 => Some(1),
            PlcKind::Int16 | PlcKind::UInt16 => Some(2),
            PlcKind::Int32 | PlcKind::UInt32 | PlcKind::Float32 => Some(4),
            PlcKind::UInt64 | PlcKind::Float64 => Some(8),
            _ => None,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, PlcKind::String | PlcKind::WString)
    }
}

/// Array span of a symbol type: start index and element count.
///
/// Element count 1 is a plain scalar. `WSTRING` reports a synthetic count of
/// 2 to select 16-bit string decoding; this is a width convention inherited
/// from the symbol table format, not a real two-element array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArraySpan {
    pub start: i32,
    pub count: u32,
}

impl ArraySpan {
    const SCALAR: ArraySpan = ArraySpan { start: 0, count: 1 };
    const WIDE: ArraySpan = ArraySpan { start: 0, count: 2 };
}

/// Maps a controller type string plus reported byte size to a value kind.
///
/// Exact names are matched first, then string-like prefixes, then `ARRAY`
/// types recurse into their element type. An unrecognized name falls back to
/// a size-based guess (1 -> Bool, 2 -> Int16, 4 -> Float32, 8 -> Float64).
pub fn kind_for(symbol_type: &str, size: u32) -> PlcKind {
    match symbol_type {
        "INT" => return PlcKind::Int16,
        "DINT" => return PlcKind::Int32,
        "UDINT" => return PlcKind::UInt32,
        "UINT" => return PlcKind::UInt16,
        "BYTE" => return PlcKind::Char8,
        "BOOL" => return PlcKind::Bool,
        "REAL" => return PlcKind::Float32,
        "LREAL" => return PlcKind::Float64,
        "WORD" => return PlcKind::UInt16,
        "LWORD" => return PlcKind::UInt64,
        _ => {}
    }

    if symbol_type.starts_with("WSTRING") {
        return PlcKind::WString;
    }
    if symbol_type.starts_with("STRING") || symbol_type.ends_with("T_MaxString") {
        return PlcKind::String;
    }

    // e.g. ARRAY [1..12] OF REAL; only resolvable for native element types
    if symbol_type.starts_with("ARRAY") {
        if let Some(element) = array_element_type(symbol_type) {
            return kind_for(element, 0);
        }
        return PlcKind::Invalid;
    }

    match size {
        1 => PlcKind::Bool,
        2 => PlcKind::Int16,
        4 => PlcKind::Float32,
        8 => PlcKind::Float64,
        _ => PlcKind::Invalid,
    }
}

/// Array span for a symbol type string; see [`ArraySpan`] for the string
/// width convention.
pub fn array_span(symbol_type: &str) -> ArraySpan {
    if symbol_type.starts_with("ARRAY") {
        return array_bounds(symbol_type)
            .map(|(start, end)| ArraySpan {
                start,
                count: (end - start + 1).max(0) as u32,
            })
            .unwrap_or(ArraySpan::SCALAR);
    }

    if symbol_type.starts_with("WSTRING") {
        return ArraySpan::WIDE;
    }

    ArraySpan::SCALAR
}

fn array_bounds(symbol_type: &str) -> Option<(i32, i32)> {
    let open = symbol_type.find('[')?;
    let close = symbol_type[open..].find(']')? + open;
    let (start, end) = symbol_type[open + 1..close].split_once("..")?;
    let start = start.trim().parse::<i32>().ok()?;
    let end = end.trim().parse::<i32>().ok()?;
    Some((start, end))
}

fn array_element_type(symbol_type: &str) -> Option<&str> {
    let (_, element) = symbol_type.split_once(" OF ")?;
    Some(element.trim())
}
