use std::time::Duration;

use thiserror::Error;

use crate::model::symbol::{AdsState, PlcKind};

#[derive(Debug, Error)]
pub enum AdsError {
    #[error("invalid AmsNetId `{input}`: format should be 192.168.0.1.1.1:851")]
    BadNetId { input: String },

    #[error("connection failed for `{target}`: {reason}")]
    Connection { target: String, reason: String },

    #[error("ADS state is {state:?}, not Run - check if the PLC is still running")]
    NotRunning { state: AdsState },

    #[error("transport send failed: {reason}")]
    TransportSend { reason: String },

    #[error("transport receive failed: {reason}")]
    TransportReceive { reason: String },

    #[error("transport connection lost")]
    TransportClosed,

    #[error("request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("ADS device error {code:#06x}: {message}")]
    Device { code: u32, message: String },

    #[error("`{name}`: not connected")]
    NotConnected { name: String },

    #[error("`{name}`: symbol is unresolved")]
    Unresolved { name: String },

    #[error("`{name}`: symbol size does not match value size ({symbol}b != {value}b)")]
    SizeMismatch { name: String, symbol: u32, value: u32 },

    #[error("`{name}`: opaque struct symbol; use the read_as/write_as accessors")]
    OpaqueSymbol { name: String },

    #[error("`{name}`: array element access is not supported")]
    ArrayUnsupported { name: String },

    #[error("cannot convert {value} to {kind:?}")]
    Convert { value: String, kind: PlcKind },

    #[error("malformed frame: {reason}")]
    Frame { reason: String },

    #[error("runtime setup failed: {0}")]
    Runtime(String),
}

impl AdsError {
    /// Builds a `Device` error from a raw ADS result code, attaching the
    /// reference message for codes the protocol documents.
    pub(crate) fn device(code: u32) -> Self {
        let message = ads_error_message(code)
            .map(str::to_string)
            .unwrap_or_else(|| format!("ADS error {code:#x}"));
        AdsError::Device { code, message }
    }

    pub(crate) fn frame(reason: impl Into<String>) -> Self {
        AdsError::Frame {
            reason: reason.into(),
        }
    }
}

/// Human-readable message for a raw ADS error code, covering the device
/// (0x700..) and client (0x740..) ranges. Returns `None` for codes the
/// protocol does not document.
pub fn ads_error_message(code: u32) -> Option<&'static str> {
    let message = match code {
        0x700 => "error class <device error>",
        0x701 => "service is not supported by server",
        0x702 => "invalid indexGroup",
        0x703 => "invalid indexOffset",
        0x704 => "reading/writing not permitted",
        0x705 => "parameter size not correct",
        0x706 => "invalid parameter value(s)",
        0x707 => "device is not in a ready state",
        0x708 => "device is busy",
        0x709 => "invalid context (must be InWindows)",
        0x70A => "out of memory",
        0x70B => "invalid parameter value(s)",
        0x70C => "not found (files, ...)",
        0x70D => "syntax error in command or file",
        0x70F => "object already exists",
        0x710 => "symbol not found",
        0x711 => "symbol version invalid",
        0x712 => "server is in invalid state",
        0x713 => "AdsTransMode not supported",
        0x714 => "notification handle is invalid",
        0x715 => "notification client not registered",
        0x716 => "no more notification handles",
        0x717 => "size for watch too big",
        0x718 => "device not initialized",
        0x719 => "device has a timeout",
        0x71A => "query interface failed",
        0x71B => "wrong interface required",
        0x71C => "class ID is invalid",
        0x71D => "object ID is invalid",
        0x71F => "request is aborted",
        0x720 => "signal warning",
        0x721 => "invalid array index",
        0x722 => "symbol not active -> release handle and try again",
        0x723 => "access denied",
        0x724 => "no license found",
        0x725 => "license expired",
        0x726 => "license exceeded",
        0x727 => "license invalid",
        0x728 => "license invalid system id",
        0x729 => "license not time limited",
        0x72A => "license issue time in the future",
        0x72B => "license time period too long",
        0x72C => "exception in device specific code",
        0x72D => "license file read twice",
        0x72F => "invalid public key certificate",
        0x740 => "error class <client error>",
        0x741 => "invalid parameter at service call",
        0x742 => "polling list is empty",
        0x743 => "var connection already in use",
        0x744 => "invoke id in use",
        0x745 => "timeout elapsed",
        0x746 => "error in win32 subsystem",
        0x747 => "unknown error",
        0x748 => "ads port not open",
        0x749 => "no AMS address",
        0x750 => "internal error in ads sync",
        0x751 => "hash table overflow",
        0x752 => "key not found in hash table",
        0x753 => "no more symbols in cache",
        0x754 => "invalid response received",
        0x755 => "sync port is locked",
        _ => return None,
    };

    Some(message)
}
