//! AMS/TCP framing and ADS command payload pack/unpack.
//!
//! Everything in this module is pure byte work: a 6-byte AMS/TCP header
//! (two reserved bytes plus a length), a 32-byte AMS header, and the fixed
//! little-endian command payloads. The transport layer owns the socket; this
//! layer owns the layout.

use crate::error::AdsError;
use crate::model::symbol::{AmsAddr, SymbolInfo};

pub(crate) const ADS_TCP_PORT: u16 = 48898;

pub(crate) const CMD_READ: u16 = 2;
pub(crate) const CMD_WRITE: u16 = 3;
pub(crate) const CMD_READ_STATE: u16 = 4;
pub(crate) const CMD_ADD_NOTIFICATION: u16 = 6;
pub(crate) const CMD_DEL_NOTIFICATION: u16 = 7;
pub(crate) const CMD_NOTIFICATION: u16 = 8;
pub(crate) const CMD_READ_WRITE: u16 = 9;

pub(crate) const STATE_ADS_REQUEST: u16 = 0x0004;

pub(crate) const IDXGRP_SYM_HNDBYNAME: u32 = 0xF003;
pub(crate) const IDXGRP_SYM_VALBYHND: u32 = 0xF005;
pub(crate) const IDXGRP_SYM_RELEASEHND: u32 = 0xF006;
pub(crate) const IDXGRP_SYM_INFOBYNAMEEX: u32 = 0xF009;
pub(crate) const IDXGRP_DEVICE_DATA: u32 = 0xF100;
pub(crate) const IDXOFFS_DEVDATA_ADSSTATE: u32 = 0;

pub(crate) const TRANSMODE_SERVERCYCLE: u32 = 3;
pub(crate) const TRANSMODE_SERVERONCHA: u32 = 4;

/// Symbol info responses are bounded by the reference client's read buffer.
pub(crate) const SYMBOL_INFO_MAX: u32 = 0xFFFF;

const AMS_HEADER_LEN: usize = 32;

/// Notification cycle/delay times travel in 100 ns units.
pub(crate) fn ms_to_ads_time(ms: u32) -> u32 {
    ms.saturating_mul(10_000)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AmsHeader {
    pub target: AmsAddr,
    pub source: AmsAddr,
    pub command: u16,
    pub state_flags: u16,
    pub error_code: u32,
    pub invoke_id: u32,
}

/// Packs a full AMS/TCP frame: TCP length header, AMS header, payload.
pub(crate) fn frame(header: &AmsHeader, payload: &[u8]) -> Vec<u8> {
    let ams_len = AMS_HEADER_LEN + payload.len();
    let mut out = Vec::with_capacity(6 + ams_len);

    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&(ams_len as u32).to_le_bytes());

    out.extend_from_slice(&header.target.net_id);
    out.extend_from_slice(&header.target.port.to_le_bytes());
    out.extend_from_slice(&header.source.net_id);
    out.extend_from_slice(&header.source.port.to_le_bytes());
    out.extend_from_slice(&header.command.to_le_bytes());
    out.extend_from_slice(&header.state_flags.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&header.error_code.to_le_bytes());
    out.extend_from_slice(&header.invoke_id.to_le_bytes());

    out.extend_from_slice(payload);
    out
}

/// Splits one received AMS packet (everything after the 6-byte TCP header)
/// into its header and payload.
pub(crate) fn parse_packet(bytes: &[u8]) -> Result<(AmsHeader, &[u8]), AdsError> {
    let mut cursor = Cursor::new(bytes);

    let target = AmsAddr {
        net_id: cursor.net_id()?,
        port: cursor.u16()?,
    };
    let source = AmsAddr {
        net_id: cursor.net_id()?,
        port: cursor.u16()?,
    };
    let command = cursor.u16()?;
    let state_flags = cursor.u16()?;
    let data_len = cursor.u32()? as usize;
    let error_code = cursor.u32()?;
    let invoke_id = cursor.u32()?;

    let payload = cursor.rest();
    if payload.len() < data_len {
        return Err(AdsError::frame(format!(
            "AMS payload truncated: {} < {data_len} bytes",
            payload.len()
        )));
    }

    Ok((
        AmsHeader {
            target,
            source,
            command,
            state_flags,
            error_code,
            invoke_id,
        },
        &payload[..data_len],
    ))
}

pub(crate) fn read_request(group: u32, offset: u32, len: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&group.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out
}

pub(crate) fn write_request(group: u32, offset: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + data.len());
    out.extend_from_slice(&group.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

pub(crate) fn read_write_request(group: u32, offset: u32, read_len: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + data.len());
    out.extend_from_slice(&group.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&read_len.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

pub(crate) fn add_notification_request(
    group: u32,
    offset: u32,
    size: u32,
    trans_mode: u32,
    max_delay_ms: u32,
    cycle_ms: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(40);
    out.extend_from_slice(&group.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&trans_mode.to_le_bytes());
    out.extend_from_slice(&ms_to_ads_time(max_delay_ms).to_le_bytes());
    out.extend_from_slice(&ms_to_ads_time(cycle_ms).to_le_bytes());
    out.extend_from_slice(&[0u8; 16]);
    out
}

pub(crate) fn del_notification_request(handle: u32) -> Vec<u8> {
    handle.to_le_bytes().to_vec()
}

/// Read and ReadWrite responses share a layout: result, length, data.
pub(crate) fn parse_read_response(payload: &[u8]) -> Result<Vec<u8>, AdsError> {
    let mut cursor = Cursor::new(payload);
    check_result(cursor.u32()?)?;
    let len = cursor.u32()? as usize;
    let data = cursor.rest();
    if data.len() < len {
        return Err(AdsError::frame(format!(
            "read response truncated: {} < {len} bytes",
            data.len()
        )));
    }
    Ok(data[..len].to_vec())
}

pub(crate) fn parse_write_response(payload: &[u8]) -> Result<(), AdsError> {
    let mut cursor = Cursor::new(payload);
    check_result(cursor.u32()?)
}

pub(crate) fn parse_state_response(payload: &[u8]) -> Result<(u16, u16), AdsError> {
    let mut cursor = Cursor::new(payload);
    check_result(cursor.u32()?)?;
    let ads_state = cursor.u16()?;
    let device_state = cursor.u16()?;
    Ok((ads_state, device_state))
}

pub(crate) fn parse_add_notification_response(payload: &[u8]) -> Result<u32, AdsError> {
    let mut cursor = Cursor::new(payload);
    check_result(cursor.u32()?)?;
    cursor.u32()
}

/// Parses the `AdsSymbolEntry` blob returned for a symbol-info-by-name
/// request: a fixed 30-byte prefix followed by NUL-terminated name, type and
/// comment strings.
pub(crate) fn parse_symbol_entry(data: &[u8]) -> Result<SymbolInfo, AdsError> {
    let mut cursor = Cursor::new(data);
    let _entry_len = cursor.u32()?;
    let group = cursor.u32()?;
    let offset = cursor.u32()?;
    let size = cursor.u32()?;
    let _data_type = cursor.u32()?;
    let _flags = cursor.u32()?;
    let name_len = cursor.u16()? as usize;
    let type_len = cursor.u16()? as usize;
    let comment_len = cursor.u16()? as usize;

    let name = cursor.c_str(name_len)?;
    let symbol_type = cursor.c_str(type_len)?;
    let comment = cursor.c_str(comment_len)?;

    Ok(SymbolInfo {
        group,
        offset,
        size,
        name,
        symbol_type,
        comment,
    })
}

/// One sample lifted out of a device notification stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct NotificationSample {
    pub handle: u32,
    pub timestamp: u64,
    pub data: Vec<u8>,
}

/// Parses an `AdsNotificationStream`: total length, stamp count, then per
/// stamp a Windows FILETIME timestamp and its samples.
pub(crate) fn parse_notification_stream(
    payload: &[u8],
) -> Result<Vec<NotificationSample>, AdsError> {
    let mut cursor = Cursor::new(payload);
    let _total_len = cursor.u32()?;
    let stamps = cursor.u32()?;

    let mut samples = Vec::new();
    for _ in 0..stamps {
        let timestamp = cursor.u64()?;
        let count = cursor.u32()?;
        for _ in 0..count {
            let handle = cursor.u32()?;
            let size = cursor.u32()? as usize;
            let data = cursor.bytes(size)?.to_vec();
            samples.push(NotificationSample {
                handle,
                timestamp,
                data,
            });
        }
    }

    Ok(samples)
}

fn check_result(result: u32) -> Result<(), AdsError> {
    if result == 0 {
        Ok(())
    } else {
        Err(AdsError::device(result))
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], AdsError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        let Some(end) = end else {
            return Err(AdsError::frame(format!(
                "unexpected end of packet at byte {}",
                self.pos
            )));
        };
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, AdsError> {
        let raw = self.bytes(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32, AdsError> {
        let raw = self.bytes(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> Result<u64, AdsError> {
        let raw = self.bytes(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(raw);
        Ok(u64::from_le_bytes(out))
    }

    fn net_id(&mut self) -> Result<[u8; 6], AdsError> {
        let raw = self.bytes(6)?;
        let mut out = [0u8; 6];
        out.copy_from_slice(raw);
        Ok(out)
    }

    /// Reads `len` bytes plus a trailing NUL, lossily decoding as UTF-8.
    fn c_str(&mut self, len: usize) -> Result<String, AdsError> {
        let raw = self.bytes(len)?;
        let text = String::from_utf8_lossy(raw).into_owned();
        self.bytes(1)?;
        Ok(text)
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}
