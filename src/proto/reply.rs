use std::fmt;

use crate::error::DeviceError;
use crate::proto::command::DataKind;

/// Hardware and firmware identification returned by the Version command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceVersion {
    pub product_id: u32,
    pub product_revision: u32,
    pub bootloader_version: u32,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub date: u32,
}

/// Time since the current WSPR transmission run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxTime {
    pub millis: u16,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPayload {
    /// ACK, nothing returned.
    Empty,
    /// Reason a command failed.
    Error(String),
    /// Callsign, locator or any other text value.
    Text(String),
    /// Transmit frequency as stored by the device (MHz × 1_000_000).
    Freq(u64),
    Version(DeviceVersion),
    TxTime(TxTime),
}

impl ReplyPayload {
    /// Interpret a ResponseData body. `data` must be `kind.body_len()` bytes.
    pub fn from_data(kind: DataKind, data: &[u8]) -> Self {
        match kind {
            DataKind::Callsign | DataKind::Locator => ReplyPayload::Text(ascii_field(data)),
            DataKind::TxFreq => ReplyPayload::Freq(le_u64(data)),
            DataKind::Version => ReplyPayload::Version(DeviceVersion {
                product_id: le_u32(&data[0..4]),
                product_revision: le_u32(&data[4..8]),
                bootloader_version: le_u32(&data[8..12]),
                major: le_u32(&data[12..16]),
                minor: le_u32(&data[16..20]),
                patch: le_u32(&data[20..24]),
                date: le_u32(&data[24..28]),
            }),
            DataKind::TxTime => ReplyPayload::TxTime(TxTime {
                millis: u16::from_le_bytes([data[0], data[1]]),
                seconds: data[2],
                minutes: data[3],
                hours: le_u32(&data[4..8]),
            }),
        }
    }
}

/// Fixed-width ASCII field with trailing NUL padding removed.
pub fn ascii_field(data: &[u8]) -> String {
    let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Fixed-width field for a device text slot: truncated or NUL padded to `width`.
pub fn fixed_ascii(text: &str, width: usize) -> Vec<u8> {
    let mut out: Vec<u8> = text.bytes().take(width).collect();
    out.resize(width, 0);
    out
}

/// NUL-terminated ASCII string, as carried by a NACK body.
pub fn c_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).trim().to_string()
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[..8]);
    u64::from_le_bytes(raw)
}

impl fmt::Display for ReplyPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyPayload::Empty => Ok(()),
            ReplyPayload::Error(s) | ReplyPayload::Text(s) => f.write_str(s),
            ReplyPayload::Freq(units) => write!(f, "{}", units),
            ReplyPayload::Version(v) => write!(
                f,
                "product={} rev={} bootloader={} firmware={}.{}.{} date={}",
                v.product_id, v.product_revision, v.bootloader_version, v.major, v.minor, v.patch, v.date
            ),
            ReplyPayload::TxTime(t) => write!(
                f,
                "{}:{:02}:{:02}.{:03}",
                t.hours, t.minutes, t.seconds, t.millis
            ),
        }
    }
}

/// Outcome handed to the command transport: a success flag plus either the
/// value or the error text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub ok: bool,
    pub payload: ReplyPayload,
}

impl Reply {
    pub fn ok(payload: ReplyPayload) -> Self {
        Self { ok: true, payload }
    }

    pub fn err(text: impl Into<String>) -> Self {
        Self {
            ok: false,
            payload: ReplyPayload::Error(text.into()),
        }
    }
}

impl From<Result<ReplyPayload, DeviceError>> for Reply {
    fn from(r: Result<ReplyPayload, DeviceError>) -> Self {
        match r {
            Ok(p) => Reply::ok(p),
            Err(e) => Reply::err(e.to_string()),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = if self.ok { "ok" } else { "error" };
        match &self.payload {
            ReplyPayload::Empty => f.write_str(tag),
            p => write!(f, "{} {}", tag, p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callsign_field_trims_padding() {
        let mut raw = [0u8; 15];
        raw[..5].copy_from_slice(b"G3UKB");
        assert_eq!(
            ReplyPayload::from_data(DataKind::Callsign, &raw),
            ReplyPayload::Text("G3UKB".into())
        );
        assert_eq!(ascii_field(&[0u8; 8]), "");
    }

    #[test]
    fn freq_field_is_little_endian() {
        let raw = 14_097_066u64.to_le_bytes();
        assert_eq!(
            ReplyPayload::from_data(DataKind::TxFreq, &raw),
            ReplyPayload::Freq(14_097_066)
        );
    }

    #[test]
    fn tx_time_fields() {
        let raw = [0xF4, 0x01, 12, 3, 1, 0, 0, 0];
        let p = ReplyPayload::from_data(DataKind::TxTime, &raw);
        match p {
            ReplyPayload::TxTime(t) => {
                assert_eq!((t.hours, t.minutes, t.seconds, t.millis), (1, 3, 12, 500));
            }
            _ => panic!("wrong variant"),
        }
        assert_eq!(p.to_string(), "1:03:12.500");
    }

    #[test]
    fn version_fields() {
        let mut raw = Vec::new();
        for v in [1u32, 1, 1, 1, 0, 4, 20190301] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        match ReplyPayload::from_data(DataKind::Version, &raw) {
            ReplyPayload::Version(v) => {
                assert_eq!((v.major, v.minor, v.patch), (1, 0, 4));
                assert_eq!(v.date, 20190301);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn fixed_ascii_pads_and_truncates() {
        assert_eq!(fixed_ascii("IO91", 8), b"IO91\0\0\0\0".to_vec());
        assert_eq!(fixed_ascii("ABCDEFGHIJ", 8), b"ABCDEFGH".to_vec());
    }

    #[test]
    fn nack_text_stops_at_nul() {
        assert_eq!(c_string(b"Bad variable\0junk"), "Bad variable");
        assert_eq!(c_string(b""), "");
    }

    #[test]
    fn reply_from_result() {
        let r: Reply = Err::<ReplyPayload, _>(DeviceError::Timeout).into();
        assert!(!r.ok);
        assert_eq!(r.to_string(), "error Timeout on read!");

        let r: Reply = Ok(ReplyPayload::Freq(7_040_000)).into();
        assert_eq!(r.to_string(), "ok 7040000");
        assert_eq!(Reply::ok(ReplyPayload::Empty).to_string(), "ok");
    }
}
