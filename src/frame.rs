use thiserror::Error;

use crate::proto::command::{Command, MessageType, VariableId};

pub const START: u8 = 0x01;
pub const END: u8 = 0x04;
pub const ESC: u8 = 0x10;
/// Set on a control byte to form its escaped representation.
pub const ESC_BIT: u8 = 0x80;

const CRC_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("missing start marker")]
    NoStart,
    #[error("missing end marker")]
    NoEnd,
    #[error("bad escape sequence 0x{0:02X}")]
    BadEscape(u8),
    #[error("escape at end of frame")]
    DanglingEscape,
    #[error("unescaped control byte 0x{0:02X} inside frame")]
    StrayControl(u8),
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),
    #[error("checksum {actual:08X}!={expected:08X}")]
    Checksum { expected: u32, actual: u32 },
    #[error("unknown message type 0x{0:04X}")]
    UnknownType(u16),
    #[error("unknown variable id 0x{0:04X}")]
    UnknownVariable(u16),
}

pub fn is_control(b: u8) -> bool {
    b == START || b == END || b == ESC
}

/// Standard CRC-32 (IEEE) as used by the device.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

pub fn escape_into(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        if is_control(b) {
            out.push(ESC);
            out.push(b | ESC_BIT);
        } else {
            out.push(b);
        }
    }
}

/// Reverse `escape_into`. The input must not contain the framing markers.
pub fn unescape(bytes: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut it = bytes.iter().copied();
    while let Some(b) = it.next() {
        if b == ESC {
            let n = it.next().ok_or(FrameError::DanglingEscape)?;
            out.push(unescape_byte(n)?);
        } else if is_control(b) {
            return Err(FrameError::StrayControl(b));
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

/// Map the byte following an ESC back to the control byte it stands for.
pub fn unescape_byte(b: u8) -> Result<u8, FrameError> {
    let plain = b & !ESC_BIT;
    if b & ESC_BIT != 0 && is_control(plain) {
        Ok(plain)
    } else {
        Err(FrameError::BadEscape(b))
    }
}

/// Build the transmitted bytes for a command:
/// `START · escape(type ‖ variable ‖ payload ‖ crc32) · END`.
pub fn encode(cmd: &Command) -> Vec<u8> {
    let mut body = cmd.body();
    let crc = checksum(&body);
    body.extend_from_slice(&crc.to_le_bytes());

    let mut out = Vec::with_capacity(body.len() + body.len() / 4 + 2);
    out.push(START);
    escape_into(&body, &mut out);
    out.push(END);
    out
}

/// Parse one complete frame back into a command, verifying the checksum.
pub fn decode(frame: &[u8]) -> Result<Command, FrameError> {
    let inner = frame.strip_prefix(&[START]).ok_or(FrameError::NoStart)?;
    let inner = inner.strip_suffix(&[END]).ok_or(FrameError::NoEnd)?;
    let data = unescape(inner)?;
    if data.len() < 2 + CRC_LEN {
        return Err(FrameError::TooShort(data.len()));
    }

    let (body, crc) = data.split_at(data.len() - CRC_LEN);
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    let actual = checksum(body);
    if actual != expected {
        return Err(FrameError::Checksum { expected, actual });
    }

    let code = u16::from_le_bytes([body[0], body[1]]);
    let msg_type = MessageType::from_code(code).ok_or(FrameError::UnknownType(code))?;
    let mut rest = &body[2..];
    let mut variable = None;
    if msg_type.has_variable() {
        if rest.len() < 2 {
            return Err(FrameError::TooShort(data.len()));
        }
        let code = u16::from_le_bytes([rest[0], rest[1]]);
        variable = Some(VariableId::from_code(code).ok_or(FrameError::UnknownVariable(code))?);
        rest = &rest[2..];
    }

    Ok(Command::new(msg_type, variable, rest.to_vec()))
}

/// Hex dump for frame logging.
pub fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            s.push(' ');
        }
        use std::fmt::Write;
        let _ = write!(s, "{:02X}", b);
    }
    s
}
