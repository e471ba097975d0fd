// src/proto/decoder.rs
use std::io::{ErrorKind, Read};

use log::{trace, warn};

use crate::error::DeviceError;
use crate::frame::{self, END, ESC, START};
use crate::proto::command::{Expect, MessageType};
use crate::proto::reply::{ReplyPayload, c_string};

const CRC_LEN: usize = 4;
const NACK_TEXT: &str = "Command returned NACK!";

// Low bytes of the reply types as they appear after START.
const ACK_LO: u8 = MessageType::Ack as u8;
const NACK_ESCAPED: u8 = MessageType::Nack as u8 | frame::ESC_BIT;
const RESP_ESCAPED: u8 = MessageType::ResponseData as u8 | frame::ESC_BIT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Idle,
    AfterStart,
    AfterEsc,
    Ack,
    Nack,
    RespHeader,
    RespData,
    Checksum,
    End,
    Done,
}

/// Incremental decoder for the single reply to one outstanding command.
///
/// Bytes are pushed one at a time with [`ResponseDecoder::feed`]. The
/// message type is matched on raw bytes (NACK and ResponseData start with an
/// escape sequence because their low bytes are control values); everything
/// after it is unescaped before use. A decoder is good for one reply only.
#[derive(Debug)]
pub struct ResponseDecoder {
    expect: Expect,
    state: ResponseState,
    /// The message type high byte has not arrived yet.
    type_hi: bool,
    /// Previous byte was ESC.
    escaped: bool,
    /// Unescaped `type ‖ data`, the checksum input.
    body: Vec<u8>,
    data: Vec<u8>,
    crc: Vec<u8>,
    /// Bytes seen between the checksum and END, only legal after a NACK.
    trailer: Vec<u8>,
    outcome: Option<Result<ReplyPayload, DeviceError>>,
}

impl ResponseDecoder {
    pub fn new(expect: Expect) -> Self {
        Self {
            expect,
            state: ResponseState::Idle,
            type_hi: false,
            escaped: false,
            body: Vec::with_capacity(32),
            data: Vec::new(),
            crc: Vec::with_capacity(CRC_LEN),
            trailer: Vec::new(),
            outcome: None,
        }
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    /// Consume one byte from the wire. Returns `Ok(Some(_))` once END has been
    /// seen, `Ok(None)` while more bytes are needed.
    pub fn feed(&mut self, b: u8) -> Result<Option<ReplyPayload>, DeviceError> {
        match self.state {
            ResponseState::Idle => {
                // anything before START is line noise
                if b == START {
                    self.set_state(ResponseState::AfterStart);
                }
                Ok(None)
            }
            ResponseState::AfterStart => match b {
                ESC => {
                    self.set_state(ResponseState::AfterEsc);
                    Ok(None)
                }
                ACK_LO => {
                    self.body.push(b);
                    self.type_hi = true;
                    self.set_state(ResponseState::Ack);
                    Ok(None)
                }
                _ => Err(self.malformed(format!("unexpected reply type byte 0x{:02X}", b))),
            },
            ResponseState::AfterEsc => match b {
                NACK_ESCAPED => {
                    self.body.push(b & !frame::ESC_BIT);
                    self.type_hi = true;
                    self.set_state(ResponseState::Nack);
                    Ok(None)
                }
                RESP_ESCAPED => {
                    self.body.push(b & !frame::ESC_BIT);
                    self.type_hi = true;
                    self.set_state(ResponseState::RespHeader);
                    Ok(None)
                }
                _ => Err(self.malformed(format!("unexpected escaped reply type 0x{:02X}", b))),
            },
            ResponseState::End if b == END => self.finish(),
            ResponseState::Done => Ok(None),
            _ => {
                if let Some(plain) = self.unescape(b)? {
                    self.on_plain(plain)?;
                }
                Ok(None)
            }
        }
    }

    /// Strip escaping inside the frame body. `Ok(None)` means the byte was an
    /// ESC and the real value comes next.
    fn unescape(&mut self, b: u8) -> Result<Option<u8>, DeviceError> {
        if self.escaped {
            self.escaped = false;
            return frame::unescape_byte(b)
                .map(Some)
                .map_err(|e| self.malformed(e.to_string()));
        }
        match b {
            ESC => {
                self.escaped = true;
                Ok(None)
            }
            START | END => Err(self.malformed(format!(
                "control byte 0x{:02X} in {:?}",
                b, self.state
            ))),
            _ => Ok(Some(b)),
        }
    }

    fn on_plain(&mut self, b: u8) -> Result<(), DeviceError> {
        if self.type_hi {
            self.type_hi = false;
            self.body.push(b);
            return self.settle();
        }
        match self.state {
            ResponseState::RespData => {
                self.data.push(b);
                self.body.push(b);
                if let Expect::Data(kind) = self.expect {
                    if self.data.len() == kind.body_len() {
                        self.outcome = Some(Ok(ReplyPayload::from_data(kind, &self.data)));
                        self.set_state(ResponseState::Checksum);
                    }
                }
                Ok(())
            }
            ResponseState::Checksum => {
                self.crc.push(b);
                if self.crc.len() == CRC_LEN {
                    self.set_state(ResponseState::End);
                }
                Ok(())
            }
            ResponseState::End if self.is_nack() => {
                self.trailer.push(b);
                Ok(())
            }
            ResponseState::End => Err(self.malformed(format!("expected END, got 0x{:02X}", b))),
            other => Err(self.malformed(format!("byte 0x{:02X} in {:?}", b, other))),
        }
    }

    /// Run the states that consume no input once the message type is known.
    fn settle(&mut self) -> Result<(), DeviceError> {
        match self.state {
            ResponseState::Ack => {
                self.outcome = Some(Ok(ReplyPayload::Empty));
                self.set_state(ResponseState::Checksum);
            }
            ResponseState::Nack => {
                self.outcome = Some(Err(DeviceError::Nack(NACK_TEXT.to_string())));
                self.set_state(ResponseState::Checksum);
            }
            ResponseState::RespHeader => match self.expect {
                Expect::Data(_) => self.set_state(ResponseState::RespData),
                Expect::Ack => {
                    return Err(self.malformed("ResponseData for a command without data".into()));
                }
            },
            _ => {}
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<Option<ReplyPayload>, DeviceError> {
        if self.escaped {
            return Err(self.malformed("END inside escape sequence".into()));
        }
        if self.is_nack() && !self.trailer.is_empty() {
            // NACK carried an error string: what we took for the checksum was
            // the start of it, and the real checksum is the last four bytes.
            let mut tail = std::mem::take(&mut self.crc);
            tail.append(&mut self.trailer);
            let split = tail.len() - CRC_LEN;
            self.crc = tail.split_off(split);
            self.body.extend_from_slice(&tail);
            let text = c_string(&tail);
            if !text.is_empty() {
                self.outcome = Some(Err(DeviceError::Nack(text)));
            }
        }

        let expected = u32::from_le_bytes([self.crc[0], self.crc[1], self.crc[2], self.crc[3]]);
        let actual = frame::checksum(&self.body);
        if actual != expected {
            warn!(
                "reply checksum mismatch: got {:08X}, computed {:08X} over [{}]",
                expected,
                actual,
                frame::hex(&self.body)
            );
            self.set_state(ResponseState::Done);
            return Err(DeviceError::Checksum { expected, actual });
        }

        self.set_state(ResponseState::Done);
        match self.outcome.take() {
            Some(Ok(payload)) => Ok(Some(payload)),
            Some(Err(e)) => Err(e),
            None => Err(self.malformed("END before any reply".into())),
        }
    }

    fn is_nack(&self) -> bool {
        matches!(self.outcome, Some(Err(DeviceError::Nack(_))))
    }

    fn set_state(&mut self, next: ResponseState) {
        trace!("decoder {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn malformed(&self, what: String) -> DeviceError {
        warn!("malformed reply ({:?}, expecting {:?}): {}", self.state, self.expect, what);
        DeviceError::Malformed(what)
    }
}

/// Read bytes from `src` until one complete reply for `expect` is decoded.
///
/// `src` is expected to block for at most the port timeout per read; a read
/// that returns nothing within it aborts with [`DeviceError::Timeout`].
pub fn read_reply<R: Read + ?Sized>(src: &mut R, expect: Expect) -> Result<ReplyPayload, DeviceError> {
    let mut dec = ResponseDecoder::new(expect);
    loop {
        let b = read_byte(src)?;
        if let Some(payload) = dec.feed(b)? {
            return Ok(payload);
        }
    }
}

fn read_byte<R: Read + ?Sized>(src: &mut R) -> Result<u8, DeviceError> {
    let mut buf = [0u8; 1];
    loop {
        match src.read(&mut buf) {
            Ok(1) => return Ok(buf[0]),
            // nothing more is coming
            Ok(_) => return Err(DeviceError::Timeout),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                return Err(DeviceError::Timeout);
            }
            Err(e) => return Err(e.into()),
        }
    }
}
