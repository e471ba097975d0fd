use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use log::{debug, trace, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::cli::SerialOpts;
use crate::error::DeviceError;
use crate::frame;
use crate::proto::command::Expect;
use crate::proto::decoder::read_reply;
use crate::proto::reply::ReplyPayload;

pub const BAUD: u32 = 1_000_000;
/// Per-byte read deadline while waiting for a reply.
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Byte channel to the device. `discard_input` drops anything left over
/// from an earlier, abandoned exchange.
pub trait Link: Read + Write + Send {
    fn discard_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Link for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

pub fn open_port(opts: &SerialOpts) -> Result<Box<dyn SerialPort>> {
    let builder = serialport::new(&opts.dev, BAUD)
        .timeout(READ_TIMEOUT)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::Two)
        // RTS is not wired on the device and CTS is unreliable; the real
        // flow control is one command in flight at a time.
        .flow_control(if opts.rtscts {
            FlowControl::Hardware
        } else {
            FlowControl::None
        });

    builder
        .open()
        .map_err(|e| anyhow::anyhow!("open {}: {}", opts.dev, e))
}

pub fn list_ports() -> Vec<String> {
    serialport::available_ports()
        .map(|v| v.into_iter().map(|p| p.port_name).collect())
        .unwrap_or_default()
}

/// Shared handle to the device link. Every exchange holds the lock from the
/// first byte written until the reply is fully consumed, so commands issued
/// from different threads never overlap on the wire.
pub struct SharedLink<L: Link> {
    inner: Arc<Mutex<L>>,
}

impl<L: Link> Clone for SharedLink<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: Link> SharedLink<L> {
    pub fn new(link: L) -> Self {
        Self {
            inner: Arc::new(Mutex::new(link)),
        }
    }

    /// Send one already-encoded frame and decode its reply.
    pub fn transact(&self, wire: &[u8], expect: Expect) -> Result<ReplyPayload, DeviceError> {
        let mut link = self.lock();
        if let Err(e) = link.discard_input() {
            warn!("could not flush stale input: {}", e);
        }
        debug!("-> {}", frame::hex(wire));
        link.write_all(wire)?;
        link.flush()?;
        let reply = read_reply(&mut *link, expect);
        trace!("<- {:?}", reply);
        reply
    }

    fn lock(&self) -> MutexGuard<'_, L> {
        // a panic mid-exchange leaves nothing to repair; the next exchange
        // discards stale input anyway
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}
