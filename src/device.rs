use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use crate::band;
use crate::error::DeviceError;
use crate::frame;
use crate::port::{Link, SharedLink};
use crate::proto::command::{Command, DeviceMode, VariableId};
use crate::proto::reply::{DeviceVersion, Reply, ReplyPayload, TxTime};
use crate::scheduler::{Clock, TxEdge, TxScheduler};

/// Receives the outcome of every scheduled start/stop transaction.
pub type TxListener = Arc<dyn Fn(TxEdge, Reply) + Send + Sync>;

/// Where the transmit state machine stands, as seen from this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Idle,
    WaitStart,
    TxCycling,
    WaitStop,
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TxStatus::Idle => "IDLE",
            TxStatus::WaitStart => "WAIT-START",
            TxStatus::TxCycling => "TX-CYCLING",
            TxStatus::WaitStop => "WAIT-STOP",
        })
    }
}

/// Closed set of operations the transport can ask for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operation {
    GetCallsign,
    GetLocator,
    GetFreq,
    /// Frequency in MHz.
    SetFreq(f64),
    /// Band as wavelength in metres.
    SetBand(u16),
    SetTx,
    SetIdle,
    Cancel,
    GetStatus,
    GetVersion,
    GetTxTime,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::GetCallsign => "get-callsign",
            Operation::GetLocator => "get-locator",
            Operation::GetFreq => "get-freq",
            Operation::SetFreq(_) => "set-freq",
            Operation::SetBand(_) => "set-band",
            Operation::SetTx => "set-tx",
            Operation::SetIdle => "set-idle",
            Operation::Cancel => "cancel",
            Operation::GetStatus => "get-status",
            Operation::GetVersion => "get-version",
            Operation::GetTxTime => "get-tx-time",
        }
    }
}

/// Operation set exposed to the command transport.
///
/// Reads and writes run on the caller's thread. Start and stop frames are
/// built up front and sent from the scheduler thread once the WSPR cycle
/// lines up; the outcome goes to the [`TxListener`].
pub struct Device<L: Link + 'static> {
    link: SharedLink<L>,
    scheduler: TxScheduler,
    /// Last settled state, `Idle` or `TxCycling`. Only completed start/stop
    /// transactions change it.
    settled: Arc<Mutex<TxStatus>>,
    listener: TxListener,
}

impl<L: Link + 'static> Device<L> {
    pub fn new(link: L, clock: Arc<dyn Clock>, listener: TxListener) -> Self {
        Self {
            link: SharedLink::new(link),
            scheduler: TxScheduler::spawn(clock),
            settled: Arc::new(Mutex::new(TxStatus::Idle)),
            listener,
        }
    }

    pub fn get_callsign(&self) -> Result<String, DeviceError> {
        into_text(self.exchange(&Command::read(VariableId::WsprCallsign))?)
    }

    pub fn get_locator(&self) -> Result<String, DeviceError> {
        into_text(self.exchange(&Command::read(VariableId::WsprLocator))?)
    }

    /// Transmit frequency as the device stores it, MHz × 1_000_000.
    pub fn get_freq(&self) -> Result<u64, DeviceError> {
        match self.exchange(&Command::read(VariableId::WsprTxFreq))? {
            ReplyPayload::Freq(units) => Ok(units),
            other => Err(unexpected("frequency", &other)),
        }
    }

    pub fn get_version(&self) -> Result<DeviceVersion, DeviceError> {
        match self.exchange(&Command::version())? {
            ReplyPayload::Version(v) => Ok(v),
            other => Err(unexpected("version", &other)),
        }
    }

    pub fn get_tx_time(&self) -> Result<TxTime, DeviceError> {
        match self.exchange(&Command::wspr_time())? {
            ReplyPayload::TxTime(t) => Ok(t),
            other => Err(unexpected("tx time", &other)),
        }
    }

    /// Write the transmit frequency. `mhz` is scaled by 1_000_000 and
    /// truncated, so 14.097066 is stored as 14097066.
    pub fn set_freq(&self, mhz: f64) -> Result<(), DeviceError> {
        if !mhz.is_finite() || mhz <= 0.0 {
            return Err(DeviceError::InvalidFrequency(mhz));
        }
        let units = (mhz * 1_000_000.0) as u64;
        debug!("set_freq {} MHz -> {}", mhz, units);
        self.exchange(&Command::write_tx_freq(units))?;
        Ok(())
    }

    /// Move to a random frequency inside `band`'s WSPR window and return
    /// what the device reports back.
    pub fn set_band(&self, band: u16) -> Result<u64, DeviceError> {
        let mhz = band::random_freq(band, &mut rand::thread_rng())
            .ok_or(DeviceError::UnknownBand(band))?;
        info!("{}m band: moving to {:.6} MHz", band, mhz);
        self.set_freq(mhz)?;
        let units = self.get_freq()?;
        let confirmed = units as f64 / 1_000_000.0;
        if band::find_band(confirmed).map(|l| l.band) != Some(band) {
            warn!("device reports {:.6} MHz, outside the {}m window", confirmed, band);
        }
        Ok(units)
    }

    /// Start WSPR transmission at the next cycle start. Returns once the
    /// request is queued; the device reply goes to the listener.
    pub fn set_tx(&self) -> Result<(), DeviceError> {
        let cmd = Command::set_mode(DeviceMode::WsprActive);
        self.schedule(TxEdge::Start, cmd)
    }

    /// Stop transmission (device reset) after the current cycle ends.
    pub fn set_idle(&self) -> Result<(), DeviceError> {
        self.schedule(TxEdge::Stop, Command::reset())
    }

    /// Abandon the start or stop currently being waited for. The status
    /// falls back to the last settled state; queued requests stay queued.
    pub fn cancel(&self) {
        if !self.scheduler.is_waiting() {
            debug!("cancel with no wait in progress");
            return;
        }
        if let Some(edge) = self.scheduler.active_edge() {
            info!("cancelling {} wait, back to {}", edge, *lock(&self.settled));
        }
        self.scheduler.cancel();
    }

    /// The wait being served if there is one, else the last settled state.
    pub fn status(&self) -> TxStatus {
        match self.scheduler.active_edge() {
            Some(TxEdge::Start) => TxStatus::WaitStart,
            Some(TxEdge::Stop) => TxStatus::WaitStop,
            None => *lock(&self.settled),
        }
    }

    /// Stop the scheduler thread. Pending start/stop requests are dropped.
    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
    }

    /// Run one operation. Scheduled operations that were queued return
    /// `None`; their result arrives through the listener.
    pub fn dispatch(&self, op: Operation) -> Option<Reply> {
        debug!("dispatch {:?}", op);
        let result = match op {
            Operation::GetCallsign => self.get_callsign().map(ReplyPayload::Text),
            Operation::GetLocator => self.get_locator().map(ReplyPayload::Text),
            Operation::GetFreq => self.get_freq().map(ReplyPayload::Freq),
            Operation::SetFreq(mhz) => self.set_freq(mhz).map(|_| ReplyPayload::Empty),
            Operation::SetBand(band) => self.set_band(band).map(ReplyPayload::Freq),
            Operation::GetVersion => self.get_version().map(ReplyPayload::Version),
            Operation::GetTxTime => self.get_tx_time().map(ReplyPayload::TxTime),
            Operation::SetTx => match self.set_tx() {
                Ok(()) => return None,
                Err(e) => Err(e),
            },
            Operation::SetIdle => match self.set_idle() {
                Ok(()) => return None,
                Err(e) => Err(e),
            },
            Operation::Cancel => {
                self.cancel();
                Ok(ReplyPayload::Empty)
            }
            Operation::GetStatus => Ok(ReplyPayload::Text(self.status().to_string())),
        };
        if let Err(e) = &result {
            if e.is_protocol() {
                warn!("{} failed: {}", op.name(), e);
            } else {
                debug!("{} failed: {}", op.name(), e);
            }
        }
        Some(result.into())
    }

    fn exchange(&self, cmd: &Command) -> Result<ReplyPayload, DeviceError> {
        self.link.transact(&frame::encode(cmd), cmd.expect())
    }

    fn schedule(&self, edge: TxEdge, cmd: Command) -> Result<(), DeviceError> {
        let wire = frame::encode(&cmd);
        let expect = cmd.expect();
        let link = self.link.clone();
        let settled = Arc::clone(&self.settled);
        let listener = Arc::clone(&self.listener);

        let action = Box::new(move || {
            let result = link.transact(&wire, expect);
            let next = match (edge, result.is_ok()) {
                (TxEdge::Start, true) => TxStatus::TxCycling,
                (TxEdge::Start, false) => TxStatus::Idle,
                (TxEdge::Stop, true) => TxStatus::Idle,
                // a failed reset leaves the device transmitting
                (TxEdge::Stop, false) => TxStatus::TxCycling,
            };
            *lock(&settled) = next;
            let reply = Reply::from(result);
            info!("{} transaction: {}, status {}", edge, reply, next);
            listener(edge, reply);
        });

        let queued = match edge {
            TxEdge::Start => self.scheduler.wait_start(action),
            TxEdge::Stop => self.scheduler.wait_stop(action),
        };
        if let Err(e) = queued {
            warn!("{} request rejected: {}", edge, e);
            return Err(e.into());
        }
        Ok(())
    }
}

fn lock(status: &Mutex<TxStatus>) -> MutexGuard<'_, TxStatus> {
    status.lock().unwrap_or_else(|p| p.into_inner())
}

fn into_text(payload: ReplyPayload) -> Result<String, DeviceError> {
    match payload {
        ReplyPayload::Text(s) => Ok(s),
        other => Err(unexpected("text", &other)),
    }
}

fn unexpected(wanted: &str, got: &ReplyPayload) -> DeviceError {
    DeviceError::Malformed(format!("expected {} reply, got {:?}", wanted, got))
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use chrono::Timelike;

    use super::*;
    use crate::frame::encode;
    use crate::port::testing::MockDevice;
    use crate::proto::command::MessageType;
    use crate::proto::reply::fixed_ascii;
    use crate::scheduler::QUEUE_DEPTH;
    use crate::scheduler::testing::{SimClock, wait_until};

    fn ack() -> Vec<u8> {
        encode(&Command::new(MessageType::Ack, None, vec![]))
    }

    fn nack(text: &str) -> Vec<u8> {
        let mut body = text.as_bytes().to_vec();
        body.push(0);
        encode(&Command::new(MessageType::Nack, None, body))
    }

    fn data(body: &[u8]) -> Vec<u8> {
        encode(&Command::new(MessageType::ResponseData, None, body.to_vec()))
    }

    fn quiet() -> TxListener {
        Arc::new(|_, _| {})
    }

    fn device(clock: SimClock) -> (Device<MockDevice>, MockDevice) {
        let mock = MockDevice::new();
        (Device::new(mock.clone(), Arc::new(clock), quiet()), mock)
    }

    #[test]
    fn reads_callsign_and_locator() {
        let (dev, mock) = device(SimClock::at(12, 0, 30, 0));
        mock.push_reply(data(&fixed_ascii("G3UKB", 15)));
        mock.push_reply(data(&fixed_ascii("IO91", 8)));

        assert_eq!(dev.get_callsign().unwrap(), "G3UKB");
        assert_eq!(dev.get_locator().unwrap(), "IO91");
        assert_eq!(
            mock.received(),
            vec![
                Command::read(VariableId::WsprCallsign),
                Command::read(VariableId::WsprLocator)
            ]
        );
    }

    #[test]
    fn set_freq_scales_to_integer_units() {
        let (dev, mock) = device(SimClock::at(12, 0, 30, 0));
        mock.push_reply(ack());
        dev.set_freq(14.097066).unwrap();

        let sent = mock.received();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type, MessageType::Write);
        assert_eq!(sent[0].variable, Some(VariableId::WsprTxFreq));
        assert_eq!(sent[0].payload, 14_097_066u64.to_le_bytes().to_vec());
    }

    #[test]
    fn get_freq_returns_device_units() {
        let (dev, mock) = device(SimClock::at(12, 0, 30, 0));
        mock.push_reply(data(&14_097_066u64.to_le_bytes()));
        assert_eq!(dev.get_freq().unwrap(), 14_097_066);
    }

    #[test]
    fn set_freq_rejects_nonsense_without_io() {
        let (dev, mock) = device(SimClock::at(12, 0, 30, 0));
        for f in [0.0, -7.04, f64::NAN, f64::INFINITY] {
            assert!(matches!(dev.set_freq(f), Err(DeviceError::InvalidFrequency(_))));
        }
        assert!(mock.received().is_empty());
    }

    #[test]
    fn nack_is_reported_with_device_text() {
        let (dev, mock) = device(SimClock::at(12, 0, 30, 0));
        mock.push_reply(nack("Frequency out of range"));
        let reply = dev.dispatch(Operation::SetFreq(99.0)).unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.to_string(), "error Frequency out of range");
    }

    #[test]
    fn silent_device_reports_timeout() {
        let (dev, _mock) = device(SimClock::at(12, 0, 30, 0));
        let reply = dev.dispatch(Operation::GetCallsign).unwrap();
        assert_eq!(reply, Reply::err("Timeout on read!"));
    }

    #[test]
    fn set_band_writes_in_band_then_rereads() {
        let (dev, mock) = device(SimClock::at(12, 0, 30, 0));
        mock.push_reply(ack());
        mock.push_reply(data(&7_039_000u64.to_le_bytes()));

        assert_eq!(dev.set_band(40).unwrap(), 7_039_000);

        let sent = mock.received();
        assert_eq!(sent.len(), 2);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&sent[0].payload);
        let mhz = u64::from_le_bytes(raw) as f64 / 1e6;
        let l = band::limits(40).unwrap();
        assert!(mhz >= l.lower && mhz <= l.upper, "{} outside 40m", mhz);
        assert_eq!(sent[1], Command::read(VariableId::WsprTxFreq));
    }

    #[test]
    fn set_band_unknown_band() {
        let (dev, mock) = device(SimClock::at(12, 0, 30, 0));
        assert!(matches!(dev.set_band(11), Err(DeviceError::UnknownBand(11))));
        assert!(mock.received().is_empty());
    }

    #[test]
    fn get_version_and_tx_time() {
        let (dev, mock) = device(SimClock::at(12, 0, 30, 0));
        let mut raw = Vec::new();
        for v in [1u32, 1, 1, 1, 0, 4, 20190301] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        mock.push_reply(data(&raw));
        mock.push_reply(data(&[0, 0, 30, 2, 0, 0, 0, 0]));

        assert_eq!(dev.get_version().unwrap().patch, 4);
        let t = dev.get_tx_time().unwrap();
        assert_eq!((t.hours, t.minutes, t.seconds, t.millis), (0, 2, 30, 0));
        let sent = mock.received();
        assert_eq!(sent[0].msg_type, MessageType::Version);
        assert_eq!(sent[1].msg_type, MessageType::WsprGetTime);
    }

    #[test]
    fn set_tx_sends_at_cycle_start_and_notifies() {
        let clock = Arc::new(SimClock::at(12, 1, 30, 0).with_pause(Duration::from_millis(1)));
        let mock = MockDevice::new();
        mock.push_reply(ack());
        let (tx, rx) = mpsc::channel();
        let c = Arc::clone(&clock);
        let listener: TxListener = Arc::new(move |edge, reply| {
            let t = c.now();
            tx.send((edge, reply, t.minute(), t.second())).unwrap();
        });
        let dev = Device::new(mock.clone(), clock.clone(), listener);

        assert_eq!(dev.dispatch(Operation::SetTx), None);
        assert!(wait_until(Duration::from_secs(5), || dev.status() == TxStatus::WaitStart));

        let (edge, reply, min, sec) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(edge, TxEdge::Start);
        assert!(reply.ok);
        assert_eq!((min, sec), (2, 1));
        assert_eq!(mock.received(), vec![Command::set_mode(DeviceMode::WsprActive)]);
        assert!(wait_until(Duration::from_secs(5), || dev.status() == TxStatus::TxCycling));
    }

    #[test]
    fn set_idle_failure_goes_to_listener() {
        let clock = Arc::new(SimClock::at(12, 3, 50, 0));
        let mock = MockDevice::new();
        mock.push_reply(nack("Busy"));
        let (tx, rx) = mpsc::channel();
        let listener: TxListener = Arc::new(move |edge, reply| {
            tx.send((edge, reply)).unwrap();
        });
        let dev = Device::new(mock.clone(), clock, listener);

        dev.set_idle().unwrap();
        let (edge, reply) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(edge, TxEdge::Stop);
        assert_eq!(reply, Reply::err("Busy"));
        assert_eq!(mock.received(), vec![Command::reset()]);
        assert!(wait_until(Duration::from_secs(5), || dev.status() == TxStatus::TxCycling));
    }

    #[test]
    fn cancel_reverts_status_and_sends_nothing() {
        let clock = Arc::new(SimClock::at(12, 1, 30, 0).with_pause(Duration::from_millis(1)));
        clock.freeze(true);
        let mock = MockDevice::new();
        let dev = Device::new(mock.clone(), clock, quiet());

        dev.set_tx().unwrap();
        assert!(wait_until(Duration::from_secs(5), || dev.scheduler.is_waiting()));
        assert_eq!(dev.status(), TxStatus::WaitStart);
        let reply = dev.dispatch(Operation::Cancel).unwrap();
        assert!(reply.ok);
        assert!(wait_until(Duration::from_secs(5), || dev.status() == TxStatus::Idle));
        assert!(!dev.scheduler.is_waiting());
        assert!(mock.received().is_empty());
    }

    #[test]
    fn queued_stop_does_not_mask_cancelled_start() {
        let clock = Arc::new(SimClock::at(12, 1, 30, 0).with_pause(Duration::from_millis(1)));
        clock.freeze(true);
        let mock = MockDevice::new();
        let dev = Device::new(mock.clone(), clock, quiet());

        dev.set_tx().unwrap();
        assert!(wait_until(Duration::from_secs(5), || dev.scheduler.is_waiting()));
        dev.set_idle().unwrap();
        assert_eq!(dev.status(), TxStatus::WaitStart);

        dev.cancel();
        // the queued stop becomes the active wait; nothing was ever sent
        assert!(wait_until(Duration::from_secs(5), || dev.status() == TxStatus::WaitStop));
        assert!(mock.received().is_empty());

        assert!(wait_until(Duration::from_secs(5), || dev.scheduler.is_waiting()));
        dev.cancel();
        assert!(wait_until(Duration::from_secs(5), || dev.status() == TxStatus::Idle));
        assert!(mock.received().is_empty());
    }

    #[test]
    fn full_queue_is_reported_and_active_wait_kept() {
        let clock = Arc::new(SimClock::at(12, 1, 30, 0).with_pause(Duration::from_millis(1)));
        clock.freeze(true);
        let dev = Device::new(MockDevice::new(), clock, quiet());

        dev.set_tx().unwrap();
        assert!(wait_until(Duration::from_secs(5), || dev.scheduler.is_waiting()));
        for _ in 0..QUEUE_DEPTH {
            dev.set_idle().unwrap();
        }
        assert_eq!(dev.status(), TxStatus::WaitStart);
        let reply = dev.dispatch(Operation::SetTx).unwrap();
        assert!(!reply.ok);
        assert_eq!(dev.status(), TxStatus::WaitStart);
    }

    #[test]
    fn status_reads_through_dispatch() {
        let (dev, _mock) = device(SimClock::at(12, 0, 30, 0));
        assert_eq!(
            dev.dispatch(Operation::GetStatus),
            Some(Reply::ok(ReplyPayload::Text("IDLE".into())))
        );
    }
}
