/// Message types understood by the WSPRlite firmware, sent as a little-endian u16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    // ---- Core ----
    Version = 0x00,
    Nack = 0x01,
    Ack = 0x02,
    Read = 0x03,
    ResponseData = 0x04,
    Write = 0x05,
    Reset = 0x06,

    // ---- Bootloader (never emitted) ----
    BootloaderState = 0x07,
    BootloaderEnter = 0x08,
    BootloaderEraseAll = 0x09,
    BootloaderErasePage = 0x0a,
    BootloaderProgramHexRec = 0x0b,
    BootloaderProgramRow = 0x0c,
    BootloaderProgramWord = 0x0d,
    BootloaderCrc = 0x0e,
    BootloaderProgramResetAddr = 0x0f,

    // ---- Mode / timing ----
    DeviceModeGet = 0x10,
    DeviceModeSet = 0x11,
    DumpEeprom = 0x12,
    WsprGetTime = 0x13,
    TestCmd = 0x14,
}

impl MessageType {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        use MessageType::*;
        Some(match code {
            0x00 => Version,
            0x01 => Nack,
            0x02 => Ack,
            0x03 => Read,
            0x04 => ResponseData,
            0x05 => Write,
            0x06 => Reset,
            0x07 => BootloaderState,
            0x08 => BootloaderEnter,
            0x09 => BootloaderEraseAll,
            0x0a => BootloaderErasePage,
            0x0b => BootloaderProgramHexRec,
            0x0c => BootloaderProgramRow,
            0x0d => BootloaderProgramWord,
            0x0e => BootloaderCrc,
            0x0f => BootloaderProgramResetAddr,
            0x10 => DeviceModeGet,
            0x11 => DeviceModeSet,
            0x12 => DumpEeprom,
            0x13 => WsprGetTime,
            0x14 => TestCmd,
            _ => return None,
        })
    }

    /// Read and Write carry a variable id right after the type.
    pub fn has_variable(self) -> bool {
        matches!(self, MessageType::Read | MessageType::Write)
    }
}

/// Configuration items stored on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum VariableId {
    MemVersion = 0x00,
    XoFreq = 0x01,
    XoFreqFactory = 0x02,
    ChangeCounter = 0x03,
    DeviceId = 0x04,
    DeviceSecret = 0x05,
    WsprTxFreq = 0x06,
    WsprLocator = 0x07,
    WsprCallsign = 0x08,
    WsprPaBias = 0x09,
    WsprOutputPower = 0x0a,
    WsprReportPower = 0x0b,
    WsprTxPct = 0x0c,
    WsprMaxTxDuration = 0x0d,
    CwIdFreq = 0x0e,
    CwIdCallsign = 0x0f,
    PaBiasSource = 0x10,
}

impl VariableId {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        use VariableId::*;
        Some(match code {
            0x00 => MemVersion,
            0x01 => XoFreq,
            0x02 => XoFreqFactory,
            0x03 => ChangeCounter,
            0x04 => DeviceId,
            0x05 => DeviceSecret,
            0x06 => WsprTxFreq,
            0x07 => WsprLocator,
            0x08 => WsprCallsign,
            0x09 => WsprPaBias,
            0x0a => WsprOutputPower,
            0x0b => WsprReportPower,
            0x0c => WsprTxPct,
            0x0d => WsprMaxTxDuration,
            0x0e => CwIdFreq,
            0x0f => CwIdCallsign,
            0x10 => PaBiasSource,
            _ => return None,
        })
    }
}

/// What the device is doing, as set by DeviceMode_Set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DeviceMode {
    Init = 0x00,
    WsprPending = 0x01,
    WsprActive = 0x02,
    WsprInvalid = 0x03,
    TestConstantTx = 0x04,
    FactoryInvalid = 0x05,
    HardwareFail = 0x06,
    FirmwareError = 0x07,
    WsprMorseIdent = 0x08,
}

impl DeviceMode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Shape of the reply a command provokes. The wire carries no request id,
/// so the decoder learns the data layout from the outstanding command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// ACK or NACK, no data.
    Ack,
    /// ResponseData with a fixed-size body.
    Data(DataKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Callsign,
    Locator,
    TxFreq,
    Version,
    TxTime,
}

impl DataKind {
    /// Size of the ResponseData body (unescaped) for this kind.
    pub fn body_len(self) -> usize {
        match self {
            DataKind::Callsign => 15,
            DataKind::Locator => 8,
            DataKind::TxFreq => 8,
            DataKind::Version => 28,
            DataKind::TxTime => 8,
        }
    }
}

/// One command frame before escaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub msg_type: MessageType,
    pub variable: Option<VariableId>,
    pub payload: Vec<u8>,
}

impl Command {
    pub fn new(msg_type: MessageType, variable: Option<VariableId>, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            variable,
            payload,
        }
    }

    pub fn read(variable: VariableId) -> Self {
        Self::new(MessageType::Read, Some(variable), Vec::new())
    }

    pub fn write(variable: VariableId, payload: Vec<u8>) -> Self {
        Self::new(MessageType::Write, Some(variable), payload)
    }

    /// Write the transmit frequency. `units` is MHz × 1_000_000.
    pub fn write_tx_freq(units: u64) -> Self {
        Self::write(VariableId::WsprTxFreq, units.to_le_bytes().to_vec())
    }

    pub fn set_mode(mode: DeviceMode) -> Self {
        Self::new(
            MessageType::DeviceModeSet,
            None,
            mode.code().to_le_bytes().to_vec(),
        )
    }

    pub fn reset() -> Self {
        Self::new(MessageType::Reset, None, Vec::new())
    }

    pub fn version() -> Self {
        Self::new(MessageType::Version, None, Vec::new())
    }

    pub fn wspr_time() -> Self {
        Self::new(MessageType::WsprGetTime, None, Vec::new())
    }

    /// `type ‖ variable ‖ payload`, the bytes covered by the checksum.
    pub fn body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.payload.len());
        out.extend_from_slice(&self.msg_type.code().to_le_bytes());
        if let Some(v) = self.variable {
            out.extend_from_slice(&v.code().to_le_bytes());
        }
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn expect(&self) -> Expect {
        match (self.msg_type, self.variable) {
            (MessageType::Read, Some(VariableId::WsprCallsign)) => Expect::Data(DataKind::Callsign),
            (MessageType::Read, Some(VariableId::WsprLocator)) => Expect::Data(DataKind::Locator),
            (MessageType::Read, Some(VariableId::WsprTxFreq)) => Expect::Data(DataKind::TxFreq),
            (MessageType::Version, _) => Expect::Data(DataKind::Version),
            (MessageType::WsprGetTime, _) => Expect::Data(DataKind::TxTime),
            // Reads of other variables have no decoder; a ResponseData for
            // them surfaces as a malformed reply.
            _ => Expect::Ack,
        }
    }
}
