use core::fmt::{self, Display};

/// Error kinds reported by the command/data engine.
///
/// The first twelve map one-to-one onto the failure classes the transfer
/// machine can observe; the rest are local conditions (bad arguments,
/// allocation failures, permission checks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmcError {
    CommandTimeout,
    CommandCrc,
    CommandEndBit,
    CommandIndex,
    DataTimeout,
    DataCrc,
    DataEndBit,
    AdmaError,
    CardEccFailed,
    RetryExhausted,
    MediumRemoved,
    Unsupported,
    Io,
    InvalidValue,
    Overflow,
    NoMemory,
    PermissionDenied,
    NotReady,
    ResetTimeout,
}

pub type MmcResult<T = ()> = Result<T, MmcError>;

impl MmcError {
    pub fn is_timeout(self) -> bool {
        matches!(self, MmcError::CommandTimeout | MmcError::DataTimeout)
    }

    /// Response or data was received but malformed (CRC, end bit, index).
    pub fn is_ilseq(self) -> bool {
        matches!(
            self,
            MmcError::CommandCrc
                | MmcError::CommandEndBit
                | MmcError::CommandIndex
                | MmcError::DataCrc
                | MmcError::DataEndBit
        )
    }

    pub fn is_command_leg(self) -> bool {
        matches!(
            self,
            MmcError::CommandTimeout
                | MmcError::CommandCrc
                | MmcError::CommandEndBit
                | MmcError::CommandIndex
        )
    }

    pub fn is_data_leg(self) -> bool {
        matches!(
            self,
            MmcError::DataTimeout
                | MmcError::DataCrc
                | MmcError::DataEndBit
                | MmcError::AdmaError
                | MmcError::CardEccFailed
        )
    }
}

impl Display for MmcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmcError::CommandTimeout => write!(f, "command timeout"),
            MmcError::CommandCrc => write!(f, "command response CRC error"),
            MmcError::CommandEndBit => write!(f, "command response end bit error"),
            MmcError::CommandIndex => write!(f, "command response index error"),
            MmcError::DataTimeout => write!(f, "data timeout"),
            MmcError::DataCrc => write!(f, "data CRC error"),
            MmcError::DataEndBit => write!(f, "data end bit error"),
            MmcError::AdmaError => write!(f, "ADMA descriptor error"),
            MmcError::CardEccFailed => write!(f, "card ECC failed"),
            MmcError::RetryExhausted => write!(f, "retry budget exhausted"),
            MmcError::MediumRemoved => write!(f, "medium removed"),
            MmcError::Unsupported => write!(f, "operation not supported"),
            MmcError::Io => write!(f, "I/O error"),
            MmcError::InvalidValue => write!(f, "invalid value"),
            MmcError::Overflow => write!(f, "value too large"),
            MmcError::NoMemory => write!(f, "out of descriptor memory"),
            MmcError::PermissionDenied => write!(f, "permission denied"),
            MmcError::NotReady => write!(f, "not ready"),
            MmcError::ResetTimeout => write!(f, "controller reset timed out"),
        }
    }
}
