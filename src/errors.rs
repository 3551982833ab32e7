//! Error types shared across the link layer.
//!
//! Two classes, per the original firmware's distinction between chip-library
//! failures and protocol-level anomalies: [`LinkError`] is returned from
//! fallible calls and can trigger a driver crash; [`LogCode`] is recorded in
//! the [`crate::errlog::ErrorLog`] and never unwinds a call.

use defmt::Format;

/// Hardware/driver-level failure. Values in the negative range of the
/// original firmware's error codes map onto these variants.
#[derive(Clone, Copy, PartialEq, Eq, Format)]
pub enum LinkError {
    /// The chip never cleared its busy line within the allotted polling window.
    BusyTimeout,
    /// The HAL's SPI transfer returned an error.
    Spi,
    /// `get_status` decoded an operating-mode or command-status value the
    /// datasheet doesn't define.
    UnexpectedStatus(u8),
    /// A received frame was shorter than the wire header requires.
    InvalidLength,
    /// The driver has crashed and is refusing calls until `restart`.
    NotStarted,
    /// RX_DONE and TX_DONE were both latched in the same IRQ read — the
    /// chip's op mode cannot be determined and the driver can't safely
    /// proceed.
    SimultaneousRxTx,
}

impl LinkError {
    /// Maps to the negative hardware-error code space used by [`LogCode`]'s
    /// sibling ring buffer, so both classes can share one wire representation
    /// when a crash report needs to name the trigger.
    pub fn code(self) -> i16 {
        match self {
            Self::BusyTimeout => -1,
            Self::Spi => -2,
            Self::UnexpectedStatus(_) => -3,
            Self::InvalidLength => -4,
            Self::NotStarted => -5,
            Self::SimultaneousRxTx => -999,
        }
    }
}

/// Positive protocol anomaly codes, numbered exactly as in the original
/// firmware's `custom_Vitals_Err_Codes` (`ErrorStruct.h`). Bit position `n`
/// in the error log's atomic mask corresponds to variant value `n`.
#[derive(Clone, Copy, PartialEq, Eq, Format)]
#[repr(u8)]
pub enum LogCode {
    RxBusyTimeout = 1,
    AirActivityTimeout = 2,
    UnexpectedTxCompletion = 3,
    UnexpectedRxCompletion = 4,
    IncorrectProtocolId = 5,
    TimerStartErr = 6,
    UnexpectedTimeoutFire = 7,
    AckTimeout = 8,
    InvalidRxLength = 9,
    QueueOverflow = 10,
    BurstFillFailure = 11,
    DriverNotStarted = 12,
}
