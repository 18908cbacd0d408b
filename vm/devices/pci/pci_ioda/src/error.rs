// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::firmware::FirmwareError;
use crate::pe::PeNumber;
use thiserror::Error;

/// Errors returned by the PE engine.
#[derive(Debug, Error)]
pub enum IodaError {
    /// Every PE number is in use.
    #[error("no free PE number")]
    PeExhausted,
    /// No run of free PE numbers is long enough.
    #[error("no {count} contiguous free PE numbers")]
    PeRangeExhausted {
        /// The requested run length.
        count: u32,
    },
    /// Every M64 window register is in use.
    #[error("no free M64 window register")]
    M64Exhausted,
    /// A firmware call failed.
    #[error("firmware call {op} failed for {pe:?}")]
    Firmware {
        /// The firmware operation.
        op: &'static str,
        /// The PE the call was made for, if any.
        pe: Option<PeNumber>,
        /// The firmware status.
        #[source]
        source: FirmwareError,
    },
    /// The PE number is outside the bridge's PE table or is not allocated.
    #[error("{0} is not allocated")]
    PeNotAllocated(PeNumber),
    /// A PE was freed while still bound to a device, bus or VF.
    #[error("{0} is still bound")]
    PeStillBound(PeNumber),
    /// A PE has no device, bus or VF binding.
    #[error("{0} is not bound to a device or bus")]
    PeUnbound(PeNumber),
    /// A 32-bit DMA window was bound twice to the same PE.
    #[error("{0} already has a 32-bit DMA window")]
    DmaAlreadyBound(PeNumber),
    /// No MSI vector entry is assigned to the PE.
    #[error("{0} has no MSI vector entry")]
    NoMve(PeNumber),
    /// The function has no PE assigned.
    #[error("function has no PE assigned")]
    NoPe,
    /// The resource is already in use.
    #[error("resource busy")]
    Busy,
    /// An argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The bridge configuration is inconsistent.
    #[error("invalid PHB configuration: {0}")]
    InvalidConfig(&'static str),
    /// The operation is not available on this bridge.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl IodaError {
    pub(crate) fn firmware(op: &'static str, pe: Option<PeNumber>, source: FirmwareError) -> Self {
        Self::Firmware { op, pe, source }
    }
}
