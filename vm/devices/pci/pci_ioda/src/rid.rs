// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCI requester ID.

use bitfield_struct::bitfield;
use std::fmt;

/// A PCI requester ID: bus, device and function packed into 16 bits.
#[bitfield(u16)]
#[derive(PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rid {
    /// Function number.
    #[bits(3)]
    pub function: u8,
    /// Device number.
    #[bits(5)]
    pub device: u8,
    /// Bus number.
    pub bus: u8,
}

impl Rid {
    /// Builds a RID from a bus number and a combined device/function number.
    pub fn from_bus_devfn(bus: u8, devfn: u8) -> Self {
        Self::from_bits(((bus as u16) << 8) | devfn as u16)
    }

    /// The combined device/function number.
    pub fn devfn(&self) -> u8 {
        (self.into_bits() & 0xff) as u8
    }

    /// Index into per-RID tables.
    pub(crate) fn index(&self) -> usize {
        self.into_bits() as usize
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}.{}",
            self.bus(),
            self.device(),
            self.function()
        )
    }
}
