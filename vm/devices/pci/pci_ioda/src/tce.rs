// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! DMA translation tables and their invalidation.
//!
//! A table maps a window of PCI bus addresses, one entry per IO page, to
//! system physical pages. After entries change, the bridge's TCE kill
//! register must be written to flush cached translations.

use crate::error::IodaError;
use crate::pe::PeNumber;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;

const TCE_PCI_READ: u64 = 0x1;
const TCE_PCI_WRITE: u64 = 0x2;
const TCE_ENTRY_SIZE: u64 = 8;

/// Bridge register used to invalidate cached TCEs.
pub trait TceKillRegister: Send + Sync {
    /// Stores `value` to the register.
    fn write(&self, value: u64);

    /// Stores `value` using the store form usable with translation off.
    fn write_real_mode(&self, value: u64) {
        self.write(value)
    }
}

/// How invalidation addresses are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateScheme {
    /// Legacy bridges: ranges of TCE entry addresses. Paired mode flushes
    /// 16-byte granules and sets the top bit; otherwise 128-byte granules.
    Ioda1 {
        /// Use paired start/end writes.
        paired: bool,
    },
    /// Modern bridges: PE-scoped ranges of IO page numbers.
    Ioda2 {
        /// The owning PE.
        pe: PeNumber,
    },
}

/// The register and encoding a table invalidates through.
#[derive(Clone)]
pub struct TceInvalidate {
    scheme: InvalidateScheme,
    register: Arc<dyn TceKillRegister>,
}

impl std::fmt::Debug for TceInvalidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TceInvalidate")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

impl TceInvalidate {
    /// Creates an invalidator writing to `register`.
    pub fn new(scheme: InvalidateScheme, register: Arc<dyn TceKillRegister>) -> Self {
        Self { scheme, register }
    }

    /// The address encoding.
    pub fn scheme(&self) -> InvalidateScheme {
        self.scheme
    }
}

/// DMA direction of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Device reads memory.
    ToDevice,
    /// Device writes memory.
    FromDevice,
    /// Both.
    Bidirectional,
}

impl DmaDirection {
    fn permissions(self) -> u64 {
        match self {
            DmaDirection::ToDevice => TCE_PCI_READ,
            DmaDirection::FromDevice => TCE_PCI_WRITE,
            DmaDirection::Bidirectional => TCE_PCI_READ | TCE_PCI_WRITE,
        }
    }
}

/// A zero-initialized translation table covering one DMA window.
#[derive(Debug)]
pub struct TceTable {
    entries: Vec<u64>,
    bus_offset: u64,
    page_shift: u32,
    invalidate: Option<TceInvalidate>,
}

impl TceTable {
    /// Allocates a table of `table_size` bytes whose window starts at bus
    /// address `bus_start`.
    pub fn new(
        bus_start: u64,
        table_size: u64,
        page_shift: u32,
        invalidate: Option<TceInvalidate>,
    ) -> Self {
        Self {
            entries: vec![0; (table_size / TCE_ENTRY_SIZE) as usize],
            bus_offset: bus_start >> page_shift,
            page_shift,
            invalidate,
        }
    }

    /// Physical address of the table handed to firmware.
    pub fn table_addr(&self) -> u64 {
        self.entries.as_ptr() as usize as u64
    }

    /// Table size in bytes.
    pub fn table_size(&self) -> u64 {
        self.entries.len() as u64 * TCE_ENTRY_SIZE
    }

    /// IO page shift.
    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    /// Bus address range translated by the table.
    pub fn window(&self) -> Range<u64> {
        let start = self.bus_offset << self.page_shift;
        start..start + ((self.entries.len() as u64) << self.page_shift)
    }

    /// Raw entry at `index`.
    pub fn entry(&self, index: usize) -> Option<u64> {
        self.entries.get(index).copied()
    }

    /// The invalidator, if the bridge has a kill register.
    pub fn invalidator(&self) -> Option<&TceInvalidate> {
        self.invalidate.as_ref()
    }

    fn check_range(&self, index: usize, npages: usize) -> Result<(), IodaError> {
        if npages == 0 || index.checked_add(npages).is_none_or(|e| e > self.entries.len()) {
            return Err(IodaError::InvalidArgument("TCE range outside table"));
        }
        Ok(())
    }

    /// Maps `pages.len()` IO pages starting at entry `index` to the given
    /// physical pages, then invalidates them.
    pub fn map(
        &mut self,
        index: usize,
        pages: &[u64],
        direction: DmaDirection,
        real_mode: bool,
    ) -> Result<(), IodaError> {
        self.check_range(index, pages.len())?;
        let page_mask = !((1u64 << self.page_shift) - 1);
        let perms = direction.permissions();
        for (entry, &phys) in self.entries[index..].iter_mut().zip(pages) {
            *entry = (phys & page_mask) | perms;
        }
        self.invalidate_range(index, index + pages.len() - 1, real_mode);
        Ok(())
    }

    /// Clears `npages` entries starting at `index`, then invalidates them.
    pub fn unmap(&mut self, index: usize, npages: usize, real_mode: bool) -> Result<(), IodaError> {
        self.check_range(index, npages)?;
        self.entries[index..index + npages].fill(0);
        self.invalidate_range(index, index + npages - 1, real_mode);
        Ok(())
    }

    /// Clears every entry.
    pub fn clear(&mut self) {
        let len = self.entries.len();
        if len != 0 {
            self.entries.fill(0);
            self.invalidate_range(0, len - 1, false);
        }
    }

    /// Writes the kill register for entries `first..=last`.
    pub fn invalidate_range(&self, first: usize, last: usize, real_mode: bool) {
        let Some(inv) = &self.invalidate else {
            return;
        };
        let (mut start, end, inc) = match inv.scheme {
            InvalidateScheme::Ioda1 { paired } => {
                let base = self.table_addr();
                let mut start = base + first as u64 * TCE_ENTRY_SIZE;
                let mut end = base + last as u64 * TCE_ENTRY_SIZE;
                let inc = if paired {
                    start |= 1 << 63;
                    end |= 1 << 63;
                    16
                } else {
                    128
                };
                (start, end | (inc - 1), inc)
            }
            InvalidateScheme::Ioda2 { pe } => {
                let scope = (0x2u64 << 60) | (pe.0 as u64 & 0xff);
                let start = scope | ((self.bus_offset + first as u64) << self.page_shift);
                let end = scope | ((self.bus_offset + last as u64) << self.page_shift);
                (start, end, 1u64 << self.page_shift)
            }
        };

        // Table updates must be visible before the flush.
        fence(Ordering::SeqCst);
        while start <= end {
            if real_mode {
                inv.register.write_real_mode(start);
            } else {
                inv.register.write(start);
            }
            start += inc;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::RecordingKillRegister;

    #[test]
    fn test_map_sets_permissions() {
        let mut table = TceTable::new(0, 0x1000, 12, None);
        assert_eq!(table.window(), 0..(512 << 12));
        table
            .map(3, &[0x1234_5678, 0x9000], DmaDirection::FromDevice, false)
            .unwrap();
        assert_eq!(table.entry(3), Some(0x1234_5000 | TCE_PCI_WRITE));
        assert_eq!(table.entry(4), Some(0x9000 | TCE_PCI_WRITE));
        table.unmap(3, 1, false).unwrap();
        assert_eq!(table.entry(3), Some(0));
        assert!(table.map(511, &[0, 0], DmaDirection::ToDevice, false).is_err());
    }

    #[test]
    fn test_ioda2_invalidate_encoding() {
        let reg = Arc::new(RecordingKillRegister::default());
        let inv = TceInvalidate::new(InvalidateScheme::Ioda2 { pe: PeNumber(0x105) }, reg.clone());
        let mut table = TceTable::new(0x10000, 0x1000, 12, Some(inv));
        table
            .map(0, &[0x1000, 0x2000], DmaDirection::Bidirectional, false)
            .unwrap();
        let scope = (2u64 << 60) | 0x05;
        assert_eq!(reg.writes(), [(scope | 0x10000, false), (scope | 0x11000, false)]);
    }

    #[test]
    fn test_ioda1_paired_invalidate_encoding() {
        let reg = Arc::new(RecordingKillRegister::default());
        let inv = TceInvalidate::new(InvalidateScheme::Ioda1 { paired: true }, reg.clone());
        let mut table = TceTable::new(0, 0x1000, 12, Some(inv));
        table.unmap(0, 4, true).unwrap();
        let base = table.table_addr() | (1 << 63);
        let end = (table.table_addr() + 3 * 8) | (1 << 63) | 15;
        let writes = reg.writes();
        assert_eq!(writes.first(), Some(&(base, true)));
        assert!(writes.iter().all(|&(v, real)| real && v <= end));
        assert_eq!(writes.len() as u64, (end - base) / 16 + 1);
    }
}
