// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PE number allocation.

use crate::error::IodaError;
use crate::pe::Pe;
use crate::pe::PeNumber;
use crate::pe::PeState;
use bitvec::slice::BitSlice;
use bitvec::vec::BitVec;

/// The PE slot bitmap and the PE records it guards.
///
/// Not internally synchronized; the bridge keeps it behind its allocation
/// lock.
#[derive(Debug)]
pub(crate) struct PeAllocator {
    bitmap: BitVec,
    pes: Vec<Pe>,
    reserved: PeNumber,
}

impl PeAllocator {
    pub fn new(total: u32, reserved: PeNumber) -> Self {
        let mut bitmap = BitVec::repeat(false, total as usize);
        bitmap.set(reserved.index(), true);
        Self {
            bitmap,
            pes: (0..total).map(|n| Pe::new(PeNumber(n))).collect(),
            reserved,
        }
    }

    /// Claims the lowest free PE number and resets its record.
    pub fn allocate(&mut self) -> Result<PeNumber, IodaError> {
        let n = self.bitmap.first_zero().ok_or(IodaError::PeExhausted)?;
        self.bitmap.set(n, true);
        let pe = PeNumber(n as u32);
        self.init(pe);
        Ok(pe)
    }

    /// Marks `pe` as in use without touching its record.
    pub fn reserve(&mut self, pe: PeNumber) {
        if let Some(mut bit) = self.bitmap.get_mut(pe.index()) {
            *bit = true;
        }
    }

    /// Marks `pe` as in use and resets its record to a fresh allocation.
    pub fn claim(&mut self, pe: PeNumber) -> &mut Pe {
        self.reserve(pe);
        self.init(pe)
    }

    fn init(&mut self, pe: PeNumber) -> &mut Pe {
        let record = &mut self.pes[pe.index()];
        *record = Pe::new(pe);
        record.state = PeState::Allocated;
        record
    }

    /// Releases `pe`. The PE must no longer be bound.
    pub fn free(&mut self, pe: PeNumber) -> Result<(), IodaError> {
        if pe == self.reserved {
            return Err(IodaError::InvalidArgument("reserved PE cannot be freed"));
        }
        let record = self
            .pes
            .get_mut(pe.index())
            .ok_or(IodaError::PeNotAllocated(pe))?;
        if let Some(binding) = record.binding {
            tracing::error!(%pe, ?binding, "freeing PE that is still bound");
            return Err(IodaError::PeStillBound(pe));
        }
        *record = Pe::new(pe);
        self.bitmap.set(pe.index(), false);
        Ok(())
    }

    /// Claims the lowest run of `count` free PE numbers.
    pub fn find_contiguous(&mut self, count: u32) -> Result<PeNumber, IodaError> {
        let count = count as usize;
        if count == 0 {
            return Err(IodaError::InvalidArgument("empty PE range"));
        }
        let mut start = 0;
        while start + count <= self.bitmap.len() {
            match self.bitmap[start..start + count].last_one() {
                Some(offset) => start += offset + 1,
                None => {
                    self.bitmap[start..start + count].fill(true);
                    return Ok(PeNumber(start as u32));
                }
            }
        }
        Err(IodaError::PeRangeExhausted {
            count: count as u32,
        })
    }

    /// Clears the bits of a range claimed by [`Self::find_contiguous`].
    pub fn release_range(&mut self, base: PeNumber, count: u32) {
        let end = (base.index() + count as usize).min(self.bitmap.len());
        if base.index() < end {
            self.bitmap[base.index()..end].fill(false);
        }
    }

    pub fn is_allocated(&self, pe: PeNumber) -> bool {
        self.bitmap.get(pe.index()).is_some_and(|b| *b)
    }

    pub fn get(&self, pe: PeNumber) -> Result<&Pe, IodaError> {
        self.pes.get(pe.index()).ok_or(IodaError::PeNotAllocated(pe))
    }

    pub fn get_mut(&mut self, pe: PeNumber) -> Result<&mut Pe, IodaError> {
        self.pes
            .get_mut(pe.index())
            .ok_or(IodaError::PeNotAllocated(pe))
    }

    pub fn bitmap(&self) -> &BitSlice {
        &self.bitmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::PeBinding;
    use crate::topology::PciTopology;

    #[test]
    fn test_reserved_bit_preset() {
        let mut alloc = PeAllocator::new(256, PeNumber(0));
        assert!(alloc.is_allocated(PeNumber(0)));
        let got: Vec<_> = (0..3).map(|_| alloc.allocate().unwrap()).collect();
        assert_eq!(got, [PeNumber(1), PeNumber(2), PeNumber(3)]);
        assert_eq!(alloc.get(PeNumber(2)).unwrap().state(), PeState::Allocated);
    }

    #[test]
    fn test_free_reuses_number() {
        let mut alloc = PeAllocator::new(8, PeNumber(7));
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_ne!(a, b);
        alloc.free(a).unwrap();
        assert!(!alloc.is_allocated(a));
        assert_eq!(alloc.allocate().unwrap(), a);
    }

    #[test]
    fn test_exhaustion() {
        let mut alloc = PeAllocator::new(4, PeNumber(3));
        for _ in 0..3 {
            alloc.allocate().unwrap();
        }
        assert!(matches!(alloc.allocate(), Err(IodaError::PeExhausted)));
        assert!(alloc.free(PeNumber(3)).is_err());
    }

    #[test]
    fn test_no_duplicate_live_numbers() {
        let mut alloc = PeAllocator::new(32, PeNumber(0));
        let mut live = Vec::new();
        for round in 0..200u32 {
            if round % 3 == 2 && !live.is_empty() {
                let pe = live.remove((round as usize * 7) % live.len());
                alloc.free(pe).unwrap();
            } else if let Ok(pe) = alloc.allocate() {
                assert!(!live.contains(&pe));
                live.push(pe);
            }
        }
        assert_eq!(alloc.bitmap().count_ones(), live.len() + 1);
    }

    #[test]
    fn test_free_bound_pe_fails() {
        let topo = PciTopology::new(0..=0);
        let mut alloc = PeAllocator::new(8, PeNumber(0));
        let pe = alloc.allocate().unwrap();
        alloc.get_mut(pe).unwrap().binding = Some(PeBinding::Bus(topo.root_bus()));
        assert!(matches!(alloc.free(pe), Err(IodaError::PeStillBound(p)) if p == pe));
        assert!(alloc.is_allocated(pe));
    }

    #[test]
    fn test_find_contiguous() {
        let mut alloc = PeAllocator::new(16, PeNumber(0));
        alloc.reserve(PeNumber(3));
        alloc.reserve(PeNumber(6));
        assert_eq!(alloc.find_contiguous(4).unwrap(), PeNumber(7));
        assert_eq!(alloc.find_contiguous(2).unwrap(), PeNumber(1));
        assert_eq!(alloc.find_contiguous(2).unwrap(), PeNumber(4));
        assert!(matches!(
            alloc.find_contiguous(6),
            Err(IodaError::PeRangeExhausted { count: 6 })
        ));
        alloc.release_range(PeNumber(7), 4);
        assert_eq!(alloc.find_contiguous(5).unwrap(), PeNumber(7));
    }
}
