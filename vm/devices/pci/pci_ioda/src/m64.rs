// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! M64 window management.
//!
//! The bridge has [`M64_BAR_COUNT`] 64-bit window registers. The last one
//! decodes the whole M64 window in split mode, so segment `i` of the window
//! routes to PE `i`. The others are handed out to SR-IOV VF BARs.

use crate::alloc::PeAllocator;
use crate::config::WindowConfig;
use crate::error::IodaError;
use crate::firmware::IodaFirmware;
use crate::firmware::MmioEnable;
use crate::firmware::WindowType;
use crate::grouping::BusScope;
use crate::pe::PeGroup;
use crate::pe::PeNumber;
use crate::topology::BusId;
use crate::topology::PciTopology;
use crate::topology::Resource;
use bitvec::slice::BitSlice;
use bitvec::vec::BitVec;
use std::ops::Range;

/// Number of M64 window registers.
pub(crate) const M64_BAR_COUNT: u32 = 16;

#[derive(Debug)]
pub(crate) struct M64Window {
    base: u64,
    size: u64,
    segment_size: u64,
    total_pe: u32,
    bar_idx: u32,
    bar_alloc: BitVec,
}

impl M64Window {
    pub fn new(window: WindowConfig, total_pe: u32) -> Self {
        Self {
            base: window.pci_base,
            size: window.size,
            segment_size: window.size / total_pe as u64,
            total_pe,
            bar_idx: M64_BAR_COUNT - 1,
            bar_alloc: BitVec::repeat(false, M64_BAR_COUNT as usize),
        }
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Enables the shared window in split mode and returns the part of it
    /// available to resource allocation.
    pub fn init(
        &mut self,
        fw: &dyn IodaFirmware,
        reserved: PeNumber,
    ) -> Result<Resource, IodaError> {
        let bar = self.bar_idx as u16;
        let result = fw
            .set_phb_mem_window(WindowType::M64, bar, self.base, 0, self.size)
            .map_err(|e| IodaError::firmware("set_phb_mem_window", None, e))
            .and_then(|()| {
                fw.phb_mmio_enable(WindowType::M64, bar, MmioEnable::Split)
                    .map_err(|e| IodaError::firmware("phb_mmio_enable", None, e))
            });
        if let Err(err) = result {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                bar,
                "failed to configure shared M64 window"
            );
            if let Err(err) = fw.phb_mmio_enable(WindowType::M64, bar, MmioEnable::Disable) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    bar,
                    "failed to disable shared M64 window"
                );
            }
            return Err(err);
        }
        self.bar_alloc.set(self.bar_idx as usize, true);

        let mut resource = Resource::mem64_pref(self.base, self.size);
        if reserved.0 == 0 {
            resource.start += self.segment_size;
        } else if reserved.0 == self.total_pe - 1 {
            resource.end -= self.segment_size;
        } else {
            tracing::warn!(
                pe = %reserved,
                "cannot strip M64 segment of reserved PE"
            );
        }

        tracing::info!(
            base = format_args!("{:#x}", self.base),
            size = format_args!("{:#x}", self.size),
            segment_size = format_args!("{:#x}", self.segment_size),
            "M64 window enabled"
        );
        Ok(resource)
    }

    /// Segments of the shared window covered by `r`.
    fn segments(&self, r: &Resource) -> Option<Range<usize>> {
        if !r.assigned || !r.is_mem64_pref() || r.size() == 0 {
            return None;
        }
        if r.start < self.base || r.end - self.base >= self.size {
            return None;
        }
        let first = ((r.start - self.base) / self.segment_size) as usize;
        let last = ((r.end - self.base) / self.segment_size) as usize;
        Some(first..(last + 1).min(self.total_pe as usize))
    }

    /// Reserves the PE numbers pinned by every root port's M64 window so
    /// generic allocation does not hand them out.
    pub fn reserve_root_port_segments(&self, topo: &PciTopology, alloc: &mut PeAllocator) {
        let root = topo.bus(topo.root_bus());
        for &dev in root.devices() {
            let Some(sub) = topo.function(dev).subordinate() else {
                continue;
            };
            for r in topo.bus(sub).resources() {
                if let Some(range) = self.segments(r) {
                    for n in range {
                        alloc.reserve(PeNumber(n as u32));
                    }
                }
            }
        }
    }

    /// Picks the PE numbers the M64 windows of `bus` route to.
    ///
    /// Returns `None` if the bus has no M64 window of its own. When several
    /// segments remain, the lowest becomes the master of a group holding
    /// the rest.
    pub fn pick_pe(
        &self,
        topo: &PciTopology,
        bus: BusId,
        scope: BusScope,
        alloc: &mut PeAllocator,
    ) -> Option<PeNumber> {
        let b = topo.bus(bus);
        if b.is_root() {
            return None;
        }

        let mut candidates: BitVec = BitVec::repeat(false, self.total_pe as usize);
        for r in b.resources() {
            if let Some(range) = self.segments(r) {
                candidates[range].fill(true);
            }
        }
        if candidates.not_any() {
            return None;
        }

        // Child buses own the parts of the window they decode.
        if scope == BusScope::SingleBus {
            for &dev in b.devices() {
                let Some(sub) = topo.function(dev).subordinate() else {
                    continue;
                };
                for r in topo.bus(sub).resources() {
                    if let Some(range) = self.segments(r) {
                        candidates[range].fill(false);
                    }
                }
            }
        }

        let mut ones = candidates.iter_ones().map(|n| PeNumber(n as u32));
        let master = ones.next()?;
        let slaves: Vec<_> = ones.collect();
        for &slave in &slaves {
            alloc.claim(slave).group = PeGroup::Slave { master };
        }
        if !slaves.is_empty() {
            tracing::debug!(pe = %master, ?slaves, "M64 compound PE");
            alloc.claim(master).group = PeGroup::Master { slaves };
        } else {
            alloc.claim(master);
        }
        Some(master)
    }

    /// Claims a free window register.
    pub fn alloc_bar(&mut self) -> Option<u32> {
        let idx = self.bar_alloc.first_zero()?;
        self.bar_alloc.set(idx, true);
        Some(idx as u32)
    }

    pub fn release_bar(&mut self, idx: u32) {
        if let Some(mut bit) = self.bar_alloc.get_mut(idx as usize) {
            *bit = false;
        }
    }

    pub fn bars_in_use(&self) -> &BitSlice {
        &self.bar_alloc
    }
}
