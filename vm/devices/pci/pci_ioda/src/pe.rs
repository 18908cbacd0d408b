// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Partitionable Endpoint records.

use crate::rid::Rid;
use crate::tce::TceTable;
use crate::topology::BusId;
use crate::topology::FunctionId;
use std::fmt;
use std::ops::Range;

/// Index of a PE in the bridge's PE table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeNumber(pub u32);

impl PeNumber {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PE#{}", self.0)
    }
}

/// What a PE was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeBinding {
    /// A single function.
    Device(FunctionId),
    /// The functions directly on one bus.
    Bus(BusId),
    /// A bus and every bus below it.
    BusAll(BusId),
    /// One virtual function of a PF.
    Vf {
        /// The physical function.
        pf: FunctionId,
        /// VF index.
        index: u16,
    },
}

/// Membership of a PE in a compound group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PeGroup {
    /// Not part of a group.
    #[default]
    Standalone,
    /// Owns the listed slaves.
    Master {
        /// Slave PEs in ascending order.
        slaves: Vec<PeNumber>,
    },
    /// Belongs to the group owned by `master`.
    Slave {
        /// The owning master.
        master: PeNumber,
    },
}

/// Lifecycle of a PE record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeState {
    /// The slot is free.
    Free,
    /// The number is claimed but the tables are not programmed.
    Allocated,
    /// PELT and PELTV are programmed.
    Configured,
    /// A DMA window is bound.
    DmaBound,
    /// The tables were unprogrammed; the slot can be freed.
    Deconfigured,
}

#[derive(Debug, Default)]
pub(crate) struct PeDma {
    pub tce32_seg: Option<u32>,
    pub tce32_segs: u32,
    pub tce32: Option<TceTable>,
    pub tce64: Option<TceTable>,
    pub bypass_base: u64,
    pub bypass_enabled: bool,
}

/// A Partitionable Endpoint.
#[derive(Debug)]
pub struct Pe {
    pub(crate) number: PeNumber,
    pub(crate) rid: Rid,
    pub(crate) binding: Option<PeBinding>,
    pub(crate) group: PeGroup,
    pub(crate) state: PeState,
    pub(crate) mve: Option<u32>,
    pub(crate) dma_weight: u32,
    pub(crate) dma: PeDma,
}

impl Pe {
    pub(crate) fn new(number: PeNumber) -> Self {
        Self {
            number,
            rid: Rid::new(),
            binding: None,
            group: PeGroup::Standalone,
            state: PeState::Free,
            mve: None,
            dma_weight: 0,
            dma: PeDma::default(),
        }
    }

    /// The PE number.
    pub fn number(&self) -> PeNumber {
        self.number
    }

    /// The RID the PE was created for, or the base RID of a bus range.
    pub fn rid(&self) -> Rid {
        self.rid
    }

    /// The device, bus or VF the PE is bound to.
    pub fn binding(&self) -> Option<PeBinding> {
        self.binding
    }

    /// Group membership.
    pub fn group(&self) -> &PeGroup {
        &self.group
    }

    /// Lifecycle state.
    pub fn state(&self) -> PeState {
        self.state
    }

    /// MSI validation entry, if one is bound.
    pub fn mve(&self) -> Option<u32> {
        self.mve
    }

    /// DMA scheduling weight. Zero excludes the PE from scheduling.
    pub fn dma_weight(&self) -> u32 {
        self.dma_weight
    }

    /// First 32-bit DMA segment and segment count, if bound.
    pub fn tce32_segments(&self) -> Option<(u32, u32)> {
        self.dma.tce32_seg.map(|base| (base, self.dma.tce32_segs))
    }

    /// Bus address range of the 32-bit DMA window, if bound.
    pub fn tce32_window(&self) -> Option<Range<u64>> {
        self.dma.tce32.as_ref().map(|t| t.window())
    }

    /// Bus address range of the dynamic 64-bit DMA window, if active.
    pub fn ddw_window(&self) -> Option<Range<u64>> {
        self.dma.tce64.as_ref().map(|t| t.window())
    }

    /// Base of the bypass window, if bypass is enabled.
    pub fn bypass_base(&self) -> Option<u64> {
        self.dma.bypass_enabled.then_some(self.dma.bypass_base)
    }

    /// The master of this PE's group, or the PE itself.
    pub fn master(&self) -> PeNumber {
        match self.group {
            PeGroup::Slave { master } => master,
            _ => self.number,
        }
    }

    pub(crate) fn is_master(&self) -> bool {
        matches!(self.group, PeGroup::Master { .. })
    }
}
