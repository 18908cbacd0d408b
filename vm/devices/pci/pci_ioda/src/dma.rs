// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! 32-bit DMA windows, bypass and dynamic DMA windows.
//!
//! IODA1 bridges share a small number of 256 MiB DMA segments between all
//! PEs, divided up by DMA weight. IODA2 bridges give every PE the whole
//! 32-bit space plus an untranslated bypass window, and optionally one
//! dynamic 64-bit window.

use crate::SZ_4K;
use crate::SZ_16M;
use crate::SZ_64K;
use crate::config::IodaGeneration;
use crate::config::TCE32_SEGMENT_SHIFT;
use crate::error::IodaError;
use crate::firmware::FirmwareError;
use crate::pe::PeDma;
use crate::pe::PeNumber;
use crate::pe::PeState;
use crate::phb::IodaPhb;
use crate::phb::IodaTables;
use crate::tce::DmaDirection;
use crate::tce::InvalidateScheme;
use crate::tce::TceInvalidate;
use crate::tce::TceTable;
use crate::topology::FunctionId;
use crate::topology::HeaderType;
use crate::topology::PciFunction;
use crate::topology::PciTopology;
use parking_lot::MutexGuard;
use std::ops::Range;

/// Bytes of TCE table needed for one 32-bit DMA segment.
const TCE32_TABLE_SIZE: u64 = ((1 << TCE32_SEGMENT_SHIFT) / SZ_4K) * 8;
const IO_PAGE_SHIFT_4K: u32 = 12;
/// Bypass window selected by PCI address bit 59.
const BYPASS_BASE: u64 = 1 << 59;

const CLASS_SERIAL_USB_UHCI: u32 = 0x0c0300;
const CLASS_SERIAL_USB_OHCI: u32 = 0x0c0310;
const CLASS_SERIAL_USB_EHCI: u32 = 0x0c0320;
const CLASS_STORAGE_RAID: u32 = 0x0104;

/// How a function's DMA reaches memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaPath {
    /// Through the PE's 32-bit translation table.
    Translated {
        /// The PE owning the table.
        pe: PeNumber,
    },
    /// Untranslated, with bus addresses offset from physical addresses.
    Bypass {
        /// Bus address of physical address zero.
        offset: u64,
    },
}

/// Dynamic DMA window capabilities of a PE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdwInfo {
    /// Number of windows that can still be created.
    pub windows_available: u32,
    /// Supported IO page sizes, as `DDW_PGSIZE_*` bits.
    pub page_size_mask: u64,
}

impl DdwInfo {
    /// 4 KiB IO pages.
    pub const DDW_PGSIZE_4K: u64 = 0x1;
    /// 64 KiB IO pages.
    pub const DDW_PGSIZE_64K: u64 = 0x2;
    /// 16 MiB IO pages.
    pub const DDW_PGSIZE_16M: u64 = 0x4;
}

/// The relative DMA demand of a function. Zero means no DMA.
pub(crate) fn dma_weight(function: &PciFunction) -> u32 {
    if function.header_type() != HeaderType::Normal {
        return 0;
    }
    match function.class() {
        CLASS_SERIAL_USB_UHCI | CLASS_SERIAL_USB_OHCI | CLASS_SERIAL_USB_EHCI => 3,
        class if class >> 8 == CLASS_STORAGE_RAID => 15,
        _ => 10,
    }
}

/// PEs in descending DMA weight, ties in insertion order.
#[derive(Debug, Default)]
pub(crate) struct DmaSchedule {
    list: Vec<(PeNumber, u32)>,
    total_weight: u32,
    pe_count: u32,
}

impl DmaSchedule {
    pub fn link(&mut self, pe: PeNumber, weight: u32) {
        if weight > 0 {
            self.total_weight += weight;
            self.pe_count += 1;
        }
        let at = self
            .list
            .iter()
            .position(|&(_, w)| w < weight)
            .unwrap_or(self.list.len());
        self.list.insert(at, (pe, weight));
    }

    pub fn unlink(&mut self, pe: PeNumber) {
        if let Some(at) = self.list.iter().position(|&(p, _)| p == pe) {
            let (_, weight) = self.list.remove(at);
            if weight > 0 {
                self.total_weight -= weight;
                self.pe_count -= 1;
            }
        }
    }

    fn weighted(&self) -> impl Iterator<Item = (PeNumber, u32)> + '_ {
        self.list.iter().copied().filter(|&(_, w)| w > 0)
    }
}

fn window_id(pe: PeNumber) -> u16 {
    (pe.0 << 1) as u16
}

fn bypass_window_id(pe: PeNumber) -> u16 {
    window_id(pe) + 1
}

/// All-ones mask covering addresses below `end`.
fn mask_covering(end: u64) -> u64 {
    if end == 0 {
        return 0;
    }
    let top = 1u64 << (63 - end.leading_zeros());
    top + (top - 1)
}

/// Points every function of `pe` at its translation table.
fn attach_translated(topo: &mut PciTopology, pe: PeNumber) {
    for id in topo.functions().collect::<Vec<_>>() {
        let f = topo.function_mut(id);
        if f.pe == Some(pe) {
            f.dma = Some(DmaPath::Translated { pe });
        }
    }
}

impl IodaPhb {
    /// Divides the 32-bit DMA space between the weighted PEs.
    pub(crate) fn setup_dma(&self, topo: &mut PciTopology, tables: &mut IodaTables) {
        let schedule: Vec<_> = tables.dma.weighted().collect();
        match self.config.generation {
            IodaGeneration::Ioda1 => {
                let budget = self.config.tce32_segment_count();
                let pe_count = tables.dma.pe_count;
                let total_weight = tables.dma.total_weight;
                let residual = budget.saturating_sub(pe_count);
                tracing::info!(
                    segments = budget,
                    pe_count,
                    total_weight,
                    "assigning 32-bit DMA segments"
                );

                let mut remaining = budget;
                let mut base = 0;
                for (pe, weight) in schedule {
                    if remaining == 0 {
                        tracing::warn!(%pe, weight, "no 32-bit DMA segments left");
                        continue;
                    }
                    let mut segs = 1;
                    if residual > 0 {
                        segs += (weight * residual + total_weight / 2) / total_weight;
                        segs = segs.min(remaining);
                    }
                    tracing::info!(%pe, weight, segs, "assigned 32-bit DMA segments");
                    if let Err(err) = self.setup_legacy_dma(topo, tables, pe, base, segs) {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            %pe,
                            "failed to set up 32-bit DMA"
                        );
                    }
                    remaining -= segs;
                    base += segs;
                }
            }
            IodaGeneration::Ioda2 => {
                for (pe, _) in schedule {
                    if let Err(err) = self.setup_modern_dma(topo, tables, pe) {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            %pe,
                            "failed to set up DMA"
                        );
                    }
                }
            }
        }
    }

    fn setup_legacy_dma(
        &self,
        topo: &mut PciTopology,
        tables: &mut IodaTables,
        pe_num: PeNumber,
        base: u32,
        segs: u32,
    ) -> Result<(), IodaError> {
        let pe = tables.alloc.get_mut(pe_num)?;
        if pe.dma.tce32_seg.is_some() {
            return Err(IodaError::DmaAlreadyBound(pe_num));
        }

        let invalidate = self.tce_kill.as_ref().map(|reg| {
            TceInvalidate::new(InvalidateScheme::Ioda1 { paired: true }, reg.clone())
        });
        let table = TceTable::new(
            (base as u64) << TCE32_SEGMENT_SHIFT,
            TCE32_TABLE_SIZE * segs as u64,
            IO_PAGE_SHIFT_4K,
            invalidate,
        );
        tracing::debug!(
            pe = %pe_num,
            window = ?table.window(),
            "32-bit TCE table"
        );

        for i in 0..segs {
            self.firmware
                .map_pe_dma_window(
                    pe_num,
                    (base + i) as u16,
                    1,
                    table.table_addr() + TCE32_TABLE_SIZE * i as u64,
                    TCE32_TABLE_SIZE,
                    SZ_4K,
                )
                .map_err(|e| IodaError::firmware("map_pe_dma_window", Some(pe_num), e))?;
        }

        pe.dma.tce32_seg = Some(base);
        pe.dma.tce32_segs = segs;
        pe.dma.tce32 = Some(table);
        pe.state = PeState::DmaBound;
        attach_translated(topo, pe_num);
        Ok(())
    }

    /// Gives `pe` the whole 32-bit DMA space and enables bypass.
    pub(crate) fn setup_modern_dma(
        &self,
        topo: &mut PciTopology,
        tables: &mut IodaTables,
        pe_num: PeNumber,
    ) -> Result<(), IodaError> {
        let pe = tables.alloc.get_mut(pe_num)?;
        if pe.dma.tce32_seg.is_some() {
            return Err(IodaError::DmaAlreadyBound(pe_num));
        }

        let end = 1u64 << self.config.m32.pci_base.ilog2();
        let table_size = (end / SZ_4K) * 8;
        let invalidate = self.tce_kill.as_ref().map(|reg| {
            TceInvalidate::new(InvalidateScheme::Ioda2 { pe: pe_num }, reg.clone())
        });
        let table = TceTable::new(0, table_size, IO_PAGE_SHIFT_4K, invalidate);
        tracing::debug!(pe = %pe_num, end = format_args!("{end:#x}"), "32-bit TCE table");

        self.firmware
            .map_pe_dma_window(
                pe_num,
                window_id(pe_num),
                1,
                table.table_addr(),
                table_size,
                SZ_4K,
            )
            .map_err(|e| IodaError::firmware("map_pe_dma_window", Some(pe_num), e))?;

        pe.dma.tce32_seg = Some(0);
        pe.dma.tce32_segs = (end >> TCE32_SEGMENT_SHIFT).max(1) as u32;
        pe.dma.tce32 = Some(table);
        pe.dma.bypass_base = BYPASS_BASE;
        pe.state = PeState::DmaBound;
        attach_translated(topo, pe_num);

        if let Err(err) = self.set_bypass_locked(topo, tables, pe_num, true) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                pe = %pe_num,
                "DMA bypass not available"
            );
        }
        Ok(())
    }

    fn set_bypass_locked(
        &self,
        topo: &mut PciTopology,
        tables: &mut IodaTables,
        pe_num: PeNumber,
        enable: bool,
    ) -> Result<(), IodaError> {
        let pe = tables.alloc.get_mut(pe_num)?;
        if pe.dma.tce32.is_none() {
            return Err(IodaError::InvalidArgument("PE has no DMA setup"));
        }
        let size = if enable {
            self.config.dram_end.next_power_of_two()
        } else {
            0
        };
        tracing::info!(pe = %pe_num, enable, "64-bit DMA bypass");
        self.firmware
            .map_pe_dma_window_real(pe_num, bypass_window_id(pe_num), pe.dma.bypass_base, size)
            .map_err(|err| {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    pe = %pe_num,
                    "failed to configure bypass window"
                );
                IodaError::firmware("map_pe_dma_window_real", Some(pe_num), err)
            })?;
        pe.dma.bypass_enabled = enable;
        if !enable {
            attach_translated(topo, pe_num);
        }
        Ok(())
    }

    /// Locks the tables and checks that `pe` has modern DMA windows.
    fn modern_dma_pe(&self, pe: PeNumber) -> Result<MutexGuard<'_, IodaTables>, IodaError> {
        if self.config.generation != IodaGeneration::Ioda2 {
            return Err(IodaError::Unsupported("64-bit DMA windows need IODA2"));
        }
        let tables = self.tables.lock();
        if tables.alloc.get(pe)?.dma.tce32.is_none() {
            return Err(IodaError::InvalidArgument("PE has no DMA setup"));
        }
        Ok(tables)
    }

    /// Enables or disables the untranslated bypass window of `pe`.
    ///
    /// Disabling points the PE's functions back at the translation table.
    pub fn set_bypass(
        &self,
        topo: &mut PciTopology,
        pe: PeNumber,
        enable: bool,
    ) -> Result<(), IodaError> {
        let mut tables = self.modern_dma_pe(pe)?;
        self.set_bypass_locked(topo, &mut tables, pe, enable)
    }

    /// Hands `pe` to or takes it back from a pass-through user. Bypass is
    /// off while the PE is owned.
    pub fn take_ownership(
        &self,
        topo: &mut PciTopology,
        pe: PeNumber,
        enable: bool,
    ) -> Result<(), IodaError> {
        self.set_bypass(topo, pe, !enable)
    }

    /// Attaches `function` to its PE's translation table. Functions without
    /// a PE are left alone.
    pub fn dma_dev_setup(&self, topo: &mut PciTopology, function: FunctionId) {
        let Some(pe) = topo.function(function).pe_number() else {
            return;
        };
        let bound = self
            .tables
            .lock()
            .alloc
            .get(pe)
            .is_ok_and(|p| p.dma.tce32.is_some());
        if bound {
            topo.function_mut(function).dma = Some(DmaPath::Translated { pe });
        }
    }

    /// Selects the DMA path for `function` given the highest address it can
    /// generate.
    pub fn dma_set_mask(
        &self,
        topo: &mut PciTopology,
        function: FunctionId,
        mask: u64,
    ) -> Result<DmaPath, IodaError> {
        let pe_num = topo.function(function).pe_number().ok_or(IodaError::NoPe)?;
        let path = {
            let tables = self.tables.lock();
            let pe = tables.alloc.get(pe_num)?;
            let top = (pe.dma.bypass_base + self.config.dram_end).saturating_sub(1);
            if pe.dma.bypass_enabled && mask >= top {
                DmaPath::Bypass {
                    offset: pe.dma.bypass_base,
                }
            } else {
                DmaPath::Translated { pe: pe_num }
            }
        };
        tracing::info!(
            rid = %topo.rid(function),
            mask = format_args!("{mask:#x}"),
            ?path,
            "DMA mask set"
        );
        topo.function_mut(function).dma = Some(path);
        Ok(path)
    }

    /// The smallest mask that lets `function` reach all of memory through
    /// the fastest available path.
    pub fn dma_required_mask(
        &self,
        topo: &PciTopology,
        function: FunctionId,
    ) -> Result<u64, IodaError> {
        let pe_num = topo.function(function).pe_number().ok_or(IodaError::NoPe)?;
        let tables = self.tables.lock();
        let pe = tables.alloc.get(pe_num)?;
        let end = if pe.dma.bypass_enabled {
            pe.dma.bypass_base + self.config.dram_end
        } else {
            self.config.dram_end
        };
        Ok(mask_covering(end))
    }

    /// Reports whether `pe` can create a dynamic DMA window.
    pub fn ddw_query(&self, pe: PeNumber) -> Result<DdwInfo, IodaError> {
        let tables = self.modern_dma_pe(pe)?;
        Ok(if tables.alloc.get(pe)?.dma.tce64.is_some() {
            DdwInfo {
                windows_available: 0,
                page_size_mask: 0,
            }
        } else {
            DdwInfo {
                windows_available: 1,
                page_size_mask: DdwInfo::DDW_PGSIZE_4K
                    | DdwInfo::DDW_PGSIZE_64K
                    | DdwInfo::DDW_PGSIZE_16M,
            }
        })
    }

    /// Creates the dynamic DMA window of `pe` with `1 << page_shift` IO
    /// pages covering `1 << window_shift` bytes, and returns its bus
    /// address range.
    ///
    /// The window replaces the bypass window.
    pub fn ddw_create(
        &self,
        pe_num: PeNumber,
        page_shift: u32,
        window_shift: u32,
    ) -> Result<Range<u64>, IodaError> {
        if ![SZ_4K, SZ_64K, SZ_16M].contains(&1u64.checked_shl(page_shift).unwrap_or(0)) {
            return Err(IodaError::InvalidArgument("unsupported IO page size"));
        }
        if window_shift < page_shift || window_shift >= 64 {
            return Err(IodaError::InvalidArgument("DMA window size out of range"));
        }
        if 1u64 << window_shift > self.config.memory_hotplug_max.next_power_of_two() {
            return Err(IodaError::InvalidArgument(
                "DMA window larger than addressable memory",
            ));
        }

        let mut tables = self.modern_dma_pe(pe_num)?;
        let pe = tables.alloc.get_mut(pe_num)?;
        if pe.dma.tce64.is_some() {
            return Err(IodaError::Busy);
        }

        let table_size = SZ_4K.max(8u64 << (window_shift - page_shift));
        let invalidate = pe.dma.tce32.as_ref().and_then(|t| t.invalidator().cloned());
        let table = TceTable::new(pe.dma.bypass_base, table_size, page_shift, invalidate);
        let window = table.window();
        tracing::info!(
            pe = %pe_num,
            window = ?window,
            page_shift,
            table_size = format_args!("{table_size:#x}"),
            "creating dynamic DMA window"
        );

        self.firmware
            .map_pe_dma_window(
                pe_num,
                bypass_window_id(pe_num),
                1,
                table.table_addr(),
                table_size,
                1 << page_shift,
            )
            .map_err(|e| IodaError::firmware("map_pe_dma_window", Some(pe_num), e))?;

        pe.dma.tce64 = Some(table);
        pe.dma.bypass_enabled = false;
        Ok(window)
    }

    /// Removes the dynamic DMA window of `pe`.
    pub fn ddw_remove(&self, pe_num: PeNumber) -> Result<(), IodaError> {
        let mut tables = self.modern_dma_pe(pe_num)?;
        let pe = tables.alloc.get_mut(pe_num)?;
        let mut table = pe
            .dma
            .tce64
            .take()
            .ok_or(IodaError::InvalidArgument("no dynamic DMA window"))?;
        tracing::info!(pe = %pe_num, "removing dynamic DMA window");
        table.clear();
        self.firmware
            .map_pe_dma_window(pe_num, bypass_window_id(pe_num), 0, 0, 0, 0)
            .map_err(|err| {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    pe = %pe_num,
                    "failed to unmap dynamic DMA window"
                );
                IodaError::firmware("map_pe_dma_window", Some(pe_num), err)
            })
    }

    /// Removes the dynamic DMA window of `pe` if there is one.
    pub fn ddw_reset(&self, pe: PeNumber) -> Result<(), IodaError> {
        let active = self.modern_dma_pe(pe)?.alloc.get(pe)?.dma.tce64.is_some();
        if !active {
            return Ok(());
        }
        self.ddw_remove(pe)
    }

    /// Maps IO pages at `bus_addr` in whichever window of `pe` contains it.
    pub fn map_dma_pages(
        &self,
        pe_num: PeNumber,
        bus_addr: u64,
        pages: &[u64],
        direction: DmaDirection,
    ) -> Result<(), IodaError> {
        let mut tables = self.tables.lock();
        let (table, index) = table_for(&mut tables.alloc.get_mut(pe_num)?.dma, bus_addr)?;
        table.map(index, pages, direction, false)
    }

    /// Unmaps `npages` IO pages at `bus_addr`.
    pub fn unmap_dma_pages(
        &self,
        pe_num: PeNumber,
        bus_addr: u64,
        npages: usize,
    ) -> Result<(), IodaError> {
        let mut tables = self.tables.lock();
        let (table, index) = table_for(&mut tables.alloc.get_mut(pe_num)?.dma, bus_addr)?;
        table.unmap(index, npages, false)
    }

    /// Unbinds every DMA window of `pe` and drops its tables.
    pub(crate) fn release_dma(
        &self,
        tables: &mut IodaTables,
        pe_num: PeNumber,
    ) -> Result<(), IodaError> {
        let pe = tables.alloc.get_mut(pe_num)?;
        let Some(mut tce32) = pe.dma.tce32.take() else {
            return Ok(());
        };
        let fw = self.firmware.as_ref();
        let warn = |op: &str, err: FirmwareError| {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                pe = %pe_num,
                op,
                "failed to unbind DMA window"
            );
        };

        if let Some(mut tce64) = pe.dma.tce64.take() {
            tce64.clear();
            if let Err(err) = fw.map_pe_dma_window(pe_num, bypass_window_id(pe_num), 0, 0, 0, 0) {
                warn("map_pe_dma_window", err);
            }
        }

        match self.config.generation {
            IodaGeneration::Ioda1 => {
                let base = pe.dma.tce32_seg.unwrap_or(0);
                for i in 0..pe.dma.tce32_segs {
                    if let Err(err) = fw.map_pe_dma_window(
                        pe_num,
                        (base + i) as u16,
                        1,
                        tce32.table_addr(),
                        0,
                        SZ_4K,
                    ) {
                        warn("map_pe_dma_window", err);
                    }
                }
            }
            IodaGeneration::Ioda2 => {
                if let Err(err) = fw.map_pe_dma_window(
                    pe_num,
                    window_id(pe_num),
                    1,
                    tce32.table_addr(),
                    0,
                    SZ_4K,
                ) {
                    warn("map_pe_dma_window", err);
                }
                if let Err(err) = fw.map_pe_dma_window_real(
                    pe_num,
                    bypass_window_id(pe_num),
                    pe.dma.bypass_base,
                    0,
                ) {
                    warn("map_pe_dma_window_real", err);
                }
            }
        }

        tce32.clear();
        pe.dma = PeDma::default();
        if pe.state == PeState::DmaBound {
            pe.state = PeState::Configured;
        }
        tracing::debug!(pe = %pe_num, "DMA windows released");
        Ok(())
    }
}

/// The table of `dma` translating `bus_addr`, and the entry index.
fn table_for(dma: &mut PeDma, bus_addr: u64) -> Result<(&mut TceTable, usize), IodaError> {
    let table = [dma.tce64.as_mut(), dma.tce32.as_mut()]
        .into_iter()
        .flatten()
        .find(|t| t.window().contains(&bus_addr))
        .ok_or(IodaError::InvalidArgument("address outside DMA windows"))?;
    let index = ((bus_addr - table.window().start) >> table.page_shift()) as usize;
    Ok((table, index))
}
