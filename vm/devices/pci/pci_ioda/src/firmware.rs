// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Firmware call surface used to program a host bridge's IODA tables.
//!
//! One [`IodaFirmware`] instance is bound to one host bridge. Every call is
//! synchronous and individually atomic; sequences of calls are not.

use crate::pe::PeNumber;
use crate::rid::Rid;
use thiserror::Error;

/// A failing firmware status code.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("firmware status {0}")]
pub struct FirmwareError(pub i64);

/// Result of a firmware call.
pub type FwResult<T = ()> = Result<T, FirmwareError>;

/// Freeze state of a PE as reported by firmware.
///
/// Variants are ordered by severity, so the worst state of a group is the
/// maximum over its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FreezeState {
    /// Not frozen.
    NotFrozen,
    /// MMIO is frozen.
    MmioFrozen,
    /// DMA is frozen.
    DmaFrozen,
    /// MMIO and DMA are frozen.
    MmioDmaFrozen,
    /// The PE is being reset.
    Reset,
    /// The state cannot be determined right now.
    TempUnavailable,
    /// The PE is permanently unavailable.
    PermUnavailable,
}

/// Which paths to freeze.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeSet {
    /// MMIO only.
    Mmio,
    /// DMA only.
    Dma,
    /// MMIO and DMA.
    All,
}

/// Which paths to unfreeze.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeClear {
    /// MMIO only.
    Mmio,
    /// DMA only.
    Dma,
    /// MMIO and DMA.
    All,
}

/// How many high-order bus number bits a PELT entry compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusCompare {
    /// Compare all eight bits: exactly one bus.
    All,
    /// Compare the top seven bits: two buses.
    Bits7,
    /// Compare the top six bits: four buses.
    Bits6,
    /// Compare the top five bits: eight buses.
    Bits5,
    /// Compare the top four bits: sixteen buses.
    Bits4,
    /// Compare the top three bits: thirty-two buses.
    Bits3,
}

impl BusCompare {
    /// The rule matching `count` consecutive buses, if one exists.
    pub fn for_bus_count(count: u32) -> Option<Self> {
        Some(match count {
            1 => Self::All,
            2 => Self::Bits7,
            4 => Self::Bits6,
            8 => Self::Bits5,
            16 => Self::Bits4,
            32 => Self::Bits3,
            _ => return None,
        })
    }
}

/// Whether a PELT entry compares the device number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCompare {
    /// Any device matches.
    Ignore,
    /// The device number must match.
    Compare,
}

/// Whether a PELT entry compares the function number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCompare {
    /// Any function matches.
    Ignore,
    /// The function number must match.
    Compare,
}

/// Map or unmap a PELT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeMapAction {
    /// Install the entry.
    Map,
    /// Remove the entry.
    Unmap,
}

/// Add or remove a PE from a PELTV row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainAction {
    /// Add the child to the parent's row.
    Add,
    /// Remove the child from the parent's row.
    Remove,
}

/// Address space windows decoded by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowType {
    /// Legacy IO space.
    Io,
    /// 32-bit memory.
    M32,
    /// 64-bit prefetchable memory.
    M64,
}

/// Window register enable mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioEnable {
    /// Window disabled.
    Disable,
    /// Window routes to a single PE.
    Enable,
    /// Window is split into equal segments, one per PE.
    Split,
}

/// Enable or disable an MSI validation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MveAction {
    /// Disable the entry.
    Disable,
    /// Enable the entry.
    Enable,
}

/// Scope of a bridge reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Reset every IODA table to its power-on state.
    IodaTables,
}

/// Reset line action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetAction {
    /// Assert the reset.
    Assert,
    /// Deassert the reset.
    Deassert,
}

/// Firmware operations needed to program one IODA host bridge.
pub trait IodaFirmware: Send + Sync {
    /// Freezes the paths selected by `action` for `pe`.
    fn eeh_freeze_set(&self, pe: PeNumber, action: FreezeSet) -> FwResult;

    /// Clears the freeze selected by `action` for `pe`.
    fn eeh_freeze_clear(&self, pe: PeNumber, action: FreezeClear) -> FwResult;

    /// Reads the freeze state of `pe`.
    fn eeh_freeze_status(&self, pe: PeNumber) -> FwResult<FreezeState>;

    /// Maps or unmaps the PELT entry routing the RID pattern to `pe`.
    fn set_pe(
        &self,
        pe: PeNumber,
        rid: Rid,
        bus: BusCompare,
        device: DeviceCompare,
        function: FunctionCompare,
        action: PeMapAction,
    ) -> FwResult;

    /// Adds or removes `child` from the PELTV row of `parent`.
    fn set_peltv(&self, parent: PeNumber, child: PeNumber, action: DomainAction) -> FwResult;

    /// Binds a translated DMA window. A zero `table_size` unmaps it.
    fn map_pe_dma_window(
        &self,
        pe: PeNumber,
        window_id: u16,
        levels: u16,
        table_addr: u64,
        table_size: u64,
        page_size: u64,
    ) -> FwResult;

    /// Binds an untranslated DMA window. A zero `pci_size` unmaps it.
    fn map_pe_dma_window_real(
        &self,
        pe: PeNumber,
        window_id: u16,
        pci_start: u64,
        pci_size: u64,
    ) -> FwResult;

    /// Routes one segment of a window to `pe`.
    fn map_pe_mmio_window(
        &self,
        pe: PeNumber,
        window_type: WindowType,
        window_num: u16,
        segment: u16,
    ) -> FwResult;

    /// Programs the address range decoded by a window register.
    fn set_phb_mem_window(
        &self,
        window_type: WindowType,
        window_num: u16,
        addr: u64,
        pci_addr: u64,
        size: u64,
    ) -> FwResult;

    /// Sets the enable mode of a window register.
    fn phb_mmio_enable(
        &self,
        window_type: WindowType,
        window_num: u16,
        mode: MmioEnable,
    ) -> FwResult;

    /// Points MSI validation entry `mve` at `pe`.
    fn set_mve(&self, mve: u32, pe: PeNumber) -> FwResult;

    /// Enables or disables MSI validation entry `mve`.
    fn set_mve_enable(&self, mve: u32, action: MveAction) -> FwResult;

    /// Routes interrupt source `xive` to `pe`.
    fn set_xive_pe(&self, pe: PeNumber, xive: u32) -> FwResult;

    /// Returns the 32-bit MSI address and data for `xive`.
    fn get_msi_32(&self, mve: u32, xive: u32, count: u8) -> FwResult<(u32, u32)>;

    /// Returns the 64-bit MSI address and data for `xive`.
    fn get_msi_64(&self, mve: u32, xive: u32, count: u8) -> FwResult<(u64, u32)>;

    /// Signals end of interrupt for an MSI.
    fn msi_eoi(&self, hw_irq: u32) -> FwResult;

    /// Resets part of the bridge.
    fn pci_reset(&self, scope: ResetScope, action: ResetAction) -> FwResult;
}
