// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host bridge configuration.

use crate::error::IodaError;

/// IODA hardware generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IodaGeneration {
    /// Legacy bridges: shared 32-bit DMA segments, per-PE MSI validation
    /// entries, IO segment maps.
    Ioda1,
    /// Modern bridges: per-PE 32-bit DMA windows, bypass, M64 and SR-IOV.
    Ioda2,
}

/// An address window decoded by the bridge, in PCI bus addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    /// First PCI bus address.
    pub pci_base: u64,
    /// Size in bytes.
    pub size: u64,
}

/// Hardware IRQ numbers available for MSIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiRange {
    /// First hardware IRQ.
    pub base: u32,
    /// Number of IRQs.
    pub count: u32,
}

/// Description of one IODA host bridge, as read from firmware.
#[derive(Debug, Clone)]
pub struct PhbConfig {
    /// Hardware generation.
    pub generation: IodaGeneration,
    /// Number of PE slots.
    pub total_pe: u32,
    /// PE number excluded from allocation.
    pub reserved_pe: u32,
    /// 32-bit MMIO window, not counting the MSI region above it.
    pub m32: WindowConfig,
    /// Legacy IO window.
    pub io: Option<WindowConfig>,
    /// 64-bit prefetchable window shared by all PEs.
    pub m64: Option<WindowConfig>,
    /// MSI hardware IRQs.
    pub msi: Option<MsiRange>,
    /// End of system RAM. The bypass window covers at least this much.
    pub dram_end: u64,
    /// Largest address hot-plugged memory may reach.
    pub memory_hotplug_max: u64,
}

/// Size of the MSI region at the top of the M32 window.
const M32_MSI_SIZE: u64 = 0x1_0000;
/// Size of one legacy 32-bit DMA segment.
pub(crate) const TCE32_SEGMENT_SHIFT: u32 = 28;

impl PhbConfig {
    /// A bridge with `total_pe` slots, PE 0 reserved and nothing else set.
    pub fn new(generation: IodaGeneration, total_pe: u32) -> Self {
        Self {
            generation,
            total_pe,
            reserved_pe: 0,
            m32: WindowConfig {
                pci_base: 0,
                size: 0,
            },
            io: None,
            m64: None,
            msi: None,
            dram_end: 0,
            memory_hotplug_max: 0,
        }
    }

    /// Checks the configuration for internal consistency.
    pub fn validate(&self) -> Result<(), IodaError> {
        if self.total_pe == 0 {
            return Err(IodaError::InvalidConfig("no PE slots"));
        }
        if self.reserved_pe >= self.total_pe {
            return Err(IodaError::InvalidConfig("reserved PE out of range"));
        }
        if self.generation == IodaGeneration::Ioda2 && self.m32.pci_base == 0 {
            return Err(IodaError::InvalidConfig(
                "32-bit DMA space below M32 is empty",
            ));
        }
        if let Some(m64) = &self.m64 {
            if m64.size == 0 || m64.size % self.total_pe as u64 != 0 {
                return Err(IodaError::InvalidConfig(
                    "M64 window does not split into PE segments",
                ));
            }
        }
        if self.memory_hotplug_max < self.dram_end {
            return Err(IodaError::InvalidConfig(
                "hot-plug memory limit below end of RAM",
            ));
        }
        Ok(())
    }

    /// Size of one M32 segment. The MSI region counts towards the window.
    pub fn m32_segment_size(&self) -> u64 {
        (self.m32.size + M32_MSI_SIZE) / self.total_pe as u64
    }

    /// Size of one IO segment.
    pub fn io_segment_size(&self) -> u64 {
        self.io.map_or(0, |io| io.size / self.total_pe as u64)
    }

    /// Number of 256 MiB 32-bit DMA segments below the M32 window.
    pub fn tce32_segment_count(&self) -> u32 {
        (self.m32.pci_base >> TCE32_SEGMENT_SHIFT) as u32
    }
}
