// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MSI routing.

use crate::config::IodaGeneration;
use crate::config::MsiRange;
use crate::error::IodaError;
use crate::phb::IodaPhb;
use crate::topology::FunctionId;
use crate::topology::PciTopology;
use bitvec::vec::BitVec;

/// Address and data a function writes to raise an MSI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiMessage {
    /// Target address. The high half is zero for 32-bit MSIs.
    pub address: u64,
    /// Payload.
    pub data: u32,
}

/// Allocation state of the bridge's MSI hardware IRQs.
#[derive(Debug)]
pub(crate) struct MsiBitmap {
    base: u32,
    bitmap: BitVec,
}

impl MsiBitmap {
    pub fn new(range: MsiRange) -> Self {
        Self {
            base: range.base,
            bitmap: BitVec::repeat(false, range.count as usize),
        }
    }

    fn contains(&self, hwirq: u32) -> bool {
        hwirq >= self.base && ((hwirq - self.base) as usize) < self.bitmap.len()
    }

    /// Claims `count` consecutive IRQs and returns the first.
    pub fn alloc(&mut self, count: u32) -> Option<u32> {
        let count = count as usize;
        let mut start = 0;
        while start + count <= self.bitmap.len() {
            match self.bitmap[start..start + count].last_one() {
                Some(offset) => start += offset + 1,
                None => {
                    self.bitmap[start..start + count].fill(true);
                    return Some(self.base + start as u32);
                }
            }
        }
        None
    }

    pub fn free(&mut self, hwirq: u32, count: u32) {
        if !self.contains(hwirq) {
            return;
        }
        let start = (hwirq - self.base) as usize;
        let end = (start + count as usize).min(self.bitmap.len());
        self.bitmap[start..end].fill(false);
    }
}

impl IodaPhb {
    /// Allocates `count` consecutive MSI hardware IRQs.
    pub fn alloc_msi_irqs(&self, count: u32) -> Result<u32, IodaError> {
        if count == 0 {
            return Err(IodaError::InvalidArgument("zero MSIs requested"));
        }
        let mut tables = self.tables.lock();
        let msi = tables
            .msi
            .as_mut()
            .ok_or(IodaError::Unsupported("bridge has no MSI range"))?;
        msi.alloc(count).ok_or(IodaError::Busy)
    }

    /// Returns IRQs obtained from [`Self::alloc_msi_irqs`].
    pub fn free_msi_irqs(&self, hwirq: u32, count: u32) {
        if let Some(msi) = self.tables.lock().msi.as_mut() {
            msi.free(hwirq, count);
        }
    }

    /// Routes MSI hardware IRQ `hwirq` to the PE of `function` and returns
    /// the message the function must be programmed with.
    ///
    /// Functions flagged as unable to use 64-bit MSI addresses always get a
    /// 32-bit message.
    pub fn msi_setup(
        &self,
        topo: &PciTopology,
        function: FunctionId,
        hwirq: u32,
        mut is_64: bool,
    ) -> Result<MsiMessage, IodaError> {
        let f = topo.function(function);
        let rid = topo.rid(function);
        let pe_num = f.pe_number().ok_or(IodaError::NoPe)?;
        let mve = {
            let tables = self.tables.lock();
            let msi = tables
                .msi
                .as_ref()
                .ok_or(IodaError::Unsupported("bridge has no MSI range"))?;
            if !msi.contains(hwirq) {
                return Err(IodaError::InvalidArgument("IRQ outside MSI range"));
            }
            tables
                .alloc
                .get(pe_num)?
                .mve
                .ok_or(IodaError::NoMve(pe_num))?
        };
        if f.no_64bit_msi() {
            is_64 = false;
        }

        let xive = hwirq - self.config.msi.map_or(0, |m| m.base);
        let fw = self.firmware.as_ref();
        fw.set_xive_pe(pe_num, xive).map_err(|err| {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                %rid,
                pe = %pe_num,
                xive,
                "failed to route XIVE to PE"
            );
            IodaError::firmware("set_xive_pe", Some(pe_num), err)
        })?;

        let msg = if is_64 {
            let (address, data) = fw
                .get_msi_64(mve, xive, 1)
                .map_err(|e| IodaError::firmware("get_msi_64", Some(pe_num), e))?;
            MsiMessage { address, data }
        } else {
            let (address, data) = fw
                .get_msi_32(mve, xive, 1)
                .map_err(|e| IodaError::firmware("get_msi_32", Some(pe_num), e))?;
            MsiMessage {
                address: address.into(),
                data,
            }
        };

        tracing::debug!(
            %rid,
            pe = %pe_num,
            hwirq,
            xive,
            is_64,
            address = format_args!("{:#x}", msg.address),
            data = msg.data,
            "MSI set up"
        );
        Ok(msg)
    }

    /// Signals end of interrupt for an MSI to the bridge.
    pub fn msi_eoi(&self, hwirq: u32) -> Result<(), IodaError> {
        if self.config.generation != IodaGeneration::Ioda2 {
            return Err(IodaError::Unsupported("MSI EOI needs IODA2"));
        }
        self.firmware
            .msi_eoi(hwirq)
            .map_err(|e| IodaError::firmware("msi_eoi", None, e))
    }
}
