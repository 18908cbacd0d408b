// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! M32 and IO segment maps.

use crate::error::IodaError;
use crate::firmware::IodaFirmware;
use crate::firmware::WindowType;
use crate::pe::PeBinding;
use crate::pe::PeNumber;
use crate::phb::IodaPhb;
use crate::phb::IodaTables;
use crate::topology::PciTopology;
use crate::topology::Resource;

/// Routes every segment of `window` covered by `r` to `pe`. Stops at the
/// first firmware failure.
fn map_segments(
    fw: &dyn IodaFirmware,
    pe: PeNumber,
    r: &Resource,
    window_base: u64,
    segment_size: u64,
    segmap: &mut [Option<PeNumber>],
    window_type: WindowType,
) {
    if !r.assigned || r.size() == 0 || segment_size == 0 || r.start < window_base {
        return;
    }
    let mut start = r.start - window_base;
    let end = r.end - window_base;
    let mut index = (start / segment_size) as usize;
    while index < segmap.len() && start <= end {
        segmap[index] = Some(pe);
        if let Err(err) = fw.map_pe_mmio_window(pe, window_type, 0, index as u16) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                %pe,
                ?window_type,
                segment = index,
                "failed to map segment"
            );
            break;
        }
        start += segment_size;
        index += 1;
    }
}

impl IodaPhb {
    /// Routes the M32 and IO segments decoded by a bus PE's windows to it.
    pub(crate) fn setup_pe_segments(
        &self,
        topo: &PciTopology,
        tables: &mut IodaTables,
        pe_num: PeNumber,
    ) -> Result<(), IodaError> {
        let bus = match tables.alloc.get(pe_num)?.binding {
            Some(PeBinding::Bus(bus) | PeBinding::BusAll(bus)) => bus,
            _ => return Ok(()),
        };
        let fw = self.firmware.as_ref();
        let m32 = self.config.m32;
        let m32_end = m32.pci_base + m32.size;

        for r in topo.bus(bus).resources() {
            if r.flags.io() {
                if let (Some(io), Some(segmap)) = (self.config.io, tables.io_segmap.as_mut()) {
                    map_segments(
                        fw,
                        pe_num,
                        r,
                        io.pci_base,
                        self.config.io_segment_size(),
                        segmap,
                        WindowType::Io,
                    );
                }
            } else if r.flags.mem() && r.start >= m32.pci_base && r.end < m32_end {
                map_segments(
                    fw,
                    pe_num,
                    r,
                    m32.pci_base,
                    self.config.m32_segment_size(),
                    &mut tables.m32_segmap,
                    WindowType::M32,
                );
            }
        }
        Ok(())
    }
}
