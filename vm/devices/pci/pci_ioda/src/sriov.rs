// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SR-IOV virtual function PEs.
//!
//! Each VF gets its own PE out of a contiguous run of PE numbers. VF BARs
//! are decoded by dedicated M64 window registers: either one split window
//! over the whole BAR, whose segment `i` routes to PE `i`, or for large VF
//! BARs up to [`M64_PER_IOV`] single-PE windows each covering a group of
//! VFs.

use crate::SZ_64M;
use crate::config::IodaGeneration;
use crate::error::IodaError;
use crate::firmware::DomainAction;
use crate::firmware::MmioEnable;
use crate::firmware::WindowType;
use crate::m64::M64Window;
use crate::pe::PeBinding;
use crate::pe::PeNumber;
use crate::phb::IodaPhb;
use crate::phb::IodaTables;
use crate::topology::FunctionId;
use crate::topology::PciTopology;
use crate::topology::Resource;
use crate::topology::SriovCapability;

/// Most M64 windows used for one VF BAR.
const M64_PER_IOV: u32 = 4;

/// Per-PF SR-IOV bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct SriovState {
    /// M64 windows per VF BAR, 1 or [`M64_PER_IOV`].
    m64_per_iov: u32,
    /// Number of per-VF slices each VF BAR is sized for.
    vfs: u32,
    /// PE of VF 0 while VFs are enabled.
    offset: Option<PeNumber>,
    vf_pes: u16,
    m64_wins: Vec<u32>,
    shifted: bool,
}

/// VF BARs decoded through M64.
fn m64_bars(cap: &SriovCapability) -> impl Iterator<Item = (usize, &Resource)> {
    cap.bars
        .iter()
        .enumerate()
        .filter(|(_, bar)| bar.assigned && bar.is_mem64_pref())
}

/// Size of one VF's slice of `bar`.
fn vf_bar_size(cap: &SriovCapability, bar: &Resource, vfs: u32) -> u64 {
    let slices = if vfs != 0 { vfs } else { cap.total_vfs as u32 };
    if slices == 0 {
        return 0;
    }
    bar.size() / slices as u64
}

/// Index ranges of VFs sharing one M64 window.
fn vf_groups(vf_num: u16) -> impl Iterator<Item = std::ops::Range<u16>> {
    let per_group = vf_num.next_power_of_two() / M64_PER_IOV as u16;
    (0..M64_PER_IOV as u16)
        .map(move |g| (g * per_group).min(vf_num)..((g + 1) * per_group).min(vf_num))
}

impl IodaPhb {
    /// Sizes every unassigned VF BAR so that M64 can decode it: a slice per
    /// PE, or for VF slices above 64 MiB, a power-of-two number of slices.
    pub fn fixup_sriov_resources(&self, topo: &mut PciTopology) {
        if self.config.generation != IodaGeneration::Ioda2 {
            return;
        }
        let mut tables = self.tables.lock();
        for pf in topo.functions().collect::<Vec<_>>() {
            if tables.sriov.contains_key(&pf) {
                continue;
            }
            let rid = topo.rid(pf);
            let Some(cap) = topo.sriov_mut(pf) else {
                continue;
            };
            if cap.total_vfs == 0 {
                continue;
            }

            let mut m64_per_iov = 1;
            let mut mul = self.config.total_pe;
            let mut pending = Vec::new();
            for (i, bar) in cap.bars.iter().enumerate() {
                if bar.flags.into_bits() == 0 || bar.assigned {
                    continue;
                }
                if !bar.is_mem64_pref() {
                    tracing::warn!(%rid, bar = i, "VF BAR is not 64-bit prefetchable");
                    continue;
                }
                pending.push(i);
                if vf_bar_size(cap, bar, 0) > SZ_64M && m64_per_iov == 1 {
                    tracing::info!(%rid, bar = i, "VF BAR above 64 MiB, rounding VF count up");
                    m64_per_iov = M64_PER_IOV;
                    mul = (cap.total_vfs as u32).next_power_of_two();
                }
            }

            for i in pending {
                let size = vf_bar_size(cap, &cap.bars[i], 0);
                let bar = &mut cap.bars[i];
                bar.end = bar.start + size * mul as u64 - 1;
                tracing::debug!(
                    %rid,
                    bar = i,
                    start = format_args!("{:#x}", bar.start),
                    end = format_args!("{:#x}", bar.end),
                    "VF BAR resized"
                );
            }

            tables.sriov.insert(
                pf,
                SriovState {
                    m64_per_iov,
                    vfs: mul,
                    ..Default::default()
                },
            );
        }
    }

    /// Size of one VF's slice of VF BAR `bar` of `pf`.
    pub fn sriov_resource_size(&self, topo: &PciTopology, pf: FunctionId, bar: usize) -> u64 {
        let Some(cap) = topo.function(pf).sriov() else {
            return 0;
        };
        let Some(r) = cap.bars.get(bar) else {
            return 0;
        };
        let vfs = self.tables.lock().sriov.get(&pf).map_or(0, |s| s.vfs);
        vf_bar_size(cap, r, vfs)
    }

    /// Alignment for VF BAR `bar` of `pf`, given the per-VF alignment
    /// `align`.
    pub fn sriov_resource_alignment(
        &self,
        topo: &PciTopology,
        pf: FunctionId,
        bar: usize,
        align: u64,
    ) -> u64 {
        let size = topo
            .function(pf)
            .sriov()
            .and_then(|cap| cap.bars.get(bar))
            .map_or(0, |r| r.size());
        if size != 0 {
            return size;
        }
        match self.tables.lock().sriov.get(&pf) {
            Some(state) if state.vfs != 0 => state.vfs as u64 * align,
            _ => align,
        }
    }

    /// The first VF PE of `pf` and the number of VF PEs, while enabled.
    pub fn sriov_pe_range(&self, pf: FunctionId) -> Option<(PeNumber, u16)> {
        let tables = self.tables.lock();
        let state = tables.sriov.get(&pf)?;
        Some((state.offset?, state.vf_pes))
    }

    /// Creates PEs for `vf_num` VFs of `pf` and maps their BARs.
    ///
    /// If the PE table has no run of `vf_num` free numbers, fewer VFs are
    /// enabled. Returns the number enabled.
    pub fn sriov_enable(
        &self,
        topo: &mut PciTopology,
        pf: FunctionId,
        vf_num: u16,
    ) -> Result<u16, IodaError> {
        if self.config.generation != IodaGeneration::Ioda2 {
            return Err(IodaError::Unsupported("SR-IOV needs IODA2"));
        }
        let f = topo.function(pf);
        let cap = f
            .sriov()
            .ok_or(IodaError::InvalidArgument("not a physical function"))?
            .clone();
        if f.pe_number().is_none() {
            return Err(IodaError::NoPe);
        }
        if vf_num == 0 || vf_num > cap.total_vfs {
            return Err(IodaError::InvalidArgument("VF count out of range"));
        }
        let rid = topo.rid(pf);

        let mut pe_list = self.pe_list.lock();
        let mut guard = self.tables.lock();
        let tables = &mut *guard;
        if tables.m64.is_none() {
            return Err(IodaError::Unsupported("SR-IOV needs an M64 window"));
        }
        let state = tables.sriov.entry(pf).or_default();
        if state.offset.is_some() {
            return Err(IodaError::Busy);
        }
        let m64_per_iov = state.m64_per_iov.max(1);
        let vfs = if state.vfs != 0 {
            state.vfs
        } else {
            cap.total_vfs as u32
        };

        let mut count = vf_num;
        let offset = loop {
            match tables.alloc.find_contiguous(count as u32) {
                Ok(base) => break base,
                Err(_) if count > 1 => count -= 1,
                Err(err) => {
                    tracing::info!(
                        error = &err as &dyn std::error::Error,
                        %rid,
                        "no PE numbers for VFs"
                    );
                    return Err(IodaError::Busy);
                }
            }
        };
        if count != vf_num {
            tracing::info!(%rid, requested = vf_num, count, "enabling fewer VFs");
        }

        let Some(m64) = tables.m64.as_mut() else {
            return Err(IodaError::Unsupported("SR-IOV needs an M64 window"));
        };
        let mut wins = Vec::new();
        if let Err(err) = self.assign_m64(&cap, m64, &mut wins, offset, count, m64_per_iov, vfs) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                %rid,
                "not enough M64 windows for VF BARs"
            );
            self.release_m64(m64, &wins);
            tables.alloc.release_range(offset, count as u32);
            return Err(err);
        }

        let shifted = m64_per_iov == 1;
        if shifted {
            self.shift_vf_bars(topo, pf, vfs, offset.0 as i64);
        }
        if let Some(state) = tables.sriov.get_mut(&pf) {
            state.offset = Some(offset);
            state.vf_pes = count;
            state.m64_wins = wins;
            state.shifted = shifted;
            if shifted {
                state.vfs = vfs.saturating_sub(offset.0);
            }
        }

        self.setup_vf_pes(topo, tables, &mut pe_list, pf, &cap, offset, count);
        if m64_per_iov == M64_PER_IOV && count > M64_PER_IOV as u16 {
            self.link_vf_groups(offset, count, DomainAction::Add);
        }
        tracing::info!(%rid, first_pe = %offset, count, "VFs enabled");
        Ok(count)
    }

    /// Tears down the VF PEs of `pf` and releases everything
    /// [`Self::sriov_enable`] acquired. Does nothing if VFs are not enabled.
    pub fn sriov_disable(&self, topo: &mut PciTopology, pf: FunctionId) -> Result<(), IodaError> {
        let mut pe_list = self.pe_list.lock();
        let mut guard = self.tables.lock();
        let tables = &mut *guard;
        let Some(state) = tables.sriov.get_mut(&pf) else {
            return Ok(());
        };
        let Some(offset) = state.offset.take() else {
            return Ok(());
        };
        let count = std::mem::take(&mut state.vf_pes);
        let wins = std::mem::take(&mut state.m64_wins);
        let shifted = std::mem::take(&mut state.shifted);
        let m64_per_iov = state.m64_per_iov.max(1);
        // Slice count matching the shifted BARs.
        let vfs = state.vfs;
        if shifted {
            state.vfs += offset.0;
        }

        if m64_per_iov == M64_PER_IOV && count > M64_PER_IOV as u16 {
            self.link_vf_groups(offset, count, DomainAction::Remove);
        }

        for n in offset.0..offset.0 + count as u32 {
            let pe = PeNumber(n);
            let owned = matches!(
                tables.alloc.get(pe).map(|p| p.binding),
                Ok(Some(PeBinding::Vf { pf: owner, .. })) if owner == pf
            );
            if !owned {
                if tables.alloc.is_allocated(pe) {
                    if let Err(err) = tables.free_pe(pe) {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            %pe,
                            "failed to free unused VF PE"
                        );
                    }
                }
                continue;
            }
            let result = self
                .release_dma(tables, pe)
                .and_then(|()| {
                    pe_list.retain(|&p| p != pe);
                    self.deconfigure_pe(topo, tables, pe)
                })
                .and_then(|()| tables.free_pe(pe));
            if let Err(err) = result {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    %pe,
                    "failed to release VF PE"
                );
            }
        }

        if shifted {
            self.shift_vf_bars(topo, pf, vfs, -(offset.0 as i64));
        }
        if let Some(m64) = tables.m64.as_mut() {
            self.release_m64(m64, &wins);
        }
        tables.alloc.release_range(offset, count as u32);
        tracing::info!(rid = %topo.rid(pf), first_pe = %offset, count, "VFs disabled");
        Ok(())
    }

    fn assign_m64(
        &self,
        cap: &SriovCapability,
        m64: &mut M64Window,
        wins: &mut Vec<u32>,
        offset: PeNumber,
        vf_num: u16,
        m64_per_iov: u32,
        vfs: u32,
    ) -> Result<(), IodaError> {
        let grouped = m64_per_iov == M64_PER_IOV;
        let (groups, per_group) = match (grouped, vf_num as u32) {
            (false, _) => (1, 1),
            (true, n) if n <= M64_PER_IOV => (n, 1),
            (true, n) => (M64_PER_IOV, n.next_power_of_two() / M64_PER_IOV),
        };
        let fw = self.firmware.as_ref();

        for (i, bar) in m64_bars(cap) {
            for j in 0..groups {
                let win = m64.alloc_bar().ok_or(IodaError::M64Exhausted)?;
                wins.push(win);
                let win_num = win as u16;

                let (start, size, mode) = if grouped {
                    let size = vf_bar_size(cap, bar, vfs) * per_group as u64;
                    let pe = PeNumber(offset.0 + j);
                    if let Err(err) = fw.map_pe_mmio_window(pe, WindowType::M64, win_num, 0) {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            %pe,
                            window = win,
                            "failed to route M64 window to VF PE"
                        );
                    }
                    (bar.start + size * j as u64, size, MmioEnable::Enable)
                } else {
                    (bar.start, bar.size(), MmioEnable::Split)
                };

                fw.set_phb_mem_window(WindowType::M64, win_num, start, 0, size)
                    .map_err(|e| IodaError::firmware("set_phb_mem_window", None, e))?;
                fw.phb_mmio_enable(WindowType::M64, win_num, mode)
                    .map_err(|e| IodaError::firmware("phb_mmio_enable", None, e))?;
                tracing::debug!(
                    bar = i,
                    window = win,
                    start = format_args!("{start:#x}"),
                    size = format_args!("{size:#x}"),
                    ?mode,
                    "M64 window for VF BAR"
                );
            }
        }
        Ok(())
    }

    fn release_m64(&self, m64: &mut M64Window, wins: &[u32]) {
        for &win in wins {
            if let Err(err) =
                self.firmware
                    .phb_mmio_enable(WindowType::M64, win as u16, MmioEnable::Disable)
            {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    window = win,
                    "failed to disable M64 window"
                );
            }
            m64.release_bar(win);
        }
    }

    /// Moves each M64-decoded VF BAR start by `offset` VF slices, so that
    /// VF 0 lands in the split-window segment of its PE.
    fn shift_vf_bars(&self, topo: &mut PciTopology, pf: FunctionId, vfs: u32, offset: i64) {
        let rid = topo.rid(pf);
        let Some(cap) = topo.sriov_mut(pf) else {
            return;
        };
        let shifts: Vec<_> = m64_bars(cap)
            .map(|(i, bar)| (i, vf_bar_size(cap, bar, vfs)))
            .collect();
        for (i, size) in shifts {
            let bar = &mut cap.bars[i];
            let delta = size.wrapping_mul(offset as u64);
            bar.start = bar.start.wrapping_add(delta);
            tracing::debug!(
                %rid,
                bar = i,
                start = format_args!("{:#x}", bar.start),
                "VF BAR shifted"
            );
        }
    }

    fn setup_vf_pes(
        &self,
        topo: &mut PciTopology,
        tables: &mut IodaTables,
        pe_list: &mut Vec<PeNumber>,
        pf: FunctionId,
        cap: &SriovCapability,
        offset: PeNumber,
        count: u16,
    ) {
        let pf_rid = topo.rid(pf);
        for index in 0..count {
            let pe_num = PeNumber(offset.0 + index as u32);
            let rid = cap.vf_rid(pf_rid, index);
            let pe = tables.alloc.claim(pe_num);
            pe.binding = Some(PeBinding::Vf { pf, index });
            pe.rid = rid;
            tracing::info!(pe = %pe_num, %rid, "VF associated with PE");

            if let Err(err) = self.configure_pe(topo, tables, pe_num) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    pe = %pe_num,
                    "failed to configure VF PE"
                );
                // The slot stays claimed until disable releases the range.
                if let Ok(pe) = tables.alloc.get_mut(pe_num) {
                    pe.binding = None;
                }
                continue;
            }
            pe_list.push(pe_num);

            if let Err(err) = self.setup_modern_dma(topo, tables, pe_num) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    pe = %pe_num,
                    "failed to set up VF DMA"
                );
            }
        }
    }

    /// Cross-links the PEs of VFs sharing an M64 window, so an error on
    /// one freezes them all.
    fn link_vf_groups(&self, offset: PeNumber, count: u16, action: DomainAction) {
        for group in vf_groups(count) {
            for a in group.clone() {
                for b in group.clone().filter(|&b| b != a) {
                    let parent = PeNumber(offset.0 + a as u32);
                    let child = PeNumber(offset.0 + b as u32);
                    if let Err(err) = self.firmware.set_peltv(parent, child, action) {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            %parent,
                            %child,
                            ?action,
                            "failed to update VF group PELTV"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;
    use crate::pe::PeState;
    use crate::test_helpers::FwCall;
    use crate::test_helpers::MockFirmware;
    use crate::test_helpers::ioda1_config;
    use crate::test_helpers::ioda2_config;
    use crate::test_helpers::new_phb;
    use crate::topology::DevicePortType;
    use std::sync::Arc;

    const SEG: u64 = 1 << 20;
    const BASE: u64 = 0x40_0000_0000;
    const VF_BAR_BASE: u64 = BASE + 128 * SEG;

    fn m64_phb(total_pe: u32) -> (IodaPhb, Arc<MockFirmware>) {
        let mut config = ioda2_config(total_pe);
        config.m64 = Some(WindowConfig {
            pci_base: BASE,
            size: total_pe as u64 * SEG,
        });
        new_phb(config)
    }

    /// A PF below a root port with one VF BAR per entry of `vf_sizes`.
    fn pf_topology(total_vfs: u16, vf_sizes: &[u64]) -> (PciTopology, FunctionId) {
        let mut topo = PciTopology::new(0..=0xff);
        let root = topo.root_bus();
        let bus1 = topo.add_bridge(root, 0, DevicePortType::RootPort, 1..=1);
        let pf = topo.add_endpoint(bus1, 0, 0x020000);
        let mut start = VF_BAR_BASE;
        let bars = vf_sizes
            .iter()
            .map(|&size| {
                let bar = Resource::mem64_pref(start, size * total_vfs as u64).unassigned();
                start += 1 << 40;
                bar
            })
            .collect();
        topo.set_sriov(
            pf,
            SriovCapability {
                total_vfs,
                first_vf_offset: 0x80,
                vf_stride: 1,
                bars,
            },
        );
        (topo, pf)
    }

    /// Fixes up and places the VF BARs, then groups the topology.
    fn prepare(phb: &IodaPhb, topo: &mut PciTopology, pf: FunctionId) {
        phb.fixup_sriov_resources(topo);
        for bar in &mut topo.sriov_mut(pf).unwrap().bars {
            bar.assigned = true;
        }
        phb.setup(topo);
    }

    fn vf_bar(topo: &PciTopology, pf: FunctionId) -> Resource {
        topo.function(pf).sriov().unwrap().bars[0]
    }

    #[test]
    fn test_fixup_sizes_bars() {
        let (phb, _fw) = m64_phb(256);
        let (mut topo, pf) = pf_topology(8, &[0x1_0000]);
        phb.fixup_sriov_resources(&mut topo);
        assert_eq!(vf_bar(&topo, pf).size(), 0x1_0000 * 256);
        assert_eq!(phb.sriov_resource_size(&topo, pf, 0), 0x1_0000);
        assert_eq!(
            phb.sriov_resource_alignment(&topo, pf, 0, 0x1_0000),
            0x1_0000 * 256
        );

        let (mut topo, pf) = pf_topology(6, &[2 * SZ_64M]);
        phb.fixup_sriov_resources(&mut topo);
        assert_eq!(vf_bar(&topo, pf).size(), 2 * SZ_64M * 8);
        assert_eq!(phb.sriov_resource_size(&topo, pf, 0), 2 * SZ_64M);
    }

    #[test]
    fn test_enable_disable_is_symmetric() {
        let (phb, fw) = m64_phb(256);
        let (mut topo, pf) = pf_topology(8, &[0x1_0000]);
        prepare(&phb, &mut topo, pf);
        let pf_pe = topo.function(pf).pe_number().unwrap();

        let bitmap = phb.pe_bitmap();
        let bars = phb.m64_bars_in_use().unwrap();
        let pe_list = phb.pe_list();
        let peltv = fw.peltv();
        let bar = vf_bar(&topo, pf);

        assert_eq!(phb.sriov_enable(&mut topo, pf, 4).unwrap(), 4);
        let (offset, count) = phb.sriov_pe_range(pf).unwrap();
        assert_eq!((offset, count), (PeNumber(3), 4));
        assert_eq!(vf_bar(&topo, pf).start, bar.start + 3 * 0x1_0000);
        assert_eq!(vf_bar(&topo, pf).end, bar.end);
        assert_eq!(phb.sriov_resource_size(&topo, pf, 0), 0x1_0000);
        assert!(fw.calls().contains(&FwCall::MmioEnable {
            window_type: WindowType::M64,
            window: 0,
            mode: MmioEnable::Split,
        }));

        let vf1 = PeNumber(4);
        assert_eq!(
            phb.with_pe(vf1, |p| p.binding()).unwrap(),
            Some(PeBinding::Vf { pf, index: 1 })
        );
        assert_eq!(phb.with_pe(vf1, |p| p.state()).unwrap(), PeState::DmaBound);
        assert_eq!(phb.bdfn_to_pe(1, 0x81), Some(vf1));
        assert!(fw.peltv().contains(&(pf_pe, vf1)));
        assert!(phb.pe_list().contains(&vf1));
        assert!(matches!(
            phb.sriov_enable(&mut topo, pf, 4),
            Err(IodaError::Busy)
        ));

        phb.sriov_disable(&mut topo, pf).unwrap();
        assert_eq!(phb.pe_bitmap(), bitmap);
        assert_eq!(phb.m64_bars_in_use().unwrap(), bars);
        assert_eq!(phb.pe_list(), pe_list);
        assert_eq!(fw.peltv(), peltv);
        assert_eq!(vf_bar(&topo, pf), bar);
        assert_eq!(phb.bdfn_to_pe(1, 0x81), None);
        assert_eq!(phb.sriov_pe_range(pf), None);

        fw.clear_calls();
        phb.sriov_disable(&mut topo, pf).unwrap();
        assert!(fw.calls().is_empty());
    }

    #[test]
    fn test_failed_vf_slot_stays_claimed_until_disable() {
        let (phb, fw) = m64_phb(256);
        let (mut topo, pf) = pf_topology(8, &[0x1_0000]);
        prepare(&phb, &mut topo, pf);

        fw.fail("set_pe", Some(PeNumber(3)));
        assert_eq!(phb.sriov_enable(&mut topo, pf, 4).unwrap(), 4);
        assert_eq!(phb.sriov_pe_range(pf), Some((PeNumber(3), 4)));
        assert!(phb.is_pe_allocated(PeNumber(3)));
        assert_eq!(phb.with_pe(PeNumber(3), |p| p.binding()).unwrap(), None);
        assert!(!phb.pe_list().contains(&PeNumber(3)));

        // A hot-added device must not land in the VF range.
        let bus = topo.function(pf).bus();
        let ep = topo.add_endpoint(bus, 0x08, 0x020000);
        let dev_pe = phb.setup_device_pe(&mut topo, ep).unwrap();
        assert_eq!(dev_pe, PeNumber(7));

        phb.sriov_disable(&mut topo, pf).unwrap();
        assert!(phb.is_pe_allocated(dev_pe));
        assert_eq!(
            phb.with_pe(dev_pe, |p| p.binding()).unwrap(),
            Some(PeBinding::Device(ep))
        );
        for n in 3..7 {
            assert!(!phb.is_pe_allocated(PeNumber(n)));
        }
    }

    #[test]
    fn test_disable_before_enable_is_noop() {
        let (phb, fw) = m64_phb(256);
        let (mut topo, pf) = pf_topology(8, &[0x1_0000]);
        prepare(&phb, &mut topo, pf);
        fw.clear_calls();
        phb.sriov_disable(&mut topo, pf).unwrap();
        assert!(fw.calls().is_empty());
    }

    #[test]
    fn test_enable_retries_with_fewer_vfs() {
        let (phb, _fw) = m64_phb(16);
        let (mut topo, pf) = pf_topology(16, &[0x1_0000]);
        prepare(&phb, &mut topo, pf);
        // PEs 0, 1 and 2 are taken.
        assert_eq!(phb.sriov_enable(&mut topo, pf, 16).unwrap(), 13);
        assert_eq!(phb.sriov_pe_range(pf), Some((PeNumber(3), 13)));
        assert!(phb.pe_bitmap().all());
    }

    #[test]
    fn test_m64_failure_rolls_back() {
        let (phb, fw) = m64_phb(256);
        let (mut topo, pf) = pf_topology(8, &[0x1_0000]);
        prepare(&phb, &mut topo, pf);
        let bitmap = phb.pe_bitmap();
        let bars = phb.m64_bars_in_use().unwrap();
        let bar = vf_bar(&topo, pf);

        fw.fail("set_phb_mem_window", None);
        assert!(matches!(
            phb.sriov_enable(&mut topo, pf, 8),
            Err(IodaError::Firmware {
                op: "set_phb_mem_window",
                ..
            })
        ));
        assert_eq!(phb.pe_bitmap(), bitmap);
        assert_eq!(phb.m64_bars_in_use().unwrap(), bars);
        assert_eq!(vf_bar(&topo, pf), bar);
        assert!(fw.calls().contains(&FwCall::MmioEnable {
            window_type: WindowType::M64,
            window: 0,
            mode: MmioEnable::Disable,
        }));

        fw.clear_failures();
        assert_eq!(phb.sriov_enable(&mut topo, pf, 8).unwrap(), 8);
    }

    #[test]
    fn test_m64_exhaustion_rolls_back() {
        let (phb, _fw) = m64_phb(256);
        let big = 2 * SZ_64M;
        let (mut topo, pf) = pf_topology(8, &[big, big, big, big]);
        prepare(&phb, &mut topo, pf);
        let bitmap = phb.pe_bitmap();

        // Four BARs of four windows each, one more than the bridge has free.
        assert!(matches!(
            phb.sriov_enable(&mut topo, pf, 8),
            Err(IodaError::M64Exhausted)
        ));
        assert_eq!(phb.pe_bitmap(), bitmap);
        assert_eq!(phb.m64_bars_in_use().unwrap().count_ones(), 1);
    }

    #[test]
    fn test_grouped_windows_cross_link_vfs() {
        let (phb, fw) = m64_phb(256);
        let (mut topo, pf) = pf_topology(8, &[2 * SZ_64M]);
        prepare(&phb, &mut topo, pf);
        let peltv = fw.peltv();
        let bar = vf_bar(&topo, pf);

        assert_eq!(phb.sriov_enable(&mut topo, pf, 8).unwrap(), 8);
        let (offset, _) = phb.sriov_pe_range(pf).unwrap();
        let pe = |i: u32| PeNumber(offset.0 + i);
        // Two VFs per window, each window routed to its group's first PE.
        let calls = fw.calls();
        for j in 0..4u32 {
            assert!(calls.contains(&FwCall::MapMmioWindow {
                pe: pe(j),
                window_type: WindowType::M64,
                window: j as u16,
                segment: 0,
            }));
            assert!(calls.contains(&FwCall::SetMemWindow {
                window_type: WindowType::M64,
                window: j as u16,
                addr: bar.start + 2 * 2 * SZ_64M * j as u64,
                size: 2 * 2 * SZ_64M,
            }));
        }
        let links = fw.peltv();
        assert!(links.contains(&(pe(0), pe(1))));
        assert!(links.contains(&(pe(1), pe(0))));
        assert!(links.contains(&(pe(6), pe(7))));
        assert!(!links.contains(&(pe(1), pe(2))));
        assert_eq!(vf_bar(&topo, pf), bar);

        phb.sriov_disable(&mut topo, pf).unwrap();
        assert_eq!(fw.peltv(), peltv);
    }

    #[test]
    fn test_enable_requirements() {
        let (phb, _fw) = new_phb(ioda1_config(16));
        let (mut topo, pf) = pf_topology(8, &[0x1_0000]);
        phb.setup(&mut topo);
        assert!(matches!(
            phb.sriov_enable(&mut topo, pf, 4),
            Err(IodaError::Unsupported(_))
        ));

        let (phb, _fw) = m64_phb(256);
        let (mut topo, pf) = pf_topology(8, &[0x1_0000]);
        assert!(matches!(
            phb.sriov_enable(&mut topo, pf, 4),
            Err(IodaError::NoPe)
        ));
        prepare(&phb, &mut topo, pf);
        assert!(matches!(
            phb.sriov_enable(&mut topo, pf, 0),
            Err(IodaError::InvalidArgument(_))
        ));
        assert!(matches!(
            phb.sriov_enable(&mut topo, pf, 9),
            Err(IodaError::InvalidArgument(_))
        ));

        let (phb, _fw) = new_phb(ioda2_config(256));
        let (mut topo, pf) = pf_topology(8, &[0x1_0000]);
        phb.setup(&mut topo);
        assert!(matches!(
            phb.sriov_enable(&mut topo, pf, 4),
            Err(IodaError::Unsupported(_))
        ));
    }
}
