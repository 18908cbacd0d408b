// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The IODA host bridge.

use crate::RID_COUNT;
use crate::alloc::PeAllocator;
use crate::config::IodaGeneration;
use crate::config::PhbConfig;
use crate::dma::DmaSchedule;
use crate::error::IodaError;
use crate::firmware::IodaFirmware;
use crate::firmware::ResetAction;
use crate::firmware::ResetScope;
use crate::m64::M64Window;
use crate::msi::MsiBitmap;
use crate::pe::Pe;
use crate::pe::PeNumber;
use crate::rid::Rid;
use crate::sriov::SriovState;
use crate::tce::TceKillRegister;
use crate::topology::BusId;
use crate::topology::DevicePortType;
use crate::topology::FunctionId;
use crate::topology::PciTopology;
use crate::topology::Resource;
use crate::topology::ResourceFlags;
use bitvec::vec::BitVec;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// Bridge state guarded by the allocation lock.
#[derive(Debug)]
pub(crate) struct IodaTables {
    pub alloc: PeAllocator,
    /// RID to PE reverse map.
    pub rmap: Box<[Option<PeNumber>]>,
    pub m32_segmap: Vec<Option<PeNumber>>,
    pub io_segmap: Option<Vec<Option<PeNumber>>>,
    pub m64: Option<M64Window>,
    pub dma: DmaSchedule,
    pub msi: Option<MsiBitmap>,
    pub sriov: HashMap<FunctionId, SriovState>,
}

impl IodaTables {
    /// Frees `pe` and drops every map entry still naming it.
    pub fn free_pe(&mut self, pe: PeNumber) -> Result<(), IodaError> {
        self.alloc.free(pe)?;
        let io = self.io_segmap.iter_mut().flatten();
        for slot in self.m32_segmap.iter_mut().chain(io) {
            if *slot == Some(pe) {
                *slot = None;
            }
        }
        self.dma.unlink(pe);
        Ok(())
    }
}

/// An IODA PCI host bridge and the PEs carved out of it.
///
/// Lock order: the PE list lock is taken before the allocation lock.
pub struct IodaPhb {
    pub(crate) config: PhbConfig,
    pub(crate) firmware: Arc<dyn IodaFirmware>,
    pub(crate) tce_kill: Option<Arc<dyn TceKillRegister>>,
    m64_resource: Option<Resource>,
    /// The allocation lock.
    pub(crate) tables: Mutex<IodaTables>,
    /// The PE list lock. Holds configured PEs in creation order.
    pub(crate) pe_list: Mutex<Vec<PeNumber>>,
    pub(crate) initialized: AtomicBool,
}

impl IodaPhb {
    /// Initializes the bridge: resets its IODA tables, reserves the
    /// reserved PE and enables the shared M64 window.
    pub fn new(
        config: PhbConfig,
        firmware: Arc<dyn IodaFirmware>,
        tce_kill: Option<Arc<dyn TceKillRegister>>,
    ) -> Result<Self, IodaError> {
        config.validate()?;
        let total_pe = config.total_pe;
        let reserved = PeNumber(config.reserved_pe);

        if let Err(err) = firmware.pci_reset(ResetScope::IodaTables, ResetAction::Assert) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to reset IODA tables"
            );
        }

        let (m64, m64_resource) = match (config.generation, config.m64) {
            (IodaGeneration::Ioda2, Some(window)) => {
                let mut m64 = M64Window::new(window, total_pe);
                match m64.init(firmware.as_ref(), reserved) {
                    Ok(resource) => (Some(m64), Some(resource)),
                    Err(_) => (None, None),
                }
            }
            (IodaGeneration::Ioda1, Some(_)) => {
                tracing::info!("M64 window ignored on IODA1 bridge");
                (None, None)
            }
            (_, None) => (None, None),
        };

        let io_segmap = (config.generation == IodaGeneration::Ioda1 && config.io.is_some())
            .then(|| vec![None; total_pe as usize]);

        tracing::info!(
            generation = ?config.generation,
            total_pe,
            reserved = %reserved,
            m32_segment_size = format_args!("{:#x}", config.m32_segment_size()),
            io_segment_size = format_args!("{:#x}", config.io_segment_size()),
            "IODA host bridge initialized"
        );

        let tables = IodaTables {
            alloc: PeAllocator::new(total_pe, reserved),
            rmap: vec![None; RID_COUNT].into_boxed_slice(),
            m32_segmap: vec![None; total_pe as usize],
            io_segmap,
            m64,
            dma: DmaSchedule::default(),
            msi: config.msi.map(MsiBitmap::new),
            sriov: HashMap::new(),
        };

        Ok(Self {
            config,
            firmware,
            tce_kill,
            m64_resource,
            tables: Mutex::new(tables),
            pe_list: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        })
    }

    /// The bridge configuration.
    pub fn config(&self) -> &PhbConfig {
        &self.config
    }

    /// The hardware generation.
    pub fn generation(&self) -> IodaGeneration {
        self.config.generation
    }

    /// Whether [`Self::setup`] has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// The part of the M64 window available to resource allocation, if M64
    /// is enabled.
    pub fn m64_resource(&self) -> Option<Resource> {
        self.m64_resource
    }

    /// Runs `f` on the record of `pe`.
    pub fn with_pe<R>(&self, pe: PeNumber, f: impl FnOnce(&Pe) -> R) -> Result<R, IodaError> {
        let tables = self.tables.lock();
        tables.alloc.get(pe).map(f)
    }

    /// Configured PEs in creation order.
    pub fn pe_list(&self) -> Vec<PeNumber> {
        self.pe_list.lock().clone()
    }

    /// Whether `pe` is claimed in the PE bitmap.
    pub fn is_pe_allocated(&self, pe: PeNumber) -> bool {
        self.tables.lock().alloc.is_allocated(pe)
    }

    /// Snapshot of the PE bitmap.
    pub fn pe_bitmap(&self) -> BitVec {
        self.tables.lock().alloc.bitmap().to_bitvec()
    }

    /// Snapshot of the M64 window registers in use.
    pub fn m64_bars_in_use(&self) -> Option<BitVec> {
        let tables = self.tables.lock();
        tables.m64.as_ref().map(|m64| m64.bars_in_use().to_bitvec())
    }

    /// The PE routing `bus`:`devfn`.
    pub fn bdfn_to_pe(&self, bus: u8, devfn: u8) -> Option<PeNumber> {
        self.tables.lock().rmap[Rid::from_bus_devfn(bus, devfn).index()]
    }

    /// Owner of M32 segment `index`.
    pub fn m32_segment_owner(&self, index: usize) -> Option<PeNumber> {
        self.tables.lock().m32_segmap.get(index).copied().flatten()
    }

    /// Owner of IO segment `index`.
    pub fn io_segment_owner(&self, index: usize) -> Option<PeNumber> {
        let tables = self.tables.lock();
        tables.io_segmap.as_ref()?.get(index).copied().flatten()
    }

    /// Alignment for a window of type `flags` forwarded to `bus`, so that
    /// bridge windows land on PE segment boundaries.
    pub fn window_alignment(&self, topo: &PciTopology, bus: BusId, flags: ResourceFlags) -> u64 {
        // Below two conventional PCI bridges the windows cannot line up
        // with segments anyway.
        let mut pci_bridges = 0;
        let mut bridge = topo.bus(bus).bridge();
        while let Some(b) = bridge {
            if topo.function(b).port_type() == Some(DevicePortType::PcieToPciBridge) {
                pci_bridges += 1;
                if pci_bridges >= 2 {
                    return 1;
                }
            }
            bridge = topo.parent_bridge(b);
        }

        if flags.mem() && flags.mem_64() && flags.prefetch() {
            if let Some(m64) = &self.tables.lock().m64 {
                return m64.segment_size();
            }
        }
        if flags.mem() {
            return self.config.m32_segment_size();
        }
        self.config.io_segment_size().max(1)
    }

    /// Checks that `function` may be enabled.
    pub fn enable_device(&self, topo: &PciTopology, function: FunctionId) -> Result<(), IodaError> {
        if !self.is_initialized() {
            return Ok(());
        }
        if topo.function(function).pe_number().is_none() {
            tracing::warn!(
                rid = %topo.rid(function),
                "refusing to enable function without a PE"
            );
            return Err(IodaError::NoPe);
        }
        Ok(())
    }

    /// Puts the IODA tables back into reset.
    pub fn shutdown(&self) -> Result<(), IodaError> {
        self.firmware
            .pci_reset(ResetScope::IodaTables, ResetAction::Assert)
            .map_err(|e| IodaError::firmware("pci_reset", None, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;
    use crate::test_helpers::FwCall;
    use crate::test_helpers::MockFirmware;
    use crate::test_helpers::ioda2_config;
    use crate::test_helpers::new_phb;

    #[test]
    fn test_init_resets_and_reserves() {
        let (phb, fw) = new_phb(ioda2_config(256));
        assert!(phb.is_pe_allocated(PeNumber(0)));
        assert_eq!(phb.pe_bitmap().count_ones(), 1);
        assert_eq!(
            fw.calls().first(),
            Some(&FwCall::Reset(ResetScope::IodaTables, ResetAction::Assert))
        );
        assert!(!phb.is_initialized());
    }

    #[test]
    fn test_m64_failure_disables_m64() {
        let mut config = ioda2_config(256);
        config.m64 = Some(WindowConfig {
            pci_base: 0x40_0000_0000,
            size: 256 << 20,
        });
        let fw = Arc::new(MockFirmware::new());
        fw.fail("set_phb_mem_window", None);
        let phb = IodaPhb::new(config, fw.clone(), None).unwrap();
        assert!(phb.m64_resource().is_none());
        assert!(phb.m64_bars_in_use().is_none());
    }

    #[test]
    fn test_window_alignment() {
        let mut config = ioda2_config(256);
        config.m64 = Some(WindowConfig {
            pci_base: 0x40_0000_0000,
            size: 256 << 20,
        });
        let (phb, _fw) = new_phb(config);
        let mut topo = PciTopology::new(0..=0xff);
        let root = topo.root_bus();
        let bus1 = topo.add_bridge(root, 0, DevicePortType::RootPort, 1..=3);
        let bus2 = topo.add_bridge(bus1, 0, DevicePortType::PcieToPciBridge, 2..=3);
        let bus3 = topo.add_bridge(bus2, 0, DevicePortType::PcieToPciBridge, 3..=3);

        let pref64 = Resource::mem64_pref(0, 1).flags;
        let mem32 = Resource::mem32(0, 1).flags;
        assert_eq!(phb.window_alignment(&topo, bus1, pref64), 1 << 20);
        assert_eq!(
            phb.window_alignment(&topo, bus2, mem32),
            phb.config().m32_segment_size()
        );
        assert_eq!(phb.window_alignment(&topo, bus3, mem32), 1);
    }

    #[test]
    fn test_enable_device_requires_pe() {
        let (phb, _fw) = new_phb(ioda2_config(16));
        let mut topo = PciTopology::new(0..=0xff);
        let root = topo.root_bus();
        let ep = topo.add_endpoint(root, 0x08, 0x020000);
        // Before setup every device is allowed.
        phb.enable_device(&topo, ep).unwrap();
        phb.setup(&mut topo);
        phb.enable_device(&topo, ep).unwrap();

        let late = topo.add_endpoint(root, 0x10, 0x020000);
        assert!(matches!(
            phb.enable_device(&topo, late),
            Err(IodaError::NoPe)
        ));
    }

    #[test]
    fn test_shutdown_resets_tables() {
        let (phb, fw) = new_phb(ioda2_config(16));
        fw.clear_calls();
        phb.shutdown().unwrap();
        assert_eq!(
            fw.calls(),
            [FwCall::Reset(ResetScope::IodaTables, ResetAction::Assert)]
        );
    }
}
