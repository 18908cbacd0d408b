// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::IodaPhb;
use crate::config::IodaGeneration;
use crate::config::MsiRange;
use crate::config::PhbConfig;
use crate::config::WindowConfig;
use crate::firmware::BusCompare;
use crate::firmware::DeviceCompare;
use crate::firmware::DomainAction;
use crate::firmware::FirmwareError;
use crate::firmware::FreezeClear;
use crate::firmware::FreezeSet;
use crate::firmware::FreezeState;
use crate::firmware::FunctionCompare;
use crate::firmware::FwResult;
use crate::firmware::IodaFirmware;
use crate::firmware::MmioEnable;
use crate::firmware::MveAction;
use crate::firmware::PeMapAction;
use crate::firmware::ResetAction;
use crate::firmware::ResetScope;
use crate::firmware::WindowType;
use crate::pe::PeNumber;
use crate::rid::Rid;
use crate::tce::TceKillRegister;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FwCall {
    FreezeSet(PeNumber, FreezeSet),
    FreezeClear(PeNumber, FreezeClear),
    FreezeStatus(PeNumber),
    SetPe {
        pe: PeNumber,
        rid: Rid,
        bus: BusCompare,
        device: DeviceCompare,
        function: FunctionCompare,
        action: PeMapAction,
    },
    SetPeltv {
        parent: PeNumber,
        child: PeNumber,
        action: DomainAction,
    },
    MapDmaWindow {
        pe: PeNumber,
        window: u16,
        table_size: u64,
        page_size: u64,
    },
    MapDmaWindowReal {
        pe: PeNumber,
        window: u16,
        pci_start: u64,
        pci_size: u64,
    },
    MapMmioWindow {
        pe: PeNumber,
        window_type: WindowType,
        window: u16,
        segment: u16,
    },
    SetMemWindow {
        window_type: WindowType,
        window: u16,
        addr: u64,
        size: u64,
    },
    MmioEnable {
        window_type: WindowType,
        window: u16,
        mode: MmioEnable,
    },
    SetMve(u32, PeNumber),
    SetMveEnable(u32, MveAction),
    SetXivePe(PeNumber, u32),
    GetMsi32(u32, u32),
    GetMsi64(u32, u32),
    MsiEoi(u32),
    Reset(ResetScope, ResetAction),
}

#[derive(Default)]
struct MockState {
    calls: Vec<FwCall>,
    failures: Vec<(&'static str, Option<PeNumber>)>,
    pelt: HashMap<PeNumber, Rid>,
    peltv: BTreeSet<(PeNumber, PeNumber)>,
    freeze: HashMap<PeNumber, FreezeState>,
}

/// Firmware model that records every call and can be told to fail.
#[derive(Default)]
pub struct MockFirmware {
    state: Mutex<MockState>,
}

const MOCK_FAILURE: FirmwareError = FirmwareError(-1);

impl MockFirmware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every later call to `op`, or only those for `pe`.
    pub fn fail(&self, op: &'static str, pe: Option<PeNumber>) {
        self.state.lock().failures.push((op, pe));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn calls(&self) -> Vec<FwCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Current PELTV as (parent, child) pairs.
    pub fn peltv(&self) -> BTreeSet<(PeNumber, PeNumber)> {
        self.state.lock().peltv.clone()
    }

    /// Current PELT entries.
    pub fn pelt(&self) -> HashMap<PeNumber, Rid> {
        self.state.lock().pelt.clone()
    }

    pub fn set_freeze_state(&self, pe: PeNumber, state: FreezeState) {
        self.state.lock().freeze.insert(pe, state);
    }

    fn call(
        &self,
        op: &'static str,
        pe: Option<PeNumber>,
        call: FwCall,
        apply: impl FnOnce(&mut MockState),
    ) -> FwResult {
        let mut state = self.state.lock();
        state.calls.push(call);
        let failed = state
            .failures
            .iter()
            .any(|&(o, p)| o == op && (p.is_none() || p == pe));
        if failed {
            return Err(MOCK_FAILURE);
        }
        apply(&mut state);
        Ok(())
    }
}

impl IodaFirmware for MockFirmware {
    fn eeh_freeze_set(&self, pe: PeNumber, action: FreezeSet) -> FwResult {
        self.call(
            "eeh_freeze_set",
            Some(pe),
            FwCall::FreezeSet(pe, action),
            |s| {
                s.freeze.insert(pe, FreezeState::MmioDmaFrozen);
            },
        )
    }

    fn eeh_freeze_clear(&self, pe: PeNumber, action: FreezeClear) -> FwResult {
        self.call(
            "eeh_freeze_clear",
            Some(pe),
            FwCall::FreezeClear(pe, action),
            |s| {
                s.freeze.insert(pe, FreezeState::NotFrozen);
            },
        )
    }

    fn eeh_freeze_status(&self, pe: PeNumber) -> FwResult<FreezeState> {
        self.call("eeh_freeze_status", Some(pe), FwCall::FreezeStatus(pe), |_| {})?;
        Ok(self
            .state
            .lock()
            .freeze
            .get(&pe)
            .copied()
            .unwrap_or(FreezeState::NotFrozen))
    }

    fn set_pe(
        &self,
        pe: PeNumber,
        rid: Rid,
        bus: BusCompare,
        device: DeviceCompare,
        function: FunctionCompare,
        action: PeMapAction,
    ) -> FwResult {
        self.call(
            "set_pe",
            Some(pe),
            FwCall::SetPe {
                pe,
                rid,
                bus,
                device,
                function,
                action,
            },
            |s| match action {
                PeMapAction::Map => {
                    s.pelt.insert(pe, rid);
                }
                PeMapAction::Unmap => {
                    s.pelt.remove(&pe);
                }
            },
        )
    }

    fn set_peltv(&self, parent: PeNumber, child: PeNumber, action: DomainAction) -> FwResult {
        self.call(
            "set_peltv",
            Some(child),
            FwCall::SetPeltv {
                parent,
                child,
                action,
            },
            |s| match action {
                DomainAction::Add => {
                    s.peltv.insert((parent, child));
                }
                DomainAction::Remove => {
                    s.peltv.remove(&(parent, child));
                }
            },
        )
    }

    fn map_pe_dma_window(
        &self,
        pe: PeNumber,
        window_id: u16,
        _levels: u16,
        _table_addr: u64,
        table_size: u64,
        page_size: u64,
    ) -> FwResult {
        self.call(
            "map_pe_dma_window",
            Some(pe),
            FwCall::MapDmaWindow {
                pe,
                window: window_id,
                table_size,
                page_size,
            },
            |_| {},
        )
    }

    fn map_pe_dma_window_real(
        &self,
        pe: PeNumber,
        window_id: u16,
        pci_start: u64,
        pci_size: u64,
    ) -> FwResult {
        self.call(
            "map_pe_dma_window_real",
            Some(pe),
            FwCall::MapDmaWindowReal {
                pe,
                window: window_id,
                pci_start,
                pci_size,
            },
            |_| {},
        )
    }

    fn map_pe_mmio_window(
        &self,
        pe: PeNumber,
        window_type: WindowType,
        window_num: u16,
        segment: u16,
    ) -> FwResult {
        self.call(
            "map_pe_mmio_window",
            Some(pe),
            FwCall::MapMmioWindow {
                pe,
                window_type,
                window: window_num,
                segment,
            },
            |_| {},
        )
    }

    fn set_phb_mem_window(
        &self,
        window_type: WindowType,
        window_num: u16,
        addr: u64,
        _pci_addr: u64,
        size: u64,
    ) -> FwResult {
        self.call(
            "set_phb_mem_window",
            None,
            FwCall::SetMemWindow {
                window_type,
                window: window_num,
                addr,
                size,
            },
            |_| {},
        )
    }

    fn phb_mmio_enable(
        &self,
        window_type: WindowType,
        window_num: u16,
        mode: MmioEnable,
    ) -> FwResult {
        self.call(
            "phb_mmio_enable",
            None,
            FwCall::MmioEnable {
                window_type,
                window: window_num,
                mode,
            },
            |_| {},
        )
    }

    fn set_mve(&self, mve: u32, pe: PeNumber) -> FwResult {
        self.call("set_mve", Some(pe), FwCall::SetMve(mve, pe), |_| {})
    }

    fn set_mve_enable(&self, mve: u32, action: MveAction) -> FwResult {
        self.call(
            "set_mve_enable",
            None,
            FwCall::SetMveEnable(mve, action),
            |_| {},
        )
    }

    fn set_xive_pe(&self, pe: PeNumber, xive: u32) -> FwResult {
        self.call("set_xive_pe", Some(pe), FwCall::SetXivePe(pe, xive), |_| {})
    }

    fn get_msi_32(&self, mve: u32, xive: u32, _count: u8) -> FwResult<(u32, u32)> {
        self.call("get_msi_32", None, FwCall::GetMsi32(mve, xive), |_| {})?;
        Ok((0xffff_0000 + (mve << 4), xive))
    }

    fn get_msi_64(&self, mve: u32, xive: u32, _count: u8) -> FwResult<(u64, u32)> {
        self.call("get_msi_64", None, FwCall::GetMsi64(mve, xive), |_| {})?;
        Ok((0x9_0000_0000 + ((mve as u64) << 4), xive))
    }

    fn msi_eoi(&self, hw_irq: u32) -> FwResult {
        self.call("msi_eoi", None, FwCall::MsiEoi(hw_irq), |_| {})
    }

    fn pci_reset(&self, scope: ResetScope, action: ResetAction) -> FwResult {
        self.call("pci_reset", None, FwCall::Reset(scope, action), |_| {})
    }
}

/// TCE kill register that records every store.
#[derive(Default)]
pub struct RecordingKillRegister {
    writes: Mutex<Vec<(u64, bool)>>,
}

impl RecordingKillRegister {
    pub fn writes(&self) -> Vec<(u64, bool)> {
        self.writes.lock().clone()
    }
}

impl TceKillRegister for RecordingKillRegister {
    fn write(&self, value: u64) {
        self.writes.lock().push((value, false));
    }

    fn write_real_mode(&self, value: u64) {
        self.writes.lock().push((value, true));
    }
}

pub fn ioda2_config(total_pe: u32) -> PhbConfig {
    let mut config = PhbConfig::new(IodaGeneration::Ioda2, total_pe);
    // Keeps per-PE 32-bit tables at 512 KiB.
    config.m32 = WindowConfig {
        pci_base: 0x1000_0000,
        size: 0x1000_0000 * 4 - 0x1_0000,
    };
    config.msi = Some(MsiRange {
        base: 0x800,
        count: 256,
    });
    config.dram_end = 0x4_0000_0000 - 0x1000_0000;
    config.memory_hotplug_max = 0x8_0000_0000;
    config
}

pub fn ioda1_config(total_pe: u32) -> PhbConfig {
    let mut config = PhbConfig::new(IodaGeneration::Ioda1, total_pe);
    config.m32 = WindowConfig {
        pci_base: 0x8000_0000,
        size: 0x8000_0000 - 0x1_0000,
    };
    config.io = Some(WindowConfig {
        pci_base: 0,
        size: 0x1_0000 * total_pe as u64,
    });
    config.msi = Some(MsiRange {
        base: 0x400,
        count: 64,
    });
    config.dram_end = 0x1_0000_0000;
    config.memory_hotplug_max = 0x1_0000_0000;
    config
}

pub fn new_phb(config: PhbConfig) -> (IodaPhb, Arc<MockFirmware>) {
    init_tracing();
    let fw = Arc::new(MockFirmware::new());
    let phb = IodaPhb::new(config, fw.clone(), None).unwrap();
    (phb, fw)
}

pub fn new_phb_with_kill(
    config: PhbConfig,
) -> (IodaPhb, Arc<MockFirmware>, Arc<RecordingKillRegister>) {
    init_tracing();
    let fw = Arc::new(MockFirmware::new());
    let kill = Arc::new(RecordingKillRegister::default());
    let kill_reg: Arc<dyn TceKillRegister> = kill.clone();
    let phb = IodaPhb::new(config, fw.clone(), Some(kill_reg)).unwrap();
    (phb, fw, kill)
}
