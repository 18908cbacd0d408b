// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Programming of the PE isolation tables.
//!
//! Configuring a PE installs its PELT entry, adds it to its own PELTV row
//! and to the rows of every PE above it, fills the RID reverse map and, on
//! IODA1, binds an MSI validation entry. Deconfiguring undoes each step.

use crate::RID_COUNT;
use crate::config::IodaGeneration;
use crate::error::IodaError;
use crate::firmware::BusCompare;
use crate::firmware::DeviceCompare;
use crate::firmware::DomainAction;
use crate::firmware::FreezeClear;
use crate::firmware::FunctionCompare;
use crate::firmware::MveAction;
use crate::firmware::PeMapAction;
use crate::pe::Pe;
use crate::pe::PeBinding;
use crate::pe::PeNumber;
use crate::pe::PeState;
use crate::phb::IodaPhb;
use crate::phb::IodaTables;
use crate::topology::FunctionId;
use crate::topology::PciTopology;

/// The PELT compare rule for a PE.
#[derive(Debug, Clone, Copy)]
struct RidMatch {
    bus: BusCompare,
    device: DeviceCompare,
    function: FunctionCompare,
    /// Number of RIDs covered, starting at the PE's RID.
    count: usize,
    /// First bridge above the PE.
    parent: Option<FunctionId>,
}

impl RidMatch {
    fn for_pe(topo: &PciTopology, pe: &Pe) -> Result<Self, IodaError> {
        let binding = pe.binding.ok_or(IodaError::PeUnbound(pe.number))?;
        let exact = |parent| Self {
            bus: BusCompare::All,
            device: DeviceCompare::Compare,
            function: FunctionCompare::Compare,
            count: 1,
            parent,
        };
        Ok(match binding {
            PeBinding::Bus(bus) | PeBinding::BusAll(bus) => {
                let b = topo.bus(bus);
                let buses = if matches!(binding, PeBinding::BusAll(_)) {
                    b.numbers().count() as u32
                } else {
                    1
                };
                let bus_compare = BusCompare::for_bus_count(buses).unwrap_or_else(|| {
                    tracing::error!(
                        pe = %pe.number,
                        buses,
                        "bus range is not a supported power of two, matching exact bus"
                    );
                    BusCompare::All
                });
                Self {
                    bus: bus_compare,
                    device: DeviceCompare::Ignore,
                    function: FunctionCompare::Ignore,
                    count: (buses as usize) << 8,
                    parent: b.bridge(),
                }
            }
            PeBinding::Device(function) => exact(topo.parent_bridge(function)),
            PeBinding::Vf { pf, .. } => exact(Some(pf)),
        })
    }
}

impl IodaPhb {
    /// Adds or removes `pe` from the PELTV row of every PE above `parent`.
    ///
    /// Failures are logged and the walk continues.
    fn update_parent_domains(
        &self,
        topo: &PciTopology,
        mut parent: Option<FunctionId>,
        pe: PeNumber,
        action: DomainAction,
    ) {
        while let Some(bridge) = parent {
            if let Some(parent_pe) = topo.function(bridge).pe_number() {
                if let Err(err) = self.firmware.set_peltv(parent_pe, pe, action) {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        %pe,
                        parent = %parent_pe,
                        ?action,
                        "failed to update parent PELTV"
                    );
                }
            }
            parent = topo.parent_bridge(bridge);
        }
    }

    pub(crate) fn configure_pe(
        &self,
        topo: &PciTopology,
        tables: &mut IodaTables,
        pe_num: PeNumber,
    ) -> Result<(), IodaError> {
        let pe = tables.alloc.get(pe_num)?;
        if pe.state != PeState::Allocated {
            return Err(IodaError::InvalidArgument("PE is not freshly allocated"));
        }
        let rid = pe.rid;
        let m = RidMatch::for_pe(topo, pe)?;
        let fw = self.firmware.as_ref();

        fw.set_pe(pe_num, rid, m.bus, m.device, m.function, PeMapAction::Map)
            .map_err(|err| {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    pe = %pe_num,
                    %rid,
                    "failed to map PELT entry"
                );
                IodaError::firmware("set_pe", Some(pe_num), err)
            })?;

        if let Err(err) = fw.set_peltv(pe_num, pe_num, DomainAction::Add) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                pe = %pe_num,
                "failed to add PE to its own PELTV"
            );
        }
        if let Err(err) = fw.eeh_freeze_clear(pe_num, FreezeClear::All) {
            tracing::debug!(
                error = &err as &dyn std::error::Error,
                pe = %pe_num,
                "initial unfreeze failed"
            );
        }

        self.update_parent_domains(topo, m.parent, pe_num, DomainAction::Add);

        let start = rid.index();
        let end = (start + m.count).min(RID_COUNT);
        tables.rmap[start..end].fill(Some(pe_num));

        let mve = match self.config.generation {
            IodaGeneration::Ioda1 => {
                let mve = pe_num.0;
                let result = fw
                    .set_mve(mve, pe_num)
                    .and_then(|()| fw.set_mve_enable(mve, MveAction::Enable));
                match result {
                    Ok(()) => Some(mve),
                    Err(err) => {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            pe = %pe_num,
                            mve,
                            "failed to set up MVE"
                        );
                        None
                    }
                }
            }
            IodaGeneration::Ioda2 => Some(0),
        };

        let pe = tables.alloc.get_mut(pe_num)?;
        pe.mve = mve;
        pe.state = PeState::Configured;
        tracing::debug!(pe = %pe_num, %rid, rids = m.count, "PE configured");
        Ok(())
    }

    pub(crate) fn deconfigure_pe(
        &self,
        topo: &PciTopology,
        tables: &mut IodaTables,
        pe_num: PeNumber,
    ) -> Result<(), IodaError> {
        let pe = tables.alloc.get(pe_num)?;
        if !matches!(pe.state, PeState::Configured | PeState::DmaBound) {
            tracing::debug!(pe = %pe_num, state = ?pe.state, "PE not configured");
            return Ok(());
        }
        let rid = pe.rid;
        let mve = pe.mve;
        let m = RidMatch::for_pe(topo, pe)?;
        let fw = self.firmware.as_ref();

        if self.config.generation == IodaGeneration::Ioda1 {
            if let Some(mve) = mve {
                if let Err(err) = fw.set_mve_enable(mve, MveAction::Disable) {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        pe = %pe_num,
                        mve,
                        "failed to disable MVE"
                    );
                }
            }
        }

        let start = rid.index();
        let end = (start + m.count).min(RID_COUNT);
        for slot in &mut tables.rmap[start..end] {
            if *slot == Some(pe_num) {
                *slot = None;
            }
        }

        self.update_parent_domains(topo, m.parent, pe_num, DomainAction::Remove);

        if let Err(err) = fw.eeh_freeze_clear(pe_num, FreezeClear::All) {
            tracing::debug!(
                error = &err as &dyn std::error::Error,
                pe = %pe_num,
                "unfreeze before teardown failed"
            );
        }
        if let Err(err) = fw.set_peltv(pe_num, pe_num, DomainAction::Remove) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                pe = %pe_num,
                "failed to remove PE from its own PELTV"
            );
        }
        if let Err(err) = fw.set_pe(pe_num, rid, m.bus, m.device, m.function, PeMapAction::Unmap)
        {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                pe = %pe_num,
                %rid,
                "failed to unmap PELT entry"
            );
        }

        let pe = tables.alloc.get_mut(pe_num)?;
        pe.binding = None;
        pe.mve = None;
        pe.state = PeState::Deconfigured;
        Ok(())
    }

    /// Programs the isolation tables for an allocated, bound PE.
    pub fn configure(&self, topo: &PciTopology, pe: PeNumber) -> Result<(), IodaError> {
        self.configure_pe(topo, &mut self.tables.lock(), pe)
    }

    /// Removes a PE from the isolation tables and drops its binding.
    ///
    /// Deconfiguring a PE that is not configured does nothing.
    pub fn deconfigure(&self, topo: &PciTopology, pe: PeNumber) -> Result<(), IodaError> {
        self.deconfigure_pe(topo, &mut self.tables.lock(), pe)
    }
}
