// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Division of the topology into PEs.
//!
//! Every bus gets its own PE, except that the whole subtree below a PCIe to
//! PCI bridge shares one: conventional PCI cannot tell its requesters
//! apart. A bus whose M64 window pins PE numbers uses those instead of a
//! fresh allocation.

use crate::config::IodaGeneration;
use crate::dma::dma_weight;
use crate::error::IodaError;
use crate::pe::PeBinding;
use crate::pe::PeGroup;
use crate::pe::PeNumber;
use crate::phb::IodaPhb;
use crate::phb::IodaTables;
use crate::rid::Rid;
use crate::topology::BusId;
use crate::topology::DevicePortType;
use crate::topology::FunctionId;
use crate::topology::PciTopology;
use std::sync::atomic::Ordering;

/// Which buses a bus PE covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BusScope {
    /// Only the functions directly on the bus.
    SingleBus,
    /// The bus and every bus below it.
    Subtree,
}

/// Assigns every function covered by `scope` to `pe` and returns the sum of
/// their DMA weights.
fn assign_functions(topo: &mut PciTopology, bus: BusId, pe: PeNumber, scope: BusScope) -> u32 {
    let mut weight = 0;
    for dev in topo.bus(bus).devices().to_vec() {
        let function = topo.function_mut(dev);
        function.pe = Some(pe);
        weight += dma_weight(function);
        if scope == BusScope::Subtree {
            if let Some(sub) = function.subordinate() {
                weight += assign_functions(topo, sub, pe, scope);
            }
        }
    }
    weight
}

impl IodaPhb {
    /// Groups the topology into PEs and programs the bridge for them:
    /// isolation tables, segment maps and DMA windows.
    ///
    /// Failures are contained to the bus or device concerned, which is left
    /// without a PE.
    pub fn setup(&self, topo: &mut PciTopology) {
        {
            let mut pe_list = self.pe_list.lock();
            let mut guard = self.tables.lock();
            let tables = &mut *guard;

            if let Some(m64) = &tables.m64 {
                m64.reserve_root_port_segments(topo, &mut tables.alloc);
            }

            let root = topo.root_bus();
            self.setup_bus_pes(topo, tables, &mut pe_list, root);

            for &pe in pe_list.iter() {
                if let Err(err) = self.setup_pe_segments(topo, tables, pe) {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        %pe,
                        "failed to set up segments"
                    );
                }
            }

            self.setup_dma(topo, tables);
        }
        self.initialized.store(true, Ordering::Release);
    }

    fn setup_bus_pes(
        &self,
        topo: &mut PciTopology,
        tables: &mut IodaTables,
        pe_list: &mut Vec<PeNumber>,
        bus: BusId,
    ) {
        self.setup_bus_pe(topo, tables, pe_list, bus, BusScope::SingleBus);

        for dev in topo.bus(bus).devices().to_vec() {
            let function = topo.function(dev);
            let Some(sub) = function.subordinate() else {
                continue;
            };
            if function.port_type() == Some(DevicePortType::PcieToPciBridge) {
                self.setup_bus_pe(topo, tables, pe_list, sub, BusScope::Subtree);
            } else {
                self.setup_bus_pes(topo, tables, pe_list, sub);
            }
        }
    }

    fn setup_bus_pe(
        &self,
        topo: &mut PciTopology,
        tables: &mut IodaTables,
        pe_list: &mut Vec<PeNumber>,
        bus: BusId,
        scope: BusScope,
    ) -> Option<PeNumber> {
        let b = topo.bus(bus);
        let picked = match &tables.m64 {
            Some(m64) => m64.pick_pe(topo, bus, scope, &mut tables.alloc),
            None => None,
        };
        let pe_num = match picked {
            Some(pe) => pe,
            None => match tables.alloc.allocate() {
                Ok(pe) => pe,
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        bus = b.number(),
                        "no PE for bus"
                    );
                    return None;
                }
            },
        };

        let pe = tables.alloc.get_mut(pe_num).ok()?;
        pe.binding = Some(match scope {
            BusScope::SingleBus => PeBinding::Bus(bus),
            BusScope::Subtree => PeBinding::BusAll(bus),
        });
        pe.rid = Rid::from_bus_devfn(b.number(), 0);
        tracing::info!(
            pe = %pe_num,
            buses = ?b.numbers(),
            ?scope,
            "bus associated with PE"
        );

        if let Err(err) = self.configure_pe(topo, tables, pe_num) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                pe = %pe_num,
                "failed to configure bus PE"
            );
            self.discard_pe(tables, pe_num);
            return None;
        }

        let weight = assign_functions(topo, bus, pe_num, scope);
        if let Ok(pe) = tables.alloc.get_mut(pe_num) {
            pe.dma_weight = weight;
        }
        pe_list.push(pe_num);
        tables.dma.link(pe_num, weight);
        Some(pe_num)
    }

    /// Drops a PE whose configuration failed, along with any M64 slaves.
    fn discard_pe(&self, tables: &mut IodaTables, pe: PeNumber) {
        let slaves = match tables.alloc.get_mut(pe) {
            Ok(record) => {
                record.binding = None;
                match std::mem::take(&mut record.group) {
                    PeGroup::Master { slaves } => slaves,
                    _ => Vec::new(),
                }
            }
            Err(_) => Vec::new(),
        };
        for p in slaves.into_iter().chain([pe]).filter(|p| p.0 != 0) {
            if let Err(err) = tables.free_pe(p) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    pe = %p,
                    "failed to free PE"
                );
            }
        }
    }

    /// Creates a PE for a single function, such as a hot-added device.
    ///
    /// On IODA2 bridges the PE also gets its DMA windows. On IODA1 the
    /// 32-bit DMA segments are divided up by [`Self::setup`] only.
    pub fn setup_device_pe(
        &self,
        topo: &mut PciTopology,
        function: FunctionId,
    ) -> Result<PeNumber, IodaError> {
        if topo.function(function).pe_number().is_some() {
            return Err(IodaError::Busy);
        }
        let mut pe_list = self.pe_list.lock();
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        let pe_num = tables.alloc.allocate()?;
        let rid = topo.rid(function);
        let pe = tables.alloc.get_mut(pe_num)?;
        pe.binding = Some(PeBinding::Device(function));
        pe.rid = rid;
        tracing::info!(pe = %pe_num, %rid, "device associated with PE");

        if let Err(err) = self.configure_pe(topo, tables, pe_num) {
            self.discard_pe(tables, pe_num);
            return Err(err);
        }

        let f = topo.function_mut(function);
        f.pe = Some(pe_num);
        let weight = dma_weight(f);
        tables.alloc.get_mut(pe_num)?.dma_weight = weight;
        pe_list.push(pe_num);
        tables.dma.link(pe_num, weight);

        if self.config.generation == IodaGeneration::Ioda2 && weight > 0 {
            if let Err(err) = self.setup_modern_dma(topo, tables, pe_num) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    pe = %pe_num,
                    "failed to set up device DMA"
                );
                if let Err(err) = self.teardown_pe(topo, tables, &mut pe_list, pe_num) {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        pe = %pe_num,
                        "failed to roll back device PE"
                    );
                }
                return Err(err);
            }
        }
        Ok(pe_num)
    }

    /// Releases DMA, deconfigures and frees a standalone PE, detaching every
    /// function that pointed at it.
    fn teardown_pe(
        &self,
        topo: &mut PciTopology,
        tables: &mut IodaTables,
        pe_list: &mut Vec<PeNumber>,
        pe_num: PeNumber,
    ) -> Result<(), IodaError> {
        self.release_dma(tables, pe_num)?;
        self.deconfigure_pe(topo, tables, pe_num)?;
        for id in topo.functions().collect::<Vec<_>>() {
            let f = topo.function_mut(id);
            if f.pe == Some(pe_num) {
                f.pe = None;
                f.dma = None;
            }
        }
        pe_list.retain(|&pe| pe != pe_num);
        tables.free_pe(pe_num)
    }

    /// Tears down a standalone PE created for a bus or device: releases its
    /// DMA windows, deconfigures it and frees its number.
    pub fn remove_pe(&self, topo: &mut PciTopology, pe_num: PeNumber) -> Result<(), IodaError> {
        let mut pe_list = self.pe_list.lock();
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        let pe = tables.alloc.get(pe_num)?;
        if pe.group != PeGroup::Standalone {
            return Err(IodaError::Unsupported("removing a compound PE"));
        }
        if matches!(pe.binding, Some(PeBinding::Vf { .. })) {
            return Err(IodaError::Unsupported("VF PEs are removed with SR-IOV disable"));
        }
        if pe.binding.is_none() {
            return Err(IodaError::PeUnbound(pe_num));
        }

        self.teardown_pe(topo, tables, &mut pe_list, pe_num)
    }
}
