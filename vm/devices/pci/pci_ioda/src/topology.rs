// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The PCI topology walked by the PE engine.
//!
//! Buses and functions live in an arena and refer to each other by handle.
//! The engine only reads the tree, except for the per-function PE slot, the
//! selected DMA path and the position of SR-IOV BARs.
//!
//! Resource addresses are PCI bus addresses.

use crate::dma::DmaPath;
use crate::pe::PeNumber;
use crate::rid::Rid;
use bitfield_struct::bitfield;
use std::ops::RangeInclusive;

/// Handle to a bus in a [`PciTopology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId(usize);

/// Handle to a function in a [`PciTopology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(usize);

/// Resource type flags.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ResourceFlags {
    /// IO space.
    pub io: bool,
    /// Memory space.
    pub mem: bool,
    /// 64-bit memory.
    pub mem_64: bool,
    /// Prefetchable memory.
    pub prefetch: bool,
    #[bits(28)]
    _reserved: u32,
}

/// An address range decoded by a bridge window or a BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    /// First address.
    pub start: u64,
    /// Last address, inclusive.
    pub end: u64,
    /// Resource type.
    pub flags: ResourceFlags,
    /// Whether the resource has been placed in its parent window.
    pub assigned: bool,
}

impl Resource {
    fn new(start: u64, size: u64, flags: ResourceFlags) -> Self {
        Self {
            start,
            end: start.wrapping_add(size).wrapping_sub(1),
            flags,
            assigned: true,
        }
    }

    /// An IO range.
    pub fn io(start: u64, size: u64) -> Self {
        Self::new(start, size, ResourceFlags::new().with_io(true))
    }

    /// A 32-bit non-prefetchable memory range.
    pub fn mem32(start: u64, size: u64) -> Self {
        Self::new(start, size, ResourceFlags::new().with_mem(true))
    }

    /// A 64-bit prefetchable memory range.
    pub fn mem64_pref(start: u64, size: u64) -> Self {
        Self::new(
            start,
            size,
            ResourceFlags::new()
                .with_mem(true)
                .with_mem_64(true)
                .with_prefetch(true),
        )
    }

    /// Marks the resource as not yet placed.
    pub fn unassigned(mut self) -> Self {
        self.assigned = false;
        self
    }

    /// Length in bytes, or zero for an empty or typeless resource.
    pub fn size(&self) -> u64 {
        if self.flags.into_bits() == 0 || self.end < self.start {
            0
        } else {
            self.end - self.start + 1
        }
    }

    /// Whether this is 64-bit prefetchable memory, the type decoded by M64.
    pub fn is_mem64_pref(&self) -> bool {
        self.flags.mem() && self.flags.mem_64() && self.flags.prefetch()
    }
}

/// Configuration header layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    /// Type 0, ordinary function.
    Normal,
    /// Type 1, PCI-to-PCI bridge.
    Bridge,
    /// Type 2, CardBus bridge.
    CardBus,
}

/// PCI Express port type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePortType {
    /// Ordinary endpoint.
    Endpoint,
    /// Root port.
    RootPort,
    /// Switch upstream port.
    UpstreamSwitchPort,
    /// Switch downstream port.
    DownstreamSwitchPort,
    /// PCIe to conventional PCI bridge.
    PcieToPciBridge,
}

/// SR-IOV capability of a physical function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SriovCapability {
    /// Maximum number of VFs.
    pub total_vfs: u16,
    /// RID offset of the first VF.
    pub first_vf_offset: u16,
    /// RID distance between consecutive VFs.
    pub vf_stride: u16,
    /// VF BARs. Each covers every VF's copy of that BAR.
    pub bars: Vec<Resource>,
}

impl SriovCapability {
    /// The RID of VF `index` under a PF with RID `pf`.
    pub fn vf_rid(&self, pf: Rid, index: u16) -> Rid {
        let routing = pf.into_bits() as u32
            + self.first_vf_offset as u32
            + self.vf_stride as u32 * index as u32;
        Rid::from_bits(routing as u16)
    }
}

/// A bus.
#[derive(Debug)]
pub struct PciBus {
    number_start: u8,
    number_end: u8,
    bridge: Option<FunctionId>,
    devices: Vec<FunctionId>,
    resources: Vec<Resource>,
}

impl PciBus {
    /// Bus number of this bus.
    pub fn number(&self) -> u8 {
        self.number_start
    }

    /// Bus numbers of this bus and every bus below it.
    pub fn numbers(&self) -> RangeInclusive<u8> {
        self.number_start..=self.number_end
    }

    /// The bridge whose secondary bus this is, or `None` for the root bus.
    pub fn bridge(&self) -> Option<FunctionId> {
        self.bridge
    }

    /// Functions directly on this bus.
    pub fn devices(&self) -> &[FunctionId] {
        &self.devices
    }

    /// Windows forwarded to this bus.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Whether this is the root bus of the host bridge.
    pub fn is_root(&self) -> bool {
        self.bridge.is_none()
    }
}

/// A function.
#[derive(Debug)]
pub struct PciFunction {
    bus: BusId,
    devfn: u8,
    class: u32,
    header_type: HeaderType,
    port_type: Option<DevicePortType>,
    subordinate: Option<BusId>,
    sriov: Option<SriovCapability>,
    no_64bit_msi: bool,
    pub(crate) pe: Option<PeNumber>,
    pub(crate) dma: Option<DmaPath>,
}

impl PciFunction {
    /// The bus this function sits on.
    pub fn bus(&self) -> BusId {
        self.bus
    }

    /// Combined device/function number.
    pub fn devfn(&self) -> u8 {
        self.devfn
    }

    /// 24-bit class code.
    pub fn class(&self) -> u32 {
        self.class
    }

    /// Configuration header type.
    pub fn header_type(&self) -> HeaderType {
        self.header_type
    }

    /// PCIe port type, if this is a PCIe function.
    pub fn port_type(&self) -> Option<DevicePortType> {
        self.port_type
    }

    /// Secondary bus of a bridge.
    pub fn subordinate(&self) -> Option<BusId> {
        self.subordinate
    }

    /// SR-IOV capability of a physical function.
    pub fn sriov(&self) -> Option<&SriovCapability> {
        self.sriov.as_ref()
    }

    /// Whether the function cannot take 64-bit MSI addresses.
    pub fn no_64bit_msi(&self) -> bool {
        self.no_64bit_msi
    }

    /// The PE this function was assigned to.
    pub fn pe_number(&self) -> Option<PeNumber> {
        self.pe
    }

    /// The DMA path selected for this function.
    pub fn dma_path(&self) -> Option<DmaPath> {
        self.dma
    }
}

/// The buses and functions below one host bridge.
#[derive(Debug)]
pub struct PciTopology {
    buses: Vec<PciBus>,
    functions: Vec<PciFunction>,
}

const CLASS_BRIDGE_PCI: u32 = 0x060400;

impl PciTopology {
    /// Creates a topology holding only the root bus.
    pub fn new(root_bus: RangeInclusive<u8>) -> Self {
        Self {
            buses: vec![PciBus {
                number_start: *root_bus.start(),
                number_end: *root_bus.end(),
                bridge: None,
                devices: Vec::new(),
                resources: Vec::new(),
            }],
            functions: Vec::new(),
        }
    }

    /// The root bus.
    pub fn root_bus(&self) -> BusId {
        BusId(0)
    }

    /// Adds a function to `bus`.
    pub fn add_function(
        &mut self,
        bus: BusId,
        devfn: u8,
        class: u32,
        header_type: HeaderType,
        port_type: Option<DevicePortType>,
    ) -> FunctionId {
        let id = FunctionId(self.functions.len());
        self.functions.push(PciFunction {
            bus,
            devfn,
            class,
            header_type,
            port_type,
            subordinate: None,
            sriov: None,
            no_64bit_msi: false,
            pe: None,
            dma: None,
        });
        self.buses[bus.0].devices.push(id);
        id
    }

    /// Adds an ordinary PCIe endpoint to `bus`.
    pub fn add_endpoint(&mut self, bus: BusId, devfn: u8, class: u32) -> FunctionId {
        self.add_function(
            bus,
            devfn,
            class,
            HeaderType::Normal,
            Some(DevicePortType::Endpoint),
        )
    }

    /// Adds a bridge to `bus` and returns its new secondary bus.
    pub fn add_bridge(
        &mut self,
        bus: BusId,
        devfn: u8,
        port_type: DevicePortType,
        numbers: RangeInclusive<u8>,
    ) -> BusId {
        let bridge = self.add_function(
            bus,
            devfn,
            CLASS_BRIDGE_PCI,
            HeaderType::Bridge,
            Some(port_type),
        );
        let id = BusId(self.buses.len());
        self.buses.push(PciBus {
            number_start: *numbers.start(),
            number_end: *numbers.end(),
            bridge: Some(bridge),
            devices: Vec::new(),
            resources: Vec::new(),
        });
        self.functions[bridge.0].subordinate = Some(id);
        id
    }

    /// Adds a window forwarded to `bus`.
    pub fn add_bus_resource(&mut self, bus: BusId, resource: Resource) {
        self.buses[bus.0].resources.push(resource);
    }

    /// Attaches an SR-IOV capability to `function`.
    pub fn set_sriov(&mut self, function: FunctionId, sriov: SriovCapability) {
        self.functions[function.0].sriov = Some(sriov);
    }

    /// Marks `function` as unable to use 64-bit MSI addresses.
    pub fn set_no_64bit_msi(&mut self, function: FunctionId) {
        self.functions[function.0].no_64bit_msi = true;
    }

    /// Returns a bus.
    pub fn bus(&self, id: BusId) -> &PciBus {
        &self.buses[id.0]
    }

    /// Returns a function.
    pub fn function(&self, id: FunctionId) -> &PciFunction {
        &self.functions[id.0]
    }

    pub(crate) fn function_mut(&mut self, id: FunctionId) -> &mut PciFunction {
        &mut self.functions[id.0]
    }

    pub(crate) fn sriov_mut(&mut self, id: FunctionId) -> Option<&mut SriovCapability> {
        self.functions[id.0].sriov.as_mut()
    }

    /// Every function, in insertion order.
    pub fn functions(&self) -> impl Iterator<Item = FunctionId> + '_ {
        (0..self.functions.len()).map(FunctionId)
    }

    /// RID of `function`.
    pub fn rid(&self, function: FunctionId) -> Rid {
        let f = self.function(function);
        Rid::from_bus_devfn(self.bus(f.bus).number(), f.devfn)
    }

    /// The bridge above `function`, if it is not on the root bus.
    pub fn parent_bridge(&self, function: FunctionId) -> Option<FunctionId> {
        self.bus(self.function(function).bus).bridge
    }

    /// Finds the function with the given bus number and devfn.
    pub fn find_function(&self, bus: u8, devfn: u8) -> Option<FunctionId> {
        self.functions().find(|&id| {
            let f = self.function(id);
            f.devfn == devfn && self.bus(f.bus).number() == bus
        })
    }

    /// Every function on `bus` and below it, depth first.
    pub fn subtree_functions(&self, bus: BusId) -> Vec<FunctionId> {
        let mut out = Vec::new();
        self.collect_subtree(bus, &mut out);
        out
    }

    fn collect_subtree(&self, bus: BusId, out: &mut Vec<FunctionId>) {
        for &dev in self.bus(bus).devices() {
            out.push(dev);
            if let Some(sub) = self.function(dev).subordinate {
                self.collect_subtree(sub, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_links() {
        let mut topo = PciTopology::new(0..=0xff);
        let root = topo.root_bus();
        let bus1 = topo.add_bridge(root, 0, DevicePortType::RootPort, 1..=4);
        let bus2 = topo.add_bridge(bus1, 0, DevicePortType::UpstreamSwitchPort, 2..=4);
        let ep = topo.add_endpoint(bus2, 0x08, 0x020000);

        assert!(topo.bus(root).is_root());
        assert_eq!(topo.bus(bus1).numbers(), 1..=4);
        assert_eq!(topo.rid(ep), Rid::from_bus_devfn(2, 0x08));
        assert_eq!(topo.find_function(2, 0x08), Some(ep));

        let upstream = topo.bus(bus2).bridge().unwrap();
        assert_eq!(topo.parent_bridge(ep), Some(upstream));
        assert_eq!(topo.subtree_functions(root).len(), 3);
    }

    #[test]
    fn test_resource_size() {
        let r = Resource::mem64_pref(0x1_0000_0000, 0x10_0000);
        assert_eq!(r.size(), 0x10_0000);
        assert!(r.is_mem64_pref());
        assert!(!Resource::mem32(0, 0x1000).is_mem64_pref());

        let mut empty = r;
        empty.flags = ResourceFlags::new();
        assert_eq!(empty.size(), 0);
    }

    #[test]
    fn test_vf_rid() {
        let cap = SriovCapability {
            total_vfs: 8,
            first_vf_offset: 0x80,
            vf_stride: 2,
            bars: Vec::new(),
        };
        let pf = Rid::from_bus_devfn(3, 0);
        assert_eq!(cap.vf_rid(pf, 0), Rid::from_bus_devfn(3, 0x80));
        assert_eq!(cap.vf_rid(pf, 64), Rid::from_bus_devfn(4, 0));
    }
}
