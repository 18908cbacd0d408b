// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Partitionable Endpoint management for IODA PCI host bridges.
//!
//! An IODA host bridge isolates PCI functions into Partitionable Endpoints
//! (PEs). This crate decides the PE boundaries for a discovered topology,
//! hands out PE numbers, and programs the bridge tables (PELT, PELTV, MMIO
//! segment maps, DMA windows and MSI bindings) through an [`IodaFirmware`]
//! implementation supplied by the platform.
//!
//! The entry point is [`IodaPhb`].

#![forbid(unsafe_code)]

mod alloc;
mod binding;
pub mod config;
mod dma;
mod eeh;
mod error;
pub mod firmware;
mod grouping;
mod m64;
mod msi;
mod pe;
mod phb;
mod rid;
mod segments;
mod sriov;
pub mod tce;
pub mod topology;

#[cfg(test)]
mod test_helpers;

pub use config::IodaGeneration;
pub use config::PhbConfig;
pub use dma::DdwInfo;
pub use dma::DmaPath;
pub use error::IodaError;
pub use firmware::FirmwareError;
pub use firmware::FreezeState;
pub use firmware::IodaFirmware;
pub use msi::MsiMessage;
pub use pe::Pe;
pub use pe::PeBinding;
pub use pe::PeGroup;
pub use pe::PeNumber;
pub use pe::PeState;
pub use phb::IodaPhb;
pub use rid::Rid;

const SZ_4K: u64 = 0x1000;
const SZ_64K: u64 = 0x1_0000;
const SZ_16M: u64 = 0x100_0000;
const SZ_64M: u64 = 0x400_0000;

/// Number of RIDs addressable on one host bridge.
const RID_COUNT: usize = 1 << 16;
