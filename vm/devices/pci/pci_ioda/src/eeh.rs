// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Freeze control for PEs and their compound groups.
//!
//! Every operation resolves a slave to its master, acts on the master and
//! then on each slave. The PE list lock is held throughout so group
//! membership cannot change underneath.

use crate::error::IodaError;
use crate::firmware::FreezeClear;
use crate::firmware::FreezeSet;
use crate::firmware::FreezeState;
use crate::pe::PeGroup;
use crate::pe::PeNumber;
use crate::phb::IodaPhb;

impl IodaPhb {
    /// The master of `pe`'s group and the master's slaves.
    fn freeze_group(&self, pe: PeNumber) -> Result<(PeNumber, Vec<PeNumber>), IodaError> {
        let tables = self.tables.lock();
        let mut record = tables.alloc.get(pe)?;
        if let PeGroup::Slave { master } = record.group {
            record = tables.alloc.get(master)?;
            if !record.is_master() {
                tracing::warn!(%pe, %master, "slave PE points at a PE that is not a master");
            }
        }
        let slaves = match &record.group {
            PeGroup::Master { slaves } => slaves.clone(),
            _ => Vec::new(),
        };
        Ok((record.number(), slaves))
    }

    /// Freezes MMIO and DMA for `pe` and every PE in its group.
    ///
    /// A failure on the master aborts; failures on slaves are logged.
    pub fn freeze_pe(&self, pe: PeNumber) -> Result<(), IodaError> {
        let _list = self.pe_list.lock();
        let (master, slaves) = self.freeze_group(pe)?;

        self.firmware
            .eeh_freeze_set(master, FreezeSet::All)
            .map_err(|err| {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    pe = %master,
                    "failed to freeze PE"
                );
                IodaError::firmware("eeh_freeze_set", Some(master), err)
            })?;

        for slave in slaves {
            if let Err(err) = self.firmware.eeh_freeze_set(slave, FreezeSet::All) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    pe = %slave,
                    %master,
                    "failed to freeze slave PE"
                );
            }
        }
        Ok(())
    }

    /// Clears the freeze selected by `action` on `pe` and every PE in its
    /// group.
    ///
    /// A failure on the master aborts. Slaves are all attempted; the first
    /// slave failure is returned afterwards.
    pub fn unfreeze_pe(&self, pe: PeNumber, action: FreezeClear) -> Result<(), IodaError> {
        let _list = self.pe_list.lock();
        let (master, slaves) = self.freeze_group(pe)?;

        self.firmware
            .eeh_freeze_clear(master, action)
            .map_err(|err| {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    pe = %master,
                    ?action,
                    "failed to unfreeze PE"
                );
                IodaError::firmware("eeh_freeze_clear", Some(master), err)
            })?;

        let mut result = Ok(());
        for slave in slaves {
            if let Err(err) = self.firmware.eeh_freeze_clear(slave, action) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    pe = %slave,
                    %master,
                    ?action,
                    "failed to unfreeze slave PE"
                );
                if result.is_ok() {
                    result = Err(IodaError::firmware("eeh_freeze_clear", Some(slave), err));
                }
            }
        }
        result
    }

    /// The worst freeze state across `pe`'s group.
    ///
    /// PE numbers outside the table are permanently unavailable. A PE whose
    /// state cannot be read counts as temporarily unavailable.
    pub fn pe_state(&self, pe: PeNumber) -> FreezeState {
        if pe.0 >= self.config.total_pe {
            return FreezeState::PermUnavailable;
        }
        let _list = self.pe_list.lock();
        let Ok((master, slaves)) = self.freeze_group(pe) else {
            return FreezeState::PermUnavailable;
        };

        std::iter::once(master)
            .chain(slaves)
            .map(|p| {
                self.firmware.eeh_freeze_status(p).unwrap_or_else(|err| {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        pe = %p,
                        "failed to read PE state"
                    );
                    FreezeState::TempUnavailable
                })
            })
            .max()
            .unwrap_or(FreezeState::NotFrozen)
    }
}
