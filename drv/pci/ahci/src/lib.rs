// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AHCI SATA host controller driver.
//!
//! The [`Controller`] owns the HBA and one [`port::Port`] per implemented
//! port. Requests are submitted with [`Controller::execute`] and handed back
//! through their callback once the hardware completed them, they were
//! aborted or the controller shut down.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::ops::Range;

pub mod ata;
pub mod config;
pub mod controller;
pub mod dma;
pub mod error;
pub mod fis;
pub mod port;
pub mod quirk;
pub mod reg;
pub mod request;
pub mod slot;

#[cfg(test)]
mod sim;

pub use config::Config;
pub use controller::{Capabilities, Controller, IrqResult};
pub use dma::DmaRegion;
pub use error::{Error, InitError};
pub use port::{PortState, Restrictions};
pub use request::{Direction, Operation, Reason, Rejected, Request, RequestId, Segment, Status};

/// Kernel services the driver runs on.
///
/// The PCI function is reached through the [`drv_pci::Function`]
/// supertrait, everything else the driver needs from its environment is
/// listed here. Times are in microseconds.
pub trait Platform: drv_pci::Function + Send + Sync {
    type Registers: reg::Registers;

    /// Maps the physical range of the HBA registers.
    fn map_registers(&self, physical: Range<u64>) -> Option<Self::Registers>;

    fn unmap_registers(&self, registers: Self::Registers);

    /// Allocates zeroed, physically contiguous memory, `align` applies to
    /// both the physical and the virtual address.
    fn alloc_dma(&self, size: usize, align: usize) -> Option<DmaRegion>;

    fn free_dma(&self, region: DmaRegion);

    /// Routes the interrupt vector to [`Controller::interrupt`].
    fn install_interrupt_handler(&self, vector: u8) -> Result<(), Error>;

    fn remove_interrupt_handler(&self, vector: u8);

    /// Allocates and programs a message signaled interrupt vector.
    fn allocate_msi(&self) -> Option<u8> {
        None
    }

    /// Runs `f` with [`Controller::interrupt`] held off on the current CPU.
    ///
    /// Port state is shared with the interrupt routine under a spin lock,
    /// every other path takes that lock in here. The default suits platforms
    /// that never run the interrupt routine on a CPU inside the driver.
    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        f()
    }

    /// Monotonic time
    fn now(&self) -> u64;

    /// Busy waits, must not sleep.
    fn delay(&self, us: u64);
}

const POLL_INTERVAL: u64 = 100;

/// Polls until `condition` holds or `timeout` expired.
pub(crate) fn wait_until<P: Platform>(
    platform: &P,
    timeout: u64,
    mut condition: impl FnMut() -> bool,
) -> Result<(), Error> {
    let deadline = platform.now().saturating_add(timeout);
    loop {
        if condition() {
            return Ok(());
        }
        if platform.now() >= deadline {
            return Err(Error::TimedOut);
        }
        platform.delay(POLL_INTERVAL);
    }
}
