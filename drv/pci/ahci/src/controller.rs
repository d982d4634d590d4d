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

use alloc::{format, string::String};

use drv_pci::{capability, Command};
use tracing::{debug, error, info, trace, warn};

use crate::{
    ata::Identity,
    port::{Context, Port, PortState, Restrictions},
    quirk::{self, Quirks},
    reg::{
        HBABIOSOSHandoffControl, HBACapabilities, HBACapabilitiesExtended, HBAGlobalControl, Hba,
        PORT, PORT_SIZE,
    },
    request::{Rejected, Request, RequestId},
    wait_until, Config, Error, InitError, Platform,
};

/// The HBA lives behind BAR 5.
const ABAR: usize = 5;

/// Capabilities of the HBA, with broken features masked by quirks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub port_count: u8,
    pub slot_count: u8,
    pub dma64: bool,
    pub ncq: bool,
    pub staggered_spin_up: bool,
    pub command_list_override: bool,
    /// Major and minor AHCI version
    pub version: (u16, u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqResult {
    /// None of the ports raised the interrupt
    Unhandled,
    Handled,
    /// Handled, [`Controller::deferred`] has to run
    InvokeDeferred,
}

pub struct Controller<P: Platform> {
    platform: P,
    config: Config,
    quirks: Quirks,
    name: String,
    registers: Option<P::Registers>,
    caps: Capabilities,
    port_mask: u32,
    ports: [Option<Port>; 32],
    vector: Option<u8>,
}

impl<P: Platform> Controller<P> {
    pub fn new(platform: P, config: Config) -> Self {
        let info = platform.info();
        let quirks = quirk::lookup(info.vendor_id, info.device_id);
        let name = format!("ahci@{}", info.location);
        Self {
            platform,
            config,
            quirks,
            name,
            registers: None,
            caps: Capabilities::default(),
            port_mask: 0,
            ports: core::array::from_fn(|_| None),
            vector: None,
        }
    }

    /// Brings the HBA up and starts all implemented ports. On failure
    /// everything done so far is undone.
    pub fn init(&mut self) -> Result<(), Error> {
        let result = self.try_init();
        if let Err(error) = result {
            error!("{}: {}", self.name, error);
            self.teardown();
        }
        result
    }

    fn try_init(&mut self) -> Result<(), Error> {
        let info = self.platform.info();
        debug!(
            "{}: {:04x}:{:04x}, quirks {:?}",
            self.name, info.vendor_id, info.device_id, self.quirks
        );
        let msi = self.config.msi
            && !self.quirks.contains(Quirks::NO_MSI)
            && self.platform.find_capability(capability::MSI).is_some();
        let line = info.interrupt_line();
        if line.is_none() && !msi {
            return Err(InitError::NoInterrupt.into());
        }
        let abar = info.resource[ABAR]
            .memory()
            .filter(|range| range.end - range.start >= (PORT + PORT_SIZE) as u64)
            .ok_or(InitError::NoRegisters)?;
        let fitting = ((abar.end - abar.start) as usize - PORT) / PORT_SIZE;
        let reachable = u32::MAX.checked_shr(32 - fitting.min(32) as u32).unwrap_or(0);

        if self.quirks.contains(Quirks::JMICRON_AHCI_MODE) {
            debug!("{}: switching to AHCI mode", self.name);
            self.platform
                .write_config(quirk::JMICRON_CONTROL, 4, quirk::JMICRON_CONTROL_AHCI);
        }
        self.platform.enable(Command::MSE | Command::BME);
        self.registers = Some(
            self.platform
                .map_registers(abar)
                .ok_or(InitError::NoRegisters)?,
        );

        self.handoff()?;
        {
            let hba = self.hba()?;
            hba.set_ghc(hba.ghc() - HBAGlobalControl::IE);
        }
        self.reset_controller()
            .map_err(|_| Error::from(InitError::Reset))?;

        let hba = self.hba()?;
        let cap = hba.cap();
        let caps = Capabilities {
            port_count: cap.port_count(),
            slot_count: cap.slot_count(),
            dma64: cap.contains(HBACapabilities::S64A) && !self.quirks.contains(Quirks::FORCE_32BIT),
            ncq: cap.contains(HBACapabilities::SNCQ) && !self.quirks.contains(Quirks::NO_NCQ),
            staggered_spin_up: cap.contains(HBACapabilities::SSS),
            command_list_override: cap.contains(HBACapabilities::SCLO),
            version: hba.version(),
        };
        let mut port_mask = hba.pi();
        if port_mask == 0 {
            port_mask = u32::MAX >> (32 - caps.port_count as u32);
            warn!("{}: no ports implemented, assuming {:#x}", self.name, port_mask);
        }
        if port_mask & !reachable != 0 {
            warn!(
                "{}: ports {:#x} lie past the register window",
                self.name,
                port_mask & !reachable
            );
            port_mask &= reachable;
        }
        if port_mask == 0 {
            return Err(InitError::NoPorts.into());
        }
        self.caps = caps;
        self.port_mask = port_mask;
        info!(
            "{}: AHCI {}.{}, ports {:#x} of {}, {} slots, ncq {}, 64-bit {}",
            self.name,
            caps.version.0,
            caps.version.1,
            port_mask,
            caps.port_count,
            caps.slot_count,
            caps.ncq,
            caps.dma64
        );

        let vector = match (msi.then(|| self.platform.allocate_msi()).flatten(), line) {
            (Some(vector), _) => {
                debug!("{}: using MSI vector {}", self.name, vector);
                vector
            }
            (None, Some(line)) => line,
            (None, None) => return Err(InitError::NoInterrupt.into()),
        };
        self.platform
            .install_interrupt_handler(vector)
            .map_err(|_| Error::from(InitError::Handler))?;
        self.vector = Some(vector);

        for index in ports(port_mask) {
            let port = Port::new(index, caps.slot_count, self.config.max_queued);
            port.init1(&self.context(index)?)?;
            self.ports[index as usize] = Some(port);
        }

        {
            let hba = self.hba()?;
            hba.clear_is(hba.is());
            hba.set_ghc(hba.ghc() | HBAGlobalControl::IE);
        }

        for index in ports(port_mask) {
            if let Some(port) = &self.ports[index as usize] {
                if let Err(error) = port.init2(&self.context(index)?) {
                    warn!("{}: port {} not started: {}", self.name, index, error);
                }
            }
        }
        Ok(())
    }

    /// Takes the HBA over from the firmware.
    fn handoff(&self) -> Result<(), Error> {
        let hba = self.hba()?;
        if !hba.cap2().contains(HBACapabilitiesExtended::BOH) {
            return Ok(());
        }
        hba.set_bohc(hba.bohc() | HBABIOSOSHandoffControl::OOS);
        let released = wait_until(&self.platform, self.config.reset_timeout, || {
            !hba.bohc().intersects(HBABIOSOSHandoffControl::BOS | HBABIOSOSHandoffControl::BB)
        });
        if released.is_err() {
            warn!("{}: firmware did not release the controller", self.name);
        }
        Ok(())
    }

    /// Resets the HBA, restoring what firmware programmed into the
    /// write-once registers.
    fn reset_controller(&mut self) -> Result<(), Error> {
        let hba = self.hba()?;
        let cap = hba.cap() & HBACapabilities::WRITE_ONCE;
        let pi = hba.pi();

        hba.set_ghc(hba.ghc() | HBAGlobalControl::AE);
        hba.set_ghc(hba.ghc() | HBAGlobalControl::HR);
        wait_until(&self.platform, self.config.reset_timeout, || {
            !hba.ghc().contains(HBAGlobalControl::HR)
        })?;
        hba.set_ghc(hba.ghc() | HBAGlobalControl::AE);
        hba.set_cap(hba.cap() | cap);
        hba.set_pi(pi);

        if self.quirks.contains(Quirks::INTEL_PORT_ENABLE) {
            let ports = u32::MAX >> (32 - hba.cap().port_count() as u32);
            let pcs = self.platform.read_config(quirk::INTEL_PCS, 2);
            self.platform
                .write_config(quirk::INTEL_PCS, 2, pcs | ports & 0xFF);
        }
        debug!("{}: reset", self.name);
        Ok(())
    }

    /// Stops all ports and releases everything `init` acquired.
    pub fn uninit(&mut self) {
        self.teardown();
        info!("{}: stopped", self.name);
    }

    fn teardown(&mut self) {
        for index in 0..32 {
            if let Some(port) = self.ports[index as usize].take() {
                if let Ok(cx) = self.context(index) {
                    port.uninit(&cx);
                }
            }
        }
        if let Ok(hba) = self.hba() {
            hba.set_ghc(hba.ghc() - HBAGlobalControl::IE);
            hba.clear_is(hba.is());
        }
        if let Some(vector) = self.vector.take() {
            self.platform.remove_interrupt_handler(vector);
        }
        if let Some(registers) = self.registers.take() {
            self.platform.unmap_registers(registers);
        }
        self.port_mask = 0;
    }

    /// Interrupt routine, dispatches to the ports that raised it.
    pub fn interrupt(&self) -> IrqResult {
        let Ok(hba) = self.hba() else {
            return IrqResult::Unhandled;
        };
        let pending = hba.is() & self.port_mask;
        if pending == 0 {
            return IrqResult::Unhandled;
        }
        trace!("{}: interrupt {:#x}", self.name, pending);

        let mut result = IrqResult::Handled;
        for index in ports(pending) {
            if let (Some(port), Ok(cx)) = (&self.ports[index as usize], self.context(index)) {
                if port.interrupt(&cx) {
                    result = IrqResult::InvokeDeferred;
                }
            }
        }
        // port status first, otherwise the bits are raised again
        hba.clear_is(pending);
        result
    }

    /// Continuation of [`Controller::interrupt`], must not run in interrupt
    /// context.
    pub fn deferred(&self) {
        for index in ports(self.port_mask) {
            if let (Some(port), Ok(cx)) = (&self.ports[index as usize], self.context(index)) {
                port.deferred(&cx);
            }
        }
    }

    /// Periodic timer, detects lost commands and newly attached devices.
    pub fn watchdog(&self) {
        for index in ports(self.port_mask) {
            if let (Some(port), Ok(cx)) = (&self.ports[index as usize], self.context(index)) {
                if port.watchdog(&cx) {
                    port.deferred(&cx);
                }
            }
        }
    }

    /// Submits a request to a port. A request that is not taken comes back
    /// in the error, its callback not invoked.
    pub fn execute(&self, port: u8, request: Request) -> Result<RequestId, Rejected> {
        match self.port(port) {
            Ok((port, cx)) => port.execute(&cx, request),
            Err(error) => Err(Rejected::new(error, request)),
        }
    }

    pub fn abort(&self, port: u8, id: RequestId) -> Result<(), Error> {
        let (port, _) = self.port(port)?;
        port.abort(&self.platform, id)
    }

    pub fn terminate(&self, port: u8, id: RequestId) -> Result<(), Error> {
        let (port, cx) = self.port(port)?;
        port.terminate(&self.platform, id)?;
        port.deferred(&cx);
        Ok(())
    }

    pub fn reset_device(&self, port: u8) -> Result<(), Error> {
        let (port, cx) = self.port(port)?;
        port.reset_device(&cx)
    }

    pub fn restrictions(&self, port: u8) -> Result<Restrictions, Error> {
        let (port, _) = self.port(port)?;
        port.restrictions(&self.platform)
    }

    pub fn identity(&self, port: u8) -> Option<Identity> {
        self.port(port).ok()?.0.identity(&self.platform)
    }

    pub fn port_state(&self, port: u8) -> Option<PortState> {
        self.port(port).ok().map(|(port, _)| port.state(&self.platform))
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn port_mask(&self) -> u32 {
        self.port_mask
    }

    pub fn device_name(&self) -> &str {
        &self.name
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    fn hba(&self) -> Result<Hba<'_, P::Registers>, Error> {
        self.registers
            .as_ref()
            .map(Hba::new)
            .ok_or(Error::Init(InitError::NoRegisters))
    }

    fn context(&self, index: u8) -> Result<Context<'_, P>, Error> {
        Ok(Context {
            platform: &self.platform,
            registers: self.hba()?.port(index),
            config: &self.config,
            caps: &self.caps,
        })
    }

    fn port(&self, index: u8) -> Result<(&Port, Context<'_, P>), Error> {
        match self.ports.get(index as usize) {
            Some(Some(port)) => Ok((port, self.context(index)?)),
            _ => Err(Error::DeviceNotThere),
        }
    }
}

/// Indices of the set bits.
fn ports(mask: u32) -> impl Iterator<Item = u8> {
    (0..32).filter(move |index| mask & 1 << index != 0)
}
