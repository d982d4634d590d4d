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

//! Simulated HBA backing the tests.
//!
//! Physical and virtual addresses are the same, so the simulation reads
//! command lists and tables straight from the driver's DMA memory. Commands
//! stay issued until a test finishes or fails them, except IDENTIFY which
//! completes right away. Time only passes when the driver delays. Each
//! test thread stands in for a CPU when interrupts are held off.

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    cell::Cell,
    collections::HashMap,
    ops::Range,
    ptr::{self, NonNull},
    sync::{Arc, Mutex, MutexGuard},
};

use drv_pci::{capability, offset, Device, Function, Location, Resource};

use crate::{
    ata,
    controller::{Controller, IrqResult},
    dma::DmaRegion,
    fis::{CommandHeader, H2DRegisterFIS, PhysicalRegionDescriptor},
    reg::{
        self, signature, HBABIOSOSHandoffControl, HBACapabilities, HBAGlobalControl,
        HBAPortCommand, HBAPortInterrupt, Registers, TaskFileStatus,
    },
    request::{Request, RequestId, Segment, Status},
    Error, InitError, Platform,
};

pub const ABAR: u64 = 0xFEBF_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disk {
    Ata { sectors: u64, ncq: bool },
    Atapi,
}

/// A command as seen by the simulated HBA when its slot was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Issue {
    pub port: usize,
    pub slot: usize,
    pub command: u8,
    pub lba: u64,
    pub count: u16,
    pub features: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimPort {
    pub clb: u64,
    pub fb: u64,
    pub is: u32,
    pub ie: u32,
    pub cmd: u32,
    pub tfd: u32,
    pub sig: u32,
    pub ssts: u32,
    pub sctl: u32,
    pub serr: u32,
    pub sact: u32,
    pub ci: u32,
    pub device: Option<Disk>,
    /// The device stays busy after COMRESET
    pub stuck: bool,
}

pub struct Setup {
    pub vendor_id: u16,
    pub device_id: u16,
    pub cap: HBACapabilities,
    pub pi: u32,
    pub interrupt_line: u8,
    pub msi: Option<u8>,
    pub devices: Vec<(usize, Disk)>,
    /// HBA reset clears PI and the write-once capabilities
    pub reset_clears: bool,
    /// HBA reset never completes
    pub reset_stuck: bool,
    /// DMA allocations that succeed
    pub dma_limit: Option<usize>,
    pub fail_handler: bool,
    /// Length of the register BAR
    pub abar_size: usize,
    /// DMA regions come back one byte short
    pub dma_short: bool,
}

pub const DISK: Disk = Disk::Ata {
    sectors: 1 << 20,
    ncq: false,
};

impl Default for Setup {
    fn default() -> Self {
        Self {
            vendor_id: 0x8086,
            device_id: 0x2922,
            // 6 ports, 32 slots, 64-bit, NCQ, 3 Gbps
            cap: HBACapabilities::from_bits_retain(0xC020_1F05),
            pi: 0b11,
            interrupt_line: 11,
            msi: None,
            devices: vec![(0, DISK)],
            reset_clears: false,
            reset_stuck: false,
            dma_limit: None,
            fail_handler: false,
            abar_size: reg::ABAR_SIZE,
            dma_short: false,
        }
    }
}

pub struct State {
    pub cap: u32,
    pub ghc: u32,
    pub pi: u32,
    pub cap2: u32,
    pub bohc: u32,
    pub ports: [SimPort; 32],
    pub reset_clears: bool,
    pub reset_stuck: bool,
    pub resets: usize,
    pub log: Vec<Issue>,
    pub clock: u64,
    pub config: [u8; 256],
    dma: HashMap<usize, Layout>,
    pub dma_allocations: usize,
    pub dma_limit: Option<usize>,
    pub installed: Vec<u8>,
    pub removed: Vec<u8>,
    pub mapped: isize,
    pub fail_handler: bool,
    pub dma_short: bool,
    pub msi: Option<u8>,
    /// Commands issued while interrupts were not held off
    pub unmasked_issues: usize,
}

thread_local! {
    static MASKED: Cell<usize> = const { Cell::new(0) };
}

/// Whether the calling thread holds interrupts off.
pub fn masked() -> bool {
    MASKED.with(|masked| masked.get() != 0)
}

struct Shared {
    device: Device,
    state: Mutex<State>,
}

/// Handle to the simulation, clones share it.
#[derive(Clone)]
pub struct Sim(Arc<Shared>);

/// The mapped register window of the simulation.
pub struct SimRegisters(Arc<Shared>);

impl Sim {
    pub fn new(setup: Setup) -> Self {
        let mut ports = [SimPort::default(); 32];
        for (index, disk) in &setup.devices {
            ports[*index].device = Some(*disk);
        }

        let mut config = [0u8; 256];
        config[offset::VENDOR_ID as usize..][..2].copy_from_slice(&setup.vendor_id.to_le_bytes());
        config[offset::DEVICE_ID as usize..][..2].copy_from_slice(&setup.device_id.to_le_bytes());
        if setup.msi.is_some() {
            config[offset::STATUS as usize] = drv_pci::Status::CL.bits() as u8;
            config[offset::CAPABILITIES_POINTER as usize] = 0x80;
            config[0x80] = capability::MSI;
        }

        let device = Device {
            vendor_id: setup.vendor_id,
            device_id: setup.device_id,
            class: [0x01, 0x06, 0x01, 0x02],
            location: Location {
                bus: 0,
                device: 0x1F,
                function: 2,
            },
            interrupt_line: setup.interrupt_line,
            resource: [
                Resource::None,
                Resource::None,
                Resource::None,
                Resource::None,
                Resource::Pio(0xC000..0xC020),
                Resource::Mem32(ABAR as u32..ABAR as u32 + setup.abar_size as u32),
            ],
        };

        Self(Arc::new(Shared {
            device,
            state: Mutex::new(State {
                cap: setup.cap.bits(),
                ghc: 0,
                pi: setup.pi,
                cap2: 0,
                bohc: 0,
                ports,
                reset_clears: setup.reset_clears,
                reset_stuck: setup.reset_stuck,
                resets: 0,
                log: Vec::new(),
                clock: 0,
                config,
                dma: HashMap::new(),
                dma_allocations: 0,
                dma_limit: setup.dma_limit,
                installed: Vec::new(),
                removed: Vec::new(),
                mapped: 0,
                fail_handler: setup.fail_handler,
                dma_short: setup.dma_short,
                msi: setup.msi,
                unmasked_issues: 0,
            }),
        }))
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.0.state()
    }

    pub fn port(&self, index: usize) -> SimPort {
        self.state().ports[index]
    }

    /// Commands issued so far, IDENTIFY included.
    pub fn log(&self) -> Vec<Issue> {
        self.state().log.clone()
    }

    /// Commands of one kind issued so far.
    pub fn issued(&self, command: u8) -> Vec<Issue> {
        self.log()
            .into_iter()
            .filter(|issue| issue.command == command)
            .collect()
    }

    pub fn advance(&self, us: u64) {
        self.state().clock += us;
    }

    /// DMA regions not freed
    pub fn leaked(&self) -> usize {
        self.state().dma.len()
    }

    /// Completes an issued slot successfully.
    pub fn finish(&self, port: usize, slot: usize) {
        let mut state = self.state();
        let sim = &mut state.ports[port];
        let bit = 1 << slot;
        assert!((sim.ci | sim.sact) & bit != 0, "slot {} not issued", slot);
        let queued = sim.sact & bit != 0;
        if !queued {
            let header = unsafe { header(sim.clb, slot) };
            let table = header.table() as *const u8;
            let transferred = (0..header.prdtl as usize)
                .map(|prd| unsafe { prd_at(table, prd) }.length())
                .sum();
            unsafe { set_prdbc(sim.clb, slot, transferred) };
        }
        sim.ci &= !bit;
        sim.sact &= !bit;
        sim.is |= if queued {
            HBAPortInterrupt::SDB.bits()
        } else {
            HBAPortInterrupt::DHR.bits()
        };
    }

    /// Reports a task file error, the issued slots stay issued.
    pub fn fail(&self, port: usize) {
        let mut state = self.state();
        let sim = &mut state.ports[port];
        sim.tfd = 0x04 << 8 | (TaskFileStatus::ERR | TaskFileStatus::DRDY).bits() as u32;
        sim.is |= HBAPortInterrupt::TFE.bits();
    }

    pub fn plug(&self, port: usize, disk: Disk) {
        let mut state = self.state();
        let sim = &mut state.ports[port];
        sim.device = Some(disk);
        sim.stuck = false;
        if sim.sctl & 0xF == 0 {
            sim.link_up();
        }
        sim.is |= HBAPortInterrupt::LINK.bits();
    }

    pub fn unplug(&self, port: usize) {
        let mut state = self.state();
        let sim = &mut state.ports[port];
        sim.device = None;
        sim.ssts = 0;
        sim.is |= HBAPortInterrupt::LINK.bits();
    }

    pub fn set_stuck(&self, port: usize, stuck: bool) {
        self.state().ports[port].stuck = stuck;
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

impl SimPort {
    fn link_up(&mut self) {
        let Some(disk) = self.device else {
            self.ssts = 0;
            return;
        };
        // established, Gen 2, active
        self.ssts = 0x123;
        self.tfd = if self.stuck {
            TaskFileStatus::BSY.bits() as u32
        } else {
            (TaskFileStatus::DRDY.bits() | 1 << 4) as u32
        };
        self.sig = match disk {
            Disk::Atapi => signature::ATAPI,
            Disk::Ata { .. } => signature::ATA,
        };
    }

    fn read(&self, offset: usize) -> u32 {
        match offset {
            reg::PX_CLB => self.clb as u32,
            reg::PX_CLBU => (self.clb >> 32) as u32,
            reg::PX_FB => self.fb as u32,
            reg::PX_FBU => (self.fb >> 32) as u32,
            reg::PX_IS => self.is,
            reg::PX_IE => self.ie,
            reg::PX_CMD => self.cmd,
            reg::PX_TFD => self.tfd,
            reg::PX_SIG => self.sig,
            reg::PX_SSTS => self.ssts,
            reg::PX_SCTL => self.sctl,
            reg::PX_SERR => self.serr,
            reg::PX_SACT => self.sact,
            reg::PX_CI => self.ci,
            _ => 0,
        }
    }
}

impl State {
    fn read(&self, offset: usize) -> u32 {
        match offset {
            reg::CAP => self.cap,
            reg::GHC => self.ghc,
            // level triggered
            reg::IS => self
                .ports
                .iter()
                .enumerate()
                .filter(|(_, port)| port.is & port.ie != 0)
                .fold(0, |is, (index, _)| is | 1 << index),
            reg::PI => self.pi,
            reg::VS => 0x0001_0300,
            reg::CAP2 => self.cap2,
            reg::BOHC => self.bohc,
            offset if (reg::PORT..reg::ABAR_SIZE).contains(&offset) => {
                let offset = offset - reg::PORT;
                self.ports[offset / reg::PORT_SIZE].read(offset % reg::PORT_SIZE)
            }
            _ => 0,
        }
    }

    fn write(&mut self, offset: usize, value: u32) {
        match offset {
            reg::CAP => self.cap = value,
            reg::GHC => {
                if value & HBAGlobalControl::HR.bits() == 0 {
                    self.ghc = value;
                } else if self.reset_stuck {
                    self.ghc = value;
                } else {
                    self.reset();
                }
            }
            reg::PI => self.pi = value,
            reg::BOHC => {
                self.bohc = if value & HBABIOSOSHandoffControl::OOS.bits() != 0 {
                    HBABIOSOSHandoffControl::OOS.bits()
                } else {
                    value
                }
            }
            offset if (reg::PORT..reg::ABAR_SIZE).contains(&offset) => {
                let offset = offset - reg::PORT;
                self.write_port(offset / reg::PORT_SIZE, offset % reg::PORT_SIZE, value)
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.resets += 1;
        self.ghc = 0;
        for port in &mut self.ports {
            port.is = 0;
            port.ie = 0;
            port.cmd = 0;
            port.serr = 0;
            port.sact = 0;
            port.ci = 0;
        }
        if self.reset_clears {
            self.cap &= !HBACapabilities::WRITE_ONCE.bits();
            self.pi = 0;
        }
    }

    fn write_port(&mut self, index: usize, offset: usize, value: u32) {
        let port = &mut self.ports[index];
        match offset {
            reg::PX_CLB => port.clb = port.clb & !0xFFFF_FFFF | value as u64,
            reg::PX_CLBU => port.clb = port.clb & 0xFFFF_FFFF | (value as u64) << 32,
            reg::PX_FB => port.fb = port.fb & !0xFFFF_FFFF | value as u64,
            reg::PX_FBU => port.fb = port.fb & 0xFFFF_FFFF | (value as u64) << 32,
            reg::PX_IS => port.is &= !value,
            reg::PX_IE => port.ie = value,
            reg::PX_CMD => {
                let mut cmd = HBAPortCommand::from_bits_retain(value)
                    - HBAPortCommand::CR
                    - HBAPortCommand::FR
                    - HBAPortCommand::CLO;
                if value & HBAPortCommand::CLO.bits() != 0 {
                    port.tfd &= !((TaskFileStatus::BSY | TaskFileStatus::DRQ).bits() as u32);
                }
                if cmd.contains(HBAPortCommand::ST) {
                    cmd |= HBAPortCommand::CR;
                } else {
                    port.ci = 0;
                    port.sact = 0;
                }
                if cmd.contains(HBAPortCommand::FRE) {
                    cmd |= HBAPortCommand::FR;
                }
                port.cmd = cmd.bits();
            }
            reg::PX_SCTL => {
                port.sctl = value;
                match value & 0xF {
                    0 => port.link_up(),
                    1 => {
                        port.ssts = 0;
                        port.tfd = TaskFileStatus::BSY.bits() as u32;
                        port.sig = u32::MAX;
                    }
                    _ => {}
                }
            }
            reg::PX_SERR => port.serr &= !value,
            reg::PX_SACT => port.sact |= value,
            reg::PX_CI => {
                let issued = value & !port.ci;
                port.ci |= value;
                for slot in (0..32).filter(|slot| issued & 1 << slot != 0) {
                    self.execute(index, slot);
                }
            }
            _ => {}
        }
    }

    fn execute(&mut self, index: usize, slot: usize) {
        let port = &mut self.ports[index];
        let header = unsafe { header(port.clb, slot) };
        let table = header.table() as *const u8;
        let fis = unsafe { ptr::read_volatile(table.cast::<H2DRegisterFIS>()) };
        self.log.push(Issue {
            port: index,
            slot,
            command: fis.command,
            lba: fis.lba(),
            count: fis.count(),
            features: fis.features(),
        });

        if !matches!(
            fis.command,
            ata::IDENTIFY_DEVICE | ata::IDENTIFY_PACKET_DEVICE
        ) {
            return;
        }
        let Some(disk) = port.device else {
            return;
        };
        let data = identify(disk);
        unsafe {
            let buffer = prd_at(table, 0).address() as *mut u16;
            for (word, value) in data.iter().enumerate() {
                ptr::write_volatile(buffer.add(word), *value);
            }
            set_prdbc(port.clb, slot, ata::IDENTIFY_SIZE as u32);
        }
        port.ci &= !(1 << slot);
        port.is |= (HBAPortInterrupt::DHR | HBAPortInterrupt::PS).bits();
    }
}

unsafe fn header(clb: u64, slot: usize) -> CommandHeader {
    ptr::read_volatile((clb as *const CommandHeader).add(slot))
}

unsafe fn set_prdbc(clb: u64, slot: usize, value: u32) {
    let header = (clb as *mut CommandHeader).add(slot);
    ptr::write_volatile(ptr::addr_of_mut!((*header).prdbc), value);
}

unsafe fn prd_at(table: *const u8, index: usize) -> PhysicalRegionDescriptor {
    ptr::read_volatile(table.add(0x80).cast::<PhysicalRegionDescriptor>().add(index))
}

fn identify(disk: Disk) -> [u16; 256] {
    fn put(words: &mut [u16], text: &str) {
        let bytes = text.as_bytes();
        for (index, word) in words.iter_mut().enumerate() {
            let byte = |offset: usize| *bytes.get(index * 2 + offset).unwrap_or(&b' ') as u16;
            *word = byte(0) << 8 | byte(1);
        }
    }

    let mut data = [0u16; 256];
    match disk {
        Disk::Ata { sectors, ncq } => {
            put(&mut data[10..20], "SIM0001");
            put(&mut data[23..27], "1.0");
            put(&mut data[27..47], "SIM ATA DISK");
            let lba28 = sectors.min(0x0FFF_FFFF);
            data[60] = lba28 as u16;
            data[61] = (lba28 >> 16) as u16;
            data[83] = 1 << 10;
            for word in 0..4 {
                data[100 + word] = (sectors >> (word * 16)) as u16;
            }
            if ncq {
                data[75] = 31;
                data[76] = 1 << 8;
            }
        }
        Disk::Atapi => {
            data[0] = 0x8580;
            put(&mut data[27..47], "SIM ATAPI DRIVE");
        }
    }
    data
}

impl Registers for SimRegisters {
    fn read(&self, offset: usize) -> u32 {
        self.0.state().read(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        let mut state = self.0.state();
        let issue = (reg::PORT..reg::ABAR_SIZE).contains(&offset)
            && (offset - reg::PORT) % reg::PORT_SIZE == reg::PX_CI;
        if issue && !masked() {
            state.unmasked_issues += 1;
        }
        state.write(offset, value)
    }
}

impl Function for Sim {
    fn info(&self) -> &Device {
        &self.0.device
    }

    fn read_config(&self, offset: u16, size: u8) -> u32 {
        let state = self.state();
        (0..size as usize).fold(0, |value, byte| {
            value | (state.config[offset as usize + byte] as u32) << (byte * 8)
        })
    }

    fn write_config(&self, offset: u16, size: u8, value: u32) {
        let mut state = self.state();
        for byte in 0..size as usize {
            state.config[offset as usize + byte] = (value >> (byte * 8)) as u8;
        }
    }
}

impl Platform for Sim {
    type Registers = SimRegisters;

    fn map_registers(&self, physical: Range<u64>) -> Option<SimRegisters> {
        assert_eq!(physical.start, ABAR);
        self.state().mapped += 1;
        Some(SimRegisters(self.0.clone()))
    }

    fn unmap_registers(&self, _registers: SimRegisters) {
        self.state().mapped -= 1;
    }

    fn alloc_dma(&self, size: usize, align: usize) -> Option<DmaRegion> {
        let mut state = self.state();
        if state.dma_limit.is_some_and(|limit| state.dma_allocations >= limit) {
            return None;
        }
        state.dma_allocations += 1;
        let layout = Layout::from_size_align(size, align).ok()?;
        let virt = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        state.dma.insert(virt.as_ptr() as usize, layout);
        let size = if state.dma_short { size - 1 } else { size };
        Some(unsafe { DmaRegion::new(virt.as_ptr() as u64, virt, size) })
    }

    fn free_dma(&self, region: DmaRegion) {
        let layout = self
            .state()
            .dma
            .remove(&(region.virt().as_ptr() as usize))
            .expect("freeing unknown region");
        unsafe { dealloc(region.virt().as_ptr(), layout) };
    }

    fn install_interrupt_handler(&self, vector: u8) -> Result<(), Error> {
        let mut state = self.state();
        if state.fail_handler {
            return Err(InitError::Handler.into());
        }
        state.installed.push(vector);
        Ok(())
    }

    fn remove_interrupt_handler(&self, vector: u8) {
        self.state().removed.push(vector);
    }

    fn allocate_msi(&self) -> Option<u8> {
        self.state().msi
    }

    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        MASKED.with(|masked| masked.set(masked.get() + 1));
        let result = f();
        MASKED.with(|masked| masked.set(masked.get() - 1));
        result
    }

    fn now(&self) -> u64 {
        self.state().clock
    }

    fn delay(&self, us: u64) {
        self.state().clock += us;
    }
}

/// Runs interrupt and deferred work until the simulation is quiet.
pub fn settle(controller: &Controller<Sim>) {
    for _ in 0..64 {
        match controller.interrupt() {
            IrqResult::Unhandled => break,
            IrqResult::Handled => {}
            IrqResult::InvokeDeferred => controller.deferred(),
        }
    }
    controller.deferred();
}

/// Collects what the callbacks hand back.
#[derive(Clone, Default)]
pub struct Completions(Arc<Mutex<Vec<(RequestId, Status)>>>);

impl Completions {
    pub fn callback(&self) -> impl FnOnce(Request) + Send + 'static {
        let completions = self.clone();
        move |request| {
            if let (Some(id), Some(status)) = (request.id(), request.status()) {
                completions.0.lock().unwrap().push((id, status));
            }
        }
    }

    pub fn take(&self) -> Vec<(RequestId, Status)> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn status(&self, id: RequestId) -> Option<Status> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .find(|(completed, _)| *completed == id)
            .map(|(_, status)| *status)
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// A read of `blocks` 512 byte blocks into one segment.
pub fn read(lba: u64, blocks: u32, completions: &Completions) -> Request {
    Request::read(
        lba,
        blocks,
        vec![Segment {
            address: 0x1000_0000 + lba * 512,
            length: blocks * 512,
        }],
        completions.callback(),
    )
}
