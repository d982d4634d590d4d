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

//! Port state machine.
//!
//! All state of a port lives behind one spin lock shared by submission,
//! the interrupt routine and the deferred continuation. Outside the
//! interrupt routine the lock is only taken with interrupts held off, see
//! [`Platform::without_interrupts`]. The lock is never held while waiting on
//! the hardware, such waits only happen with `recovering` set, which keeps
//! submissions and a second recovery out.

use alloc::{collections::VecDeque, vec::Vec};
use core::{iter, mem};

use bitflags::bitflags;
use spin::Mutex;
use tracing::{debug, info, trace, warn};

use crate::{
    ata::{Identity, IDENTIFY_SIZE},
    config::Config,
    controller::Capabilities,
    dma::{PortMemory, PORT_MEMORY_ALIGN},
    fis::{self, CommandHeader, CommandTable, Geometry, PhysicalRegionDescriptor},
    reg::{sctl, signature, HBAPortCommand, HBAPortInterrupt, PortRegisters, TaskFileStatus},
    request::{Operation, Reason, Rejected, Request, RequestId, Status},
    slot::{Command, Issued, SlotTable},
    wait_until, Error, InitError, Platform,
};

/// COMRESET has to be asserted for at least 1 ms.
const COMRESET_DELAY: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Uninitialized,
    /// No device attached
    LinkDown,
    /// Device attached, identification in progress
    DeviceDetected,
    Idle,
    CommandsPending,
    /// Recovering, or failed for good
    Error,
    ShuttingDown,
}

/// What the layer above has to take into account for the attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restrictions {
    pub removable: bool,
    /// Sense data has to be requested explicitly
    pub no_auto_sense: bool,
    /// Largest block count of a single request
    pub max_blocks: u32,
}

/// Everything a port borrows from its controller for one call.
pub(crate) struct Context<'a, P: Platform> {
    pub platform: &'a P,
    pub registers: PortRegisters<'a, P::Registers>,
    pub config: &'a Config,
    pub caps: &'a Capabilities,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Pending: u8 {
        /// Stop the port, reset the link and detect the device again
        const RECOVER = 1 << 0;
        /// Restart the command engine after a terminated command
        const RESTART = 1 << 1;
        /// The link changed
        const RESCAN = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Work {
    Recover,
    Restart,
}

/// Requests handed back to their owners once the port lock is released.
type Finished = Vec<(Request, Status)>;

pub struct Port {
    index: u8,
    inner: Mutex<Inner>,
}

struct Inner {
    state: PortState,
    /// Recovery gave up, only a link change brings the port back
    failed: bool,
    recovering: bool,
    pending: Pending,
    memory: Option<PortMemory>,
    slots: SlotTable,
    queue: VecDeque<(u64, Request)>,
    next_id: u64,
    next_seq: u64,
    atapi: bool,
    identity: Option<Identity>,
    /// Native queued commands allowed in flight, 0 if not used
    ncq_depth: u8,
    /// Slots that missed their deadline
    expired: u32,
    /// Failed detections and identifications since the last identification
    attempts: u8,
}

impl Port {
    pub(crate) fn new(index: u8, slot_count: u8, max_queued: usize) -> Self {
        Self {
            index,
            inner: Mutex::new(Inner {
                state: PortState::Uninitialized,
                failed: false,
                recovering: false,
                pending: Pending::empty(),
                memory: None,
                slots: SlotTable::new(slot_count),
                queue: VecDeque::with_capacity(max_queued),
                next_id: 0,
                next_seq: 0,
                atapi: false,
                identity: None,
                ncq_depth: 0,
                expired: 0,
                attempts: 0,
            }),
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn state<P: Platform>(&self, platform: &P) -> PortState {
        self.with(platform, |inner| inner.state)
    }

    pub fn identity<P: Platform>(&self, platform: &P) -> Option<Identity> {
        self.with(platform, |inner| inner.identity.clone())
    }

    /// Runs `f` on the port state, the interrupt routine held off.
    fn with<P: Platform, R>(&self, platform: &P, f: impl FnOnce(&mut Inner) -> R) -> R {
        platform.without_interrupts(|| f(&mut *self.inner.lock()))
    }

    /// Allocates the port memory and points the HBA at it, the link is not
    /// touched.
    pub(crate) fn init1<P: Platform>(&self, cx: &Context<'_, P>) -> Result<(), Error> {
        let registers = &cx.registers;
        let slot_count = cx.caps.slot_count;
        let region = cx
            .platform
            .alloc_dma(PortMemory::size(slot_count), PORT_MEMORY_ALIGN)
            .ok_or(InitError::Memory)?;
        let memory = PortMemory::new(region, slot_count).map_err(|region| {
            warn!("port {}: unusable DMA region of {} bytes", self.index, region.size());
            cx.platform.free_dma(region);
            InitError::Memory
        })?;
        if !cx.caps.dma64 && memory.end() > u32::MAX as u64 {
            warn!("port {}: memory above 4 GiB without 64-bit DMA", self.index);
            cx.platform.free_dma(memory.into_region());
            return Err(InitError::Memory.into());
        }

        // firmware may have left the port running
        let stopped = stop_engine(cx).and_then(|()| stop_fis(cx));
        if let Err(error) = &stopped {
            warn!("port {}: engine did not stop: {}", self.index, error);
        }

        registers.set_command_list(memory.command_list_address());
        registers.set_fis_base(memory.received_fis_address());
        registers.clear_serr(u32::MAX);
        registers.clear_is(HBAPortInterrupt::from_bits_retain(u32::MAX));
        registers.set_ie(HBAPortInterrupt::empty());

        let mut cmd = registers.cmd() | HBAPortCommand::FRE;
        if cx.caps.staggered_spin_up {
            cmd |= HBAPortCommand::SUD;
        }
        if cmd.contains(HBAPortCommand::CPD) {
            cmd |= HBAPortCommand::POD;
        }
        registers.set_cmd(cmd);

        let state = self.with(cx.platform, |inner| {
            inner.failed = stopped.is_err();
            inner.memory = Some(memory);
            inner.state = if inner.failed {
                PortState::Error
            } else {
                PortState::LinkDown
            };
            inner.state
        });
        debug!("port {}: initialized, {:?}", self.index, state);
        Ok(())
    }

    /// Starts the port, expects interrupts to be enabled globally.
    pub(crate) fn init2<P: Platform>(&self, cx: &Context<'_, P>) -> Result<(), Error> {
        self.with(cx.platform, |inner| {
            if inner.failed || inner.state != PortState::LinkDown {
                return Err(Error::DeviceNotThere);
            }
            inner.recovering = true;
            Ok(())
        })?;

        let mut finished = Vec::new();
        let result = self.detect(cx, &mut finished);
        deliver(finished);
        result.map(|_| ())
    }

    /// Stops the port and hands back every request with `Shutdown`.
    pub(crate) fn uninit<P: Platform>(self, cx: &Context<'_, P>) {
        let Port { index, inner } = self;
        let mut inner = inner.into_inner();
        let registers = &cx.registers;
        inner.state = PortState::ShuttingDown;

        registers.set_ie(HBAPortInterrupt::empty());
        if let Err(error) = stop_engine(cx).and_then(|()| stop_fis(cx)) {
            warn!("port {}: engine did not stop: {}", index, error);
        }

        let mut finished = Vec::new();
        for slot in 0..inner.slots.len() {
            if let Some(issued) = inner.slots.release(slot) {
                if let Command::Request(request) = issued.command {
                    let reason = issued.cancel.unwrap_or(Reason::Shutdown);
                    finished.push((request, Status::Aborted(reason)));
                }
            } else if let Some((Command::Request(request), status)) = inner.slots.free(slot) {
                finished.push((request, status));
            }
        }
        abort_queue(&mut inner.queue, Reason::Shutdown, &mut finished);

        if let Some(memory) = inner.memory.take() {
            registers.set_command_list(0);
            registers.set_fis_base(0);
            cx.platform.free_dma(memory.into_region());
        }
        debug!("port {}: stopped, {} requests aborted", index, finished.len());
        drop(inner);
        deliver(finished);
    }

    /// Submits a request, it is issued right away if a slot is free and
    /// queued otherwise.
    ///
    /// A rejected request is handed back without invoking its callback.
    pub(crate) fn execute<P: Platform>(
        &self,
        cx: &Context<'_, P>,
        mut request: Request,
    ) -> Result<RequestId, Rejected> {
        if !request.is_pending() {
            return Err(Rejected::new(Error::InvalidRequest, request));
        }

        self.with(cx.platform, |inner| {
            let checked = inner
                .accepting(cx.caps)
                .and_then(|geometry| fis::validate(&request, &geometry));
            if let Err(error) = checked {
                return Err(Rejected::new(error, request));
            }

            let id = RequestId(inner.next_id);
            request.assign(id);
            let seq = inner.next_seq;

            // never overtake what is already queued
            let (seq, request) = if inner.queue.is_empty() {
                match inner.try_issue(self.index, cx, seq, request) {
                    Ok(()) => {
                        inner.next_id += 1;
                        inner.next_seq += 1;
                        inner.state = PortState::CommandsPending;
                        return Ok(id);
                    }
                    Err(rejected) => rejected,
                }
            } else {
                (seq, request)
            };

            if inner.queue.len() >= cx.config.max_queued {
                return Err(Rejected::new(Error::QueueFull, request));
            }
            inner.next_id += 1;
            inner.next_seq += 1;
            trace!("port {}: queued {:?}", self.index, id);
            inner.queue.push_back((seq, request));
            inner.state = PortState::CommandsPending;
            Ok(id)
        })
    }

    /// Aborts a request. A queued request is handed back right away, an
    /// issued one as soon as the hardware releases its slot.
    pub(crate) fn abort<P: Platform>(&self, platform: &P, id: RequestId) -> Result<(), Error> {
        self.cancel(platform, id, Reason::Cancelled)
    }

    /// Like [`Port::abort`], but also stops the command engine so an issued
    /// request is released without waiting for the device.
    pub(crate) fn terminate<P: Platform>(&self, platform: &P, id: RequestId) -> Result<(), Error> {
        self.cancel(platform, id, Reason::Terminated)
    }

    fn cancel<P: Platform>(&self, platform: &P, id: RequestId, reason: Reason) -> Result<(), Error> {
        let request = self.with(platform, |inner| {
            if let Some(position) = inner.queue.iter().position(|(_, request)| request.id() == Some(id)) {
                let (_, request) = inner.queue.remove(position).ok_or(Error::NoSuchRequest)?;
                inner.update_state();
                Ok(Some(request))
            } else if inner.slots.claim(id, reason) {
                debug!("port {}: {:?} claimed for {:?}", self.index, id, reason);
                if reason == Reason::Terminated {
                    inner.pending |= Pending::RESTART;
                }
                Ok(None)
            } else {
                Err(Error::NoSuchRequest)
            }
        })?;
        if let Some(request) = request {
            request.finish(Status::Aborted(reason));
        }
        Ok(())
    }

    /// Resets the device, issued requests are aborted with `Reset`, queued
    /// ones are issued once the device is identified again.
    pub(crate) fn reset_device<P: Platform>(&self, cx: &Context<'_, P>) -> Result<(), Error> {
        self.with(cx.platform, |inner| {
            if inner.failed {
                return Err(Error::DeviceNotThere);
            }
            match inner.state {
                PortState::Uninitialized | PortState::LinkDown | PortState::ShuttingDown => {
                    return Err(Error::DeviceNotThere)
                }
                _ if inner.recovering => return Err(Error::Busy),
                _ => {}
            }
            inner.slots.claim_all(Reason::Reset);
            inner.pending.remove(Pending::RECOVER | Pending::RESTART);
            inner.recovering = true;
            inner.state = PortState::Error;
            inner.attempts = 0;
            Ok(())
        })?;
        info!("port {}: resetting device", self.index);

        let mut finished = Vec::new();
        self.release(cx, &mut finished);
        let result = self.detect(cx, &mut finished);
        deliver(finished);
        self.deferred(cx);
        match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::DeviceNotThere),
            Err(_) => Err(Error::DeviceError),
        }
    }

    pub(crate) fn restrictions<P: Platform>(&self, platform: &P) -> Result<Restrictions, Error> {
        self.with(platform, |inner| match &inner.identity {
            Some(identity) if !inner.failed => Ok(Restrictions {
                removable: identity.atapi || identity.removable,
                no_auto_sense: identity.atapi,
                max_blocks: if identity.lba48 { 1 << 16 } else { 1 << 8 },
            }),
            _ if inner.state == PortState::DeviceDetected => Err(Error::Busy),
            _ => Err(Error::DeviceNotThere),
        })
    }

    /// Interrupt routine, returns whether the deferred continuation has
    /// work to do. The only path taking the port lock directly.
    pub(crate) fn interrupt<P: Platform>(&self, cx: &Context<'_, P>) -> bool {
        let registers = &cx.registers;
        let status = registers.is();
        if status.intersects(HBAPortInterrupt::LINK) {
            // PCS follows SERR.DIAG.X
            registers.clear_serr(u32::MAX);
        }
        registers.clear_is(status);

        let mut inner = self.inner.lock();
        trace!("port {}: interrupt {:?}", self.index, status);
        if inner.recovering
            || matches!(
                inner.state,
                PortState::Uninitialized | PortState::ShuttingDown
            )
        {
            return false;
        }

        let mut deferred = false;
        let active = registers.ci() | registers.sact();
        for slot in slots(inner.slots.issued_mask() & !active) {
            let transferred = match inner.slots.issued(slot) {
                Some(Issued {
                    command: Command::Request(request),
                    ncq: true,
                    ..
                }) => request.byte_count() as u32,
                _ => inner
                    .memory
                    .as_ref()
                    .map_or(0, |memory| memory.header(slot).prdbc),
            };
            inner
                .slots
                .complete(slot, Status::Completed { transferred });
            deferred = true;
        }

        if status.intersects(HBAPortInterrupt::ERROR) {
            if let Some(fis) = inner.memory.as_ref().map(PortMemory::received_fis) {
                trace!(
                    "port {}: error, active {:#x}, last status {:#04x} error {:#04x}",
                    self.index,
                    active,
                    fis.status,
                    fis.error
                );
            }
            inner.slots.claim_all(Reason::DeviceError);
            inner.state = PortState::Error;
            inner.pending |= Pending::RECOVER;
            deferred = true;
        }
        if status.intersects(HBAPortInterrupt::LINK) {
            inner.pending |= Pending::RESCAN;
            deferred = true;
        }
        deferred
    }

    /// Deferred continuation: runs pending recovery, hands back finished
    /// requests and issues queued ones.
    pub(crate) fn deferred<P: Platform>(&self, cx: &Context<'_, P>) {
        let mut finished = Vec::new();
        loop {
            let work = self.with(cx.platform, |inner| {
                inner.collect(self.index, cx, &mut finished);
                inner.take_work(self.index, cx)
            });
            match work {
                Some(Work::Recover) => {
                    let task_file = cx.registers.tfd();
                    warn!(
                        "port {}: recovering, status {:?} error {:#04x}",
                        self.index, task_file.status, task_file.error
                    );
                    self.release(cx, &mut finished);
                    // the outcome is reflected in the port state
                    let _ = self.detect(cx, &mut finished);
                }
                Some(Work::Restart) => {
                    let identify = self.release(cx, &mut finished);
                    self.restart(cx, identify);
                }
                None => break,
            }
        }
        deliver(finished);
    }

    /// Watchdog tick, returns whether the deferred continuation has work to
    /// do.
    pub(crate) fn watchdog<P: Platform>(&self, cx: &Context<'_, P>) -> bool {
        self.with(cx.platform, |inner| {
            if inner.recovering {
                return false;
            }
            match inner.state {
                PortState::DeviceDetected | PortState::Idle | PortState::CommandsPending => {
                    let expired = inner.slots.expired(cx.platform.now());
                    if expired != 0 {
                        warn!("port {}: slots {:#x} timed out", self.index, expired);
                        inner.expired |= expired;
                        inner.state = PortState::Error;
                        inner.pending |= Pending::RECOVER;
                    }
                }
                PortState::LinkDown => {
                    if cx.registers.ssts().present() {
                        inner.pending |= Pending::RESCAN;
                    }
                }
                _ => {}
            }
            !inner.pending.is_empty()
        })
    }

    /// Takes every issued command back, claimed ones are finished, timed out
    /// ones are retried or finished, the rest is requeued in order. Returns
    /// whether an identification was dropped.
    fn release<P: Platform>(&self, cx: &Context<'_, P>, finished: &mut Finished) -> bool {
        self.with(cx.platform, |inner| {
            let expired = mem::take(&mut inner.expired);
            let mut identify = false;
            let mut requeue = Vec::new();
            for slot in slots(inner.slots.issued_mask()) {
                let Some(issued) = inner.slots.release(slot) else {
                    continue;
                };
                let timed_out = expired & 1 << slot != 0;
                match issued.command {
                    Command::Identify => {
                        identify = true;
                        if issued.cancel.is_some() || timed_out {
                            inner.attempts = inner.attempts.saturating_add(1);
                        }
                    }
                    Command::Request(mut request) => match issued.cancel {
                        Some(reason) => finished.push((request, Status::Aborted(reason))),
                        None if timed_out && request.attempt() > cx.config.command_retries => {
                            finished.push((request, Status::Aborted(Reason::TimedOut)))
                        }
                        None => requeue.push((issued.seq, request)),
                    },
                }
            }
            if !requeue.is_empty() {
                debug!("port {}: requeueing {} requests", self.index, requeue.len());
            }
            requeue.sort_unstable_by_key(|(seq, _)| *seq);
            for entry in requeue.into_iter().rev() {
                inner.queue.push_front(entry);
            }
            identify
        })
    }

    /// Restarts the command engine after a terminated command, escalates to
    /// recovery if the engine does not stop.
    fn restart<P: Platform>(&self, cx: &Context<'_, P>, identify: bool) {
        let registers = &cx.registers;
        let result = stop_engine(cx).and_then(|()| {
            registers.clear_serr(u32::MAX);
            registers.clear_is(HBAPortInterrupt::from_bits_retain(u32::MAX));
            start_engine(cx)
        });

        self.with(cx.platform, |inner| {
            inner.recovering = false;
            match result {
                Ok(()) if identify || inner.identity.is_none() => {
                    inner.state = PortState::DeviceDetected;
                    inner.issue_identify(cx);
                }
                Ok(()) => {
                    inner.state = PortState::Idle;
                    inner.update_state();
                }
                Err(error) => {
                    warn!("port {}: restart failed: {}", self.index, error);
                    inner.pending |= Pending::RECOVER;
                }
            }
        })
    }

    /// Resets the link and detects the device, expects `recovering` to be
    /// set and no command to be issued. Returns whether a device is attached.
    fn detect<P: Platform>(&self, cx: &Context<'_, P>, finished: &mut Finished) -> Result<bool, Error> {
        let registers = &cx.registers;
        registers.set_ie(HBAPortInterrupt::empty());

        let result = loop {
            if self.with(cx.platform, |inner| inner.attempts) >= cx.config.detect_attempts {
                break Err(Error::DeviceError);
            }
            match probe(self.index, cx) {
                Ok(device) => break Ok(device),
                Err(error) => {
                    let attempts = self.with(cx.platform, |inner| {
                        inner.attempts = inner.attempts.saturating_add(1);
                        inner.attempts
                    });
                    warn!(
                        "port {}: detection failed ({}), attempt {} of {}",
                        self.index, error, attempts, cx.config.detect_attempts
                    );
                }
            }
        };

        self.with(cx.platform, |inner| {
            inner.recovering = false;
            inner.identity = None;
            inner.ncq_depth = 0;
            match result {
                Ok(Some(atapi)) => {
                    inner.failed = false;
                    inner.atapi = atapi;
                    inner.state = PortState::DeviceDetected;
                    registers.set_ie(HBAPortInterrupt::ENABLED);
                    inner.issue_identify(cx);
                    Ok(true)
                }
                Ok(None) => {
                    debug!("port {}: no device", self.index);
                    inner.state = PortState::LinkDown;
                    registers.set_ie(HBAPortInterrupt::LINK);
                    abort_queue(&mut inner.queue, Reason::Removed, finished);
                    Ok(false)
                }
                Err(error) => {
                    warn!("port {}: giving up on device: {}", self.index, error);
                    inner.failed = true;
                    inner.state = PortState::Error;
                    registers.set_ie(HBAPortInterrupt::LINK);
                    abort_queue(&mut inner.queue, Reason::DeviceError, finished);
                    Err(error)
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn issued_mask(&self) -> u32 {
        self.inner.lock().slots.issued_mask()
    }
}

impl Inner {
    /// Whether new requests are taken, and the geometry to check them
    /// against.
    fn accepting(&self, caps: &Capabilities) -> Result<Geometry, Error> {
        if self.failed {
            return Err(Error::DeviceNotThere);
        }
        match self.state {
            PortState::Uninitialized | PortState::LinkDown | PortState::ShuttingDown => {
                Err(Error::DeviceNotThere)
            }
            PortState::DeviceDetected | PortState::Error => Err(Error::Busy),
            PortState::Idle | PortState::CommandsPending => self.geometry(caps).ok_or(Error::Busy),
        }
    }

    fn geometry(&self, caps: &Capabilities) -> Option<Geometry> {
        self.identity.as_ref().map(|identity| Geometry {
            atapi: identity.atapi,
            lba48: identity.lba48,
            sectors: identity.sectors,
            block_size: identity.block_size,
            dma64: caps.dma64,
        })
    }

    fn update_state(&mut self) {
        if matches!(self.state, PortState::Idle | PortState::CommandsPending) {
            self.state = if self.slots.is_idle() && self.queue.is_empty() {
                PortState::Idle
            } else {
                PortState::CommandsPending
            };
        }
    }

    /// Frees completed slots, then issues queued requests.
    fn collect<P: Platform>(&mut self, index: u8, cx: &Context<'_, P>, finished: &mut Finished) {
        let completed = self
            .slots
            .completed_slots()
            .fold(0u32, |mask, slot| mask | 1 << slot);
        for slot in slots(completed) {
            match self.slots.free(slot) {
                Some((Command::Request(request), status)) => {
                    trace!("port {}: slot {} {:?}", index, slot, status);
                    finished.push((request, status));
                }
                Some((Command::Identify, Status::Completed { .. })) => self.identified(index, cx),
                Some((Command::Identify, status)) => {
                    debug!("port {}: identification {:?}", index, status)
                }
                None => {}
            }
        }

        if !self.recovering {
            self.pump(index, cx);
            self.update_state();
        }
    }

    fn identified<P: Platform>(&mut self, index: u8, cx: &Context<'_, P>) {
        let Some(memory) = &self.memory else {
            return;
        };
        let identity = Identity::parse(&memory.identify(), self.atapi);
        self.ncq_depth = match identity.queue_depth {
            Some(depth) if cx.caps.ncq && cx.config.ncq => depth.min(cx.caps.slot_count),
            _ => 0,
        };
        info!(
            "port {}: {} \"{}\" {} blocks of {} bytes, ncq depth {}",
            index,
            if identity.atapi { "ATAPI" } else { "ATA" },
            identity.model,
            identity.sectors,
            identity.block_size,
            self.ncq_depth
        );
        self.identity = Some(identity);
        self.attempts = 0;
        if self.state == PortState::DeviceDetected {
            self.state = PortState::Idle;
        }
    }

    /// Issues queued requests in order until one has to wait.
    fn pump<P: Platform>(&mut self, index: u8, cx: &Context<'_, P>) {
        if !matches!(self.state, PortState::Idle | PortState::CommandsPending) {
            return;
        }
        while let Some((seq, request)) = self.queue.pop_front() {
            if let Err(entry) = self.try_issue(index, cx, seq, request) {
                self.queue.push_front(entry);
                break;
            }
        }
    }

    /// Issues the request if a slot is free and it may run next to the
    /// commands in flight, hands it back otherwise.
    fn try_issue<P: Platform>(
        &mut self,
        index: u8,
        cx: &Context<'_, P>,
        seq: u64,
        request: Request,
    ) -> Result<(), (u64, Request)> {
        let Some(geometry) = self.geometry(cx.caps) else {
            return Err((seq, request));
        };
        let ncq = self.ncq_depth != 0
            && matches!(
                request.operation(),
                Operation::Read { .. } | Operation::Write { .. }
            );

        // queued and non-queued commands never mix
        let issued = self.slots.issued_mask();
        let queued = self.slots.queued_mask();
        let allowed = if ncq {
            issued & !queued == 0 && queued.count_ones() < self.ncq_depth as u32
        } else {
            queued == 0
        };
        if !allowed {
            return Err((seq, request));
        }

        let deadline = cx.platform.now().saturating_add(cx.config.command_timeout);
        let slot = match self.slots.allocate(Issued {
            command: Command::Request(request),
            deadline,
            ncq,
            seq,
            cancel: None,
        }) {
            Ok(slot) => slot,
            Err(issued) => {
                return match issued.command.into_request() {
                    Some(request) => Err((seq, request)),
                    None => Ok(()),
                }
            }
        };

        if let (Some(memory), Some(issued)) = (&self.memory, self.slots.issued(slot)) {
            if let Command::Request(request) = &issued.command {
                write_command(memory, &geometry, slot, request, ncq);
                trace!(
                    "port {}: slot {} {:?} {:?}",
                    index,
                    slot,
                    request.id(),
                    request.operation()
                );
            }
        }
        if ncq {
            cx.registers.set_sact(1 << slot);
        }
        cx.registers.set_ci(1 << slot);
        Ok(())
    }

    fn issue_identify<P: Platform>(&mut self, cx: &Context<'_, P>) {
        let Some(memory) = &self.memory else {
            return;
        };
        let deadline = cx.platform.now().saturating_add(cx.config.command_timeout);
        let Ok(slot) = self.slots.allocate(Issued {
            command: Command::Identify,
            deadline,
            ncq: false,
            seq: 0,
            cancel: None,
        }) else {
            return;
        };

        let prd = PhysicalRegionDescriptor::new(memory.identify_address(), IDENTIFY_SIZE as u32, true);
        let prdtl = memory.write_table(
            slot,
            CommandTable::new(fis::identify_fis(self.atapi), [0; 16]),
            iter::once(prd),
        );
        memory.write_header(
            slot,
            CommandHeader::new(false, false, prdtl, memory.table_address(slot)),
        );
        cx.registers.set_ci(1 << slot);
    }

    fn take_work<P: Platform>(&mut self, index: u8, cx: &Context<'_, P>) -> Option<Work> {
        if self.recovering
            || matches!(
                self.state,
                PortState::Uninitialized | PortState::ShuttingDown
            )
        {
            return None;
        }

        if self.pending.contains(Pending::RESCAN) {
            self.pending.remove(Pending::RESCAN);
            let present = cx.registers.ssts().present();
            match self.state {
                PortState::LinkDown if present => {
                    info!("port {}: device attached", index);
                    self.attempts = 0;
                    self.pending |= Pending::RECOVER;
                }
                PortState::Error if present && self.failed => {
                    info!("port {}: device reattached", index);
                    self.attempts = 0;
                    self.pending |= Pending::RECOVER;
                }
                PortState::LinkDown => {}
                _ if !present && !self.failed => {
                    info!("port {}: device removed", index);
                    self.slots.claim_all(Reason::Removed);
                    self.pending |= Pending::RECOVER;
                }
                _ => {}
            }
        }

        let work = if self.pending.contains(Pending::RECOVER) {
            Work::Recover
        } else if self.pending.contains(Pending::RESTART) {
            Work::Restart
        } else {
            return None;
        };
        self.pending.remove(Pending::RECOVER | Pending::RESTART);
        self.recovering = true;
        self.state = PortState::Error;
        Some(work)
    }
}

fn write_command(memory: &PortMemory, geometry: &Geometry, slot: usize, request: &Request, ncq: bool) {
    let fis = fis::command_fis(request.operation(), geometry, ncq.then_some(slot as u8));
    let (atapi, acmd) = match request.operation() {
        Operation::Packet { cdb, .. } => (true, *cdb),
        _ => (false, [0; 16]),
    };
    let prdtl = memory.write_table(
        slot,
        CommandTable::new(fis, acmd),
        fis::prds(request.segments()),
    );
    memory.write_header(
        slot,
        CommandHeader::new(atapi, request.is_write(), prdtl, memory.table_address(slot)),
    );
}

fn abort_queue(queue: &mut VecDeque<(u64, Request)>, reason: Reason, finished: &mut Finished) {
    finished.extend(
        queue
            .drain(..)
            .map(|(_, request)| (request, Status::Aborted(reason))),
    );
}

fn deliver(finished: Finished) {
    for (request, status) in finished {
        request.finish(status);
    }
}

/// Indices of the set bits.
fn slots(mask: u32) -> impl Iterator<Item = usize> {
    (0..32).filter(move |slot| mask & 1 << slot != 0)
}

fn stop_engine<P: Platform>(cx: &Context<'_, P>) -> Result<(), Error> {
    let registers = &cx.registers;
    registers.update_cmd(|cmd| cmd - HBAPortCommand::ST);
    wait_until(cx.platform, cx.config.engine_timeout, || {
        !registers.cmd().contains(HBAPortCommand::CR)
    })
}

fn stop_fis<P: Platform>(cx: &Context<'_, P>) -> Result<(), Error> {
    let registers = &cx.registers;
    registers.update_cmd(|cmd| cmd - HBAPortCommand::FRE);
    wait_until(cx.platform, cx.config.engine_timeout, || {
        !registers.cmd().contains(HBAPortCommand::FR)
    })
}

fn start_engine<P: Platform>(cx: &Context<'_, P>) -> Result<(), Error> {
    let registers = &cx.registers;
    wait_until(cx.platform, cx.config.engine_timeout, || {
        !registers.cmd().contains(HBAPortCommand::CR)
    })?;
    registers.update_cmd(|cmd| cmd | HBAPortCommand::FRE);
    registers.update_cmd(|cmd| cmd | HBAPortCommand::ST);
    Ok(())
}

/// Resets the link and waits for the device to become ready. Returns
/// whether the device is a packet device, `None` if nothing is attached.
fn probe<P: Platform>(index: u8, cx: &Context<'_, P>) -> Result<Option<bool>, Error> {
    let registers = &cx.registers;
    stop_engine(cx)?;

    // COMRESET
    let control = registers.sctl() & !(sctl::DET | sctl::IPM) | sctl::IPM_DISABLED;
    registers.set_sctl(control | sctl::DET_INIT);
    cx.platform.delay(COMRESET_DELAY);
    registers.set_sctl(control);

    let linked = wait_until(cx.platform, cx.config.link_timeout, || {
        registers.ssts().present()
    });
    registers.clear_serr(u32::MAX);
    if linked.is_err() {
        return Ok(None);
    }

    let busy = TaskFileStatus::BSY | TaskFileStatus::DRQ;
    let ready = wait_until(cx.platform, cx.config.ready_timeout, || {
        !registers.tfd().status.intersects(busy)
    });
    if ready.is_err() {
        if !cx.caps.command_list_override {
            return Err(Error::TimedOut);
        }
        debug!("port {}: device busy, overriding command list", index);
        registers.update_cmd(|cmd| cmd | HBAPortCommand::CLO);
        wait_until(cx.platform, cx.config.engine_timeout, || {
            !registers.cmd().contains(HBAPortCommand::CLO)
        })?;
    }

    let atapi = match registers.sig() {
        signature::ATAPI => true,
        signature::ATA => false,
        other => {
            debug!("port {}: signature {:#010x}, assuming ATA", index, other);
            false
        }
    };
    registers.update_cmd(|cmd| {
        if atapi {
            cmd | HBAPortCommand::ATAPI
        } else {
            cmd - HBAPortCommand::ATAPI
        }
    });
    registers.clear_is(HBAPortInterrupt::from_bits_retain(u32::MAX));
    start_engine(cx)?;
    Ok(Some(atapi))
}
