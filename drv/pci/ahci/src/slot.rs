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

use alloc::vec::Vec;

use crate::request::{Reason, Request, RequestId, Status};

/// What a slot executes.
#[derive(Debug)]
pub enum Command {
    Request(Request),
    /// IDENTIFY (PACKET) DEVICE into the port's identify buffer
    Identify,
}

impl Command {
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Command::Request(request) => request.id(),
            Command::Identify => None,
        }
    }

    pub fn into_request(self) -> Option<Request> {
        match self {
            Command::Request(request) => Some(request),
            Command::Identify => None,
        }
    }
}

/// A command owned by the hardware.
#[derive(Debug)]
pub struct Issued {
    pub command: Command,
    /// Time after which the command is considered lost
    pub deadline: u64,
    /// Issued as native queued command, tracked in PxSACT
    pub ncq: bool,
    /// Submission order, used to requeue in order
    pub seq: u64,
    /// Status to deliver instead of the hardware result
    pub cancel: Option<Reason>,
}

#[derive(Debug)]
pub enum Slot {
    Free,
    Issued(Issued),
    /// Released by the hardware, waiting for delivery
    Completed { command: Command, status: Status },
}

/// Fixed array of command slots, the slot index is also the NCQ tag.
///
/// A slot holds a command if and only if it is not free. The table is not
/// synchronized, the owning port serializes all access.
pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new(count: u8) -> Self {
        debug_assert!((1..=32).contains(&count));
        let mut slots = Vec::with_capacity(count as usize);
        slots.resize_with(count as usize, || Slot::Free);
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// Takes the lowest free slot, hands the command back if there is none.
    pub fn allocate(&mut self, issued: Issued) -> Result<usize, Issued> {
        match self.slots.iter().position(|slot| matches!(slot, Slot::Free)) {
            Some(index) => {
                self.slots[index] = Slot::Issued(issued);
                Ok(index)
            }
            None => Err(issued),
        }
    }

    pub fn issued(&self, index: usize) -> Option<&Issued> {
        match self.slots.get(index) {
            Some(Slot::Issued(issued)) => Some(issued),
            _ => None,
        }
    }

    /// Records that the hardware released an issued slot. An abort claim
    /// takes precedence over `status`.
    pub fn complete(&mut self, index: usize, status: Status) -> bool {
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        match core::mem::replace(slot, Slot::Free) {
            Slot::Issued(issued) => {
                let status = issued.cancel.map(Status::Aborted).unwrap_or(status);
                *slot = Slot::Completed {
                    command: issued.command,
                    status,
                };
                true
            }
            other => {
                *slot = other;
                false
            }
        }
    }

    /// Frees a completed slot and returns what to deliver.
    pub fn free(&mut self, index: usize) -> Option<(Command, Status)> {
        let slot = self.slots.get_mut(index)?;
        match core::mem::replace(slot, Slot::Free) {
            Slot::Completed { command, status } => Some((command, status)),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Takes an issued slot back without completing it, the hardware must
    /// have stopped processing it.
    pub fn release(&mut self, index: usize) -> Option<Issued> {
        let slot = self.slots.get_mut(index)?;
        match core::mem::replace(slot, Slot::Free) {
            Slot::Issued(issued) => Some(issued),
            other => {
                *slot = other;
                None
            }
        }
    }

    pub fn is_busy(&self, index: usize) -> bool {
        !matches!(self.slots.get(index), None | Some(Slot::Free))
    }

    pub fn is_idle(&self) -> bool {
        self.slots.iter().all(|slot| matches!(slot, Slot::Free))
    }

    /// Slot holding the request with the given id, issued or completed.
    pub fn request_for(&self, id: RequestId) -> Option<usize> {
        self.slots.iter().position(|slot| match slot {
            Slot::Issued(issued) => issued.command.id() == Some(id),
            Slot::Completed { command, .. } => command.id() == Some(id),
            Slot::Free => false,
        })
    }

    /// Bitmap of slots owned by the hardware.
    pub fn issued_mask(&self) -> u32 {
        self.mask(|_| true)
    }

    /// Bitmap of slots issued as native queued commands.
    pub fn queued_mask(&self) -> u32 {
        self.mask(|issued| issued.ncq)
    }

    fn mask(&self, f: impl Fn(&Issued) -> bool) -> u32 {
        self.slots
            .iter()
            .enumerate()
            .fold(0, |mask, (index, slot)| match slot {
                Slot::Issued(issued) if f(issued) => mask | 1 << index,
                _ => mask,
            })
    }

    /// Marks an issued request as aborted. Returns false if the request is
    /// not issued or was already claimed.
    pub fn claim(&mut self, id: RequestId, reason: Reason) -> bool {
        for slot in &mut self.slots {
            if let Slot::Issued(issued) = slot {
                if issued.command.id() == Some(id) {
                    if issued.cancel.is_some() {
                        return false;
                    }
                    issued.cancel = Some(reason);
                    return true;
                }
            }
        }
        false
    }

    /// Claims every issued slot not yet claimed.
    pub fn claim_all(&mut self, reason: Reason) {
        for slot in &mut self.slots {
            if let Slot::Issued(issued) = slot {
                issued.cancel.get_or_insert(reason);
            }
        }
    }

    pub fn issued_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Issued(_)))
            .map(|(index, _)| index)
    }

    pub fn completed_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Completed { .. }))
            .map(|(index, _)| index)
    }

    /// Issued slots whose deadline passed.
    pub fn expired(&self, now: u64) -> u32 {
        self.slots
            .iter()
            .enumerate()
            .fold(0, |mask, (index, slot)| match slot {
                Slot::Issued(issued) if issued.deadline <= now => mask | 1 << index,
                _ => mask,
            })
    }
}
