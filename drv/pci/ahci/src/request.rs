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

use core::fmt;

use alloc::{boxed::Box, vec::Vec};

use crate::Error;

/// Invoked exactly once with the finished request, outside interrupt context.
pub type Callback = Box<dyn FnOnce(Request) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read { lba: u64, blocks: u32 },
    Write { lba: u64, blocks: u32 },
    Flush,
    /// ATAPI packet command
    Packet { cdb: [u8; 16], direction: Direction },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    None,
    In,
    Out,
}

/// A physically contiguous piece of the data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Physical address
    pub address: u64,
    /// Length in bytes
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Completed { transferred: u32 },
    Aborted(Reason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Aborted by the caller
    Cancelled,
    /// Terminated by the caller
    Terminated,
    /// The device reported an error on this or a concurrent command
    DeviceError,
    /// The command did not complete in time and exhausted its retries
    TimedOut,
    /// The device was reset on request of the caller
    Reset,
    /// The device was detached
    Removed,
    /// The controller is shutting down
    Shutdown,
}

/// One block I/O operation.
///
/// The request is moved into the driver on submission and handed back
/// through its callback once it reached a terminal state.
pub struct Request {
    operation: Operation,
    segments: Vec<Segment>,
    callback: Option<Callback>,
    status: Option<Status>,
    id: Option<RequestId>,
    attempts: u8,
}

impl Request {
    pub fn new(
        operation: Operation,
        segments: Vec<Segment>,
        callback: impl FnOnce(Request) + Send + 'static,
    ) -> Self {
        Self {
            operation,
            segments,
            callback: Some(Box::new(callback)),
            status: None,
            id: None,
            attempts: 0,
        }
    }

    pub fn read(
        lba: u64,
        blocks: u32,
        segments: Vec<Segment>,
        callback: impl FnOnce(Request) + Send + 'static,
    ) -> Self {
        Self::new(Operation::Read { lba, blocks }, segments, callback)
    }

    pub fn write(
        lba: u64,
        blocks: u32,
        segments: Vec<Segment>,
        callback: impl FnOnce(Request) + Send + 'static,
    ) -> Self {
        Self::new(Operation::Write { lba, blocks }, segments, callback)
    }

    pub fn flush(callback: impl FnOnce(Request) + Send + 'static) -> Self {
        Self::new(Operation::Flush, Vec::new(), callback)
    }

    pub fn packet(
        cdb: [u8; 16],
        direction: Direction,
        segments: Vec<Segment>,
        callback: impl FnOnce(Request) + Send + 'static,
    ) -> Self {
        Self::new(Operation::Packet { cdb, direction }, segments, callback)
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Final status, `None` while the request has not finished.
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// Identifier assigned by the port on submission.
    pub fn id(&self) -> Option<RequestId> {
        self.id
    }

    /// Total number of data bytes described by the segments.
    pub fn byte_count(&self) -> u64 {
        self.segments.iter().map(|segment| segment.length as u64).sum()
    }

    /// Whether data flows from host to device.
    pub fn is_write(&self) -> bool {
        matches!(
            self.operation,
            Operation::Write { .. }
                | Operation::Packet {
                    direction: Direction::Out,
                    ..
                }
        )
    }

    /// Prepares a finished request for another submission.
    pub fn reinit(&mut self, callback: impl FnOnce(Request) + Send + 'static) {
        self.callback = Some(Box::new(callback));
        self.status = None;
        self.id = None;
        self.attempts = 0;
    }

    /// Whether the request can be submitted.
    pub(crate) fn is_pending(&self) -> bool {
        self.status.is_none() && self.callback.is_some()
    }

    pub(crate) fn assign(&mut self, id: RequestId) {
        self.id = Some(id);
    }

    /// Counts an attempt, returns the attempts made so far.
    pub(crate) fn attempt(&mut self) -> u8 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Records the final status and hands the request back to its owner.
    pub(crate) fn finish(mut self, status: Status) {
        self.status = Some(status);
        if let Some(callback) = self.callback.take() {
            callback(self);
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("segments", &self.segments.len())
            .field("status", &self.status)
            .finish()
    }
}

/// A request the driver did not take, handed back untouched so it can be
/// submitted again.
#[derive(Debug)]
pub struct Rejected {
    pub error: Error,
    pub request: Request,
}

impl Rejected {
    pub(crate) fn new(error: Error, mut request: Request) -> Self {
        request.id = None;
        Self { error, request }
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request rejected: {}", self.error)
    }
}

impl From<Rejected> for Error {
    fn from(value: Rejected) -> Self {
        value.error
    }
}
