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

use core::{error, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The controller could not be brought up.
    Init(InitError),
    /// A bounded wait on the hardware expired.
    TimedOut,
    /// The device reported an error and could not be recovered.
    DeviceError,
    /// No command slot is free and the port queue is full, retry later.
    QueueFull,
    /// No device is attached to the addressed port, or it failed for good.
    DeviceNotThere,
    /// The port is recovering or identifying its device, retry later.
    Busy,
    InvalidRequest,
    /// The request already completed or was never submitted to this port.
    NoSuchRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    NoInterrupt,
    NoRegisters,
    NoPorts,
    Memory,
    Reset,
    Handler,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Init(error) => write!(f, "initialization failed: {}", error),
            Error::TimedOut => write!(f, "timed out"),
            Error::DeviceError => write!(f, "device error"),
            Error::QueueFull => write!(f, "queue full"),
            Error::DeviceNotThere => write!(f, "device not there"),
            Error::Busy => write!(f, "busy"),
            Error::InvalidRequest => write!(f, "invalid request"),
            Error::NoSuchRequest => write!(f, "no such request"),
        }
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::NoInterrupt => write!(f, "no interrupt assigned"),
            InitError::NoRegisters => write!(f, "no usable base address register"),
            InitError::NoPorts => write!(f, "no ports implemented"),
            InitError::Memory => write!(f, "out of DMA memory"),
            InitError::Reset => write!(f, "controller did not complete reset"),
            InitError::Handler => write!(f, "interrupt handler could not be installed"),
        }
    }
}

impl error::Error for Error {}

impl From<InitError> for Error {
    fn from(value: InitError) -> Self {
        Error::Init(value)
    }
}
