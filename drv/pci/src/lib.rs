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

#![cfg_attr(not(test), no_std)]

use core::{fmt, ops::Range};

use bitflags::bitflags;
use log::trace;

/// Offsets into the type 0 configuration space header.
pub mod offset {
    pub const VENDOR_ID: u16 = 0x00;
    pub const DEVICE_ID: u16 = 0x02;
    pub const COMMAND: u16 = 0x04;
    pub const STATUS: u16 = 0x06;
    pub const CLASS_CODE: u16 = 0x09;
    pub const BASE_ADDRESS_REGISTER: u16 = 0x10;
    pub const CAPABILITIES_POINTER: u16 = 0x34;
    pub const INTERRUPT_LINE: u16 = 0x3C;
}

/// Capability IDs
pub mod capability {
    pub const POWER_MANAGEMENT: u8 = 0x01;
    pub const MSI: u8 = 0x05;
    pub const PCI_EXPRESS: u8 = 0x10;
    pub const MSI_X: u8 = 0x11;
    pub const SATA: u8 = 0x12;
}

/// Static description of a PCI function, as enumerated by the bus manager.
pub struct Device {
    pub vendor_id: u16,
    pub device_id: u16,
    /// Base class, subclass, programming interface, revision
    pub class: [u8; 4],
    pub location: Location,
    /// Legacy interrupt line, 0 or 0xFF if none is routed
    pub interrupt_line: u8,
    pub resource: [Resource; 6],
}

impl Device {
    /// Returns the interrupt line, if one has been routed to the function.
    pub fn interrupt_line(&self) -> Option<u8> {
        match self.interrupt_line {
            0 | 0xFF => None,
            line => Some(line),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    None,
    Pio(Range<u16>),
    Mem16(Range<u16>),
    Mem32(Range<u32>),
    Mem64(Range<u64>),
}

impl Resource {
    /// Returns the physical range of a memory resource.
    pub fn memory(&self) -> Option<Range<u64>> {
        match self {
            Resource::Mem16(range) => Some(range.start as u64..range.end as u64),
            Resource::Mem32(range) => Some(range.start as u64..range.end as u64),
            Resource::Mem64(range) => Some(range.clone()),
            Resource::None | Resource::Pio(_) => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Command: u16 {
        /// I/O Space Enable
        const IOSE = 1 << 0;
        /// Memory Space Enable
        const MSE = 1 << 1;
        /// Bus Master Enable
        const BME = 1 << 2;
        /// Special Cycle Enable
        const SCE = 1 << 3;
        /// Memory Write and Invalidate
        const MWI = 1 << 4;
        /// VGA Palette Snoop
        const VGAPS = 1 << 5;
        /// Parity Error Response
        const PER = 1 << 6;
        /// IDSEL Stepping/Wait Cycle Control
        const IDSEL = 1 << 7;
        /// SERR# Enable
        const SERRE = 1 << 8;
        /// Fast Back-to-Back Transactions Enable
        const FB2BTE = 1 << 9;
        /// Interrupt Disable
        const ID = 1 << 10;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u16 {
        /// Immediate Readiness
        const IR = 1 << 0;
        /// Interrupt Status
        const IS = 1 << 3;
        /// Capabilities List
        const CL = 1 << 4;
        /// 66 MHz Capable
        const _66C = 1 << 5;
        /// Fast Back-to-Back Transactions Capable
        const FB2BTC = 1 << 7;
        /// Master Data Parity Error
        const MDPE = 1 << 8;
        /// DEVSEL Timing
        const DEVSEL = ((1 << 2) - 1) << 9;
        /// Signaled Target Abort
        const STA = 1 << 11;
        /// Received Target Abort
        const RTA = 1 << 12;
        /// Received Master Abort
        const RMA = 1 << 13;
        /// Received/Signaled System Error
        const SE = 1 << 14;
        /// Detected Parity Error
        const DPE = 1 << 15;
    }
}

/// A PCI function as exposed by the bus manager to its driver.
///
/// `size` is the access width in bytes and is one of 1, 2 or 4.
pub trait Function {
    fn info(&self) -> &Device;

    fn read_config(&self, offset: u16, size: u8) -> u32;

    fn write_config(&self, offset: u16, size: u8, value: u32);

    /// Walks the capability list and returns the offset of the capability
    /// with the given ID.
    fn find_capability(&self, id: u8) -> Option<u16> {
        let status = Status::from_bits_retain(self.read_config(offset::STATUS, 2) as u16);
        if !status.contains(Status::CL) {
            return None;
        }

        let mut pointer = (self.read_config(offset::CAPABILITIES_POINTER, 1) & 0xFC) as u16;
        // 48 is the most capabilities that fit after the header
        for _ in 0..48 {
            if pointer == 0 {
                break;
            }
            let capability = self.read_config(pointer, 1) as u8;
            trace!("capability {:#04x} at {:#04x}", capability, pointer);
            if capability == id {
                return Some(pointer);
            }
            pointer = (self.read_config(pointer + 1, 1) & 0xFC) as u16;
        }

        None
    }

    fn command(&self) -> Command {
        Command::from_bits_retain(self.read_config(offset::COMMAND, 2) as u16)
    }

    /// Sets the given bits in the command register.
    fn enable(&self, command: Command) {
        let value = self.command() | command;
        self.write_config(offset::COMMAND, 2, value.bits() as u32);
    }
}
