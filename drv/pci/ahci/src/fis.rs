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

//! System memory structures shared with the HBA and the translation of
//! requests into them.

use core::mem::size_of;

use crate::{
    ata,
    request::{Direction, Operation, Request, Segment},
    Error,
};

pub const FIS_TYPE_REG_H2D: u8 = 0x27;
pub const FIS_TYPE_REG_D2H: u8 = 0x34;

/// Most PRD entries a command table is allocated for.
pub const PRD_TABLE_ENTRIES: usize = 168;
/// Most bytes a single PRD entry can describe.
pub const PRD_MAX_BYTES: u32 = 4 << 20;
/// Size of a command table including its PRD table.
pub const COMMAND_TABLE_SIZE: usize =
    size_of::<CommandTable>() + PRD_TABLE_ENTRIES * size_of::<PhysicalRegionDescriptor>();

#[repr(C, align(1024))]
pub struct CommandList(pub [CommandHeader; 32]);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CommandHeader {
    /// 0-4 Command FIS Length
    ///   5 ATAPI
    ///   6 Write
    ///   7 Prefetchable
    pub cflawp: u8,
    ///   0 Reset
    ///   1 BIST
    ///   2 Clear Busy opon R_OK
    ///   3 Reserved
    /// 4-7 Port Multiplier Port
    pub rbcpmp: u8,
    /// Physical Region Descriptor Table Length
    pub prdtl: u16,
    /// Physical Region Descriptor Byte Count
    pub prdbc: u32,
    /// Command Table Base Address
    pub ctba: u32,
    /// Command Table Base Address Upper 32-bits
    pub ctbau: u32,
    /// Reserved
    _rsvd: [u32; 4],
}

impl CommandHeader {
    const ATAPI: u8 = 1 << 5;
    const WRITE: u8 = 1 << 6;
    const PREFETCHABLE: u8 = 1 << 7;

    pub fn new(atapi: bool, write: bool, prdtl: u16, table: u64) -> Self {
        let mut cflawp = (size_of::<H2DRegisterFIS>() / 4) as u8;
        if atapi {
            cflawp |= Self::ATAPI;
        } else if prdtl != 0 {
            cflawp |= Self::PREFETCHABLE;
        }
        if write {
            cflawp |= Self::WRITE;
        }
        Self {
            cflawp,
            rbcpmp: 0,
            prdtl,
            prdbc: 0,
            ctba: table as u32,
            ctbau: (table >> 32) as u32,
            _rsvd: [0; 4],
        }
    }

    pub fn is_write(&self) -> bool {
        self.cflawp & Self::WRITE != 0
    }

    pub fn is_atapi(&self) -> bool {
        self.cflawp & Self::ATAPI != 0
    }

    pub fn table(&self) -> u64 {
        self.ctba as u64 | (self.ctbau as u64) << 32
    }
}

#[derive(Clone, Copy, Default)]
#[repr(C, align(128))]
pub struct CommandTable {
    /// Command FIS
    pub cfis: H2DRegisterFIS,
    _cfis_remaining: [u32; 11],
    /// ATAPI Command
    pub acmd: [u8; 16],
    _reserved: [u32; 12],
    /// Physical Region Descriptor Table
    #[allow(dead_code)]
    prdt: [PhysicalRegionDescriptor; 0],
}

impl CommandTable {
    pub fn new(cfis: H2DRegisterFIS, acmd: [u8; 16]) -> Self {
        Self {
            cfis,
            acmd,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PhysicalRegionDescriptor {
    /// Data Base Address
    pub dba: u32,
    /// Data Base Address Upper 32-bits
    pub dbau: u32,
    /// Reserved
    _rsvd: u32,
    /// 00-21 Data Byte Count
    /// 22-30 Reserved
    ///    31 Interrupt on Completion
    pub dbci: u32,
}

impl PhysicalRegionDescriptor {
    const INTERRUPT: u32 = 1 << 31;

    pub fn new(address: u64, length: u32, interrupt: bool) -> Self {
        debug_assert!(length != 0 && length <= PRD_MAX_BYTES);
        Self {
            dba: address as u32,
            dbau: (address >> 32) as u32,
            _rsvd: 0,
            // zero-based
            dbci: (length - 1) | if interrupt { Self::INTERRUPT } else { 0 },
        }
    }

    pub fn address(&self) -> u64 {
        self.dba as u64 | (self.dbau as u64) << 32
    }

    pub fn length(&self) -> u32 {
        (self.dbci & (PRD_MAX_BYTES - 1)) + 1
    }

    pub fn interrupt(&self) -> bool {
        self.dbci & Self::INTERRUPT != 0
    }
}

#[derive(Clone, Copy)]
#[repr(C, align(256))]
pub struct ReceivedFIS {
    /// DMA Setup FIS
    pub dsfis: DMASetupFIS,
    _reserved_0: u32,
    /// PIO Setup FIS
    pub psfis: PIOSetupFIS,
    _reserved_1: [u32; 3],
    /// D2H Register FIS
    pub rfis: D2HRegisterFIS,
    _reserved_2: u32,
    /// Set Device Bits FIS
    pub sdbfis: SetDeviceBitsFIS,
    /// Unknown FIS
    pub ufis: [u32; 16],
    _reserved_3: [u32; 24],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct H2DRegisterFIS {
    pub fis_type: u8,
    /// 0-3 Port Multiplier Port
    ///   7 Command
    pub flags: u8,
    pub command: u8,
    pub features_0_7: u8,

    pub lba_0_7: u8,
    pub lba_8_15: u8,
    pub lba_16_23: u8,
    pub device: u8,

    pub lba_24_31: u8,
    pub lba_32_39: u8,
    pub lba_40_47: u8,
    pub features_8_15: u8,

    pub count_0_7: u8,
    pub count_8_15: u8,
    pub icc: u8,
    pub control: u8,

    pub auxiliary_0_7: u8,
    pub auxiliary_8_15: u8,
    _reserved: [u8; 2],
}

impl H2DRegisterFIS {
    const COMMAND: u8 = 1 << 7;

    fn command(command: u8) -> Self {
        Self {
            fis_type: FIS_TYPE_REG_H2D,
            flags: Self::COMMAND,
            command,
            ..Default::default()
        }
    }

    fn with_lba48(mut self, lba: u64) -> Self {
        self.lba_0_7 = lba as u8;
        self.lba_8_15 = (lba >> 8) as u8;
        self.lba_16_23 = (lba >> 16) as u8;
        self.lba_24_31 = (lba >> 24) as u8;
        self.lba_32_39 = (lba >> 32) as u8;
        self.lba_40_47 = (lba >> 40) as u8;
        self.device = ata::DEVICE_LBA;
        self
    }

    fn with_lba28(mut self, lba: u64) -> Self {
        self.lba_0_7 = lba as u8;
        self.lba_8_15 = (lba >> 8) as u8;
        self.lba_16_23 = (lba >> 16) as u8;
        self.device = ata::DEVICE_LBA | ((lba >> 24) & 0xF) as u8;
        self
    }

    /// Sector count, 0 encodes the largest count the command supports.
    fn with_count(mut self, count: u32) -> Self {
        self.count_0_7 = count as u8;
        self.count_8_15 = (count >> 8) as u8;
        self
    }

    fn with_features(mut self, features: u32) -> Self {
        self.features_0_7 = features as u8;
        self.features_8_15 = (features >> 8) as u8;
        self
    }

    /// Reassembles the 48-bit LBA.
    pub fn lba(&self) -> u64 {
        self.lba_0_7 as u64
            | (self.lba_8_15 as u64) << 8
            | (self.lba_16_23 as u64) << 16
            | (self.lba_24_31 as u64) << 24
            | (self.lba_32_39 as u64) << 32
            | (self.lba_40_47 as u64) << 40
    }

    pub fn count(&self) -> u16 {
        self.count_0_7 as u16 | (self.count_8_15 as u16) << 8
    }

    pub fn features(&self) -> u16 {
        self.features_0_7 as u16 | (self.features_8_15 as u16) << 8
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct DMASetupFIS {
    pub fis_type: u8,
    pub flags: u8,
    _reserved_0: [u8; 2],

    pub dma_buffer_identifier_low: u32,
    pub dma_buffer_identifier_high: u32,
    _reserved_1: u32,
    pub dma_buffer_offset: u32,
    pub dma_transfer_count: u32,
    _reserved_2: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct PIOSetupFIS {
    pub fis_type: u8,
    pub flags: u8,
    pub status: u8,
    pub error: u8,

    pub lba_0_7: u8,
    pub lba_8_15: u8,
    pub lba_16_23: u8,
    pub device: u8,

    pub lba_24_31: u8,
    pub lba_32_39: u8,
    pub lba_40_47: u8,
    _reserved_0: u8,

    pub count_0_7: u8,
    pub count_8_15: u8,
    _reserved_1: u8,
    pub e_status: u8,

    pub transfer_count: u16,
    _reserved_2: [u8; 2],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct D2HRegisterFIS {
    pub fis_type: u8,
    pub flags: u8,
    pub status: u8,
    pub error: u8,

    pub lba_0_7: u8,
    pub lba_8_15: u8,
    pub lba_16_23: u8,
    pub device: u8,

    pub lba_24_31: u8,
    pub lba_32_39: u8,
    pub lba_40_47: u8,
    _reserved_0: u8,

    pub count_0_7: u8,
    pub count_8_15: u8,
    _reserved_1: [u8; 6],
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct SetDeviceBitsFIS {
    pub fis_type: u8,
    pub flags: u8,
    pub status: u8,
    pub error: u8,

    _unknown: u32,
}

/// What the adapter needs to know about the attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub atapi: bool,
    pub lba48: bool,
    /// Addressable logical blocks
    pub sectors: u64,
    /// Logical block size in bytes
    pub block_size: u32,
    /// Whether the HBA can reach buffers above 4 GiB.
    pub dma64: bool,
}

impl Geometry {
    /// Largest block count of a single command.
    pub fn max_blocks(&self) -> u32 {
        if self.lba48 {
            1 << 16
        } else {
            1 << 8
        }
    }
}

/// Checks that a request can be expressed as one command for the device.
pub fn validate(request: &Request, geometry: &Geometry) -> Result<(), Error> {
    let segments = request.segments();
    for segment in segments {
        if segment.length == 0 || segment.length % 2 != 0 || segment.address % 2 != 0 {
            return Err(Error::InvalidRequest);
        }
        let end = segment
            .address
            .checked_add(segment.length as u64 - 1)
            .ok_or(Error::InvalidRequest)?;
        if !geometry.dma64 && end > u32::MAX as u64 {
            return Err(Error::InvalidRequest);
        }
    }
    if prd_count(segments) > PRD_TABLE_ENTRIES {
        return Err(Error::InvalidRequest);
    }

    match *request.operation() {
        Operation::Read { lba, blocks } | Operation::Write { lba, blocks } => {
            if geometry.atapi || blocks == 0 || blocks > geometry.max_blocks() {
                return Err(Error::InvalidRequest);
            }
            match lba.checked_add(blocks as u64) {
                Some(end) if end <= geometry.sectors => {}
                _ => return Err(Error::InvalidRequest),
            }
            if !geometry.lba48 && lba + blocks as u64 > 1 << 28 {
                return Err(Error::InvalidRequest);
            }
            if request.byte_count() != blocks as u64 * geometry.block_size as u64 {
                return Err(Error::InvalidRequest);
            }
        }
        Operation::Flush => {
            if geometry.atapi || !segments.is_empty() {
                return Err(Error::InvalidRequest);
            }
        }
        Operation::Packet { direction, .. } => {
            if !geometry.atapi || (direction == Direction::None) != segments.is_empty() {
                return Err(Error::InvalidRequest);
            }
        }
    }

    Ok(())
}

/// Builds the command FIS of a request, `tag` selects the queued variant.
pub fn command_fis(operation: &Operation, geometry: &Geometry, tag: Option<u8>) -> H2DRegisterFIS {
    match (*operation, tag) {
        (Operation::Read { lba, blocks }, Some(tag)) => {
            queued(ata::READ_FPDMA_QUEUED, lba, blocks, tag)
        }
        (Operation::Write { lba, blocks }, Some(tag)) => {
            queued(ata::WRITE_FPDMA_QUEUED, lba, blocks, tag)
        }
        (Operation::Read { lba, blocks }, None) if geometry.lba48 => {
            H2DRegisterFIS::command(ata::READ_DMA_EXT)
                .with_lba48(lba)
                .with_count(blocks)
        }
        (Operation::Write { lba, blocks }, None) if geometry.lba48 => {
            H2DRegisterFIS::command(ata::WRITE_DMA_EXT)
                .with_lba48(lba)
                .with_count(blocks)
        }
        (Operation::Read { lba, blocks }, None) => H2DRegisterFIS::command(ata::READ_DMA)
            .with_lba28(lba)
            .with_count(blocks),
        (Operation::Write { lba, blocks }, None) => H2DRegisterFIS::command(ata::WRITE_DMA)
            .with_lba28(lba)
            .with_count(blocks),
        (Operation::Flush, _) => {
            let mut fis = H2DRegisterFIS::command(if geometry.lba48 {
                ata::FLUSH_CACHE_EXT
            } else {
                ata::FLUSH_CACHE
            });
            fis.device = ata::DEVICE_LBA;
            fis
        }
        (Operation::Packet { direction, .. }, _) => {
            let mut fis = H2DRegisterFIS::command(ata::PACKET);
            if direction != Direction::None {
                fis.features_0_7 = ata::PACKET_DMA;
            }
            // byte count limit
            fis.lba_8_15 = 0xFE;
            fis.lba_16_23 = 0xFF;
            fis
        }
    }
}

fn queued(command: u8, lba: u64, blocks: u32, tag: u8) -> H2DRegisterFIS {
    H2DRegisterFIS::command(command)
        .with_lba48(lba)
        .with_features(blocks)
        .with_count((tag as u32) << 3)
}

/// IDENTIFY (PACKET) DEVICE, transfers 512 bytes.
pub fn identify_fis(atapi: bool) -> H2DRegisterFIS {
    H2DRegisterFIS::command(if atapi {
        ata::IDENTIFY_PACKET_DEVICE
    } else {
        ata::IDENTIFY_DEVICE
    })
}

/// Number of PRD entries needed to describe the segments.
pub fn prd_count(segments: &[Segment]) -> usize {
    segments
        .iter()
        .map(|segment| segment.length.div_ceil(PRD_MAX_BYTES) as usize)
        .sum()
}

/// Splits the segments into PRD entries, the last one interrupts on
/// completion.
pub fn prds(segments: &[Segment]) -> Prds<'_> {
    Prds {
        segments,
        index: 0,
        offset: 0,
    }
}

pub struct Prds<'a> {
    segments: &'a [Segment],
    index: usize,
    offset: u32,
}

impl Iterator for Prds<'_> {
    type Item = PhysicalRegionDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let segment = self.segments.get(self.index)?;
        let address = segment.address + self.offset as u64;
        let length = (segment.length - self.offset).min(PRD_MAX_BYTES);
        self.offset += length;
        if self.offset == segment.length {
            self.index += 1;
            self.offset = 0;
        }
        Some(PhysicalRegionDescriptor::new(
            address,
            length,
            self.index == self.segments.len(),
        ))
    }
}
