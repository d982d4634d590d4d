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

//! ATA/ATAPI command set (ACS-3).

use alloc::string::String;

pub const READ_DMA: u8 = 0xC8;
pub const READ_DMA_EXT: u8 = 0x25;
pub const WRITE_DMA: u8 = 0xCA;
pub const WRITE_DMA_EXT: u8 = 0x35;
pub const READ_FPDMA_QUEUED: u8 = 0x60;
pub const WRITE_FPDMA_QUEUED: u8 = 0x61;
pub const FLUSH_CACHE: u8 = 0xE7;
pub const FLUSH_CACHE_EXT: u8 = 0xEA;
pub const IDENTIFY_DEVICE: u8 = 0xEC;
pub const IDENTIFY_PACKET_DEVICE: u8 = 0xA1;
pub const PACKET: u8 = 0xA0;

/// PACKET features: data is transferred by DMA
pub const PACKET_DMA: u8 = 1 << 0;
/// Device register: LBA addressing
pub const DEVICE_LBA: u8 = 1 << 6;

/// Size of the IDENTIFY (PACKET) DEVICE data.
pub const IDENTIFY_SIZE: usize = 512;

/// Parsed IDENTIFY (PACKET) DEVICE data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    /// Addressable logical blocks, 0 for packet devices
    pub sectors: u64,
    /// Logical block size in bytes
    pub block_size: u32,
    pub lba48: bool,
    /// Queue depth if native command queuing is supported
    pub queue_depth: Option<u8>,
    pub removable: bool,
    pub atapi: bool,
}

impl Identity {
    pub fn parse(data: &[u16; 256], atapi: bool) -> Self {
        let lba48 = !atapi && data[83] & 1 << 10 != 0;
        let sectors = if atapi {
            0
        } else if lba48 {
            (0..4).fold(0u64, |sectors, word| {
                sectors | (data[100 + word] as u64) << (word * 16)
            })
        } else {
            data[60] as u64 | (data[61] as u64) << 16
        };

        // words 117-118 are only valid if word 106 is, and says so
        let block_size = if !atapi && data[106] & 0xC000 == 0x4000 && data[106] & 1 << 12 != 0 {
            (data[117] as u32 | (data[118] as u32) << 16) * 2
        } else if atapi {
            2048
        } else {
            512
        };

        let queue_depth = if !atapi && data[76] != 0xFFFF && data[76] & 1 << 8 != 0 {
            Some((data[75] & 0x1F) as u8 + 1)
        } else {
            None
        };

        Self {
            model: string(&data[27..47]),
            serial: string(&data[10..20]),
            firmware: string(&data[23..27]),
            sectors,
            block_size,
            lba48,
            queue_depth,
            removable: data[0] & 1 << 7 != 0,
            atapi,
        }
    }
}

/// ATA strings store two characters per word, first character in the high byte.
fn string(words: &[u16]) -> String {
    let mut string = String::with_capacity(words.len() * 2);
    for &word in words {
        for byte in word.to_be_bytes() {
            string.push(match byte {
                b' '..=b'~' => byte as char,
                0 => ' ',
                _ => '?',
            });
        }
    }
    String::from(string.trim())
}
