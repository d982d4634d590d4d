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

use core::{
    mem::{align_of, size_of},
    ptr::{self, NonNull},
};

use crate::{
    ata::IDENTIFY_SIZE,
    fis::{
        CommandHeader, CommandList, CommandTable, D2HRegisterFIS, PhysicalRegionDescriptor,
        ReceivedFIS, COMMAND_TABLE_SIZE, PRD_TABLE_ENTRIES,
    },
};

/// Physically contiguous memory shared with the device.
#[derive(Debug)]
pub struct DmaRegion {
    phys: u64,
    virt: NonNull<u8>,
    size: usize,
}

unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// # Safety
    ///
    /// `virt` must map `size` bytes of memory starting at physical address
    /// `phys`, exclusively owned by the region until it is freed.
    pub unsafe fn new(phys: u64, virt: NonNull<u8>, size: usize) -> Self {
        Self { phys, virt, size }
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn virt(&self) -> NonNull<u8> {
        self.virt
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

// Command list, received FIS and identify buffer share the first 2 KiB, the
// command tables follow.
const COMMAND_LIST: usize = 0;
const RECEIVED_FIS: usize = COMMAND_LIST + size_of::<CommandList>();
const IDENTIFY: usize = RECEIVED_FIS + size_of::<ReceivedFIS>();
const COMMAND_TABLES: usize = 2048;
const COMMAND_TABLE_STRIDE: usize =
    COMMAND_TABLE_SIZE.next_multiple_of(align_of::<CommandTable>());

/// Alignment the port memory has to be allocated with.
pub const PORT_MEMORY_ALIGN: usize = align_of::<CommandList>();

const _: () = assert!(IDENTIFY + IDENTIFY_SIZE <= COMMAND_TABLES);

/// DMA memory of one port.
pub struct PortMemory {
    region: DmaRegion,
    slots: u8,
}

impl PortMemory {
    pub const fn size(slots: u8) -> usize {
        COMMAND_TABLES + slots as usize * COMMAND_TABLE_STRIDE
    }

    /// Takes over a region, hands it back if it is too small or misaligned.
    pub fn new(region: DmaRegion, slots: u8) -> Result<Self, DmaRegion> {
        if region.size() < Self::size(slots)
            || region.virt().as_ptr() as usize % PORT_MEMORY_ALIGN != 0
            || region.phys() % PORT_MEMORY_ALIGN as u64 != 0
        {
            return Err(region);
        }
        let memory = Self { region, slots };
        unsafe { ptr::write_bytes(memory.region.virt().as_ptr(), 0, Self::size(slots)) };
        Ok(memory)
    }

    /// Last physical address covered by the memory.
    pub fn end(&self) -> u64 {
        self.region.phys() + Self::size(self.slots) as u64 - 1
    }

    pub fn command_list_address(&self) -> u64 {
        self.region.phys() + COMMAND_LIST as u64
    }

    pub fn received_fis_address(&self) -> u64 {
        self.region.phys() + RECEIVED_FIS as u64
    }

    pub fn identify_address(&self) -> u64 {
        self.region.phys() + IDENTIFY as u64
    }

    pub fn table_address(&self, slot: usize) -> u64 {
        self.region.phys() + (COMMAND_TABLES + slot * COMMAND_TABLE_STRIDE) as u64
    }

    fn at<T>(&self, offset: usize) -> *mut T {
        unsafe { self.region.virt().as_ptr().add(offset) }.cast()
    }

    pub fn header(&self, slot: usize) -> CommandHeader {
        assert!(slot < self.slots as usize);
        unsafe { ptr::read_volatile(self.at::<CommandHeader>(COMMAND_LIST).add(slot)) }
    }

    pub fn write_header(&self, slot: usize, header: CommandHeader) {
        assert!(slot < self.slots as usize);
        unsafe { ptr::write_volatile(self.at::<CommandHeader>(COMMAND_LIST).add(slot), header) }
    }

    /// Writes the command table of a slot followed by its PRD table, returns
    /// the number of PRD entries written.
    pub fn write_table(
        &self,
        slot: usize,
        table: CommandTable,
        prds: impl Iterator<Item = PhysicalRegionDescriptor>,
    ) -> u16 {
        assert!(slot < self.slots as usize);
        let offset = COMMAND_TABLES + slot * COMMAND_TABLE_STRIDE;
        unsafe { ptr::write_volatile(self.at::<CommandTable>(offset), table) };

        let prdt = self.at::<PhysicalRegionDescriptor>(offset + size_of::<CommandTable>());
        let mut count = 0;
        for prd in prds.take(PRD_TABLE_ENTRIES) {
            unsafe { ptr::write_volatile(prdt.add(count), prd) };
            count += 1;
        }
        count as u16
    }

    /// Last D2H register FIS received from the device.
    pub fn received_fis(&self) -> D2HRegisterFIS {
        let fis = self.at::<ReceivedFIS>(RECEIVED_FIS);
        unsafe { ptr::read_volatile(ptr::addr_of!((*fis).rfis)) }
    }

    pub fn identify(&self) -> [u16; 256] {
        let data = self.at::<u16>(IDENTIFY);
        core::array::from_fn(|word| unsafe { ptr::read_volatile(data.add(word)) })
    }

    pub fn into_region(self) -> DmaRegion {
        self.region
    }
}
