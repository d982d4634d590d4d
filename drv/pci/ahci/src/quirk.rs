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

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Quirks: u32 {
        /// Switch the combined IDE/AHCI function into AHCI mode before init
        const JMICRON_AHCI_MODE = 1 << 0;
        /// Enable the implemented ports in the PCS register after reset
        const INTEL_PORT_ENABLE = 1 << 1;
        /// Native command queuing is broken
        const NO_NCQ = 1 << 2;
        /// 64-bit DMA is advertised but broken
        const FORCE_32BIT = 1 << 3;
        /// MSI is broken, use the legacy interrupt line
        const NO_MSI = 1 << 4;
    }
}

/// JMicron controller control register
pub const JMICRON_CONTROL: u16 = 0x40;
/// Enables AHCI on function 0 and IDE on function 1
pub const JMICRON_CONTROL_AHCI: u32 = 0x00A1_A100;
/// Intel port control and status register, 16-bit
pub const INTEL_PCS: u16 = 0x92;

struct Quirk {
    vendor_id: u16,
    /// `None` matches every device of the vendor
    device_id: Option<u16>,
    quirks: Quirks,
}

const fn vendor(vendor_id: u16, quirks: Quirks) -> Quirk {
    Quirk {
        vendor_id,
        device_id: None,
        quirks,
    }
}

const fn device(vendor_id: u16, device_id: u16, quirks: Quirks) -> Quirk {
    Quirk {
        vendor_id,
        device_id: Some(device_id),
        quirks,
    }
}

static QUIRKS: &[Quirk] = &[
    // Intel
    vendor(0x8086, Quirks::INTEL_PORT_ENABLE),
    device(0x8086, 0x2652, Quirks::INTEL_PORT_ENABLE.union(Quirks::FORCE_32BIT)),
    device(0x8086, 0x2653, Quirks::INTEL_PORT_ENABLE.union(Quirks::FORCE_32BIT)),
    // JMicron
    vendor(0x197B, Quirks::JMICRON_AHCI_MODE),
    // ATI/AMD
    device(0x1002, 0x4380, Quirks::FORCE_32BIT.union(Quirks::NO_MSI)),
    device(0x1002, 0x4390, Quirks::FORCE_32BIT),
    // VIA
    device(0x1106, 0x3349, Quirks::NO_NCQ.union(Quirks::FORCE_32BIT)),
    device(0x1106, 0x6287, Quirks::NO_NCQ.union(Quirks::FORCE_32BIT)),
    // Marvell
    vendor(0x11AB, Quirks::NO_NCQ.union(Quirks::NO_MSI)),
];

/// Looks up the quirks of a controller, an exact device match wins over a
/// vendor wide entry.
pub fn lookup(vendor_id: u16, device_id: u16) -> Quirks {
    let mut matched = None;
    for quirk in QUIRKS.iter().filter(|quirk| quirk.vendor_id == vendor_id) {
        match quirk.device_id {
            Some(id) if id == device_id => return quirk.quirks,
            None => matched = Some(quirk.quirks),
            Some(_) => {}
        }
    }
    matched.unwrap_or(Quirks::empty())
}
