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

//! HBA register interface (AHCI 1.3.1, section 3).

use core::mem::{offset_of, size_of};

use bitflags::bitflags;

/// 32-bit register access to a mapped ABAR.
///
/// Offsets are relative to the start of the HBA memory space.
pub trait Registers: Send + Sync {
    fn read(&self, offset: usize) -> u32;

    fn write(&self, offset: usize, value: u32);
}

impl Registers for mmio::Mmio {
    fn read(&self, offset: usize) -> u32 {
        mmio::Mmio::read::<u32>(self, offset)
    }

    fn write(&self, offset: usize, value: u32) {
        mmio::Mmio::write::<u32>(self, offset, value)
    }
}

// Only used to derive offsets, all accesses go through `Registers`.
#[allow(dead_code)]
#[repr(C)]
struct HBA {
    /// Host Capabilities
    cap: HBACapabilities,
    /// Global Host Control
    ghc: HBAGlobalControl,
    /// Interrupt Status
    is: u32,
    /// Ports Implemented
    pi: u32,
    /// Version: Minor Version Number
    vs_mnr: u16,
    /// Version: Major Version Number
    vs_mjr: u16,
    /// Command Completion Coalescing Control: Enable, Interrupt
    ccc_ctl_enint: u8,
    /// Command Completion Coalescing Control: Command Completions
    ccc_ctl_cc: u8,
    /// Command Completion Coalescing Control: Timeout Value
    ccc_ctl_tv: u16,
    /// Command Completion Coalescing Ports
    ccc_ports: u32,
    /// Enclosure Management Location: Buffer Size
    em_loc_sz: u16,
    /// Enclosure Management Location: Offset
    em_loc_ofst: u16,
    /// Enclosure Management Control
    em_ctl: u32,
    /// Host Capabilities Extended
    cap2: HBACapabilitiesExtended,
    /// BIOS/OS Handoff Control and Status
    bohc: HBABIOSOSHandoffControl,
    /// Reserved
    _rsvd: [u8; 52],
    /// Reserved for NVMHCI
    _rsvd_nvmhci: [u8; 64],
    /// Vendor Specific
    _rsvd_vendor: [u8; 96],
    port: [HBAPort; 32],
}

#[allow(dead_code)]
#[repr(C)]
struct HBAPort {
    /// Command List Base Address
    clb: u32,
    /// Command List Base Address Upper 32-bits
    clbu: u32,
    /// FIS Base Address
    fb: u32,
    /// FIS Base Address Upper 32-bits
    fbu: u32,
    /// Interrupt Status
    is: HBAPortInterrupt,
    /// Interrupt Enable
    ie: HBAPortInterrupt,
    /// Command and Status
    cmd: HBAPortCommand,
    /// Reserved
    _rsvd_0: u32,
    /// Task File Data: Status
    tfd_sts: u8,
    /// Task File Data: Error
    tfd_err: u8,
    /// Task File Data: Reserved
    _tfd_rsvd: u16,
    /// Signature
    sig: u32,
    /// Serial ATA Status
    ssts: u32,
    /// Serial ATA Control
    sctl: u32,
    /// Serial ATA Error
    serr: u32,
    /// Serial ATA Active
    sact: u32,
    /// Command Issue
    ci: u32,
    /// Serial ATA Notification
    sntf: u32,
    /// FIS-based Switching Control
    fbs: u32,
    /// Device Sleep
    devslp: u32,
    /// Reserved
    _rsvd_1: [u8; 40],
    /// Vendor Specific
    _rsvd_vendor: [u8; 16],
}

pub const CAP: usize = offset_of!(HBA, cap);
pub const GHC: usize = offset_of!(HBA, ghc);
pub const IS: usize = offset_of!(HBA, is);
pub const PI: usize = offset_of!(HBA, pi);
pub const VS: usize = offset_of!(HBA, vs_mnr);
pub const CAP2: usize = offset_of!(HBA, cap2);
pub const BOHC: usize = offset_of!(HBA, bohc);
pub const PORT: usize = offset_of!(HBA, port);
pub const PORT_SIZE: usize = size_of::<HBAPort>();

pub const PX_CLB: usize = offset_of!(HBAPort, clb);
pub const PX_CLBU: usize = offset_of!(HBAPort, clbu);
pub const PX_FB: usize = offset_of!(HBAPort, fb);
pub const PX_FBU: usize = offset_of!(HBAPort, fbu);
pub const PX_IS: usize = offset_of!(HBAPort, is);
pub const PX_IE: usize = offset_of!(HBAPort, ie);
pub const PX_CMD: usize = offset_of!(HBAPort, cmd);
pub const PX_TFD: usize = offset_of!(HBAPort, tfd_sts);
pub const PX_SIG: usize = offset_of!(HBAPort, sig);
pub const PX_SSTS: usize = offset_of!(HBAPort, ssts);
pub const PX_SCTL: usize = offset_of!(HBAPort, sctl);
pub const PX_SERR: usize = offset_of!(HBAPort, serr);
pub const PX_SACT: usize = offset_of!(HBAPort, sact);
pub const PX_CI: usize = offset_of!(HBAPort, ci);

/// Size of the register space covering all 32 ports.
pub const ABAR_SIZE: usize = size_of::<HBA>();

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HBACapabilities: u32 {
        /// Number of Ports
        const NP = (1 << 5) - 1;
        /// Supports External SATA
        const SXS = 1 << 5;
        /// Enclosure Management Supported
        const EMS = 1 << 6;
        /// Command Completion Coalescing Supported
        const CCCS = 1 << 7;
        /// Number of Command Slots
        const NCS = ((1 << 5) - 1) << 8;
        /// Partial State Capable
        const PSC = 1 << 13;
        /// Slumber State Capable
        const SSC = 1 << 14;
        /// PIO Multiple DRQ Block
        const PMD = 1 << 15;
        /// FIS-based Switching Supported
        const FBSS = 1 << 16;
        /// Supports Port Multiplier
        const SPM = 1 << 17;
        /// Supports AHCI mode only
        const SAM = 1 << 18;
        /// Interface Speed Support
        const ISS = ((1 << 4) - 1) << 20;
        /// Supports Command List Override
        const SCLO = 1 << 24;
        /// Supports Activity LED
        const SAL = 1 << 25;
        /// Supports Aggressive Link Power Management
        const SALP = 1 << 26;
        /// Supports Staggered Spin-up
        const SSS = 1 << 27;
        /// Supports Mechanical Presence Switch
        const SMPS = 1 << 28;
        /// Supports SNotification Register
        const SSNTF = 1 << 29;
        /// Supports Native Command Queuing
        const SNCQ = 1 << 30;
        /// Supports 64-bit Addressing
        const S64A = 1 << 31;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HBACapabilitiesExtended: u32 {
        /// BIOS/OS Handoff
        const BOH = 1 << 0;
        /// NVMHCI Present
        const NVMP = 1 << 1;
        /// Automatic Partial to Slumber Transitions
        const APST = 1 << 2;
        /// Supports Device Sleep
        const SDS = 1 << 3;
        /// Supports Aggressive Device Sleep Management
        const SADM = 1 << 4;
        /// DevSleep Entrance from Slumber Only
        const DESO = 1 << 5;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HBAGlobalControl: u32 {
        /// HBA Reset
        const HR = 1 << 0;
        /// Interrupt Enable
        const IE = 1 << 1;
        /// MSI Revert to Single Message
        const MRSM = 1 << 2;
        /// AHCI Enable
        const AE = 1 << 31;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HBABIOSOSHandoffControl: u32 {
        /// BIOS Owned Semaphore
        const BOS = 1 << 0;
        /// OS Owned Semaphore
        const OOS = 1 << 1;
        /// SMI on OS Ownership Change Enable
        const SOOE = 1 << 2;
        /// OS Ownership Change
        const OOC = 1 << 3;
        /// BIOS Busy
        const BB = 1 << 4;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HBAPortInterrupt: u32 {
        /// Device to Host Register FIS Interrupt
        const DHR = 1 << 0;
        /// PIO Setup FIS Interrupt
        const PS = 1 << 1;
        /// DMA Setup FIS Interrupt
        const DS = 1 << 2;
        /// Set Device Bits Interrupt
        const SDB = 1 << 3;
        /// Unknown FIS Interrupt
        const UF = 1 << 4;
        /// Descriptor Processed
        const DP = 1 << 5;
        /// Port Connect Change
        const PC = 1 << 6;
        /// Device Mechanical Presence
        const DMP = 1 << 7;
        /// PhyRdy Change
        const PRC = 1 << 22;
        /// Incorrect Port Multiplier
        const IPM = 1 << 23;
        /// Overflow
        const OF = 1 << 24;
        /// Interface Non-fatal Error
        const INF = 1 << 26;
        /// Interface Fatal Error
        const IF = 1 << 27;
        /// Host Bus Data Error
        const HBD = 1 << 28;
        /// Host Bus Fatal Error
        const HBF = 1 << 29;
        /// Task File Error
        const TFE = 1 << 30;
        /// Cold Port Detect
        const CPD = 1 << 31;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HBAPortCommand: u32 {
        /// Start
        const ST = 1 << 0;
        /// Spin-Up Device
        const SUD = 1 << 1;
        /// Power On Device
        const POD = 1 << 2;
        /// Command List Override
        const CLO = 1 << 3;
        /// FIS Receive Enable
        const FRE = 1 << 4;
        /// Current Command Slot
        const CCS = ((1 << 5) - 1) << 8;
        /// Mechanical Presence Switch State
        const MPSS = 1 << 13;
        /// FIS Receive Running
        const FR = 1 << 14;
        /// Command List Running
        const CR = 1 << 15;
        /// Cold Presence State
        const CPS = 1 << 16;
        /// Port Multiplier Attached
        const PMA = 1 << 17;
        /// Hot Plug Capable Port
        const HPCP = 1 << 18;
        /// Mechanical Presence Switch Attached to Port
        const MPSP = 1 << 19;
        /// Cold Presence Detection
        const CPD = 1 << 20;
        /// External SATA Port
        const ESP = 1 << 21;
        /// FIS-based Switching Capable Port
        const FBSCP = 1 << 22;
        /// Automatic Partial to Slumber Transitions Enabled
        const APSTE = 1 << 23;
        /// Device is ATAPI
        const ATAPI = 1 << 24;
        /// Drive LED on ATAPI Enable
        const DLAE = 1 << 25;
        /// Aggresive Link Power Management Enable
        const ALPE = 1 << 26;
        /// Aggressive Slumber / Partial
        const ASP = 1 << 27;
        /// Interface Communication Control
        const ICC = ((1 << 4) - 1) << 28;
    }

    /// ATA status register, as mirrored in PxTFD
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFileStatus: u8 {
        /// Error
        const ERR = 1 << 0;
        /// Data Request
        const DRQ = 1 << 3;
        /// Device Fault
        const DF = 1 << 5;
        /// Device Ready
        const DRDY = 1 << 6;
        /// Busy
        const BSY = 1 << 7;
    }
}

impl HBACapabilities {
    /// Number of ports supported by the silicon, 1-based.
    pub fn port_count(self) -> u8 {
        (self & Self::NP).bits() as u8 + 1
    }

    /// Number of command slots per port, 1-based.
    pub fn slot_count(self) -> u8 {
        ((self & Self::NCS).bits() >> 8) as u8 + 1
    }

    /// Bits a HBA reset may clear that firmware programmed and software has to
    /// restore.
    pub const WRITE_ONCE: Self = Self::SMPS
        .union(Self::SSS)
        .union(Self::SPM)
        .union(Self::EMS)
        .union(Self::SXS);
}

impl HBAPortInterrupt {
    /// Conditions that halt the command list and require recovery.
    pub const ERROR: Self = Self::TFE
        .union(Self::HBF)
        .union(Self::HBD)
        .union(Self::IF)
        .union(Self::OF)
        .union(Self::IPM)
        .union(Self::UF);

    /// Conditions that signal a device arriving or leaving.
    pub const LINK: Self = Self::PC.union(Self::PRC);

    /// Interrupts the port driver enables while a device is attached.
    pub const ENABLED: Self = Self::DHR
        .union(Self::PS)
        .union(Self::DS)
        .union(Self::SDB)
        .union(Self::DP)
        .union(Self::ERROR)
        .union(Self::INF)
        .union(Self::LINK);
}

/// Decoded PxSSTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SataStatus {
    /// Device Detection
    pub det: u8,
    /// Current Interface Speed
    pub spd: u8,
    /// Interface Power Management
    pub ipm: u8,
}

impl SataStatus {
    pub const DET_NONE: u8 = 0;
    pub const DET_PRESENT: u8 = 3;
    pub const IPM_ACTIVE: u8 = 1;

    pub fn from_bits(value: u32) -> Self {
        Self {
            det: (value & 0xF) as u8,
            spd: ((value >> 4) & 0xF) as u8,
            ipm: ((value >> 8) & 0xF) as u8,
        }
    }

    /// Device present and phy communication established.
    pub fn present(self) -> bool {
        self.det == Self::DET_PRESENT
    }
}

/// PxSCTL fields
pub mod sctl {
    pub const DET: u32 = 0xF;
    /// Perform interface communication initialization (COMRESET)
    pub const DET_INIT: u32 = 0x1;
    pub const IPM: u32 = 0xF << 8;
    /// Transitions to both Partial and Slumber disabled
    pub const IPM_DISABLED: u32 = 0x3 << 8;
}

/// Decoded PxTFD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskFile {
    pub status: TaskFileStatus,
    pub error: u8,
}

/// Device signatures reported in PxSIG after the first D2H register FIS.
pub mod signature {
    pub const ATA: u32 = 0x0000_0101;
    pub const ATAPI: u32 = 0xEB14_0101;
    pub const SEMB: u32 = 0xC33C_0101;
    pub const PM: u32 = 0x9669_0101;
}

/// Global HBA registers.
pub struct Hba<'a, R: Registers> {
    registers: &'a R,
}

impl<'a, R: Registers> Hba<'a, R> {
    pub fn new(registers: &'a R) -> Self {
        Self { registers }
    }

    pub fn cap(&self) -> HBACapabilities {
        HBACapabilities::from_bits_retain(self.registers.read(CAP))
    }

    pub fn set_cap(&self, value: HBACapabilities) {
        self.registers.write(CAP, value.bits())
    }

    pub fn ghc(&self) -> HBAGlobalControl {
        HBAGlobalControl::from_bits_retain(self.registers.read(GHC))
    }

    pub fn set_ghc(&self, value: HBAGlobalControl) {
        self.registers.write(GHC, value.bits())
    }

    pub fn is(&self) -> u32 {
        self.registers.read(IS)
    }

    /// Acknowledges pending port interrupts, the register is write-1-to-clear.
    pub fn clear_is(&self, mask: u32) {
        self.registers.write(IS, mask)
    }

    pub fn pi(&self) -> u32 {
        self.registers.read(PI)
    }

    pub fn set_pi(&self, value: u32) {
        self.registers.write(PI, value)
    }

    /// Returns major and minor version.
    pub fn version(&self) -> (u16, u16) {
        let value = self.registers.read(VS);
        ((value >> 16) as u16, value as u16)
    }

    pub fn cap2(&self) -> HBACapabilitiesExtended {
        HBACapabilitiesExtended::from_bits_retain(self.registers.read(CAP2))
    }

    pub fn bohc(&self) -> HBABIOSOSHandoffControl {
        HBABIOSOSHandoffControl::from_bits_retain(self.registers.read(BOHC))
    }

    pub fn set_bohc(&self, value: HBABIOSOSHandoffControl) {
        self.registers.write(BOHC, value.bits())
    }

    pub fn port(&self, index: u8) -> PortRegisters<'a, R> {
        PortRegisters::new(self.registers, index)
    }
}

/// Registers of a single port.
pub struct PortRegisters<'a, R: Registers> {
    registers: &'a R,
    base: usize,
}

impl<'a, R: Registers> PortRegisters<'a, R> {
    pub fn new(registers: &'a R, index: u8) -> Self {
        debug_assert!(index < 32);
        Self {
            registers,
            base: PORT + index as usize * PORT_SIZE,
        }
    }

    fn read(&self, offset: usize) -> u32 {
        self.registers.read(self.base + offset)
    }

    fn write(&self, offset: usize, value: u32) {
        self.registers.write(self.base + offset, value)
    }

    pub fn command_list(&self) -> u64 {
        self.read(PX_CLB) as u64 | (self.read(PX_CLBU) as u64) << 32
    }

    pub fn set_command_list(&self, address: u64) {
        self.write(PX_CLB, address as u32);
        self.write(PX_CLBU, (address >> 32) as u32);
    }

    pub fn fis_base(&self) -> u64 {
        self.read(PX_FB) as u64 | (self.read(PX_FBU) as u64) << 32
    }

    pub fn set_fis_base(&self, address: u64) {
        self.write(PX_FB, address as u32);
        self.write(PX_FBU, (address >> 32) as u32);
    }

    pub fn is(&self) -> HBAPortInterrupt {
        HBAPortInterrupt::from_bits_retain(self.read(PX_IS))
    }

    /// Write-1-to-clear.
    pub fn clear_is(&self, value: HBAPortInterrupt) {
        self.write(PX_IS, value.bits())
    }

    pub fn ie(&self) -> HBAPortInterrupt {
        HBAPortInterrupt::from_bits_retain(self.read(PX_IE))
    }

    pub fn set_ie(&self, value: HBAPortInterrupt) {
        self.write(PX_IE, value.bits())
    }

    pub fn cmd(&self) -> HBAPortCommand {
        HBAPortCommand::from_bits_retain(self.read(PX_CMD))
    }

    pub fn set_cmd(&self, value: HBAPortCommand) {
        self.write(PX_CMD, value.bits())
    }

    pub fn update_cmd(&self, f: impl FnOnce(HBAPortCommand) -> HBAPortCommand) {
        self.set_cmd(f(self.cmd()))
    }

    pub fn tfd(&self) -> TaskFile {
        let value = self.read(PX_TFD);
        TaskFile {
            status: TaskFileStatus::from_bits_retain(value as u8),
            error: (value >> 8) as u8,
        }
    }

    pub fn sig(&self) -> u32 {
        self.read(PX_SIG)
    }

    pub fn ssts(&self) -> SataStatus {
        SataStatus::from_bits(self.read(PX_SSTS))
    }

    pub fn sctl(&self) -> u32 {
        self.read(PX_SCTL)
    }

    pub fn set_sctl(&self, value: u32) {
        self.write(PX_SCTL, value)
    }

    pub fn serr(&self) -> u32 {
        self.read(PX_SERR)
    }

    /// Write-1-to-clear.
    pub fn clear_serr(&self, mask: u32) {
        self.write(PX_SERR, mask)
    }

    pub fn sact(&self) -> u32 {
        self.read(PX_SACT)
    }

    /// Only set bits have an effect.
    pub fn set_sact(&self, mask: u32) {
        self.write(PX_SACT, mask)
    }

    pub fn ci(&self) -> u32 {
        self.read(PX_CI)
    }

    /// Rings the doorbell for the given slots, only set bits have an effect.
    pub fn set_ci(&self, mask: u32) {
        self.write(PX_CI, mask)
    }
}
