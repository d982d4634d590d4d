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

/// Driver tunables, all times are in microseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Wait for GHC.HR to clear after a HBA reset
    pub reset_timeout: u64,
    /// Wait for PxSSTS.DET to report an established link after COMRESET
    pub link_timeout: u64,
    /// Wait for the device to clear BSY and DRQ
    pub ready_timeout: u64,
    /// Wait for PxCMD.CR or PxCMD.FR to follow ST or FRE
    pub engine_timeout: u64,
    /// Time an issued command may take before it is considered lost
    pub command_timeout: u64,
    /// How often device detection is tried before a port is failed for good
    pub detect_attempts: u8,
    /// How often a timed out command is reissued before it is aborted
    pub command_retries: u8,
    /// Requests held per port while all slots are busy, 0 rejects right away
    pub max_queued: usize,
    /// Use native command queuing where both HBA and device support it
    pub ncq: bool,
    /// Prefer a message signaled interrupt over the legacy line
    pub msi: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reset_timeout: 1_000_000,
            link_timeout: 100_000,
            ready_timeout: 1_000_000,
            engine_timeout: 500_000,
            command_timeout: 5_000_000,
            detect_attempts: 3,
            command_retries: 2,
            max_queued: 64,
            ncq: true,
            msi: true,
        }
    }
}
