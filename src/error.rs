// Copyright 2026 Daniel Pelikan
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

//! Error types for the discovery engine.

use crate::bluetooth::PeerAddress;
use crate::storage::CorruptionError;

/// Result type alias.
pub type Result<T> = std::result::Result<T, ExplorerError>;

/// Recoverable errors reported by the discovery engine.
///
/// Contract violations by the radio stack are not represented here; they
/// panic, since no safe continuation exists.
#[derive(Debug, thiserror::Error)]
pub enum ExplorerError {
    /// Another inquiry is already running.
    #[error("radio busy (code {0})")]
    RadioBusy(i32),

    /// The radio is switched off or missing.
    #[error("radio unavailable (code {0})")]
    RadioUnavailable(i32),

    /// The scan failed to start or ended with an error status.
    #[error("scan failed (code {0})")]
    Scan(i32),

    /// Opening a stream to a service failed.
    #[error("connect to {address} channel {channel} failed (code {code})")]
    Connect {
        address: PeerAddress,
        channel: u8,
        code: i32,
    },

    /// The stored topology could not be decoded.
    #[error("stored topology is corrupt: {0}")]
    Corruption(#[from] CorruptionError),

    /// Block store I/O error.
    #[error("store I/O error: {0}")]
    Store(#[from] std::io::Error),

    /// No device at the selected index.
    #[error("no device at index {0}")]
    NoSuchDevice(usize),

    /// No service at the selected index.
    #[error("device {device} has no service at index {service}")]
    NoSuchService { device: usize, service: usize },

    /// The user or the platform asked the process to stop.
    #[error("shutdown requested")]
    Shutdown,
}

impl ExplorerError {
    /// Whether the caller may simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RadioBusy(_) | Self::RadioUnavailable(_))
    }
}
