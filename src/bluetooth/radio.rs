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

//! Radio stack contract.
//!
//! Every call is non-blocking. Inquiry progress and connection completions
//! are delivered later as [`PlatformEvent`]s through the event queue.

use std::time::Duration;

use uuid::Uuid;

use super::types::{PeerAddress, Service};

/// Inquiry status codes carried by [`PlatformEvent::Inquiry`].
pub mod status {
    pub const IN_PROGRESS: i32 = 0;
    pub const COMPLETED: i32 = 1;
    pub const CANCELLED: i32 = 2;
}

/// Negative result codes used by the radio stack.
pub mod codes {
    /// Generic failure.
    pub const GENERIC: i32 = -2;
    /// An inquiry or operation is already in progress.
    pub const BUSY: i32 = -3;
    /// No powered adapter.
    pub const UNAVAILABLE: i32 = -4;
    /// The connection was closed, locally or by the peer.
    pub const CLOSED: i32 = -5;
    /// Connect to the peer failed.
    pub const CONNECT: i32 = -6;
    /// Unknown connection handle.
    pub const BAD_HANDLE: i32 = -7;
    /// Malformed record from the peer.
    pub const MALFORMED: i32 = -8;
}

/// Status of the current inquiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InquiryStatus {
    InProgress,
    Completed,
    Cancelled,
    Failed(i32),
}

impl InquiryStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            status::IN_PROGRESS => Self::InProgress,
            status::CANCELLED => Self::Cancelled,
            c if c < 0 => Self::Failed(c),
            _ => Self::Completed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Rejection of a radio call, carrying the negative platform code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioCode(pub i32);

impl RadioCode {
    pub fn is_busy(&self) -> bool {
        self.0 == codes::BUSY
    }

    pub fn is_unavailable(&self) -> bool {
        self.0 == codes::UNAVAILABLE
    }
}

/// Result of a drain primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch<T> {
    /// Nothing available right now.
    Empty,
    /// One record.
    Record(T),
    /// This record could not be fetched; later ones may still be fine.
    /// The failed record is consumed either way.
    Error(i32),
}

/// A device found by an inquiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub address: PeerAddress,
    pub name: String,
}

/// Size of the next pending service record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSize {
    pub name_len: usize,
    pub uuids: usize,
}

impl ServiceSize {
    pub fn of(service: &Service) -> Self {
        Self {
            name_len: service.name.len(),
            uuids: service.uuids.len(),
        }
    }
}

/// Opaque connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub u32);

/// Asynchronous connection operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnOp {
    Connect,
    Read,
}

/// Completion of an asynchronous connection operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnCompletion {
    pub handle: ConnHandle,
    pub op: ConnOp,
    /// Byte count for reads, positive for a successful connect, negative on
    /// error. Never zero.
    pub result: i32,
    /// Buffer handed to [`RadioStack::read`], truncated to `result` bytes.
    pub buffer: Option<Vec<u8>>,
}

/// User input recognised by the event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserInput {
    /// Cancel the running inquiry, or close the open session.
    Cancel,
    /// Quit the process.
    Exit,
    /// Anything else, passed to the presentation layer.
    Command(String),
}

/// Raw event delivered by the platform queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// Global close request.
    Close,
    Input(UserInput),
    /// Inquiry status update, see [`status`].
    Inquiry(i32),
    Connection(ConnCompletion),
}

/// The platform radio stack.
pub trait RadioStack {
    fn start_device_inquiry(&mut self, duration: Duration) -> Result<(), RadioCode>;

    fn fetch_next_device(&mut self) -> Fetch<DeviceRecord>;

    fn start_service_inquiry(&mut self, address: PeerAddress, filter: Uuid)
        -> Result<(), RadioCode>;

    fn peek_next_service_size(&mut self) -> Fetch<ServiceSize>;

    fn fetch_next_service(&mut self, size: ServiceSize) -> Fetch<Service>;

    /// Ask the running inquiry to stop. Completion is still reported as an
    /// inquiry event.
    fn cancel_inquiry(&mut self) -> i32;

    fn connect(&mut self, address: PeerAddress, channel: u8) -> Result<ConnHandle, RadioCode>;

    /// Start reading up to `buffer.capacity()` bytes.
    fn read(&mut self, handle: ConnHandle, buffer: Vec<u8>) -> Result<(), RadioCode>;

    fn close(&mut self, handle: ConnHandle);
}
