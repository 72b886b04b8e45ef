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

//! Bluetooth module.
//!
//! Domain types, the radio contract, the BlueZ backend and RFCOMM sessions.

mod bluez;
mod connection;
mod radio;
pub mod sdp;
mod types;

pub use bluez::BluezRadio;
pub use connection::{
    SessionEnd, SessionManager, SessionReport, SessionSink, SessionState, DEFAULT_READ_BUFFER,
};
pub use radio::{
    codes, status, ConnCompletion, ConnHandle, ConnOp, DeviceRecord, Fetch, InquiryStatus,
    PlatformEvent, RadioCode, RadioStack, ServiceSize, UserInput,
};
pub use types::{
    bounded_name, uuid_from_alias, Device, PeerAddress, Service, Topology, BASE_UUID,
    MAX_NAME_LEN, MAX_UUIDS, RFCOMM_PROTOCOL_UUID,
};
