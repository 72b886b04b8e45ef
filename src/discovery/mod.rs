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

//! Device and service discovery controllers.
//!
//! Both controllers borrow the radio for the duration of one inquiry, so only
//! one inquiry can ever be in flight.

mod device;
mod inquiry;
mod service;

pub use device::{DeviceDiscovery, DeviceScanState};
pub use inquiry::{Drain, MAX_FETCH_ERRORS};
pub use service::{DeviceServiceStatus, ServiceDiscovery, ServiceScanSummary};
