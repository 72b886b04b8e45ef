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

//! Device discovery controller.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::inquiry::{self, Drain, MAX_FETCH_ERRORS};
use crate::bluetooth::{Device, Fetch, InquiryStatus, RadioStack, Topology};
use crate::error::Result;
use crate::events::EventSource;

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceScanState {
    Idle,
    Scanning,
    Done(InquiryStatus),
}

/// Scans for nearby peers and appends them to the topology in arrival order.
pub struct DeviceDiscovery {
    duration: Duration,
    state: DeviceScanState,
}

impl DeviceDiscovery {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            state: DeviceScanState::Idle,
        }
    }

    pub fn state(&self) -> DeviceScanState {
        self.state
    }

    /// Run a device inquiry to its terminal status.
    ///
    /// The topology is cleared once the inquiry has started. Whatever was
    /// appended before a failure stays in it.
    pub async fn run<R: RadioStack>(
        &mut self,
        radio: &mut R,
        events: &mut EventSource,
        topology: &mut Topology,
        cancel: &CancellationToken,
    ) -> Result<InquiryStatus> {
        let started = Instant::now();

        if let Err(code) = radio.start_device_inquiry(self.duration) {
            warn!("Device inquiry failed to start: {}", code.0);
            self.state = DeviceScanState::Idle;
            return Err(inquiry::start_error(code));
        }

        topology.clear();
        self.state = DeviceScanState::Scanning;
        info!("Device inquiry started ({:?})", self.duration);

        let result = inquiry::drive(radio, events, cancel, |radio, mode| {
            drain_devices(radio, topology, mode)
        })
        .await;

        match result {
            Ok(status) => {
                self.state = DeviceScanState::Done(status);
                info!(
                    "Device inquiry done: {:?}, {} devices, {} ms",
                    status,
                    topology.len(),
                    started.elapsed().as_millis()
                );
                Ok(status)
            }
            Err(e) => {
                self.state = DeviceScanState::Idle;
                Err(e)
            }
        }
    }
}

fn drain_devices<R: RadioStack>(radio: &mut R, topology: &mut Topology, mode: Drain) {
    let mut errors = 0;
    loop {
        match radio.fetch_next_device() {
            Fetch::Empty => return,
            Fetch::Record(record) => {
                errors = 0;
                debug!(
                    "d{}: {} '{}'",
                    topology.len(),
                    record.address,
                    record.name
                );
                topology.push(Device::new(record.address, record.name));
            }
            Fetch::Error(code) => {
                warn!("Skipping device record: error {}", code);
                errors += 1;
                if mode == Drain::UntilError || errors >= MAX_FETCH_ERRORS {
                    return;
                }
            }
        }
    }
}
