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

//! Service discovery controller.

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::inquiry::{self, Drain, MAX_FETCH_ERRORS};
use crate::bluetooth::{
    Fetch, InquiryStatus, RadioStack, Service, ServiceSize, Topology, MAX_UUIDS,
};
use crate::error::Result;
use crate::events::EventSource;

/// Per-device result of a service scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceServiceStatus {
    /// The inquiry never started.
    NotStarted(i32),
    Finished(InquiryStatus),
    /// Skipped because the scan was cancelled on an earlier device.
    Skipped,
}

/// Summary of one pass over the topology.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceScanSummary {
    /// One entry per device, in topology order.
    pub per_device: Vec<DeviceServiceStatus>,
    pub cancelled: bool,
}

impl ServiceScanSummary {
    pub fn failures(&self) -> usize {
        self.per_device
            .iter()
            .filter(|s| {
                matches!(
                    s,
                    DeviceServiceStatus::NotStarted(_)
                        | DeviceServiceStatus::Finished(InquiryStatus::Failed(_))
                )
            })
            .count()
    }
}

/// Scans every device in the topology for services matching a protocol
/// filter, one device at a time.
pub struct ServiceDiscovery {
    filter: Uuid,
}

impl ServiceDiscovery {
    pub fn new(filter: Uuid) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> Uuid {
        self.filter
    }

    /// Scan all devices. A failure on one device never stops the others; a
    /// cancel stops after the current device.
    pub async fn run<R: RadioStack>(
        &mut self,
        radio: &mut R,
        events: &mut EventSource,
        topology: &mut Topology,
        cancel: &CancellationToken,
    ) -> Result<ServiceScanSummary> {
        let mut summary = ServiceScanSummary::default();
        info!("Scanning {} devices for services...", topology.len());

        for index in 0..topology.len() {
            if cancel.is_cancelled() {
                summary.per_device.push(DeviceServiceStatus::Skipped);
                summary.cancelled = true;
                continue;
            }

            let status = self.scan_device(radio, events, topology, index, cancel).await?;
            if status == DeviceServiceStatus::Finished(InquiryStatus::Cancelled) {
                summary.cancelled = true;
            }
            summary.per_device.push(status);
        }

        Ok(summary)
    }

    async fn scan_device<R: RadioStack>(
        &mut self,
        radio: &mut R,
        events: &mut EventSource,
        topology: &mut Topology,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<DeviceServiceStatus> {
        let Some(device) = topology.device_mut(index) else {
            return Ok(DeviceServiceStatus::Skipped);
        };
        let address = device.address;
        let started = Instant::now();

        info!("ServDisc {}", address);
        if let Err(code) = radio.start_service_inquiry(address, self.filter) {
            warn!("Service inquiry on {} failed to start: {}", address, code.0);
            return Ok(DeviceServiceStatus::NotStarted(code.0));
        }

        let services = &mut device.services;
        let status = inquiry::drive(radio, events, cancel, |radio, mode| {
            drain_services(radio, services, mode)
        })
        .await?;

        info!(
            "Service inquiry on {} done: {:?}, {} services, {} ms",
            address,
            status,
            device.services.len(),
            started.elapsed().as_millis()
        );
        Ok(DeviceServiceStatus::Finished(status))
    }
}

fn drain_services<R: RadioStack>(radio: &mut R, services: &mut Vec<Service>, mode: Drain) {
    let mut errors = 0;
    loop {
        if errors >= MAX_FETCH_ERRORS {
            warn!("Giving up after {} failed service records", errors);
            return;
        }
        let size = match radio.peek_next_service_size() {
            Fetch::Empty => return,
            Fetch::Record(size) => size,
            Fetch::Error(code) => {
                warn!("Skipping service record: size error {}", code);
                errors += 1;
                if mode == Drain::UntilError {
                    return;
                }
                continue;
            }
        };

        assert!(
            size.uuids <= MAX_UUIDS,
            "radio announced a service record with {} UUIDs (max {})",
            size.uuids,
            MAX_UUIDS
        );

        match radio.fetch_next_service(size) {
            Fetch::Empty => {
                warn!("Service record vanished after its size was announced");
                return;
            }
            Fetch::Record(service) => {
                if !fits(&service, size) {
                    warn!(
                        "Skipping service on channel {}: {} UUIDs, {} announced",
                        service.channel,
                        service.uuids.len(),
                        size.uuids
                    );
                    continue;
                }
                errors = 0;
                let service = Service::new(service.channel, service.name, service.uuids);
                debug!(
                    "s{}: channel {} '{}'",
                    services.len(),
                    service.channel,
                    service.name
                );
                for uuid in &service.uuids {
                    debug!("  {}", uuid);
                }
                services.push(service);
            }
            Fetch::Error(code) => {
                warn!("Skipping service record: error {}", code);
                errors += 1;
                if mode == Drain::UntilError {
                    return;
                }
            }
        }
    }
}

fn fits(service: &Service, size: ServiceSize) -> bool {
    service.uuids.len() <= size.uuids
}
