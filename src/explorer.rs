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

//! Discovery orchestrator.
//!
//! Owns the radio, the event source, the store and the in-memory topology,
//! and lends the radio to one controller at a time.

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::bluetooth::{
    InquiryStatus, RadioStack, SessionManager, SessionReport, SessionSink, SessionState,
    Topology,
};
use crate::config::Config;
use crate::discovery::{DeviceDiscovery, DeviceScanState, ServiceDiscovery};
use crate::error::{ExplorerError, Result};
use crate::events::{Event, EventKind, EventSource};
use crate::storage::{BlockStore, DiscoveryStore};

/// Outcome of [`Explorer::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub devices: usize,
    pub services: usize,
    /// Terminal status of the device inquiry.
    pub status: InquiryStatus,
    /// Whether the user cancelled either phase.
    pub cancelled: bool,
    /// Devices whose service inquiry did not start or failed.
    pub service_failures: usize,
    pub elapsed: Duration,
}

/// Device and service explorer.
pub struct Explorer<R: RadioStack, S: BlockStore> {
    radio: R,
    events: EventSource,
    store: DiscoveryStore<S>,
    topology: Topology,
    device_discovery: DeviceDiscovery,
    service_discovery: ServiceDiscovery,
    sessions: SessionManager,
}

impl<R: RadioStack, S: BlockStore> Explorer<R, S> {
    pub fn new(radio: R, events: EventSource, store: DiscoveryStore<S>, config: &Config) -> Self {
        Self {
            radio,
            events,
            store,
            topology: Topology::new(),
            device_discovery: DeviceDiscovery::new(config.bluetooth.inquiry_duration()),
            service_discovery: ServiceDiscovery::new(config.bluetooth.service_filter),
            sessions: SessionManager::new(config.session.read_buffer_size),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn session_state(&self) -> SessionState {
        self.sessions.state()
    }

    pub fn device_scan_state(&self) -> DeviceScanState {
        self.device_discovery.state()
    }

    /// Replace the topology with the stored one.
    ///
    /// Returns the number of devices loaded. A corrupt store leaves the
    /// topology empty and is reported as [`ExplorerError::Corruption`].
    pub fn load(&mut self) -> Result<usize> {
        self.topology.clear();
        match self.store.load()? {
            Some(topology) => {
                self.topology = topology;
                Ok(self.topology.len())
            }
            None => Ok(0),
        }
    }

    /// Delete the stored topology and forget the in-memory one.
    pub fn reset_store(&mut self) -> Result<()> {
        self.store.erase()?;
        self.topology.clear();
        Ok(())
    }

    /// Discover devices, then their services, then persist the result.
    ///
    /// A cancelled scan keeps and stores what it found so far. A failed
    /// device inquiry keeps its partial results in memory only.
    pub async fn scan(&mut self) -> Result<ScanReport> {
        let started = Instant::now();
        self.events.clear()?;
        let cancel = self.events.begin_operation();

        let status = self
            .device_discovery
            .run(&mut self.radio, &mut self.events, &mut self.topology, &cancel)
            .await?;

        let mut service_failures = 0;
        let cancelled = match status {
            InquiryStatus::Failed(code) => {
                error!("Device inquiry failed: {}", code);
                return Err(ExplorerError::Scan(code));
            }
            InquiryStatus::Cancelled => {
                info!("Scan cancelled during device inquiry");
                true
            }
            _ => {
                info!(
                    "Looking for services carrying {}",
                    self.service_discovery.filter()
                );
                let summary = self
                    .service_discovery
                    .run(&mut self.radio, &mut self.events, &mut self.topology, &cancel)
                    .await?;
                service_failures = summary.failures();
                if service_failures > 0 {
                    warn!("{} devices failed service discovery", service_failures);
                }
                summary.cancelled
            }
        };

        self.store.save(&self.topology)?;

        let report = ScanReport {
            devices: self.topology.len(),
            services: self.topology.service_count(),
            status,
            cancelled,
            service_failures,
            elapsed: started.elapsed(),
        };
        info!(
            "Scan finished: {} devices, {} services in {:.1}s{}",
            report.devices,
            report.services,
            report.elapsed.as_secs_f64(),
            if cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }

    /// Open a stream to one known service and feed it into `sink` until it
    /// ends.
    pub async fn open_session<K>(
        &mut self,
        device_index: usize,
        service_index: usize,
        sink: &mut K,
    ) -> Result<SessionReport>
    where
        K: SessionSink + ?Sized,
    {
        let device = self
            .topology
            .device(device_index)
            .ok_or(ExplorerError::NoSuchDevice(device_index))?
            .clone();
        let service = device
            .services
            .get(service_index)
            .cloned()
            .ok_or(ExplorerError::NoSuchService {
                device: device_index,
                service: service_index,
            })?;

        self.events.clear()?;
        let cancel = self.events.begin_operation();

        self.sessions
            .run(&mut self.radio, &mut self.events, &device, &service, &cancel, sink)
            .await
    }

    /// Wait for the next user command while idle.
    pub async fn next_command(&mut self) -> Result<String> {
        loop {
            self.events.wait().await?;
            if let Some(Event::Command(command)) = self.events.poll_next(EventKind::Command)? {
                return Ok(command);
            }
        }
    }
}
