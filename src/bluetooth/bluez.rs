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

//! BlueZ radio backend.
//!
//! bluer futures run on spawned tasks which only queue results and push
//! events; every [`RadioStack`] call returns immediately.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bluer::rfcomm::stream::{OwnedReadHalf, OwnedWriteHalf};
use bluer::{
    l2cap, rfcomm, Adapter, AdapterEvent, Address, AddressType, DiscoveryFilter,
    DiscoveryTransport,
};
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::radio::{
    codes, status, ConnCompletion, ConnHandle, ConnOp, DeviceRecord, Fetch, RadioCode,
    RadioStack, ServiceSize,
};
use super::sdp::{self, SdpRecord, SDP_PSM};
use super::types::{PeerAddress, Service};
use crate::config::BluetoothConfig;
use crate::events::EventSink;

/// Largest SDP response PDU we accept.
const SDP_MTU: usize = 0xffff;

/// Upper bound on continuation round trips for one search.
const MAX_SDP_ROUNDS: usize = 64;

/// Valid RFCOMM channels.
const RFCOMM_CHANNELS: std::ops::RangeInclusive<u8> = 1..=30;

struct Connection {
    cancel: CancellationToken,
    reader: Arc<Mutex<Option<OwnedReadHalf>>>,
    _writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
}

/// [`RadioStack`] on top of a BlueZ adapter.
pub struct BluezRadio {
    adapter: Adapter,
    sink: EventSink,
    powered: bool,
    devices: Arc<Mutex<VecDeque<Fetch<DeviceRecord>>>>,
    services: Arc<Mutex<VecDeque<Fetch<Service>>>>,
    inquiry: Option<CancellationToken>,
    inquiry_active: Arc<AtomicBool>,
    connections: HashMap<ConnHandle, Connection>,
    next_handle: u32,
}

impl BluezRadio {
    /// Open the configured adapter (or the default one) and power it on.
    pub async fn new(config: &BluetoothConfig, sink: EventSink) -> Result<Self> {
        info!("Initializing Bluetooth radio...");

        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        let adapter = match &config.adapter {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }
        let powered = adapter.is_powered().await?;
        if !powered {
            warn!("Adapter {} is not powered", adapter.name());
        }

        Ok(Self {
            adapter,
            sink,
            powered,
            devices: Arc::new(Mutex::new(VecDeque::new())),
            services: Arc::new(Mutex::new(VecDeque::new())),
            inquiry: None,
            inquiry_active: Arc::new(AtomicBool::new(false)),
            connections: HashMap::new(),
            next_handle: 1,
        })
    }

    /// Address of the local adapter.
    pub async fn address(&self) -> Result<Address> {
        Ok(self.adapter.address().await?)
    }

    fn begin_inquiry(&mut self) -> Result<CancellationToken, RadioCode> {
        if !self.powered {
            return Err(RadioCode(codes::UNAVAILABLE));
        }
        if self.inquiry_active.swap(true, Ordering::SeqCst) {
            return Err(RadioCode(codes::BUSY));
        }
        let token = CancellationToken::new();
        self.inquiry = Some(token.clone());
        Ok(token)
    }

    fn finish_inquiry(active: &AtomicBool, sink: &EventSink, code: i32) {
        active.store(false, Ordering::SeqCst);
        sink.inquiry_status(code);
    }
}

impl RadioStack for BluezRadio {
    fn start_device_inquiry(&mut self, duration: Duration) -> Result<(), RadioCode> {
        let cancel = self.begin_inquiry()?;
        self.devices.lock().clear();

        let adapter = self.adapter.clone();
        let queue = self.devices.clone();
        let sink = self.sink.clone();
        let active = self.inquiry_active.clone();

        tokio::spawn(async move {
            let code = match discover_devices(&adapter, duration, &queue, &sink, &cancel).await {
                Ok(()) if cancel.is_cancelled() => status::CANCELLED,
                Ok(()) => status::COMPLETED,
                Err(e) => {
                    warn!("Device inquiry error: {}", e);
                    codes::GENERIC
                }
            };
            Self::finish_inquiry(&active, &sink, code);
        });

        Ok(())
    }

    fn fetch_next_device(&mut self) -> Fetch<DeviceRecord> {
        self.devices.lock().pop_front().unwrap_or(Fetch::Empty)
    }

    fn start_service_inquiry(&mut self, address: PeerAddress, filter: Uuid) -> Result<(), RadioCode> {
        let cancel = self.begin_inquiry()?;
        self.services.lock().clear();

        let queue = self.services.clone();
        let sink = self.sink.clone();
        let active = self.inquiry_active.clone();

        tokio::spawn(async move {
            let code = tokio::select! {
                _ = cancel.cancelled() => status::CANCELLED,
                result = query_services(address.into(), filter) => match result {
                    Ok(records) => {
                        let found = records.iter().filter_map(SdpRecord::to_service);
                        queue.lock().extend(found.map(Fetch::Record));
                        sink.inquiry_status(status::IN_PROGRESS);
                        status::COMPLETED
                    }
                    Err(e) => {
                        warn!("SDP query on {} failed: {}", address, e);
                        codes::GENERIC
                    }
                },
            };
            Self::finish_inquiry(&active, &sink, code);
        });

        Ok(())
    }

    fn peek_next_service_size(&mut self) -> Fetch<ServiceSize> {
        let mut queue = self.services.lock();
        match queue.front() {
            None => Fetch::Empty,
            Some(Fetch::Record(service)) => Fetch::Record(ServiceSize::of(service)),
            Some(_) => match queue.pop_front() {
                Some(Fetch::Error(code)) => Fetch::Error(code),
                _ => Fetch::Empty,
            },
        }
    }

    fn fetch_next_service(&mut self, _size: ServiceSize) -> Fetch<Service> {
        self.services.lock().pop_front().unwrap_or(Fetch::Empty)
    }

    fn cancel_inquiry(&mut self) -> i32 {
        match &self.inquiry {
            Some(token) if self.inquiry_active.load(Ordering::SeqCst) => {
                token.cancel();
                0
            }
            _ => codes::GENERIC,
        }
    }

    fn connect(&mut self, address: PeerAddress, channel: u8) -> Result<ConnHandle, RadioCode> {
        if !RFCOMM_CHANNELS.contains(&channel) {
            return Err(RadioCode(codes::CONNECT));
        }
        if !self.powered {
            return Err(RadioCode(codes::UNAVAILABLE));
        }

        let handle = ConnHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1).max(1);

        let connection = Connection {
            cancel: CancellationToken::new(),
            reader: Arc::new(Mutex::new(None)),
            _writer: Arc::new(Mutex::new(None)),
        };
        let cancel = connection.cancel.clone();
        let reader = connection.reader.clone();
        let writer = connection._writer.clone();
        let sink = self.sink.clone();
        self.connections.insert(handle, connection);

        tokio::spawn(async move {
            let addr = rfcomm::SocketAddr::new(address.into(), channel);
            let result = tokio::select! {
                _ = cancel.cancelled() => codes::CLOSED,
                stream = rfcomm::Stream::connect(addr) => match stream {
                    Ok(stream) => {
                        let (read_half, write_half) = stream.into_split();
                        *reader.lock() = Some(read_half);
                        *writer.lock() = Some(write_half);
                        1
                    }
                    Err(e) => {
                        warn!("RFCOMM connect to {} channel {} failed: {}", address, channel, e);
                        codes::CONNECT
                    }
                },
            };
            sink.completion(ConnCompletion {
                handle,
                op: ConnOp::Connect,
                result,
                buffer: None,
            });
        });

        Ok(handle)
    }

    fn read(&mut self, handle: ConnHandle, mut buffer: Vec<u8>) -> Result<(), RadioCode> {
        let connection = self
            .connections
            .get(&handle)
            .ok_or(RadioCode(codes::BAD_HANDLE))?;
        let mut read_half = connection
            .reader
            .lock()
            .take()
            .ok_or(RadioCode(codes::BUSY))?;

        let slot = connection.reader.clone();
        let cancel = connection.cancel.clone();
        let sink = self.sink.clone();

        tokio::spawn(async move {
            let len = buffer.capacity().max(1);
            buffer.resize(len, 0);

            let result = tokio::select! {
                _ = cancel.cancelled() => codes::CLOSED,
                read = read_half.read(&mut buffer) => match read {
                    Ok(0) => codes::CLOSED,
                    Ok(n) => i32::try_from(n).unwrap_or(i32::MAX),
                    Err(e) => {
                        debug!("RFCOMM read error: {}", e);
                        codes::GENERIC
                    }
                },
            };

            if result > 0 {
                buffer.truncate(result as usize);
                *slot.lock() = Some(read_half);
            } else {
                buffer.clear();
            }
            sink.completion(ConnCompletion {
                handle,
                op: ConnOp::Read,
                result,
                buffer: Some(buffer),
            });
        });

        Ok(())
    }

    fn close(&mut self, handle: ConnHandle) {
        if let Some(connection) = self.connections.remove(&handle) {
            connection.cancel.cancel();
            debug!("Connection {:?} released", handle);
        }
    }
}

async fn discover_devices(
    adapter: &Adapter,
    duration: Duration,
    queue: &Mutex<VecDeque<Fetch<DeviceRecord>>>,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut filter = DiscoveryFilter::default();
    filter.transport = DiscoveryTransport::BrEdr;
    adapter.set_discovery_filter(filter).await?;

    let events = adapter.discover_devices().await?;
    pin_mut!(events);
    let deadline = tokio::time::sleep(duration);
    pin_mut!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = &mut deadline => return Ok(()),
            event = events.next() => match event {
                Some(AdapterEvent::DeviceAdded(addr)) => {
                    let record = match adapter.device(addr) {
                        Ok(device) => Fetch::Record(DeviceRecord {
                            address: addr.into(),
                            // Often still unresolved at this point.
                            name: device.name().await.ok().flatten().unwrap_or_default(),
                        }),
                        Err(e) => {
                            debug!("Device {} vanished: {}", addr, e);
                            Fetch::Error(codes::MALFORMED)
                        }
                    };
                    queue.lock().push_back(record);
                    sink.inquiry_status(status::IN_PROGRESS);
                }
                Some(_) => {}
                None => return Ok(()),
            },
        }
    }
}

/// Run a ServiceSearchAttribute transaction against the peer's SDP server.
async fn query_services(address: Address, filter: Uuid) -> Result<Vec<SdpRecord>> {
    let addr = l2cap::SocketAddr::new(address, AddressType::BrEdr, SDP_PSM);
    let socket = l2cap::SeqPacket::connect(addr).await?;
    debug!("SDP connected to {}", address);

    let mut attribute_bytes = Vec::new();
    let mut continuation = Vec::new();
    let mut buf = vec![0u8; SDP_MTU];

    for round in 0..MAX_SDP_ROUNDS {
        let transaction = round as u16 + 1;
        let request = sdp::search_attr_request(transaction, &[filter], &continuation);
        socket.send(&request).await?;

        let n = socket.recv(&mut buf).await?;
        let chunk = sdp::parse_search_attr_response(&buf[..n], transaction)?;
        attribute_bytes.extend_from_slice(&chunk.attribute_bytes);

        if chunk.continuation.is_empty() {
            return sdp::parse_records(&attribute_bytes);
        }
        continuation = chunk.continuation;
    }

    Err(anyhow!(
        "SDP response from {} did not finish in {} rounds",
        address,
        MAX_SDP_ROUNDS
    ))
}
