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

//! Discovered topology types.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};
use uuid::Uuid;

/// Maximum number of UUIDs a single service record may carry.
pub const MAX_UUIDS: usize = 32;

/// Maximum length of a device or service name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Bluetooth base UUID, `00000000-0000-1000-8000-00805F9B34FB`.
pub const BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805F9B34FB);

/// RFCOMM protocol UUID, used as the service inquiry filter.
pub const RFCOMM_PROTOCOL_UUID: Uuid = Uuid::from_u128(0x00000003_0000_1000_8000_00805F9B34FB);

/// Expand a 16- or 32-bit SIG alias onto the base UUID.
pub fn uuid_from_alias(alias: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID.as_u128() | ((alias as u128) << 96))
}

/// Truncate a name to [`MAX_NAME_LEN`] bytes on a char boundary.
pub fn bounded_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// A 6-byte hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PeerAddress(pub [u8; 6]);

impl PeerAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| anyhow!("Address too short: {}", s))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| anyhow!("Invalid address byte '{}' in {}", part, s))?;
        }
        if parts.next().is_some() {
            return Err(anyhow!("Address too long: {}", s));
        }
        Ok(Self(bytes))
    }
}

impl From<bluer::Address> for PeerAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

impl From<PeerAddress> for bluer::Address {
    fn from(addr: PeerAddress) -> Self {
        bluer::Address::new(addr.0)
    }
}

/// An RFCOMM service exposed by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub channel: u8,
    pub name: String,
    pub uuids: Vec<Uuid>,
}

impl Service {
    pub fn new(channel: u8, name: impl Into<String>, uuids: Vec<Uuid>) -> Self {
        let name = name.into();
        Self {
            channel,
            name: bounded_name(&name).to_string(),
            uuids,
        }
    }

    /// Name for display; blank names are common until resolution finishes.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "(unnamed)"
        } else {
            &self.name
        }
    }
}

/// A discovered device and the services found on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub address: PeerAddress,
    pub name: String,
    pub services: Vec<Service>,
}

impl Device {
    pub fn new(address: PeerAddress, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            address,
            name: bounded_name(&name).to_string(),
            services: Vec::new(),
        }
    }

    pub fn with_services(mut self, services: Vec<Service>) -> Self {
        self.services = services;
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "(unnamed)"
        } else {
            &self.name
        }
    }
}

/// Everything discovered since the last full rescan or store load, in
/// discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    devices: Vec<Device>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_devices(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    pub fn device_mut(&mut self, index: usize) -> Option<&mut Device> {
        self.devices.get_mut(index)
    }

    pub fn push(&mut self, device: Device) {
        self.devices.push(device);
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Total number of services across all devices.
    pub fn service_count(&self) -> usize {
        self.devices.iter().map(|d| d.services.len()).sum()
    }
}
