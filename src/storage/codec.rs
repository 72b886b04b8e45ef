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

//! Topology blob encoding.
//!
//! Layout, little-endian, no version header:
//!
//! ```text
//! u32 device_count
//!   [u8; 6] address
//!   u8      name_len, name bytes
//!   u16     service_count
//!     u8    channel
//!     u8    name_len, name bytes
//!     u8    uuid_count (<= 32), uuid_count * 16 bytes
//! ```

use tracing::warn;
use uuid::Uuid;

use crate::bluetooth::{bounded_name, Device, PeerAddress, Service, Topology, MAX_UUIDS};

// address + name_len + service_count
const MIN_DEVICE_LEN: usize = 6 + 1 + 2;
// channel + name_len + uuid_count
const MIN_SERVICE_LEN: usize = 1 + 1 + 1;

/// Reasons a blob is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorruptionError {
    #[error("truncated at offset {offset}: need {needed} more bytes")]
    Truncated { offset: usize, needed: usize },

    #[error("{what} count {count} at offset {offset} overruns the blob")]
    CountOverrun {
        what: &'static str,
        count: usize,
        offset: usize,
    },

    #[error("service at offset {offset} claims {count} UUIDs (max {MAX_UUIDS})")]
    TooManyUuids { offset: usize, count: usize },

    #[error("name at offset {offset} is not valid UTF-8")]
    InvalidName { offset: usize },

    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

/// Encode a topology.
pub fn serialize(topology: &Topology) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 * topology.len() + 4);
    out.extend_from_slice(&(topology.len() as u32).to_le_bytes());

    for device in topology.devices() {
        out.extend_from_slice(device.address.as_bytes());
        put_name(&mut out, &device.name);

        let services = &device.services[..device.services.len().min(u16::MAX as usize)];
        out.extend_from_slice(&(services.len() as u16).to_le_bytes());

        for service in services {
            out.push(service.channel);
            put_name(&mut out, &service.name);

            let uuids = if service.uuids.len() > MAX_UUIDS {
                warn!(
                    "Service on channel {} has {} UUIDs, storing the first {}",
                    service.channel,
                    service.uuids.len(),
                    MAX_UUIDS
                );
                &service.uuids[..MAX_UUIDS]
            } else {
                &service.uuids[..]
            };
            out.push(uuids.len() as u8);
            for uuid in uuids {
                out.extend_from_slice(uuid.as_bytes());
            }
        }
    }

    out
}

/// Decode a blob produced by [`serialize`].
pub fn deserialize(blob: &[u8]) -> Result<Topology, CorruptionError> {
    let mut reader = Reader::new(blob);

    let device_count = reader.u32()? as usize;
    reader.check_count("device", device_count, MIN_DEVICE_LEN)?;

    let mut devices = Vec::with_capacity(device_count);
    for _ in 0..device_count {
        let address = PeerAddress::new(reader.array::<6>()?);
        let name = reader.name()?;

        let service_count = reader.u16()? as usize;
        reader.check_count("service", service_count, MIN_SERVICE_LEN)?;

        let mut services = Vec::with_capacity(service_count);
        for _ in 0..service_count {
            let channel = reader.u8()?;
            let name = reader.name()?;

            let offset = reader.offset;
            let uuid_count = reader.u8()? as usize;
            if uuid_count > MAX_UUIDS {
                return Err(CorruptionError::TooManyUuids {
                    offset,
                    count: uuid_count,
                });
            }
            reader.check_count("uuid", uuid_count, 16)?;

            let mut uuids = Vec::with_capacity(uuid_count);
            for _ in 0..uuid_count {
                uuids.push(Uuid::from_bytes(reader.array::<16>()?));
            }

            services.push(Service {
                channel,
                name,
                uuids,
            });
        }

        devices.push(Device {
            address,
            name,
            services,
        });
    }

    if reader.remaining() > 0 {
        return Err(CorruptionError::TrailingBytes(reader.remaining()));
    }

    Ok(Topology::from_devices(devices))
}

fn put_name(out: &mut Vec<u8>, name: &str) {
    let name = bounded_name(name);
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CorruptionError> {
        if self.remaining() < len {
            return Err(CorruptionError::Truncated {
                offset: self.offset,
                needed: len - self.remaining(),
            });
        }
        let bytes = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CorruptionError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CorruptionError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CorruptionError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, CorruptionError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn name(&mut self) -> Result<String, CorruptionError> {
        let len = self.u8()? as usize;
        let offset = self.offset;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CorruptionError::InvalidName { offset })
    }

    /// Reject counts whose smallest possible encoding cannot fit.
    fn check_count(
        &self,
        what: &'static str,
        count: usize,
        min_len: usize,
    ) -> Result<(), CorruptionError> {
        match count.checked_mul(min_len) {
            Some(needed) if needed <= self.remaining() => Ok(()),
            _ => Err(CorruptionError::CountOverrun {
                what,
                count,
                offset: self.offset,
            }),
        }
    }
}
