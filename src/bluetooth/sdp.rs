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

//! SDP request encoding and response parsing.
//!
//! Only what a service search needs: ServiceSearchAttributeRequest PDUs,
//! continuation handling and the data element format.

use anyhow::{anyhow, bail, Result};
use uuid::Uuid;

use super::types::{uuid_from_alias, Service, BASE_UUID, MAX_UUIDS, RFCOMM_PROTOCOL_UUID};

/// L2CAP PSM of the SDP server.
pub const SDP_PSM: u16 = 0x0001;

/// PDU identifiers.
pub mod pdu {
    pub const ERROR_RSP: u8 = 0x01;
    pub const SERVICE_SEARCH_ATTR_REQ: u8 = 0x06;
    pub const SERVICE_SEARCH_ATTR_RSP: u8 = 0x07;
}

/// Attribute identifiers.
pub mod attr {
    pub const SERVICE_CLASS_ID_LIST: u16 = 0x0001;
    pub const PROTOCOL_DESCRIPTOR_LIST: u16 = 0x0004;
    /// Primary language base (0x0100) + name offset (0x0000).
    pub const SERVICE_NAME: u16 = 0x0100;
}

/// Largest attribute byte count asked for per response.
pub const MAX_ATTR_BYTES: u16 = 0xffff;

const HEADER_LEN: usize = 5;
const MAX_CONTINUATION: usize = 16;

/// Data element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataElement {
    Nil,
    Uint(u128),
    Int(i128),
    Uuid(Uuid),
    Text(Vec<u8>),
    Bool(bool),
    Sequence(Vec<DataElement>),
    Alternative(Vec<DataElement>),
    Url(Vec<u8>),
}

impl DataElement {
    fn as_uint(&self) -> Option<u128> {
        match self {
            Self::Uint(v) => Some(*v),
            _ => None,
        }
    }

    fn as_sequence(&self) -> Option<&[DataElement]> {
        match self {
            Self::Sequence(items) | Self::Alternative(items) => Some(items),
            _ => None,
        }
    }
}

/// One service record: attribute id / value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpRecord {
    pub attributes: Vec<(u16, DataElement)>,
}

impl SdpRecord {
    pub fn attribute(&self, id: u16) -> Option<&DataElement> {
        self.attributes
            .iter()
            .find(|(attr_id, _)| *attr_id == id)
            .map(|(_, value)| value)
    }

    /// RFCOMM channel from the protocol descriptor list.
    pub fn rfcomm_channel(&self) -> Option<u8> {
        let protocols = self.attribute(attr::PROTOCOL_DESCRIPTOR_LIST)?.as_sequence()?;
        protocols.iter().find_map(|descriptor| {
            let items = descriptor.as_sequence()?;
            match items {
                [DataElement::Uuid(proto), param, ..] if *proto == RFCOMM_PROTOCOL_UUID => {
                    param.as_uint().and_then(|c| u8::try_from(c).ok())
                }
                _ => None,
            }
        })
    }

    pub fn service_name(&self) -> Option<String> {
        match self.attribute(attr::SERVICE_NAME)? {
            DataElement::Text(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                Some(text.trim_end_matches('\0').to_string())
            }
            _ => None,
        }
    }

    pub fn class_ids(&self) -> Vec<Uuid> {
        self.attribute(attr::SERVICE_CLASS_ID_LIST)
            .and_then(DataElement::as_sequence)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        DataElement::Uuid(uuid) => Some(*uuid),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Convert to a [`Service`], if the record carries an RFCOMM channel.
    pub fn to_service(&self) -> Option<Service> {
        let channel = self.rfcomm_channel()?;
        let mut uuids = self.class_ids();
        uuids.truncate(MAX_UUIDS);
        Some(Service::new(
            channel,
            self.service_name().unwrap_or_default(),
            uuids,
        ))
    }
}

/// Build a ServiceSearchAttributeRequest for `pattern`, asking for all
/// attributes.
pub fn search_attr_request(transaction: u16, pattern: &[Uuid], continuation: &[u8]) -> Vec<u8> {
    let mut uuids = Vec::new();
    for uuid in pattern {
        put_uuid(&mut uuids, uuid);
    }

    let mut params = Vec::new();
    put_sequence(&mut params, &uuids);
    params.extend_from_slice(&MAX_ATTR_BYTES.to_be_bytes());
    // One range: 0x0000..=0xffff as a uint32.
    put_sequence(&mut params, &[0x0a, 0x00, 0x00, 0xff, 0xff]);
    params.push(continuation.len() as u8);
    params.extend_from_slice(continuation);

    let mut out = Vec::with_capacity(HEADER_LEN + params.len());
    out.push(pdu::SERVICE_SEARCH_ATTR_REQ);
    out.extend_from_slice(&transaction.to_be_bytes());
    out.extend_from_slice(&(params.len() as u16).to_be_bytes());
    out.extend_from_slice(&params);
    out
}

/// One response fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseChunk {
    pub attribute_bytes: Vec<u8>,
    /// Empty when this was the last fragment.
    pub continuation: Vec<u8>,
}

/// Parse a ServiceSearchAttributeResponse PDU.
pub fn parse_search_attr_response(pdu: &[u8], transaction: u16) -> Result<ResponseChunk> {
    if pdu.len() < HEADER_LEN {
        bail!("SDP PDU too short: {} bytes", pdu.len());
    }
    let id = pdu[0];
    let tid = u16::from_be_bytes([pdu[1], pdu[2]]);
    let param_len = u16::from_be_bytes([pdu[3], pdu[4]]) as usize;
    let params = pdu
        .get(HEADER_LEN..HEADER_LEN + param_len)
        .ok_or_else(|| anyhow!("SDP PDU shorter than its parameter length"))?;

    if tid != transaction {
        bail!("SDP transaction mismatch: sent {}, got {}", transaction, tid);
    }
    match id {
        pdu::SERVICE_SEARCH_ATTR_RSP => {}
        pdu::ERROR_RSP => {
            let code = params
                .get(..2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .unwrap_or(0);
            bail!("SDP error response 0x{:04x}", code);
        }
        other => bail!("Unexpected SDP PDU 0x{:02x}", other),
    }

    if params.len() < 2 {
        bail!("SDP response missing byte count");
    }
    let count = u16::from_be_bytes([params[0], params[1]]) as usize;
    let attribute_bytes = params
        .get(2..2 + count)
        .ok_or_else(|| anyhow!("SDP attribute list truncated"))?
        .to_vec();

    let cont_len = *params
        .get(2 + count)
        .ok_or_else(|| anyhow!("SDP continuation state missing"))? as usize;
    if cont_len > MAX_CONTINUATION {
        bail!("SDP continuation state too long: {}", cont_len);
    }
    let continuation = params
        .get(3 + count..3 + count + cont_len)
        .ok_or_else(|| anyhow!("SDP continuation state truncated"))?
        .to_vec();

    Ok(ResponseChunk {
        attribute_bytes,
        continuation,
    })
}

/// Parse the concatenated attribute lists into records.
pub fn parse_records(bytes: &[u8]) -> Result<Vec<SdpRecord>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let (element, used) = parse_element(bytes)?;
    if used != bytes.len() {
        bail!("{} stray bytes after attribute lists", bytes.len() - used);
    }

    let lists = element
        .as_sequence()
        .ok_or_else(|| anyhow!("attribute lists are not a sequence"))?;

    lists
        .iter()
        .map(|list| {
            let items = list
                .as_sequence()
                .ok_or_else(|| anyhow!("attribute list is not a sequence"))?;
            if items.len() % 2 != 0 {
                bail!("attribute list has an odd number of elements");
            }
            let attributes = items
                .chunks(2)
                .map(|pair| {
                    let id = pair[0]
                        .as_uint()
                        .and_then(|id| u16::try_from(id).ok())
                        .ok_or_else(|| anyhow!("attribute id is not a uint16"))?;
                    Ok((id, pair[1].clone()))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(SdpRecord { attributes })
        })
        .collect()
}

/// Deepest sequence nesting accepted in a response.
pub const MAX_NESTING: usize = 32;

/// Parse one data element, returning it and the bytes consumed.
pub fn parse_element(buf: &[u8]) -> Result<(DataElement, usize)> {
    parse_nested(buf, 0)
}

fn parse_nested(buf: &[u8], depth: usize) -> Result<(DataElement, usize)> {
    if depth > MAX_NESTING {
        bail!("data elements nested deeper than {}", MAX_NESTING);
    }
    let header = *buf.first().ok_or_else(|| anyhow!("empty data element"))?;
    let kind = header >> 3;
    let size_index = header & 0x07;

    let (len, mut offset) = match size_index {
        0 if kind == 0 => (0, 1),
        0 => (1, 1),
        1 => (2, 1),
        2 => (4, 1),
        3 => (8, 1),
        4 => (16, 1),
        5 => (*buf.get(1).ok_or_else(|| anyhow!("missing u8 length"))? as usize, 2),
        6 => {
            let b = buf.get(1..3).ok_or_else(|| anyhow!("missing u16 length"))?;
            (u16::from_be_bytes([b[0], b[1]]) as usize, 3)
        }
        _ => {
            let b = buf.get(1..5).ok_or_else(|| anyhow!("missing u32 length"))?;
            (u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize, 5)
        }
    };

    let body = buf
        .get(offset..offset + len)
        .ok_or_else(|| anyhow!("data element body truncated"))?;

    let element = match kind {
        0 => DataElement::Nil,
        1 => DataElement::Uint(be_uint(body)?),
        2 => {
            let raw = be_uint(body)?;
            let bits = (body.len() * 8) as u32;
            let value = if bits > 0 && bits < 128 {
                // Sign-extend.
                let shift = 128 - bits;
                ((raw << shift) as i128) >> shift
            } else {
                raw as i128
            };
            DataElement::Int(value)
        }
        3 => DataElement::Uuid(match body.len() {
            2 => uuid_from_alias(u16::from_be_bytes([body[0], body[1]]) as u32),
            4 => uuid_from_alias(u32::from_be_bytes([body[0], body[1], body[2], body[3]])),
            16 => Uuid::from_slice(body)?,
            n => bail!("invalid UUID size {}", n),
        }),
        4 => DataElement::Text(body.to_vec()),
        5 => DataElement::Bool(body.first().copied().unwrap_or(0) != 0),
        6 | 7 => {
            let mut items = Vec::new();
            let mut pos = 0;
            while pos < body.len() {
                let (item, used) = parse_nested(&body[pos..], depth + 1)?;
                items.push(item);
                pos += used;
            }
            if kind == 6 {
                DataElement::Sequence(items)
            } else {
                DataElement::Alternative(items)
            }
        }
        8 => DataElement::Url(body.to_vec()),
        other => bail!("unknown data element type {}", other),
    };

    offset += len;
    Ok((element, offset))
}

fn be_uint(body: &[u8]) -> Result<u128> {
    if body.len() > 16 {
        bail!("integer wider than 128 bits");
    }
    Ok(body.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128))
}

fn put_uuid(out: &mut Vec<u8>, uuid: &Uuid) {
    let value = uuid.as_u128();
    let alias = (value >> 96) as u32;
    if value & !(0xffff_ffffu128 << 96) == BASE_UUID.as_u128() && alias <= 0xffff {
        out.push(0x19);
        out.extend_from_slice(&(alias as u16).to_be_bytes());
    } else {
        out.push(0x1c);
        out.extend_from_slice(uuid.as_bytes());
    }
}

fn put_sequence(out: &mut Vec<u8>, body: &[u8]) {
    if body.len() <= u8::MAX as usize {
        out.push(0x35);
        out.push(body.len() as u8);
    } else {
        out.push(0x36);
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(body);
}
