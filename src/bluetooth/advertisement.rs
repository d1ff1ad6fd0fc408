//! Advertisement payload parsing
//!
//! An advertisement is a run of `[length][type][length - 1 bytes]` records.
//! Parsing stops at the first zero length or at a record that runs past the
//! end of the buffer.

use std::collections::HashMap;

use log::trace;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bluetooth::uuids::{expand_uuid16, expand_uuid32};

/// Advertising data types this crate understands
pub mod ad_type {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_UUID16_LIST: u8 = 0x02;
    pub const COMPLETE_UUID16_LIST: u8 = 0x03;
    pub const INCOMPLETE_UUID32_LIST: u8 = 0x04;
    pub const COMPLETE_UUID32_LIST: u8 = 0x05;
    pub const INCOMPLETE_UUID128_LIST: u8 = 0x06;
    pub const COMPLETE_UUID128_LIST: u8 = 0x07;
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const TX_POWER_LEVEL: u8 = 0x0A;
    pub const SERVICE_DATA_UUID16: u8 = 0x16;
    pub const SERVICE_DATA_UUID32: u8 = 0x20;
    pub const SERVICE_DATA_UUID128: u8 = 0x21;
    pub const MANUFACTURER_SPECIFIC_DATA: u8 = 0xFF;
}

/// One length-type-value record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdRecord {
    /// Advertising data type
    pub ad_type: u8,
    /// Payload, `length - 1` bytes
    pub data: Vec<u8>,
}

/// Parsed advertisement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Bytes exactly as received
    pub raw: Vec<u8>,
    /// Records in payload order
    pub records: Vec<AdRecord>,
    /// Flags byte
    pub flags: Option<u8>,
    /// Complete local name, or the shortened one when only that is present
    pub local_name: Option<String>,
    /// Advertised transmit power in dBm
    pub tx_power: Option<i8>,
    /// Manufacturer data by company identifier
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Advertised service UUIDs, short codes expanded
    pub service_uuids: Vec<Uuid>,
    /// Service data by service UUID
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

impl Advertisement {
    /// Parse an advertisement payload
    pub fn parse(raw: &[u8]) -> Self {
        let records = parse_records(raw);
        let mut advertisement = Self {
            raw: raw.to_vec(),
            ..Self::default()
        };

        let mut shortened_name = None;
        for record in &records {
            let data = record.data.as_slice();
            match record.ad_type {
                ad_type::FLAGS => advertisement.flags = data.first().copied(),
                ad_type::INCOMPLETE_UUID16_LIST | ad_type::COMPLETE_UUID16_LIST => {
                    advertisement.service_uuids.extend(
                        data.chunks_exact(2)
                            .map(|c| expand_uuid16(u16::from_be_bytes([c[0], c[1]]))),
                    );
                }
                ad_type::INCOMPLETE_UUID32_LIST | ad_type::COMPLETE_UUID32_LIST => {
                    advertisement.service_uuids.extend(
                        data.chunks_exact(4)
                            .map(|c| expand_uuid32(u32::from_be_bytes([c[0], c[1], c[2], c[3]]))),
                    );
                }
                ad_type::INCOMPLETE_UUID128_LIST | ad_type::COMPLETE_UUID128_LIST => {
                    advertisement
                        .service_uuids
                        .extend(data.chunks_exact(16).filter_map(uuid128_from_le));
                }
                ad_type::SHORTENED_LOCAL_NAME => {
                    shortened_name = Some(String::from_utf8_lossy(data).into_owned());
                }
                ad_type::COMPLETE_LOCAL_NAME => {
                    advertisement.local_name = Some(String::from_utf8_lossy(data).into_owned());
                }
                ad_type::TX_POWER_LEVEL => {
                    advertisement.tx_power = data.first().map(|b| *b as i8);
                }
                ad_type::SERVICE_DATA_UUID16 if data.len() >= 2 => {
                    let uuid = expand_uuid16(u16::from_be_bytes([data[0], data[1]]));
                    advertisement.service_data.insert(uuid, data[2..].to_vec());
                }
                ad_type::SERVICE_DATA_UUID32 if data.len() >= 4 => {
                    let uuid = expand_uuid32(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
                    advertisement.service_data.insert(uuid, data[4..].to_vec());
                }
                ad_type::SERVICE_DATA_UUID128 if data.len() >= 16 => {
                    if let Some(uuid) = uuid128_from_le(&data[..16]) {
                        advertisement.service_data.insert(uuid, data[16..].to_vec());
                    }
                }
                ad_type::MANUFACTURER_SPECIFIC_DATA if data.len() >= 2 => {
                    let company = u16::from_le_bytes([data[0], data[1]]);
                    advertisement
                        .manufacturer_data
                        .insert(company, data[2..].to_vec());
                }
                other => trace!("Skipping advertisement record type 0x{:02X}", other),
            }
        }

        if advertisement.local_name.is_none() {
            advertisement.local_name = shortened_name;
        }
        advertisement.records = records;
        advertisement
    }

    /// First record of the given type
    pub fn record(&self, ad_type: u8) -> Option<&AdRecord> {
        self.records.iter().find(|r| r.ad_type == ad_type)
    }

    /// Whether `service` is in the advertised UUID list
    pub fn advertises_service(&self, service: &Uuid) -> bool {
        self.service_uuids.contains(service)
    }
}

/// Split a payload into records, stopping at a zero length or truncation
pub fn parse_records(raw: &[u8]) -> Vec<AdRecord> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < raw.len() {
        let length = raw[offset] as usize;
        if length == 0 {
            break;
        }
        let end = offset + 1 + length;
        if end > raw.len() {
            trace!(
                "Advertisement record at offset {} claims {} bytes, only {} left",
                offset,
                length,
                raw.len() - offset - 1
            );
            break;
        }
        records.push(AdRecord {
            ad_type: raw[offset + 1],
            data: raw[offset + 2..end].to_vec(),
        });
        offset = end;
    }

    records
}

fn uuid128_from_le(bytes: &[u8]) -> Option<Uuid> {
    let mut be: [u8; 16] = bytes.try_into().ok()?;
    be.reverse();
    Some(Uuid::from_bytes(be))
}

/// Builds advertisement payloads record by record
#[derive(Debug, Clone, Default)]
pub struct AdvertisementBuilder {
    bytes: Vec<u8>,
}

impl AdvertisementBuilder {
    /// Start an empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw record; payloads longer than 254 bytes are truncated
    pub fn record(mut self, ad_type: u8, data: &[u8]) -> Self {
        let data = &data[..data.len().min(254)];
        self.bytes.push((data.len() + 1) as u8);
        self.bytes.push(ad_type);
        self.bytes.extend_from_slice(data);
        self
    }

    /// Append a flags record
    pub fn flags(self, flags: u8) -> Self {
        self.record(ad_type::FLAGS, &[flags])
    }

    /// Append a complete local name
    pub fn local_name(self, name: &str) -> Self {
        self.record(ad_type::COMPLETE_LOCAL_NAME, name.as_bytes())
    }

    /// Append a transmit power record
    pub fn tx_power(self, power: i8) -> Self {
        self.record(ad_type::TX_POWER_LEVEL, &[power as u8])
    }

    /// Append manufacturer data for `company`
    pub fn manufacturer_data(self, company: u16, payload: &[u8]) -> Self {
        let mut data = company.to_le_bytes().to_vec();
        data.extend_from_slice(payload);
        self.record(ad_type::MANUFACTURER_SPECIFIC_DATA, &data)
    }

    /// Append a complete list of 16-bit service short codes
    pub fn services16(self, codes: &[u16]) -> Self {
        let data: Vec<u8> = codes.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.record(ad_type::COMPLETE_UUID16_LIST, &data)
    }

    /// Append a complete list of 128-bit service UUIDs
    pub fn services128(self, uuids: &[Uuid]) -> Self {
        let data: Vec<u8> = uuids
            .iter()
            .flat_map(|uuid| {
                let mut bytes = *uuid.as_bytes();
                bytes.reverse();
                bytes
            })
            .collect();
        self.record(ad_type::COMPLETE_UUID128_LIST, &data)
    }

    /// Append service data keyed by a 128-bit UUID
    pub fn service_data(self, uuid: &Uuid, payload: &[u8]) -> Self {
        let mut data = *uuid.as_bytes();
        data.reverse();
        let mut data = data.to_vec();
        data.extend_from_slice(payload);
        self.record(ad_type::SERVICE_DATA_UUID128, &data)
    }

    /// Finish the payload
    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}
