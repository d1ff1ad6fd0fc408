//! Well-known UUIDs and short-code expansion onto the Bluetooth base UUID

use uuid::Uuid;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`
pub const BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805F9B34FB);

/// Client characteristic configuration descriptor (0x2902)
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = expand_uuid16(0x2902);

/// Serial port profile (0x1101)
pub const SERIAL_PORT_PROFILE: Uuid = expand_uuid16(0x1101);

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value enabling indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// CCCD value disabling notifications and indications
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

const BASE_MASK: u128 = 0x00000000_FFFF_FFFF_FFFF_FFFFFFFFFFFF;

/// Expand a 16-bit short code into its full 128-bit form
pub const fn expand_uuid16(short: u16) -> Uuid {
    expand_uuid32(short as u32)
}

/// Expand a 32-bit short code into its full 128-bit form
pub const fn expand_uuid32(short: u32) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BASE_UUID.as_u128())
}

/// The 16-bit short code of a UUID derived from the base UUID
pub fn short_code(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & BASE_MASK != BASE_UUID.as_u128() {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

/// Parse a UUID string, accepting 4- and 8-digit short codes
pub fn parse_uuid(input: &str) -> Result<Uuid, uuid::Error> {
    let trimmed = input.trim().trim_start_matches("0x");
    match trimmed.len() {
        4 => Uuid::parse_str(&format!("0000{}-0000-1000-8000-00805f9b34fb", trimmed)),
        8 => Uuid::parse_str(&format!("{}-0000-1000-8000-00805f9b34fb", trimmed)),
        _ => Uuid::parse_str(trimmed),
    }
}
