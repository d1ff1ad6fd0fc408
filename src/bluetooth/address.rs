//! Device address parsing and serialization helpers

use btleplug::api::BDAddr;

/// Parse a colon separated address such as `AA:BB:CC:DD:EE:FF`
pub fn parse_bdaddr(s: &str) -> Result<BDAddr, String> {
    let bytes: Vec<&str> = s.trim().split(':').collect();

    if bytes.len() != 6 {
        return Err(format!("Invalid BDAddr format: {}", s));
    }

    let mut addr = [0u8; 6];
    for (i, byte) in bytes.iter().enumerate() {
        if byte.len() != 2 {
            return Err(format!("Invalid hex byte '{}' in {}", byte, s));
        }
        addr[i] = u8::from_str_radix(byte, 16)
            .map_err(|e| format!("Invalid hex byte '{}': {}", byte, e))?;
    }

    Ok(BDAddr::from(addr))
}

/// Serde adapter storing a `BDAddr` as its string form
pub mod bdaddr_serde {
    use btleplug::api::BDAddr;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bdaddr: &BDAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        bdaddr.to_string().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BDAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let addr_str = String::deserialize(deserializer)?;
        super::parse_bdaddr(&addr_str).map_err(D::Error::custom)
    }
}
