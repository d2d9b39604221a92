//! Stable device addresses.
//!
//! Some platforms hide the peripheral MAC behind a per-host identifier, so the
//! address is also recoverable from manufacturer data.

use std::fmt;
use std::str::FromStr;

use crate::ble::advertising::{legacy_product_id, MFI_R4K_TAG_ID};
use crate::error::{Error, Result};

/// A six-byte hardware address used as the primary key for known devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Create an address from raw bytes, most significant first.
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes.
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Uppercase hex digits without separators, e.g. `AABBCCDDEEFF`.
    pub fn to_compact_string(&self) -> String {
        self.0.iter().map(|b| format!("{:02X}", b)).collect()
    }

    /// Beacon major/minor pair derived from the middle and low bytes.
    pub fn beacon_major_minor(&self) -> (u16, u16) {
        let major = u16::from_be_bytes([self.0[2], self.0[3]]);
        let minor = u16::from_be_bytes([self.0[4], self.0[5]]);
        (major, minor)
    }

    /// Recover the address advertised inside a manufacturer-data payload.
    ///
    /// Legacy products carry it in the first six bytes. MFi products carry it
    /// reversed in bytes 5..11, except the R4K tag which splits it between
    /// bytes 8..12 and the tail of its local name.
    pub fn from_advertisement(data: &[u8], local_name: Option<&str>) -> Option<Self> {
        if data.len() < 6 {
            return None;
        }

        if legacy_product_id(data).is_some() {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&data[..6]);
            return Some(Self(bytes));
        }

        if data.len() <= 11 {
            return None;
        }

        if data[2] == MFI_R4K_TAG_ID {
            let name = local_name?;
            let suffix = name.get(name.len().checked_sub(4)?..)?;
            let tail = u16::from_str_radix(suffix, 16).ok()?.to_be_bytes();
            let mut bytes = [0u8; 6];
            for (i, b) in data[8..12].iter().rev().enumerate() {
                bytes[i] = *b;
            }
            bytes[4] = tail[0];
            bytes[5] = tail[1];
            return Some(Self(bytes));
        }

        let mut bytes = [0u8; 6];
        for (i, b) in data[5..11].iter().rev().enumerate() {
            bytes[i] = *b;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidParameter {
            name: "address".to_string(),
            value: s.to_string(),
        };

        let digits: Vec<u8> = s
            .bytes()
            .filter(|c| *c != b':' && *c != b'-')
            .collect();
        if digits.len() != 12 {
            return Err(invalid());
        }

        let mut bytes = [0u8; 6];
        for (i, pair) in digits.chunks(2).enumerate() {
            let pair = std::str::from_utf8(pair).map_err(|_| invalid())?;
            bytes[i] = u8::from_str_radix(pair, 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl From<btleplug::api::BDAddr> for DeviceAddress {
    fn from(addr: btleplug::api::BDAddr) -> Self {
        Self(addr.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_and_display() {
        let addr: DeviceAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(addr.to_compact_string(), "AABBCCDDEEFF");

        let compact: DeviceAddress = "AABBCCDDEEFF".parse().unwrap();
        assert_eq!(addr, compact);

        let dashed: DeviceAddress = "AA-BB-CC-DD-EE-FF".parse().unwrap();
        assert_eq!(addr, dashed);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("AA:BB:CC".parse::<DeviceAddress>().is_err());
        assert!("GG:BB:CC:DD:EE:FF".parse::<DeviceAddress>().is_err());
        assert!("".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn test_beacon_major_minor() {
        let addr: DeviceAddress = "0E0E12345678".parse().unwrap();
        assert_eq!(addr.beacon_major_minor(), (0x1234, 0x5678));
    }

    #[test]
    fn test_legacy_address_from_advertisement() {
        let data = [0x0E, 0x0E, 0x12, 0x34, 0x56, 0x78, 0x00, 0x00];
        let addr = DeviceAddress::from_advertisement(&data, None).unwrap();
        assert_eq!(addr.to_string(), "0E:0E:12:34:56:78");
    }

    #[test]
    fn test_mfi_address_from_advertisement() {
        let data = [
            0x06, 0x00, 0x04, 0x50, 0x00, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x01,
        ];
        let addr = DeviceAddress::from_advertisement(&data, None).unwrap();
        assert_eq!(addr.to_string(), "11:22:33:44:55:66");
    }

    #[test]
    fn test_r4k_address_needs_name() {
        let data = [
            0x06, 0x00, MFI_R4K_TAG_ID, 0x50, 0x00, 0x00, 0x00, 0x00, 0x44, 0x33, 0x22, 0x11,
        ];
        assert!(DeviceAddress::from_advertisement(&data, None).is_none());
        let addr = DeviceAddress::from_advertisement(&data, Some("R4K ABCD")).unwrap();
        assert_eq!(addr.to_string(), "11:22:33:44:AB:CD");
    }

    #[test]
    fn test_short_payload_has_no_address() {
        assert!(DeviceAddress::from_advertisement(&[0x01, 0x02], None).is_none());
    }
}
