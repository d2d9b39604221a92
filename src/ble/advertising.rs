//! Advertising data parsing.
//!
//! Manufacturer-data payloads are handled in platform form: the two-byte
//! company identifier comes first, followed by the product bytes.

use bytes::Bytes;
use std::fmt;
use uuid::Uuid;

/// Legacy Honey product identifier.
pub const LEGACY_HONEY_ID: u16 = 0x0E0A;
/// Legacy Finder product identifier.
pub const LEGACY_FINDER_ID: u16 = 0x0E0E;
/// Legacy Card product identifier.
pub const LEGACY_CARD_ID: u16 = 0x0E05;
/// Legacy Finder 2 product identifier.
pub const LEGACY_FINDER2_ID: u16 = 0x0E06;
/// Legacy Found (cellular) product identifier.
pub const LEGACY_FOUND_ID: u16 = 0x0E07;

/// MFi card identifier (byte 2).
pub const MFI_CARD_ID: u8 = 0x02;
/// MFi clip identifier.
pub const MFI_CLIP_ID: u8 = 0x03;
/// MFi tag identifier.
pub const MFI_TAG_ID: u8 = 0x04;
/// MFi white identifier.
pub const MFI_WHITE_ID: u8 = 0x05;
/// MFi green identifier.
pub const MFI_GREEN_ID: u8 = 0x06;
/// MFi R4K tag identifier.
pub const MFI_R4K_TAG_ID: u8 = 0x0D;
/// MFi card V2 identifier.
pub const MFI_CARD_V2_ID: u8 = 0x22;
/// MFi clip V2 identifier.
pub const MFI_CLIP_V2_ID: u8 = 0x23;
/// MFi tag V2 identifier.
pub const MFI_TAG_V2_ID: u8 = 0x24;

/// Payloads of this length or shorter carry no product information.
pub const MIN_PAYLOAD_LEN: usize = 6;

const LEGACY_IDS: [u16; 5] = [
    LEGACY_HONEY_ID,
    LEGACY_FINDER_ID,
    LEGACY_CARD_ID,
    LEGACY_FINDER2_ID,
    LEGACY_FOUND_ID,
];

/// Legacy product identifier, if the first two bytes name one.
pub fn legacy_product_id(data: &[u8]) -> Option<u16> {
    let id = u16::from_be_bytes([*data.first()?, *data.get(1)?]);
    LEGACY_IDS.contains(&id).then_some(id)
}

/// Read a little-endian u16 at `offset`.
pub(crate) fn read_u16_le(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes([*data.get(offset)?, *data.get(offset + 1)?]))
}

/// Hardware model identifier carried in the advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModelId(pub u16);

impl ModelId {
    /// Extract the model identifier from a manufacturer-data payload.
    pub fn from_manufacturer_data(data: &[u8]) -> Option<Self> {
        if data.len() <= MIN_PAYLOAD_LEN {
            return None;
        }
        if let Some(id) = legacy_product_id(data) {
            return Some(Self(id));
        }
        if data.len() > 11 {
            return Some(Self(u16::from(data[2])));
        }
        None
    }

    /// Get the raw value.
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// One advertisement as delivered by the radio.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Advertisement {
    /// Manufacturer data including the company identifier prefix.
    pub manufacturer_data: Bytes,
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

impl Advertisement {
    /// Create an advertisement from a manufacturer-data payload.
    pub fn new(manufacturer_data: impl Into<Bytes>) -> Self {
        Self {
            manufacturer_data: manufacturer_data.into(),
            ..Default::default()
        }
    }

    /// Attach the advertised local name.
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Model identifier, if the payload carries one.
    pub fn model_id(&self) -> Option<ModelId> {
        ModelId::from_manufacturer_data(&self.manufacturer_data)
    }
}

/// Broadcast rate the device currently advertises at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdvertisementState {
    /// Fast, active broadcast.
    High,
    /// Slow broadcast; the device has gone to sleep.
    Low,
    /// Not reported by this variant.
    #[default]
    Unknown,
}

impl AdvertisementState {
    /// Check if the device is broadcasting slowly and may need waking.
    pub fn is_low_power(&self) -> bool {
        matches!(self, Self::Low)
    }
}

/// Button gesture reported in the advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ButtonState {
    /// No press.
    #[default]
    None,
    /// Single press.
    SinglePress,
    /// Double press.
    DoublePress,
    /// Triple press.
    TriplePress,
    /// Quadruple press.
    QuadruplePress,
    /// Quintuple press.
    QuintuplePress,
    /// Long press.
    LongPress,
    /// Double press followed by a hold.
    DoublePressHold,
    /// Triple press followed by a hold.
    TriplePressHold,
}

impl ButtonState {
    /// Decode the two-bit button field of legacy status bytes.
    pub fn from_legacy_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0b01 => Self::SinglePress,
            0b10 => Self::LongPress,
            0b11 => Self::DoublePress,
            _ => Self::None,
        }
    }

    /// Decode the MFi button code; unknown codes yield `None`.
    pub fn from_mfi_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::SinglePress),
            2 => Some(Self::DoublePress),
            3 => Some(Self::TriplePress),
            4 => Some(Self::QuadruplePress),
            5 => Some(Self::QuintuplePress),
            6 => Some(Self::LongPress),
            7 => Some(Self::DoublePressHold),
            8 => Some(Self::TriplePressHold),
            _ => None,
        }
    }
}

/// Whether the device reports it is sounding its buzzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BuzzState {
    /// Silent.
    #[default]
    Idle,
    /// Buzzing.
    Buzzing,
}

/// Pairing state reported by MFi hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BondingState {
    /// Not reported.
    #[default]
    Unknown,
    /// Bonded to a host.
    Bonded,
    /// Available for bonding.
    Unbonded,
}

impl BondingState {
    /// Create from the raw advertisement byte.
    pub fn from_raw(value: u8) -> Self {
        match value {
            0x00 => Self::Bonded,
            0x01 => Self::Unbonded,
            _ => Self::Unknown,
        }
    }
}

/// Network status flags broadcast by V2 hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetworkFlags {
    /// Find My network available.
    pub fmn_available: bool,
    /// Find My Device network available.
    pub fmd_available: bool,
    /// Provisioned on Find My.
    pub fmn_provisioned: bool,
    /// Provisioned on Find My Device.
    pub fmd_provisioned: bool,
    /// Network active, high bit.
    pub network_active_msb: bool,
    /// Network active, low bit.
    pub network_active_lsb: bool,
    /// Management protocol unlocked.
    pub smp_unlocked: bool,
}

impl NetworkFlags {
    /// Decode the V2 status byte. Bit 0 is the bonding bit and is not part of
    /// the flags.
    pub fn from_status_byte(byte: u8) -> Self {
        Self {
            fmn_available: byte & 0x80 != 0,
            fmd_available: byte & 0x40 != 0,
            fmn_provisioned: byte & 0x20 != 0,
            fmd_provisioned: byte & 0x10 != 0,
            network_active_msb: byte & 0x08 != 0,
            network_active_lsb: byte & 0x04 != 0,
            smp_unlocked: byte & 0x02 != 0,
        }
    }
}

/// Fields decoded from an advertisement by a protocol handler.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisementInfo {
    /// Broadcast rate.
    pub state: AdvertisementState,
    /// Battery level (0-100).
    pub battery_percent: Option<f64>,
    /// Button gesture.
    pub button: Option<ButtonState>,
    /// Buzzer state.
    pub buzz: Option<BuzzState>,
    /// Bonding state.
    pub bonding: Option<BondingState>,
    /// V2 network flags.
    pub network: Option<NetworkFlags>,
}

/// Status byte shared by Finder, Finder 2 and Card advertisements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyStatus {
    /// Four-bit counter bumped on every button action.
    pub action_sequence: u8,
    /// Buzzer state.
    pub buzz: BuzzState,
    /// Broadcast rate.
    pub state: AdvertisementState,
    /// Button gesture.
    pub button: ButtonState,
}

impl LegacyStatus {
    /// Offset of the status byte in the payload.
    pub const OFFSET: usize = 7;

    /// Decode the status byte.
    pub fn from_byte(byte: u8) -> Self {
        Self {
            action_sequence: byte >> 4,
            buzz: if byte & 0x08 != 0 {
                BuzzState::Buzzing
            } else {
                BuzzState::Idle
            },
            state: if byte & 0x04 != 0 {
                AdvertisementState::Low
            } else {
                AdvertisementState::High
            },
            button: ButtonState::from_legacy_bits(byte),
        }
    }

    /// Decode the status byte from a full payload.
    pub fn parse(data: &[u8]) -> Option<Self> {
        data.get(Self::OFFSET).copied().map(Self::from_byte)
    }
}
