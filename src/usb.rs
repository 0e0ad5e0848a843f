//! USB 2.0 packet identifiers and wire field layouts.
//!
//! Any references in this module refer to the USB 2.0 specification,
//! chapter 8 (Protocol Layer).

use bitfield::bitfield;
use num_enum::{FromPrimitive, IntoPrimitive};

/// Low two bits of a PID select its category. (Table 8-1)
pub const PID_TYPE_MASK: u8 = 0x03;

/// The four PID categories, as encoded in the low two PID bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum PidCategory {
    #[num_enum(default)]
    Special = 0,
    Token = 1,
    Handshake = 2,
    Data = 3,
}

/// The sixteen defined PID values. (Table 8-1)
///
/// The value includes the check field in the upper nibble, so each PID
/// is a full byte. A byte that matches no defined PID maps to
/// `Malformed`; the decoder treats it as an invalid successor but the
/// raw byte is preserved in the packet record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum PID {
    RSVD  = 0xF0,
    OUT   = 0xE1,
    ACK   = 0xD2,
    DATA0 = 0xC3,
    PING  = 0xB4,
    SOF   = 0xA5,
    NYET  = 0x96,
    DATA2 = 0x87,
    SPLIT = 0x78,
    IN    = 0x69,
    NAK   = 0x5A,
    DATA1 = 0x4B,
    ERR   = 0x3C,
    SETUP = 0x2D,
    STALL = 0x1E,
    MDATA = 0x0F,
    #[num_enum(default)]
    Malformed = 0x00,
}

impl Default for PID {
    fn default() -> Self {
        PID::Malformed
    }
}

impl std::fmt::Display for PID {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl PID {
    /// The PID's category, from its low two bits.
    pub fn category(self) -> PidCategory {
        PidCategory::from(u8::from(self) & PID_TYPE_MASK)
    }

    /// Whether this PID opens a transaction: SETUP, IN, OUT or SOF.
    pub fn is_token(self) -> bool {
        self.category() == PidCategory::Token
    }
}

/// Whether a raw PID byte announces a data packet. Applies to the raw
/// byte rather than a recognized PID, so that garbage bytes with the
/// data category bits still route their payload to the data stream.
pub fn byte_is_data(pid: u8) -> bool {
    pid & PID_TYPE_MASK == PidCategory::Data as u8
}

bitfield! {
    /// Contents of a SOF packet after the PID, packed little-endian.
    #[derive(Copy, Clone, Default)]
    pub struct SofFields(u16);
    impl Debug;
    pub u16, frame_number, _: 10, 0;
    pub u8, crc, _: 15, 11;
}

bitfield! {
    /// Contents of a SETUP/IN/OUT token after the PID, packed
    /// little-endian.
    #[derive(Copy, Clone, Default)]
    pub struct TokenFields(u16);
    impl Debug;
    pub u8, device_address, _: 6, 0;
    pub u8, endpoint_number, _: 10, 7;
    pub u8, crc, _: 15, 11;
}

/// Trailing CRC of a data packet, verbatim from the wire.
#[derive(Copy, Clone, Debug, Default)]
pub struct DataFields {
    pub crc: u16,
}

/// Typed view over the PID-specific bytes of a packet record.
#[derive(Copy, Clone, Debug)]
pub enum PacketFields {
    Sof(SofFields),
    Token(TokenFields),
    Data(DataFields),
    None,
}

impl PacketFields {
    /// Interpret two field bytes according to the packet's PID.
    pub fn from_raw(pid: u8, fields: [u8; 2]) -> Self {
        use PID::*;
        let value = u16::from_le_bytes(fields);
        match PID::from(pid) {
            SOF => PacketFields::Sof(SofFields(value)),
            SETUP | IN | OUT | PING => PacketFields::Token(TokenFields(value)),
            DATA0 | DATA1 | DATA2 | MDATA => PacketFields::Data(DataFields { crc: value }),
            _ => PacketFields::None,
        }
    }
}
