//! Definitions of manufacturer info message content.
//!
//! See [6.5.5].
use heapless::Vec;

/// The maximum length of the manufacturer string.
pub const MAX_STRING_LENGTH: usize = 22;

/// Targets of a get-manufacturer-info request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InfoTarget {
    /// The port itself.
    Port,
    /// A battery, selected by the request's reference field.
    Battery,
    /// Reserved target.
    Reserved,
}

impl From<u8> for InfoTarget {
    fn from(value: u8) -> Self {
        match value {
            0 => InfoTarget::Port,
            1 => InfoTarget::Battery,
            _ => InfoTarget::Reserved,
        }
    }
}

impl From<InfoTarget> for u8 {
    fn from(value: InfoTarget) -> Self {
        match value {
            InfoTarget::Port => 0,
            InfoTarget::Battery => 1,
            InfoTarget::Reserved => 0xff,
        }
    }
}

/// A get-manufacturer-info request.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GetManufacturerInfo {
    /// The target that information is requested about.
    pub target: u8,
    /// The battery reference, when the target is a battery.
    pub reference: u8,
}

impl GetManufacturerInfo {
    /// The serialized size in bytes.
    pub const SIZE: usize = 2;

    /// Store the request in a binary buffer, returning the written size in number of bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        buf[0] = self.target;
        buf[1] = self.reference;
        Self::SIZE
    }

    /// Parse a request from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            target: buf.first().copied().unwrap_or_default(),
            reference: buf.get(1).copied().unwrap_or_default(),
        }
    }
}

/// A manufacturer info response.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManufacturerInfo {
    /// USB vendor ID.
    pub vid: u16,
    /// USB product ID.
    pub pid: u16,
    /// Vendor defined manufacturer string.
    pub string: Vec<u8, MAX_STRING_LENGTH>,
}

impl ManufacturerInfo {
    /// Store the response in a binary buffer, returning the written size in number of bytes.
    pub fn to_bytes(&self, buf: &mut [u8]) -> usize {
        buf[0] = (self.vid & 0xff) as u8;
        buf[1] = (self.vid >> 8) as u8;
        buf[2] = (self.pid & 0xff) as u8;
        buf[3] = (self.pid >> 8) as u8;
        buf[4..4 + self.string.len()].copy_from_slice(&self.string);
        4 + self.string.len()
    }

    /// Parse a response from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        if buf.len() < 4 {
            return Self::default();
        }

        Self {
            vid: u16::from_le_bytes([buf[0], buf[1]]),
            pid: u16::from_le_bytes([buf[2], buf[3]]),
            string: buf[4..].iter().copied().take(MAX_STRING_LENGTH).collect(),
        }
    }
}
