//! Definitions of battery capability message content.
//!
//! See [6.5.4] and [6.5.3].

/// A get-battery-capabilities request.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GetBatteryCap {
    /// The battery that capabilities are requested for.
    pub reference: u8,
}

impl GetBatteryCap {
    /// The serialized size in bytes.
    pub const SIZE: usize = 1;

    /// Store the request in a binary buffer, returning the written size in number of bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        buf[0] = self.reference;
        Self::SIZE
    }

    /// Parse a request from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            reference: buf.first().copied().unwrap_or_default(),
        }
    }
}

/// A get-battery-status request.
///
/// Answered with a battery status data message.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GetBatteryStatus {
    /// The battery that status is requested for.
    pub reference: u8,
}

impl GetBatteryStatus {
    /// The serialized size in bytes.
    pub const SIZE: usize = 1;

    /// Store the request in a binary buffer, returning the written size in number of bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        buf[0] = self.reference;
        Self::SIZE
    }

    /// Parse a request from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            reference: buf.first().copied().unwrap_or_default(),
        }
    }
}

/// A battery capabilities response.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BatteryCapabilities {
    /// USB vendor ID.
    pub vid: u16,
    /// USB product ID.
    pub pid: u16,
    /// Design capacity in 0.1 Wh units, zero if unknown.
    pub design_capacity: u16,
    /// Last full charge capacity in 0.1 Wh units, zero if unknown.
    pub last_full_charge_capacity: u16,
    /// Set when the requested battery reference was invalid.
    pub invalid_reference: bool,
}

impl BatteryCapabilities {
    /// The serialized size in bytes.
    pub const SIZE: usize = 9;

    /// Store the response in a binary buffer, returning the written size in number of bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        buf[..2].copy_from_slice(&self.vid.to_le_bytes());
        buf[2..4].copy_from_slice(&self.pid.to_le_bytes());
        buf[4..6].copy_from_slice(&self.design_capacity.to_le_bytes());
        buf[6..8].copy_from_slice(&self.last_full_charge_capacity.to_le_bytes());
        buf[8] = self.invalid_reference as u8;
        Self::SIZE
    }

    /// Parse a response from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut data = [0u8; Self::SIZE];
        let len = buf.len().min(Self::SIZE);
        data[..len].copy_from_slice(&buf[..len]);

        Self {
            vid: u16::from_le_bytes([data[0], data[1]]),
            pid: u16::from_le_bytes([data[2], data[3]]),
            design_capacity: u16::from_le_bytes([data[4], data[5]]),
            last_full_charge_capacity: u16::from_le_bytes([data[6], data[7]]),
            invalid_reference: data[8] & 1 != 0,
        }
    }
}
