//! Definitions of status message content.
//!
//! See [6.5.2].

/// The status data block, sent in response to a get-status request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Status {
    /// Internal temperature in degrees centigrade, zero if not supported.
    pub internal_temperature: u8,
    /// Flags for presently active power inputs.
    pub present_input: u8,
    /// The battery that presently provides power, if any.
    pub present_battery_input: u8,
    /// Event flags (OCP, OTP, OVP, CF).
    pub event_flags: u8,
    /// Temperature status.
    pub temperature_status: u8,
    /// Power status.
    pub power_status: u8,
    /// Power state change.
    pub power_state_change: u8,
}

impl Status {
    /// The serialized size in bytes.
    pub const SIZE: usize = 7;

    /// Store the status data block in a binary buffer, returning the written size in number of bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        buf[0] = self.internal_temperature;
        buf[1] = self.present_input;
        buf[2] = self.present_battery_input;
        buf[3] = self.event_flags;
        buf[4] = self.temperature_status;
        buf[5] = self.power_status;
        buf[6] = self.power_state_change;
        Self::SIZE
    }

    /// Parse a status data block from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut data = [0u8; Self::SIZE];
        let len = buf.len().min(Self::SIZE);
        data[..len].copy_from_slice(&buf[..len]);

        Self {
            internal_temperature: data[0],
            present_input: data[1],
            present_battery_input: data[2],
            event_flags: data[3],
            temperature_status: data[4],
            power_status: data[5],
            power_state_change: data[6],
        }
    }
}

/// The PPS status data block, sent in response to a get-PPS-status request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PpsStatus {
    /// Output voltage in 20 mV units, 0xffff if not supported.
    pub raw_output_voltage: u16,
    /// Output current in 50 mA units, 0xff if not supported.
    pub raw_output_current: u8,
    /// Real-time flags (PTF, OMF).
    pub real_time_flags: u8,
}

impl Default for PpsStatus {
    fn default() -> Self {
        Self {
            raw_output_voltage: 0xffff,
            raw_output_current: 0xff,
            real_time_flags: 0,
        }
    }
}

impl PpsStatus {
    /// The serialized size in bytes.
    pub const SIZE: usize = 4;

    /// Store the PPS status data block in a binary buffer, returning the written size in number of bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        buf[0] = (self.raw_output_voltage & 0xff) as u8;
        buf[1] = (self.raw_output_voltage >> 8) as u8;
        buf[2] = self.raw_output_current;
        buf[3] = self.real_time_flags;
        Self::SIZE
    }

    /// Parse a PPS status data block from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut data = [0u8; Self::SIZE];
        let len = buf.len().min(Self::SIZE);
        data[..len].copy_from_slice(&buf[..len]);

        Self {
            raw_output_voltage: u16::from_le_bytes([data[0], data[1]]),
            raw_output_current: data[2],
            real_time_flags: data[3],
        }
    }
}
