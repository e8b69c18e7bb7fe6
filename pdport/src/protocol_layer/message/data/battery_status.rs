//! Definitions of battery status data message content.
//!
//! Sent in response to a get-battery-status request.
use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;

bitfield! {
    /// The battery status data object.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BatteryStatusDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// Battery present capacity in 0.1 Wh units, 0xffff if unknown.
        pub present_capacity: u16 @ 16..=31,
        /// Battery info: invalid reference, present, charging status.
        pub info: u8 @ 8..=15,
    }
}

impl Default for BatteryStatusDataObject {
    fn default() -> Self {
        // Capacity unknown, no battery present.
        Self(0).with_present_capacity(0xffff)
    }
}

impl BatteryStatusDataObject {
    /// Serialize to a binary buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }
}
