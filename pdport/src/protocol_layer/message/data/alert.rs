//! Definitions of alert data message content.
//!
//! See [6.4.6].
use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;

bitfield! {
    /// The alert data object, sent to notify the port partner of a condition
    /// that it may want to query with a follow-up status request.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct AlertDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// Extended alert event
        pub extended_alert: bool @ 31,
        /// Operating voltage or current has changed
        pub operating_condition_change: bool @ 30,
        /// A source input has changed
        pub source_input_change: bool @ 29,
        /// Over-current protection event
        pub ocp: bool @ 28,
        /// Over-temperature protection event
        pub otp: bool @ 27,
        /// Operating condition change due to temperature
        pub operating_condition_temperature: bool @ 26,
        /// Battery status change
        pub battery_status_change: bool @ 25,
        /// Over-voltage protection event
        pub ovp: bool @ 24,
        /// Fixed batteries with a status change
        pub fixed_batteries: u8 @ 20..=23,
        /// Hot-swappable battery slots with a status change
        pub hot_swappable_batteries: u8 @ 16..=19,
        /// Extended alert event type
        pub extended_alert_type: u8 @ 0..=3,
    }
}

#[allow(clippy::derivable_impls)]
impl Default for AlertDataObject {
    fn default() -> Self {
        Self(0)
    }
}

impl AlertDataObject {
    /// Serialize to a binary buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }
}
