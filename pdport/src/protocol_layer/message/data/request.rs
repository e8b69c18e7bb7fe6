//! Definitions of request message content, and capability evaluation.
//!
//! Request data objects are built by the sink from the most recently received
//! source capabilities, and validated by the source against its advertised
//! capabilities.
use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;
use uom::si::electric_current::centiampere;

use super::source_capabilities::{self, Augmented, PowerDataObject, SourceCapabilities};
use crate::_20millivolts_mod::_20millivolts;
use crate::_50milliamperes_mod::_50milliamperes;
use crate::_250milliwatts_mod::_250milliwatts;
use crate::Contract;
use crate::units::{ElectricCurrent, ElectricPotential, Power};

bitfield! {
    /// A raw request data object, used before the requested kind is known.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct RawDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
    }
}

bitfield! {
    /// A request data object towards a fixed or variable supply.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FixedVariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
        /// GiveBack flag
        pub giveback_flag: bool @ 27,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable
        pub epr_mode_capable: bool @ 22,
        /// Operating current in 10mA units
        pub raw_operating_current: u16 @ 10..=19,
        /// Maximum operating current in 10mA units
        pub raw_max_operating_current: u16 @ 0..=9,
    }
}

impl FixedVariableSupply {
    /// Serialize to a binary buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_operating_current().into())
    }

    /// The maximum current under which the sink can operate.
    pub fn max_operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_operating_current().into())
    }
}

bitfield! {
    /// A request data object towards a battery supply.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Battery(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
        /// GiveBack flag
        pub giveback_flag: bool @ 27,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable
        pub epr_mode_capable: bool @ 22,
        /// Operating power in 250mW units
        pub raw_operating_power: u16 @ 10..=19,
        /// Maximum operating power in 250mW units
        pub raw_max_operating_power: u16 @ 0..=9,
    }
}

impl Battery {
    /// Serialize to a binary buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested operating power.
    pub fn operating_power(&self) -> Power {
        Power::new::<_250milliwatts>(self.raw_operating_power().into())
    }
}

bitfield!(
    /// A request data object towards a programmable power supply.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Pps(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable
        pub epr_mode_capable: bool @ 22,
        /// Output voltage in 20mV units
        pub raw_output_voltage: u16 @ 9..=20,
        /// Operating current in 50mA units
        pub raw_operating_current: u16 @ 0..=6,
    }
);

impl Pps {
    /// Serialize to a binary buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested output voltage.
    pub fn output_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_20millivolts>(self.raw_output_voltage().into())
    }

    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<_50milliamperes>(self.raw_operating_current().into())
    }
}

bitfield!(
    /// A request data object towards an EPR adjustable voltage supply.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Avs(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable
        pub epr_mode_capable: bool @ 22,
        /// Output voltage in 20mV units
        pub raw_output_voltage: u16 @ 9..=20,
        /// Operating current in 50mA units
        pub raw_operating_current: u16 @ 0..=6,
    }
);

impl Avs {
    /// Serialize to a binary buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested output voltage.
    pub fn output_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_20millivolts>(self.raw_output_voltage().into())
    }

    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<_50milliamperes>(self.raw_operating_current().into())
    }
}

/// Power requests towards the source.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerSourceRequest {
    /// Request towards a fixed or variable supply.
    FixedVariableSupply(FixedVariableSupply),
    /// Request towards a battery supply.
    Battery(Battery),
    /// Request towards a programmable power supply.
    Pps(Pps),
    /// Request towards an EPR adjustable voltage supply.
    Avs(Avs),
    /// Request of unknown kind.
    Unknown(RawDataObject),
}

/// Errors that can occur during sink requests towards the source.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A requested (specific) voltage does not exist in the PDOs.
    VoltageMismatch,
}

/// Requestable voltage levels.
#[derive(Debug)]
pub enum VoltageRequest {
    /// The safe 5 V supply.
    Safe5V,
    /// The highest voltage that the source can supply.
    Highest,
    /// A specific voltage.
    Specific(ElectricPotential),
}

/// Requestable currents.
#[derive(Debug)]
pub enum CurrentRequest {
    /// The highest current that the source can supply.
    Highest,
    /// A specific current.
    Specific(ElectricCurrent),
}

/// Power limits of a sink, used for deterministic capability evaluation.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SinkPowerPreferences {
    /// The highest supply voltage that the sink accepts.
    pub max_voltage: ElectricPotential,
    /// The highest current that the sink draws.
    pub max_current: ElectricCurrent,
    /// The power that the sink would like to operate at.
    ///
    /// If no acceptable PDO reaches this power, the request carries the
    /// capability mismatch flag.
    pub operating_power: Power,
}

impl PowerSourceRequest {
    /// The object position that the request refers to.
    pub fn object_position(&self) -> u8 {
        match self {
            PowerSourceRequest::FixedVariableSupply(p) => p.object_position(),
            PowerSourceRequest::Battery(p) => p.object_position(),
            PowerSourceRequest::Pps(p) => p.object_position(),
            PowerSourceRequest::Avs(p) => p.object_position(),
            PowerSourceRequest::Unknown(p) => p.object_position(),
        }
    }

    /// Whether the request carries the capability mismatch flag.
    pub fn capability_mismatch(&self) -> bool {
        match self {
            PowerSourceRequest::FixedVariableSupply(p) => p.capability_mismatch(),
            PowerSourceRequest::Battery(p) => p.capability_mismatch(),
            PowerSourceRequest::Pps(p) => p.capability_mismatch(),
            PowerSourceRequest::Avs(p) => p.capability_mismatch(),
            PowerSourceRequest::Unknown(_) => false,
        }
    }

    /// The raw 32 bit representation of the request data object.
    pub fn to_raw(self) -> u32 {
        match self {
            PowerSourceRequest::FixedVariableSupply(p) => p.0,
            PowerSourceRequest::Battery(p) => p.0,
            PowerSourceRequest::Pps(p) => p.0,
            PowerSourceRequest::Avs(p) => p.0,
            PowerSourceRequest::Unknown(p) => p.0,
        }
    }

    /// Find the highest fixed voltage that can be found in the source capabilities.
    ///
    /// Reports the index of the found PDO, and the fixed supply instance, or `None` if there is no fixed supply PDO.
    fn find_highest_fixed_voltage(
        source_capabilities: &SourceCapabilities,
    ) -> Option<(usize, &source_capabilities::FixedSupply)> {
        let mut selected_pdo = None;

        for (index, cap) in source_capabilities.pdos().iter().enumerate() {
            if let PowerDataObject::FixedSupply(fixed_supply) = cap {
                selected_pdo = match selected_pdo {
                    None => Some((index, fixed_supply)),
                    Some(x) => {
                        if fixed_supply.voltage() > x.1.voltage() {
                            Some((index, fixed_supply))
                        } else {
                            selected_pdo
                        }
                    }
                };
            }
        }

        selected_pdo
    }

    /// Find a specific fixed voltage within the source capabilities.
    fn find_specific_fixed_voltage(
        source_capabilities: &SourceCapabilities,
        voltage: ElectricPotential,
    ) -> Option<(usize, &source_capabilities::FixedSupply)> {
        for (index, cap) in source_capabilities.pdos().iter().enumerate() {
            if let PowerDataObject::FixedSupply(fixed_supply) = cap {
                if fixed_supply.voltage() == voltage {
                    return Some((index, fixed_supply));
                }
            }
        }

        None
    }

    /// Find a PPS supply that covers the requested voltage.
    fn find_pps_voltage(
        source_capabilities: &SourceCapabilities,
        voltage: ElectricPotential,
    ) -> Option<(usize, &Augmented)> {
        for (index, cap) in source_capabilities.pdos().iter().enumerate() {
            let PowerDataObject::Augmented(augmented) = cap else {
                continue;
            };

            match augmented {
                Augmented::Spr(spr) => {
                    if spr.min_voltage() <= voltage && spr.max_voltage() >= voltage {
                        return Some((index, augmented));
                    }
                }
                _ => trace!("Skip PDO, only SPR programmable supplies are requestable here"),
            };
        }

        trace!("Could not find suitable PPS voltage");
        None
    }

    fn fixed_request(index: usize, current: ElectricCurrent, mismatch: bool) -> Self {
        let mut raw_current = current.get::<centiampere>() as u16;

        if raw_current > 0x3ff {
            error!("Clamping invalid current: {} mA", 10 * raw_current);
            raw_current = 0x3ff;
        }

        let object_position = (index + 1) as u8;
        debug_assert!(object_position > 0b0000 && object_position <= 0b1110);

        Self::FixedVariableSupply(
            FixedVariableSupply(0)
                .with_raw_operating_current(raw_current)
                .with_raw_max_operating_current(raw_current)
                .with_object_position(object_position)
                .with_capability_mismatch(mismatch)
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        )
    }

    /// Create a new power source request for a fixed supply.
    ///
    /// Finds a suitable PDO by evaluating the provided current and voltage requests against the source capabilities.
    pub fn new_fixed(
        current_request: CurrentRequest,
        voltage_request: VoltageRequest,
        source_capabilities: &SourceCapabilities,
    ) -> Result<Self, Error> {
        let selected = match voltage_request {
            VoltageRequest::Safe5V => source_capabilities.vsafe_5v().map(|supply| (0, supply)),
            VoltageRequest::Highest => Self::find_highest_fixed_voltage(source_capabilities),
            VoltageRequest::Specific(x) => Self::find_specific_fixed_voltage(source_capabilities, x),
        };

        let Some((index, supply)) = selected else {
            return Err(Error::VoltageMismatch);
        };

        let (current, mismatch) = match current_request {
            CurrentRequest::Highest => (supply.max_current(), false),
            CurrentRequest::Specific(x) => (Ord::min(x, supply.max_current()), x > supply.max_current()),
        };

        Ok(Self::fixed_request(index, current, mismatch))
    }

    /// Create a new power source request for a programmable power supply (PPS).
    ///
    /// If no PDO covers the requested voltage, an error is returned.
    pub fn new_pps(
        current_request: CurrentRequest,
        voltage: ElectricPotential,
        source_capabilities: &SourceCapabilities,
    ) -> Result<Self, Error> {
        let Some((index, supply)) = Self::find_pps_voltage(source_capabilities, voltage) else {
            return Err(Error::VoltageMismatch);
        };

        let max_current = match supply {
            Augmented::Spr(spr) => spr.max_current(),
            _ => unreachable!(),
        };

        let (current, mismatch) = match current_request {
            CurrentRequest::Highest => (max_current, false),
            CurrentRequest::Specific(x) => (Ord::min(x, max_current), x > max_current),
        };

        let mut raw_current = current.get::<_50milliamperes>() as u16;

        if raw_current > 0x7f {
            error!("Clamping invalid current: {} mA", 50 * raw_current);
            raw_current = 0x7f;
        }

        let raw_voltage = voltage.get::<_20millivolts>() as u16;

        let object_position = (index + 1) as u8;
        debug_assert!(object_position > 0b0000 && object_position <= 0b1110);

        Ok(Self::Pps(
            Pps(0)
                .with_raw_output_voltage(raw_voltage)
                .with_raw_operating_current(raw_current)
                .with_object_position(object_position)
                .with_capability_mismatch(mismatch)
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        ))
    }

    /// Evaluate source capabilities against sink power limits.
    ///
    /// Selects the fixed supply PDO with the highest usable power, where
    /// usable power is the PDO voltage times the lower of the PDO's and the
    /// sink's current limit. PDOs above the sink's voltage limit are skipped.
    /// Between PDOs of equal usable power, the one advertised first wins, so
    /// that evaluation is deterministic for a fixed capability list.
    ///
    /// Falls back to the vSafe5V supply when no other PDO is acceptable. The
    /// capability mismatch flag is set when the usable power falls short of
    /// the sink's desired operating power.
    pub fn evaluate_capabilities(
        preferences: &SinkPowerPreferences,
        source_capabilities: &SourceCapabilities,
    ) -> Result<Self, Error> {
        let mut selected: Option<(usize, Power, ElectricCurrent)> = None;

        for (index, cap) in source_capabilities.pdos().iter().enumerate() {
            let PowerDataObject::FixedSupply(supply) = cap else {
                continue;
            };

            if supply.voltage() > preferences.max_voltage {
                continue;
            }

            let current = Ord::min(supply.max_current(), preferences.max_current);
            let power = supply.voltage() * current;

            let better = match &selected {
                None => true,
                Some((_, best_power, _)) => power > *best_power,
            };

            if better {
                selected = Some((index, power, current));
            }
        }

        let Some((index, power, current)) = selected else {
            // No acceptable PDO. Request vSafe5V and flag the mismatch.
            let Some(supply) = source_capabilities.vsafe_5v() else {
                return Err(Error::VoltageMismatch);
            };

            let current = Ord::min(supply.max_current(), preferences.max_current);
            return Ok(Self::fixed_request(0, current, true));
        };

        let mismatch = power < preferences.operating_power;
        Ok(Self::fixed_request(index, current, mismatch))
    }

    /// Validate this request against advertised source capabilities.
    ///
    /// A request is acceptable when its object position refers to an
    /// advertised PDO and the requested operating point does not exceed what
    /// that PDO offers. The capability mismatch flag does not make a request
    /// invalid.
    pub fn is_satisfiable(&self, source_capabilities: &SourceCapabilities) -> bool {
        let position = self.object_position();
        if position == 0 {
            return false;
        }

        let Some(pdo) = source_capabilities.pdos().get((position - 1) as usize) else {
            return false;
        };

        match (self, pdo) {
            (PowerSourceRequest::FixedVariableSupply(request), PowerDataObject::FixedSupply(supply)) => {
                request.operating_current() <= supply.max_current()
            }
            (PowerSourceRequest::FixedVariableSupply(request), PowerDataObject::VariableSupply(supply)) => {
                request.operating_current() <= supply.max_current()
            }
            (PowerSourceRequest::Battery(request), PowerDataObject::Battery(supply)) => {
                request.operating_power() <= supply.max_power()
            }
            (PowerSourceRequest::Pps(request), PowerDataObject::Augmented(Augmented::Spr(supply))) => {
                request.operating_current() <= supply.max_current()
                    && request.output_voltage() >= supply.min_voltage()
                    && request.output_voltage() <= supply.max_voltage()
            }
            (PowerSourceRequest::Avs(request), PowerDataObject::Augmented(Augmented::Epr(supply))) => {
                request.output_voltage() >= supply.min_voltage() && request.output_voltage() <= supply.max_voltage()
            }
            _ => false,
        }
    }

    /// The operating conditions that this request establishes, given the
    /// capabilities it was built against.
    pub fn operating_conditions(&self, source_capabilities: &SourceCapabilities) -> Option<Contract> {
        let position = self.object_position();
        let pdo = source_capabilities.pdos().get(position.checked_sub(1)? as usize)?;

        match (self, pdo) {
            (PowerSourceRequest::FixedVariableSupply(request), PowerDataObject::FixedSupply(supply)) => {
                Some(Contract {
                    voltage: supply.voltage(),
                    current: request.operating_current(),
                })
            }
            (PowerSourceRequest::FixedVariableSupply(request), PowerDataObject::VariableSupply(supply)) => {
                Some(Contract {
                    voltage: supply.max_voltage(),
                    current: request.operating_current(),
                })
            }
            (PowerSourceRequest::Pps(request), _) => Some(Contract {
                voltage: request.output_voltage(),
                current: request.operating_current(),
            }),
            (PowerSourceRequest::Avs(request), _) => Some(Contract {
                voltage: request.output_voltage(),
                current: request.operating_current(),
            }),
            _ => None,
        }
    }
}

/// An EPR mode request.
///
/// Carries the request data object, followed by a copy of the PDO that the
/// request refers to.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EprRequest {
    /// The request data object.
    pub request: PowerSourceRequest,
    /// The PDO that the request was built from.
    pub pdo: PowerDataObject,
}

impl EprRequest {
    /// Create a new EPR request.
    pub fn new(request: PowerSourceRequest, pdo: PowerDataObject) -> Self {
        Self { request, pdo }
    }

    /// Serialize to a binary buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.request.to_raw());
        LittleEndian::write_u32(&mut buf[4..], self.pdo.to_raw());
        8
    }
}

/// Parse a raw request data object into a typed request.
///
/// The kind of request is determined by the PDO that its object position
/// refers to, which is why the source capabilities are required.
pub fn parse_raw_request(raw: u32, source_capabilities: Option<&SourceCapabilities>) -> PowerSourceRequest {
    use super::source_capabilities::Kind;

    let request = RawDataObject(raw);

    let kind = source_capabilities.and_then(|caps| {
        use super::PdoState;
        caps.pdo_at_object_position(request.object_position())
    });

    match kind {
        Some(Kind::FixedSupply) | Some(Kind::VariableSupply) => {
            PowerSourceRequest::FixedVariableSupply(FixedVariableSupply(raw))
        }
        Some(Kind::Battery) => PowerSourceRequest::Battery(Battery(raw)),
        Some(Kind::Pps) => PowerSourceRequest::Pps(Pps(raw)),
        Some(Kind::Avs) => PowerSourceRequest::Avs(Avs(raw)),
        None => PowerSourceRequest::Unknown(request),
    }
}

#[cfg(test)]
mod tests {
    use uom::si::electric_current::ampere;
    use uom::si::electric_potential::volt;
    use uom::si::power::watt;

    use super::{PowerSourceRequest, SinkPowerPreferences, parse_raw_request};
    use crate::protocol_layer::message::data::source_capabilities::{FixedSupply, PowerDataObject, SourceCapabilities};
    use crate::units::{ElectricCurrent, ElectricPotential, Power};

    fn fixed(voltage_50mv: u16, current_10ma: u16) -> PowerDataObject {
        PowerDataObject::FixedSupply(
            FixedSupply::default()
                .with_raw_voltage(voltage_50mv)
                .with_raw_max_current(current_10ma),
        )
    }

    /// 5 V / 3 A and 9 V / 2 A fixed supplies.
    fn capabilities() -> SourceCapabilities {
        SourceCapabilities::new(&[fixed(100, 300), fixed(180, 200)])
    }

    fn preferences() -> SinkPowerPreferences {
        SinkPowerPreferences {
            max_voltage: ElectricPotential::new::<volt>(9),
            max_current: ElectricCurrent::new::<ampere>(3),
            operating_power: Power::new::<watt>(18),
        }
    }

    #[test]
    fn evaluation_selects_highest_usable_power() {
        let request = PowerSourceRequest::evaluate_capabilities(&preferences(), &capabilities()).unwrap();

        let PowerSourceRequest::FixedVariableSupply(request) = request else {
            panic!("Expected a fixed supply request");
        };

        // 9 V * 2 A beats 5 V * 3 A.
        assert_eq!(request.object_position(), 2);
        assert_eq!(request.raw_operating_current(), 200);
        assert!(!request.capability_mismatch());
    }

    #[test]
    fn evaluation_is_deterministic() {
        let first = PowerSourceRequest::evaluate_capabilities(&preferences(), &capabilities()).unwrap();
        let second = PowerSourceRequest::evaluate_capabilities(&preferences(), &capabilities()).unwrap();

        assert_eq!(first.to_raw(), second.to_raw());
    }

    #[test]
    fn equal_power_prefers_earlier_position() {
        // Both PDOs provide 15 W; the first advertised wins.
        let capabilities = SourceCapabilities::new(&[fixed(100, 300), fixed(300, 100)]);

        let preferences = SinkPowerPreferences {
            max_voltage: ElectricPotential::new::<volt>(20),
            max_current: ElectricCurrent::new::<ampere>(3),
            operating_power: Power::new::<watt>(15),
        };

        let request = PowerSourceRequest::evaluate_capabilities(&preferences, &capabilities).unwrap();
        assert_eq!(request.object_position(), 1);
    }

    #[test]
    fn insufficient_offer_flags_mismatch() {
        // The sink wants 60 W, but the source offers at most 18 W.
        let preferences = SinkPowerPreferences {
            max_voltage: ElectricPotential::new::<volt>(20),
            max_current: ElectricCurrent::new::<ampere>(5),
            operating_power: Power::new::<watt>(60),
        };

        let request = PowerSourceRequest::evaluate_capabilities(&preferences, &capabilities()).unwrap();
        assert!(request.capability_mismatch());
        assert_eq!(request.object_position(), 2);
    }

    #[test]
    fn low_voltage_limit_falls_back_to_vsafe_5v() {
        // A sink that only accepts 3.3 V still requests the 5 V supply, with
        // the mismatch flag raised.
        let preferences = SinkPowerPreferences {
            max_voltage: ElectricPotential::new::<volt>(3),
            max_current: ElectricCurrent::new::<ampere>(1),
            operating_power: Power::new::<watt>(3),
        };

        let request = PowerSourceRequest::evaluate_capabilities(&preferences, &capabilities()).unwrap();
        assert_eq!(request.object_position(), 1);
        assert!(request.capability_mismatch());
    }

    #[test]
    fn request_matching_validates_position_and_current() {
        let capabilities = capabilities();

        let valid = PowerSourceRequest::FixedVariableSupply(
            super::FixedVariableSupply(0)
                .with_object_position(2)
                .with_raw_operating_current(200)
                .with_raw_max_operating_current(200),
        );
        assert!(valid.is_satisfiable(&capabilities));

        // Over-current on the 9 V supply.
        let over_current = PowerSourceRequest::FixedVariableSupply(
            super::FixedVariableSupply(0)
                .with_object_position(2)
                .with_raw_operating_current(300)
                .with_raw_max_operating_current(300),
        );
        assert!(!over_current.is_satisfiable(&capabilities));

        // An object position that was never advertised.
        let out_of_range = PowerSourceRequest::FixedVariableSupply(
            super::FixedVariableSupply(0)
                .with_object_position(5)
                .with_raw_operating_current(100)
                .with_raw_max_operating_current(100),
        );
        assert!(!out_of_range.is_satisfiable(&capabilities));

        // Position zero is reserved.
        let reserved = PowerSourceRequest::FixedVariableSupply(super::FixedVariableSupply(0));
        assert!(!reserved.is_satisfiable(&capabilities));
    }

    #[test]
    fn operating_conditions_report_contract_voltage_and_current() {
        let request = PowerSourceRequest::evaluate_capabilities(&preferences(), &capabilities()).unwrap();
        let contract = request.operating_conditions(&capabilities()).unwrap();

        assert_eq!(contract.voltage, ElectricPotential::new::<volt>(9));
        assert_eq!(contract.current, ElectricCurrent::new::<ampere>(2));
    }

    #[test]
    fn raw_requests_are_typed_by_object_position() {
        let capabilities = capabilities();

        let raw = super::FixedVariableSupply(0)
            .with_object_position(1)
            .with_raw_operating_current(100)
            .0;

        assert!(matches!(
            parse_raw_request(raw, Some(&capabilities)),
            PowerSourceRequest::FixedVariableSupply(_)
        ));
        assert!(matches!(
            parse_raw_request(raw, None),
            PowerSourceRequest::Unknown(_)
        ));
    }
}
