//! A dual-role USB Power Delivery protocol and policy stack.
//!
//! The stack is split into
//! - a protocol layer that provides reliable message exchange (GoodCrc
//!   handshake, message ID bookkeeping, bounded retransmission),
//! - policy engines for the sink and source roles,
//! - device policy manager traits, through which a device steers the policy
//!   engines and is informed about status changes,
//! - a [`port::Port`] wrapper that runs the engine matching the current power
//!   role and switches engines after a completed power role swap.
//!
//! The PHY is abstracted by the `pdport-traits` driver trait. Timers are
//! provided by the user application through the [`timers::Timer`] trait.
#![no_std]
#![warn(missing_docs)]

#[cfg(test)]
extern crate std;

// This mod MUST go first, so that the others see its macros.
mod fmt;

pub mod counters;
pub mod port;
pub mod protocol_layer;
pub mod sink;
pub mod source;
pub mod timers;
pub mod vdm;

#[cfg(test)]
pub(crate) mod dummy;

#[macro_use]
extern crate uom;

pub use pdport_traits::{DataRole, PowerRole};

/// Quantity types used throughout the stack.
///
/// Backed by `u32` storage in SI base units.
pub mod units {
    /// Electric current.
    pub type ElectricCurrent = uom::si::u32::ElectricCurrent;
    /// Electric potential.
    pub type ElectricPotential = uom::si::u32::ElectricPotential;
    /// Power.
    pub type Power = uom::si::u32::Power;
}

pub(crate) mod _50millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_50millivolts: 0.05; "50 mV", "50 millivolts", "50 millivolts";
    }
}

pub(crate) mod _20millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_20millivolts: 0.02; "20 mV", "20 millivolts", "20 millivolts";
    }
}

pub(crate) mod _50milliamperes_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_current;

        @_50milliamperes: 0.05; "50 mA", "50 milliamperes", "50 milliamperes";
    }
}

pub(crate) mod _250milliwatts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::power;

        @_250milliwatts: 0.25; "250 mW", "250 milliwatts", "250 milliwatts";
    }
}

/// The operating conditions of a negotiated explicit contract.
///
/// This is what the stack reports to the device policy manager when a
/// contract is established, for consumption by charging circuitry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Contract {
    /// Negotiated supply voltage.
    pub voltage: units::ElectricPotential,
    /// Negotiated operating current.
    pub current: units::ElectricCurrent,
}

/// The reason for a policy engine returning control to its caller.
///
/// Policy engines run until an unrecoverable error occurs, or until the port
/// changes its power role. In the latter case, the port wrapper constructs
/// the engine for the new role and resumes operation.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Handover {
    /// A power role swap completed. The complementary engine shall take over.
    PowerRoleSwap,
}
