//! USB PD port driver traits.
//!
//! Provides a driver trait that allows to add support for various USB PD PHYs,
//! and the port role types that the stack and the PHY share.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
use core::future::Future;

/// Receive Error.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverRxError {
    /// Received message discarded, e.g. due to CRC errors.
    Discarded,

    /// Hard Reset received before or during reception.
    HardReset,
}

/// Transmit Error.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverTxError {
    /// Concurrent receive in progress or excessive noise on the line.
    Discarded,

    /// Hard Reset received before or during transmission.
    HardReset,
}

/// The power role of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerRole {
    /// Provides power.
    Source,
    /// Consumes power.
    Sink,
}

impl PowerRole {
    /// The role that the port assumes after a power role swap.
    pub fn swapped(&self) -> Self {
        match self {
            Self::Source => Self::Sink,
            Self::Sink => Self::Source,
        }
    }
}

impl From<bool> for PowerRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Sink,
            true => Self::Source,
        }
    }
}

impl From<PowerRole> for bool {
    fn from(role: PowerRole) -> bool {
        match role {
            PowerRole::Sink => false,
            PowerRole::Source => true,
        }
    }
}

/// The data role of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataRole {
    /// Upstream-facing port.
    Ufp,
    /// Downstream-facing port.
    Dfp,
}

impl DataRole {
    /// The role that the port assumes after a data role swap.
    pub fn swapped(&self) -> Self {
        match self {
            Self::Ufp => Self::Dfp,
            Self::Dfp => Self::Ufp,
        }
    }
}

impl From<bool> for DataRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Ufp,
            true => Self::Dfp,
        }
    }
}

impl From<DataRole> for bool {
    fn from(role: DataRole) -> bool {
        match role {
            DataRole::Ufp => false,
            DataRole::Dfp => true,
        }
    }
}

/// Driver trait, through which the protocol layer talks to the PHY.
pub trait Driver {
    /// Wait for availability of VBus voltage.
    fn wait_for_vbus(&self) -> impl Future<Output = ()>;

    /// Receive a packet.
    fn receive(&mut self, buffer: &mut [u8]) -> impl Future<Output = Result<usize, DriverRxError>>;

    /// Transmit a packet.
    fn transmit(&mut self, data: &[u8]) -> impl Future<Output = Result<(), DriverTxError>>;

    /// Transmit a hard reset signal.
    fn transmit_hard_reset(&mut self) -> impl Future<Output = Result<(), DriverTxError>>;

    /// Assert a new power role on the CC pins.
    ///
    /// For the source role, the PHY shall also drive VBus; for the sink role,
    /// it shall stop driving VBus. Called during power role swaps and on
    /// transition to the default contract.
    fn set_power_role(&mut self, _role: PowerRole) -> impl Future<Output = ()> {
        async {}
    }

    /// Assert a new data role.
    fn set_data_role(&mut self, _role: DataRole) -> impl Future<Output = ()> {
        async {}
    }

    /// Enable or disable the VConn supply of the port.
    fn set_vconn(&mut self, _enabled: bool) -> impl Future<Output = ()> {
        async {}
    }
}
