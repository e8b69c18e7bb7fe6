//! Definitions of sink capabilities data message content.
//!
//! Sink capability PDOs share the layout of source capability PDOs for all
//! fields that this stack consumes, so the same data object types are used.
use heapless::Vec;

use super::source_capabilities::{FixedSupply, MAX_PDO_COUNT, PowerDataObject};

/// The list of capabilities that a sink reports on request.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SinkCapabilities(pub(crate) Vec<PowerDataObject, MAX_PDO_COUNT>);

impl SinkCapabilities {
    /// Create sink capabilities from a list of power data objects.
    ///
    /// Objects beyond [`MAX_PDO_COUNT`] are dropped.
    pub fn new(pdos: &[PowerDataObject]) -> Self {
        Self(pdos.iter().copied().take(MAX_PDO_COUNT).collect())
    }

    /// Get power data objects (PDOs) of the sink.
    pub fn pdos(&self) -> &[PowerDataObject] {
        &self.0
    }

    /// The vSafe5V fixed supply requirement, if reported correctly.
    pub fn vsafe_5v(&self) -> Option<&FixedSupply> {
        self.0.first().and_then(|supply| {
            if let PowerDataObject::FixedSupply(supply) = supply {
                Some(supply)
            } else {
                None
            }
        })
    }
}
