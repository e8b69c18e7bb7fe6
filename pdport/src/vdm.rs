//! Structured VDM sequencing.
//!
//! Keeps track of the discovery ladder (identity, SVIDs, modes) that a DFP
//! walks through, and assembles the data objects for requests and replies.
//! Completed stages are never re-run, so repeated discovery commands are
//! harmless.
use heapless::Vec;

use crate::protocol_layer::message::data::vendor_defined::{
    CertStatVdo, ProductVdo, VdmCommand, VdmCommandType, VdmHeaderStructured, VdmIdentityHeader,
};

/// The standard ID used for structured VDM discovery.
pub const PD_SID: u16 = 0xff00;

/// The maximum number of SVIDs that discovery keeps track of.
pub const MAX_SVID_COUNT: usize = 12;

/// The maximum number of modes that discovery keeps track of.
pub const MAX_MODE_COUNT: usize = 12;

/// The identity of a port, as carried in a Discover Identity response.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Identity {
    /// The ID header VDO.
    pub id_header: VdmIdentityHeader,
    /// The cert stat VDO.
    pub cert_stat: CertStatVdo,
    /// The product VDO.
    pub product: ProductVdo,
}

impl Identity {
    /// The identity as response data objects.
    pub fn to_objects(&self) -> Vec<u32, 7> {
        let mut objects = Vec::new();
        _ = objects.push(self.id_header.0);
        _ = objects.push(self.cert_stat.0);
        _ = objects.push(self.product.0);
        objects
    }

    /// Parse an identity from acknowledge data objects.
    pub fn from_objects(objects: &[u32]) -> Option<Self> {
        if objects.len() < 3 {
            return None;
        }

        Some(Self {
            id_header: VdmIdentityHeader(objects[0]),
            cert_stat: CertStatVdo(objects[1]),
            product: ProductVdo(objects[2]),
        })
    }
}

/// A mode, discovered for a specific SVID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Mode {
    /// The SVID that the mode belongs to.
    pub svid: u16,
    /// The (one-indexed) position of the mode within the SVID's mode list.
    pub position: u8,
    /// The vendor defined mode value.
    pub value: u32,
}

/// The next command that the discovery ladder asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoveryStep {
    /// Discover the port partner's identity.
    Identity,
    /// Discover supported SVIDs.
    Svids,
    /// Discover the modes of an SVID.
    Modes(u16),
}

/// Bookkeeping for the discovery ladder of a DFP.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Discovery {
    /// The discovered identity of the port partner, once known.
    pub identity: Option<Identity>,
    /// SVIDs that the port partner supports.
    pub svids: Vec<u16, MAX_SVID_COUNT>,
    /// Modes of the discovered SVIDs.
    pub modes: Vec<Mode, MAX_MODE_COUNT>,
    /// The mode that is presently entered, if any.
    pub entered_mode: Option<Mode>,

    svids_complete: bool,
    modes_queried: usize,
}

impl Discovery {
    /// Create empty discovery bookkeeping.
    pub fn new() -> Self {
        Default::default()
    }

    /// The next outstanding discovery step, if any.
    ///
    /// Completed steps are skipped, which makes repeated discovery commands
    /// idempotent.
    pub fn next_step(&self) -> Option<DiscoveryStep> {
        if self.identity.is_none() {
            return Some(DiscoveryStep::Identity);
        }

        if !self.svids_complete {
            return Some(DiscoveryStep::Svids);
        }

        self.svids.get(self.modes_queried).map(|svid| DiscoveryStep::Modes(*svid))
    }

    /// Record a Discover Identity acknowledge.
    pub fn record_identity(&mut self, objects: &[u32]) {
        self.identity = Identity::from_objects(objects);
    }

    /// Record a Discover SVIDs acknowledge.
    ///
    /// Each data object carries two SVIDs; an SVID of zero terminates the
    /// list.
    pub fn record_svids(&mut self, objects: &[u32]) {
        for object in objects {
            for svid in [(object >> 16) as u16, (object & 0xffff) as u16] {
                if svid == 0 {
                    self.svids_complete = true;
                    return;
                }

                if self.svids.push(svid).is_err() {
                    warn!("SVID list overflow, dropping further SVIDs");
                    self.svids_complete = true;
                    return;
                }
            }
        }

        // A full response may be followed by another SVID page; this stack
        // only examines the first page.
        self.svids_complete = true;
    }

    /// Record a Discover Modes acknowledge for an SVID.
    pub fn record_modes(&mut self, svid: u16, objects: &[u32]) {
        for (index, object) in objects.iter().enumerate() {
            let mode = Mode {
                svid,
                position: (index + 1) as u8,
                value: *object,
            };

            if self.modes.push(mode).is_err() {
                warn!("Mode list overflow, dropping further modes");
                break;
            }
        }

        self.modes_queried += 1;
    }

    /// Whether all discovery steps have completed.
    pub fn is_complete(&self) -> bool {
        self.next_step().is_none()
    }

    /// Reset all discovery state, e.g. on detach or hard reset.
    pub fn reset(&mut self) {
        *self = Default::default();
    }
}

/// Pack SVIDs into response data objects, two per object.
///
/// A zero SVID terminates the list; a terminator object is appended when the
/// count is even.
pub fn svids_to_objects(svids: &[u16]) -> Vec<u32, 7> {
    let mut objects = Vec::new();

    for chunk in svids.chunks(2) {
        let high = chunk[0] as u32;
        let low = chunk.get(1).copied().unwrap_or(0) as u32;

        if objects.push((high << 16) | low).is_err() {
            warn!("SVID response overflow, truncating");
            return objects;
        }
    }

    if svids.len() % 2 == 0 {
        _ = objects.push(0);
    }

    objects
}

/// Create a structured VDM request header.
pub fn request_header(svid: u16, command: VdmCommand, object_position: u8) -> VdmHeaderStructured {
    VdmHeaderStructured::default()
        .with_standard_or_vid(svid)
        .with_command_type(VdmCommandType::InitiatorReq)
        .with_command(command)
        .with_object_position(object_position)
}

/// Create the response header for a received request header.
pub fn response_header(request: VdmHeaderStructured, command_type: VdmCommandType) -> VdmHeaderStructured {
    request.reply(command_type)
}

#[cfg(test)]
mod tests {
    use super::{Discovery, DiscoveryStep, Identity};
    use crate::protocol_layer::message::data::vendor_defined::{CertStatVdo, ProductVdo, VdmIdentityHeader};

    fn identity_objects() -> [u32; 3] {
        [
            VdmIdentityHeader(0).with_vid(0x04e8).with_device_data(true).0,
            CertStatVdo(0).with_xid(1).0,
            ProductVdo(0).with_pid(0x6860).0,
        ]
    }

    #[test]
    fn ladder_walks_identity_svids_modes() {
        let mut discovery = Discovery::new();
        assert_eq!(discovery.next_step(), Some(DiscoveryStep::Identity));

        discovery.record_identity(&identity_objects());
        assert_eq!(discovery.next_step(), Some(DiscoveryStep::Svids));

        // Two SVIDs, then the zero terminator.
        discovery.record_svids(&[0xff01_8087, 0x0000_0000]);
        assert_eq!(discovery.svids.as_slice(), &[0xff01, 0x8087]);
        assert_eq!(discovery.next_step(), Some(DiscoveryStep::Modes(0xff01)));

        discovery.record_modes(0xff01, &[0x1]);
        assert_eq!(discovery.next_step(), Some(DiscoveryStep::Modes(0x8087)));

        discovery.record_modes(0x8087, &[0x2, 0x3]);
        assert!(discovery.is_complete());
        assert_eq!(discovery.modes.len(), 3);
    }

    #[test]
    fn completed_stages_are_not_rerun() {
        let mut discovery = Discovery::new();
        discovery.record_identity(&identity_objects());

        // Recording the same identity again does not regress the ladder.
        discovery.record_identity(&identity_objects());
        assert_eq!(discovery.next_step(), Some(DiscoveryStep::Svids));

        discovery.record_svids(&[0]);
        assert!(discovery.is_complete());
    }

    #[test]
    fn identity_requires_three_objects() {
        assert!(Identity::from_objects(&[1, 2]).is_none());
        assert!(Identity::from_objects(&identity_objects()).is_some());
    }
}
