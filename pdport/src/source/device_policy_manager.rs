//! The device policy manager (DPM) of a source.
//!
//! Decides which capabilities to advertise, whether to grant sink requests,
//! and steers role swaps and accessory discovery.
use core::future::Future;

use heapless::Vec;

use crate::protocol_layer::message::data::alert::AlertDataObject;
use crate::protocol_layer::message::data::battery_status::BatteryStatusDataObject;
use crate::protocol_layer::message::data::request::PowerSourceRequest;
use crate::protocol_layer::message::data::sink_capabilities::SinkCapabilities;
use crate::protocol_layer::message::data::source_capabilities::{FixedSupply, PowerDataObject, SourceCapabilities};
use crate::protocol_layer::message::data::vendor_defined::VdmHeaderUnstructured;
use crate::protocol_layer::message::extended::battery::{BatteryCapabilities, GetBatteryCap, GetBatteryStatus};
use crate::protocol_layer::message::extended::manufacturer_info::{GetManufacturerInfo, ManufacturerInfo};
use crate::protocol_layer::message::extended::status::{PpsStatus, Status};
use crate::vdm::{Discovery, Identity, MAX_SVID_COUNT, Mode};
use crate::{Contract, DataRole};

/// Events that the device policy manager can send to the policy engine.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Empty event.
    None,
    /// Advertise (updated) source capabilities.
    AdvertiseCapabilities,
    /// Query the capabilities of the attached sink.
    RequestSinkCapabilities,
    /// Query the status of the attached sink.
    GetSinkStatus,
    /// Initiate a power role swap towards the sink role.
    RequestPowerRoleSwap,
    /// Initiate a data role swap.
    RequestDataRoleSwap,
    /// Initiate a VCONN swap.
    RequestVconnSwap,
    /// Send an alert notification to the sink.
    SendAlert(AlertDataObject),
    /// Run structured VDM discovery of the port partner.
    DiscoverPortPartner,
    /// Enter a previously discovered mode.
    EnterMode(Mode),
    /// Exit the presently entered mode.
    ExitMode(Mode),
}

/// The verdict of a source on a sink's request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestDisposition {
    /// The request is granted.
    Accept,
    /// The request cannot be granted.
    Reject,
    /// The request cannot be granted at this time, the sink shall retry.
    Wait,
}

/// A single vSafe5V supply at 1.5 A, used as the default advertisement.
pub fn default_source_capabilities() -> SourceCapabilities {
    SourceCapabilities::new(&[PowerDataObject::FixedSupply(
        FixedSupply::default()
            .with_raw_voltage(100)
            .with_raw_max_current(150)
            .with_dual_role_data(true),
    )])
}

/// Trait for the device policy manager of a source.
///
/// All hooks have default implementations, so a minimal source only overrides
/// what it cares about.
pub trait DevicePolicyManager {
    /// The capabilities that the source advertises.
    fn source_capabilities(&mut self) -> SourceCapabilities {
        default_source_capabilities()
    }

    /// The capabilities that the source advertises in EPR mode.
    fn epr_source_capabilities(&mut self) -> SourceCapabilities {
        self.source_capabilities()
    }

    /// Evaluate a sink's request against the advertised capabilities.
    ///
    /// The default grants every request that the advertised capabilities can
    /// satisfy. A capability mismatch flag alone does not reject a request.
    fn evaluate_request(
        &mut self,
        advertised: &SourceCapabilities,
        request: &PowerSourceRequest,
    ) -> impl Future<Output = RequestDisposition> {
        let disposition = if request.is_satisfiable(advertised) {
            RequestDisposition::Accept
        } else {
            RequestDisposition::Reject
        };

        async move { disposition }
    }

    /// Notify the device that it shall transition its supply to a new
    /// operating point.
    fn transition_supply(&mut self, _contract: &Contract) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device that it shall stop supplying power, e.g. during a
    /// power role swap.
    fn supply_off(&mut self) -> impl Future<Output = ()> {
        async {}
    }

    /// The policy engine gets and evaluates device policy events when ready.
    ///
    /// By default, this is a future that never resolves.
    fn get_event(&mut self) -> impl Future<Output = Event> {
        async { core::future::pending().await }
    }

    /// Notify the device that the engine started operating, i.e. the port attached.
    fn attached(&mut self) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device of a hard reset.
    ///
    /// The device shall return its supply to vSafe5V.
    fn hard_reset(&mut self) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device of a completed data role swap.
    fn data_role_changed(&mut self, _data_role: DataRole) -> impl Future<Output = ()> {
        async {}
    }

    /// Decide whether to accept a power role swap requested by the sink.
    fn accept_power_role_swap(&mut self) -> impl Future<Output = bool> {
        async { false }
    }

    /// Decide whether to accept a data role swap requested by the port partner.
    fn accept_data_role_swap(&mut self, _new_role: DataRole) -> impl Future<Output = bool> {
        async { true }
    }

    /// Decide whether to accept a VCONN swap requested by the port partner.
    fn accept_vconn_swap(&mut self) -> impl Future<Output = bool> {
        async { true }
    }

    /// Decide whether to grant a sink's EPR mode entry request.
    fn accept_epr_mode(&mut self) -> impl Future<Output = bool> {
        async { false }
    }

    /// Notify the device of an alert sent by the sink.
    fn alert_received(&mut self, _alert: AlertDataObject) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device of a status response from the sink.
    fn sink_status_received(&mut self, _status: &Status) -> impl Future<Output = ()> {
        async {}
    }

    /// Inform the device about sink capabilities that were received on request.
    fn sink_capabilities_received(&mut self, _capabilities: &SinkCapabilities) -> impl Future<Output = ()> {
        async {}
    }

    /// Inform the device about the outcome of port partner discovery.
    fn discovery_complete(&mut self, _discovery: &Discovery) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device that a mode was entered.
    fn mode_entered(&mut self, _mode: Mode) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device that a mode was exited.
    fn mode_exited(&mut self, _mode: Mode) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device of an attention message from the port partner.
    fn attention_received(&mut self, _svid: u16, _objects: &[u32]) -> impl Future<Output = ()> {
        async {}
    }

    /// The sink capabilities of a dual-role source, reported on request.
    ///
    /// `None` makes the engine respond with a not-supported message.
    fn sink_capabilities(&mut self) -> Option<SinkCapabilities> {
        None
    }

    /// The status that the source reports on request.
    fn status(&mut self) -> Status {
        Default::default()
    }

    /// The PPS status that the source reports on request.
    fn pps_status(&mut self) -> PpsStatus {
        Default::default()
    }

    /// The battery status that the source reports on request.
    fn battery_status(&mut self, _request: &GetBatteryStatus) -> BatteryStatusDataObject {
        Default::default()
    }

    /// The battery capabilities that the source reports on request.
    fn battery_capabilities(&mut self, _request: &GetBatteryCap) -> BatteryCapabilities {
        BatteryCapabilities {
            invalid_reference: true,
            ..Default::default()
        }
    }

    /// The manufacturer info that the source reports on request.
    fn manufacturer_info(&mut self, _request: &GetManufacturerInfo) -> ManufacturerInfo {
        Default::default()
    }

    /// The identity that the source reports in response to Discover Identity.
    ///
    /// `None` makes the engine reply with a negative acknowledgment.
    fn identity(&mut self) -> Option<Identity> {
        None
    }

    /// The SVIDs that the source reports in response to Discover SVIDs.
    fn svids(&mut self) -> Vec<u16, MAX_SVID_COUNT> {
        Vec::new()
    }

    /// The modes of an SVID, reported in response to Discover Modes.
    fn modes(&mut self, _svid: u16) -> Vec<u32, 6> {
        Vec::new()
    }

    /// Handle an unstructured VDM, optionally building a reply.
    ///
    /// `None` makes the engine respond with a not-supported message.
    fn unstructured_vdm(
        &mut self,
        _header: VdmHeaderUnstructured,
        _objects: &[u32],
    ) -> Option<(VdmHeaderUnstructured, Vec<u32, 7>)> {
        None
    }

    /// Handle a security request, optionally building a response.
    fn security_request(
        &mut self,
        _request: &[u8],
    ) -> Option<Vec<u8, { crate::protocol_layer::message::extended::MAX_EXTENDED_DATA_SIZE }>> {
        None
    }

    /// Handle a firmware update request, optionally building a response.
    fn firmware_update_request(
        &mut self,
        _request: &[u8],
    ) -> Option<Vec<u8, { crate::protocol_layer::message::extended::MAX_EXTENDED_DATA_SIZE }>> {
        None
    }
}
