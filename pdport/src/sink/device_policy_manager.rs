//! The device policy manager (DPM) allows a device to control the policy engine, and be informed about status changes.
//!
//! For example, through the DPM, a device can request certain source capabilities (voltage, current),
//! renegotiate the power contract, or initiate role swaps.
use core::future::Future;

use heapless::Vec;

use crate::protocol_layer::message::data::battery_status::BatteryStatusDataObject;
use crate::protocol_layer::message::data::epr_mode::DataEnterFailed;
use crate::protocol_layer::message::data::request::{CurrentRequest, PowerSourceRequest, VoltageRequest};
use crate::protocol_layer::message::data::sink_capabilities::SinkCapabilities;
use crate::protocol_layer::message::data::source_capabilities::{FixedSupply, PowerDataObject, SourceCapabilities};
use crate::protocol_layer::message::data::vendor_defined::VdmHeaderUnstructured;
use crate::protocol_layer::message::extended::battery::{BatteryCapabilities, GetBatteryCap, GetBatteryStatus};
use crate::protocol_layer::message::extended::manufacturer_info::{GetManufacturerInfo, ManufacturerInfo};
use crate::protocol_layer::message::extended::status::{PpsStatus, Status};
use crate::units::Power;
use crate::vdm::{Identity, MAX_SVID_COUNT};
use crate::{Contract, DataRole};

/// Events that the device policy manager can send to the policy engine.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Empty event.
    None,
    /// Request source capabilities (again).
    RequestSourceCapabilities,
    /// Request a certain power level.
    RequestPower(PowerSourceRequest),
    /// Initiate a power role swap towards the source role.
    RequestPowerRoleSwap,
    /// Initiate a data role swap.
    RequestDataRoleSwap,
    /// Initiate a VCONN swap.
    RequestVconnSwap,
    /// Query the status of the source.
    GetSourceStatus,
    /// Send an attention notification for an SVID.
    SendAttention(u16),
    /// Enter EPR mode, reporting the sink's operational PDP.
    EnterEprMode(Power),
    /// Exit EPR mode.
    ExitEprMode,
}

/// Request the safe 5 V supply at its full advertised current.
///
/// Falls back to a minimal request of the first object position when the
/// capabilities are malformed.
pub fn request_safe_5v(source_capabilities: &SourceCapabilities) -> PowerSourceRequest {
    PowerSourceRequest::new_fixed(CurrentRequest::Highest, VoltageRequest::Safe5V, source_capabilities)
        .unwrap_or_else(|_| {
            warn!("No vSafe5V PDO advertised, requesting object position 1");
            PowerSourceRequest::Unknown(
                crate::protocol_layer::message::data::request::RawDataObject(0).with_object_position(1),
            )
        })
}

/// Request the highest advertised fixed voltage at its full current.
pub fn request_highest_voltage(source_capabilities: &SourceCapabilities) -> PowerSourceRequest {
    PowerSourceRequest::new_fixed(CurrentRequest::Highest, VoltageRequest::Highest, source_capabilities)
        .unwrap_or_else(|_| request_safe_5v(source_capabilities))
}

/// A single vSafe5V sink capability PDO, used as the default response to a
/// get-sink-capabilities request.
pub fn default_sink_capabilities() -> SinkCapabilities {
    SinkCapabilities::new(&[PowerDataObject::FixedSupply(
        FixedSupply::default().with_raw_voltage(100).with_raw_max_current(10),
    )])
}

/// Trait for the device policy manager of a sink.
///
/// This entity commands the policy engine and enforces device policy.
/// All hooks have default implementations, so a minimal sink only overrides
/// what it cares about.
pub trait DevicePolicyManager {
    /// Request a power source.
    ///
    /// Defaults to 5 V at maximum current.
    fn request(&mut self, source_capabilities: &SourceCapabilities) -> impl Future<Output = PowerSourceRequest> {
        async { request_safe_5v(source_capabilities) }
    }

    /// Notify the device that it shall transition to a new power level.
    ///
    /// The device is informed about the request that was accepted by the source.
    fn transition_power(&mut self, _accepted: &PowerSourceRequest) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device about the operating conditions of a newly established
    /// explicit contract.
    fn contract_established(&mut self, _contract: &Contract) -> impl Future<Output = ()> {
        async {}
    }

    /// The policy engine gets and evaluates device policy events when ready.
    ///
    /// By default, this is a future that never resolves.
    fn get_event(&mut self, _source_capabilities: &SourceCapabilities) -> impl Future<Output = Event> {
        async { core::future::pending().await }
    }

    /// Notify the device that the engine started operating, i.e. the port attached.
    fn attached(&mut self) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device of a hard reset.
    ///
    /// The device shall transition to its default (5 V) power level.
    fn hard_reset(&mut self) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device of a completed data role swap.
    fn data_role_changed(&mut self, _data_role: DataRole) -> impl Future<Output = ()> {
        async {}
    }

    /// Decide whether to accept a power role swap requested by the source.
    ///
    /// Defaults to rejection, since becoming a source is a commitment that
    /// device policy has to opt into.
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

    /// Notify the device of an alert sent by the source.
    fn alert_received(
        &mut self,
        _alert: crate::protocol_layer::message::data::alert::AlertDataObject,
    ) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device of a status response from the source.
    fn source_status_received(&mut self, _status: &Status) -> impl Future<Output = ()> {
        async {}
    }

    /// Inform the device about source capabilities that were received on request.
    fn inform(&mut self, _source_capabilities: &SourceCapabilities) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device that entering EPR mode failed.
    fn epr_mode_entry_failed(&mut self, _reason: DataEnterFailed) -> impl Future<Output = ()> {
        async {}
    }

    /// The capabilities that the sink reports on request.
    fn sink_capabilities(&mut self) -> SinkCapabilities {
        default_sink_capabilities()
    }

    /// The status that the sink reports on request.
    fn status(&mut self) -> Status {
        Default::default()
    }

    /// The PPS status that the sink reports on request.
    fn pps_status(&mut self) -> PpsStatus {
        Default::default()
    }

    /// The battery status that the sink reports on request.
    fn battery_status(&mut self, _request: &GetBatteryStatus) -> BatteryStatusDataObject {
        Default::default()
    }

    /// The battery capabilities that the sink reports on request.
    fn battery_capabilities(&mut self, _request: &GetBatteryCap) -> BatteryCapabilities {
        BatteryCapabilities {
            invalid_reference: true,
            ..Default::default()
        }
    }

    /// The manufacturer info that the sink reports on request.
    fn manufacturer_info(&mut self, _request: &GetManufacturerInfo) -> ManufacturerInfo {
        Default::default()
    }

    /// The identity that the sink reports in response to Discover Identity.
    ///
    /// `None` makes the engine reply with a negative acknowledgment.
    fn identity(&mut self) -> Option<Identity> {
        None
    }

    /// The SVIDs that the sink reports in response to Discover SVIDs.
    fn svids(&mut self) -> Vec<u16, MAX_SVID_COUNT> {
        Vec::new()
    }

    /// The modes of an SVID, reported in response to Discover Modes.
    fn modes(&mut self, _svid: u16) -> Vec<u32, 6> {
        Vec::new()
    }

    /// Enter the given mode of an SVID. Reports success.
    fn enter_mode(&mut self, _svid: u16, _position: u8) -> impl Future<Output = bool> {
        async { false }
    }

    /// Exit the given mode of an SVID. Reports success.
    fn exit_mode(&mut self, _svid: u16, _position: u8) -> impl Future<Output = bool> {
        async { true }
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
    ///
    /// `None` makes the engine respond with a not-supported message.
    fn security_request(
        &mut self,
        _request: &[u8],
    ) -> Option<Vec<u8, { crate::protocol_layer::message::extended::MAX_EXTENDED_DATA_SIZE }>> {
        None
    }

    /// Handle a firmware update request, optionally building a response.
    ///
    /// `None` makes the engine respond with a not-supported message.
    fn firmware_update_request(
        &mut self,
        _request: &[u8],
    ) -> Option<Vec<u8, { crate::protocol_layer::message::extended::MAX_EXTENDED_DATA_SIZE }>> {
        None
    }
}
