//! Policy engine for the implementation of a source.
//!
//! Capability advertisement is bounded by the caps counter, requests are
//! matched through the device policy manager, the supply transitions within
//! the source transition time, and the swap/reset sub-machines mirror the
//! sink's.
//!
//! See [8.3.3.2].
use core::marker::PhantomData;

use embassy_futures::select::{Either, select};
use heapless::Vec;
use pdport_traits::Driver;

use super::device_policy_manager::{DevicePolicyManager, Event, RequestDisposition};
use crate::counters::{Counter, CounterType};
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::data::alert::AlertDataObject;
use crate::protocol_layer::message::data::epr_mode::{Action, DataEnterFailed, EprModeDataObject};
use crate::protocol_layer::message::data::request::{self, PowerSourceRequest};
use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
use crate::protocol_layer::message::data::vendor_defined::{VdmCommand, VdmCommandType, VdmHeader};
use crate::protocol_layer::message::extended::extended_control::ExtendedControlMessageType;
use crate::protocol_layer::message::extended::{Extended, MAX_EXTENDED_DATA_SIZE, battery, manufacturer_info};
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload};
use crate::protocol_layer::{ProtocolError, ProtocolLayer, RxError, TxError};
use crate::timers::{Timer, TimerType};
use crate::vdm::{self, Discovery, DiscoveryStep, Mode as VdmMode, PD_SID};
use crate::{DataRole, Handover, PowerRole};

#[cfg(test)]
mod tests;

/// Source capability mode.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Spr,
    Epr,
}

/// Source states.
#[derive(Debug, Clone)]
enum State {
    /// Default state at startup.
    Startup,
    /// Delay before advertising capabilities after a power role swap.
    SwapStart,
    SendCapabilities,
    WaitForRequest,
    NegotiateCapability(PowerSourceRequest),
    TransitionSupply(PowerSourceRequest),
    Ready(PowerSourceRequest),
    SendNotSupported(PowerSourceRequest),
    GetSinkCap(PowerSourceRequest),
    GiveSinkCap(PowerSourceRequest),
    GiveStatus(PowerSourceRequest),
    GivePpsStatus(PowerSourceRequest),
    GiveBatteryStatus(PowerSourceRequest, battery::GetBatteryStatus),
    GiveBatteryCap(PowerSourceRequest, battery::GetBatteryCap),
    GiveManufacturerInfo(PowerSourceRequest, manufacturer_info::GetManufacturerInfo),
    GiveSecurityResponse(PowerSourceRequest, Vec<u8, MAX_EXTENDED_DATA_SIZE>),
    GiveFirmwareUpdateResponse(PowerSourceRequest, Vec<u8, MAX_EXTENDED_DATA_SIZE>),
    GetSinkStatus(PowerSourceRequest),
    AlertReceived(PowerSourceRequest, AlertDataObject),
    SendAlert(PowerSourceRequest, AlertDataObject),
    VdmReceived(PowerSourceRequest, VdmHeader, Vec<u32, 7>),
    VdmDiscovery(PowerSourceRequest),
    VdmEnterMode(PowerSourceRequest, VdmMode),
    VdmExitMode(PowerSourceRequest, VdmMode),

    // Role swap states.
    EvaluateDrSwap(PowerSourceRequest),
    SendDrSwap(PowerSourceRequest),
    EvaluatePrSwap(PowerSourceRequest),
    SendPrSwap(PowerSourceRequest),
    /// Turn the supply off and announce readiness to the new source.
    PrSwapTransitionToOff(PowerSourceRequest),
    /// Wait for the new source to start supplying power.
    PrSwapWaitSourceOn,
    EvaluateVconnSwap(PowerSourceRequest),
    SendVconnSwap(PowerSourceRequest),

    // Reset states.
    SendSoftReset,
    SoftReset,
    HardReset,
    TransitionToDefault,

    // EPR states.
    EprEvaluateEntry(PowerSourceRequest, EprModeDataObject),
    EprKeepAliveReceived(PowerSourceRequest),
    GiveEprSourceCap,
}

/// Errors that can occur in the source policy engine state machine.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The port partner is unresponsive.
    PortPartnerUnresponsive,
    /// A protocol error has occurred.
    Protocol(ProtocolError),
}

impl From<ProtocolError> for Error {
    fn from(protocol_error: ProtocolError) -> Self {
        Error::Protocol(protocol_error)
    }
}

/// Implementation of the source policy engine.
#[derive(Debug)]
pub struct Source<DRIVER: Driver, TIMER: Timer, DPM: DevicePolicyManager> {
    device_policy_manager: DPM,
    pub(crate) protocol_layer: ProtocolLayer<DRIVER, TIMER>,
    /// The most recently advertised capabilities, used for request matching.
    capabilities: Option<SourceCapabilities>,
    /// The request of the presently active explicit contract.
    contract_request: Option<PowerSourceRequest>,
    caps_counter: Counter,
    hard_reset_counter: Counter,
    swap_hard_reset_counter: Counter,
    discover_identity_counter: Counter,
    discovery: Discovery,
    mode: Mode,
    pub(crate) state: State,
    data_role: DataRole,
    vconn_source: bool,
    swap_in_progress: bool,

    _timer: PhantomData<TIMER>,
}

impl<DRIVER: Driver, TIMER: Timer, DPM: DevicePolicyManager> Source<DRIVER, TIMER, DPM> {
    fn new_protocol_layer(driver: DRIVER, data_role: DataRole) -> ProtocolLayer<DRIVER, TIMER> {
        let header = Header::new_template(data_role, PowerRole::Source, SpecificationRevision::R3_X);
        ProtocolLayer::new(driver, header)
    }

    /// Create a new source policy engine with a given `driver`.
    pub fn new(driver: DRIVER, device_policy_manager: DPM) -> Self {
        Self::new_inner(driver, device_policy_manager, DataRole::Dfp, false)
    }

    /// Create a source policy engine that takes over after a power role swap.
    ///
    /// The data role is carried over from before the swap, and capability
    /// advertisement is delayed by the swap source start time.
    pub fn new_after_power_role_swap(driver: DRIVER, device_policy_manager: DPM, data_role: DataRole) -> Self {
        Self::new_inner(driver, device_policy_manager, data_role, true)
    }

    fn new_inner(driver: DRIVER, device_policy_manager: DPM, data_role: DataRole, after_swap: bool) -> Self {
        Self {
            device_policy_manager,
            protocol_layer: Self::new_protocol_layer(driver, data_role),
            capabilities: None,
            contract_request: None,
            caps_counter: Counter::new(CounterType::Caps),
            hard_reset_counter: Counter::new(CounterType::HardReset),
            swap_hard_reset_counter: Counter::new(CounterType::SwapHardReset),
            discover_identity_counter: Counter::new(CounterType::DiscoverIdentity),
            discovery: Discovery::new(),
            mode: Mode::Spr,
            state: if after_swap { State::SwapStart } else { State::Startup },
            data_role,
            vconn_source: true,
            swap_in_progress: false,
            _timer: PhantomData,
        }
    }

    /// Release the driver and device policy manager.
    pub fn into_parts(self) -> (DRIVER, DPM) {
        (self.protocol_layer.into_driver(), self.device_policy_manager)
    }

    /// The data role that the port presently operates with.
    pub fn data_role(&self) -> DataRole {
        self.data_role
    }

    /// Run a single step in the policy engine state machine.
    pub(crate) async fn run_step(&mut self) -> Result<Option<Handover>, Error> {
        let result = self.update_state().await;

        let protocol_error = match result {
            Ok(handover) => return Ok(handover),
            Err(Error::Protocol(protocol_error)) => protocol_error,
            Err(other) => {
                error!("Unrecoverable error {:?} in source state transition", other);
                return Err(other);
            }
        };

        let new_state = match (&self.state, protocol_error) {
            // Hard reset signaling detected by the driver itself.
            (_, ProtocolError::Rx(RxError::HardReset) | ProtocolError::Tx(TxError::HardReset)) => {
                Some(State::TransitionToDefault)
            }

            // Soft reset requested by the port partner.
            (_, ProtocolError::Rx(RxError::SoftReset)) => Some(State::SoftReset),

            // If the soft reset handshake itself fails, escalate to hard reset.
            (State::SoftReset | State::SendSoftReset, ProtocolError::TransmitRetriesExceeded) => {
                Some(State::HardReset)
            }

            // No request arrived after advertising capabilities.
            (State::WaitForRequest, ProtocolError::Rx(RxError::ReceiveTimeout)) => Some(State::HardReset),

            // Any protocol error during a supply transition escalates to hard
            // reset.
            (State::TransitionSupply(_), _) => Some(State::HardReset),

            // Failures while the supply roles are mid-swap are not recoverable
            // by a soft reset.
            (State::PrSwapTransitionToOff(_) | State::PrSwapWaitSourceOn, _) => Some(State::HardReset),

            // Unexpected messages indicate a protocol error and demand a soft reset.
            (_, ProtocolError::UnexpectedMessage) => Some(State::SendSoftReset),

            // Unsupported messages in the ready state are answered with Not_Supported.
            (State::Ready(power_source), ProtocolError::Rx(RxError::UnsupportedMessage)) => {
                Some(State::SendNotSupported(*power_source))
            }

            // Transmission failure without acknowledgment demands a soft reset.
            (_, ProtocolError::TransmitRetriesExceeded) => Some(State::SendSoftReset),

            (_, error) => {
                error!("Protocol error {:?} in source state transition", error);
                None
            }
        };

        if let Some(state) = new_state {
            self.state = state;
        }

        Ok(None)
    }

    /// Run the source's state machine continuously.
    ///
    /// Returns with a [`Handover`] after a completed power role swap, and
    /// with an error if no PD-capable sink responds.
    pub async fn run(&mut self) -> Result<Handover, Error> {
        self.device_policy_manager.attached().await;

        loop {
            if let Some(handover) = self.run_step().await? {
                return Ok(handover);
            }
        }
    }

    /// Type a received request against the advertised capabilities.
    fn type_request(&self, received: PowerSourceRequest) -> PowerSourceRequest {
        request::parse_raw_request(received.to_raw(), self.capabilities.as_ref())
    }

    /// Complete a data role swap after the Accept message.
    async fn complete_data_role_swap(&mut self, new_role: DataRole) {
        info!("Data role swap to {:?}", new_role);

        self.data_role = new_role;
        self.protocol_layer.set_data_role(new_role);
        self.protocol_layer.driver().set_data_role(new_role).await;
        self.device_policy_manager.data_role_changed(new_role).await;
    }

    /// Carry out the VCONN transition after an accepted VCONN swap.
    ///
    /// Reports `false` when the partner failed to supply VCONN in time.
    async fn swap_vconn(&mut self) -> Result<bool, ProtocolError> {
        if self.vconn_source {
            match self
                .protocol_layer
                .receive_message_type(&[MessageType::Control(ControlMessageType::PsRdy)], TimerType::VconnOn)
                .await
            {
                Ok(_) => {
                    self.protocol_layer.driver().set_vconn(false).await;
                    self.vconn_source = false;
                    Ok(true)
                }
                Err(ProtocolError::Rx(RxError::ReceiveTimeout)) => Ok(false),
                Err(other) => Err(other),
            }
        } else {
            self.protocol_layer.driver().set_vconn(true).await;
            self.vconn_source = true;
            self.protocol_layer.transmit_control_message(ControlMessageType::PsRdy).await?;
            Ok(true)
        }
    }

    /// Handle a message that arrived in the ready state.
    fn ready_state_for_message(power_source: PowerSourceRequest, message: Message) -> State {
        match message.header.message_type() {
            MessageType::Data(DataMessageType::Request) => {
                if let Some(Payload::Data(Data::Request(received))) = message.payload {
                    State::NegotiateCapability(received)
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Data(DataMessageType::EprRequest) => {
                if let Some(Payload::Data(Data::EprRequest(received))) = message.payload {
                    State::NegotiateCapability(received.request)
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Data(DataMessageType::Alert) => {
                if let Some(Payload::Data(Data::Alert(alert))) = message.payload {
                    State::AlertReceived(power_source, alert)
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Data(DataMessageType::VendorDefined) => {
                if let Some(Payload::Data(Data::VendorDefined((header, objects)))) = message.payload {
                    State::VdmReceived(power_source, header, objects)
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Data(DataMessageType::EprMode) => {
                if let Some(Payload::Data(Data::EprMode(epr_mode))) = message.payload {
                    match epr_mode.action() {
                        Action::Enter => State::EprEvaluateEntry(power_source, epr_mode),
                        // The sink leaves EPR mode; renegotiate with SPR
                        // capabilities.
                        Action::Exit => State::SendCapabilities,
                        _ => State::SendNotSupported(power_source),
                    }
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Control(ControlMessageType::GetSourceCap) => State::SendCapabilities,
            MessageType::Control(ControlMessageType::GetSinkCap) => State::GiveSinkCap(power_source),
            MessageType::Control(ControlMessageType::GetStatus) => State::GiveStatus(power_source),
            MessageType::Control(ControlMessageType::GetPpsStatus) => State::GivePpsStatus(power_source),
            MessageType::Control(ControlMessageType::DrSwap) => State::EvaluateDrSwap(power_source),
            MessageType::Control(ControlMessageType::PrSwap) => State::EvaluatePrSwap(power_source),
            MessageType::Control(ControlMessageType::VconnSwap) => State::EvaluateVconnSwap(power_source),
            MessageType::Control(ControlMessageType::Ping) => State::Ready(power_source),
            MessageType::Extended(ExtendedMessageType::ExtendedControl) => {
                if let Some(Payload::Extended(Extended::ExtendedControl(control))) = &message.payload {
                    match control.message_type() {
                        ExtendedControlMessageType::EprKeepAlive => State::EprKeepAliveReceived(power_source),
                        ExtendedControlMessageType::EprGetSourceCap => State::GiveEprSourceCap,
                        _ => State::SendNotSupported(power_source),
                    }
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Extended(ExtendedMessageType::GetBatteryStatus) => {
                if let Some(Payload::Extended(Extended::GetBatteryStatus(request))) = message.payload {
                    State::GiveBatteryStatus(power_source, request)
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Extended(ExtendedMessageType::GetBatteryCap) => {
                if let Some(Payload::Extended(Extended::GetBatteryCap(request))) = message.payload {
                    State::GiveBatteryCap(power_source, request)
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Extended(ExtendedMessageType::GetManufacturerInfo) => {
                if let Some(Payload::Extended(Extended::GetManufacturerInfo(request))) = message.payload {
                    State::GiveManufacturerInfo(power_source, request)
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Extended(ExtendedMessageType::SecurityRequest) => {
                if let Some(Payload::Extended(Extended::SecurityRequest(request))) = message.payload {
                    State::GiveSecurityResponse(power_source, request)
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Extended(ExtendedMessageType::FirmwareUpdateRequest) => {
                if let Some(Payload::Extended(Extended::FirmwareUpdateRequest(request))) = message.payload {
                    State::GiveFirmwareUpdateResponse(power_source, request)
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            _ => State::SendNotSupported(power_source),
        }
    }

    async fn update_state(&mut self) -> Result<Option<Handover>, Error> {
        let new_state = match &self.state {
            State::Startup => {
                self.protocol_layer.reset();
                self.mode = Mode::Spr;
                self.contract_request = None;
                self.caps_counter.reset();

                State::SendCapabilities
            }
            State::SwapStart => {
                // Grace period before the new source talks.
                TimerType::SwapSourceStart.timeout::<TIMER>().await;
                self.caps_counter.reset();

                State::SendCapabilities
            }
            State::SendCapabilities => {
                let capabilities = self.device_policy_manager.source_capabilities();
                self.capabilities = Some(capabilities.clone());

                match self
                    .protocol_layer
                    .transmit_data(Data::SourceCapabilities(capabilities))
                    .await
                {
                    Ok(()) => {
                        // A PD-capable sink acknowledged the advertisement.
                        self.caps_counter.reset();
                        self.hard_reset_counter.reset();
                        State::WaitForRequest
                    }
                    Err(ProtocolError::TransmitRetriesExceeded) => {
                        // Nobody acknowledged; advertise again after a pause,
                        // up to the caps counter bound.
                        if self.caps_counter.increment().is_err() {
                            return Err(Error::PortPartnerUnresponsive);
                        }

                        TimerType::SourceCapability.timeout::<TIMER>().await;
                        State::SendCapabilities
                    }
                    Err(other) => return Err(other.into()),
                }
            }
            State::WaitForRequest => {
                let message = self
                    .protocol_layer
                    .receive_message_type(
                        &[
                            MessageType::Data(DataMessageType::Request),
                            MessageType::Data(DataMessageType::EprRequest),
                        ],
                        TimerType::SenderResponse,
                    )
                    .await?;

                match message.payload {
                    Some(Payload::Data(Data::Request(received))) => State::NegotiateCapability(received),
                    // EPR requests are only valid after EPR mode was entered.
                    Some(Payload::Data(Data::EprRequest(received))) if self.mode == Mode::Epr => {
                        State::NegotiateCapability(received.request)
                    }
                    _ => State::SendSoftReset,
                }
            }
            State::NegotiateCapability(received) => {
                let request = self.type_request(*received);

                let advertised = self.capabilities.clone().unwrap_or_default();

                match self.device_policy_manager.evaluate_request(&advertised, &request).await {
                    RequestDisposition::Accept => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Accept)
                            .await?;
                        State::TransitionSupply(request)
                    }
                    RequestDisposition::Reject => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Reject)
                            .await?;

                        match self.contract_request {
                            // Keep the present contract in place.
                            Some(contract_request) => State::Ready(contract_request),
                            // No contract to fall back to; the sink may try
                            // again with a new request.
                            None => State::WaitForRequest,
                        }
                    }
                    RequestDisposition::Wait => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::Wait)
                            .await?;

                        match self.contract_request {
                            Some(contract_request) => State::Ready(contract_request),
                            None => State::WaitForRequest,
                        }
                    }
                }
            }
            State::TransitionSupply(request) => {
                let request = *request;

                // Give the sink time to prepare for the new power level.
                TimerType::SrcTransition.timeout::<TIMER>().await;

                if let Some(contract) = self
                    .capabilities
                    .as_ref()
                    .and_then(|capabilities| request.operating_conditions(capabilities))
                {
                    self.device_policy_manager.transition_supply(&contract).await;
                }

                self.contract_request = Some(request);

                self.protocol_layer
                    .transmit_control_message(ControlMessageType::PsRdy)
                    .await?;

                State::Ready(request)
            }
            State::Ready(power_source) => {
                self.swap_in_progress = false;

                let receive_fut = self.protocol_layer.receive_message();
                let event_fut = self.device_policy_manager.get_event();

                match select(receive_fut, event_fut).await {
                    Either::First(message) => {
                        let (message, power_source) = (message?, *power_source);
                        Self::ready_state_for_message(power_source, message)
                    }
                    Either::Second(event) => match event {
                        Event::AdvertiseCapabilities => State::SendCapabilities,
                        Event::RequestSinkCapabilities => State::GetSinkCap(*power_source),
                        Event::GetSinkStatus => State::GetSinkStatus(*power_source),
                        Event::RequestPowerRoleSwap => State::SendPrSwap(*power_source),
                        Event::RequestDataRoleSwap => State::SendDrSwap(*power_source),
                        Event::RequestVconnSwap => State::SendVconnSwap(*power_source),
                        Event::SendAlert(alert) => State::SendAlert(*power_source, alert),
                        Event::DiscoverPortPartner => State::VdmDiscovery(*power_source),
                        Event::EnterMode(mode) => State::VdmEnterMode(*power_source, mode),
                        Event::ExitMode(mode) => State::VdmExitMode(*power_source, mode),
                        Event::None => State::Ready(*power_source),
                    },
                }
            }
            State::SendNotSupported(power_source) => {
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::NotSupported)
                    .await?;

                State::Ready(*power_source)
            }
            State::GetSinkCap(power_source) => {
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::GetSinkCap)
                    .await?;

                match self
                    .protocol_layer
                    .receive_message_type(
                        &[MessageType::Data(DataMessageType::SinkCapabilities)],
                        TimerType::SenderResponse,
                    )
                    .await
                {
                    Ok(message) => {
                        if let Some(Payload::Data(Data::SinkCapabilities(capabilities))) = message.payload {
                            self.device_policy_manager.sink_capabilities_received(&capabilities).await;
                        }
                        State::Ready(*power_source)
                    }
                    Err(ProtocolError::Rx(RxError::ReceiveTimeout)) => {
                        warn!("Get_Sink_Cap timeout, returning to Ready");
                        State::Ready(*power_source)
                    }
                    Err(other) => return Err(other.into()),
                }
            }
            State::GiveSinkCap(power_source) => match self.device_policy_manager.sink_capabilities() {
                Some(capabilities) => {
                    self.protocol_layer
                        .transmit_data(Data::SinkCapabilities(capabilities))
                        .await?;
                    State::Ready(*power_source)
                }
                None => State::SendNotSupported(*power_source),
            },
            State::GiveStatus(power_source) => {
                let status = self.device_policy_manager.status();
                self.protocol_layer.transmit_extended(Extended::Status(status)).await?;

                State::Ready(*power_source)
            }
            State::GivePpsStatus(power_source) => {
                let status = self.device_policy_manager.pps_status();
                self.protocol_layer.transmit_extended(Extended::PpsStatus(status)).await?;

                State::Ready(*power_source)
            }
            State::GiveBatteryStatus(power_source, request) => {
                let status = self.device_policy_manager.battery_status(request);
                self.protocol_layer.transmit_data(Data::BatteryStatus(status)).await?;

                State::Ready(*power_source)
            }
            State::GiveBatteryCap(power_source, request) => {
                let capabilities = self.device_policy_manager.battery_capabilities(request);
                self.protocol_layer
                    .transmit_extended(Extended::BatteryCapabilities(capabilities))
                    .await?;

                State::Ready(*power_source)
            }
            State::GiveManufacturerInfo(power_source, request) => {
                let info = self.device_policy_manager.manufacturer_info(request);
                self.protocol_layer
                    .transmit_extended(Extended::ManufacturerInfo(info))
                    .await?;

                State::Ready(*power_source)
            }
            State::GiveSecurityResponse(power_source, request) => {
                match self.device_policy_manager.security_request(request) {
                    Some(response) => {
                        self.protocol_layer
                            .transmit_extended(Extended::SecurityResponse(response))
                            .await?;
                        State::Ready(*power_source)
                    }
                    None => State::SendNotSupported(*power_source),
                }
            }
            State::GiveFirmwareUpdateResponse(power_source, request) => {
                match self.device_policy_manager.firmware_update_request(request) {
                    Some(response) => {
                        self.protocol_layer
                            .transmit_extended(Extended::FirmwareUpdateResponse(response))
                            .await?;
                        State::Ready(*power_source)
                    }
                    None => State::SendNotSupported(*power_source),
                }
            }
            State::GetSinkStatus(power_source) => {
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::GetStatus)
                    .await?;

                match self
                    .protocol_layer
                    .receive_message_type(
                        &[MessageType::Extended(ExtendedMessageType::Status)],
                        TimerType::SenderResponse,
                    )
                    .await
                {
                    Ok(message) => {
                        if let Some(Payload::Extended(Extended::Status(status))) = message.payload {
                            self.device_policy_manager.sink_status_received(&status).await;
                        }
                        State::Ready(*power_source)
                    }
                    Err(ProtocolError::Rx(RxError::ReceiveTimeout)) => {
                        warn!("Get_Status timeout, returning to Ready");
                        State::Ready(*power_source)
                    }
                    Err(other) => return Err(other.into()),
                }
            }
            State::AlertReceived(power_source, alert) => {
                let (power_source, alert) = (*power_source, *alert);
                self.device_policy_manager.alert_received(alert).await;

                State::GetSinkStatus(power_source)
            }
            State::SendAlert(power_source, alert) => {
                self.protocol_layer.transmit_data(Data::Alert(*alert)).await?;

                State::Ready(*power_source)
            }
            State::VdmReceived(power_source, vdm_header, objects) => {
                let power_source = *power_source;

                match vdm_header {
                    VdmHeader::Structured(header) => {
                        let header = *header;

                        match (header.command_type(), header.command()) {
                            (VdmCommandType::InitiatorReq, VdmCommand::Attention) => {
                                self.device_policy_manager
                                    .attention_received(header.standard_or_vid(), objects)
                                    .await;
                                State::Ready(power_source)
                            }
                            (VdmCommandType::InitiatorReq, VdmCommand::DiscoverIdentity) => {
                                // The port partner may discover us in turn.
                                match self.device_policy_manager.identity() {
                                    Some(identity) => {
                                        self.protocol_layer
                                            .transmit_vdm(
                                                VdmHeader::Structured(header.reply(VdmCommandType::ResponderAck)),
                                                &identity.to_objects(),
                                            )
                                            .await?;
                                    }
                                    None => {
                                        self.protocol_layer
                                            .transmit_vdm(
                                                VdmHeader::Structured(header.reply(VdmCommandType::ResponderNak)),
                                                &[],
                                            )
                                            .await?;
                                    }
                                }
                                State::Ready(power_source)
                            }
                            (VdmCommandType::InitiatorReq, _) => {
                                // Further discovery of a DFP is not offered.
                                self.protocol_layer
                                    .transmit_vdm(
                                        VdmHeader::Structured(header.reply(VdmCommandType::ResponderNak)),
                                        &[],
                                    )
                                    .await?;
                                State::Ready(power_source)
                            }
                            _ => {
                                // Responses are consumed within the discovery
                                // states; anything else is stale.
                                trace!("Ignoring unsolicited VDM response");
                                State::Ready(power_source)
                            }
                        }
                    }
                    VdmHeader::Unstructured(header) => {
                        match self.device_policy_manager.unstructured_vdm(*header, objects) {
                            Some((reply_header, reply_objects)) => {
                                self.protocol_layer
                                    .transmit_vdm(VdmHeader::Unstructured(reply_header), &reply_objects)
                                    .await?;
                                State::Ready(power_source)
                            }
                            None => State::SendNotSupported(power_source),
                        }
                    }
                }
            }
            State::VdmDiscovery(power_source) => {
                let power_source = *power_source;

                let Some(step) = self.discovery.next_step() else {
                    self.device_policy_manager.discovery_complete(&self.discovery).await;
                    return self.enter_ready(power_source);
                };

                let (svid, command) = match step {
                    DiscoveryStep::Identity => (PD_SID, VdmCommand::DiscoverIdentity),
                    DiscoveryStep::Svids => (PD_SID, VdmCommand::DiscoverSvids),
                    DiscoveryStep::Modes(svid) => (svid, VdmCommand::DiscoverModes),
                };

                let header = vdm::request_header(svid, command, 0);
                self.protocol_layer
                    .transmit_vdm(VdmHeader::Structured(header), &[])
                    .await?;

                match self
                    .protocol_layer
                    .receive_message_type(
                        &[MessageType::Data(DataMessageType::VendorDefined)],
                        TimerType::VdmResponse,
                    )
                    .await
                {
                    Ok(message) => {
                        let Some(Payload::Data(Data::VendorDefined((VdmHeader::Structured(reply), objects)))) =
                            message.payload
                        else {
                            // An unstructured reply ends discovery.
                            self.device_policy_manager.discovery_complete(&self.discovery).await;
                            return self.enter_ready(power_source);
                        };

                        match reply.command_type() {
                            VdmCommandType::ResponderAck => {
                                match step {
                                    DiscoveryStep::Identity => self.discovery.record_identity(&objects),
                                    DiscoveryStep::Svids => self.discovery.record_svids(&objects),
                                    DiscoveryStep::Modes(svid) => self.discovery.record_modes(svid, &objects),
                                }

                                // Continue with the next rung of the ladder.
                                State::VdmDiscovery(power_source)
                            }
                            VdmCommandType::ResponderBsy => {
                                // Busy responders are retried, bounded by the
                                // discover identity counter.
                                if self.discover_identity_counter.increment().is_err() {
                                    self.device_policy_manager.discovery_complete(&self.discovery).await;
                                    State::Ready(power_source)
                                } else {
                                    TimerType::DiscoverIdentity.timeout::<TIMER>().await;
                                    State::VdmDiscovery(power_source)
                                }
                            }
                            _ => {
                                // A negative acknowledge ends the ladder; this
                                // is not an error condition.
                                self.device_policy_manager.discovery_complete(&self.discovery).await;
                                State::Ready(power_source)
                            }
                        }
                    }
                    Err(ProtocolError::Rx(RxError::ReceiveTimeout)) => {
                        if self.discover_identity_counter.increment().is_err() {
                            self.device_policy_manager.discovery_complete(&self.discovery).await;
                            State::Ready(power_source)
                        } else {
                            State::VdmDiscovery(power_source)
                        }
                    }
                    Err(other) => return Err(other.into()),
                }
            }
            State::VdmEnterMode(power_source, mode) => {
                let (power_source, mode) = (*power_source, *mode);

                let header = vdm::request_header(mode.svid, VdmCommand::EnterMode, mode.position);
                self.protocol_layer
                    .transmit_vdm(VdmHeader::Structured(header), &[])
                    .await?;

                match self
                    .protocol_layer
                    .receive_message_type(
                        &[MessageType::Data(DataMessageType::VendorDefined)],
                        TimerType::VdmModeEntry,
                    )
                    .await
                {
                    Ok(message) => {
                        if let Some(Payload::Data(Data::VendorDefined((VdmHeader::Structured(reply), _)))) =
                            message.payload
                        {
                            if reply.command_type() == VdmCommandType::ResponderAck {
                                self.discovery.entered_mode = Some(mode);
                                self.device_policy_manager.mode_entered(mode).await;
                            }
                        }
                        State::Ready(power_source)
                    }
                    Err(ProtocolError::Rx(RxError::ReceiveTimeout)) => {
                        warn!("Mode entry timed out");
                        State::Ready(power_source)
                    }
                    Err(other) => return Err(other.into()),
                }
            }
            State::VdmExitMode(power_source, mode) => {
                let (power_source, mode) = (*power_source, *mode);

                let header = vdm::request_header(mode.svid, VdmCommand::ExitMode, mode.position);
                self.protocol_layer
                    .transmit_vdm(VdmHeader::Structured(header), &[])
                    .await?;

                match self
                    .protocol_layer
                    .receive_message_type(
                        &[MessageType::Data(DataMessageType::VendorDefined)],
                        TimerType::VdmModeExit,
                    )
                    .await
                {
                    Ok(_) | Err(ProtocolError::Rx(RxError::ReceiveTimeout)) => {
                        self.discovery.entered_mode = None;
                        self.device_policy_manager.mode_exited(mode).await;
                        State::Ready(power_source)
                    }
                    Err(other) => return Err(other.into()),
                }
            }
            State::EvaluateDrSwap(power_source) => {
                let power_source = *power_source;
                let new_role = self.data_role.swapped();

                if self.device_policy_manager.accept_data_role_swap(new_role).await {
                    self.protocol_layer
                        .transmit_control_message(ControlMessageType::Accept)
                        .await?;
                    self.complete_data_role_swap(new_role).await;
                } else {
                    self.protocol_layer
                        .transmit_control_message(ControlMessageType::Reject)
                        .await?;
                }

                State::Ready(power_source)
            }
            State::SendDrSwap(power_source) => {
                let power_source = *power_source;
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::DrSwap)
                    .await?;

                match self
                    .protocol_layer
                    .receive_message_type(
                        &[
                            MessageType::Control(ControlMessageType::Accept),
                            MessageType::Control(ControlMessageType::Reject),
                            MessageType::Control(ControlMessageType::Wait),
                        ],
                        TimerType::SenderResponse,
                    )
                    .await
                {
                    Ok(message) => {
                        if matches!(
                            message.header.message_type(),
                            MessageType::Control(ControlMessageType::Accept)
                        ) {
                            self.complete_data_role_swap(self.data_role.swapped()).await;
                        }
                        State::Ready(power_source)
                    }
                    Err(ProtocolError::Rx(RxError::ReceiveTimeout)) => State::Ready(power_source),
                    Err(other) => return Err(other.into()),
                }
            }
            State::EvaluatePrSwap(power_source) => {
                if self.device_policy_manager.accept_power_role_swap().await {
                    self.protocol_layer
                        .transmit_control_message(ControlMessageType::Accept)
                        .await?;
                    self.swap_in_progress = true;
                    State::PrSwapTransitionToOff(*power_source)
                } else {
                    self.protocol_layer
                        .transmit_control_message(ControlMessageType::Reject)
                        .await?;
                    State::Ready(*power_source)
                }
            }
            State::SendPrSwap(power_source) => {
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::PrSwap)
                    .await?;

                match self
                    .protocol_layer
                    .receive_message_type(
                        &[
                            MessageType::Control(ControlMessageType::Accept),
                            MessageType::Control(ControlMessageType::Reject),
                            MessageType::Control(ControlMessageType::Wait),
                        ],
                        TimerType::SenderResponse,
                    )
                    .await
                {
                    Ok(message) => {
                        if matches!(
                            message.header.message_type(),
                            MessageType::Control(ControlMessageType::Accept)
                        ) {
                            self.swap_in_progress = true;
                            State::PrSwapTransitionToOff(*power_source)
                        } else {
                            State::Ready(*power_source)
                        }
                    }
                    Err(ProtocolError::Rx(RxError::ReceiveTimeout)) => State::Ready(*power_source),
                    Err(other) => return Err(other.into()),
                }
            }
            State::PrSwapTransitionToOff(_) => {
                // Stop supplying power, then step down to the sink role.
                self.device_policy_manager.supply_off().await;
                self.protocol_layer.driver().set_power_role(PowerRole::Sink).await;
                self.protocol_layer.set_power_role(PowerRole::Sink);

                // Message ID counters reset on a power role swap.
                self.protocol_layer.reset();

                self.protocol_layer
                    .transmit_control_message(ControlMessageType::PsRdy)
                    .await?;

                State::PrSwapWaitSourceOn
            }
            State::PrSwapWaitSourceOn => {
                self.protocol_layer
                    .receive_message_type(&[MessageType::Control(ControlMessageType::PsRdy)], TimerType::PSSourceOn)
                    .await?;

                self.swap_in_progress = false;
                info!("Power role swap complete, handing over to the sink engine");

                return Ok(Some(Handover::PowerRoleSwap));
            }
            State::EvaluateVconnSwap(power_source) => {
                let power_source = *power_source;

                if self.device_policy_manager.accept_vconn_swap().await {
                    self.protocol_layer
                        .transmit_control_message(ControlMessageType::Accept)
                        .await?;

                    match self.swap_vconn().await? {
                        true => State::Ready(power_source),
                        false => State::HardReset,
                    }
                } else {
                    self.protocol_layer
                        .transmit_control_message(ControlMessageType::Reject)
                        .await?;
                    State::Ready(power_source)
                }
            }
            State::SendVconnSwap(power_source) => {
                let power_source = *power_source;
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::VconnSwap)
                    .await?;

                match self
                    .protocol_layer
                    .receive_message_type(
                        &[
                            MessageType::Control(ControlMessageType::Accept),
                            MessageType::Control(ControlMessageType::Reject),
                            MessageType::Control(ControlMessageType::Wait),
                        ],
                        TimerType::SenderResponse,
                    )
                    .await
                {
                    Ok(message) => {
                        if matches!(
                            message.header.message_type(),
                            MessageType::Control(ControlMessageType::Accept)
                        ) {
                            match self.swap_vconn().await? {
                                true => State::Ready(power_source),
                                false => State::HardReset,
                            }
                        } else {
                            State::Ready(power_source)
                        }
                    }
                    Err(ProtocolError::Rx(RxError::ReceiveTimeout)) => State::Ready(power_source),
                    Err(other) => return Err(other.into()),
                }
            }
            State::SendSoftReset => {
                self.protocol_layer.reset();

                self.protocol_layer
                    .transmit_control_message(ControlMessageType::SoftReset)
                    .await?;

                self.protocol_layer
                    .receive_message_type(
                        &[MessageType::Control(ControlMessageType::Accept)],
                        TimerType::SenderResponse,
                    )
                    .await?;

                State::SendCapabilities
            }
            State::SoftReset => {
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::Accept)
                    .await?;

                self.protocol_layer.reset();

                State::SendCapabilities
            }
            State::HardReset => {
                if self.hard_reset_counter.increment().is_err() {
                    return Err(Error::PortPartnerUnresponsive);
                }

                if self.swap_in_progress {
                    self.swap_in_progress = false;
                    if self.swap_hard_reset_counter.increment().is_err() {
                        return Err(Error::PortPartnerUnresponsive);
                    }
                }

                self.protocol_layer.hard_reset().await?;
                TimerType::PSHardReset.timeout::<TIMER>().await;

                State::TransitionToDefault
            }
            State::TransitionToDefault => {
                // The supply returns to vSafe5V.
                self.device_policy_manager.hard_reset().await;

                self.protocol_layer.reset();
                self.mode = Mode::Spr;
                self.contract_request = None;
                self.discovery.reset();

                // The data role returns to DFP.
                if self.data_role != DataRole::Dfp {
                    self.complete_data_role_swap(DataRole::Dfp).await;
                }

                // Re-assert the source role after the recovery period.
                TimerType::SrcRecover.timeout::<TIMER>().await;
                self.protocol_layer.driver().set_power_role(PowerRole::Source).await;

                State::Startup
            }
            State::EprEvaluateEntry(power_source, epr_mode) => {
                let (power_source, _epr_mode) = (*power_source, *epr_mode);

                if self.device_policy_manager.accept_epr_mode().await {
                    self.protocol_layer
                        .transmit_epr_mode(Action::EnterAcknowledged, 0)
                        .await?;

                    // Cable capability checks are the platform's concern; the
                    // driver vetted them before granting EPR mode.
                    self.protocol_layer.transmit_epr_mode(Action::EnterSucceeded, 0).await?;
                    self.mode = Mode::Epr;

                    State::GiveEprSourceCap
                } else {
                    self.protocol_layer
                        .transmit_epr_mode(Action::EnterFailed, DataEnterFailed::SourceUnableToEnterEprMode.into())
                        .await?;

                    State::Ready(power_source)
                }
            }
            State::GiveEprSourceCap => {
                let capabilities = self.device_policy_manager.epr_source_capabilities();
                self.capabilities = Some(capabilities.clone());

                self.protocol_layer
                    .transmit_extended(Extended::EprSourceCapabilities(capabilities.0))
                    .await?;

                State::WaitForRequest
            }
            State::EprKeepAliveReceived(power_source) => {
                self.protocol_layer
                    .transmit_extended_control_message(ExtendedControlMessageType::EprKeepAliveAck)
                    .await?;

                State::Ready(*power_source)
            }
        };

        self.state = new_state;

        Ok(None)
    }

    /// Set the ready state and finish the step.
    fn enter_ready(&mut self, power_source: PowerSourceRequest) -> Result<Option<Handover>, Error> {
        self.state = State::Ready(power_source);
        Ok(None)
    }
}
