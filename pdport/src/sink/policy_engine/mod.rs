//! Policy engine for the implementation of a sink.
//!
//! See [8.3.3.3].
use core::marker::PhantomData;

use embassy_futures::select::{Either3, select3};
use heapless::Vec;
use pdport_traits::Driver;
use uom::si::power::watt;

use super::device_policy_manager::{DevicePolicyManager, Event};
use crate::counters::{Counter, CounterType};
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::data::alert::AlertDataObject;
use crate::protocol_layer::message::data::epr_mode::{self, Action};
use crate::protocol_layer::message::data::request::{EprRequest, PowerSourceRequest};
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
use crate::vdm;
use crate::{DataRole, Handover, PowerRole, units};

#[cfg(test)]
mod tests;

/// Sink capability mode.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    /// The classic mode of PD operation where explicit contracts are negotiated using SPR (A)PDOs.
    Spr,
    /// A Power Delivery mode of operation where the maximum allowable voltage is 48 V.
    Epr,
}

/// The phase of contract negotiation that the port is in.
#[derive(Debug, Clone, Copy, Default)]
enum ContractPhase {
    /// No contract was negotiated yet, the port runs on the default supply.
    #[default]
    Default5V,
    /// A request was accepted, the supply is transitioning.
    Transitioning,
    /// An explicit contract is in place.
    Explicit,
}

/// Sink states.
#[derive(Debug, Clone)]
enum State {
    /// Default state at startup.
    Startup,
    Discovery,
    WaitForCapabilities,
    EvaluateCapabilities(SourceCapabilities),
    SelectCapability(PowerSourceRequest),
    TransitionSink(PowerSourceRequest),
    /// Ready state. The bool indicates if we entered due to receiving a Wait message,
    /// which requires running the sink request timer before allowing re-request.
    Ready(PowerSourceRequest, bool),
    SendNotSupported(PowerSourceRequest),
    /// Report sink capabilities, in SPR or EPR form.
    GiveSinkCap(Mode, PowerSourceRequest),
    GetSourceCap(Mode, PowerSourceRequest),
    GiveStatus(PowerSourceRequest),
    GivePpsStatus(PowerSourceRequest),
    GiveBatteryStatus(PowerSourceRequest, battery::GetBatteryStatus),
    GiveBatteryCap(PowerSourceRequest, battery::GetBatteryCap),
    GiveManufacturerInfo(PowerSourceRequest, manufacturer_info::GetManufacturerInfo),
    GiveSecurityResponse(PowerSourceRequest, Vec<u8, MAX_EXTENDED_DATA_SIZE>),
    GiveFirmwareUpdateResponse(PowerSourceRequest, Vec<u8, MAX_EXTENDED_DATA_SIZE>),
    GetSourceStatus(PowerSourceRequest),
    AlertReceived(PowerSourceRequest, AlertDataObject),
    SendAttention(PowerSourceRequest, u16),
    VdmReceived(PowerSourceRequest, VdmHeader, Vec<u32, 7>),

    // Role swap states.
    EvaluateDrSwap(PowerSourceRequest),
    SendDrSwap(PowerSourceRequest),
    EvaluatePrSwap(PowerSourceRequest),
    SendPrSwap(PowerSourceRequest),
    /// Wait for the original source to turn off its supply, then take over.
    PrSwapTransitionToOff(PowerSourceRequest),
    EvaluateVconnSwap(PowerSourceRequest),
    SendVconnSwap(PowerSourceRequest),

    // Reset states.
    SendSoftReset,
    SoftReset,
    HardReset,
    TransitionToDefault,

    // EPR states.
    EprModeEntry(PowerSourceRequest, units::Power),
    EprEntryWaitForResponse(PowerSourceRequest),
    EprWaitForCapabilities(PowerSourceRequest),
    EprSendExit,
    EprExitReceived(PowerSourceRequest),
    EprKeepAlive(PowerSourceRequest),
}

/// Errors that can occur in the sink policy engine state machine.
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

/// Implementation of the sink policy engine.
#[derive(Debug)]
pub struct Sink<DRIVER: Driver, TIMER: Timer, DPM: DevicePolicyManager> {
    device_policy_manager: DPM,
    pub(crate) protocol_layer: ProtocolLayer<DRIVER, TIMER>,
    contract_phase: ContractPhase,
    hard_reset_counter: Counter,
    swap_hard_reset_counter: Counter,
    source_capabilities: Option<SourceCapabilities>,
    mode: Mode,
    pub(crate) state: State,
    data_role: DataRole,
    /// Whether this port currently supplies VCONN.
    vconn_source: bool,
    /// Whether a power role swap is being carried out.
    swap_in_progress: bool,
    /// Tracks whether a get-source-capabilities request is pending.
    ///
    /// In EPR mode, source capabilities that were not requested trigger a
    /// hard reset.
    get_source_cap_pending: bool,

    _timer: PhantomData<TIMER>,
}

impl<DRIVER: Driver, TIMER: Timer, DPM: DevicePolicyManager> Sink<DRIVER, TIMER, DPM> {
    /// Create a fresh protocol layer with initial state.
    fn new_protocol_layer(driver: DRIVER, data_role: DataRole) -> ProtocolLayer<DRIVER, TIMER> {
        let header = Header::new_template(data_role, PowerRole::Sink, SpecificationRevision::R3_X);
        ProtocolLayer::new(driver, header)
    }

    /// Create a new sink policy engine with a given `driver`.
    pub fn new(driver: DRIVER, device_policy_manager: DPM) -> Self {
        Self::new_with_role(driver, device_policy_manager, DataRole::Ufp)
    }

    /// Create a new sink policy engine with a given initial data role.
    ///
    /// Used after power role swaps, which leave the data role unchanged.
    pub fn new_with_role(driver: DRIVER, device_policy_manager: DPM, data_role: DataRole) -> Self {
        Self {
            device_policy_manager,
            protocol_layer: Self::new_protocol_layer(driver, data_role),
            state: State::Startup,
            contract_phase: Default::default(),
            hard_reset_counter: Counter::new(CounterType::HardReset),
            swap_hard_reset_counter: Counter::new(CounterType::SwapHardReset),
            source_capabilities: None,
            mode: Mode::Spr,
            data_role,
            vconn_source: false,
            swap_in_progress: false,
            get_source_cap_pending: false,
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
                error!("Unrecoverable error {:?} in sink state transition", other);
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
            // See [6.3.13].
            (State::SoftReset | State::SendSoftReset, ProtocolError::TransmitRetriesExceeded) => {
                Some(State::HardReset)
            }

            // Capability wait timeout escalates to hard reset.
            (State::WaitForCapabilities, ProtocolError::Rx(RxError::ReceiveTimeout)) => Some(State::HardReset),

            // Sender response timeout after a request escalates to hard reset.
            (State::SelectCapability(_), ProtocolError::Rx(RxError::ReceiveTimeout)) => Some(State::HardReset),

            // Any protocol error during a power transition escalates to hard
            // reset. See [Table 6.72].
            (State::TransitionSink(_), _) => Some(State::HardReset),

            // Failures while the supply roles are mid-swap are not recoverable
            // by a soft reset.
            (State::PrSwapTransitionToOff(_), _) => Some(State::HardReset),

            // Unexpected messages indicate a protocol error and demand a soft reset.
            (_, ProtocolError::UnexpectedMessage) => Some(State::SendSoftReset),

            // Unsupported messages in the ready state are answered with Not_Supported.
            (State::Ready(power_source, _), ProtocolError::Rx(RxError::UnsupportedMessage)) => {
                Some(State::SendNotSupported(*power_source))
            }

            // Transmission failure without acknowledgment demands a soft reset.
            // See [6.6.9.1].
            (_, ProtocolError::TransmitRetriesExceeded) => Some(State::SendSoftReset),

            // Unhandled protocol errors: log and continue.
            (_, error) => {
                error!("Protocol error {:?} in sink state transition", error);
                None
            }
        };

        if let Some(state) = new_state {
            self.state = state;
        }

        Ok(None)
    }

    /// Run the sink's state machine continuously.
    ///
    /// Returns with a [`Handover`] after a completed power role swap, and
    /// with an error if the port partner is unresponsive.
    pub async fn run(&mut self) -> Result<Handover, Error> {
        self.device_policy_manager.attached().await;

        loop {
            if let Some(handover) = self.run_step().await? {
                return Ok(handover);
            }
        }
    }

    /// Extract source capabilities from a received message.
    ///
    /// Accepts regular and EPR source capabilities, since EPR mode persists
    /// through soft resets.
    fn extract_source_capabilities(message: Message) -> Option<SourceCapabilities> {
        match message.payload {
            Some(Payload::Data(Data::SourceCapabilities(capabilities))) => Some(capabilities),
            Some(Payload::Extended(Extended::EprSourceCapabilities(pdos))) => Some(SourceCapabilities(pdos)),
            _ => None,
        }
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
            // The partner becomes the VCONN source and announces its supply.
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
    fn ready_state_for_message(
        mode: Mode,
        get_source_cap_pending: &mut bool,
        power_source: PowerSourceRequest,
        message: Message,
    ) -> State {
        match message.header.message_type() {
            MessageType::Data(DataMessageType::SourceCapabilities) => {
                // In EPR mode, source capabilities that were not requested
                // with a get-source-capabilities message trigger a hard reset.
                if mode == Mode::Epr && !*get_source_cap_pending {
                    State::HardReset
                } else if let Some(capabilities) = Self::extract_source_capabilities(message) {
                    *get_source_cap_pending = false;
                    State::EvaluateCapabilities(capabilities)
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Extended(ExtendedMessageType::EprSourceCapabilities) => {
                if let Some(capabilities) = Self::extract_source_capabilities(message) {
                    *get_source_cap_pending = false;

                    // EPR capabilities with an EPR PDO in an SPR position are
                    // invalid and demand a hard reset.
                    if mode == Mode::Epr && capabilities.has_epr_pdo_in_spr_positions() {
                        State::HardReset
                    } else {
                        State::EvaluateCapabilities(capabilities)
                    }
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Data(DataMessageType::EprMode) => State::EprExitReceived(power_source),
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
            MessageType::Control(ControlMessageType::GetSinkCap) => State::GiveSinkCap(Mode::Spr, power_source),
            MessageType::Control(ControlMessageType::GetStatus) => State::GiveStatus(power_source),
            MessageType::Control(ControlMessageType::GetPpsStatus) => State::GivePpsStatus(power_source),
            MessageType::Control(ControlMessageType::DrSwap) => State::EvaluateDrSwap(power_source),
            MessageType::Control(ControlMessageType::PrSwap) => State::EvaluatePrSwap(power_source),
            MessageType::Control(ControlMessageType::VconnSwap) => State::EvaluateVconnSwap(power_source),
            MessageType::Control(ControlMessageType::Ping) => State::Ready(power_source, false),
            MessageType::Extended(ExtendedMessageType::ExtendedControl) => {
                if let Some(Payload::Extended(Extended::ExtendedControl(control))) = &message.payload {
                    match control.message_type() {
                        ExtendedControlMessageType::EprGetSinkCap => State::GiveSinkCap(Mode::Epr, power_source),
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
                self.contract_phase = Default::default();
                self.protocol_layer.reset();
                self.mode = Mode::Spr;

                State::Discovery
            }
            State::Discovery => {
                self.protocol_layer.wait_for_vbus().await;
                self.source_capabilities = None;

                State::WaitForCapabilities
            }
            State::WaitForCapabilities => {
                let message = self
                    .protocol_layer
                    .wait_for_source_capabilities(TimerType::TypeCSinkWaitCap)
                    .await?;

                match Self::extract_source_capabilities(message) {
                    Some(capabilities) => State::EvaluateCapabilities(capabilities),
                    None => State::WaitForCapabilities,
                }
            }
            State::EvaluateCapabilities(capabilities) => {
                // Sink now knows that it is attached.
                self.source_capabilities = Some(capabilities.clone());

                self.hard_reset_counter.reset();

                let request = self
                    .device_policy_manager
                    .request(self.source_capabilities.as_ref().unwrap())
                    .await;

                State::SelectCapability(request)
            }
            State::SelectCapability(power_source) => {
                match self.mode {
                    Mode::Spr => self.protocol_layer.request_power(*power_source).await?,
                    Mode::Epr => {
                        // EPR requests echo the PDO that they refer to.
                        let position = power_source.object_position() as usize;
                        let pdo = self
                            .source_capabilities
                            .as_ref()
                            .and_then(|caps| caps.pdos().get(position.saturating_sub(1)))
                            .copied();

                        match pdo {
                            Some(pdo) => {
                                self.protocol_layer
                                    .transmit_data(Data::EprRequest(EprRequest::new(*power_source, pdo)))
                                    .await?
                            }
                            None => {
                                error!("EPR request for an unknown object position");
                                self.state = State::SendSoftReset;
                                return Ok(None);
                            }
                        }
                    }
                }

                let message_type = self
                    .protocol_layer
                    .receive_message_type(
                        &[
                            MessageType::Control(ControlMessageType::Accept),
                            MessageType::Control(ControlMessageType::Wait),
                            MessageType::Control(ControlMessageType::Reject),
                        ],
                        TimerType::SenderResponse,
                    )
                    .await?
                    .header
                    .message_type();

                let MessageType::Control(control_message_type) = message_type else {
                    unreachable!()
                };

                match (self.contract_phase, control_message_type) {
                    (_, ControlMessageType::Accept) => State::TransitionSink(*power_source),
                    (ContractPhase::Default5V, ControlMessageType::Wait | ControlMessageType::Reject) => {
                        State::WaitForCapabilities
                    }
                    (_, ControlMessageType::Reject) => State::Ready(*power_source, false),
                    (_, ControlMessageType::Wait) => {
                        // Re-request after the sink request timer has run.
                        State::Ready(*power_source, true)
                    }
                    _ => unreachable!(),
                }
            }
            State::TransitionSink(power_source) => {
                self.protocol_layer
                    .receive_message_type(&[MessageType::Control(ControlMessageType::PsRdy)], TimerType::PSTransition)
                    .await?;

                self.contract_phase = ContractPhase::Transitioning;
                self.device_policy_manager.transition_power(power_source).await;

                if let Some(contract) = self
                    .source_capabilities
                    .as_ref()
                    .and_then(|caps| power_source.operating_conditions(caps))
                {
                    self.device_policy_manager.contract_established(&contract).await;
                }

                State::Ready(*power_source, false)
            }
            State::Ready(power_source, after_wait) => {
                self.contract_phase = ContractPhase::Explicit;
                self.swap_in_progress = false;

                let receive_fut = self.protocol_layer.receive_message();
                let event_fut = self
                    .device_policy_manager
                    .get_event(self.source_capabilities.as_ref().unwrap());

                let pps_periodic_fut = async {
                    match power_source {
                        PowerSourceRequest::Pps(_) => TimerType::SinkPpsPeriodic.timeout::<TIMER>().await,
                        _ => core::future::pending().await,
                    }
                };
                let epr_keep_alive_fut = async {
                    match self.mode {
                        Mode::Epr => TimerType::SinkEprKeepAlive.timeout::<TIMER>().await,
                        Mode::Spr => core::future::pending().await,
                    }
                };
                // After a Wait response, delay the re-request by the sink
                // request timer.
                let sink_request_fut = async {
                    if *after_wait {
                        TimerType::SinkRequest.timeout::<TIMER>().await
                    } else {
                        core::future::pending().await
                    }
                };
                let timers_fut = async { select3(pps_periodic_fut, epr_keep_alive_fut, sink_request_fut).await };

                match select3(receive_fut, event_fut, timers_fut).await {
                    // A message was received.
                    Either3::First(message) => {
                        let (message, power_source) = (message?, *power_source);
                        Self::ready_state_for_message(self.mode, &mut self.get_source_cap_pending, power_source, message)
                    }
                    // Event from the device policy manager.
                    Either3::Second(event) => match event {
                        Event::RequestSourceCapabilities => State::GetSourceCap(Mode::Spr, *power_source),
                        Event::RequestPower(request) => State::SelectCapability(request),
                        Event::RequestPowerRoleSwap => State::SendPrSwap(*power_source),
                        Event::RequestDataRoleSwap => State::SendDrSwap(*power_source),
                        Event::RequestVconnSwap => State::SendVconnSwap(*power_source),
                        Event::GetSourceStatus => State::GetSourceStatus(*power_source),
                        Event::SendAttention(svid) => State::SendAttention(*power_source, svid),
                        Event::EnterEprMode(pdp) => State::EprModeEntry(*power_source, pdp),
                        Event::ExitEprMode => State::EprSendExit,
                        Event::None => State::Ready(*power_source, false),
                    },
                    // Timer timeout handling.
                    Either3::Third(timeout_source) => match timeout_source {
                        // PPS periodic timeout: re-request as keep-alive.
                        Either3::First(_) => State::SelectCapability(*power_source),
                        // EPR keep-alive timeout.
                        Either3::Second(_) => State::EprKeepAlive(*power_source),
                        // Sink request timeout: re-request power after a Wait.
                        Either3::Third(_) => State::SelectCapability(*power_source),
                    },
                }
            }
            State::SendNotSupported(power_source) => {
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::NotSupported)
                    .await?;

                State::Ready(*power_source, false)
            }
            State::AlertReceived(power_source, alert) => {
                let (power_source, alert) = (*power_source, *alert);
                self.device_policy_manager.alert_received(alert).await;

                // Follow up with a status query, so the alert condition is
                // known in detail.
                State::GetSourceStatus(power_source)
            }
            State::GetSourceStatus(power_source) => {
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
                            self.device_policy_manager.source_status_received(&status).await;
                        }
                        State::Ready(*power_source, false)
                    }
                    Err(ProtocolError::Rx(RxError::ReceiveTimeout)) => {
                        warn!("Get_Status timeout, returning to Ready");
                        State::Ready(*power_source, false)
                    }
                    Err(other) => return Err(other.into()),
                }
            }
            State::GiveStatus(power_source) => {
                let status = self.device_policy_manager.status();
                self.protocol_layer.transmit_extended(Extended::Status(status)).await?;

                State::Ready(*power_source, false)
            }
            State::GivePpsStatus(power_source) => {
                let status = self.device_policy_manager.pps_status();
                self.protocol_layer.transmit_extended(Extended::PpsStatus(status)).await?;

                State::Ready(*power_source, false)
            }
            State::GiveBatteryStatus(power_source, request) => {
                let status = self.device_policy_manager.battery_status(request);
                self.protocol_layer.transmit_data(Data::BatteryStatus(status)).await?;

                State::Ready(*power_source, false)
            }
            State::GiveBatteryCap(power_source, request) => {
                let capabilities = self.device_policy_manager.battery_capabilities(request);
                self.protocol_layer
                    .transmit_extended(Extended::BatteryCapabilities(capabilities))
                    .await?;

                State::Ready(*power_source, false)
            }
            State::GiveManufacturerInfo(power_source, request) => {
                let info = self.device_policy_manager.manufacturer_info(request);
                self.protocol_layer
                    .transmit_extended(Extended::ManufacturerInfo(info))
                    .await?;

                State::Ready(*power_source, false)
            }
            State::GiveSecurityResponse(power_source, request) => {
                match self.device_policy_manager.security_request(request) {
                    Some(response) => {
                        self.protocol_layer
                            .transmit_extended(Extended::SecurityResponse(response))
                            .await?;
                        State::Ready(*power_source, false)
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
                        State::Ready(*power_source, false)
                    }
                    None => State::SendNotSupported(*power_source),
                }
            }
            State::SendAttention(power_source, svid) => {
                let header = vdm::request_header(*svid, VdmCommand::Attention, 0);
                self.protocol_layer
                    .transmit_vdm(VdmHeader::Structured(header), &[])
                    .await?;

                State::Ready(*power_source, false)
            }
            State::VdmReceived(power_source, vdm_header, objects) => {
                let power_source = *power_source;

                match vdm_header {
                    VdmHeader::Structured(header) => {
                        let header = *header;

                        if header.command_type() != VdmCommandType::InitiatorReq {
                            // A response without an initiated exchange, ignore.
                            trace!("Ignoring unsolicited VDM response");
                            State::Ready(power_source, false)
                        } else {
                            match header.command() {
                                VdmCommand::DiscoverIdentity => match self.device_policy_manager.identity() {
                                    Some(identity) => {
                                        self.protocol_layer
                                            .transmit_vdm(
                                                VdmHeader::Structured(
                                                    header.reply(VdmCommandType::ResponderAck),
                                                ),
                                                &identity.to_objects(),
                                            )
                                            .await?;
                                        State::Ready(power_source, false)
                                    }
                                    None => {
                                        self.protocol_layer
                                            .transmit_vdm(
                                                VdmHeader::Structured(
                                                    header.reply(VdmCommandType::ResponderNak),
                                                ),
                                                &[],
                                            )
                                            .await?;
                                        State::Ready(power_source, false)
                                    }
                                },
                                VdmCommand::DiscoverSvids => {
                                    let svids = self.device_policy_manager.svids();
                                    let (reply, objects) = if svids.is_empty() {
                                        (VdmCommandType::ResponderNak, Vec::new())
                                    } else {
                                        (VdmCommandType::ResponderAck, vdm::svids_to_objects(&svids))
                                    };

                                    self.protocol_layer
                                        .transmit_vdm(VdmHeader::Structured(header.reply(reply)), &objects)
                                        .await?;
                                    State::Ready(power_source, false)
                                }
                                VdmCommand::DiscoverModes => {
                                    let modes = self.device_policy_manager.modes(header.standard_or_vid());
                                    let reply = if modes.is_empty() {
                                        VdmCommandType::ResponderNak
                                    } else {
                                        VdmCommandType::ResponderAck
                                    };

                                    self.protocol_layer
                                        .transmit_vdm(VdmHeader::Structured(header.reply(reply)), &modes)
                                        .await?;
                                    State::Ready(power_source, false)
                                }
                                VdmCommand::EnterMode => {
                                    let accepted = self
                                        .device_policy_manager
                                        .enter_mode(header.standard_or_vid(), header.object_position())
                                        .await;

                                    let reply = if accepted {
                                        VdmCommandType::ResponderAck
                                    } else {
                                        VdmCommandType::ResponderNak
                                    };

                                    self.protocol_layer
                                        .transmit_vdm(VdmHeader::Structured(header.reply(reply)), &[])
                                        .await?;
                                    State::Ready(power_source, false)
                                }
                                VdmCommand::ExitMode => {
                                    let accepted = self
                                        .device_policy_manager
                                        .exit_mode(header.standard_or_vid(), header.object_position())
                                        .await;

                                    let reply = if accepted {
                                        VdmCommandType::ResponderAck
                                    } else {
                                        VdmCommandType::ResponderNak
                                    };

                                    self.protocol_layer
                                        .transmit_vdm(VdmHeader::Structured(header.reply(reply)), &[])
                                        .await?;
                                    State::Ready(power_source, false)
                                }
                                VdmCommand::Attention => {
                                    // Notifications do not demand a reply.
                                    State::Ready(power_source, false)
                                }
                                VdmCommand::SvidSpecific(_) => {
                                    self.protocol_layer
                                        .transmit_vdm(
                                            VdmHeader::Structured(header.reply(VdmCommandType::ResponderNak)),
                                            &[],
                                        )
                                        .await?;
                                    State::Ready(power_source, false)
                                }
                            }
                        }
                    }
                    VdmHeader::Unstructured(header) => {
                        match self.device_policy_manager.unstructured_vdm(*header, objects) {
                            Some((reply_header, reply_objects)) => {
                                self.protocol_layer
                                    .transmit_vdm(VdmHeader::Unstructured(reply_header), &reply_objects)
                                    .await?;
                                State::Ready(power_source, false)
                            }
                            None => State::SendNotSupported(power_source),
                        }
                    }
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

                State::Ready(power_source, false)
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
                        State::Ready(power_source, false)
                    }
                    // No response: stay with the current roles.
                    Err(ProtocolError::Rx(RxError::ReceiveTimeout)) => State::Ready(power_source, false),
                    Err(other) => return Err(other.into()),
                }
            }
            State::EvaluatePrSwap(power_source) => {
                let dual_role_power = self
                    .source_capabilities
                    .as_ref()
                    .map(SourceCapabilities::dual_role_power)
                    .unwrap_or_default();

                if dual_role_power && self.device_policy_manager.accept_power_role_swap().await {
                    self.protocol_layer
                        .transmit_control_message(ControlMessageType::Accept)
                        .await?;
                    self.swap_in_progress = true;
                    State::PrSwapTransitionToOff(*power_source)
                } else {
                    self.protocol_layer
                        .transmit_control_message(ControlMessageType::Reject)
                        .await?;
                    State::Ready(*power_source, false)
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
                            State::Ready(*power_source, false)
                        }
                    }
                    Err(ProtocolError::Rx(RxError::ReceiveTimeout)) => State::Ready(*power_source, false),
                    Err(other) => return Err(other.into()),
                }
            }
            State::PrSwapTransitionToOff(_) => {
                // Wait for the original source to turn off its supply.
                self.protocol_layer
                    .receive_message_type(&[MessageType::Control(ControlMessageType::PsRdy)], TimerType::PSSourceOff)
                    .await?;

                // Take over the source role: assert Rp, drive VBus.
                self.protocol_layer.driver().set_power_role(PowerRole::Source).await;
                self.protocol_layer.set_power_role(PowerRole::Source);

                // Message ID counters reset on a power role swap.
                self.protocol_layer.reset();

                self.protocol_layer
                    .transmit_control_message(ControlMessageType::PsRdy)
                    .await?;

                self.swap_in_progress = false;
                info!("Power role swap complete, handing over to the source engine");

                return Ok(Some(Handover::PowerRoleSwap));
            }
            State::EvaluateVconnSwap(power_source) => {
                let power_source = *power_source;

                if self.device_policy_manager.accept_vconn_swap().await {
                    self.protocol_layer
                        .transmit_control_message(ControlMessageType::Accept)
                        .await?;

                    match self.swap_vconn().await? {
                        true => State::Ready(power_source, false),
                        false => State::HardReset,
                    }
                } else {
                    self.protocol_layer
                        .transmit_control_message(ControlMessageType::Reject)
                        .await?;
                    State::Ready(power_source, false)
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
                                true => State::Ready(power_source, false),
                                false => State::HardReset,
                            }
                        } else {
                            State::Ready(power_source, false)
                        }
                    }
                    Err(ProtocolError::Rx(RxError::ReceiveTimeout)) => State::Ready(power_source, false),
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

                State::WaitForCapabilities
            }
            State::SoftReset => {
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::Accept)
                    .await?;

                self.protocol_layer.reset();

                State::WaitForCapabilities
            }
            State::HardReset => {
                // The hard reset counter bounds reset attempts within one
                // session. Exceeding it means the source is unresponsive.
                if self.hard_reset_counter.increment().is_err() {
                    return Err(Error::PortPartnerUnresponsive);
                }

                // Hard resets that were caused by a failed swap count against
                // the swap hard reset bound as well.
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
                // The device shall transition to its default power level.
                self.device_policy_manager.hard_reset().await;

                // Protocol layers reset as for a soft reset.
                self.protocol_layer.reset();

                // Hard reset exits EPR mode and voids the contract.
                self.mode = Mode::Spr;
                self.contract_phase = ContractPhase::Default5V;
                self.source_capabilities = None;

                // The data role returns to UFP.
                if self.data_role != DataRole::Ufp {
                    self.complete_data_role_swap(DataRole::Ufp).await;
                }

                State::Startup
            }
            State::GiveSinkCap(response_mode, power_source) => {
                let sink_capabilities = self.device_policy_manager.sink_capabilities();

                match response_mode {
                    Mode::Spr => {
                        self.protocol_layer
                            .transmit_data(Data::SinkCapabilities(sink_capabilities))
                            .await?;
                    }
                    Mode::Epr => {
                        self.protocol_layer
                            .transmit_extended(Extended::EprSinkCapabilities(sink_capabilities.0))
                            .await?;
                    }
                }

                State::Ready(*power_source, false)
            }
            State::GetSourceCap(requested_mode, power_source) => {
                // Track that source capabilities were requested; in EPR mode,
                // unrequested capabilities demand a hard reset.
                self.get_source_cap_pending = true;

                match requested_mode {
                    Mode::Spr => {
                        self.protocol_layer
                            .transmit_control_message(ControlMessageType::GetSourceCap)
                            .await?;
                    }
                    Mode::Epr => {
                        self.protocol_layer
                            .transmit_extended_control_message(ExtendedControlMessageType::EprGetSourceCap)
                            .await?;
                    }
                };

                let result = self
                    .protocol_layer
                    .wait_for_source_capabilities(TimerType::SenderResponse)
                    .await;

                self.get_source_cap_pending = false;

                let message = match result {
                    Ok(message) => message,
                    Err(ProtocolError::Rx(RxError::ReceiveTimeout)) => {
                        warn!("Get_Source_Cap timeout, returning to Ready");
                        self.state = State::Ready(*power_source, false);
                        return Ok(None);
                    }
                    Err(other) => return Err(other.into()),
                };

                let received_epr = matches!(
                    message.header.message_type(),
                    MessageType::Extended(ExtendedMessageType::EprSourceCapabilities)
                );

                let Some(capabilities) = Self::extract_source_capabilities(message) else {
                    return Ok(None);
                };

                self.device_policy_manager.inform(&capabilities).await;

                // Only evaluate when the response matches the requested mode.
                let mode_matches = match (requested_mode, self.mode) {
                    (Mode::Spr, Mode::Spr) => !received_epr,
                    (Mode::Epr, Mode::Epr) => received_epr,
                    _ => false,
                };

                if mode_matches {
                    State::EvaluateCapabilities(capabilities)
                } else {
                    State::Ready(*power_source, false)
                }
            }
            State::EprModeEntry(power_source, operational_pdp) => {
                // Request entry into EPR mode, reporting the sink's
                // operational PDP in the data field.
                let pdp_watts = operational_pdp.get::<watt>() as u8;
                self.protocol_layer.transmit_epr_mode(Action::Enter, pdp_watts).await?;

                let message = self
                    .protocol_layer
                    .receive_message_type(
                        &[MessageType::Data(DataMessageType::EprMode)],
                        TimerType::SenderResponse,
                    )
                    .await?;

                let Some(Payload::Data(Data::EprMode(epr_mode))) = message.payload else {
                    unreachable!()
                };

                match epr_mode.action() {
                    Action::EnterAcknowledged => State::EprEntryWaitForResponse(*power_source),
                    Action::EnterSucceeded => {
                        // Source skipped the acknowledgment and reported
                        // success directly.
                        self.mode = Mode::Epr;
                        State::EprWaitForCapabilities(*power_source)
                    }
                    Action::Exit => State::EprExitReceived(*power_source),
                    Action::EnterFailed => {
                        let reason = epr_mode::DataEnterFailed::from(epr_mode.data());
                        self.device_policy_manager.epr_mode_entry_failed(reason).await;
                        State::SendSoftReset
                    }
                    _ => State::SendSoftReset,
                }
            }
            State::EprEntryWaitForResponse(power_source) => {
                // Wait for the entry to succeed, while the source performs
                // cable discovery.
                let message = self
                    .protocol_layer
                    .receive_message_type(&[MessageType::Data(DataMessageType::EprMode)], TimerType::SinkEprEnter)
                    .await?;

                let Some(Payload::Data(Data::EprMode(epr_mode))) = message.payload else {
                    unreachable!()
                };

                match epr_mode.action() {
                    Action::EnterSucceeded => {
                        self.mode = Mode::Epr;
                        State::EprWaitForCapabilities(*power_source)
                    }
                    Action::Exit => State::EprExitReceived(*power_source),
                    Action::EnterFailed => {
                        let reason = epr_mode::DataEnterFailed::from(epr_mode.data());
                        self.device_policy_manager.epr_mode_entry_failed(reason).await;
                        State::SendSoftReset
                    }
                    _ => State::SendSoftReset,
                }
            }
            State::EprWaitForCapabilities(_power_source) => {
                // After successful EPR mode entry, the source sends its EPR
                // capabilities without a request.
                let message = self
                    .protocol_layer
                    .wait_for_source_capabilities(TimerType::SinkWaitCap)
                    .await?;

                match Self::extract_source_capabilities(message) {
                    Some(capabilities) => State::EvaluateCapabilities(capabilities),
                    None => {
                        error!("Expected source capabilities after EPR mode entry");
                        State::HardReset
                    }
                }
            }
            State::EprSendExit => {
                // Inform the partner that we are exiting EPR mode.
                self.protocol_layer.transmit_epr_mode(Action::Exit, 0).await?;
                self.mode = Mode::Spr;
                State::WaitForCapabilities
            }
            State::EprExitReceived(power_source) => {
                // An exit while the contract rests on an EPR PDO cannot be
                // honored gracefully.
                self.mode = Mode::Spr;

                let is_epr_pdo_contract = power_source.object_position() >= 8;

                if is_epr_pdo_contract {
                    State::HardReset
                } else {
                    State::WaitForCapabilities
                }
            }
            State::EprKeepAlive(power_source) => {
                self.protocol_layer
                    .transmit_extended_control_message(ExtendedControlMessageType::EprKeepAlive)
                    .await?;

                match self
                    .protocol_layer
                    .receive_message_type(
                        &[MessageType::Extended(ExtendedMessageType::ExtendedControl)],
                        TimerType::SenderResponse,
                    )
                    .await
                {
                    Ok(message) => {
                        if let Some(Payload::Extended(Extended::ExtendedControl(control))) = message.payload {
                            if control.message_type() == ExtendedControlMessageType::EprKeepAliveAck {
                                self.mode = Mode::Epr;
                                State::Ready(*power_source, false)
                            } else {
                                State::SendNotSupported(*power_source)
                            }
                        } else {
                            State::SendNotSupported(*power_source)
                        }
                    }
                    Err(_) => State::HardReset,
                }
            }
        };

        self.state = new_state;

        Ok(None)
    }
}
