//! Tests for the sink policy engine.
use super::{Mode, Sink, State};
use crate::counters::{Counter, CounterType};
use crate::dummy::{
    DUMMY_CAPABILITIES, DummyDriver, DummyPreferenceSinkDevice, DummySwapSinkDevice, DummyTimer,
    MAX_DATA_MESSAGE_SIZE, YieldingTimer, get_dummy_source_capabilities,
};
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::data::request::{PowerSourceRequest, RawDataObject, SinkPowerPreferences};
use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
use crate::protocol_layer::message::data::vendor_defined::{VdmCommand, VdmCommandType, VdmHeader, VdmHeaderStructured};
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload};
use crate::sink::device_policy_manager::DevicePolicyManager;
use crate::timers::Timer;
use crate::units::{ElectricCurrent, ElectricPotential, Power};
use crate::vdm::PD_SID;
use crate::{DataRole, PowerRole};
use uom::si::electric_current::ampere;
use uom::si::electric_potential::volt;
use uom::si::power::watt;

fn preferences() -> SinkPowerPreferences {
    SinkPowerPreferences {
        max_voltage: ElectricPotential::new::<volt>(9),
        max_current: ElectricCurrent::new::<ampere>(3),
        operating_power: Power::new::<watt>(18),
    }
}

fn get_policy_engine<TIMER: Timer>() -> Sink<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DummyPreferenceSinkDevice> {
    Sink::new(
        DummyDriver::new(),
        DummyPreferenceSinkDevice {
            preferences: preferences(),
        },
    )
}

/// Get a header template for simulating source messages (Source/Dfp roles).
fn get_source_header_template() -> Header {
    Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X)
}

fn simulate_source_control_message<TIMER: Timer, DPM: DevicePolicyManager>(
    policy_engine: &mut Sink<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DPM>,
    control_message_type: ControlMessageType,
    message_id: u8,
) {
    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];

    let size = Message::new(Header::new_control(
        get_source_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        control_message_type,
    ))
    .to_bytes(&mut buf);
    policy_engine.protocol_layer.driver().inject_received_data(&buf[..size]);
}

fn simulate_source_data_message<TIMER: Timer, DPM: DevicePolicyManager>(
    policy_engine: &mut Sink<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DPM>,
    message_type: DataMessageType,
    data: Data,
    message_id: u8,
) {
    let header = Header::new_data(
        get_source_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        message_type,
        data.object_count(),
    );

    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
    let size = Message::new_with_data(header, data).to_bytes(&mut buf);
    policy_engine.protocol_layer.driver().inject_received_data(&buf[..size]);
}

fn probe_message<TIMER: Timer, DPM: DevicePolicyManager>(
    policy_engine: &mut Sink<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DPM>,
) -> Message {
    let data = policy_engine.protocol_layer.driver().probe_transmitted_data();
    Message::parse(&data, &SourceCapabilities::new(&get_dummy_source_capabilities())).unwrap()
}

fn assert_good_crc<TIMER: Timer, DPM: DevicePolicyManager>(
    policy_engine: &mut Sink<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DPM>,
) {
    let message = probe_message(policy_engine);
    assert!(matches!(
        message.header.message_type(),
        MessageType::Control(ControlMessageType::GoodCRC)
    ));
}

/// Step the engine from startup into the ready state.
///
/// The source offers 5 V / 3 A and 9 V / 2 A; the device preferences select
/// the 9 V supply.
async fn negotiate<TIMER: Timer, DPM: DevicePolicyManager>(
    policy_engine: &mut Sink<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DPM>,
) {
    // `Startup` -> `Discovery`
    policy_engine.run_step().await.unwrap();

    // `Discovery` -> `WaitForCapabilities`
    policy_engine.run_step().await.unwrap();

    // Provide capabilities
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(&DUMMY_CAPABILITIES);

    // `WaitForCapabilities` -> `EvaluateCapabilities`
    policy_engine.run_step().await.unwrap();
    assert_good_crc(policy_engine);

    // `EvaluateCapabilities` -> `SelectCapability`
    policy_engine.run_step().await.unwrap();

    // Simulate `GoodCrc` with ID 0, then the `Accept` message.
    simulate_source_control_message(policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_source_control_message(policy_engine, ControlMessageType::Accept, 1);

    // `SelectCapability` -> `TransitionSink`
    policy_engine.run_step().await.unwrap();

    // Simulate `PsRdy` message.
    simulate_source_control_message(policy_engine, ControlMessageType::PsRdy, 2);

    // `TransitionSink` -> `Ready`
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));
}

#[tokio::test]
async fn test_negotiation() {
    // Instantiated in `Startup` state
    let mut policy_engine = get_policy_engine::<DummyTimer>();

    negotiate(&mut policy_engine).await;

    // The request for the 9 V / 2 A supply at object position 2, without a
    // capability mismatch.
    let request = probe_message(&mut policy_engine);
    assert!(matches!(
        request.header.message_type(),
        MessageType::Data(DataMessageType::Request)
    ));

    let Some(Payload::Data(Data::Request(PowerSourceRequest::FixedVariableSupply(request)))) = request.payload else {
        panic!("Expected a fixed supply request");
    };

    assert_eq!(request.object_position(), 2);
    assert_eq!(request.raw_operating_current(), 200);
    assert!(!request.capability_mismatch());

    // Acknowledgments for `Accept` and `PsRdy`.
    assert_good_crc(&mut policy_engine);
    assert_good_crc(&mut policy_engine);

    assert!(!policy_engine.protocol_layer.driver().has_transmitted_data());
}

#[tokio::test]
async fn test_rx_message_dedup() {
    let mut policy_engine = get_policy_engine::<DummyTimer>();
    negotiate(&mut policy_engine).await;

    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        policy_engine.protocol_layer.driver().probe_transmitted_data();
    }

    // Retransmission of the `PsRdy` message with an unchanged message ID,
    // followed by a new message.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::PsRdy, 2);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GetSinkCap, 3);

    // `Ready` -> `GiveSinkCap`: the duplicate is acknowledged, but only the
    // new message takes effect.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::GiveSinkCap(Mode::Spr, _)));

    // Acknowledgments for the duplicate and the new message.
    assert_good_crc(&mut policy_engine);
    assert_good_crc(&mut policy_engine);

    // `GiveSinkCap` -> `Ready`, transmitting the sink capabilities.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    let sink_capabilities = probe_message(&mut policy_engine);
    assert!(matches!(
        sink_capabilities.header.message_type(),
        MessageType::Data(DataMessageType::SinkCapabilities)
    ));
}

#[tokio::test]
async fn test_transmit_failure_escalates_to_resets() {
    let mut policy_engine = get_policy_engine::<YieldingTimer>();
    negotiate(&mut policy_engine).await;

    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        policy_engine.protocol_layer.driver().probe_transmitted_data();
    }

    // Ask for new source capabilities while the source stays silent.
    policy_engine.state = State::GetSourceCap(Mode::Spr, PowerSourceRequest::Unknown(RawDataObject(0)));

    // `GetSourceCap` -> `SendSoftReset` after the transmission retries are
    // exhausted.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::SendSoftReset));

    // The initial transmission plus three retries.
    let mut transmissions = 0;
    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        let message = probe_message(&mut policy_engine);
        assert!(matches!(
            message.header.message_type(),
            MessageType::Control(ControlMessageType::GetSourceCap)
        ));
        transmissions += 1;
    }
    assert_eq!(transmissions, 4);

    // The soft reset transmission fails as well and escalates to hard reset.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::HardReset));

    // `HardReset` -> `TransitionToDefault` with hard reset signaling.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::TransitionToDefault));
    assert_eq!(policy_engine.protocol_layer.driver().hard_reset_count, 1);
}

#[tokio::test]
async fn test_hard_reset_bound() {
    // A sink whose port partner never sends capabilities keeps hard
    // resetting, until the hard reset counter is exhausted.
    let mut policy_engine = get_policy_engine::<YieldingTimer>();

    let result = policy_engine.run().await;
    assert!(matches!(result, Err(super::Error::PortPartnerUnresponsive)));

    assert_eq!(policy_engine.protocol_layer.driver().hard_reset_count, 4);
}

#[tokio::test]
async fn test_data_role_swap_accept() {
    let mut policy_engine = get_policy_engine::<DummyTimer>();
    negotiate(&mut policy_engine).await;

    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        policy_engine.protocol_layer.driver().probe_transmitted_data();
    }

    simulate_source_control_message(&mut policy_engine, ControlMessageType::DrSwap, 3);

    // `Ready` -> `EvaluateDrSwap`
    policy_engine.run_step().await.unwrap();
    assert_good_crc(&mut policy_engine);

    // `EvaluateDrSwap` -> `Ready`, accepting the swap.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    let accept = probe_message(&mut policy_engine);
    assert!(matches!(
        accept.header.message_type(),
        MessageType::Control(ControlMessageType::Accept)
    ));

    assert_eq!(policy_engine.data_role(), DataRole::Dfp);
    assert_eq!(policy_engine.protocol_layer.driver().data_role, Some(DataRole::Dfp));
}

#[tokio::test]
async fn test_power_role_swap_handover() {
    let mut policy_engine: Sink<DummyDriver<MAX_DATA_MESSAGE_SIZE>, DummyTimer, DummySwapSinkDevice> =
        Sink::new(DummyDriver::new(), DummySwapSinkDevice {});
    negotiate(&mut policy_engine).await;

    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        policy_engine.protocol_layer.driver().probe_transmitted_data();
    }

    simulate_source_control_message(&mut policy_engine, ControlMessageType::PrSwap, 3);

    // `Ready` -> `EvaluatePrSwap`
    let handover = policy_engine.run_step().await.unwrap();
    assert!(handover.is_none());

    // `EvaluatePrSwap` -> `PrSwapTransitionToOff`, accepting the swap.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    let handover = policy_engine.run_step().await.unwrap();
    assert!(handover.is_none());
    assert!(matches!(policy_engine.state, State::PrSwapTransitionToOff(_)));

    // The original source reports its supply as off; the sink takes over and
    // reports back with a fresh message ID.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::PsRdy, 4);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);

    let handover = policy_engine.run_step().await.unwrap();
    assert!(matches!(handover, Some(crate::Handover::PowerRoleSwap)));

    assert_eq!(policy_engine.protocol_layer.driver().power_role, Some(PowerRole::Source));
}

#[tokio::test]
async fn test_pr_swap_reject_returns_to_ready() {
    let mut policy_engine = get_policy_engine::<DummyTimer>();
    negotiate(&mut policy_engine).await;

    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        policy_engine.protocol_layer.driver().probe_transmitted_data();
    }

    // The device asks for a power role swap, but the source declines.
    policy_engine.state = State::SendPrSwap(PowerSourceRequest::Unknown(RawDataObject(0)));
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::Reject, 3);

    // `SendPrSwap` -> `Ready`, with the power role unchanged.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    let swap_request = probe_message(&mut policy_engine);
    assert!(matches!(
        swap_request.header.message_type(),
        MessageType::Control(ControlMessageType::PrSwap)
    ));
    assert!(matches!(
        policy_engine.protocol_layer.header().port_power_role(),
        PowerRole::Sink
    ));
}

#[tokio::test]
async fn test_dr_swap_timeout_keeps_roles() {
    let mut policy_engine = get_policy_engine::<YieldingTimer>();
    negotiate(&mut policy_engine).await;

    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        policy_engine.protocol_layer.driver().probe_transmitted_data();
    }

    // The swap request is acknowledged, but no response ever arrives.
    policy_engine.state = State::SendDrSwap(PowerSourceRequest::Unknown(RawDataObject(0)));
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);

    // `SendDrSwap` -> `Ready` on the sender response timeout.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));
    assert_eq!(policy_engine.data_role(), DataRole::Ufp);
}

#[tokio::test]
async fn test_vconn_swap_accept_supplies_vconn() {
    let mut policy_engine = get_policy_engine::<DummyTimer>();
    negotiate(&mut policy_engine).await;

    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        policy_engine.protocol_layer.driver().probe_transmitted_data();
    }

    simulate_source_control_message(&mut policy_engine, ControlMessageType::VconnSwap, 3);

    // `Ready` -> `EvaluateVconnSwap`
    policy_engine.run_step().await.unwrap();
    assert_good_crc(&mut policy_engine);

    // Accepting the swap makes this port the VCONN source, announced with
    // PsRdy.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 2);
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    let accept = probe_message(&mut policy_engine);
    assert!(matches!(
        accept.header.message_type(),
        MessageType::Control(ControlMessageType::Accept)
    ));
    let ps_rdy = probe_message(&mut policy_engine);
    assert!(matches!(
        ps_rdy.header.message_type(),
        MessageType::Control(ControlMessageType::PsRdy)
    ));

    assert_eq!(policy_engine.protocol_layer.driver().vconn, Some(true));
}

#[tokio::test]
async fn test_vdm_discover_identity_nak() {
    let mut policy_engine = get_policy_engine::<DummyTimer>();
    negotiate(&mut policy_engine).await;

    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        policy_engine.protocol_layer.driver().probe_transmitted_data();
    }

    // A Discover Identity request from the source.
    let request_header = VdmHeaderStructured::default()
        .with_standard_or_vid(PD_SID)
        .with_command_type(VdmCommandType::InitiatorReq)
        .with_command(VdmCommand::DiscoverIdentity);

    simulate_source_data_message(
        &mut policy_engine,
        DataMessageType::VendorDefined,
        Data::VendorDefined((VdmHeader::Structured(request_header), heapless::Vec::new())),
        3,
    );

    // `Ready` -> `VdmReceived`
    policy_engine.run_step().await.unwrap();
    assert_good_crc(&mut policy_engine);
    assert!(matches!(policy_engine.state, State::VdmReceived(..)));

    // Without an identity from the device policy manager, the sink responds
    // with a negative acknowledgment.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    let response = probe_message(&mut policy_engine);
    let Some(Payload::Data(Data::VendorDefined((VdmHeader::Structured(header), _)))) = response.payload else {
        panic!("Expected a structured VDM response");
    };

    assert_eq!(header.command_type(), VdmCommandType::ResponderNak);
    assert_eq!(header.command(), VdmCommand::DiscoverIdentity);
}
