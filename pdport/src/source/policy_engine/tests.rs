//! Tests for the source policy engine.
use std::future::pending;

use super::{Source, State};
use crate::counters::{Counter, CounterType};
use crate::dummy::{DummyDriver, DummySourceDevice, MAX_DATA_MESSAGE_SIZE, YieldingTimer};
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::data::request::{FixedVariableSupply, PowerSourceRequest};
use crate::protocol_layer::message::data::vendor_defined::{
    CertStatVdo, ProductVdo, VdmCommand, VdmCommandType, VdmHeader, VdmHeaderStructured, VdmIdentityHeader,
};
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload};
use crate::source::device_policy_manager::{DevicePolicyManager, Event};
use crate::units::{ElectricCurrent, ElectricPotential};
use crate::vdm::{Discovery, Identity, PD_SID};
use crate::{Contract, DataRole, PowerRole};
use uom::si::electric_current::ampere;
use uom::si::electric_potential::volt;

/// Get a header template for simulating sink messages (Sink/Ufp roles).
fn get_sink_header_template() -> Header {
    Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X)
}

fn simulate_sink_control_message<DPM: DevicePolicyManager>(
    policy_engine: &mut Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, YieldingTimer, DPM>,
    control_message_type: ControlMessageType,
    message_id: u8,
) {
    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];

    let size = Message::new(Header::new_control(
        get_sink_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        control_message_type,
    ))
    .to_bytes(&mut buf);
    policy_engine.protocol_layer.driver().inject_received_data(&buf[..size]);
}

fn simulate_sink_data_message<DPM: DevicePolicyManager>(
    policy_engine: &mut Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, YieldingTimer, DPM>,
    message_type: DataMessageType,
    data: Data,
    message_id: u8,
) {
    let header = Header::new_data(
        get_sink_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        message_type,
        data.object_count(),
    );

    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
    let size = Message::new_with_data(header, data).to_bytes(&mut buf);
    policy_engine.protocol_layer.driver().inject_received_data(&buf[..size]);
}

fn probe_message<DPM: DevicePolicyManager>(
    policy_engine: &mut Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, YieldingTimer, DPM>,
) -> Message {
    let data = policy_engine.protocol_layer.driver().probe_transmitted_data();
    Message::from_bytes(&data).unwrap()
}

fn assert_good_crc<DPM: DevicePolicyManager>(
    policy_engine: &mut Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, YieldingTimer, DPM>,
) {
    let message = probe_message(policy_engine);
    assert!(matches!(
        message.header.message_type(),
        MessageType::Control(ControlMessageType::GoodCRC)
    ));
}

fn request_9v_2a() -> Data {
    // Object position 2 refers to the 9 V / 2 A supply of the dummy source.
    Data::Request(PowerSourceRequest::FixedVariableSupply(
        FixedVariableSupply(0)
            .with_object_position(2)
            .with_raw_operating_current(200)
            .with_raw_max_operating_current(200),
    ))
}

/// Step the engine from startup into the ready state.
async fn negotiate<DPM: DevicePolicyManager>(
    policy_engine: &mut Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, YieldingTimer, DPM>,
) {
    // `Startup` -> `SendCapabilities`
    policy_engine.run_step().await.unwrap();

    // `SendCapabilities` -> `WaitForRequest`, advertising the capabilities.
    simulate_sink_control_message(policy_engine, ControlMessageType::GoodCRC, 0);
    policy_engine.run_step().await.unwrap();

    let capabilities = probe_message(policy_engine);
    assert!(matches!(
        capabilities.header.message_type(),
        MessageType::Data(DataMessageType::SourceCapabilities)
    ));

    // The sink requests the 9 V supply.
    simulate_sink_data_message(policy_engine, DataMessageType::Request, request_9v_2a(), 0);

    // `WaitForRequest` -> `NegotiateCapability`
    policy_engine.run_step().await.unwrap();
    assert_good_crc(policy_engine);

    // `NegotiateCapability` -> `TransitionSupply`, accepting the request.
    simulate_sink_control_message(policy_engine, ControlMessageType::GoodCRC, 1);
    policy_engine.run_step().await.unwrap();

    let accept = probe_message(policy_engine);
    assert!(matches!(
        accept.header.message_type(),
        MessageType::Control(ControlMessageType::Accept)
    ));

    // `TransitionSupply` -> `Ready`, announcing the new power level.
    simulate_sink_control_message(policy_engine, ControlMessageType::GoodCRC, 2);
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    let ps_rdy = probe_message(policy_engine);
    assert!(matches!(
        ps_rdy.header.message_type(),
        MessageType::Control(ControlMessageType::PsRdy)
    ));
}

#[tokio::test]
async fn test_negotiation() {
    let mut policy_engine: Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, YieldingTimer, DummySourceDevice> =
        Source::new(DummyDriver::new(), DummySourceDevice::default());

    negotiate(&mut policy_engine).await;

    // The supply was asked to transition to 9 V at 2 A.
    let contract = policy_engine.device_policy_manager.last_contract.unwrap();
    assert_eq!(
        contract,
        Contract {
            voltage: ElectricPotential::new::<volt>(9),
            current: ElectricCurrent::new::<ampere>(2),
        }
    );
}

#[tokio::test]
async fn test_invalid_request_is_rejected() {
    let mut policy_engine: Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, YieldingTimer, DummySourceDevice> =
        Source::new(DummyDriver::new(), DummySourceDevice::default());

    // `Startup` -> `SendCapabilities` -> `WaitForRequest`
    policy_engine.run_step().await.unwrap();
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    policy_engine.run_step().await.unwrap();
    let _capabilities = probe_message(&mut policy_engine);

    // A request for an object position that was never advertised.
    let invalid_request = Data::Request(PowerSourceRequest::FixedVariableSupply(
        FixedVariableSupply(0)
            .with_object_position(5)
            .with_raw_operating_current(100)
            .with_raw_max_operating_current(100),
    ));
    simulate_sink_data_message(&mut policy_engine, DataMessageType::Request, invalid_request, 0);

    // `WaitForRequest` -> `NegotiateCapability`
    policy_engine.run_step().await.unwrap();
    assert_good_crc(&mut policy_engine);

    // `NegotiateCapability` -> `WaitForRequest`, rejecting the request. There
    // is no contract to fall back to.
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::WaitForRequest));

    let reject = probe_message(&mut policy_engine);
    assert!(matches!(
        reject.header.message_type(),
        MessageType::Control(ControlMessageType::Reject)
    ));

    // The contract was never established.
    assert!(policy_engine.device_policy_manager.last_contract.is_none());
}

#[tokio::test]
async fn test_capability_advertisement_bound() {
    // A source whose port partner never acknowledges the capability
    // advertisement gives up after the caps counter is exhausted.
    let mut policy_engine: Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, YieldingTimer, DummySourceDevice> =
        Source::new(DummyDriver::new(), DummySourceDevice::default());

    let result = policy_engine.run().await;
    assert!(matches!(result, Err(super::Error::PortPartnerUnresponsive)));

    // 17 advertisement attempts, each transmitted once and retried thrice.
    let mut transmissions = 0;
    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        policy_engine.protocol_layer.driver().probe_transmitted_data();
        transmissions += 1;
    }
    assert_eq!(transmissions, 17 * 4);
}

/// A source device that accepts power role swaps.
struct SwappingSourceDevice {}

impl DevicePolicyManager for SwappingSourceDevice {
    fn source_capabilities(&mut self) -> crate::protocol_layer::message::data::source_capabilities::SourceCapabilities {
        crate::protocol_layer::message::data::source_capabilities::SourceCapabilities::new(
            &crate::dummy::get_dummy_source_capabilities(),
        )
    }

    async fn accept_power_role_swap(&mut self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_power_role_swap_handover() {
    let mut policy_engine: Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, YieldingTimer, SwappingSourceDevice> =
        Source::new(DummyDriver::new(), SwappingSourceDevice {});

    negotiate(&mut policy_engine).await;

    // The sink asks for a power role swap.
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::PrSwap, 1);

    // `Ready` -> `EvaluatePrSwap`
    let handover = policy_engine.run_step().await.unwrap();
    assert!(handover.is_none());
    assert_good_crc(&mut policy_engine);

    // `EvaluatePrSwap` -> `PrSwapTransitionToOff`, accepting the swap.
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 3);
    let handover = policy_engine.run_step().await.unwrap();
    assert!(handover.is_none());
    assert!(matches!(policy_engine.state, State::PrSwapTransitionToOff(_)));

    let accept = probe_message(&mut policy_engine);
    assert!(matches!(
        accept.header.message_type(),
        MessageType::Control(ControlMessageType::Accept)
    ));

    // The supply turns off and PsRdy goes out with a fresh message ID.
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    let handover = policy_engine.run_step().await.unwrap();
    assert!(handover.is_none());
    assert!(matches!(policy_engine.state, State::PrSwapWaitSourceOn));

    // The new source reports its supply as ready; the engines hand over.
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::PsRdy, 2);
    let handover = policy_engine.run_step().await.unwrap();
    assert!(matches!(handover, Some(crate::Handover::PowerRoleSwap)));

    assert_eq!(policy_engine.protocol_layer.driver().power_role, Some(PowerRole::Sink));
}

/// A source device that runs port partner discovery whenever the engine is
/// ready, and records the outcome.
struct DiscoveringSourceDevice {
    pending_discoveries: usize,
    discovered_identity: Option<Identity>,
    discovered_svids: usize,
    completions: usize,
}

impl DiscoveringSourceDevice {
    fn new(pending_discoveries: usize) -> Self {
        Self {
            pending_discoveries,
            discovered_identity: None,
            discovered_svids: 0,
            completions: 0,
        }
    }
}

impl DevicePolicyManager for DiscoveringSourceDevice {
    fn source_capabilities(&mut self) -> crate::protocol_layer::message::data::source_capabilities::SourceCapabilities {
        crate::protocol_layer::message::data::source_capabilities::SourceCapabilities::new(
            &crate::dummy::get_dummy_source_capabilities(),
        )
    }

    async fn get_event(&mut self) -> Event {
        if self.pending_discoveries > 0 {
            self.pending_discoveries -= 1;
            Event::DiscoverPortPartner
        } else {
            pending().await
        }
    }

    async fn discovery_complete(&mut self, discovery: &Discovery) {
        self.discovered_identity = discovery.identity;
        self.discovered_svids = discovery.svids.len();
        self.completions += 1;
    }
}

fn identity_ack() -> Data {
    let header = VdmHeaderStructured::default()
        .with_standard_or_vid(PD_SID)
        .with_command_type(VdmCommandType::ResponderAck)
        .with_command(VdmCommand::DiscoverIdentity);

    let identity = Identity {
        id_header: VdmIdentityHeader(0).with_vid(0x04e8).with_device_data(true),
        cert_stat: CertStatVdo(0).with_xid(1),
        product: ProductVdo(0).with_pid(0x6860),
    };

    Data::VendorDefined((VdmHeader::Structured(header), identity.to_objects()))
}

fn svids_nak() -> Data {
    let header = VdmHeaderStructured::default()
        .with_standard_or_vid(PD_SID)
        .with_command_type(VdmCommandType::ResponderNak)
        .with_command(VdmCommand::DiscoverSvids);

    Data::VendorDefined((VdmHeader::Structured(header), heapless::Vec::new()))
}

#[tokio::test]
async fn test_vdm_discovery_is_idempotent() {
    let mut policy_engine: Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, YieldingTimer, DiscoveringSourceDevice> =
        Source::new(DummyDriver::new(), DiscoveringSourceDevice::new(2));

    negotiate(&mut policy_engine).await;

    // `Ready` -> `VdmDiscovery` on the device policy event.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::VdmDiscovery(_)));

    // Identity request, acknowledged by the sink.
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 3);
    simulate_sink_data_message(&mut policy_engine, DataMessageType::VendorDefined, identity_ack(), 1);
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::VdmDiscovery(_)));

    let identity_request = probe_message(&mut policy_engine);
    let Some(Payload::Data(Data::VendorDefined((VdmHeader::Structured(header), _)))) = identity_request.payload else {
        panic!("Expected a structured VDM request");
    };
    assert_eq!(header.command(), VdmCommand::DiscoverIdentity);
    assert_good_crc(&mut policy_engine);

    // SVID request, negatively acknowledged: the ladder ends gracefully.
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 4);
    simulate_sink_data_message(&mut policy_engine, DataMessageType::VendorDefined, svids_nak(), 2);
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    assert_eq!(policy_engine.device_policy_manager.completions, 1);
    assert!(policy_engine.device_policy_manager.discovered_identity.is_some());

    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        policy_engine.protocol_layer.driver().probe_transmitted_data();
    }

    // The second discovery command skips the completed identity stage and
    // resumes with the SVID request.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::VdmDiscovery(_)));

    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 5);
    simulate_sink_data_message(&mut policy_engine, DataMessageType::VendorDefined, svids_nak(), 3);
    policy_engine.run_step().await.unwrap();

    let svid_request = probe_message(&mut policy_engine);
    let Some(Payload::Data(Data::VendorDefined((VdmHeader::Structured(header), _)))) = svid_request.payload else {
        panic!("Expected a structured VDM request");
    };
    assert_eq!(header.command(), VdmCommand::DiscoverSvids);
}
