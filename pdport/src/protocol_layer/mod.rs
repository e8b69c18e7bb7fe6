//! The protocol layer is controlled by the policy engines, and commands the PHY layer.
//!
//! Handles
//! - construction of messages,
//! - message timers and timeouts,
//! - message ID bookkeeping and retransmission detection,
//! - message retry counters,
//! - reset operation,
//! - error handling.
pub mod message;

use core::future::Future;
use core::marker::PhantomData;

use embassy_futures::select::{Either, select};
use message::header::{ControlMessageType, DataMessageType, Header, MessageType};
use message::{Message, Payload};
use pdport_traits::{Driver, DriverRxError, DriverTxError};

use message::data::Data;

use crate::counters::{Counter, CounterType, Error as CounterError};
use crate::timers::{Timer, TimerType};
use crate::{DataRole, PowerRole};

/// The maximum standard message size.
///
/// Covers the message header and up to seven data objects, which also bounds
/// single-chunk extended messages.
pub const MAX_MESSAGE_SIZE: usize = 30;

/// Errors that the protocol layer reports for received messages.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxError {
    /// Port partner requested soft reset.
    SoftReset,
    /// Hard reset signaling was detected.
    HardReset,
    /// A timeout during message reception.
    ReceiveTimeout,
    /// An unsupported or malformed message was received.
    UnsupportedMessage,
}

/// Errors that the protocol layer reports for transmitted messages.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxError {
    /// Hard reset signaling was detected.
    HardReset,
}

/// Errors that can occur in the protocol layer.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// An error during message reception.
    Rx(RxError),
    /// An error during message transmission.
    Tx(TxError),
    /// Transmission failed after the maximum number of allowed retries.
    TransmitRetriesExceeded,
    /// An unexpected message was received.
    UnexpectedMessage,
}

impl From<RxError> for ProtocolError {
    fn from(value: RxError) -> Self {
        ProtocolError::Rx(value)
    }
}

impl From<TxError> for ProtocolError {
    fn from(value: TxError) -> Self {
        ProtocolError::Tx(value)
    }
}

#[derive(Debug)]
struct Counters {
    /// ID of the last stored received message. `None` directly after reset.
    rx_message: Option<Counter>,
    tx_message: Counter,
    retry: Counter,
}

impl Default for Counters {
    fn default() -> Self {
        Counters {
            rx_message: None,
            tx_message: Counter::new(CounterType::MessageId),
            retry: Counter::new(CounterType::Retry),
        }
    }
}

/// The USB PD protocol layer.
#[derive(Debug)]
pub struct ProtocolLayer<DRIVER: Driver, TIMER: Timer> {
    driver: DRIVER,
    counters: Counters,
    header_template: Header,
    _timer: PhantomData<TIMER>,
}

impl<DRIVER: Driver, TIMER: Timer> ProtocolLayer<DRIVER, TIMER> {
    /// Create a new protocol layer from a driver and a header template.
    pub fn new(driver: DRIVER, header_template: Header) -> Self {
        Self {
            driver,
            counters: Default::default(),
            header_template,
            _timer: PhantomData,
        }
    }

    /// Reset the protocol layer.
    ///
    /// Performed on detach, and as part of soft and hard reset.
    pub fn reset(&mut self) {
        self.counters = Default::default();
    }

    /// Release the driver, e.g. for handing it to the other role's engine.
    pub fn into_driver(self) -> DRIVER {
        self.driver
    }

    /// Access the driver.
    pub fn driver(&mut self) -> &mut DRIVER {
        &mut self.driver
    }

    /// The current header template.
    pub fn header(&self) -> &Header {
        &self.header_template
    }

    /// Update the power role in the header template after a power role swap.
    pub fn set_power_role(&mut self, role: PowerRole) {
        self.header_template = self.header_template.with_port_power_role(role);
    }

    /// Update the data role in the header template after a data role swap.
    pub fn set_data_role(&mut self, role: DataRole) {
        self.header_template = self.header_template.with_port_data_role(role);
    }

    fn get_message_buffer() -> [u8; MAX_MESSAGE_SIZE] {
        [0u8; MAX_MESSAGE_SIZE]
    }

    /// Get a timer future for a given type.
    pub fn get_timer(timer_type: TimerType) -> impl Future<Output = ()> {
        timer_type.timeout::<TIMER>()
    }

    /// Receive a message from the driver, without acknowledgment.
    async fn receive_inner(&mut self) -> Result<Message, RxError> {
        loop {
            let mut buffer = Self::get_message_buffer();

            let length = match self.driver.receive(&mut buffer).await {
                Ok(length) => length,
                Err(DriverRxError::Discarded) => continue,
                Err(DriverRxError::HardReset) => return Err(RxError::HardReset),
            };

            let message = match Message::from_bytes(&buffer[..length]) {
                Ok(message) => message,
                Err(error) => {
                    warn!("Failed to parse received message: {:?}", error);
                    return Err(RxError::UnsupportedMessage);
                }
            };

            // Update specification revision, based on the received frame.
            if let Ok(revision) = message.header.spec_revision() {
                self.header_template = self.header_template.with_spec_revision(revision);
            }

            match message.header.message_type() {
                MessageType::Control(ControlMessageType::Reserved)
                | MessageType::Data(DataMessageType::Reserved) => return Err(RxError::UnsupportedMessage),
                MessageType::Control(ControlMessageType::SoftReset) => return Err(RxError::SoftReset),
                _ => (),
            }

            return Ok(message);
        }
    }

    /// Wait until a GoodCrc message is received, or a timeout occurs.
    async fn wait_for_good_crc(&mut self) -> Result<(), RxError> {
        trace!("Wait for GoodCrc");

        let receive_fut = async {
            loop {
                let message = self.receive_inner().await?;

                if !matches!(
                    message.header.message_type(),
                    MessageType::Control(ControlMessageType::GoodCRC)
                ) {
                    // Not an acknowledgment. Drop it, the partner retransmits.
                    continue;
                }

                trace!(
                    "Received GoodCrc with ID {}, expected {}",
                    message.header.message_id(),
                    self.counters.tx_message.value()
                );

                return if message.header.message_id() == self.counters.tx_message.value() {
                    // See [6.7.1.1]
                    self.counters.retry.reset();
                    _ = self.counters.tx_message.increment();
                    Ok(())
                } else {
                    // An unrelated transmission was acknowledged.
                    Err(RxError::ReceiveTimeout)
                };
            }
        };

        let timeout_fut = Self::get_timer(TimerType::CrcReceive);

        match select(timeout_fut, receive_fut).await {
            Either::First(_) => Err(RxError::ReceiveTimeout),
            Either::Second(receive_result) => receive_result,
        }
    }

    /// Hand a message buffer to the driver.
    ///
    /// Collisions (concurrent reception) discard the pending transmission
    /// inside the driver, which reports them for retry here.
    async fn transmit_inner(&mut self, buffer: &[u8]) -> Result<(), TxError> {
        loop {
            match self.driver.transmit(buffer).await {
                Ok(_) => return Ok(()),
                Err(DriverTxError::HardReset) => return Err(TxError::HardReset),
                Err(DriverTxError::Discarded) => {
                    // Retry transmission.
                }
            }
        }
    }

    /// Transmit a message and await its acknowledgment.
    ///
    /// Retransmits up to the retry bound when no matching GoodCrc arrives in
    /// time.
    //
    // GoodCrc message transmission is handled separately.
    // See `transmit_good_crc()` instead.
    pub async fn transmit(&mut self, message: Message) -> Result<(), ProtocolError> {
        debug_assert_ne!(
            message.header.message_type(),
            MessageType::Control(ControlMessageType::GoodCRC)
        );

        trace!("Transmit message {:?}", message.header);
        self.counters.retry.reset();

        let mut buffer = Self::get_message_buffer();
        let size = message.to_bytes(&mut buffer);

        loop {
            self.transmit_inner(&buffer[..size]).await?;

            match self.wait_for_good_crc().await {
                Ok(()) => {
                    trace!("Transmit success");
                    return Ok(());
                }
                Err(RxError::ReceiveTimeout) => match self.counters.retry.increment() {
                    // Retransmit with an unchanged message ID.
                    Ok(_) => (),
                    Err(CounterError::Exceeded) => return Err(ProtocolError::TransmitRetriesExceeded),
                },
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Send a GoodCrc message to the port partner.
    async fn transmit_good_crc(&mut self) -> Result<(), TxError> {
        // A message must have been received (and its ID stored) before.
        let Some(rx_message) = self.counters.rx_message else {
            return Ok(());
        };

        trace!("Transmit GoodCrc for RX message ID {}", rx_message.value());

        let mut buffer = Self::get_message_buffer();

        let size = Message::new(Header::new_control(
            self.header_template,
            rx_message,
            ControlMessageType::GoodCRC,
        ))
        .to_bytes(&mut buffer);

        self.transmit_inner(&buffer[..size]).await
    }

    /// Updates the received message counter.
    ///
    /// If receiving the first message after protocol layer reset, copy its ID.
    /// Otherwise, compare the received ID with the stored ID. If they are equal, this is a retransmission.
    ///
    /// Returns `true`, if this was a retransmission.
    fn update_rx_message_counter(&mut self, rx_message: &Message) -> bool {
        match self.counters.rx_message.as_mut() {
            None => {
                trace!(
                    "Received first message after protocol layer reset with ID {}",
                    rx_message.header.message_id()
                );
                self.counters.rx_message = Some(Counter::new_from_value(
                    CounterType::MessageId,
                    rx_message.header.message_id(),
                ));
                false
            }
            Some(counter) => {
                if rx_message.header.message_id() == counter.value() {
                    trace!("Received retransmission of message ID {}", counter.value());
                    true
                } else {
                    counter.set(rx_message.header.message_id());
                    false
                }
            }
        }
    }

    /// Receive a message, acknowledge it, and deduplicate retransmissions.
    ///
    /// Retransmitted messages are acknowledged again, but not reported, so
    /// that their payload takes effect exactly once.
    pub async fn receive_message(&mut self) -> Result<Message, ProtocolError> {
        loop {
            let message = self.receive_inner().await?;

            if matches!(
                message.header.message_type(),
                MessageType::Control(ControlMessageType::GoodCRC)
            ) {
                // Stray acknowledgment, e.g. for a transmission that already
                // timed out locally.
                continue;
            }

            // See [6.7.1.2]
            let is_retransmission = self.update_rx_message_counter(&message);
            self.transmit_good_crc().await?;

            if is_retransmission {
                continue;
            }

            return Ok(message);
        }
    }

    /// Wait until a message of one of the chosen types is received, or a timeout occurs.
    pub async fn receive_message_type(
        &mut self,
        message_types: &[MessageType],
        timer_type: TimerType,
    ) -> Result<Message, ProtocolError> {
        let receive_fut = async {
            let message = self.receive_message().await?;

            if message_types.contains(&message.header.message_type()) {
                Ok(message)
            } else {
                trace!("Unexpected message {:?}", message.header.message_type());
                Err(ProtocolError::UnexpectedMessage)
            }
        };

        let timeout_fut = Self::get_timer(timer_type);

        match select(timeout_fut, receive_fut).await {
            Either::First(_) => Err(ProtocolError::Rx(RxError::ReceiveTimeout)),
            Either::Second(receive_result) => receive_result,
        }
    }

    /// Perform a hard-reset procedure.
    //
    // See [6.7.1.1]
    pub async fn hard_reset(&mut self) -> Result<(), ProtocolError> {
        self.reset();

        loop {
            match self.driver.transmit_hard_reset().await {
                Ok(_) | Err(DriverTxError::HardReset) => break,
                Err(DriverTxError::Discarded) => (),
            }
        }

        Ok(())
    }

    /// Wait for VBus to be available.
    pub async fn wait_for_vbus(&mut self) {
        self.driver.wait_for_vbus().await
    }

    /// Wait for the source to provide its capabilities.
    ///
    /// Accepts regular and EPR source capabilities.
    pub async fn wait_for_source_capabilities(&mut self, timer_type: TimerType) -> Result<Message, ProtocolError> {
        self.receive_message_type(
            &[
                MessageType::Data(DataMessageType::SourceCapabilities),
                MessageType::Extended(message::header::ExtendedMessageType::EprSourceCapabilities),
            ],
            timer_type,
        )
        .await
    }

    /// Transmit a control message of the provided type.
    pub async fn transmit_control_message(
        &mut self,
        control_message_type: ControlMessageType,
    ) -> Result<(), ProtocolError> {
        let message = Message::new(Header::new_control(
            self.header_template,
            self.counters.tx_message,
            control_message_type,
        ));

        self.transmit(message).await
    }

    /// Transmit a data message.
    pub async fn transmit_data(&mut self, data: Data) -> Result<(), ProtocolError> {
        let header = Header::new_data(
            self.header_template,
            self.counters.tx_message,
            data.message_type(),
            data.object_count(),
        );

        self.transmit(Message::new_with_data(header, data)).await
    }

    /// Transmit an extended message.
    pub async fn transmit_extended(&mut self, extended: message::extended::Extended) -> Result<(), ProtocolError> {
        let header = Header::new_extended(
            self.header_template,
            self.counters.tx_message,
            extended.message_type(),
            extended.object_count(),
        );

        let mut message = Message::new(header);
        message.payload = Some(Payload::Extended(extended));

        self.transmit(message).await
    }

    /// Transmit an extended control message of the provided type.
    pub async fn transmit_extended_control_message(
        &mut self,
        message_type: message::extended::extended_control::ExtendedControlMessageType,
    ) -> Result<(), ProtocolError> {
        self.transmit_extended(message::extended::Extended::ExtendedControl(
            message::extended::extended_control::ExtendedControl::default().with_message_type(message_type),
        ))
        .await
    }

    /// Request a certain power level from the source.
    pub async fn request_power(
        &mut self,
        request: message::data::request::PowerSourceRequest,
    ) -> Result<(), ProtocolError> {
        // Only sinks can request from a supply.
        debug_assert!(matches!(self.header_template.port_power_role(), PowerRole::Sink));

        self.transmit_data(Data::Request(request)).await
    }

    /// Transmit an EPR mode message with the provided action and payload data.
    pub async fn transmit_epr_mode(
        &mut self,
        action: message::data::epr_mode::Action,
        data: u8,
    ) -> Result<(), ProtocolError> {
        self.transmit_data(Data::EprMode(
            message::data::epr_mode::EprModeDataObject::default()
                .with_action(action)
                .with_data(data),
        ))
        .await
    }

    /// Transmit a structured or unstructured VDM with payload objects.
    pub async fn transmit_vdm(
        &mut self,
        header: message::data::vendor_defined::VdmHeader,
        objects: &[u32],
    ) -> Result<(), ProtocolError> {
        let objects = objects.iter().copied().collect();
        self.transmit_data(Data::VendorDefined((header, objects))).await
    }
}

#[cfg(test)]
mod tests {
    use super::{ProtocolError, ProtocolLayer};
    use crate::counters::{Counter, CounterType};
    use crate::dummy::{DummyDriver, DummyTimer, MAX_DATA_MESSAGE_SIZE, YieldingTimer};
    use crate::protocol_layer::message::Message;
    use crate::protocol_layer::message::header::{
        ControlMessageType, Header, MessageType, SpecificationRevision,
    };
    use crate::{DataRole, PowerRole};

    fn sink_header_template() -> Header {
        Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X)
    }

    fn source_control_message(control_message_type: ControlMessageType, message_id: u8) -> heapless::Vec<u8, 30> {
        let template = Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X);

        let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
        let size = Message::new(Header::new_control(
            template,
            Counter::new_from_value(CounterType::MessageId, message_id),
            control_message_type,
        ))
        .to_bytes(&mut buf);

        heapless::Vec::from_slice(&buf[..size]).unwrap()
    }

    #[tokio::test]
    async fn transmission_fails_after_three_retries() {
        let mut protocol_layer: ProtocolLayer<DummyDriver<MAX_DATA_MESSAGE_SIZE>, YieldingTimer> =
            ProtocolLayer::new(DummyDriver::new(), sink_header_template());

        // The port partner never acknowledges.
        let result = protocol_layer.transmit_control_message(ControlMessageType::GetSourceCap).await;
        assert!(matches!(result, Err(ProtocolError::TransmitRetriesExceeded)));

        // The initial transmission, plus exactly three retries.
        let mut transmissions = 0;
        while protocol_layer.driver().has_transmitted_data() {
            protocol_layer.driver().probe_transmitted_data();
            transmissions += 1;
        }
        assert_eq!(transmissions, 4);
    }

    #[tokio::test]
    async fn transmission_succeeds_within_retry_bound() {
        let mut protocol_layer: ProtocolLayer<DummyDriver<MAX_DATA_MESSAGE_SIZE>, YieldingTimer> =
            ProtocolLayer::new(DummyDriver::new(), sink_header_template());

        // An acknowledgment for the first message ID is already on the wire.
        protocol_layer
            .driver()
            .inject_received_data(&source_control_message(ControlMessageType::GoodCRC, 0));

        protocol_layer
            .transmit_control_message(ControlMessageType::GetSourceCap)
            .await
            .unwrap();

        let mut transmissions = 0;
        while protocol_layer.driver().has_transmitted_data() {
            protocol_layer.driver().probe_transmitted_data();
            transmissions += 1;
        }
        assert_eq!(transmissions, 1);
    }

    #[tokio::test]
    async fn retransmissions_are_suppressed_after_acknowledgment() {
        let mut protocol_layer: ProtocolLayer<DummyDriver<MAX_DATA_MESSAGE_SIZE>, DummyTimer> =
            ProtocolLayer::new(DummyDriver::new(), sink_header_template());

        protocol_layer
            .driver()
            .inject_received_data(&source_control_message(ControlMessageType::PsRdy, 4));

        let message = protocol_layer.receive_message().await.unwrap();
        assert!(matches!(
            message.header.message_type(),
            MessageType::Control(ControlMessageType::PsRdy)
        ));

        // The same message again (identical ID), then a new message.
        protocol_layer
            .driver()
            .inject_received_data(&source_control_message(ControlMessageType::PsRdy, 4));
        protocol_layer
            .driver()
            .inject_received_data(&source_control_message(ControlMessageType::GetSinkCap, 5));

        // The duplicate is acknowledged but never surfaces.
        let message = protocol_layer.receive_message().await.unwrap();
        assert!(matches!(
            message.header.message_type(),
            MessageType::Control(ControlMessageType::GetSinkCap)
        ));

        // One acknowledgment per delivery, duplicate included.
        let mut good_crcs = 0;
        while protocol_layer.driver().has_transmitted_data() {
            let data = protocol_layer.driver().probe_transmitted_data();
            let message = Message::from_bytes(&data).unwrap();
            assert!(matches!(
                message.header.message_type(),
                MessageType::Control(ControlMessageType::GoodCRC)
            ));
            good_crcs += 1;
        }
        assert_eq!(good_crcs, 3);
    }
}
