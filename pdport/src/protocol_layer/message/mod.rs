//! Definitions of message content.
pub mod data;
pub mod extended;
pub mod header;

use data::PdoState;
use header::{Header, MessageType};

/// Errors that can occur during message/header parsing.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// The input buffer has an invalid length.
    #[error("invalid input buffer length (expected {expected:?}, found {found:?})")]
    InvalidLength {
        /// The expected length.
        expected: usize,
        /// The actual length found.
        found: usize,
    },
    /// The specification revision field is not supported.
    #[error("unsupported specification revision `{0}`")]
    UnsupportedSpecificationRevision(u8),
    /// A chunk other than the first of a chunked extended message.
    #[error("chunked extended messages are not supported")]
    UnsupportedChunk,
    /// Other parsing error with a message.
    #[error("other parse error: {0}")]
    Other(&'static str),
}

/// Payload of a USB PD message, if any.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Payload {
    /// Payload for a data message.
    Data(data::Data),
    /// Payload for an extended message.
    Extended(extended::Extended),
}

/// A USB PD message.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Message {
    /// The message header.
    pub header: Header,
    /// Optional payload of the message.
    pub payload: Option<Payload>,
}

impl Message {
    /// Create a new message from a message header.
    pub fn new(header: Header) -> Self {
        Self { header, payload: None }
    }

    /// Create a new message from a message header and payload data.
    pub fn new_with_data(header: Header, data: data::Data) -> Self {
        Self {
            header,
            payload: Some(Payload::Data(data)),
        }
    }

    /// Serialize a message to a slice, returning the number of written bytes.
    pub fn to_bytes(&self, buffer: &mut [u8]) -> usize {
        self.header.to_bytes(buffer)
            + match self.payload.as_ref() {
                Some(Payload::Data(data)) => data.to_bytes(&mut buffer[2..]),
                Some(Payload::Extended(extended)) => extended.to_bytes(&mut buffer[2..]),
                None => 0,
            }
    }

    /// Parse a message from a slice of bytes.
    ///
    /// Requests are typed against the provided PDO state, see [`PdoState`].
    pub fn parse<P: PdoState>(data: &[u8], state: &P) -> Result<Self, ParseError> {
        let header = Header::from_bytes(data)?;
        let message = Self::new(header);
        let payload = &data[2..];

        match message.header.message_type() {
            MessageType::Control(_) => Ok(message),
            MessageType::Data(message_type) => data::Data::parse_message(message, message_type, payload, state),
            MessageType::Extended(message_type) => extended::Extended::parse_message(message, message_type, payload),
        }
    }

    /// Parse a message from a slice of bytes, without PDO context.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        Self::parse(data, &())
    }
}

#[cfg(test)]
mod tests {
    use super::data::Data;
    use super::header::{ControlMessageType, DataMessageType, Header, MessageType, SpecificationRevision};
    use super::{Message, Payload};
    use crate::counters::{Counter, CounterType};
    use crate::{DataRole, PowerRole};

    fn template() -> Header {
        Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X)
    }

    #[test]
    fn control_message_round_trip() {
        let header = Header::new_control(
            template(),
            Counter::new_from_value(CounterType::MessageId, 5),
            ControlMessageType::Accept,
        );

        let mut buffer = [0u8; 30];
        let size = Message::new(header).to_bytes(&mut buffer);
        assert_eq!(size, 2);

        let parsed = Message::from_bytes(&buffer[..size]).unwrap();
        assert_eq!(
            parsed.header.message_type(),
            MessageType::Control(ControlMessageType::Accept)
        );
        assert_eq!(parsed.header.message_id(), 5);
    }

    #[test]
    fn source_capabilities_parse() {
        let parsed = Message::from_bytes(&crate::dummy::DUMMY_CAPABILITIES).unwrap();

        assert_eq!(
            parsed.header.message_type(),
            MessageType::Data(DataMessageType::SourceCapabilities)
        );

        let Some(Payload::Data(Data::SourceCapabilities(caps))) = parsed.payload else {
            panic!("Expected source capabilities payload");
        };

        assert_eq!(caps.pdos().len(), 2);
        let vsafe_5v = caps.vsafe_5v().expect("First PDO must be vSafe5V");
        assert_eq!(vsafe_5v.raw_voltage(), 100);
        assert_eq!(vsafe_5v.raw_max_current(), 300);
    }

    #[test]
    fn object_count_matches_serialized_payload() {
        let caps = crate::dummy::get_dummy_source_capabilities();
        let data = Data::SourceCapabilities(super::data::source_capabilities::SourceCapabilities::new(&caps));

        let header = Header::new_data(
            template(),
            Counter::new(CounterType::MessageId),
            DataMessageType::SourceCapabilities,
            data.object_count(),
        );

        let mut buffer = [0u8; 32];
        let size = Message::new_with_data(header, data).to_bytes(&mut buffer);

        assert_eq!(size, 2 + 4 * caps.len());

        let parsed = Message::from_bytes(&buffer[..size]).unwrap();
        assert_eq!(parsed.header.num_objects(), caps.len());
    }
}
