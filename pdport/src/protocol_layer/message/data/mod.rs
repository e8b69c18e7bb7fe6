//! Definitions and implementations of data messages.
//!
//! See [6.4].
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

use crate::protocol_layer::message::Payload;
use crate::protocol_layer::message::header::DataMessageType;

pub mod alert;
pub mod battery_status;
pub mod epr_mode;
pub mod request;
pub mod sink_capabilities;
pub mod source_capabilities;
pub mod vendor_defined;

use alert::AlertDataObject;
use battery_status::BatteryStatusDataObject;
use epr_mode::EprModeDataObject;
use request::{EprRequest, PowerSourceRequest};
use sink_capabilities::SinkCapabilities;
use source_capabilities::{PowerDataObject, SourceCapabilities};
use vendor_defined::VdmHeader;

/// Context for typing request data objects during parsing.
///
/// Requests refer to a PDO by object position, so their kind can only be
/// determined with knowledge of the most recently transmitted capabilities.
pub trait PdoState {
    /// The kind of PDO at a given (one-indexed) object position.
    fn pdo_at_object_position(&self, position: u8) -> Option<source_capabilities::Kind>;
}

impl PdoState for () {
    fn pdo_at_object_position(&self, _position: u8) -> Option<source_capabilities::Kind> {
        None
    }
}

/// Payloads of data messages.
#[derive(Debug, Clone)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Data {
    /// Source capabilities.
    SourceCapabilities(SourceCapabilities),
    /// Sink capabilities.
    SinkCapabilities(SinkCapabilities),
    /// Request for a power level from the source.
    Request(PowerSourceRequest),
    /// Request for a power level from the source, in EPR mode.
    EprRequest(EprRequest),
    /// Battery status response.
    BatteryStatus(BatteryStatusDataObject),
    /// Alert notification.
    Alert(AlertDataObject),
    /// Used to enter, acknowledge or exit EPR mode.
    EprMode(EprModeDataObject),
    /// Vendor defined message: VDM header and payload objects.
    VendorDefined((VdmHeader, Vec<u32, 7>)),
    /// Unknown data type.
    Unknown,
}

fn parse_pdo_list(payload: &[u8], count: usize) -> Vec<PowerDataObject, { source_capabilities::MAX_PDO_COUNT }> {
    payload
        .chunks_exact(4)
        .take(count)
        .map(|buf| source_capabilities::parse_raw_pdo(LittleEndian::read_u32(buf)))
        .collect()
}

/// Type a raw request data object by the PDO it was built from.
fn parse_request_for_pdo(raw: u32, pdo: &PowerDataObject) -> PowerSourceRequest {
    use source_capabilities::Augmented;

    match pdo {
        PowerDataObject::FixedSupply(_) | PowerDataObject::VariableSupply(_) => {
            PowerSourceRequest::FixedVariableSupply(request::FixedVariableSupply(raw))
        }
        PowerDataObject::Battery(_) => PowerSourceRequest::Battery(request::Battery(raw)),
        PowerDataObject::Augmented(Augmented::Spr(_)) => PowerSourceRequest::Pps(request::Pps(raw)),
        PowerDataObject::Augmented(Augmented::Epr(_)) => PowerSourceRequest::Avs(request::Avs(raw)),
        _ => PowerSourceRequest::Unknown(request::RawDataObject(raw)),
    }
}

impl Data {
    /// Parse a data message.
    pub fn parse_message<P: PdoState>(
        mut message: super::Message,
        message_type: DataMessageType,
        payload: &[u8],
        state: &P,
    ) -> Result<super::Message, super::ParseError> {
        let num_objects = message.header.num_objects();
        let len = payload.len();

        if len < 4 * num_objects {
            return Err(super::ParseError::InvalidLength {
                expected: 4 * num_objects,
                found: len,
            });
        }

        message.payload = Some(Payload::Data(match message_type {
            DataMessageType::SourceCapabilities => {
                Data::SourceCapabilities(SourceCapabilities(parse_pdo_list(payload, num_objects)))
            }
            DataMessageType::SinkCapabilities => {
                Data::SinkCapabilities(SinkCapabilities(parse_pdo_list(payload, num_objects)))
            }
            DataMessageType::Request => {
                if num_objects != 1 {
                    Data::Unknown
                } else {
                    let raw = request::RawDataObject(LittleEndian::read_u32(payload));
                    if let Some(kind) = state.pdo_at_object_position(raw.object_position()) {
                        Data::Request(match kind {
                            source_capabilities::Kind::FixedSupply | source_capabilities::Kind::VariableSupply => {
                                PowerSourceRequest::FixedVariableSupply(request::FixedVariableSupply(raw.0))
                            }
                            source_capabilities::Kind::Battery => PowerSourceRequest::Battery(request::Battery(raw.0)),
                            source_capabilities::Kind::Pps => PowerSourceRequest::Pps(request::Pps(raw.0)),
                            source_capabilities::Kind::Avs => PowerSourceRequest::Avs(request::Avs(raw.0)),
                        })
                    } else {
                        Data::Request(PowerSourceRequest::Unknown(raw))
                    }
                }
            }
            DataMessageType::EprRequest => {
                if num_objects != 2 {
                    Data::Unknown
                } else {
                    let rdo_raw = LittleEndian::read_u32(&payload[..4]);
                    let pdo = source_capabilities::parse_raw_pdo(LittleEndian::read_u32(&payload[4..8]));

                    Data::EprRequest(EprRequest::new(parse_request_for_pdo(rdo_raw, &pdo), pdo))
                }
            }
            DataMessageType::BatteryStatus => {
                Data::BatteryStatus(BatteryStatusDataObject(LittleEndian::read_u32(payload)))
            }
            DataMessageType::Alert => Data::Alert(AlertDataObject(LittleEndian::read_u32(payload))),
            DataMessageType::EprMode => Data::EprMode(EprModeDataObject(LittleEndian::read_u32(payload))),
            DataMessageType::VendorDefined => {
                if num_objects == 0 {
                    Data::Unknown
                } else {
                    let header = VdmHeader::from(LittleEndian::read_u32(&payload[..4]));

                    let data = payload[4..4 * num_objects]
                        .chunks_exact(4)
                        .map(LittleEndian::read_u32)
                        .collect::<Vec<u32, 7>>();

                    trace!("VDM RX: {:?} {:?}", header, data);

                    Data::VendorDefined((header, data))
                }
            }
            _ => {
                warn!("Unhandled data message type {:?}", message_type);
                Data::Unknown
            }
        }));

        Ok(message)
    }

    /// The data message type that carries this payload.
    pub fn message_type(&self) -> DataMessageType {
        match self {
            Self::SourceCapabilities(_) => DataMessageType::SourceCapabilities,
            Self::SinkCapabilities(_) => DataMessageType::SinkCapabilities,
            Self::Request(_) => DataMessageType::Request,
            Self::EprRequest(_) => DataMessageType::EprRequest,
            Self::BatteryStatus(_) => DataMessageType::BatteryStatus,
            Self::Alert(_) => DataMessageType::Alert,
            Self::EprMode(_) => DataMessageType::EprMode,
            Self::VendorDefined(_) => DataMessageType::VendorDefined,
            Self::Unknown => DataMessageType::Reserved,
        }
    }

    /// The number of 32 bit objects that the payload occupies.
    pub fn object_count(&self) -> u8 {
        match self {
            Self::SourceCapabilities(caps) => caps.pdos().len() as u8,
            Self::SinkCapabilities(caps) => caps.pdos().len() as u8,
            Self::Request(_) => 1,
            Self::EprRequest(_) => 2,
            Self::BatteryStatus(_) => 1,
            Self::Alert(_) => 1,
            Self::EprMode(_) => 1,
            Self::VendorDefined((_, objects)) => 1 + objects.len() as u8,
            Self::Unknown => 0,
        }
    }

    /// Serialize message data to a slice, returning the number of written bytes.
    pub fn to_bytes(&self, payload: &mut [u8]) -> usize {
        match self {
            Self::SourceCapabilities(caps) => Self::pdos_to_bytes(caps.pdos(), payload),
            Self::SinkCapabilities(caps) => Self::pdos_to_bytes(caps.pdos(), payload),
            Self::Request(request) => {
                LittleEndian::write_u32(payload, request.to_raw());
                4
            }
            Self::EprRequest(request) => request.to_bytes(payload),
            Self::BatteryStatus(status) => status.to_bytes(payload),
            Self::Alert(alert) => alert.to_bytes(payload),
            Self::EprMode(epr_mode) => epr_mode.to_bytes(payload),
            Self::VendorDefined((header, objects)) => {
                let mut size = header.to_bytes(payload);
                for object in objects {
                    LittleEndian::write_u32(&mut payload[size..], *object);
                    size += 4;
                }
                size
            }
            Self::Unknown => 0,
        }
    }

    fn pdos_to_bytes(pdos: &[PowerDataObject], payload: &mut [u8]) -> usize {
        let mut size = 0;
        for pdo in pdos {
            LittleEndian::write_u32(&mut payload[size..], pdo.to_raw());
            size += 4;
        }
        size
    }
}
