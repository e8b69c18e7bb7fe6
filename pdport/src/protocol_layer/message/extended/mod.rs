//! Definitions and implementations of extended messages.
//!
//! Only single-chunk extended messages are supported. Chunk reassembly is
//! left to PHYs that support unchunked operation, or to future work.
//!
//! See [6.5].
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;
use proc_bitfield::bitfield;

pub mod battery;
pub mod extended_control;
pub mod manufacturer_info;
pub mod status;

use battery::{BatteryCapabilities, GetBatteryCap, GetBatteryStatus};
use extended_control::ExtendedControl;
use manufacturer_info::{GetManufacturerInfo, ManufacturerInfo};
use status::{PpsStatus, Status};

use super::ParseError;
use super::data::source_capabilities::{MAX_PDO_COUNT, PowerDataObject, parse_raw_pdo};
use super::header::ExtendedMessageType;
use crate::protocol_layer::message::Payload;

/// The maximum number of data bytes in a single chunk.
pub const MAX_EXTENDED_DATA_SIZE: usize = 26;

bitfield! {
    /// The extended message header. Every extended message shall start with it.
    ///
    /// See [6.2.1.2].
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ExtendedHeader(pub u16): Debug, FromStorage, IntoStorage {
        /// Set when the message is communicated in chunks.
        pub chunked: bool @ 15,
        /// The number of the present chunk.
        pub chunk_number: u8 @ 11..=14,
        /// Set when the message requests a chunk, instead of delivering one.
        pub request_chunk: bool @ 10,
        /// The total number of data bytes in the message.
        pub data_size: u16 [get usize] @ 0..=8,
    }
}

impl ExtendedHeader {
    /// Parse an extended header from its binary representation.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < 2 {
            return Err(ParseError::InvalidLength {
                expected: 2,
                found: buf.len(),
            });
        }

        Ok(Self(LittleEndian::read_u16(buf)))
    }

    /// Serialize the extended header to its binary representation.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(buf, self.0);
        2
    }
}

/// Payloads of extended messages.
#[derive(Debug, Clone)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Extended {
    /// Extended control message.
    ExtendedControl(ExtendedControl),
    /// Status of the port partner.
    Status(Status),
    /// Status of a programmable power supply.
    PpsStatus(PpsStatus),
    /// Request for battery capabilities.
    GetBatteryCap(GetBatteryCap),
    /// Battery capabilities response.
    BatteryCapabilities(BatteryCapabilities),
    /// Request for battery status.
    GetBatteryStatus(GetBatteryStatus),
    /// Request for manufacturer information.
    GetManufacturerInfo(GetManufacturerInfo),
    /// Manufacturer information response.
    ManufacturerInfo(ManufacturerInfo),
    /// Security request, passed through opaquely.
    SecurityRequest(Vec<u8, MAX_EXTENDED_DATA_SIZE>),
    /// Security response, passed through opaquely.
    SecurityResponse(Vec<u8, MAX_EXTENDED_DATA_SIZE>),
    /// Firmware update request, passed through opaquely.
    FirmwareUpdateRequest(Vec<u8, MAX_EXTENDED_DATA_SIZE>),
    /// Firmware update response, passed through opaquely.
    FirmwareUpdateResponse(Vec<u8, MAX_EXTENDED_DATA_SIZE>),
    /// Capabilities offered by a source in EPR mode.
    EprSourceCapabilities(Vec<PowerDataObject, MAX_PDO_COUNT>),
    /// Capabilities of a sink in EPR mode.
    EprSinkCapabilities(Vec<PowerDataObject, MAX_PDO_COUNT>),
    /// A message of known type that is not modeled.
    Unknown(ExtendedMessageType),
}

fn collect_bytes(payload: &[u8]) -> Vec<u8, MAX_EXTENDED_DATA_SIZE> {
    payload.iter().copied().take(MAX_EXTENDED_DATA_SIZE).collect()
}

fn parse_pdo_list(payload: &[u8]) -> Vec<PowerDataObject, MAX_PDO_COUNT> {
    payload
        .chunks_exact(4)
        .take(MAX_PDO_COUNT)
        .map(|buf| parse_raw_pdo(LittleEndian::read_u32(buf)))
        .filter(|pdo| !pdo.is_zero_padding())
        .collect()
}

impl Extended {
    /// Parse an extended message.
    pub fn parse_message(
        mut message: super::Message,
        message_type: ExtendedMessageType,
        payload: &[u8],
    ) -> Result<super::Message, ParseError> {
        let extended_header = ExtendedHeader::from_bytes(payload)?;
        let data_size = extended_header.data_size();

        if extended_header.chunked() && extended_header.chunk_number() != 0 {
            return Err(ParseError::UnsupportedChunk);
        }

        let data = &payload[2..];
        if data.len() < data_size {
            return Err(ParseError::InvalidLength {
                expected: data_size,
                found: data.len(),
            });
        }
        let data = &data[..data_size];

        message.payload = Some(Payload::Extended(match message_type {
            ExtendedMessageType::ExtendedControl => Extended::ExtendedControl(ExtendedControl::from_bytes(data)),
            ExtendedMessageType::Status => Extended::Status(Status::from_bytes(data)),
            ExtendedMessageType::PpsStatus => Extended::PpsStatus(PpsStatus::from_bytes(data)),
            ExtendedMessageType::GetBatteryCap => Extended::GetBatteryCap(GetBatteryCap::from_bytes(data)),
            ExtendedMessageType::BatteryCapabilities => {
                Extended::BatteryCapabilities(BatteryCapabilities::from_bytes(data))
            }
            ExtendedMessageType::GetBatteryStatus => Extended::GetBatteryStatus(GetBatteryStatus::from_bytes(data)),
            ExtendedMessageType::GetManufacturerInfo => {
                Extended::GetManufacturerInfo(GetManufacturerInfo::from_bytes(data))
            }
            ExtendedMessageType::ManufacturerInfo => Extended::ManufacturerInfo(ManufacturerInfo::from_bytes(data)),
            ExtendedMessageType::SecurityRequest => Extended::SecurityRequest(collect_bytes(data)),
            ExtendedMessageType::SecurityResponse => Extended::SecurityResponse(collect_bytes(data)),
            ExtendedMessageType::FirmwareUpdateRequest => Extended::FirmwareUpdateRequest(collect_bytes(data)),
            ExtendedMessageType::FirmwareUpdateResponse => Extended::FirmwareUpdateResponse(collect_bytes(data)),
            ExtendedMessageType::EprSourceCapabilities => Extended::EprSourceCapabilities(parse_pdo_list(data)),
            ExtendedMessageType::EprSinkCapabilities => Extended::EprSinkCapabilities(parse_pdo_list(data)),
            other => Extended::Unknown(other),
        }));

        Ok(message)
    }

    /// The extended message type that carries this payload.
    pub fn message_type(&self) -> ExtendedMessageType {
        match self {
            Self::ExtendedControl(_) => ExtendedMessageType::ExtendedControl,
            Self::Status(_) => ExtendedMessageType::Status,
            Self::PpsStatus(_) => ExtendedMessageType::PpsStatus,
            Self::GetBatteryCap(_) => ExtendedMessageType::GetBatteryCap,
            Self::BatteryCapabilities(_) => ExtendedMessageType::BatteryCapabilities,
            Self::GetBatteryStatus(_) => ExtendedMessageType::GetBatteryStatus,
            Self::GetManufacturerInfo(_) => ExtendedMessageType::GetManufacturerInfo,
            Self::ManufacturerInfo(_) => ExtendedMessageType::ManufacturerInfo,
            Self::SecurityRequest(_) => ExtendedMessageType::SecurityRequest,
            Self::SecurityResponse(_) => ExtendedMessageType::SecurityResponse,
            Self::FirmwareUpdateRequest(_) => ExtendedMessageType::FirmwareUpdateRequest,
            Self::FirmwareUpdateResponse(_) => ExtendedMessageType::FirmwareUpdateResponse,
            Self::EprSourceCapabilities(_) => ExtendedMessageType::EprSourceCapabilities,
            Self::EprSinkCapabilities(_) => ExtendedMessageType::EprSinkCapabilities,
            Self::Unknown(message_type) => *message_type,
        }
    }

    /// Serialize message content to a slice, returning the number of written bytes.
    ///
    /// Includes the extended message header.
    pub fn to_bytes(&self, payload: &mut [u8]) -> usize {
        let data_size = {
            let data = &mut payload[2..];

            match self {
                Self::ExtendedControl(control) => control.to_bytes(data),
                Self::Status(status) => status.to_bytes(data),
                Self::PpsStatus(status) => status.to_bytes(data),
                Self::GetBatteryCap(request) => request.to_bytes(data),
                Self::BatteryCapabilities(caps) => caps.to_bytes(data),
                Self::GetBatteryStatus(request) => request.to_bytes(data),
                Self::GetManufacturerInfo(request) => request.to_bytes(data),
                Self::ManufacturerInfo(info) => info.to_bytes(data),
                Self::SecurityRequest(bytes)
                | Self::SecurityResponse(bytes)
                | Self::FirmwareUpdateRequest(bytes)
                | Self::FirmwareUpdateResponse(bytes) => {
                    data[..bytes.len()].copy_from_slice(bytes);
                    bytes.len()
                }
                Self::EprSourceCapabilities(pdos) | Self::EprSinkCapabilities(pdos) => {
                    // A single chunk holds at most six PDOs.
                    let mut size = 0;
                    for pdo in pdos.iter().take(MAX_EXTENDED_DATA_SIZE / 4) {
                        LittleEndian::write_u32(&mut data[size..], pdo.to_raw());
                        size += 4;
                    }
                    size
                }
                Self::Unknown(_) => 0,
            }
        };

        let extended_header = ExtendedHeader(0).with_data_size(data_size as u16);
        extended_header.to_bytes(payload);

        2 + data_size
    }

    /// The number of 32 bit objects that the message content occupies.
    ///
    /// Includes the extended message header.
    pub fn object_count(&self) -> u8 {
        let mut buffer = [0u8; 2 + MAX_EXTENDED_DATA_SIZE];
        let size = self.to_bytes(&mut buffer);
        size.div_ceil(4) as u8
    }
}
