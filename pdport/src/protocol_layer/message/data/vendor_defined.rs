//! Definitions of vendor defined message content.
//!
//! See [6.4.4].
use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;

/// The role of a port in a structured VDM exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VdmCommandType {
    /// Initiator request.
    InitiatorReq,
    /// Responder acknowledge.
    ResponderAck,
    /// Responder negative acknowledge.
    ResponderNak,
    /// Responder busy.
    ResponderBsy,
}

impl From<VdmCommandType> for u8 {
    fn from(value: VdmCommandType) -> Self {
        match value {
            VdmCommandType::InitiatorReq => 0,
            VdmCommandType::ResponderAck => 1,
            VdmCommandType::ResponderNak => 2,
            VdmCommandType::ResponderBsy => 3,
        }
    }
}

impl From<u8> for VdmCommandType {
    fn from(value: u8) -> Self {
        match value {
            0 => VdmCommandType::InitiatorReq,
            1 => VdmCommandType::ResponderAck,
            2 => VdmCommandType::ResponderNak,
            3 => VdmCommandType::ResponderBsy,
            _ => unreachable!(), // Two-bit field.
        }
    }
}

/// Structured VDM commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VdmCommand {
    /// Discover the identity of the port partner.
    DiscoverIdentity,
    /// Discover supported standard or vendor IDs.
    DiscoverSvids,
    /// Discover the modes of an SVID.
    DiscoverModes,
    /// Enter a mode.
    EnterMode,
    /// Exit a mode.
    ExitMode,
    /// Attention notification.
    Attention,
    /// SVID-specific command.
    SvidSpecific(u8),
}

impl From<VdmCommand> for u8 {
    fn from(value: VdmCommand) -> Self {
        match value {
            VdmCommand::DiscoverIdentity => 0x01,
            VdmCommand::DiscoverSvids => 0x02,
            VdmCommand::DiscoverModes => 0x03,
            VdmCommand::EnterMode => 0x04,
            VdmCommand::ExitMode => 0x05,
            VdmCommand::Attention => 0x06,
            VdmCommand::SvidSpecific(x) => x,
        }
    }
}

impl From<u8> for VdmCommand {
    fn from(value: u8) -> Self {
        match value {
            0x01 => VdmCommand::DiscoverIdentity,
            0x02 => VdmCommand::DiscoverSvids,
            0x03 => VdmCommand::DiscoverModes,
            0x04 => VdmCommand::EnterMode,
            0x05 => VdmCommand::ExitMode,
            0x06 => VdmCommand::Attention,
            x => VdmCommand::SvidSpecific(x),
        }
    }
}

/// The kind of a vendor defined message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VdmType {
    /// Unstructured VDM, content defined by the vendor.
    Unstructured,
    /// Structured VDM, content defined by the PD specification.
    Structured,
}

impl From<VdmType> for bool {
    fn from(value: VdmType) -> Self {
        match value {
            VdmType::Unstructured => false,
            VdmType::Structured => true,
        }
    }
}

impl From<bool> for VdmType {
    fn from(value: bool) -> Self {
        match value {
            true => VdmType::Structured,
            false => VdmType::Unstructured,
        }
    }
}

/// The first data object of any vendor defined message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VdmHeader {
    /// Header of a structured VDM.
    Structured(VdmHeaderStructured),
    /// Header of an unstructured VDM.
    Unstructured(VdmHeaderUnstructured),
}

impl VdmHeader {
    /// Serialize to a binary buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        match self {
            VdmHeader::Structured(header) => header.to_bytes(buf),
            VdmHeader::Unstructured(header) => header.to_bytes(buf),
        }
    }
}

impl From<u32> for VdmHeader {
    fn from(value: u32) -> Self {
        let header = VdmHeaderRaw(value);
        match header.vdm_type() {
            VdmType::Structured => VdmHeader::Structured(VdmHeaderStructured(value)),
            VdmType::Unstructured => VdmHeader::Unstructured(VdmHeaderUnstructured(value)),
        }
    }
}

impl From<VdmHeader> for u32 {
    fn from(value: VdmHeader) -> Self {
        match value {
            VdmHeader::Structured(header) => header.0,
            VdmHeader::Unstructured(header) => header.0,
        }
    }
}

bitfield! {
    /// Common fields of structured and unstructured VDM headers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct VdmHeaderRaw(pub u32): FromStorage, IntoStorage {
        /// VDM Standard or Vendor ID
        pub standard_or_vid: u16 @ 16..=31,
        /// VDM Type (Unstructured/Structured)
        pub vdm_type: bool [VdmType] @ 15,
    }
}

bitfield! {
    /// Header of a structured VDM.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VdmHeaderStructured(pub u32): Debug, FromStorage, IntoStorage {
        /// VDM Standard or Vendor ID
        pub standard_or_vid: u16 @ 16..=31,
        /// VDM Type (Unstructured/Structured)
        pub vdm_type: bool [VdmType] @ 15,
        /// Structured VDM version, major
        pub vdm_version_major: u8 @ 13..=14,
        /// Structured VDM version, minor
        pub vdm_version_minor: u8 @ 11..=12,
        /// Object Position
        pub object_position: u8 @ 8..=10,
        /// Command Type
        pub command_type: u8 [VdmCommandType] @ 6..=7,
        /// Command
        pub command: u8 [VdmCommand] @ 0..=4,
    }
}

impl VdmHeaderStructured {
    /// Serialize to a binary buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// Turn a request header into the matching response header.
    pub fn reply(self, command_type: VdmCommandType) -> Self {
        self.with_command_type(command_type)
    }
}

impl Default for VdmHeaderStructured {
    fn default() -> Self {
        VdmHeaderStructured(0).with_vdm_type(VdmType::Structured)
    }
}

bitfield! {
    /// Header of an unstructured VDM.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VdmHeaderUnstructured(pub u32): FromStorage, IntoStorage {
        /// Vdm Standard or Vendor ID
        pub standard_or_vid: u16 @ 16..=31,
        /// Vdm Type (Unstructured/Structured)
        pub vdm_type: bool [VdmType] @ 15,
        /// Message defined
        pub data: u16 @ 0..=14
    }
}

impl VdmHeaderUnstructured {
    /// Serialize to a binary buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }
}

bitfield! {
    /// The ID header VDO, first object of a Discover Identity response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VdmIdentityHeader(pub u32): FromStorage, IntoStorage {
        /// Host data capable
        pub host_data: bool @ 31,
        /// Device data capable
        pub device_data: bool @ 30,
        /// Product type UFP
        pub product_type_ufp: u8 @ 27..=29,
        /// Modal Operation Supported
        pub modal_supported: bool @ 26,
        /// Product type DFP
        pub product_type_dfp: u8 @ 23..=25,
        /// Connector type
        pub connector_type: u8 @ 21..=22,
        /// VID
        pub vid: u16 @ 0..=15,
    }
}

impl VdmIdentityHeader {
    /// Serialize to a binary buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }
}

bitfield! {
    /// The cert stat VDO, second object of a Discover Identity response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct CertStatVdo(pub u32): FromStorage, IntoStorage {
        /// XID, assigned by USB-IF
        pub xid: u32 @ 0..=31,
    }
}

impl CertStatVdo {
    /// Serialize to a binary buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }
}

bitfield! {
    /// The product VDO, third object of a Discover Identity response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ProductVdo(pub u32): FromStorage, IntoStorage {
        /// USB Product ID
        pub pid: u16 @ 16..=31,
        /// Device version
        pub bcd_device: u16 @ 0..=15,
    }
}

impl ProductVdo {
    /// Serialize to a binary buffer, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }
}
