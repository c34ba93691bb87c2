//! AVDTP signaling wire types
//!
//! Signal identifiers, header fields, error codes and the service
//! capability model of the AVDTP specification.

use heapless::Vec;

use crate::config::{AVDTP_CODEC_SIZE, AVDTP_PROTECT_SIZE};
use crate::Error;

/// L2CAP PSM of the AVDTP signaling and media channels.
pub const PSM_AVDTP: u16 = 0x0019;
/// L2CAP PSM of the AVDTP browsing channel.
pub const PSM_AVDTP_BROWSING: u16 = 0x001b;

/// Lowest addressable stream endpoint identifier.
pub const SEID_MIN: u8 = 1;
/// Highest addressable stream endpoint identifier.
pub const SEID_MAX: u8 = 62;

/// Signal identifier, low six bits of the second header octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SignalId {
    /// Discover available stream endpoints.
    Discover = 0x01,
    /// Get the basic capabilities of an endpoint.
    GetCapabilities = 0x02,
    /// Configure an endpoint.
    SetConfiguration = 0x03,
    /// Read the active configuration.
    GetConfiguration = 0x04,
    /// Change codec or content protection of an open stream.
    Reconfigure = 0x05,
    /// Open a configured stream.
    Open = 0x06,
    /// Start one or more open streams.
    Start = 0x07,
    /// Close a stream.
    Close = 0x08,
    /// Suspend one or more streaming streams.
    Suspend = 0x09,
    /// Abort a stream.
    Abort = 0x0a,
    /// Content protection exchange.
    SecurityControl = 0x0b,
    /// Get all capabilities, including later-spec categories.
    GetAllCapabilities = 0x0c,
    /// Sink-to-source delay report.
    DelayReport = 0x0d,
}

/// Highest defined signal identifier.
pub const SIG_ID_MAX: u8 = SignalId::DelayReport as u8;

impl TryFrom<u8> for SignalId {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0x01 => Self::Discover,
            0x02 => Self::GetCapabilities,
            0x03 => Self::SetConfiguration,
            0x04 => Self::GetConfiguration,
            0x05 => Self::Reconfigure,
            0x06 => Self::Open,
            0x07 => Self::Start,
            0x08 => Self::Close,
            0x09 => Self::Suspend,
            0x0a => Self::Abort,
            0x0b => Self::SecurityControl,
            0x0c => Self::GetAllCapabilities,
            0x0d => Self::DelayReport,
            _ => return Err(Error::InvalidValue),
        })
    }
}

impl From<SignalId> for u8 {
    fn from(value: SignalId) -> u8 {
        value as u8
    }
}

/// Message type, low two bits of the first header octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageType {
    /// Command.
    Command = 0x00,
    /// General reject.
    GeneralReject = 0x01,
    /// Response accept.
    ResponseAccept = 0x02,
    /// Response reject.
    ResponseReject = 0x03,
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value & 0x03 {
            0x00 => Self::Command,
            0x01 => Self::GeneralReject,
            0x02 => Self::ResponseAccept,
            _ => Self::ResponseReject,
        }
    }
}

/// Packet type, bits 2..3 of the first header octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketType {
    /// Complete message in one packet.
    Single = 0x00,
    /// First fragment; carries the fragment count and the signal.
    Start = 0x01,
    /// Middle fragment.
    Continue = 0x02,
    /// Last fragment.
    End = 0x03,
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value & 0x03 {
            0x00 => Self::Single,
            0x01 => Self::Start,
            0x02 => Self::Continue,
            _ => Self::End,
        }
    }
}

impl PacketType {
    /// Minimum length of a packet of this type (header plus mandatory
    /// fields).
    pub const fn min_len(&self) -> usize {
        match self {
            PacketType::Single => 2,
            PacketType::Start => 3,
            PacketType::Continue => 1,
            PacketType::End => 1,
        }
    }
}

/// AVDTP error codes carried by reject responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorCode {
    /// Packet header format error.
    BadHeaderFormat = 0x01,
    /// Payload length mismatch.
    BadLength = 0x11,
    /// Addressed SEID does not exist.
    BadAcpSeid = 0x12,
    /// Endpoint is already in use.
    SepInUse = 0x13,
    /// Endpoint is not in use.
    SepNotInUse = 0x14,
    /// Unknown service category in a configuration.
    BadServCategory = 0x17,
    /// Payload format error.
    BadPayloadFormat = 0x18,
    /// Command not supported.
    NotSupportedCommand = 0x19,
    /// Capabilities not valid for this message.
    InvalidCapabilities = 0x1a,
    /// Recovery type is not supported.
    BadRecoveryType = 0x22,
    /// Media transport capability format error.
    BadMediaTransportFormat = 0x23,
    /// Recovery capability format error.
    BadRecoveryFormat = 0x25,
    /// Header compression capability format error.
    BadRohcFormat = 0x26,
    /// Content protection capability format error.
    BadCpFormat = 0x27,
    /// Multiplexing capability format error.
    BadMultiplexingFormat = 0x28,
    /// Requested configuration is not supported.
    UnsupportedConfiguration = 0x29,
    /// Message not allowed in the current state.
    BadState = 0x31,
}

impl ErrorCode {
    /// Raw reject code.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::BadHeaderFormat,
            0x11 => Self::BadLength,
            0x12 => Self::BadAcpSeid,
            0x13 => Self::SepInUse,
            0x14 => Self::SepNotInUse,
            0x17 => Self::BadServCategory,
            0x19 => Self::NotSupportedCommand,
            0x1a => Self::InvalidCapabilities,
            0x22 => Self::BadRecoveryType,
            0x23 => Self::BadMediaTransportFormat,
            0x25 => Self::BadRecoveryFormat,
            0x26 => Self::BadRohcFormat,
            0x27 => Self::BadCpFormat,
            0x28 => Self::BadMultiplexingFormat,
            0x29 => Self::UnsupportedConfiguration,
            0x31 => Self::BadState,
            _ => Self::BadPayloadFormat,
        }
    }
}

// Protocol service category bits of `SepConfig::psc_mask`.
/// Media transport service.
pub const PSC_MEDIA_TRANSPORT: u16 = 1 << 1;
/// Reporting service.
pub const PSC_REPORTING: u16 = 1 << 2;
/// Recovery service.
pub const PSC_RECOVERY: u16 = 1 << 3;
/// Content protection service.
pub const PSC_CONTENT_PROTECTION: u16 = 1 << 4;
/// Header compression service.
pub const PSC_HEADER_COMPRESSION: u16 = 1 << 5;
/// Multiplexing service.
pub const PSC_MULTIPLEXING: u16 = 1 << 6;
/// Media codec service.
pub const PSC_MEDIA_CODEC: u16 = 1 << 7;
/// Delay reporting service.
pub const PSC_DELAY_REPORTING: u16 = 1 << 8;

/// Categories that may appear in a Set Configuration request.
pub const PSC_CONFIG_MASK: u16 = PSC_MEDIA_TRANSPORT | PSC_REPORTING | PSC_DELAY_REPORTING;

/// Basic (pre-1.3) categories reported by Get Capabilities.
pub const PSC_LEGACY_MASK: u16 = PSC_MEDIA_TRANSPORT
    | PSC_REPORTING
    | PSC_RECOVERY
    | PSC_CONTENT_PROTECTION
    | PSC_HEADER_COMPRESSION
    | PSC_MULTIPLEXING
    | PSC_MEDIA_CODEC;

/// Every category understood by this implementation.
pub const PSC_ALL_MASK: u16 = PSC_LEGACY_MASK | PSC_DELAY_REPORTING;

/// Service category identifiers 1..=8.
pub mod category {
    /// Media transport.
    pub const MEDIA_TRANSPORT: u8 = 1;
    /// Reporting.
    pub const REPORTING: u8 = 2;
    /// Recovery.
    pub const RECOVERY: u8 = 3;
    /// Content protection.
    pub const CONTENT_PROTECTION: u8 = 4;
    /// Header compression.
    pub const HEADER_COMPRESSION: u8 = 5;
    /// Multiplexing.
    pub const MULTIPLEXING: u8 = 6;
    /// Media codec.
    pub const MEDIA_CODEC: u8 = 7;
    /// Delay reporting.
    pub const DELAY_REPORTING: u8 = 8;
    /// Highest category understood by this implementation.
    pub const MAX_CURRENT: u8 = DELAY_REPORTING;
}

/// Information element length bounds per category, indexed by category
/// id. Lengths outside the bounds are rejected with the matching entry
/// of [`IE_ERR`].
pub(crate) const IE_LEN_MIN: [u8; 9] = [0, 0, 0, 3, 2, 1, 0, 2, 0];
pub(crate) const IE_LEN_MAX: [u8; 9] = [
    0,
    0,
    0,
    3,
    (AVDTP_PROTECT_SIZE - 1) as u8,
    1,
    7,
    (AVDTP_CODEC_SIZE - 1) as u8,
    0,
];

/// Reject code used when an information element fails its length or
/// format check, indexed by category id.
pub(crate) const IE_ERR: [ErrorCode; 9] = [
    ErrorCode::BadServCategory,
    ErrorCode::BadMediaTransportFormat,
    ErrorCode::BadLength,
    ErrorCode::BadRecoveryFormat,
    ErrorCode::BadCpFormat,
    ErrorCode::BadRohcFormat,
    ErrorCode::BadMultiplexingFormat,
    ErrorCode::BadServCategory,
    ErrorCode::BadServCategory,
];

/// RFC 2733 recovery, the only defined recovery type.
pub const RECOVERY_TYPE_RFC2733: u8 = 0x01;
/// Smallest maximum recovery window size.
pub const RECOVERY_MRWS_MIN: u8 = 0x01;
/// Largest maximum recovery window size.
pub const RECOVERY_MRWS_MAX: u8 = 0x18;
/// Smallest maximum number of media packets.
pub const RECOVERY_MNMP_MIN: u8 = 0x01;
/// Largest maximum number of media packets.
pub const RECOVERY_MNMP_MAX: u8 = 0x18;

/// Recovery service parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Recovery {
    /// Recovery type; only RFC 2733 is defined.
    pub recovery_type: u8,
    /// Maximum recovery window size.
    pub mrws: u8,
    /// Maximum number of media packets in a parity code.
    pub mnmp: u8,
}

/// Media type of a stream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MediaType {
    /// Audio.
    Audio = 0x00,
    /// Video.
    Video = 0x01,
    /// Multimedia.
    Multimedia = 0x02,
}

impl TryFrom<u8> for MediaType {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0x00 => Self::Audio,
            0x01 => Self::Video,
            0x02 => Self::Multimedia,
            _ => return Err(Error::InvalidValue),
        })
    }
}

/// Whether an endpoint produces or consumes media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SepType {
    /// Media source.
    Source = 0x00,
    /// Media sink.
    Sink = 0x01,
}

/// One entry of a Discover response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SepInfo {
    /// Stream endpoint identifier.
    pub seid: u8,
    /// Whether the endpoint currently carries a stream.
    pub in_use: bool,
    /// Media type.
    pub media_type: MediaType,
    /// Source or sink.
    pub sep_type: SepType,
}

/// A set of service capabilities, used both as endpoint capabilities
/// and as a stream configuration.
///
/// A valid *configuration* names exactly one codec and sets no category
/// bits outside [`PSC_CONFIG_MASK`]; *capabilities* may carry any
/// category.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SepConfig {
    /// Bitmask of parameterless service categories present.
    pub psc_mask: u16,
    /// Media codec information element payload (media type, codec type
    /// and codec specific bytes). Empty when no codec is present.
    pub codec: Vec<u8, AVDTP_CODEC_SIZE>,
    /// Content protection information element payload. Empty when no
    /// content protection is present.
    pub protect: Vec<u8, AVDTP_PROTECT_SIZE>,
    /// Recovery parameters, when the recovery service is present.
    pub recovery: Option<Recovery>,
    /// Header compression mask octet, when present.
    pub header_compression: Option<u8>,
}

impl SepConfig {
    /// Whether the set is valid as a stream configuration.
    pub fn is_valid_configuration(&self) -> bool {
        !self.codec.is_empty() && (self.psc_mask & !PSC_CONFIG_MASK) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_ids_round_trip() {
        for n in 1u8..=SIG_ID_MAX {
            assert_eq!(u8::from(SignalId::try_from(n).unwrap()), n);
        }
        assert!(SignalId::try_from(0).is_err());
        assert!(SignalId::try_from(SIG_ID_MAX + 1).is_err());
    }

    #[test]
    fn packet_type_minimums() {
        assert_eq!(PacketType::Single.min_len(), 2);
        assert_eq!(PacketType::Start.min_len(), 3);
        assert_eq!(PacketType::Continue.min_len(), 1);
        assert_eq!(PacketType::End.min_len(), 1);
    }

    #[test]
    fn configuration_validity() {
        let mut config = SepConfig {
            psc_mask: PSC_MEDIA_TRANSPORT,
            ..Default::default()
        };
        assert!(!config.is_valid_configuration());
        config.codec.extend_from_slice(&[0x00, 0x00, 0x21]).unwrap();
        assert!(config.is_valid_configuration());
        config.psc_mask |= PSC_RECOVERY;
        assert!(!config.is_valid_configuration());
    }
}
