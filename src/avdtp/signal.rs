//! AVDTP signaling codec
//!
//! Builds and parses the signaling header, the per-signal message
//! bodies and the configuration information elements. Parsers never
//! read past the supplied slice and return the AVDTP reject code of the
//! first offending element.

use heapless::Vec;

use super::types::{
    category, ErrorCode, MediaType, MessageType, PacketType, Recovery, SepConfig, SepInfo, SepType, SignalId, IE_ERR,
    IE_LEN_MAX, IE_LEN_MIN, PSC_ALL_MASK, PSC_CONTENT_PROTECTION, PSC_LEGACY_MASK, PSC_MEDIA_CODEC,
    RECOVERY_MNMP_MAX, RECOVERY_MNMP_MIN, RECOVERY_MRWS_MAX, RECOVERY_MRWS_MIN, RECOVERY_TYPE_RFC2733, SEID_MAX,
    SEID_MIN,
};
use crate::config::{AVDTP_MAX_DISCOVER_SEPS, AVDTP_MAX_SEPS_PER_CMD, AVDTP_SIG_BUFFER_SIZE};
use crate::Error;

/// First octet of every signaling packet.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SignalHeader {
    /// Transaction label, four bits.
    pub label: u8,
    /// Packet type.
    pub packet_type: PacketType,
    /// Message type.
    pub message_type: MessageType,
}

impl SignalHeader {
    /// Pack into the wire octet.
    pub fn to_byte(self) -> u8 {
        (self.label << 4) | ((self.packet_type as u8) << 2) | (self.message_type as u8)
    }

    /// Unpack from the wire octet.
    pub fn from_byte(byte: u8) -> Self {
        Self {
            label: byte >> 4,
            packet_type: PacketType::from(byte >> 2),
            message_type: MessageType::from(byte),
        }
    }
}

/// A parse failure: the reject code plus the category or SEID that
/// caused it (zero when not applicable).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ParseError {
    /// AVDTP reject code.
    pub code: ErrorCode,
    /// Failing service category or SEID, reported back in the reject.
    pub param: u8,
}

impl ParseError {
    fn new(code: ErrorCode) -> Self {
        Self { code, param: 0 }
    }

    fn with_param(code: ErrorCode, param: u8) -> Self {
        Self { code, param }
    }
}

/// Parsed command content.
#[derive(Debug, Clone, PartialEq)]
pub enum Command<'a> {
    /// Discover carries no parameters.
    Discover,
    /// Get (All) Capabilities, Get Configuration, Open, Close, Abort.
    Single {
        /// Addressed endpoint.
        seid: u8,
    },
    /// Set Configuration.
    SetConfiguration {
        /// Addressed (acceptor) endpoint.
        acp_seid: u8,
        /// Initiator endpoint.
        int_seid: u8,
        /// Requested configuration.
        config: SepConfig,
    },
    /// Reconfigure.
    Reconfigure {
        /// Addressed endpoint.
        seid: u8,
        /// Codec and content protection to change.
        config: SepConfig,
    },
    /// Start or Suspend, a list of endpoints.
    Multi {
        /// Addressed endpoints.
        seids: Vec<u8, AVDTP_MAX_SEPS_PER_CMD>,
    },
    /// Security Control; the payload stays borrowed from the receive
    /// buffer.
    SecurityControl {
        /// Addressed endpoint.
        seid: u8,
        /// Opaque content protection data.
        data: &'a [u8],
    },
    /// Delay Report.
    DelayReport {
        /// Addressed endpoint.
        seid: u8,
        /// Delay in tenths of milliseconds.
        delay: u16,
    },
}

/// Parsed response-accept content.
#[derive(Debug, Clone, PartialEq)]
pub enum Response<'a> {
    /// Empty accept.
    General,
    /// Discover response.
    Discover {
        /// Reported endpoints.
        seps: Vec<SepInfo, AVDTP_MAX_DISCOVER_SEPS>,
    },
    /// Get (All) Capabilities or Get Configuration response.
    ServiceCapabilities {
        /// Reported capabilities.
        config: SepConfig,
    },
    /// Security Control response.
    SecurityControl {
        /// Opaque content protection data.
        data: &'a [u8],
    },
}

/// Parsed reject content.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Reject {
    /// Failing category (Set Configuration, Reconfigure) or SEID
    /// (Start, Suspend), zero otherwise.
    pub param: u8,
    /// Reject code.
    pub code: ErrorCode,
}

fn check_seid(seid: u8) -> Result<u8, ParseError> {
    if (SEID_MIN..=SEID_MAX).contains(&seid) {
        Ok(seid)
    } else {
        Err(ParseError::with_param(ErrorCode::BadAcpSeid, seid))
    }
}

fn parse_seid(data: &[u8]) -> Result<u8, ParseError> {
    let byte = data.first().ok_or(ParseError::new(ErrorCode::BadLength))?;
    check_seid(byte >> 2)
}

/// Build the configuration information elements.
pub fn build_cfg(config: &SepConfig, out: &mut Vec<u8, AVDTP_SIG_BUFFER_SIZE>) -> Result<(), Error> {
    let mut push = |bytes: &[u8]| out.extend_from_slice(bytes).map_err(|_| Error::InsufficientSpace);

    if config.psc_mask & super::types::PSC_MEDIA_TRANSPORT != 0 {
        push(&[category::MEDIA_TRANSPORT, 0])?;
    }
    if config.psc_mask & super::types::PSC_REPORTING != 0 {
        push(&[category::REPORTING, 0])?;
    }
    if let Some(recovery) = &config.recovery {
        push(&[category::RECOVERY, 3, recovery.recovery_type, recovery.mrws, recovery.mnmp])?;
    }
    if let Some(mask) = config.header_compression {
        push(&[category::HEADER_COMPRESSION, 1, mask])?;
    }
    if !config.codec.is_empty() {
        push(&[category::MEDIA_CODEC, config.codec.len() as u8])?;
        push(&config.codec)?;
    }
    if !config.protect.is_empty() {
        push(&[category::CONTENT_PROTECTION, config.protect.len() as u8])?;
        push(&config.protect)?;
    }
    if config.psc_mask & super::types::PSC_DELAY_REPORTING != 0 {
        push(&[category::DELAY_REPORTING, 0])?;
    }
    Ok(())
}

/// Parse configuration information elements.
///
/// Unknown categories are a `BadServCategory` error inside Set
/// Configuration and Reconfigure but skipped inside capability
/// responses, so a newer peer stays interoperable.
pub fn parse_cfg(data: &[u8], sig: SignalId) -> Result<SepConfig, ParseError> {
    let strict = matches!(sig, SignalId::SetConfiguration | SignalId::Reconfigure);
    let mut config = SepConfig::default();
    let mut offset = 0usize;

    while offset < data.len() {
        if data.len() - offset < 2 {
            return Err(ParseError::new(ErrorCode::BadPayloadFormat));
        }
        let elem = data[offset];
        let elem_len = data[offset + 1] as usize;
        offset += 2;

        if elem == 0 || elem > category::MAX_CURRENT {
            if strict {
                // Cannot accept an unknown category in a configuration.
                return Err(ParseError::with_param(ErrorCode::BadServCategory, elem));
            }
            // Skip unknown categories in capability responses.
            debug!("[avdtp] skipping unknown service category={} len: {}", elem, elem_len);
            offset = (offset + elem_len).min(data.len());
            continue;
        }

        if elem_len > IE_LEN_MAX[elem as usize] as usize || elem_len < IE_LEN_MIN[elem as usize] as usize {
            return Err(ParseError::with_param(IE_ERR[elem as usize], elem));
        }
        if offset + elem_len > data.len() {
            return Err(ParseError::with_param(ErrorCode::BadLength, elem));
        }

        config.psc_mask |= 1u16 << elem;
        let payload = &data[offset..offset + elem_len];
        offset += elem_len;

        match elem {
            category::RECOVERY => {
                let recovery = Recovery {
                    recovery_type: payload[0],
                    mrws: payload[1],
                    mnmp: payload[2],
                };
                if recovery.recovery_type != RECOVERY_TYPE_RFC2733 {
                    return Err(ParseError::with_param(ErrorCode::BadRecoveryType, elem));
                }
                if !(RECOVERY_MRWS_MIN..=RECOVERY_MRWS_MAX).contains(&recovery.mrws)
                    || !(RECOVERY_MNMP_MIN..=RECOVERY_MNMP_MAX).contains(&recovery.mnmp)
                {
                    return Err(ParseError::with_param(ErrorCode::BadRecoveryFormat, elem));
                }
                config.recovery = Some(recovery);
            }
            category::CONTENT_PROTECTION => {
                config.psc_mask &= !PSC_CONTENT_PROTECTION;
                config.protect = Vec::from_slice(payload).map_err(|_| ParseError::with_param(IE_ERR[elem as usize], elem))?;
            }
            category::HEADER_COMPRESSION => {
                config.header_compression = Some(payload[0]);
            }
            category::MEDIA_CODEC => {
                config.psc_mask &= !PSC_MEDIA_CODEC;
                config.codec = Vec::from_slice(payload).map_err(|_| ParseError::with_param(IE_ERR[elem as usize], elem))?;
            }
            _ => {}
        }
    }

    Ok(config)
}

/// Build the body of a command (everything after the signal octet).
pub fn build_cmd(command: &Command<'_>, out: &mut Vec<u8, AVDTP_SIG_BUFFER_SIZE>) -> Result<(), Error> {
    match command {
        Command::Discover => Ok(()),
        Command::Single { seid } => out.push(seid << 2).map_err(|_| Error::InsufficientSpace),
        Command::SetConfiguration {
            acp_seid,
            int_seid,
            config,
        } => {
            out.push(acp_seid << 2).map_err(|_| Error::InsufficientSpace)?;
            out.push(int_seid << 2).map_err(|_| Error::InsufficientSpace)?;
            build_cfg(config, out)
        }
        Command::Reconfigure { seid, config } => {
            out.push(seid << 2).map_err(|_| Error::InsufficientSpace)?;
            // A reconfiguration carries only codec and content
            // protection elements.
            let mut trimmed = config.clone();
            trimmed.psc_mask = 0;
            trimmed.recovery = None;
            trimmed.header_compression = None;
            build_cfg(&trimmed, out)
        }
        Command::Multi { seids } => {
            for seid in seids {
                out.push(seid << 2).map_err(|_| Error::InsufficientSpace)?;
            }
            Ok(())
        }
        Command::SecurityControl { seid, data } => {
            out.push(seid << 2).map_err(|_| Error::InsufficientSpace)?;
            out.extend_from_slice(data).map_err(|_| Error::InsufficientSpace)
        }
        Command::DelayReport { seid, delay } => {
            out.push(seid << 2).map_err(|_| Error::InsufficientSpace)?;
            out.extend_from_slice(&delay.to_be_bytes())
                .map_err(|_| Error::InsufficientSpace)
        }
    }
}

/// Parse the body of a received command.
pub fn parse_cmd<'a>(sig: SignalId, data: &'a [u8]) -> Result<Command<'a>, ParseError> {
    match sig {
        SignalId::Discover => Ok(Command::Discover),
        SignalId::GetCapabilities
        | SignalId::GetConfiguration
        | SignalId::Open
        | SignalId::Close
        | SignalId::Abort
        | SignalId::GetAllCapabilities => {
            if data.len() != 1 {
                return Err(ParseError::new(ErrorCode::BadLength));
            }
            Ok(Command::Single { seid: parse_seid(data)? })
        }
        SignalId::SetConfiguration => {
            if data.len() < 2 {
                return Err(ParseError::new(ErrorCode::BadLength));
            }
            let acp_seid = check_seid(data[0] >> 2)?;
            let int_seid = check_seid(data[1] >> 2)?;
            let config = parse_cfg(&data[2..], sig)?;
            // A configuration must name a codec and stay within the
            // configurable categories.
            if !config.is_valid_configuration() {
                return Err(ParseError::new(ErrorCode::InvalidCapabilities));
            }
            Ok(Command::SetConfiguration {
                acp_seid,
                int_seid,
                config,
            })
        }
        SignalId::Reconfigure => {
            if data.is_empty() {
                return Err(ParseError::new(ErrorCode::BadLength));
            }
            let seid = check_seid(data[0] >> 2)?;
            let config = parse_cfg(&data[1..], sig)?;
            if config.psc_mask != 0 || (config.codec.is_empty() && config.protect.is_empty()) {
                return Err(ParseError::new(ErrorCode::InvalidCapabilities));
            }
            Ok(Command::Reconfigure { seid, config })
        }
        SignalId::Start | SignalId::Suspend => {
            if data.is_empty() || data.len() > AVDTP_MAX_SEPS_PER_CMD {
                return Err(ParseError::new(ErrorCode::BadLength));
            }
            let mut seids = Vec::new();
            for byte in data {
                let seid = byte >> 2;
                if !(SEID_MIN..=SEID_MAX).contains(&seid) {
                    return Err(ParseError::with_param(ErrorCode::BadAcpSeid, seid));
                }
                seids.push(seid).map_err(|_| ParseError::new(ErrorCode::BadLength))?;
            }
            Ok(Command::Multi { seids })
        }
        SignalId::SecurityControl => {
            if data.is_empty() {
                return Err(ParseError::new(ErrorCode::BadLength));
            }
            Ok(Command::SecurityControl {
                seid: check_seid(data[0] >> 2)?,
                data: &data[1..],
            })
        }
        SignalId::DelayReport => {
            if data.len() != 3 {
                return Err(ParseError::new(ErrorCode::BadLength));
            }
            let seid = check_seid(data[0] >> 2)?;
            let delay = u16::from_be_bytes([data[1], data[2]]);
            Ok(Command::DelayReport { seid, delay })
        }
    }
}

/// Build the body of a response-accept.
pub fn build_rsp(response: &Response<'_>, out: &mut Vec<u8, AVDTP_SIG_BUFFER_SIZE>) -> Result<(), Error> {
    match response {
        Response::General => Ok(()),
        Response::Discover { seps } => {
            for sep in seps {
                out.push((sep.seid << 2) | ((sep.in_use as u8) << 1))
                    .map_err(|_| Error::InsufficientSpace)?;
                out.push(((sep.media_type as u8) << 4) | ((sep.sep_type as u8) << 3))
                    .map_err(|_| Error::InsufficientSpace)?;
            }
            Ok(())
        }
        Response::ServiceCapabilities { config } => build_cfg(config, out),
        Response::SecurityControl { data } => out.extend_from_slice(data).map_err(|_| Error::InsufficientSpace),
    }
}

/// Parse the body of a received response-accept.
pub fn parse_rsp<'a>(sig: SignalId, data: &'a [u8]) -> Result<Response<'a>, ParseError> {
    match sig {
        SignalId::Discover => {
            let mut seps = Vec::new();
            for entry in data.chunks_exact(2) {
                if seps.len() == AVDTP_MAX_DISCOVER_SEPS {
                    break;
                }
                let seid = entry[0] >> 2;
                if !(SEID_MIN..=SEID_MAX).contains(&seid) {
                    return Err(ParseError::with_param(ErrorCode::BadAcpSeid, seid));
                }
                let media_type = MediaType::try_from(entry[1] >> 4)
                    .map_err(|_| ParseError::new(ErrorCode::BadPayloadFormat))?;
                let sep_type = if entry[1] & 0x08 != 0 { SepType::Sink } else { SepType::Source };
                seps.push(SepInfo {
                    seid,
                    in_use: entry[0] & 0x02 != 0,
                    media_type,
                    sep_type,
                })
                .map_err(|_| ParseError::new(ErrorCode::BadLength))?;
            }
            Ok(Response::Discover { seps })
        }
        SignalId::GetCapabilities => {
            let mut config = parse_cfg(data, sig)?;
            config.psc_mask &= PSC_LEGACY_MASK;
            Ok(Response::ServiceCapabilities { config })
        }
        SignalId::GetAllCapabilities | SignalId::GetConfiguration => {
            let mut config = parse_cfg(data, sig)?;
            config.psc_mask &= PSC_ALL_MASK;
            Ok(Response::ServiceCapabilities { config })
        }
        SignalId::SecurityControl => Ok(Response::SecurityControl { data }),
        _ => Ok(Response::General),
    }
}

/// Build the body of a reject.
pub fn build_rej(sig: SignalId, reject: &Reject, out: &mut Vec<u8, AVDTP_SIG_BUFFER_SIZE>) -> Result<(), Error> {
    match sig {
        SignalId::SetConfiguration | SignalId::Reconfigure => {
            out.push(reject.param).map_err(|_| Error::InsufficientSpace)?;
        }
        SignalId::Start | SignalId::Suspend => {
            out.push(reject.param << 2).map_err(|_| Error::InsufficientSpace)?;
        }
        _ => {}
    }
    out.push(reject.code.to_u8()).map_err(|_| Error::InsufficientSpace)
}

/// Parse the body of a received reject.
pub fn parse_rej(sig: SignalId, data: &[u8]) -> Result<Reject, ParseError> {
    let mut param = 0;
    let mut data = data;
    if !data.is_empty() {
        match sig {
            SignalId::SetConfiguration | SignalId::Reconfigure => {
                param = data[0];
                data = &data[1..];
            }
            SignalId::Start | SignalId::Suspend => {
                param = data[0] >> 2;
                data = &data[1..];
            }
            _ => {}
        }
    }
    // A reject without an error code is itself malformed.
    let code = data.first().ok_or(ParseError::new(ErrorCode::BadLength))?;
    Ok(Reject {
        param,
        code: ErrorCode::from(*code),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avdtp::types::{PSC_DELAY_REPORTING, PSC_MEDIA_TRANSPORT, PSC_REPORTING};

    fn codec_config() -> SepConfig {
        let mut config = SepConfig {
            psc_mask: PSC_MEDIA_TRANSPORT | PSC_DELAY_REPORTING,
            ..Default::default()
        };
        // SBC, 44.1kHz stereo
        config.codec.extend_from_slice(&[0x00, 0x00, 0x21, 0x15, 2, 53]).unwrap();
        config
    }

    #[test]
    fn header_round_trip() {
        for label in 0..16 {
            let header = SignalHeader {
                label,
                packet_type: PacketType::Start,
                message_type: MessageType::ResponseReject,
            };
            assert_eq!(SignalHeader::from_byte(header.to_byte()), header);
        }
    }

    #[test]
    fn configuration_round_trip() {
        let config = codec_config();
        let mut out = Vec::new();
        build_cfg(&config, &mut out).unwrap();
        let parsed = parse_cfg(&out, SignalId::SetConfiguration).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn capabilities_round_trip_with_all_categories() {
        let mut config = SepConfig {
            psc_mask: PSC_MEDIA_TRANSPORT | PSC_REPORTING | PSC_DELAY_REPORTING,
            recovery: Some(Recovery {
                recovery_type: RECOVERY_TYPE_RFC2733,
                mrws: 0x10,
                mnmp: 0x05,
            }),
            header_compression: Some(0x60),
            ..Default::default()
        };
        config.codec.extend_from_slice(&[0x00, 0x00, 0x21, 0x15]).unwrap();
        config.protect.extend_from_slice(&[0x02, 0x00]).unwrap();

        let mut out = Vec::new();
        build_cfg(&config, &mut out).unwrap();
        let parsed = parse_cfg(&out, SignalId::GetCapabilities).unwrap();
        // Recovery and header compression set their psc bits on parse.
        assert_eq!(parsed.codec, config.codec);
        assert_eq!(parsed.protect, config.protect);
        assert_eq!(parsed.recovery, config.recovery);
        assert_eq!(parsed.header_compression, config.header_compression);
    }

    #[test]
    fn unknown_category_rejected_in_configuration() {
        let data = [0x0e, 0x01, 0xaa];
        let err = parse_cfg(&data, SignalId::SetConfiguration).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadServCategory);
        assert_eq!(err.param, 0x0e);
    }

    #[test]
    fn unknown_category_skipped_in_capabilities() {
        // Unknown category 0x0e followed by a codec element.
        let data = [0x0e, 0x01, 0xaa, 0x07, 0x02, 0x00, 0x00];
        let config = parse_cfg(&data, SignalId::GetCapabilities).unwrap();
        assert_eq!(config.codec.as_slice(), &[0x00, 0x00]);
    }

    #[test]
    fn recovery_bounds_enforced() {
        // MRWS above the maximum.
        let data = [0x03, 0x03, RECOVERY_TYPE_RFC2733, 0x19, 0x01];
        let err = parse_cfg(&data, SignalId::SetConfiguration).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRecoveryFormat);

        // Unknown recovery type.
        let data = [0x03, 0x03, 0x02, 0x01, 0x01];
        let err = parse_cfg(&data, SignalId::SetConfiguration).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRecoveryType);
    }

    #[test]
    fn element_longer_than_payload_rejected() {
        let data = [0x07, 0x10, 0x00, 0x00];
        let err = parse_cfg(&data, SignalId::GetCapabilities).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadLength);
    }

    #[test]
    fn set_configuration_without_codec_rejected() {
        let mut out = Vec::new();
        build_cmd(
            &Command::SetConfiguration {
                acp_seid: 1,
                int_seid: 2,
                config: SepConfig {
                    psc_mask: PSC_MEDIA_TRANSPORT,
                    ..Default::default()
                },
            },
            &mut out,
        )
        .unwrap();
        let err = parse_cmd(SignalId::SetConfiguration, &out).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidCapabilities);
    }

    #[test]
    fn set_configuration_round_trip() {
        let config = codec_config();
        let mut out = Vec::new();
        build_cmd(
            &Command::SetConfiguration {
                acp_seid: 4,
                int_seid: 9,
                config: config.clone(),
            },
            &mut out,
        )
        .unwrap();
        match parse_cmd(SignalId::SetConfiguration, &out).unwrap() {
            Command::SetConfiguration {
                acp_seid,
                int_seid,
                config: parsed,
            } => {
                assert_eq!(acp_seid, 4);
                assert_eq!(int_seid, 9);
                assert_eq!(parsed, config);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn multi_round_trip() {
        let mut seids = Vec::new();
        seids.extend_from_slice(&[1, 5, 62]).unwrap();
        let mut out = Vec::new();
        build_cmd(&Command::Multi { seids: seids.clone() }, &mut out).unwrap();
        match parse_cmd(SignalId::Start, &out).unwrap() {
            Command::Multi { seids: parsed } => assert_eq!(parsed, seids),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn discover_response_round_trip() {
        let mut seps = Vec::new();
        seps.push(SepInfo {
            seid: 1,
            in_use: false,
            media_type: MediaType::Audio,
            sep_type: SepType::Source,
        })
        .unwrap();
        seps.push(SepInfo {
            seid: 8,
            in_use: true,
            media_type: MediaType::Video,
            sep_type: SepType::Sink,
        })
        .unwrap();

        let mut out = Vec::new();
        build_rsp(&Response::Discover { seps: seps.clone() }, &mut out).unwrap();
        match parse_rsp(SignalId::Discover, &out).unwrap() {
            Response::Discover { seps: parsed } => assert_eq!(parsed, seps),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn delay_report_is_big_endian() {
        let mut out = Vec::new();
        build_cmd(&Command::DelayReport { seid: 3, delay: 0x1234 }, &mut out).unwrap();
        assert_eq!(out.as_slice(), &[3 << 2, 0x12, 0x34]);
    }

    #[test]
    fn reject_round_trip_carries_category() {
        let reject = Reject {
            param: category::RECOVERY,
            code: ErrorCode::BadRecoveryFormat,
        };
        let mut out = Vec::new();
        build_rej(SignalId::SetConfiguration, &reject, &mut out).unwrap();
        assert_eq!(parse_rej(SignalId::SetConfiguration, &out).unwrap(), reject);
    }

    #[test]
    fn reject_round_trip_carries_seid() {
        let reject = Reject {
            param: 7,
            code: ErrorCode::BadState,
        };
        let mut out = Vec::new();
        build_rej(SignalId::Start, &reject, &mut out).unwrap();
        assert_eq!(out.as_slice(), &[7 << 2, 0x31]);
        assert_eq!(parse_rej(SignalId::Start, &out).unwrap(), reject);
    }

    #[test]
    fn empty_reject_is_malformed() {
        assert!(parse_rej(SignalId::Open, &[]).is_err());
    }
}
