//! # AVDTP signaling
//!
//! The Audio/Video Distribution Transport Protocol control channel:
//! codec, fragmentation/reassembly, per-channel (CCB) and per-stream
//! (SCB) state and the response/retransmission timers. The engine is
//! sans-IO: the surrounding stack feeds it received packets, congestion
//! changes and timer expiries and supplies the transport through
//! [`SignalingOps`].
//!
//! Entities are allocated from fixed pools and addressed by handles; a
//! stream block references its owning channel by index, never by
//! borrow.

mod ccb;
mod sar;
pub mod signal;
mod scb;
pub mod types;

use bt_hci::param::BdAddr;
use embassy_time::Duration;
use heapless::Vec;

use ccb::{Ccb, SignalMessage};
use scb::Scb;
use signal::{build_cmd, build_rej, build_rsp, parse_cmd, parse_rej, parse_rsp, Command, Reject, Response, SignalHeader};
use types::{ErrorCode, MediaType, MessageType, SepConfig, SepInfo, SepType, SignalId};

use crate::config::{AVDTP_MAX_CHANNELS, AVDTP_MAX_DISCOVER_SEPS, AVDTP_MAX_ENDPOINTS, AVDTP_MAX_SEPS_PER_CMD};
use crate::Error;

/// Handle of an open signaling channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelHandle(u8);

/// The three per-channel timers. At most one firing of each is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerKind {
    /// Quiet-channel watchdog.
    Idle,
    /// Command retransmission.
    Retransmit,
    /// Final response deadline.
    Response,
}

/// Transport and timer glue supplied by the surrounding stack, scoped
/// to one signaling channel.
pub trait SignalingOps {
    /// Hand one signaling packet to the transport.
    fn try_write(&mut self, data: &[u8]) -> Result<(), Error>;
    /// Arm a one-shot timer, replacing any pending firing of the same
    /// kind. Expiry is reported back through
    /// [`Signaling::on_timer_expired`].
    fn set_timer(&mut self, timer: TimerKind, duration: Duration);
    /// Disarm a timer.
    fn cancel_timer(&mut self, timer: TimerKind);
    /// Deliver an event to the stream owner.
    fn event(&mut self, event: AvdtpEvent<'_>) -> Result<(), Error>;
}

/// Events delivered to the stream owner.
#[derive(Debug, Clone, PartialEq)]
pub enum AvdtpEvent<'a> {
    /// Peer configured a local endpoint.
    SetConfigInd {
        /// Configured local endpoint.
        seid: u8,
        /// Peer endpoint.
        int_seid: u8,
        /// Accepted configuration.
        config: SepConfig,
    },
    /// Peer changed codec or content protection parameters.
    ReconfigInd {
        /// Local endpoint.
        seid: u8,
        /// New parameters.
        config: SepConfig,
    },
    /// Peer opened a stream.
    OpenInd {
        /// Local endpoint.
        seid: u8,
    },
    /// Peer started streams.
    StartInd {
        /// Local endpoints.
        seids: Vec<u8, AVDTP_MAX_SEPS_PER_CMD>,
    },
    /// Peer suspended streams.
    SuspendInd {
        /// Local endpoints.
        seids: Vec<u8, AVDTP_MAX_SEPS_PER_CMD>,
    },
    /// Peer closed a stream.
    CloseInd {
        /// Local endpoint.
        seid: u8,
    },
    /// Peer aborted a stream.
    AbortInd {
        /// Local endpoint.
        seid: u8,
    },
    /// Peer ran a content protection exchange.
    SecurityControlInd {
        /// Local endpoint.
        seid: u8,
        /// Opaque content protection data, borrowed from the receive
        /// buffer for this dispatch.
        data: &'a [u8],
    },
    /// Peer reported its playback delay.
    DelayReportInd {
        /// Local endpoint.
        seid: u8,
        /// Delay in tenths of milliseconds.
        delay: u16,
    },
    /// Response to [`Signaling::discover`].
    DiscoverCfm {
        /// Peer endpoints.
        seps: Vec<SepInfo, AVDTP_MAX_DISCOVER_SEPS>,
    },
    /// Response to [`Signaling::get_capabilities`].
    GetCapabilitiesCfm {
        /// Peer capabilities.
        config: SepConfig,
    },
    /// Response to [`Signaling::get_configuration`].
    GetConfigurationCfm {
        /// Active configuration.
        config: SepConfig,
    },
    /// Peer accepted our Set Configuration.
    SetConfigCfm {
        /// Local endpoint now bound to the stream.
        seid: u8,
    },
    /// Peer accepted our Reconfigure.
    ReconfigCfm {
        /// Local endpoint.
        seid: u8,
    },
    /// Peer accepted our Open.
    OpenCfm {
        /// Local endpoint.
        seid: u8,
    },
    /// Peer accepted our Start.
    StartCfm {
        /// Local endpoints.
        seids: Vec<u8, AVDTP_MAX_SEPS_PER_CMD>,
    },
    /// Peer accepted our Suspend.
    SuspendCfm {
        /// Local endpoints.
        seids: Vec<u8, AVDTP_MAX_SEPS_PER_CMD>,
    },
    /// Peer accepted our Close.
    CloseCfm {
        /// Local endpoint.
        seid: u8,
    },
    /// Peer accepted our Abort.
    AbortCfm {
        /// Local endpoint.
        seid: u8,
    },
    /// Response to [`Signaling::security_control`].
    SecurityControlCfm {
        /// Opaque content protection data.
        data: &'a [u8],
    },
    /// Peer accepted our Delay Report.
    DelayReportCfm,
    /// Peer rejected one of our commands.
    CommandRejected {
        /// Rejected signal.
        sig: SignalId,
        /// Reject code.
        code: ErrorCode,
        /// Failing category or SEID, zero when not applicable.
        param: u8,
    },
    /// A command was retransmitted to exhaustion or its response timer
    /// fired; the signaling channel is considered broken.
    TransportFailure {
        /// Failed signal.
        sig: SignalId,
    },
    /// The channel has been quiet; the owner may release it.
    IdleTimeout,
}

/// The AVDTP signaling engine: channel and endpoint pools plus the
/// dispatch of parsed messages.
pub struct Signaling {
    ccbs: [Option<Ccb>; AVDTP_MAX_CHANNELS],
    scbs: [Option<Scb>; AVDTP_MAX_ENDPOINTS],
}

impl Default for Signaling {
    fn default() -> Self {
        Self::new()
    }
}

impl Signaling {
    /// Create the engine with empty pools.
    pub fn new() -> Self {
        Self {
            ccbs: [const { None }; AVDTP_MAX_CHANNELS],
            scbs: [const { None }; AVDTP_MAX_ENDPOINTS],
        }
    }

    /// Register a local stream endpoint. `seid` must be unique and in
    /// 1..=62.
    pub fn register_endpoint(
        &mut self,
        seid: u8,
        media_type: MediaType,
        sep_type: SepType,
        capabilities: SepConfig,
    ) -> Result<(), Error> {
        if !(types::SEID_MIN..=types::SEID_MAX).contains(&seid) {
            return Err(Error::InvalidValue);
        }
        if self.scb_by_seid(seid).is_some() {
            return Err(Error::InvalidValue);
        }
        let slot = self
            .scbs
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(Error::OutOfMemory)?;
        *slot = Some(Scb::new(seid, media_type, sep_type, capabilities));
        Ok(())
    }

    /// A signaling channel to a peer is up; allocate its control block.
    pub fn channel_open(&mut self, peer: BdAddr, peer_mtu: u16) -> Result<ChannelHandle, Error> {
        let index = self
            .ccbs
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(Error::OutOfMemory)?;
        self.ccbs[index] = Some(Ccb::new(peer, peer_mtu));
        Ok(ChannelHandle(index as u8))
    }

    /// The signaling channel is gone: cancel timers, drop queued
    /// messages and release every stream bound to it.
    pub fn channel_close<OPS: SignalingOps>(&mut self, handle: ChannelHandle, ops: &mut OPS) -> Result<(), Error> {
        let ccb = self.ccbs[handle.0 as usize].as_mut().ok_or(Error::InvalidHandle)?;
        ccb.flush(ops);
        self.ccbs[handle.0 as usize] = None;
        for scb in self.scbs.iter_mut().flatten() {
            if scb.ccb == Some(handle.0) {
                scb.release();
            }
        }
        Ok(())
    }

    /// Transport congestion changed; a cleared channel resumes the
    /// fragmentation loop.
    pub fn on_congestion<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        congested: bool,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let ccb = self.ccb_mut(handle)?;
        ccb.congested = congested;
        if !congested {
            ccb.send_pending(ops)?;
        }
        Ok(())
    }

    /// The transport dropped; behaves as cancellation.
    pub fn on_disconnect<OPS: SignalingOps>(&mut self, handle: ChannelHandle, ops: &mut OPS) -> Result<(), Error> {
        self.channel_close(handle, ops)
    }

    /// A channel timer fired.
    pub fn on_timer_expired<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        timer: TimerKind,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let ccb = self.ccb_mut(handle)?;
        match timer {
            TimerKind::Idle => ops.event(AvdtpEvent::IdleTimeout),
            TimerKind::Retransmit => {
                if ccb.handle_retransmit_timeout(ops)? {
                    if let Some(command) = ccb.curr_cmd.take() {
                        warn!("[avdtp] Retransmissions exhausted for {:?}", command.sig);
                        ops.event(AvdtpEvent::TransportFailure { sig: command.sig })?;
                    }
                    ccb.send_pending(ops)?;
                }
                Ok(())
            }
            TimerKind::Response => {
                if let Some(command) = ccb.take_current_command(ops) {
                    warn!("[avdtp] Response timeout for {:?}", command.sig);
                    ops.event(AvdtpEvent::TransportFailure { sig: command.sig })?;
                }
                ccb.send_pending(ops)
            }
        }
    }

    // ======== Initiator commands

    /// Discover the peer's stream endpoints.
    pub fn discover<OPS: SignalingOps>(&mut self, handle: ChannelHandle, ops: &mut OPS) -> Result<(), Error> {
        self.send_command(handle, Command::Discover, SignalId::Discover, 0, &[], ops)
    }

    /// Read the capabilities of a peer endpoint. `all` selects Get All
    /// Capabilities.
    pub fn get_capabilities<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        peer_seid: u8,
        all: bool,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let sig = if all {
            SignalId::GetAllCapabilities
        } else {
            SignalId::GetCapabilities
        };
        self.send_command(handle, Command::Single { seid: peer_seid }, sig, 0, &[], ops)
    }

    /// Configure a peer endpoint, binding the local endpoint to it once
    /// the peer accepts.
    pub fn set_configuration<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        peer_seid: u8,
        local_seid: u8,
        config: &SepConfig,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        if !config.is_valid_configuration() {
            return Err(Error::InvalidValue);
        }
        self.scb_by_seid(local_seid).ok_or(Error::NotFound)?;
        self.send_command(
            handle,
            Command::SetConfiguration {
                acp_seid: peer_seid,
                int_seid: local_seid,
                config: config.clone(),
            },
            SignalId::SetConfiguration,
            local_seid,
            &[],
            ops,
        )
    }

    /// Read the active configuration of the stream on a local endpoint.
    pub fn get_configuration<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        local_seid: u8,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let peer_seid = self.bound_peer_seid(local_seid)?;
        self.send_command(
            handle,
            Command::Single { seid: peer_seid },
            SignalId::GetConfiguration,
            local_seid,
            &[],
            ops,
        )
    }

    /// Change codec or content protection parameters of an open stream.
    pub fn reconfigure<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        local_seid: u8,
        config: &SepConfig,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let peer_seid = self.bound_peer_seid(local_seid)?;
        self.send_command(
            handle,
            Command::Reconfigure {
                seid: peer_seid,
                config: config.clone(),
            },
            SignalId::Reconfigure,
            local_seid,
            &[],
            ops,
        )
    }

    /// Open the stream configured on a local endpoint.
    pub fn open_stream<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        local_seid: u8,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let peer_seid = self.bound_peer_seid(local_seid)?;
        self.send_command(
            handle,
            Command::Single { seid: peer_seid },
            SignalId::Open,
            local_seid,
            &[],
            ops,
        )
    }

    /// Start the streams on the given local endpoints.
    pub fn start_streams<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        local_seids: &[u8],
        ops: &mut OPS,
    ) -> Result<(), Error> {
        self.multi_command(handle, SignalId::Start, local_seids, ops)
    }

    /// Suspend the streams on the given local endpoints.
    pub fn suspend_streams<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        local_seids: &[u8],
        ops: &mut OPS,
    ) -> Result<(), Error> {
        self.multi_command(handle, SignalId::Suspend, local_seids, ops)
    }

    /// Close the stream on a local endpoint.
    pub fn close_stream<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        local_seid: u8,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let peer_seid = self.bound_peer_seid(local_seid)?;
        self.send_command(
            handle,
            Command::Single { seid: peer_seid },
            SignalId::Close,
            local_seid,
            &[],
            ops,
        )
    }

    /// Abort the stream on a local endpoint.
    pub fn abort_stream<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        local_seid: u8,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let peer_seid = self.bound_peer_seid(local_seid)?;
        self.send_command(
            handle,
            Command::Single { seid: peer_seid },
            SignalId::Abort,
            local_seid,
            &[],
            ops,
        )
    }

    /// Run a content protection exchange on a local endpoint.
    pub fn security_control<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        local_seid: u8,
        data: &[u8],
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let peer_seid = self.bound_peer_seid(local_seid)?;
        self.send_command(
            handle,
            Command::SecurityControl { seid: peer_seid, data },
            SignalId::SecurityControl,
            local_seid,
            &[],
            ops,
        )
    }

    /// Report the playback delay of a local sink endpoint.
    pub fn delay_report<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        local_seid: u8,
        delay: u16,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let peer_seid = self.bound_peer_seid(local_seid)?;
        self.send_command(
            handle,
            Command::DelayReport { seid: peer_seid, delay },
            SignalId::DelayReport,
            local_seid,
            &[],
            ops,
        )
    }

    // ======== Receive path

    /// Process a packet received on the signaling channel. Fragments
    /// accumulate; a completed message is parsed and dispatched to the
    /// channel or stream handlers.
    pub fn on_data<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        data: &[u8],
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let index = handle.0 as usize;
        let message = {
            let ccb = self.ccb_mut(handle)?;
            match ccb.reassembler.add_fragment(data) {
                Some(message) => message,
                None => return Ok(()),
            }
        };

        let header = SignalHeader::from_byte(message[0]);
        match header.message_type {
            MessageType::GeneralReject if message.len() <= 2 => {
                warn!("[avdtp] Dropping message with general-reject message type");
                Ok(())
            }
            MessageType::ResponseReject if message.len() == 2 => {
                // General reject in response-reject form: signal octet
                // only, no error code.
                self.handle_general_reject(index, header.label, message[1] & 0x3f, ops)
            }
            _ => self.dispatch(index, header, &message, ops),
        }
    }

    fn handle_general_reject<OPS: SignalingOps>(
        &mut self,
        index: usize,
        label: u8,
        sig: u8,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let ccb = self.ccbs[index].as_mut().ok_or(Error::InvalidHandle)?;
        let matches = ccb
            .curr_cmd
            .as_ref()
            .is_some_and(|cmd| u8::from(cmd.sig) == sig && cmd.label == label);
        if !matches {
            warn!("[avdtp] General reject without matching command");
            return Ok(());
        }
        let command = ccb.take_current_command(ops).ok_or(Error::InvalidState)?;
        ops.event(AvdtpEvent::CommandRejected {
            sig: command.sig,
            code: ErrorCode::NotSupportedCommand,
            param: 0,
        })?;
        ccb.send_pending(ops)
    }

    fn dispatch<OPS: SignalingOps>(
        &mut self,
        index: usize,
        header: SignalHeader,
        message: &[u8],
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let sig_raw = message[1] & 0x3f;
        let sig = match SignalId::try_from(sig_raw) {
            Ok(sig) => sig,
            Err(_) => {
                warn!("[avdtp] Unknown signal {} msg_type {:?}", sig_raw, header.message_type);
                if header.message_type == MessageType::Command {
                    // General reject: the bare header with the unknown
                    // signal echoed back.
                    let frame = [
                        SignalHeader {
                            label: header.label,
                            packet_type: types::PacketType::Single,
                            message_type: MessageType::GeneralReject,
                        }
                        .to_byte(),
                        sig_raw,
                    ];
                    ops.try_write(&frame)?;
                }
                return Ok(());
            }
        };

        let body = &message[2..];
        match header.message_type {
            MessageType::Command => self.handle_command(index, header.label, sig, body, ops),
            MessageType::ResponseAccept => self.handle_response(index, header.label, sig, body, ops),
            MessageType::ResponseReject => self.handle_reject(index, header.label, sig, body, ops),
            MessageType::GeneralReject => Ok(()),
        }
    }

    fn handle_command<OPS: SignalingOps>(
        &mut self,
        index: usize,
        label: u8,
        sig: SignalId,
        body: &[u8],
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let command = match parse_cmd(sig, body) {
            Ok(command) => command,
            Err(parse_error) => {
                warn!("[avdtp] Parsing failed sig={:?} err={:?}", sig, parse_error.code);
                // Never reject an Abort.
                if sig != SignalId::Abort {
                    self.send_reject(
                        index,
                        label,
                        sig,
                        Reject {
                            param: parse_error.param,
                            code: parse_error.code,
                        },
                        ops,
                    )?;
                }
                return Ok(());
            }
        };

        match command {
            Command::Discover => {
                let mut seps: Vec<SepInfo, AVDTP_MAX_DISCOVER_SEPS> = Vec::new();
                for scb in self.scbs.iter().flatten() {
                    if seps.push(scb.sep_info()).is_err() {
                        break;
                    }
                }
                self.send_response(index, label, SignalId::Discover, &Response::Discover { seps }, ops)
            }
            Command::Single { seid } => self.handle_single_command(index, label, sig, seid, ops),
            Command::SetConfiguration {
                acp_seid,
                int_seid,
                config,
            } => {
                if self.scb_by_seid(acp_seid).is_none() {
                    return self.send_reject(
                        index,
                        label,
                        sig,
                        Reject {
                            param: 0,
                            code: ErrorCode::BadAcpSeid,
                        },
                        ops,
                    );
                }
                let result = {
                    let scb = self.scb_by_seid_mut(acp_seid).ok_or(Error::NotFound)?;
                    scb.configure(index as u8, int_seid, &config)
                };
                match result {
                    Ok(()) => {
                        self.send_response(index, label, sig, &Response::General, ops)?;
                        ops.event(AvdtpEvent::SetConfigInd {
                            seid: acp_seid,
                            int_seid,
                            config,
                        })
                    }
                    Err(code) => self.send_reject(index, label, sig, Reject { param: 0, code }, ops),
                }
            }
            Command::Reconfigure { seid, config } => {
                if self.scb_by_seid(seid).is_none() {
                    return self.send_reject(
                        index,
                        label,
                        sig,
                        Reject {
                            param: 0,
                            code: ErrorCode::BadAcpSeid,
                        },
                        ops,
                    );
                }
                let result = {
                    let scb = self.scb_by_seid_mut(seid).ok_or(Error::NotFound)?;
                    scb.reconfigure(&config)
                };
                match result {
                    Ok(()) => {
                        self.send_response(index, label, sig, &Response::General, ops)?;
                        ops.event(AvdtpEvent::ReconfigInd { seid, config })
                    }
                    Err(code) => self.send_reject(index, label, sig, Reject { param: 0, code }, ops),
                }
            }
            Command::Multi { seids } => self.handle_multi_command(index, label, sig, &seids, ops),
            Command::SecurityControl { seid, data } => {
                if self.scb_by_seid(seid).is_none() {
                    return self.send_reject(
                        index,
                        label,
                        sig,
                        Reject {
                            param: 0,
                            code: ErrorCode::BadAcpSeid,
                        },
                        ops,
                    );
                }
                self.send_response(index, label, sig, &Response::SecurityControl { data }, ops)?;
                ops.event(AvdtpEvent::SecurityControlInd { seid, data })
            }
            Command::DelayReport { seid, delay } => {
                if self.scb_by_seid(seid).is_none() {
                    return self.send_reject(
                        index,
                        label,
                        sig,
                        Reject {
                            param: 0,
                            code: ErrorCode::BadAcpSeid,
                        },
                        ops,
                    );
                }
                self.send_response(index, label, sig, &Response::General, ops)?;
                ops.event(AvdtpEvent::DelayReportInd { seid, delay })
            }
        }
    }

    fn handle_single_command<OPS: SignalingOps>(
        &mut self,
        index: usize,
        label: u8,
        sig: SignalId,
        seid: u8,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        if self.scb_by_seid(seid).is_none() {
            // An Abort addressed at an unknown endpoint is dropped, not
            // rejected.
            if sig == SignalId::Abort {
                return Ok(());
            }
            return self.send_reject(
                index,
                label,
                sig,
                Reject {
                    param: 0,
                    code: ErrorCode::BadAcpSeid,
                },
                ops,
            );
        }

        match sig {
            SignalId::GetCapabilities => {
                let scb = self.scb_by_seid(seid).ok_or(Error::NotFound)?;
                let mut config = scb.capabilities.clone();
                config.psc_mask &= types::PSC_LEGACY_MASK;
                self.send_response(index, label, sig, &Response::ServiceCapabilities { config }, ops)
            }
            SignalId::GetAllCapabilities => {
                let scb = self.scb_by_seid(seid).ok_or(Error::NotFound)?;
                let config = scb.capabilities.clone();
                self.send_response(index, label, sig, &Response::ServiceCapabilities { config }, ops)
            }
            SignalId::GetConfiguration => {
                let scb = self.scb_by_seid(seid).ok_or(Error::NotFound)?;
                match scb.configuration.clone() {
                    Some(config) => {
                        self.send_response(index, label, sig, &Response::ServiceCapabilities { config }, ops)
                    }
                    None => self.send_reject(
                        index,
                        label,
                        sig,
                        Reject {
                            param: 0,
                            code: ErrorCode::BadState,
                        },
                        ops,
                    ),
                }
            }
            SignalId::Open => {
                let scb = self.scb_by_seid_mut(seid).ok_or(Error::NotFound)?;
                match scb.open() {
                    Ok(()) => {
                        self.send_response(index, label, sig, &Response::General, ops)?;
                        ops.event(AvdtpEvent::OpenInd { seid })
                    }
                    Err(code) => self.send_reject(index, label, sig, Reject { param: 0, code }, ops),
                }
            }
            SignalId::Close => {
                let scb = self.scb_by_seid_mut(seid).ok_or(Error::NotFound)?;
                match scb.close() {
                    Ok(()) => {
                        self.send_response(index, label, sig, &Response::General, ops)?;
                        ops.event(AvdtpEvent::CloseInd { seid })
                    }
                    Err(code) => self.send_reject(index, label, sig, Reject { param: 0, code }, ops),
                }
            }
            SignalId::Abort => {
                let scb = self.scb_by_seid_mut(seid).ok_or(Error::NotFound)?;
                scb.release();
                self.send_response(index, label, sig, &Response::General, ops)?;
                ops.event(AvdtpEvent::AbortInd { seid })
            }
            _ => Err(Error::InvalidState),
        }
    }

    fn handle_multi_command<OPS: SignalingOps>(
        &mut self,
        index: usize,
        label: u8,
        sig: SignalId,
        seids: &Vec<u8, AVDTP_MAX_SEPS_PER_CMD>,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        // Validate every endpoint before touching any of them; the
        // reject carries the first offending SEID.
        for &seid in seids {
            let failure = match self.scb_by_seid(seid) {
                None => Some(ErrorCode::BadAcpSeid),
                Some(scb) => {
                    let legal = match sig {
                        SignalId::Start => scb.state == scb::StreamState::Open,
                        _ => scb.state == scb::StreamState::Streaming,
                    };
                    if legal {
                        None
                    } else {
                        Some(ErrorCode::BadState)
                    }
                }
            };
            if let Some(code) = failure {
                return self.send_reject(index, label, sig, Reject { param: seid, code }, ops);
            }
        }

        for &seid in seids {
            let scb = self.scb_by_seid_mut(seid).ok_or(Error::NotFound)?;
            let result = match sig {
                SignalId::Start => scb.start(),
                _ => scb.suspend(),
            };
            if result.is_err() {
                return Err(Error::InvalidState);
            }
        }

        self.send_response(index, label, sig, &Response::General, ops)?;
        let event = if sig == SignalId::Start {
            AvdtpEvent::StartInd { seids: seids.clone() }
        } else {
            AvdtpEvent::SuspendInd { seids: seids.clone() }
        };
        ops.event(event)
    }

    fn handle_response<OPS: SignalingOps>(
        &mut self,
        index: usize,
        label: u8,
        sig: SignalId,
        body: &[u8],
        ops: &mut OPS,
    ) -> Result<(), Error> {
        if !self.response_matches(index, label, sig)? {
            warn!("[avdtp] Cmd not found for rsp sig={:?} label={}", sig, label);
            return Ok(());
        }

        let response = match parse_rsp(sig, body) {
            Ok(response) => response,
            Err(parse_error) => {
                warn!("[avdtp] Response parse failed sig={:?} err={:?}", sig, parse_error.code);
                return Ok(());
            }
        };

        let ccb = self.ccbs[index].as_mut().ok_or(Error::InvalidHandle)?;
        let command = ccb.take_current_command(ops).ok_or(Error::InvalidState)?;

        match (&response, command.sig) {
            (Response::Discover { seps }, _) => ops.event(AvdtpEvent::DiscoverCfm { seps: seps.clone() })?,
            (Response::ServiceCapabilities { config }, SignalId::GetConfiguration) => {
                ops.event(AvdtpEvent::GetConfigurationCfm { config: config.clone() })?
            }
            (Response::ServiceCapabilities { config }, _) => {
                ops.event(AvdtpEvent::GetCapabilitiesCfm { config: config.clone() })?
            }
            (Response::SecurityControl { data }, _) => ops.event(AvdtpEvent::SecurityControlCfm { data })?,
            (Response::General, _) => self.apply_confirmed_command(index, &command, ops)?,
        }

        let ccb = self.ccbs[index].as_mut().ok_or(Error::InvalidHandle)?;
        ccb.send_pending(ops)
    }

    /// The peer accepted one of our state-changing commands; apply the
    /// local stream transition and report it.
    fn apply_confirmed_command<OPS: SignalingOps>(
        &mut self,
        index: usize,
        command: &SignalMessage,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        match command.sig {
            SignalId::SetConfiguration => {
                // Recover the parameters from our own request.
                if let Ok(Command::SetConfiguration {
                    acp_seid, config, ..
                }) = parse_cmd(SignalId::SetConfiguration, &command.data)
                {
                    if let Some(scb) = self.scb_by_seid_mut(command.seid) {
                        let _ = scb.configure(index as u8, acp_seid, &config);
                    }
                }
                ops.event(AvdtpEvent::SetConfigCfm { seid: command.seid })
            }
            SignalId::Reconfigure => {
                if let Ok(Command::Reconfigure { config, .. }) = parse_cmd(SignalId::Reconfigure, &command.data) {
                    if let Some(scb) = self.scb_by_seid_mut(command.seid) {
                        let _ = scb.reconfigure(&config);
                    }
                }
                ops.event(AvdtpEvent::ReconfigCfm { seid: command.seid })
            }
            SignalId::Open => {
                if let Some(scb) = self.scb_by_seid_mut(command.seid) {
                    let _ = scb.open();
                }
                ops.event(AvdtpEvent::OpenCfm { seid: command.seid })
            }
            SignalId::Start => {
                for &seid in &command.seids {
                    if let Some(scb) = self.scb_by_seid_mut(seid) {
                        let _ = scb.start();
                    }
                }
                ops.event(AvdtpEvent::StartCfm {
                    seids: command.seids.clone(),
                })
            }
            SignalId::Suspend => {
                for &seid in &command.seids {
                    if let Some(scb) = self.scb_by_seid_mut(seid) {
                        let _ = scb.suspend();
                    }
                }
                ops.event(AvdtpEvent::SuspendCfm {
                    seids: command.seids.clone(),
                })
            }
            SignalId::Close => {
                if let Some(scb) = self.scb_by_seid_mut(command.seid) {
                    let _ = scb.close();
                }
                ops.event(AvdtpEvent::CloseCfm { seid: command.seid })
            }
            SignalId::Abort => {
                if let Some(scb) = self.scb_by_seid_mut(command.seid) {
                    scb.release();
                }
                ops.event(AvdtpEvent::AbortCfm { seid: command.seid })
            }
            SignalId::DelayReport => ops.event(AvdtpEvent::DelayReportCfm),
            SignalId::Discover
            | SignalId::GetCapabilities
            | SignalId::GetAllCapabilities
            | SignalId::GetConfiguration
            | SignalId::SecurityControl => Ok(()),
        }
    }

    fn handle_reject<OPS: SignalingOps>(
        &mut self,
        index: usize,
        label: u8,
        sig: SignalId,
        body: &[u8],
        ops: &mut OPS,
    ) -> Result<(), Error> {
        if !self.response_matches(index, label, sig)? {
            warn!("[avdtp] Cmd not found for rej sig={:?} label={}", sig, label);
            return Ok(());
        }

        let reject = match parse_rej(sig, body) {
            Ok(reject) => reject,
            Err(parse_error) => {
                warn!("[avdtp] Reject parse failed sig={:?} err={:?}", sig, parse_error.code);
                return Ok(());
            }
        };

        let ccb = self.ccbs[index].as_mut().ok_or(Error::InvalidHandle)?;
        let command = ccb.take_current_command(ops).ok_or(Error::InvalidState)?;
        ops.event(AvdtpEvent::CommandRejected {
            sig: command.sig,
            code: reject.code,
            param: reject.param,
        })?;
        ccb.send_pending(ops)
    }

    fn response_matches(&self, index: usize, label: u8, sig: SignalId) -> Result<bool, Error> {
        let ccb = self.ccbs[index].as_ref().ok_or(Error::InvalidHandle)?;
        Ok(ccb
            .curr_cmd
            .as_ref()
            .is_some_and(|cmd| cmd.sig == sig && cmd.label == label))
    }

    // ======== Helpers

    fn ccb_mut(&mut self, handle: ChannelHandle) -> Result<&mut Ccb, Error> {
        self.ccbs
            .get_mut(handle.0 as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(Error::InvalidHandle)
    }

    fn scb_by_seid(&self, seid: u8) -> Option<&Scb> {
        self.scbs.iter().flatten().find(|scb| scb.seid == seid)
    }

    fn scb_by_seid_mut(&mut self, seid: u8) -> Option<&mut Scb> {
        self.scbs.iter_mut().flatten().find(|scb| scb.seid == seid)
    }

    fn bound_peer_seid(&self, local_seid: u8) -> Result<u8, Error> {
        let scb = self.scb_by_seid(local_seid).ok_or(Error::NotFound)?;
        if scb.peer_seid == 0 {
            return Err(Error::InvalidState);
        }
        Ok(scb.peer_seid)
    }

    fn multi_command<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        sig: SignalId,
        local_seids: &[u8],
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let mut peer_seids: Vec<u8, AVDTP_MAX_SEPS_PER_CMD> = Vec::new();
        let mut locals: Vec<u8, AVDTP_MAX_SEPS_PER_CMD> = Vec::new();
        for &seid in local_seids {
            peer_seids
                .push(self.bound_peer_seid(seid)?)
                .map_err(|_| Error::InsufficientSpace)?;
            locals.push(seid).map_err(|_| Error::InsufficientSpace)?;
        }
        self.send_command(handle, Command::Multi { seids: peer_seids }, sig, 0, &locals, ops)
    }

    fn send_command<OPS: SignalingOps>(
        &mut self,
        handle: ChannelHandle,
        command: Command<'_>,
        sig: SignalId,
        local_seid: u8,
        local_seids: &[u8],
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let ccb = self.ccb_mut(handle)?;
        let mut data = Vec::new();
        build_cmd(&command, &mut data)?;
        let label = ccb.next_label();
        let mut message = SignalMessage::new(sig, label, MessageType::Command, data);
        message.seid = local_seid;
        message.seids = Vec::from_slice(local_seids).map_err(|_| Error::InsufficientSpace)?;
        ccb.enqueue_cmd(message)?;
        ccb.send_pending(ops)
    }

    fn send_response<OPS: SignalingOps>(
        &mut self,
        index: usize,
        label: u8,
        sig: SignalId,
        response: &Response<'_>,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let ccb = self.ccbs[index].as_mut().ok_or(Error::InvalidHandle)?;
        let mut data = Vec::new();
        build_rsp(response, &mut data)?;
        let message = SignalMessage::new(sig, label, MessageType::ResponseAccept, data);
        ccb.enqueue_rsp(message)?;
        ccb.send_pending(ops)
    }

    fn send_reject<OPS: SignalingOps>(
        &mut self,
        index: usize,
        label: u8,
        sig: SignalId,
        reject: Reject,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let ccb = self.ccbs[index].as_mut().ok_or(Error::InvalidHandle)?;
        let mut data = Vec::new();
        build_rej(sig, &reject, &mut data)?;
        let message = SignalMessage::new(sig, label, MessageType::ResponseReject, data);
        ccb.enqueue_rsp(message)?;
        ccb.send_pending(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Owned snapshot of the interesting parts of an event.
    #[derive(Debug, Clone, PartialEq)]
    enum OwnedEvent {
        SetConfigInd { seid: u8, config: SepConfig },
        ReconfigInd { seid: u8 },
        OpenInd { seid: u8 },
        StartInd { first_seid: u8 },
        SuspendInd { first_seid: u8 },
        CloseInd { seid: u8 },
        AbortInd { seid: u8 },
        SecurityControlInd { seid: u8, len: usize },
        DelayReportInd { seid: u8, delay: u16 },
        DiscoverCfm { count: usize },
        GetCapabilitiesCfm { config: SepConfig },
        GetConfigurationCfm,
        SetConfigCfm { seid: u8 },
        ReconfigCfm { seid: u8 },
        OpenCfm { seid: u8 },
        StartCfm,
        SuspendCfm,
        CloseCfm { seid: u8 },
        AbortCfm { seid: u8 },
        SecurityControlCfm { len: usize },
        DelayReportCfm,
        CommandRejected { sig: SignalId, code: ErrorCode, param: u8 },
        TransportFailure { sig: SignalId },
        IdleTimeout,
    }

    impl From<&AvdtpEvent<'_>> for OwnedEvent {
        fn from(event: &AvdtpEvent<'_>) -> Self {
            match event {
                AvdtpEvent::SetConfigInd { seid, config, .. } => OwnedEvent::SetConfigInd {
                    seid: *seid,
                    config: config.clone(),
                },
                AvdtpEvent::ReconfigInd { seid, .. } => OwnedEvent::ReconfigInd { seid: *seid },
                AvdtpEvent::OpenInd { seid } => OwnedEvent::OpenInd { seid: *seid },
                AvdtpEvent::StartInd { seids } => OwnedEvent::StartInd { first_seid: seids[0] },
                AvdtpEvent::SuspendInd { seids } => OwnedEvent::SuspendInd { first_seid: seids[0] },
                AvdtpEvent::CloseInd { seid } => OwnedEvent::CloseInd { seid: *seid },
                AvdtpEvent::AbortInd { seid } => OwnedEvent::AbortInd { seid: *seid },
                AvdtpEvent::SecurityControlInd { seid, data } => OwnedEvent::SecurityControlInd {
                    seid: *seid,
                    len: data.len(),
                },
                AvdtpEvent::DelayReportInd { seid, delay } => OwnedEvent::DelayReportInd {
                    seid: *seid,
                    delay: *delay,
                },
                AvdtpEvent::DiscoverCfm { seps } => OwnedEvent::DiscoverCfm { count: seps.len() },
                AvdtpEvent::GetCapabilitiesCfm { config } => OwnedEvent::GetCapabilitiesCfm {
                    config: config.clone(),
                },
                AvdtpEvent::GetConfigurationCfm { .. } => OwnedEvent::GetConfigurationCfm,
                AvdtpEvent::SetConfigCfm { seid } => OwnedEvent::SetConfigCfm { seid: *seid },
                AvdtpEvent::ReconfigCfm { seid } => OwnedEvent::ReconfigCfm { seid: *seid },
                AvdtpEvent::OpenCfm { seid } => OwnedEvent::OpenCfm { seid: *seid },
                AvdtpEvent::StartCfm { .. } => OwnedEvent::StartCfm,
                AvdtpEvent::SuspendCfm { .. } => OwnedEvent::SuspendCfm,
                AvdtpEvent::CloseCfm { seid } => OwnedEvent::CloseCfm { seid: *seid },
                AvdtpEvent::AbortCfm { seid } => OwnedEvent::AbortCfm { seid: *seid },
                AvdtpEvent::SecurityControlCfm { data } => OwnedEvent::SecurityControlCfm { len: data.len() },
                AvdtpEvent::DelayReportCfm => OwnedEvent::DelayReportCfm,
                AvdtpEvent::CommandRejected { sig, code, param } => OwnedEvent::CommandRejected {
                    sig: *sig,
                    code: *code,
                    param: *param,
                },
                AvdtpEvent::TransportFailure { sig } => OwnedEvent::TransportFailure { sig: *sig },
                AvdtpEvent::IdleTimeout => OwnedEvent::IdleTimeout,
            }
        }
    }

    #[derive(Default)]
    struct TestOps {
        written: frames::Frames,
        events: heapless::Vec<OwnedEvent, 32>,
        timers_set: heapless::Vec<TimerKind, 32>,
        timers_canceled: heapless::Vec<TimerKind, 64>,
    }

    mod frames {
        pub type Frame = heapless::Vec<u8, { crate::config::AVDTP_SIG_BUFFER_SIZE + 3 }>;
        pub type Frames = heapless::Vec<Frame, 32>;
    }

    impl SignalingOps for TestOps {
        fn try_write(&mut self, data: &[u8]) -> Result<(), Error> {
            let frame = frames::Frame::from_slice(data).map_err(|_| Error::InsufficientSpace)?;
            self.written.push(frame).map_err(|_| Error::OutOfMemory)
        }

        fn set_timer(&mut self, timer: TimerKind, _duration: Duration) {
            let _ = self.timers_set.push(timer);
        }

        fn cancel_timer(&mut self, timer: TimerKind) {
            let _ = self.timers_canceled.push(timer);
        }

        fn event(&mut self, event: AvdtpEvent<'_>) -> Result<(), Error> {
            self.events.push(OwnedEvent::from(&event)).map_err(|_| Error::OutOfMemory)
        }
    }

    fn sink_capabilities() -> SepConfig {
        let mut capabilities = SepConfig {
            psc_mask: types::PSC_MEDIA_TRANSPORT | types::PSC_DELAY_REPORTING,
            ..Default::default()
        };
        capabilities
            .codec
            .extend_from_slice(&[0x00, 0x00, 0x3f, 0xff, 2, 53])
            .unwrap();
        capabilities
    }

    fn stream_configuration() -> SepConfig {
        let mut config = SepConfig {
            psc_mask: types::PSC_MEDIA_TRANSPORT,
            ..Default::default()
        };
        config.codec.extend_from_slice(&[0x00, 0x00, 0x21, 0x15, 2, 53]).unwrap();
        config
    }

    struct Link {
        initiator: Signaling,
        acceptor: Signaling,
        initiator_handle: ChannelHandle,
        acceptor_handle: ChannelHandle,
        initiator_ops: TestOps,
        acceptor_ops: TestOps,
        initiator_delivered: usize,
        acceptor_delivered: usize,
    }

    impl Link {
        fn new(mtu: u16) -> Self {
            let mut initiator = Signaling::new();
            let mut acceptor = Signaling::new();
            acceptor
                .register_endpoint(1, MediaType::Audio, SepType::Sink, sink_capabilities())
                .unwrap();
            initiator
                .register_endpoint(2, MediaType::Audio, SepType::Source, sink_capabilities())
                .unwrap();
            let initiator_handle = initiator.channel_open(BdAddr::new([1, 2, 3, 4, 5, 6]), mtu).unwrap();
            let acceptor_handle = acceptor.channel_open(BdAddr::new([6, 5, 4, 3, 2, 1]), mtu).unwrap();
            Self {
                initiator,
                acceptor,
                initiator_handle,
                acceptor_handle,
                initiator_ops: TestOps::default(),
                acceptor_ops: TestOps::default(),
                initiator_delivered: 0,
                acceptor_delivered: 0,
            }
        }

        /// Deliver pending frames in both directions until quiet.
        fn pump(&mut self) {
            let mut progress = true;
            while progress {
                progress = false;
                while self.initiator_delivered < self.initiator_ops.written.len() {
                    let frame = self.initiator_ops.written[self.initiator_delivered].clone();
                    self.initiator_delivered += 1;
                    self.acceptor
                        .on_data(self.acceptor_handle, &frame, &mut self.acceptor_ops)
                        .unwrap();
                    progress = true;
                }
                while self.acceptor_delivered < self.acceptor_ops.written.len() {
                    let frame = self.acceptor_ops.written[self.acceptor_delivered].clone();
                    self.acceptor_delivered += 1;
                    self.initiator
                        .on_data(self.initiator_handle, &frame, &mut self.initiator_ops)
                        .unwrap();
                    progress = true;
                }
            }
        }
    }

    #[test]
    fn discover_configure_open_start_flow() {
        let mut link = Link::new(672);

        link.initiator
            .discover(link.initiator_handle, &mut link.initiator_ops)
            .unwrap();
        link.pump();
        assert!(link
            .initiator_ops
            .events
            .contains(&OwnedEvent::DiscoverCfm { count: 1 }));

        link.initiator
            .get_capabilities(link.initiator_handle, 1, false, &mut link.initiator_ops)
            .unwrap();
        link.pump();
        assert!(link
            .initiator_ops
            .events
            .iter()
            .any(|e| matches!(e, OwnedEvent::GetCapabilitiesCfm { .. })));

        let config = stream_configuration();
        link.initiator
            .set_configuration(link.initiator_handle, 1, 2, &config, &mut link.initiator_ops)
            .unwrap();
        link.pump();
        assert!(link.acceptor_ops.events.contains(&OwnedEvent::SetConfigInd {
            seid: 1,
            config: config.clone(),
        }));
        assert!(link.initiator_ops.events.contains(&OwnedEvent::SetConfigCfm { seid: 2 }));

        link.initiator
            .open_stream(link.initiator_handle, 2, &mut link.initiator_ops)
            .unwrap();
        link.pump();
        assert!(link.acceptor_ops.events.contains(&OwnedEvent::OpenInd { seid: 1 }));
        assert!(link.initiator_ops.events.contains(&OwnedEvent::OpenCfm { seid: 2 }));

        link.initiator
            .start_streams(link.initiator_handle, &[2], &mut link.initiator_ops)
            .unwrap();
        link.pump();
        assert!(link.acceptor_ops.events.contains(&OwnedEvent::StartInd { first_seid: 1 }));
        assert!(link.initiator_ops.events.contains(&OwnedEvent::StartCfm));

        link.initiator
            .suspend_streams(link.initiator_handle, &[2], &mut link.initiator_ops)
            .unwrap();
        link.pump();
        assert!(link
            .acceptor_ops
            .events
            .contains(&OwnedEvent::SuspendInd { first_seid: 1 }));

        link.initiator
            .close_stream(link.initiator_handle, 2, &mut link.initiator_ops)
            .unwrap();
        link.pump();
        assert!(link.acceptor_ops.events.contains(&OwnedEvent::CloseInd { seid: 1 }));
        assert!(link.initiator_ops.events.contains(&OwnedEvent::CloseCfm { seid: 2 }));
    }

    #[test]
    fn set_configuration_fragments_and_reassembles() {
        let mut link = Link::new(48);

        let mut config = SepConfig {
            psc_mask: types::PSC_MEDIA_TRANSPORT,
            ..Default::default()
        };
        let mut codec = [0u8; 90];
        for (i, byte) in codec.iter_mut().enumerate() {
            *byte = i as u8;
        }
        config.codec.extend_from_slice(&codec).unwrap();

        link.initiator
            .set_configuration(link.initiator_handle, 1, 2, &config, &mut link.initiator_ops)
            .unwrap();

        // Body is 2 SEID octets + media transport element + codec
        // element: 96 bytes, so START, CONT, END at MTU 48.
        assert_eq!(link.initiator_ops.written.len(), 3);
        assert_eq!(link.initiator_ops.written[0][0] >> 2 & 0x03, types::PacketType::Start as u8);
        assert_eq!(link.initiator_ops.written[1][0] >> 2 & 0x03, types::PacketType::Continue as u8);
        assert_eq!(link.initiator_ops.written[2][0] >> 2 & 0x03, types::PacketType::End as u8);
        assert!(link.initiator_ops.written.iter().all(|frame| frame.len() <= 48));

        link.pump();

        // Exactly one indication carrying the identical configuration.
        let indications: heapless::Vec<&OwnedEvent, 4> = link
            .acceptor_ops
            .events
            .iter()
            .filter(|e| matches!(e, OwnedEvent::SetConfigInd { .. }))
            .collect();
        assert_eq!(indications.len(), 1);
        assert_eq!(
            indications[0],
            &OwnedEvent::SetConfigInd { seid: 1, config }
        );
    }

    #[test]
    fn oversized_reassembly_produces_no_event() {
        let mut link = Link::new(672);
        let header = |packet_type: types::PacketType| {
            signal::SignalHeader {
                label: 2,
                packet_type,
                message_type: MessageType::Command,
            }
            .to_byte()
        };

        // START claiming a big message, then continues that overflow
        // the reassembly buffer.
        let mut start: frames::Frame = frames::Frame::new();
        start.push(header(types::PacketType::Start)).unwrap();
        start.push(9).unwrap();
        start.push(SignalId::SetConfiguration as u8).unwrap();
        start.resize(400, 0xaa).unwrap();
        link.acceptor
            .on_data(link.acceptor_handle, &start, &mut link.acceptor_ops)
            .unwrap();

        let mut cont: frames::Frame = frames::Frame::new();
        cont.push(header(types::PacketType::Continue)).unwrap();
        cont.resize(200, 0xbb).unwrap();
        link.acceptor
            .on_data(link.acceptor_handle, &cont, &mut link.acceptor_ops)
            .unwrap();

        let mut end: frames::Frame = frames::Frame::new();
        end.push(header(types::PacketType::End)).unwrap();
        end.resize(10, 0xcc).unwrap();
        link.acceptor
            .on_data(link.acceptor_handle, &end, &mut link.acceptor_ops)
            .unwrap();

        assert!(link.acceptor_ops.events.is_empty());
        assert!(link.acceptor_ops.written.is_empty());
    }

    #[test]
    fn response_with_wrong_label_dropped() {
        let mut link = Link::new(672);

        link.initiator
            .discover(link.initiator_handle, &mut link.initiator_ops)
            .unwrap();
        assert_eq!(link.initiator_ops.written.len(), 1);
        let label = link.initiator_ops.written[0][0] >> 4;

        // Queue a second command; it must wait for the response.
        link.initiator
            .get_capabilities(link.initiator_handle, 1, false, &mut link.initiator_ops)
            .unwrap();
        assert_eq!(link.initiator_ops.written.len(), 1);

        // Discover response with a mismatching label is dropped.
        let bad = [
            signal::SignalHeader {
                label: (label + 1) % 16,
                packet_type: types::PacketType::Single,
                message_type: MessageType::ResponseAccept,
            }
            .to_byte(),
            SignalId::Discover as u8,
            (1 << 2) | 0,
            0x00,
        ];
        link.initiator
            .on_data(link.initiator_handle, &bad, &mut link.initiator_ops)
            .unwrap();
        assert!(link.initiator_ops.events.is_empty());
        assert_eq!(link.initiator_ops.written.len(), 1);

        // The matching label completes the command and releases the
        // queued one.
        let good = [
            signal::SignalHeader {
                label,
                packet_type: types::PacketType::Single,
                message_type: MessageType::ResponseAccept,
            }
            .to_byte(),
            SignalId::Discover as u8,
            (1 << 2) | 0,
            0x00,
        ];
        link.initiator
            .on_data(link.initiator_handle, &good, &mut link.initiator_ops)
            .unwrap();
        assert!(link
            .initiator_ops
            .events
            .contains(&OwnedEvent::DiscoverCfm { count: 1 }));
        assert_eq!(link.initiator_ops.written.len(), 2);
    }

    #[test]
    fn unknown_signal_in_command_general_rejected() {
        let mut link = Link::new(672);

        let command = [
            signal::SignalHeader {
                label: 3,
                packet_type: types::PacketType::Single,
                message_type: MessageType::Command,
            }
            .to_byte(),
            0x3f,
        ];
        link.acceptor
            .on_data(link.acceptor_handle, &command, &mut link.acceptor_ops)
            .unwrap();
        assert_eq!(link.acceptor_ops.written.len(), 1);
        let reply = &link.acceptor_ops.written[0];
        let header = signal::SignalHeader::from_byte(reply[0]);
        assert_eq!(header.message_type, MessageType::GeneralReject);
        assert_eq!(header.label, 3);
        assert_eq!(reply[1], 0x3f);

        // The same signal as a response is dropped silently.
        let response = [
            signal::SignalHeader {
                label: 3,
                packet_type: types::PacketType::Single,
                message_type: MessageType::ResponseAccept,
            }
            .to_byte(),
            0x3f,
        ];
        link.acceptor
            .on_data(link.acceptor_handle, &response, &mut link.acceptor_ops)
            .unwrap();
        assert_eq!(link.acceptor_ops.written.len(), 1);
    }

    #[test]
    fn abort_is_never_rejected() {
        let mut link = Link::new(672);

        // Abort with a malformed (empty) body: no reply at all.
        let malformed = [
            signal::SignalHeader {
                label: 1,
                packet_type: types::PacketType::Single,
                message_type: MessageType::Command,
            }
            .to_byte(),
            SignalId::Abort as u8,
        ];
        link.acceptor
            .on_data(link.acceptor_handle, &malformed, &mut link.acceptor_ops)
            .unwrap();
        assert!(link.acceptor_ops.written.is_empty());

        // Abort addressed at an unknown endpoint: also no reply.
        let unknown = [
            signal::SignalHeader {
                label: 2,
                packet_type: types::PacketType::Single,
                message_type: MessageType::Command,
            }
            .to_byte(),
            SignalId::Abort as u8,
            40 << 2,
        ];
        link.acceptor
            .on_data(link.acceptor_handle, &unknown, &mut link.acceptor_ops)
            .unwrap();
        assert!(link.acceptor_ops.written.is_empty());

        // A Close with a malformed body is rejected, for contrast.
        let close = [
            signal::SignalHeader {
                label: 3,
                packet_type: types::PacketType::Single,
                message_type: MessageType::Command,
            }
            .to_byte(),
            SignalId::Close as u8,
        ];
        link.acceptor
            .on_data(link.acceptor_handle, &close, &mut link.acceptor_ops)
            .unwrap();
        assert_eq!(link.acceptor_ops.written.len(), 1);
        let header = signal::SignalHeader::from_byte(link.acceptor_ops.written[0][0]);
        assert_eq!(header.message_type, MessageType::ResponseReject);
    }

    #[test]
    fn set_configuration_without_codec_rejected_on_wire() {
        let mut link = Link::new(672);

        // acp seid 1, int seid 2, a single media transport element and
        // no codec.
        let command = [
            signal::SignalHeader {
                label: 4,
                packet_type: types::PacketType::Single,
                message_type: MessageType::Command,
            }
            .to_byte(),
            SignalId::SetConfiguration as u8,
            1 << 2,
            2 << 2,
            types::category::MEDIA_TRANSPORT,
            0,
        ];
        link.acceptor
            .on_data(link.acceptor_handle, &command, &mut link.acceptor_ops)
            .unwrap();
        assert_eq!(link.acceptor_ops.written.len(), 1);
        let reply = &link.acceptor_ops.written[0];
        let header = signal::SignalHeader::from_byte(reply[0]);
        assert_eq!(header.message_type, MessageType::ResponseReject);
        // Category octet then InvalidCapabilities.
        assert_eq!(reply[3], ErrorCode::InvalidCapabilities.to_u8());
    }

    #[test]
    fn retransmission_exhaustion_reports_transport_failure() {
        let mut link = Link::new(672);
        let config = stream_configuration();

        link.initiator
            .set_configuration(link.initiator_handle, 1, 2, &config, &mut link.initiator_ops)
            .unwrap();
        assert_eq!(link.initiator_ops.written.len(), 1);
        assert!(link.initiator_ops.timers_set.contains(&TimerKind::Retransmit));

        // First expiry retransmits.
        link.initiator
            .on_timer_expired(link.initiator_handle, TimerKind::Retransmit, &mut link.initiator_ops)
            .unwrap();
        assert_eq!(link.initiator_ops.written.len(), 2);

        // Second expiry exhausts the budget.
        link.initiator
            .on_timer_expired(link.initiator_handle, TimerKind::Retransmit, &mut link.initiator_ops)
            .unwrap();
        assert!(link.initiator_ops.events.contains(&OwnedEvent::TransportFailure {
            sig: SignalId::SetConfiguration
        }));
    }

    #[test]
    fn response_timeout_is_terminal() {
        let mut link = Link::new(672);

        link.initiator
            .discover(link.initiator_handle, &mut link.initiator_ops)
            .unwrap();
        assert!(link.initiator_ops.timers_set.contains(&TimerKind::Response));

        link.initiator
            .on_timer_expired(link.initiator_handle, TimerKind::Response, &mut link.initiator_ops)
            .unwrap();
        assert!(link
            .initiator_ops
            .events
            .contains(&OwnedEvent::TransportFailure { sig: SignalId::Discover }));
    }

    #[test]
    fn security_control_round_trip() {
        let mut link = Link::new(672);
        let config = stream_configuration();

        link.initiator
            .set_configuration(link.initiator_handle, 1, 2, &config, &mut link.initiator_ops)
            .unwrap();
        link.pump();

        link.initiator
            .security_control(link.initiator_handle, 2, &[0xde, 0xad, 0xbe], &mut link.initiator_ops)
            .unwrap();
        link.pump();
        assert!(link
            .acceptor_ops
            .events
            .contains(&OwnedEvent::SecurityControlInd { seid: 1, len: 3 }));
        assert!(link
            .initiator_ops
            .events
            .contains(&OwnedEvent::SecurityControlCfm { len: 3 }));
    }

    #[test]
    fn delay_report_round_trip() {
        let mut link = Link::new(672);
        let config = stream_configuration();

        link.initiator
            .set_configuration(link.initiator_handle, 1, 2, &config, &mut link.initiator_ops)
            .unwrap();
        link.pump();

        link.initiator
            .delay_report(link.initiator_handle, 2, 1234, &mut link.initiator_ops)
            .unwrap();
        // Delay report never arms a timer.
        let timers_before = link.initiator_ops.timers_set.clone();
        link.pump();
        assert!(link
            .acceptor_ops
            .events
            .contains(&OwnedEvent::DelayReportInd { seid: 1, delay: 1234 }));
        assert!(link.initiator_ops.events.contains(&OwnedEvent::DelayReportCfm));
        let _ = timers_before;
    }

    #[test]
    fn congestion_parks_and_resumes_sending() {
        let mut link = Link::new(672);

        link.initiator
            .on_congestion(link.initiator_handle, true, &mut link.initiator_ops)
            .unwrap();
        link.initiator
            .discover(link.initiator_handle, &mut link.initiator_ops)
            .unwrap();
        assert!(link.initiator_ops.written.is_empty());

        link.initiator
            .on_congestion(link.initiator_handle, false, &mut link.initiator_ops)
            .unwrap();
        assert_eq!(link.initiator_ops.written.len(), 1);
        link.pump();
        assert!(link
            .initiator_ops
            .events
            .contains(&OwnedEvent::DiscoverCfm { count: 1 }));
    }
}
