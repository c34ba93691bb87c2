//! Channel control block
//!
//! Per-peer signaling session state: the outbound command and response
//! queues, the transaction label counter, the single outstanding
//! command, congestion handling and the fragmentation loop that feeds
//! the transport.

use bt_hci::param::BdAddr;
use heapless::{Deque, Vec};

use super::sar::{number_of_signal_packets, Reassembler};
use super::signal::SignalHeader;
use super::types::{MessageType, PacketType, SignalId};
use super::{SignalingOps, TimerKind};
use crate::config::{
    AVDTP_CMD_QUEUE_DEPTH, AVDTP_IDLE_TIMEOUT, AVDTP_MAX_SEPS_PER_CMD, AVDTP_RET_TIMEOUT, AVDTP_RSP_QUEUE_DEPTH,
    AVDTP_RET_MAX, AVDTP_SIG_BUFFER_SIZE, AVDTP_SIG_TIMEOUT,
};
use crate::Error;

/// Smallest usable signaling MTU.
const MIN_SIG_MTU: u16 = 48;

/// A queued signaling message: metadata plus the parameter bytes. The
/// header and signal octets are produced by the fragmentation loop.
#[derive(Debug, Clone)]
pub(crate) struct SignalMessage {
    pub sig: SignalId,
    pub label: u8,
    pub msg_type: MessageType,
    /// Addressed endpoint for SCB-routed commands, zero otherwise.
    pub seid: u8,
    /// Endpoint list of a Start or Suspend command.
    pub seids: Vec<u8, AVDTP_MAX_SEPS_PER_CMD>,
    pub data: Vec<u8, AVDTP_SIG_BUFFER_SIZE>,
    /// Send progress through `data`.
    pub offset: usize,
}

impl SignalMessage {
    pub(crate) fn new(sig: SignalId, label: u8, msg_type: MessageType, data: Vec<u8, AVDTP_SIG_BUFFER_SIZE>) -> Self {
        Self {
            sig,
            label,
            msg_type,
            seid: 0,
            seids: Vec::new(),
            data,
            offset: 0,
        }
    }
}

pub(crate) struct Ccb {
    pub peer: BdAddr,
    pub peer_mtu: u16,
    label: u8,
    pub congested: bool,
    pub reassembler: Reassembler,
    current_tx: Option<SignalMessage>,
    pub curr_cmd: Option<SignalMessage>,
    cmd_q: Deque<SignalMessage, AVDTP_CMD_QUEUE_DEPTH>,
    rsp_q: Deque<SignalMessage, AVDTP_RSP_QUEUE_DEPTH>,
    ret_count: u8,
}

impl Ccb {
    pub(crate) fn new(peer: BdAddr, peer_mtu: u16) -> Self {
        Self {
            peer,
            peer_mtu: peer_mtu.max(MIN_SIG_MTU),
            label: 0,
            congested: false,
            reassembler: Reassembler::new(),
            current_tx: None,
            curr_cmd: None,
            cmd_q: Deque::new(),
            rsp_q: Deque::new(),
            ret_count: 0,
        }
    }

    /// Claim the next transaction label.
    pub(crate) fn next_label(&mut self) -> u8 {
        let label = self.label;
        self.label = (self.label + 1) % 16;
        label
    }

    pub(crate) fn enqueue_cmd(&mut self, message: SignalMessage) -> Result<(), Error> {
        self.cmd_q.push_back(message).map_err(|_| Error::OutOfMemory)
    }

    pub(crate) fn enqueue_rsp(&mut self, message: SignalMessage) -> Result<(), Error> {
        self.rsp_q.push_back(message).map_err(|_| Error::OutOfMemory)
    }

    /// The matching response arrived: stop every timer, forget the
    /// outstanding command and return it for routing.
    pub(crate) fn take_current_command<OPS: SignalingOps>(&mut self, ops: &mut OPS) -> Option<SignalMessage> {
        ops.cancel_timer(TimerKind::Idle);
        ops.cancel_timer(TimerKind::Retransmit);
        ops.cancel_timer(TimerKind::Response);
        self.ret_count = 0;
        self.curr_cmd.take()
    }

    /// Retransmit timer fired. Returns `true` when the retransmission
    /// budget is exhausted and the command must be failed upward.
    pub(crate) fn handle_retransmit_timeout<OPS: SignalingOps>(&mut self, ops: &mut OPS) -> Result<bool, Error> {
        self.ret_count += 1;
        if self.ret_count > AVDTP_RET_MAX {
            self.ret_count = 0;
            ops.cancel_timer(TimerKind::Retransmit);
            ops.cancel_timer(TimerKind::Response);
            return Ok(true);
        }
        if let Some(mut command) = self.curr_cmd.take() {
            debug!("[avdtp] Retransmitting {:?} attempt {}", command.sig, self.ret_count);
            command.offset = 0;
            self.current_tx = Some(command);
            self.send_pending(ops)?;
        }
        Ok(false)
    }

    /// Drop all outbound state (disconnect or failure).
    pub(crate) fn flush<OPS: SignalingOps>(&mut self, ops: &mut OPS) {
        ops.cancel_timer(TimerKind::Idle);
        ops.cancel_timer(TimerKind::Retransmit);
        ops.cancel_timer(TimerKind::Response);
        self.current_tx = None;
        self.curr_cmd = None;
        self.cmd_q.clear();
        self.rsp_q.clear();
        self.reassembler.reset();
        self.ret_count = 0;
        self.congested = false;
    }

    /// Fragmentation loop: while the channel is not congested and
    /// messages are pending, emit SINGLE or START/CONT/END packets.
    pub(crate) fn send_pending<OPS: SignalingOps>(&mut self, ops: &mut OPS) -> Result<(), Error> {
        loop {
            if self.congested {
                return Ok(());
            }
            if self.current_tx.is_none() {
                if let Some(response) = self.rsp_q.pop_front() {
                    self.current_tx = Some(response);
                } else if self.curr_cmd.is_none() {
                    // Only one command may be outstanding.
                    match self.cmd_q.pop_front() {
                        Some(command) => self.current_tx = Some(command),
                        None => {
                            ops.set_timer(TimerKind::Idle, AVDTP_IDLE_TIMEOUT);
                            return Ok(());
                        }
                    }
                } else {
                    return Ok(());
                }
            }

            let mtu = self.peer_mtu as usize;
            let finished = {
                let message = self.current_tx.as_mut().ok_or(Error::InvalidState)?;
                let mut frame: Vec<u8, { AVDTP_SIG_BUFFER_SIZE + 3 }> = Vec::new();
                let finished;
                if message.offset == 0 && message.data.len() + PacketType::Single.min_len() <= mtu {
                    let header = SignalHeader {
                        label: message.label,
                        packet_type: PacketType::Single,
                        message_type: message.msg_type,
                    };
                    frame.push(header.to_byte()).map_err(|_| Error::InsufficientSpace)?;
                    frame.push(u8::from(message.sig)).map_err(|_| Error::InsufficientSpace)?;
                    frame
                        .extend_from_slice(&message.data)
                        .map_err(|_| Error::InsufficientSpace)?;
                    message.offset = message.data.len();
                    finished = true;
                } else if message.offset == 0 {
                    let header = SignalHeader {
                        label: message.label,
                        packet_type: PacketType::Start,
                        message_type: message.msg_type,
                    };
                    let nosp = number_of_signal_packets(message.data.len(), mtu);
                    let chunk = mtu - PacketType::Start.min_len();
                    frame.push(header.to_byte()).map_err(|_| Error::InsufficientSpace)?;
                    frame.push(nosp).map_err(|_| Error::InsufficientSpace)?;
                    frame.push(u8::from(message.sig)).map_err(|_| Error::InsufficientSpace)?;
                    frame
                        .extend_from_slice(&message.data[..chunk])
                        .map_err(|_| Error::InsufficientSpace)?;
                    message.offset = chunk;
                    finished = false;
                } else {
                    let remaining = message.data.len() - message.offset;
                    let last = remaining <= mtu - PacketType::End.min_len();
                    let header = SignalHeader {
                        label: message.label,
                        packet_type: if last { PacketType::End } else { PacketType::Continue },
                        message_type: message.msg_type,
                    };
                    let chunk = if last { remaining } else { mtu - 1 };
                    frame.push(header.to_byte()).map_err(|_| Error::InsufficientSpace)?;
                    frame
                        .extend_from_slice(&message.data[message.offset..message.offset + chunk])
                        .map_err(|_| Error::InsufficientSpace)?;
                    message.offset += chunk;
                    finished = last;
                }
                ops.try_write(&frame)?;
                finished
            };

            if finished {
                let message = self.current_tx.take().ok_or(Error::InvalidState)?;
                if message.msg_type == MessageType::Command {
                    self.start_command_timer(&message, ops);
                    self.curr_cmd = Some(message);
                }
            }
        }
    }

    /// Arm the response or retransmit timer once a command has been
    /// fully handed to the transport. Discover, Get Capabilities and
    /// Security Control never use the retransmit timer; Delay Report
    /// uses no timer at all.
    fn start_command_timer<OPS: SignalingOps>(&self, message: &SignalMessage, ops: &mut OPS) {
        let no_retransmit = matches!(
            message.sig,
            SignalId::Discover | SignalId::GetCapabilities | SignalId::SecurityControl
        ) || AVDTP_RET_TIMEOUT.as_ticks() == 0;

        if no_retransmit {
            ops.cancel_timer(TimerKind::Idle);
            ops.cancel_timer(TimerKind::Retransmit);
            ops.set_timer(TimerKind::Response, AVDTP_SIG_TIMEOUT);
        } else if message.sig != SignalId::DelayReport {
            ops.cancel_timer(TimerKind::Idle);
            ops.cancel_timer(TimerKind::Response);
            ops.set_timer(TimerKind::Retransmit, AVDTP_RET_TIMEOUT);
        }
    }
}
