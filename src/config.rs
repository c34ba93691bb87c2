//! Compile-time configuration.
//!
//! Capacities and protocol timing used by the signaling and security
//! engines. They are plain constants so the whole crate stays
//! allocation-free; adjust them by patching the crate or wrapping the
//! engines with your own limits.

use embassy_time::Duration;

// ======== AVDTP parameters

/// Number of signaling channels (one per peer device).
pub const AVDTP_MAX_CHANNELS: usize = 2;

/// Number of local stream endpoints.
pub const AVDTP_MAX_ENDPOINTS: usize = 4;

/// Largest reassembled signaling message, in bytes.
///
/// This bounds the reassembly buffer of each channel and therefore the
/// largest Set Configuration or Get Capabilities response that can be
/// exchanged.
pub const AVDTP_SIG_BUFFER_SIZE: usize = 512;

/// Depth of the per-channel outbound command queue.
pub const AVDTP_CMD_QUEUE_DEPTH: usize = 4;

/// Depth of the per-channel outbound response/reject queue.
pub const AVDTP_RSP_QUEUE_DEPTH: usize = 4;

/// Maximum SEIDs carried by one Start or Suspend command.
pub const AVDTP_MAX_SEPS_PER_CMD: usize = 8;

/// Maximum stream endpoint entries parsed from a Discover response.
pub const AVDTP_MAX_DISCOVER_SEPS: usize = 8;

/// Codec information element capacity (length octet included).
pub const AVDTP_CODEC_SIZE: usize = 96;

/// Content protection information element capacity (length octet included).
pub const AVDTP_PROTECT_SIZE: usize = 96;

/// Signaling response timeout (TGAVDP100). Expiry is terminal for the
/// outstanding command.
pub const AVDTP_SIG_TIMEOUT: Duration = Duration::from_secs(2);

/// Retransmission interval for commands that use the retransmit timer.
/// `Duration::from_ticks(0)` disables retransmission entirely, in which
/// case every command falls back to the response timer.
pub const AVDTP_RET_TIMEOUT: Duration = Duration::from_secs(4);

/// Retransmissions attempted before the command is reported as a
/// transport failure.
pub const AVDTP_RET_MAX: u8 = 1;

/// Idle timeout after which a quiet signaling channel is reported to the
/// owner so it may release the channel.
pub const AVDTP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

// ======== Security manager parameters

/// SMP transaction timeout ([Vol 3] Part H, Section 3.4).
pub const SMP_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between the last distributed key and the pairing-complete
/// report. Gives a peer that rejects the final key time to deliver its
/// Pairing Failed before the outcome is declared. The interval is not
/// mandated by the specification.
pub const SMP_DELAYED_AUTH_TIMEOUT: Duration = Duration::from_millis(500);

/// Number of bonds kept by the security manager.
pub const SMP_BOND_COUNT: usize = 4;
