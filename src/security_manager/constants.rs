use embassy_time::Duration;

/// Security manager channel identifier on LE-U.
pub(crate) const L2CAP_CID_LE_U_SECURITY_MANAGER: u16 = 0x0006;

/// Security manager channel identifier on ACL-U (SMP over BR/EDR).
pub(crate) const L2CAP_CID_BR_EDR_SECURITY_MANAGER: u16 = 0x0007;

/// Full-size encryption key, in octets.
pub(crate) const ENCRYPTION_KEY_SIZE_128_BITS: u8 = 16;

/// Deadline used when no pairing is in progress.
pub(crate) const TIMEOUT_DISABLE: Duration = Duration::from_secs(3600 * 24 * 365);

/// Number of passkey entry commitment rounds.
pub(crate) const PASSKEY_ENTRY_ROUNDS: u8 = 20;
