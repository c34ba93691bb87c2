//! Security manager protocol types
//!
//! Wire-level types of [Vol 3] Part H: command opcodes, failure reasons
//! and the pairing feature exchange.

use core::fmt::{Display, Formatter};

use crate::codec::{Decode, Encode, Type};
use crate::security_manager::constants::ENCRYPTION_KEY_SIZE_128_BITS;
use crate::security_manager::crypto::IoCap;
use crate::Error;

/// A six-digit value for passkey entry or numeric comparison.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PassKey(pub(crate) u32);

impl PassKey {
    /// Get the underlying value as an integer.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl Display for PassKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for PassKey {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{=u32:06}", self.0)
    }
}

/// Pairing Failed reason
// ([Vol 3] Part H, Section 3.5.5).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reason {
    /// Pairing success.
    Success,
    /// The user input of passkey failed, for example, the user cancelled the operation.
    PasskeyEntryFailed,
    /// The OOB data is not available.
    OobNotAvailable,
    /// Authentication requirements cannot be met due to IO capabilities of one or both devices.
    AuthenticationRequirements,
    /// The confirm value does not match the calculated compare value.
    ConfirmValueFailed,
    /// Pairing is not supported by the device.
    PairingNotSupported,
    /// The resultant encryption key size is not long enough for the security requirements of this device.
    EncryptionKeySize,
    /// The SMP command received is not supported on this device.
    CommandNotSupported,
    /// Pairing failed due to an unspecified reason.
    UnspecifiedReason,
    /// Too little time has elapsed since the last pairing or security request.
    RepeatedAttempts,
    /// The command length is invalid or a parameter is outside of the specified range.
    InvalidParameters,
    /// The received DHKey Check value doesn't match the one calculated locally.
    DHKeyCheckFailed,
    /// The confirm values in the numeric comparison protocol do not match.
    NumericComparisonFailed,
    /// Pairing over LE failed due to a Pairing Request sent over BR/EDR in progress.
    BrEdrPairingInProgress,
    /// A key generated on one transport cannot be used to derive a key for the other transport.
    GenerationNotAllowed,
    /// The device chose not to accept a distributed key.
    KeyRejected,
    /// The device is not ready to perform a pairing procedure.
    Busy,
}

impl TryFrom<u8> for Reason {
    type Error = Error;
    fn try_from(val: u8) -> Result<Self, Error> {
        Ok(match val {
            // Do not convert 0 to Success
            0x01 => Self::PasskeyEntryFailed,
            0x02 => Self::OobNotAvailable,
            0x03 => Self::AuthenticationRequirements,
            0x04 => Self::ConfirmValueFailed,
            0x05 => Self::PairingNotSupported,
            0x06 => Self::EncryptionKeySize,
            0x07 => Self::CommandNotSupported,
            0x08 => Self::UnspecifiedReason,
            0x09 => Self::RepeatedAttempts,
            0x0a => Self::InvalidParameters,
            0x0b => Self::DHKeyCheckFailed,
            0x0c => Self::NumericComparisonFailed,
            0x0d => Self::BrEdrPairingInProgress,
            0x0e => Self::GenerationNotAllowed,
            0x0f => Self::KeyRejected,
            0x10 => Self::Busy,
            _ => return Err(Error::InvalidValue),
        })
    }
}

impl From<Reason> for u8 {
    fn from(val: Reason) -> u8 {
        match val {
            Reason::Success => 0x00,
            Reason::PasskeyEntryFailed => 0x01,
            Reason::OobNotAvailable => 0x02,
            Reason::AuthenticationRequirements => 0x03,
            Reason::ConfirmValueFailed => 0x04,
            Reason::PairingNotSupported => 0x05,
            Reason::EncryptionKeySize => 0x06,
            Reason::CommandNotSupported => 0x07,
            Reason::UnspecifiedReason => 0x08,
            Reason::RepeatedAttempts => 0x09,
            Reason::InvalidParameters => 0x0a,
            Reason::DHKeyCheckFailed => 0x0b,
            Reason::NumericComparisonFailed => 0x0c,
            Reason::BrEdrPairingInProgress => 0x0d,
            Reason::GenerationNotAllowed => 0x0e,
            Reason::KeyRejected => 0x0f,
            Reason::Busy => 0x10,
        }
    }
}

impl AsRef<str> for Reason {
    fn as_ref(&self) -> &str {
        match self {
            Reason::Success => "Success",
            Reason::PasskeyEntryFailed => "Passkey entry canceled or failed",
            Reason::OobNotAvailable => "Out-of-band data not available",
            Reason::AuthenticationRequirements => "Authentication requirements not met",
            Reason::ConfirmValueFailed => "Confirm value does not match",
            Reason::PairingNotSupported => "Device does not support pairing",
            Reason::EncryptionKeySize => "Encryption key size is not long enough",
            Reason::CommandNotSupported => "Command not supported",
            Reason::UnspecifiedReason => "Pairing failed due to an unspecified reason",
            Reason::RepeatedAttempts => "Pairing failed due to repeated attempts",
            Reason::InvalidParameters => "Command and/or parameter invalid",
            Reason::DHKeyCheckFailed => "DH key check value does not match",
            Reason::NumericComparisonFailed => "Numeric comparison values do not match",
            Reason::BrEdrPairingInProgress => "Pairing in progress over BR/EDR",
            Reason::GenerationNotAllowed => "Cross-transport key derivation not allowed",
            Reason::KeyRejected => "Device rejected distributed key",
            Reason::Busy => "Device is not ready to perform pairing",
        }
    }
}

impl core::fmt::Display for Reason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Reason {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", self.as_ref())
    }
}

/// Security Manager Protocol command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Pairing Request ([Vol 3] Part H, Section 3.5.1).
    PairingRequest,
    /// Pairing Response ([Vol 3] Part H, Section 3.5.2).
    PairingResponse,
    /// Pairing Confirm ([Vol 3] Part H, Section 3.5.3).
    PairingConfirm,
    /// Pairing Random ([Vol 3] Part H, Section 3.5.4).
    PairingRandom,
    /// Pairing Failed ([Vol 3] Part H, Section 3.5.5).
    PairingFailed,
    /// Encryption Information, Long Term Key ([Vol 3] Part H, Section 3.6.2).
    EncryptionInformation,
    /// Central Identification, EDIV and Rand ([Vol 3] Part H, Section 3.6.3).
    CentralIdentification,
    /// Identity Information, IRK ([Vol 3] Part H, Section 3.6.4).
    IdentityInformation,
    /// Identity Address Information ([Vol 3] Part H, Section 3.6.5).
    IdentityAddressInformation,
    /// Signing Information, CSRK ([Vol 3] Part H, Section 3.6.6).
    SigningInformation,
    /// Security Request ([Vol 3] Part H, Section 3.6.7).
    SecurityRequest,
    /// Pairing Public Key ([Vol 3] Part H, Section 3.5.6).
    PairingPublicKey,
    /// Pairing DHKey Check ([Vol 3] Part H, Section 3.5.7).
    PairingDhKeyCheck,
    /// Keypress Notification ([Vol 3] Part H, Section 3.5.8).
    KeypressNotification,
}

impl Command {
    /// Command payload size excluding the command octet. Lengths are
    /// opcode-determined; any other length is `InvalidParameters`.
    pub const fn payload_size(&self) -> u16 {
        match self {
            Command::PairingRequest => 6,
            Command::PairingResponse => 6,
            Command::PairingConfirm => 16,
            Command::PairingRandom => 16,
            Command::PairingFailed => 1,
            Command::EncryptionInformation => 16,
            Command::CentralIdentification => 10,
            Command::IdentityInformation => 16,
            Command::IdentityAddressInformation => 7,
            Command::SigningInformation => 16,
            Command::SecurityRequest => 1,
            Command::PairingPublicKey => 64,
            Command::PairingDhKeyCheck => 16,
            Command::KeypressNotification => 1,
        }
    }
}

impl From<Command> for u8 {
    fn from(value: Command) -> u8 {
        match value {
            Command::PairingRequest => 0x01,
            Command::PairingResponse => 0x02,
            Command::PairingConfirm => 0x03,
            Command::PairingRandom => 0x04,
            Command::PairingFailed => 0x05,
            Command::EncryptionInformation => 0x06,
            Command::CentralIdentification => 0x07,
            Command::IdentityInformation => 0x08,
            Command::IdentityAddressInformation => 0x09,
            Command::SigningInformation => 0x0a,
            Command::SecurityRequest => 0x0b,
            Command::PairingPublicKey => 0x0c,
            Command::PairingDhKeyCheck => 0x0d,
            Command::KeypressNotification => 0x0e,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Command, Error> {
        let cmd = match value {
            0x01 => Command::PairingRequest,
            0x02 => Command::PairingResponse,
            0x03 => Command::PairingConfirm,
            0x04 => Command::PairingRandom,
            0x05 => Command::PairingFailed,
            0x06 => Command::EncryptionInformation,
            0x07 => Command::CentralIdentification,
            0x08 => Command::IdentityInformation,
            0x09 => Command::IdentityAddressInformation,
            0x0a => Command::SigningInformation,
            0x0b => Command::SecurityRequest,
            0x0c => Command::PairingPublicKey,
            0x0d => Command::PairingDhKeyCheck,
            0x0e => Command::KeypressNotification,
            _ => return Err(Error::InvalidValue),
        };
        Ok(cmd)
    }
}

impl AsRef<str> for Command {
    fn as_ref(&self) -> &str {
        match self {
            Command::PairingRequest => "Pairing Request",
            Command::PairingResponse => "Pairing Response",
            Command::PairingConfirm => "Pairing Confirm",
            Command::PairingRandom => "Pairing Random",
            Command::PairingFailed => "Pairing Failed",
            Command::EncryptionInformation => "Encryption Information",
            Command::CentralIdentification => "Central Identification",
            Command::IdentityInformation => "Identity Information",
            Command::IdentityAddressInformation => "Identity Address Information",
            Command::SigningInformation => "Signing Information",
            Command::SecurityRequest => "Security Request",
            Command::PairingPublicKey => "Pairing Public Key",
            Command::PairingDhKeyCheck => "Pairing DH Key Check",
            Command::KeypressNotification => "Keypress Notification",
        }
    }
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Command {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", self.as_ref())
    }
}

/// IO capabilities of the local device
// ([Vol 3] Part H, Section 2.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCapabilities {
    /// Can display a six-digit value.
    DisplayOnly,
    /// Can display a six-digit value and answer yes/no.
    DisplayYesNo,
    /// Can enter a six-digit value.
    KeyboardOnly,
    /// Neither input nor output.
    NoInputNoOutput,
    /// Can both display and enter a six-digit value.
    KeyboardDisplay,
}

impl TryFrom<u8> for IoCapabilities {
    type Error = Error;
    fn try_from(val: u8) -> Result<Self, Error> {
        Ok(match val {
            0x00 => Self::DisplayOnly,
            0x01 => Self::DisplayYesNo,
            0x02 => Self::KeyboardOnly,
            0x03 => Self::NoInputNoOutput,
            0x04 => Self::KeyboardDisplay,
            _ => return Err(Error::InvalidValue),
        })
    }
}

impl From<IoCapabilities> for u8 {
    fn from(val: IoCapabilities) -> u8 {
        match val {
            IoCapabilities::DisplayOnly => 0x00,
            IoCapabilities::DisplayYesNo => 0x01,
            IoCapabilities::KeyboardOnly => 0x02,
            IoCapabilities::NoInputNoOutput => 0x03,
            IoCapabilities::KeyboardDisplay => 0x04,
        }
    }
}

impl AsRef<str> for IoCapabilities {
    fn as_ref(&self) -> &str {
        match self {
            IoCapabilities::DisplayOnly => "DisplayOnly",
            IoCapabilities::DisplayYesNo => "DisplayYesNo",
            IoCapabilities::KeyboardOnly => "KeyboardOnly",
            IoCapabilities::NoInputNoOutput => "NoInputNoOutput",
            IoCapabilities::KeyboardDisplay => "KeyboardDisplay",
        }
    }
}

impl core::fmt::Display for IoCapabilities {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for IoCapabilities {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", self.as_ref())
    }
}

/// Out of band authentication data flag
// ([Vol 3] Part H, Section 2.3.3).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UseOutOfBand {
    /// OOB data not present.
    NotPresent = 0,
    /// OOB data present.
    Present = 1,
}

impl TryFrom<u8> for UseOutOfBand {
    type Error = Error;
    fn try_from(val: u8) -> Result<Self, Error> {
        Ok(match val {
            0x00 => Self::NotPresent,
            0x01 => Self::Present,
            _ => return Err(Error::InvalidValue),
        })
    }
}

impl From<UseOutOfBand> for u8 {
    fn from(val: UseOutOfBand) -> u8 {
        val as u8
    }
}

impl From<UseOutOfBand> for bool {
    fn from(val: UseOutOfBand) -> bool {
        matches!(val, UseOutOfBand::Present)
    }
}

/// Bonding flag of the AuthReq octet
// ([Vol 3] Part H, Section 3.5.1).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BondingFlag {
    /// No bonding.
    NoBonding = 0,
    /// Bonding requested.
    Bonding = 1,
}

/// AuthReq octet
// ([Vol 3] Part H, Section 3.5.1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuthReq(u8);

/// Man in the middle protection requested
const AUTH_REQ_MITM: u8 = 0b0000_0100;
/// LE Secure Connections supported
const AUTH_REQ_SECURE_CONNECTION: u8 = 0b0000_1000;
/// Keypress notifications during passkey entry
const AUTH_REQ_KEY_PRESS: u8 = 0b0001_0000;
/// Support for the h7 function
const AUTH_REQ_CT2: u8 = 0b0010_0000;

impl AuthReq {
    /// AuthReq advertising Secure Connections, MITM protection and CT2.
    pub fn new(bonding: BondingFlag) -> Self {
        AuthReq((bonding as u8) | AUTH_REQ_MITM | AUTH_REQ_SECURE_CONNECTION | AUTH_REQ_CT2)
    }

    /// AuthReq without the Secure Connections bit, for legacy peers.
    pub fn new_legacy(bonding: BondingFlag) -> Self {
        AuthReq(bonding as u8)
    }

    /// Set the MITM bit.
    pub fn with_mitm(self) -> Self {
        AuthReq(self.0 | AUTH_REQ_MITM)
    }

    /// Clear the MITM bit.
    pub fn without_mitm(self) -> Self {
        AuthReq(self.0 & !AUTH_REQ_MITM)
    }

    /// Bonding requested.
    pub fn bond(&self) -> BondingFlag {
        if self.0 & 0b0000_0011 == 0x01 {
            BondingFlag::Bonding
        } else {
            BondingFlag::NoBonding
        }
    }

    /// Man in the middle protection requested.
    pub fn man_in_the_middle(&self) -> bool {
        (self.0 & AUTH_REQ_MITM) == AUTH_REQ_MITM
    }

    /// LE Secure Connections supported.
    pub fn secure_connection(&self) -> bool {
        (self.0 & AUTH_REQ_SECURE_CONNECTION) == AUTH_REQ_SECURE_CONNECTION
    }

    /// Keypress notifications during the passkey entry protocol.
    pub fn key_press_notification(&self) -> bool {
        (self.0 & AUTH_REQ_KEY_PRESS) == AUTH_REQ_KEY_PRESS
    }

    /// Support for the h7 function.
    pub fn ct2(&self) -> bool {
        (self.0 & AUTH_REQ_CT2) == AUTH_REQ_CT2
    }
}

impl From<u8> for AuthReq {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<AuthReq> for u8 {
    fn from(value: AuthReq) -> u8 {
        value.0
    }
}

/// Key distribution flags
// ([Vol 3] Part H, Section 3.6.1).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KeyDistributionFlags(u8);

impl KeyDistributionFlags {
    /// Long Term Key (Encryption Information + Central Identification).
    pub const ENCRYPTION_KEY: u8 = 0b0000_0001;
    /// Identity Resolving Key (Identity Information + Identity Address Information).
    pub const IDENTITY_KEY: u8 = 0b0000_0010;
    /// Connection Signature Resolving Key (Signing Information).
    pub const SIGNING_KEY: u8 = 0b0000_0100;
    /// BR/EDR link key derived from the LTK. In LE Secure Connections
    /// the key itself is never transmitted.
    pub const LINK_KEY: u8 = 0b0000_1000;

    /// No keys.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Whether any key bit is still set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Encryption key flag.
    pub fn encryption_key(&self) -> bool {
        (self.0 & Self::ENCRYPTION_KEY) != 0
    }

    /// Identity key flag.
    pub fn identity_key(&self) -> bool {
        (self.0 & Self::IDENTITY_KEY) != 0
    }

    /// Signing key flag.
    pub fn signing_key(&self) -> bool {
        (self.0 & Self::SIGNING_KEY) != 0
    }

    /// Link key flag.
    pub fn link_key(&self) -> bool {
        (self.0 & Self::LINK_KEY) != 0
    }

    /// Set the given key bits.
    pub fn set(&mut self, bits: u8) {
        self.0 |= bits;
    }

    /// Clear the given key bits.
    pub fn clear(&mut self, bits: u8) {
        self.0 &= !bits;
    }

    /// The lowest key bit still set, in the distribution order
    /// ENC, ID, CSRK, LK.
    pub fn next_key(&self) -> Option<u8> {
        for shift in 0..4 {
            let bit = 1 << shift;
            if self.0 & bit != 0 {
                return Some(bit);
            }
        }
        None
    }

    /// Keep only bits also present in `other`.
    pub fn intersect(&self, other: KeyDistributionFlags) -> Self {
        Self(self.0 & other.0)
    }
}

impl From<u8> for KeyDistributionFlags {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<KeyDistributionFlags> for u8 {
    fn from(value: KeyDistributionFlags) -> u8 {
        value.0
    }
}

/// Pairing features carried by the pairing request and response
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairingFeatures {
    /// IO capabilities octet.
    pub io_capabilities: IoCapabilities,
    /// OOB data flag octet.
    pub use_oob: UseOutOfBand,
    /// AuthReq octet.
    pub security_properties: AuthReq,
    /// Maximum encryption key size, 7..=16.
    pub maximum_encryption_key_size: u8,
    /// Keys the initiator offers to distribute.
    pub initiator_key_distribution: KeyDistributionFlags,
    /// Keys the responder offers to distribute.
    pub responder_key_distribution: KeyDistributionFlags,
}

impl PairingFeatures {
    /// Size of the feature exchange payload.
    pub const fn payload_size() -> usize {
        Command::PairingRequest.payload_size() as usize
    }

    /// Pack into the `IOcap` operand of `f6`.
    pub fn as_io_cap(&self) -> IoCap {
        IoCap::new(
            u8::from(self.security_properties),
            bool::from(self.use_oob),
            u8::from(self.io_capabilities),
        )
    }
}

impl Default for PairingFeatures {
    fn default() -> Self {
        Self {
            io_capabilities: IoCapabilities::NoInputNoOutput,
            use_oob: UseOutOfBand::NotPresent,
            security_properties: AuthReq::new(BondingFlag::NoBonding),
            maximum_encryption_key_size: ENCRYPTION_KEY_SIZE_128_BITS,
            initiator_key_distribution: KeyDistributionFlags::empty(),
            responder_key_distribution: KeyDistributionFlags::empty(),
        }
    }
}

impl Type for PairingFeatures {
    fn size(&self) -> usize {
        Self::payload_size()
    }
}

impl Encode for PairingFeatures {
    fn encode(&self, dest: &mut [u8]) -> Result<(), crate::codec::Error> {
        if dest.len() >= self.size() {
            dest[0] = self.io_capabilities.into();
            dest[1] = self.use_oob.into();
            dest[2] = self.security_properties.into();
            dest[3] = self.maximum_encryption_key_size;
            dest[4] = self.initiator_key_distribution.into();
            dest[5] = self.responder_key_distribution.into();
            Ok(())
        } else {
            Err(crate::codec::Error::InsufficientSpace)
        }
    }
}

impl Decode<'_> for PairingFeatures {
    fn decode(source: &[u8]) -> Result<PairingFeatures, crate::codec::Error> {
        if source.len() >= Self::payload_size() {
            let io_capabilities = IoCapabilities::try_from(source[0]).map_err(|_| crate::codec::Error::InvalidValue)?;
            let use_oob = UseOutOfBand::try_from(source[1]).map_err(|_| crate::codec::Error::InvalidValue)?;
            let security_properties = AuthReq::from(source[2]);
            if source[3] < 7 || source[3] > 16 {
                return Err(crate::codec::Error::InvalidValue);
            }
            Ok(Self {
                io_capabilities,
                use_oob,
                security_properties,
                maximum_encryption_key_size: source[3],
                initiator_key_distribution: KeyDistributionFlags::from(source[4]),
                responder_key_distribution: KeyDistributionFlags::from(source[5]),
            })
        } else {
            Err(crate::codec::Error::InsufficientSpace)
        }
    }
}

/// Security level reached by a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityLevel {
    /// No encryption.
    NoEncryption,
    /// Encrypted with an unauthenticated key (Just Works).
    Encrypted,
    /// Encrypted with an authenticated key (numeric comparison,
    /// passkey entry or OOB).
    EncryptedAuthenticated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_round_trip() {
        for n in 1u8..=0x10 {
            assert_eq!(u8::from(Reason::try_from(n).unwrap()), n);
        }
        for n in 0x11u8..=0xff {
            assert_eq!(Reason::try_from(n), Err(Error::InvalidValue));
        }
    }

    #[test]
    fn command_opcodes_round_trip() {
        for n in 0x01u8..=0x0e {
            assert_eq!(u8::from(Command::try_from(n).unwrap()), n);
        }
        assert_eq!(Command::try_from(0x0f), Err(Error::InvalidValue));
        assert_eq!(Command::try_from(0x00), Err(Error::InvalidValue));
    }

    #[test]
    fn pairing_features_round_trip() {
        let features = PairingFeatures {
            io_capabilities: IoCapabilities::KeyboardDisplay,
            use_oob: UseOutOfBand::NotPresent,
            security_properties: AuthReq::new(BondingFlag::Bonding),
            maximum_encryption_key_size: 16,
            initiator_key_distribution: KeyDistributionFlags::from(
                KeyDistributionFlags::ENCRYPTION_KEY | KeyDistributionFlags::IDENTITY_KEY,
            ),
            responder_key_distribution: KeyDistributionFlags::from(KeyDistributionFlags::SIGNING_KEY),
        };
        let mut buf = [0u8; 6];
        features.encode(&mut buf).unwrap();
        assert_eq!(PairingFeatures::decode(&buf).unwrap(), features);
    }

    #[test]
    fn key_size_range_enforced() {
        assert!(PairingFeatures::decode(&[0x03, 0, 0, 6, 0, 0]).is_err());
        assert!(PairingFeatures::decode(&[0x03, 0, 0, 17, 0, 0]).is_err());
        assert!(PairingFeatures::decode(&[0x03, 0, 0, 7, 0, 0]).is_ok());
    }

    #[test]
    fn key_walk_order() {
        let mut flags = KeyDistributionFlags::from(
            KeyDistributionFlags::LINK_KEY | KeyDistributionFlags::SIGNING_KEY | KeyDistributionFlags::ENCRYPTION_KEY,
        );
        assert_eq!(flags.next_key(), Some(KeyDistributionFlags::ENCRYPTION_KEY));
        flags.clear(KeyDistributionFlags::ENCRYPTION_KEY);
        assert_eq!(flags.next_key(), Some(KeyDistributionFlags::SIGNING_KEY));
        flags.clear(KeyDistributionFlags::SIGNING_KEY);
        assert_eq!(flags.next_key(), Some(KeyDistributionFlags::LINK_KEY));
        flags.clear(KeyDistributionFlags::LINK_KEY);
        assert_eq!(flags.next_key(), None);
        assert!(flags.is_empty());
    }
}
