use crate::security_manager::crypto::{Check, Confirm, IdentityResolvingKey, LongTermKey, Nonce, PublicKey, SigningKey};
use crate::security_manager::types::{Command, PairingFeatures, SecurityLevel, UseOutOfBand};
use crate::security_manager::{Reason, TxPacket};
use crate::{Address, Error, IoCapabilities, PacketPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PassKeyEntryAction {
    Display,
    Input,
}

/// The association model selected from both sides' pairing features
/// ([Vol 3] Part H, Section 2.3.5.1). Whether the model runs its Secure
/// Connections or legacy variant is decided separately from the SC bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PairingMethod {
    JustWorks,
    NumericComparison,
    PassKeyEntry {
        initiator: PassKeyEntryAction,
        responder: PassKeyEntryAction,
    },
    OutOfBand,
}

impl PairingMethod {
    pub fn security_level(&self) -> SecurityLevel {
        match self {
            PairingMethod::JustWorks => SecurityLevel::Encrypted,
            _ => SecurityLevel::EncryptedAuthenticated,
        }
    }
}

/// Secure Connections is used when both sides set the SC bit.
pub fn secure_connections_in_use(initiator: &PairingFeatures, responder: &PairingFeatures) -> bool {
    initiator.security_properties.secure_connection() && responder.security_properties.secure_connection()
}

/// Whether CT2 (the h7 function) may be used for cross-transport
/// derivation; requires both sides to advertise it.
pub fn ct2_in_use(initiator: &PairingFeatures, responder: &PairingFeatures) -> bool {
    initiator.security_properties.ct2() && responder.security_properties.ct2()
}

/// Gate for Secure Connections Only mode: fail before phase 2 when the
/// negotiated pairing is either not SC at all or would land on
/// unauthenticated SC Just Works.
pub fn check_secure_connections_policy(
    sc_only: bool,
    sc_in_use: bool,
    method: PairingMethod,
) -> Result<(), Error> {
    if sc_only && (!sc_in_use || method == PairingMethod::JustWorks) {
        warn!("[smp] Secure Connections Only policy rejects the negotiated pairing");
        return Err(Error::Security(Reason::AuthenticationRequirements));
    }
    Ok(())
}

/// Association model matrix for Secure Connections
/// ([Vol 3] Part H, Section 2.3.5.1, Table 2.8).
pub fn choose_pairing_method(initiator: PairingFeatures, responder: PairingFeatures) -> PairingMethod {
    if !initiator.security_properties.man_in_the_middle() && !responder.security_properties.man_in_the_middle() {
        PairingMethod::JustWorks
    } else if matches!(initiator.use_oob, UseOutOfBand::Present) || matches!(responder.use_oob, UseOutOfBand::Present)
    {
        PairingMethod::OutOfBand
    } else {
        io_capability_matrix(initiator.io_capabilities, responder.io_capabilities, true)
    }
}

/// Association model matrix for legacy pairing. Numeric comparison does
/// not exist there; a DisplayYesNo peer behaves as DisplayOnly, and OOB
/// needs the data present on both sides.
pub fn choose_legacy_pairing_method(initiator: PairingFeatures, responder: PairingFeatures) -> PairingMethod {
    if matches!(initiator.use_oob, UseOutOfBand::Present) && matches!(responder.use_oob, UseOutOfBand::Present) {
        PairingMethod::OutOfBand
    } else if !initiator.security_properties.man_in_the_middle() && !responder.security_properties.man_in_the_middle()
    {
        PairingMethod::JustWorks
    } else {
        io_capability_matrix(initiator.io_capabilities, responder.io_capabilities, false)
    }
}

fn io_capability_matrix(initiator: IoCapabilities, responder: IoCapabilities, secure_connections: bool) -> PairingMethod {
    use IoCapabilities::*;
    match responder {
        DisplayOnly => match initiator {
            KeyboardOnly | KeyboardDisplay => PairingMethod::PassKeyEntry {
                initiator: PassKeyEntryAction::Input,
                responder: PassKeyEntryAction::Display,
            },
            _ => PairingMethod::JustWorks,
        },
        DisplayYesNo => match initiator {
            DisplayYesNo | KeyboardDisplay if secure_connections => PairingMethod::NumericComparison,
            KeyboardOnly | KeyboardDisplay => PairingMethod::PassKeyEntry {
                initiator: PassKeyEntryAction::Input,
                responder: PassKeyEntryAction::Display,
            },
            _ => PairingMethod::JustWorks,
        },
        KeyboardOnly => match initiator {
            NoInputNoOutput => PairingMethod::JustWorks,
            KeyboardOnly => PairingMethod::PassKeyEntry {
                initiator: PassKeyEntryAction::Input,
                responder: PassKeyEntryAction::Input,
            },
            _ => PairingMethod::PassKeyEntry {
                initiator: PassKeyEntryAction::Display,
                responder: PassKeyEntryAction::Input,
            },
        },
        NoInputNoOutput => PairingMethod::JustWorks,
        KeyboardDisplay => match initiator {
            DisplayOnly => PairingMethod::PassKeyEntry {
                initiator: PassKeyEntryAction::Display,
                responder: PassKeyEntryAction::Input,
            },
            DisplayYesNo | KeyboardDisplay if secure_connections => PairingMethod::NumericComparison,
            KeyboardOnly | KeyboardDisplay => PairingMethod::PassKeyEntry {
                initiator: PassKeyEntryAction::Input,
                responder: PassKeyEntryAction::Display,
            },
            NoInputNoOutput => PairingMethod::JustWorks,
            DisplayYesNo => PairingMethod::PassKeyEntry {
                initiator: PassKeyEntryAction::Display,
                responder: PassKeyEntryAction::Input,
            },
        },
    }
}

pub fn prepare_packet<P: PacketPool>(command: Command) -> Result<TxPacket<P>, Error> {
    let packet = P::allocate().ok_or(Error::OutOfMemory)?;
    TxPacket::new(packet, command)
}

pub fn make_pairing_random<P: PacketPool>(nonce: &Nonce) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet::<P>(Command::PairingRandom)?;
    packet.payload_mut().copy_from_slice(&nonce.0.to_le_bytes());
    Ok(packet)
}

pub fn make_confirm_packet<P: PacketPool>(confirm: &Confirm) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet::<P>(Command::PairingConfirm)?;
    packet.payload_mut().copy_from_slice(&confirm.0.to_le_bytes());
    Ok(packet)
}

pub fn make_public_key_packet<P: PacketPool>(public_key: &PublicKey) -> Result<TxPacket<P>, Error> {
    let mut x = public_key.x;
    let mut y = public_key.y;
    x.reverse();
    y.reverse();

    let mut packet = prepare_packet(Command::PairingPublicKey)?;
    let payload = packet.payload_mut();
    payload[..32].copy_from_slice(&x);
    payload[32..64].copy_from_slice(&y);
    Ok(packet)
}

pub fn make_dhkey_check_packet<P: PacketPool>(check: &Check) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet(Command::PairingDhKeyCheck)?;
    packet.payload_mut().copy_from_slice(&check.0.to_le_bytes());
    Ok(packet)
}

pub fn make_encryption_information_packet<P: PacketPool>(ltk: &LongTermKey) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet(Command::EncryptionInformation)?;
    packet.payload_mut().copy_from_slice(&ltk.to_le_bytes());
    Ok(packet)
}

pub fn make_central_identification_packet<P: PacketPool>(ediv: u16, rand: &[u8; 8]) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet(Command::CentralIdentification)?;
    let payload = packet.payload_mut();
    payload[..2].copy_from_slice(&ediv.to_le_bytes());
    payload[2..10].copy_from_slice(rand);
    Ok(packet)
}

pub fn make_identity_information_packet<P: PacketPool>(irk: &IdentityResolvingKey) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet(Command::IdentityInformation)?;
    packet.payload_mut().copy_from_slice(&irk.to_le_bytes());
    Ok(packet)
}

pub fn make_identity_address_information_packet<P: PacketPool>(address: &Address) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet(Command::IdentityAddressInformation)?;
    let payload = packet.payload_mut();
    payload[0] = address.kind.into_inner();
    payload[1..7].copy_from_slice(&address.addr.into_inner());
    Ok(packet)
}

pub fn make_signing_information_packet<P: PacketPool>(csrk: &SigningKey) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet(Command::SigningInformation)?;
    packet.payload_mut().copy_from_slice(&csrk.to_le_bytes());
    Ok(packet)
}

#[derive(Debug, Clone)]
pub struct CommandAndPayload<'a> {
    pub command: Command,
    pub payload: &'a [u8],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security_manager::types::{AuthReq, BondingFlag, KeyDistributionFlags};

    fn features(io: IoCapabilities, oob: UseOutOfBand, auth: AuthReq) -> PairingFeatures {
        PairingFeatures {
            io_capabilities: io,
            use_oob: oob,
            security_properties: auth,
            maximum_encryption_key_size: 16,
            initiator_key_distribution: KeyDistributionFlags::empty(),
            responder_key_distribution: KeyDistributionFlags::empty(),
        }
    }

    #[test]
    fn no_mitm_is_just_works() {
        for i in 0u8..5 {
            for r in 0u8..5 {
                let initiator = features(
                    i.try_into().unwrap(),
                    UseOutOfBand::NotPresent,
                    AuthReq::new(BondingFlag::NoBonding).without_mitm(),
                );
                let responder = features(
                    r.try_into().unwrap(),
                    UseOutOfBand::NotPresent,
                    AuthReq::new(BondingFlag::NoBonding).without_mitm(),
                );
                assert_eq!(choose_pairing_method(initiator, responder), PairingMethod::JustWorks);
            }
        }
    }

    #[test]
    fn oob_wins_over_io_capabilities() {
        let with_oob = features(
            IoCapabilities::KeyboardDisplay,
            UseOutOfBand::Present,
            AuthReq::new(BondingFlag::NoBonding),
        );
        let without = features(
            IoCapabilities::KeyboardDisplay,
            UseOutOfBand::NotPresent,
            AuthReq::new(BondingFlag::NoBonding),
        );
        assert_eq!(choose_pairing_method(with_oob, without), PairingMethod::OutOfBand);
        assert_eq!(choose_pairing_method(without, with_oob), PairingMethod::OutOfBand);
        // Legacy OOB requires the data present on both sides.
        assert_ne!(
            choose_legacy_pairing_method(with_oob, without),
            PairingMethod::OutOfBand
        );
        assert_eq!(
            choose_legacy_pairing_method(with_oob, with_oob),
            PairingMethod::OutOfBand
        );
    }

    #[test]
    fn display_yes_no_both_is_numeric_comparison_only_in_sc() {
        let initiator = features(
            IoCapabilities::DisplayYesNo,
            UseOutOfBand::NotPresent,
            AuthReq::new(BondingFlag::NoBonding),
        );
        let responder = initiator;
        assert_eq!(
            choose_pairing_method(initiator, responder),
            PairingMethod::NumericComparison
        );
        assert_eq!(
            choose_legacy_pairing_method(initiator, responder),
            PairingMethod::JustWorks
        );
    }

    #[test]
    fn keyboard_against_display() {
        let initiator = features(
            IoCapabilities::KeyboardOnly,
            UseOutOfBand::NotPresent,
            AuthReq::new(BondingFlag::NoBonding),
        );
        let responder = features(
            IoCapabilities::DisplayOnly,
            UseOutOfBand::NotPresent,
            AuthReq::new(BondingFlag::NoBonding),
        );
        assert_eq!(
            choose_pairing_method(initiator, responder),
            PairingMethod::PassKeyEntry {
                initiator: PassKeyEntryAction::Input,
                responder: PassKeyEntryAction::Display,
            }
        );
    }

    #[test]
    fn sc_only_policy() {
        assert!(check_secure_connections_policy(true, false, PairingMethod::NumericComparison).is_err());
        assert!(check_secure_connections_policy(true, true, PairingMethod::JustWorks).is_err());
        assert!(check_secure_connections_policy(true, true, PairingMethod::NumericComparison).is_ok());
        assert!(check_secure_connections_policy(false, false, PairingMethod::JustWorks).is_ok());
    }
}
