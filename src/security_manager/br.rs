//! SMP over BR/EDR
//!
//! Cross-transport key derivation ([Vol 3] Part H, Section 2.4.2.5):
//! once a BR/EDR link is encrypted with an authenticated link key, SMP
//! runs directly over it with no phase 2. The LE LTK is derived from
//! the link key with `h6`/`h7` and the identity and signing keys are
//! exchanged under the existing encryption.

use core::cell::RefCell;
use core::ops::DerefMut;

use bt_hci::param::{AddrKind, BdAddr, LeConnRole};

use crate::codec::{Decode, Encode};
use crate::security_manager::crypto::{derive_long_term_key, IdentityResolvingKey, LinkKey, SigningKey};
use crate::security_manager::pairing::util::{
    make_identity_address_information_packet, make_identity_information_packet, make_signing_information_packet,
    prepare_packet, CommandAndPayload,
};
use crate::security_manager::pairing::{PairingConfig, PairingOps};
use crate::security_manager::types::{AuthReq, Command, KeyDistributionFlags, PairingFeatures, SecurityLevel};
use crate::security_manager::{BondInformation, Reason, SecurityEvent};
use crate::{Address, Error, Identity, PacketPool};

/// Which key distribution PDU is expected next.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum KeyStage {
    IdentityInformation,
    IdentityAddressInformation,
    SigningInformation,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Step {
    Idle,
    /// Responder waiting for the initiator's Pairing Request.
    WaitingPairingRequest,
    /// Initiator sent the Pairing Request.
    WaitingPairingResponse,
    ReceivingKeys(KeyStage),
    /// All keys distributed; the delayed-authorization window is open.
    BondPending,
    Success,
    Error(Error),
}

struct PairingData {
    config: PairingConfig,
    role: LeConnRole,
    local_address: Address,
    peer_address: Address,
    link_key: LinkKey,
    /// The BR/EDR link key is authenticated (MITM protected).
    link_key_authenticated: bool,
    /// An LE key for this peer already exists with higher authentication
    /// than the BR link; derivation must not overwrite it.
    le_key_more_authenticated: bool,
    local_features: PairingFeatures,
    peer_features: PairingFeatures,
    ct2: bool,
    local_key_mask: KeyDistributionFlags,
    peer_key_mask: KeyDistributionFlags,
    derive_ltk: bool,
    bond_information: Option<BondInformation>,
}

impl PairingData {
    fn receive_stage(&self) -> Option<KeyStage> {
        match self.peer_key_mask.next_key() {
            Some(KeyDistributionFlags::IDENTITY_KEY) => Some(KeyStage::IdentityInformation),
            Some(KeyDistributionFlags::SIGNING_KEY) => Some(KeyStage::SigningInformation),
            _ => None,
        }
    }

    fn clear_keys(&mut self) {
        self.link_key = LinkKey(0);
        self.local_key_mask = KeyDistributionFlags::empty();
        self.peer_key_mask = KeyDistributionFlags::empty();
        self.derive_ltk = false;
    }
}

/// SMP over BR/EDR: key distribution and LTK derivation on an already
/// encrypted classic link.
pub struct BrPairing {
    current_step: RefCell<Step>,
    pairing_data: RefCell<PairingData>,
}

impl BrPairing {
    /// Create the BR-side control block. `link_key_authenticated`
    /// reflects the security of the classic link;
    /// `le_key_more_authenticated` blocks derivation from overwriting a
    /// stronger LE key.
    pub fn new(
        role: LeConnRole,
        local_address: Address,
        peer_address: Address,
        link_key: LinkKey,
        link_key_authenticated: bool,
        le_key_more_authenticated: bool,
        config: PairingConfig,
    ) -> Self {
        Self {
            current_step: RefCell::new(if role == LeConnRole::Central {
                Step::Idle
            } else {
                Step::WaitingPairingRequest
            }),
            pairing_data: RefCell::new(PairingData {
                config,
                role,
                local_address,
                peer_address,
                link_key,
                link_key_authenticated,
                le_key_more_authenticated,
                local_features: PairingFeatures {
                    io_capabilities: config.io_capabilities,
                    ..Default::default()
                },
                peer_features: PairingFeatures::default(),
                ct2: false,
                local_key_mask: KeyDistributionFlags::empty(),
                peer_key_mask: KeyDistributionFlags::empty(),
                derive_ltk: false,
                bond_information: None,
            }),
        }
    }

    /// Initiator entry: send the Pairing Request over the BR/EDR
    /// security manager channel.
    pub fn initiate<P: PacketPool, OPS: PairingOps<P>>(&self, ops: &mut OPS) -> Result<(), Error> {
        let next = {
            let mut pairing_data = self.pairing_data.borrow_mut();
            let pairing_data = pairing_data.deref_mut();
            if pairing_data.role != LeConnRole::Central {
                return Err(Error::InvalidState);
            }
            Self::init_local_features(ops, pairing_data);
            Self::send_pairing_features(Command::PairingRequest, ops, pairing_data)?;
            Step::WaitingPairingResponse
        };
        self.current_step.replace(next);
        Ok(())
    }

    /// Feed a PDU received on the BR/EDR security manager channel.
    pub fn handle_l2cap_command<P: PacketPool, OPS: PairingOps<P>>(
        &self,
        command: Command,
        payload: &[u8],
        ops: &mut OPS,
    ) -> Result<(), Error> {
        match self.handle_impl(CommandAndPayload { payload, command }, ops) {
            Ok(()) => Ok(()),
            Err(error) => {
                error!("[smp br] Failed to handle command {:?}, {:?}", command, error);
                self.report_failure(error, ops)
            }
        }
    }

    /// The delayed-authorization timer fired.
    pub fn handle_delayed_auth_expired<P: PacketPool, OPS: PairingOps<P>>(&self, ops: &mut OPS) -> Result<(), Error> {
        let current_step = self.current_step.borrow().clone();
        let next = match current_step {
            Step::BondPending => Step::Success,
            x @ (Step::Success | Step::Error(_)) => x,
            _ => Step::Error(Error::InvalidState),
        };
        match self.handle_step_result(next, ops) {
            Ok(()) => Ok(()),
            Err(error) => self.report_failure(error, ops),
        }
    }

    /// Peer sent Pairing Failed; terminate without answering.
    pub fn handle_peer_failure<P: PacketPool, OPS: PairingOps<P>>(
        &self,
        reason: Reason,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        warn!("[smp br] Peer failed pairing: {}", reason);
        self.fail(Error::Security(reason));
        ops.try_send_security_event(SecurityEvent::PairingFailed(reason))?;
        Ok(())
    }

    fn fail(&self, error: Error) {
        self.current_step.replace(Step::Error(error));
        self.pairing_data.borrow_mut().clear_keys();
    }

    /// Terminal failure: clear the block and report once.
    fn report_failure<P: PacketPool, OPS: PairingOps<P>>(&self, error: Error, ops: &mut OPS) -> Result<(), Error> {
        self.fail(error.clone());
        let reason = match &error {
            Error::Security(reason) => *reason,
            _ => Reason::UnspecifiedReason,
        };
        ops.try_send_security_event(SecurityEvent::PairingFailed(reason))?;
        Err(error)
    }

    fn handle_step_result<P: PacketPool, OPS: PairingOps<P>>(&self, next_step: Step, ops: &mut OPS) -> Result<(), Error> {
        match next_step {
            Step::Error(x) => {
                self.fail(x.clone());
                Err(x)
            }
            x => {
                let is_success = matches!(x, Step::Success);
                self.current_step.replace(x);
                if is_success {
                    let mut pairing_data = self.pairing_data.borrow_mut();
                    if let Some(bond) = pairing_data.bond_information.as_ref() {
                        ops.try_update_bond_information(bond)?;
                        ops.try_send_security_event(SecurityEvent::PairingComplete {
                            security_level: bond.security_level,
                            bond: Some(bond.clone()),
                        })?;
                    }
                    pairing_data.clear_keys();
                }
                Ok(())
            }
        }
    }

    fn handle_impl<P: PacketPool, OPS: PairingOps<P>>(
        &self,
        command: CommandAndPayload,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let current_step = self.current_step.borrow().clone();
        let next_step = {
            let mut pairing_data = self.pairing_data.borrow_mut();
            let pairing_data = pairing_data.deref_mut();
            trace!("[smp br] Handling {:?}, step {:?}", command.command, current_step);
            match (current_step, command.command) {
                (Step::WaitingPairingRequest, Command::PairingRequest) => {
                    let peer_features =
                        PairingFeatures::decode(command.payload).map_err(|_| Error::Security(Reason::InvalidParameters))?;
                    pairing_data.peer_features = peer_features;
                    Self::init_local_features(ops, pairing_data);
                    Self::negotiate(pairing_data)?;
                    Self::send_pairing_features(Command::PairingResponse, ops, pairing_data)?;
                    Self::start_distribution(ops, pairing_data)?
                }
                (Step::WaitingPairingResponse, Command::PairingResponse) => {
                    let peer_features =
                        PairingFeatures::decode(command.payload).map_err(|_| Error::Security(Reason::InvalidParameters))?;
                    pairing_data.peer_features = peer_features;
                    Self::negotiate(pairing_data)?;
                    Self::start_distribution(ops, pairing_data)?
                }
                (Step::ReceivingKeys(stage), _) => Self::handle_distributed_key(stage, command, ops, pairing_data)?,
                (x, Command::KeypressNotification) => x,
                _ => return Err(Error::InvalidState),
            }
        };

        self.handle_step_result(next_step, ops)
    }

    /// Over BR/EDR only the key distribution fields carry meaning; IO
    /// capability, OOB flag and most AuthReq bits are reserved.
    fn init_local_features<P: PacketPool, OPS: PairingOps<P>>(ops: &mut OPS, pairing_data: &mut PairingData) {
        pairing_data.local_features.security_properties = AuthReq::new(ops.bonding_flag());
        let keys = KeyDistributionFlags::from(
            KeyDistributionFlags::ENCRYPTION_KEY
                | KeyDistributionFlags::IDENTITY_KEY
                | KeyDistributionFlags::SIGNING_KEY,
        );
        pairing_data.local_features.initiator_key_distribution = keys;
        pairing_data.local_features.responder_key_distribution = keys;
    }

    fn send_pairing_features<P: PacketPool, OPS: PairingOps<P>>(
        command: Command,
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<(), Error> {
        let mut packet = prepare_packet::<P>(command)?;
        pairing_data
            .local_features
            .encode(packet.payload_mut())
            .map_err(|_| Error::InvalidValue)?;
        ops.try_send_packet(packet)
    }

    fn negotiate(pairing_data: &mut PairingData) -> Result<(), Error> {
        if !pairing_data.link_key_authenticated {
            // Derivation needs an authenticated classic link.
            return Err(Error::Security(Reason::AuthenticationRequirements));
        }
        if pairing_data.le_key_more_authenticated {
            warn!("[smp br] Existing LE key outranks the BR link key; refusing derivation");
            return Err(Error::Security(Reason::GenerationNotAllowed));
        }

        pairing_data.ct2 = pairing_data.local_features.security_properties.ct2()
            && pairing_data.peer_features.security_properties.ct2();

        let (local_grant, peer_grant) = if pairing_data.role == LeConnRole::Central {
            (
                pairing_data
                    .local_features
                    .initiator_key_distribution
                    .intersect(pairing_data.peer_features.initiator_key_distribution),
                pairing_data
                    .local_features
                    .responder_key_distribution
                    .intersect(pairing_data.peer_features.responder_key_distribution),
            )
        } else {
            (
                pairing_data
                    .local_features
                    .responder_key_distribution
                    .intersect(pairing_data.peer_features.responder_key_distribution),
                pairing_data
                    .local_features
                    .initiator_key_distribution
                    .intersect(pairing_data.peer_features.initiator_key_distribution),
            )
        };
        pairing_data.local_key_mask = local_grant;
        pairing_data.peer_key_mask = peer_grant;

        // The LTK is derived, never transmitted.
        pairing_data.derive_ltk =
            pairing_data.local_key_mask.encryption_key() || pairing_data.peer_key_mask.encryption_key();
        pairing_data
            .local_key_mask
            .clear(KeyDistributionFlags::ENCRYPTION_KEY | KeyDistributionFlags::LINK_KEY);
        pairing_data
            .peer_key_mask
            .clear(KeyDistributionFlags::ENCRYPTION_KEY | KeyDistributionFlags::LINK_KEY);
        Ok(())
    }

    fn start_distribution<P: PacketPool, OPS: PairingOps<P>>(
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        if pairing_data.derive_ltk {
            let ltk = derive_long_term_key(&pairing_data.link_key, pairing_data.ct2);
            debug!("[smp br] Derived LE LTK from BR/EDR link key");
            let level = if pairing_data.link_key_authenticated {
                SecurityLevel::EncryptedAuthenticated
            } else {
                SecurityLevel::Encrypted
            };
            pairing_data.bond_information = Some(BondInformation {
                identity: Identity {
                    bd_addr: pairing_data.peer_address.addr,
                    irk: None,
                },
                ltk,
                security_level: level,
                is_bonded: true,
                ediv: 0,
                rand: [0; 8],
                peer_csrk: None,
            });
            pairing_data.derive_ltk = false;
        }

        // Responder distributes first, initiator after the responder is
        // done; over BR/EDR both directions run under the existing
        // encryption so ordering only follows the LE convention.
        if pairing_data.role == LeConnRole::Peripheral {
            Self::send_local_keys(ops, pairing_data)?;
        }
        Self::advance_distribution(ops, pairing_data)
    }

    fn send_local_keys<P: PacketPool, OPS: PairingOps<P>>(
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<(), Error> {
        while let Some(key) = pairing_data.local_key_mask.next_key() {
            match key {
                KeyDistributionFlags::IDENTITY_KEY => {
                    ops.try_send_packet(make_identity_information_packet(&pairing_data.config.local_irk)?)?;
                    ops.try_send_packet(make_identity_address_information_packet(&pairing_data.local_address)?)?;
                }
                KeyDistributionFlags::SIGNING_KEY => {
                    ops.try_send_packet(make_signing_information_packet(&pairing_data.config.local_csrk)?)?;
                }
                _ => {}
            }
            pairing_data.local_key_mask.clear(key);
        }
        Ok(())
    }

    fn advance_distribution<P: PacketPool, OPS: PairingOps<P>>(
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        if let Some(stage) = pairing_data.receive_stage() {
            return Ok(Step::ReceivingKeys(stage));
        }
        if pairing_data.role == LeConnRole::Central {
            Self::send_local_keys(ops, pairing_data)?;
        }
        ops.schedule_delayed_auth()?;
        Ok(Step::BondPending)
    }

    fn handle_distributed_key<P: PacketPool, OPS: PairingOps<P>>(
        stage: KeyStage,
        command: CommandAndPayload,
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        let payload = command.payload;
        match (stage, command.command) {
            (KeyStage::IdentityInformation, Command::IdentityInformation) => {
                let irk = IdentityResolvingKey::from_le_bytes(payload.try_into().map_err(|_| Error::InvalidValue)?);
                if let Some(bond) = pairing_data.bond_information.as_mut() {
                    bond.identity.irk = Some(irk);
                }
                Ok(Step::ReceivingKeys(KeyStage::IdentityAddressInformation))
            }
            (KeyStage::IdentityAddressInformation, Command::IdentityAddressInformation) => {
                let kind = match payload[0] {
                    0 => AddrKind::PUBLIC,
                    1 => AddrKind::RANDOM,
                    _ => return Err(Error::Security(Reason::InvalidParameters)),
                };
                let addr = BdAddr::new(payload[1..7].try_into().map_err(|_| Error::InvalidValue)?);
                pairing_data.peer_address = Address { kind, addr };
                if let Some(bond) = pairing_data.bond_information.as_mut() {
                    bond.identity.bd_addr = addr;
                }
                pairing_data.peer_key_mask.clear(KeyDistributionFlags::IDENTITY_KEY);
                Self::advance_distribution(ops, pairing_data)
            }
            (KeyStage::SigningInformation, Command::SigningInformation) => {
                let csrk = SigningKey::from_le_bytes(payload.try_into().map_err(|_| Error::InvalidValue)?);
                if let Some(bond) = pairing_data.bond_information.as_mut() {
                    bond.peer_csrk = Some(csrk);
                }
                pairing_data.peer_key_mask.clear(KeyDistributionFlags::SIGNING_KEY);
                Self::advance_distribution(ops, pairing_data)
            }
            _ => Err(Error::InvalidState),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security_manager::pairing::tests::{HeaplessPool, TestOps};

    fn addresses() -> (Address, Address) {
        (
            Address::public([0xaa, 1, 2, 3, 4, 5]),
            Address::public([0xbb, 1, 2, 3, 4, 5]),
        )
    }

    #[test]
    fn derives_matching_long_term_keys() {
        let (a, b) = addresses();
        let link_key = LinkKey(0x11223344_55667788_99aabbcc_ddeeff00);
        let mut central_ops: TestOps<20> = TestOps::default();
        let mut peripheral_ops: TestOps<20> = TestOps::default();

        let central = BrPairing::new(
            LeConnRole::Central,
            a,
            b,
            link_key,
            true,
            false,
            PairingConfig::default(),
        );
        let peripheral = BrPairing::new(
            LeConnRole::Peripheral,
            b,
            a,
            link_key,
            true,
            false,
            PairingConfig::default(),
        );

        central.initiate::<HeaplessPool, _>(&mut central_ops).unwrap();

        // Deliver the request, the response, then the key PDUs of both
        // directions.
        let mut delivered_c = 0;
        let mut delivered_p = 0;
        let mut progress = true;
        while progress {
            progress = false;
            while delivered_c < central_ops.sent_packets.len() {
                let packet = &central_ops.sent_packets[delivered_c];
                let (command, payload) = (packet.command(), packet.payload());
                let mut buffer = [0u8; 64];
                buffer[..payload.len()].copy_from_slice(payload);
                delivered_c += 1;
                peripheral
                    .handle_l2cap_command::<HeaplessPool, _>(command, &buffer[..payload.len()], &mut peripheral_ops)
                    .unwrap();
                progress = true;
            }
            while delivered_p < peripheral_ops.sent_packets.len() {
                let packet = &peripheral_ops.sent_packets[delivered_p];
                let (command, payload) = (packet.command(), packet.payload());
                let mut buffer = [0u8; 64];
                buffer[..payload.len()].copy_from_slice(payload);
                delivered_p += 1;
                central
                    .handle_l2cap_command::<HeaplessPool, _>(command, &buffer[..payload.len()], &mut central_ops)
                    .unwrap();
                progress = true;
            }
        }

        assert_eq!(central_ops.delayed_auth_scheduled, 1);
        assert_eq!(peripheral_ops.delayed_auth_scheduled, 1);
        central
            .handle_delayed_auth_expired::<HeaplessPool, _>(&mut central_ops)
            .unwrap();
        peripheral
            .handle_delayed_auth_expired::<HeaplessPool, _>(&mut peripheral_ops)
            .unwrap();

        let ltk_of = |ops: &TestOps<20>| {
            ops.security_events
                .iter()
                .find_map(|event| match event {
                    SecurityEvent::PairingComplete { bond: Some(bond), .. } => Some(bond.ltk),
                    _ => None,
                })
                .unwrap()
        };
        assert_eq!(ltk_of(&central_ops), ltk_of(&peripheral_ops));
        assert_eq!(ltk_of(&central_ops), derive_long_term_key(&link_key, true));
    }

    #[test]
    fn stronger_le_key_blocks_derivation() {
        let (a, b) = addresses();
        let mut ops: TestOps<20> = TestOps::default();
        let peripheral = BrPairing::new(
            LeConnRole::Peripheral,
            b,
            a,
            LinkKey(1),
            true,
            true,
            PairingConfig::default(),
        );

        let result = peripheral.handle_l2cap_command::<HeaplessPool, _>(
            Command::PairingRequest,
            &[0x03, 0, 0x28, 16, 0x07, 0x07],
            &mut ops,
        );
        assert!(matches!(result, Err(Error::Security(Reason::GenerationNotAllowed))));
    }

    #[test]
    fn unauthenticated_link_key_refused() {
        let (a, b) = addresses();
        let mut ops: TestOps<20> = TestOps::default();
        let peripheral = BrPairing::new(
            LeConnRole::Peripheral,
            b,
            a,
            LinkKey(1),
            false,
            false,
            PairingConfig::default(),
        );

        let result = peripheral.handle_l2cap_command::<HeaplessPool, _>(
            Command::PairingRequest,
            &[0x03, 0, 0x28, 16, 0x07, 0x07],
            &mut ops,
        );
        assert!(matches!(
            result,
            Err(Error::Security(Reason::AuthenticationRequirements))
        ));
    }
}
