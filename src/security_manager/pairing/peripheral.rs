//! Responder pairing state machine
//!
//! Drives phase 1 (feature exchange), phase 2 (legacy TK/confirm or
//! Secure Connections commitment, nonce and DHKey check exchange) and
//! phase 3 (key distribution) from the responder side of the link.

use core::cell::RefCell;
use core::ops::{Deref, DerefMut};

use bt_hci::param::{AddrKind, BdAddr};
use embassy_time::Instant;
use rand::Rng;
use rand_core::{CryptoRng, RngCore};

use crate::codec::{Decode, Encode};
use crate::security_manager::crypto::{
    self, derive_link_key, Confirm, DHKey, IdentityResolvingKey, LongTermKey, MacKey, Nonce, PublicKey, SecretKey,
    SigningKey,
};
use crate::security_manager::pairing::util::{
    check_secure_connections_policy, choose_legacy_pairing_method, choose_pairing_method, ct2_in_use,
    make_central_identification_packet, make_confirm_packet, make_dhkey_check_packet,
    make_encryption_information_packet, make_identity_address_information_packet, make_identity_information_packet,
    make_pairing_random, make_public_key_packet, make_signing_information_packet, prepare_packet, CommandAndPayload,
    PairingMethod, PassKeyEntryAction,
};
use crate::security_manager::pairing::{Event, PairingConfig, PairingOps};
use crate::security_manager::types::{
    AuthReq, Command, IoCapabilities, KeyDistributionFlags, PairingFeatures, PassKey, SecurityLevel,
};
use crate::security_manager::{constants, BondInformation, Reason, SecurityEvent};
use crate::{Address, Error, PacketPool};

/// Which key distribution PDU is expected next while receiving the
/// initiator's keys.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum KeyStage {
    EncryptionInformation,
    CentralIdentification,
    IdentityInformation,
    IdentityAddressInformation,
    SigningInformation,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Step {
    WaitingPairingRequest,
    /// We sent a Security Request and wait for the initiator to start.
    SecurityRequestSent,
    // Legacy phase 2
    /// Waiting for the TK (user passkey or OOB data). An early
    /// Mconfirm is stashed until the TK arrives.
    WaitingTk(Option<[u8; 16]>),
    WaitingConfirm,
    WaitingRandom,
    // Secure Connections phase 1
    WaitingPublicKey,
    /// Commitment sent (Just Works / numeric comparison); waiting for
    /// the initiator nonce.
    WaitingNonce,
    /// Waiting for the user verdict on the comparison value or consent
    /// prompt. The DHKey check may overtake the user and is stashed.
    WaitingUserConfirm(Option<[u8; 16]>),
    /// SC passkey entry, waiting for the user passkey. An early round-0
    /// commitment is stashed.
    WaitingPassKeyInput(Option<[u8; 16]>),
    WaitingPassKeyEntryConfirm(u8),
    WaitingPassKeyEntryRandom(u8),
    /// SC out-of-band, waiting for the peer randomizer from the OOB
    /// channel.
    WaitingOobData,
    // Secure Connections phase 2
    WaitingDhKeyCheck,
    // Phase 3
    WaitingLinkEncrypted,
    ReceivingKeys(KeyStage),
    /// All keys distributed; the delayed-authorization window is open.
    BondPending,
    Success,
    Error(Error),
}

struct PairingData {
    config: PairingConfig,
    local_address: Address,
    peer_address: Address,
    local_features: PairingFeatures,
    peer_features: PairingFeatures,
    pairing_method: PairingMethod,
    secure_connections: bool,
    ct2: bool,
    /// TK for legacy pairing: 0 for Just Works, passkey or OOB data.
    tk: u128,
    /// Pairing Request PDU bytes (opcode + features) for c1.
    preq: [u8; 7],
    /// Pairing Response PDU bytes (opcode + features) for c1.
    pres: [u8; 7],
    /// Initiator confirm: legacy Mconfirm or the SC commitment of the
    /// current round.
    peer_confirm: u128,
    peer_public_key: Option<PublicKey>,
    local_public_key: Option<PublicKey>,
    private_key: Option<SecretKey>,
    dh_key: Option<DHKey>,
    local_nonce: Nonce,
    peer_nonce: Nonce,
    mac_key: Option<MacKey>,
    local_secret_rb: u128,
    peer_secret_ra: u128,
    /// Key distributed (or derived) on this link.
    long_term_key: LongTermKey,
    ediv: u16,
    rand: [u8; 8],
    /// Keys the initiator still has to distribute.
    local_i_key: KeyDistributionFlags,
    /// Keys we still have to distribute.
    local_r_key: KeyDistributionFlags,
    derive_lk: bool,
    timeout_at: Instant,
    bond_information: Option<BondInformation>,
}

impl PairingData {
    fn want_bonding(&self) -> bool {
        use crate::security_manager::types::BondingFlag;
        matches!(self.local_features.security_properties.bond(), BondingFlag::Bonding)
            && matches!(self.peer_features.security_properties.bond(), BondingFlag::Bonding)
    }

    fn negotiated_key_size(&self) -> u8 {
        core::cmp::min(
            self.peer_features.maximum_encryption_key_size,
            self.local_features.maximum_encryption_key_size,
        )
    }

    /// Initiator address type for c1 (0 = public, 1 = random).
    fn iat(&self) -> u8 {
        if self.peer_address.kind == AddrKind::PUBLIC {
            0
        } else {
            1
        }
    }

    /// Responder address type for c1.
    fn rat(&self) -> u8 {
        if self.local_address.kind == AddrKind::PUBLIC {
            0
        } else {
            1
        }
    }

    /// Initiator address, most significant octet first.
    fn ia(&self) -> [u8; 6] {
        let mut addr = self.peer_address.addr.into_inner();
        addr.reverse();
        addr
    }

    /// Responder address, most significant octet first.
    fn ra(&self) -> [u8; 6] {
        let mut addr = self.local_address.addr.into_inner();
        addr.reverse();
        addr
    }

    /// Update the distribution masks once the link is encrypted. In SC
    /// mode the LTK and any BR/EDR link key are derived locally rather
    /// than transmitted; the link key additionally needs both sides to
    /// have requested it.
    fn update_masks_on_encrypted(&mut self) {
        if self.secure_connections {
            if self.local_i_key.link_key() && self.local_r_key.link_key() {
                self.derive_lk = true;
            }
            self.local_i_key
                .clear(KeyDistributionFlags::ENCRYPTION_KEY | KeyDistributionFlags::LINK_KEY);
            self.local_r_key
                .clear(KeyDistributionFlags::ENCRYPTION_KEY | KeyDistributionFlags::LINK_KEY);
        } else {
            self.local_i_key.clear(KeyDistributionFlags::LINK_KEY);
            self.local_r_key.clear(KeyDistributionFlags::LINK_KEY);
        }
        if !self.want_bonding() {
            self.local_i_key = KeyDistributionFlags::empty();
            self.local_r_key = KeyDistributionFlags::empty();
        }
    }

    fn receive_stage(&self) -> Option<KeyStage> {
        match self.local_i_key.next_key() {
            Some(KeyDistributionFlags::ENCRYPTION_KEY) => Some(KeyStage::EncryptionInformation),
            Some(KeyDistributionFlags::IDENTITY_KEY) => Some(KeyStage::IdentityInformation),
            Some(KeyDistributionFlags::SIGNING_KEY) => Some(KeyStage::SigningInformation),
            _ => None,
        }
    }

    /// Drop every piece of key material. Called on both terminal paths
    /// so nothing leaks into a later pairing.
    fn clear_keys(&mut self) {
        self.tk = 0;
        self.peer_confirm = 0;
        self.local_nonce = Nonce(0);
        self.peer_nonce = Nonce(0);
        self.local_secret_rb = 0;
        self.peer_secret_ra = 0;
        self.private_key = None;
        self.local_public_key = None;
        self.peer_public_key = None;
        self.dh_key = None;
        self.mac_key = None;
        self.long_term_key = LongTermKey(0);
        self.ediv = 0;
        self.rand = [0; 8];
        self.preq = [0; 7];
        self.pres = [0; 7];
        self.local_i_key = KeyDistributionFlags::empty();
        self.local_r_key = KeyDistributionFlags::empty();
        self.derive_lk = false;
    }
}

/// Responder pairing state machine.
pub struct Pairing {
    current_step: RefCell<Step>,
    pairing_data: RefCell<PairingData>,
}

impl Pairing {
    /// Create a responder waiting for the initiator's Pairing Request.
    pub fn new(local_address: Address, peer_address: Address, config: PairingConfig) -> Self {
        Self {
            current_step: RefCell::new(Step::WaitingPairingRequest),
            pairing_data: RefCell::new(PairingData {
                config,
                local_address,
                peer_address,
                local_features: PairingFeatures {
                    io_capabilities: config.io_capabilities,
                    ..Default::default()
                },
                peer_features: PairingFeatures::default(),
                pairing_method: PairingMethod::JustWorks,
                secure_connections: false,
                ct2: false,
                tk: 0,
                preq: [0; 7],
                pres: [0; 7],
                peer_confirm: 0,
                peer_public_key: None,
                local_public_key: None,
                private_key: None,
                dh_key: None,
                local_nonce: Nonce(0),
                peer_nonce: Nonce(0),
                mac_key: None,
                local_secret_rb: 0,
                peer_secret_ra: 0,
                long_term_key: LongTermKey(0),
                ediv: 0,
                rand: [0; 8],
                local_i_key: KeyDistributionFlags::empty(),
                local_r_key: KeyDistributionFlags::empty(),
                derive_lk: false,
                timeout_at: Instant::now() + crate::config::SMP_TIMEOUT,
                bond_information: None,
            }),
        }
    }

    /// Start pairing from the responder side by sending a Security
    /// Request; the initiator answers with a Pairing Request.
    pub(crate) fn initiate<P: PacketPool, OPS: PairingOps<P>>(
        local_address: Address,
        peer_address: Address,
        ops: &mut OPS,
        config: PairingConfig,
    ) -> Result<Self, Error> {
        let ret = Self::new(local_address, peer_address, config);
        {
            let mut security_request = prepare_packet(Command::SecurityRequest)?;
            let payload = security_request.payload_mut();
            let mut auth_req = if config.secure_connections {
                AuthReq::new(ops.bonding_flag())
            } else {
                AuthReq::new_legacy(ops.bonding_flag()).with_mitm()
            };
            if config.io_capabilities == IoCapabilities::NoInputNoOutput {
                auth_req = auth_req.without_mitm();
            }
            payload[0] = auth_req.into();
            ops.try_send_packet(security_request)?;
        }
        ret.current_step.replace(Step::SecurityRequestSent);
        Ok(ret)
    }

    pub fn timeout_at(&self) -> Instant {
        let step = self.current_step.borrow();
        if matches!(step.deref(), Step::Success | Step::Error(_)) {
            Instant::now() + constants::TIMEOUT_DISABLE
        } else {
            self.pairing_data.borrow().timeout_at
        }
    }

    pub fn reset_timeout(&self) {
        let mut pairing_data = self.pairing_data.borrow_mut();
        pairing_data.timeout_at = Instant::now() + crate::config::SMP_TIMEOUT;
    }

    pub(crate) fn mark_timeout(&self) {
        let mut current_step = self.current_step.borrow_mut();
        if matches!(current_step.deref(), Step::Success | Step::Error(_)) {
            return;
        }
        *current_step = Step::Error(Error::Timeout);
        self.pairing_data.borrow_mut().clear_keys();
    }

    pub fn peer_address(&self) -> Address {
        self.pairing_data.borrow().peer_address
    }

    pub fn security_level(&self) -> SecurityLevel {
        let step = self.current_step.borrow();
        match step.deref() {
            Step::ReceivingKeys(_) | Step::BondPending | Step::Success => self
                .pairing_data
                .borrow()
                .bond_information
                .as_ref()
                .map(|x| x.security_level)
                .unwrap_or(SecurityLevel::NoEncryption),
            _ => SecurityLevel::NoEncryption,
        }
    }

    pub fn handle_l2cap_command<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        &self,
        command: Command,
        payload: &[u8],
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        match self.handle_impl(CommandAndPayload { payload, command }, ops, rng) {
            Ok(()) => Ok(()),
            Err(error) => {
                error!("[smp] Failed to handle command {:?}, {:?}", command, error);
                self.report_failure(error, ops)
            }
        }
    }

    pub fn handle_event<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        &self,
        event: Event,
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        match self.handle_event_impl(event, ops, rng) {
            Ok(()) => Ok(()),
            Err(error) => {
                error!("[smp] Failed to handle event, {:?}", error);
                self.report_failure(error, ops)
            }
        }
    }

    fn handle_event_impl<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        &self,
        event: Event,
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        let current_step = self.current_step.borrow().clone();
        let next_step = match (current_step, event) {
            (Step::WaitingTk(confirm), Event::PassKeyInput(input)) => {
                let mut pairing_data = self.pairing_data.borrow_mut();
                pairing_data.tk = input as u128;
                match confirm {
                    Some(payload) => {
                        pairing_data.peer_confirm = u128::from_le_bytes(payload);
                        Self::send_sconfirm(ops, pairing_data.deref_mut(), rng)?;
                        Step::WaitingRandom
                    }
                    None => Step::WaitingConfirm,
                }
            }
            (Step::WaitingTk(confirm), Event::OobData { ra, .. }) => {
                let mut pairing_data = self.pairing_data.borrow_mut();
                pairing_data.tk = ra;
                match confirm {
                    Some(payload) => {
                        pairing_data.peer_confirm = u128::from_le_bytes(payload);
                        Self::send_sconfirm(ops, pairing_data.deref_mut(), rng)?;
                        Step::WaitingRandom
                    }
                    None => Step::WaitingConfirm,
                }
            }
            (Step::WaitingPassKeyInput(confirm), Event::PassKeyInput(input)) => {
                let mut pairing_data = self.pairing_data.borrow_mut();
                pairing_data.local_secret_rb = input as u128;
                pairing_data.peer_secret_ra = pairing_data.local_secret_rb;
                match confirm {
                    Some(payload) => {
                        Self::handle_pass_key_confirm(0, &payload, ops, pairing_data.deref_mut(), rng)?
                    }
                    None => Step::WaitingPassKeyEntryConfirm(0),
                }
            }
            (Step::WaitingOobData, Event::OobData { ra, confirm }) => {
                let mut pairing_data = self.pairing_data.borrow_mut();
                let pairing_data = pairing_data.deref_mut();
                let peer_x = pairing_data.peer_public_key.as_ref().ok_or(Error::InvalidValue)?.x;
                if confirm.is_some_and(|expected| Nonce(ra).f4(&peer_x, &peer_x, 0).0 != expected) {
                    Step::Error(Error::Security(Reason::ConfirmValueFailed))
                } else {
                    pairing_data.peer_secret_ra = ra;
                    pairing_data.local_nonce = Nonce::new(rng);
                    Step::WaitingNonce
                }
            }
            (Step::WaitingUserConfirm(check), Event::PassKeyConfirm) => {
                if let Some(ea) = check {
                    let mut pairing_data = self.pairing_data.borrow_mut();
                    Self::handle_dhkey_check(&ea, ops, pairing_data.deref_mut())?
                } else {
                    Step::WaitingDhKeyCheck
                }
            }
            (Step::WaitingUserConfirm(_), Event::PassKeyCancel) => {
                Step::Error(Error::Security(Reason::NumericComparisonFailed))
            }
            (Step::WaitingLinkEncrypted, Event::LinkEncrypted) => {
                let mut pairing_data = self.pairing_data.borrow_mut();
                Self::start_key_distribution(ops, pairing_data.deref_mut())?
            }
            (Step::BondPending, Event::DelayedAuthExpired) => Step::Success,
            (x @ (Step::Success | Step::Error(_)), _) => x,
            (x, Event::PassKeyConfirm | Event::PassKeyCancel | Event::PassKeyInput(_) | Event::OobData { .. }) => x,
            _ => Step::Error(Error::InvalidState),
        };

        self.handle_step_result(next_step, ops)
    }

    /// Peer aborted with Pairing Failed; terminate without answering.
    pub(crate) fn handle_peer_failure<P: PacketPool, OPS: PairingOps<P>>(
        &self,
        reason: Reason,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        warn!("[smp] Peer failed pairing: {}", reason);
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
                        if bond.is_bonded {
                            ops.try_update_bond_information(bond)?;
                        }
                        ops.try_send_security_event(SecurityEvent::PairingComplete {
                            security_level: bond.security_level,
                            bond: bond.is_bonded.then(|| bond.clone()),
                        })?;
                    }
                    pairing_data.clear_keys();
                }
                Ok(())
            }
        }
    }

    fn handle_impl<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        &self,
        command: CommandAndPayload,
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        let current_step = self.current_step.borrow().clone();
        let next_step = {
            let mut pairing_data = self.pairing_data.borrow_mut();
            let pairing_data = pairing_data.deref_mut();
            trace!("[smp] Handling {:?}, step {:?}", command.command, current_step);
            match (current_step, command.command) {
                (Step::WaitingPairingRequest | Step::SecurityRequestSent, Command::PairingRequest) => {
                    Self::handle_pairing_request(command.payload, ops, pairing_data, rng)?
                }
                (Step::WaitingTk(_), Command::PairingConfirm) => {
                    let confirm: [u8; 16] = command
                        .payload
                        .try_into()
                        .map_err(|_| Error::Security(Reason::InvalidParameters))?;
                    Step::WaitingTk(Some(confirm))
                }
                (Step::WaitingConfirm, Command::PairingConfirm) => {
                    pairing_data.peer_confirm = u128::from_le_bytes(
                        command
                            .payload
                            .try_into()
                            .map_err(|_| Error::Security(Reason::InvalidParameters))?,
                    );
                    Self::send_sconfirm(ops, pairing_data, rng)?;
                    Step::WaitingRandom
                }
                (Step::WaitingRandom, Command::PairingRandom) => {
                    Self::handle_legacy_random(command.payload, ops, pairing_data)?
                }
                (Step::WaitingPublicKey, Command::PairingPublicKey) => {
                    Self::handle_public_key(command.payload, ops, pairing_data, rng)?
                }
                (Step::WaitingNonce, Command::PairingRandom) => {
                    Self::handle_nonce(command.payload, ops, pairing_data)?
                }
                (Step::WaitingPassKeyInput(_), Command::PairingConfirm) => {
                    let confirm: [u8; 16] = command
                        .payload
                        .try_into()
                        .map_err(|_| Error::Security(Reason::InvalidParameters))?;
                    Step::WaitingPassKeyInput(Some(confirm))
                }
                (Step::WaitingPassKeyEntryConfirm(round), Command::PairingConfirm) => {
                    Self::handle_pass_key_confirm(round, command.payload, ops, pairing_data, rng)?
                }
                (Step::WaitingPassKeyEntryRandom(round), Command::PairingRandom) => {
                    Self::handle_pass_key_random(round, command.payload, ops, pairing_data)?
                }
                (Step::WaitingUserConfirm(None), Command::PairingDhKeyCheck) => {
                    let check: [u8; 16] = command
                        .payload
                        .try_into()
                        .map_err(|_| Error::Security(Reason::InvalidParameters))?;
                    Step::WaitingUserConfirm(Some(check))
                }
                (Step::WaitingDhKeyCheck, Command::PairingDhKeyCheck) => {
                    Self::handle_dhkey_check(command.payload, ops, pairing_data)?
                }
                (Step::ReceivingKeys(stage), _) => {
                    Self::handle_distributed_key(stage, command, ops, pairing_data)?
                }
                (x, Command::KeypressNotification) => x,
                _ => return Err(Error::InvalidState),
            }
        };

        self.handle_step_result(next_step, ops)
    }

    fn handle_pairing_request<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
        rng: &mut RNG,
    ) -> Result<Step, Error> {
        let peer_features = PairingFeatures::decode(payload).map_err(|_| Error::Security(Reason::InvalidParameters))?;
        if peer_features.maximum_encryption_key_size < pairing_data.config.minimum_encryption_key_size {
            return Err(Error::Security(Reason::EncryptionKeySize));
        }

        pairing_data.preq[0] = u8::from(Command::PairingRequest);
        pairing_data.preq[1..7].copy_from_slice(payload);

        let mut auth_req = if pairing_data.config.secure_connections {
            AuthReq::new(ops.bonding_flag())
        } else {
            AuthReq::new_legacy(ops.bonding_flag()).with_mitm()
        };
        if pairing_data.config.io_capabilities == IoCapabilities::NoInputNoOutput {
            auth_req = auth_req.without_mitm();
        }
        pairing_data.local_features.security_properties = auth_req;
        // Offer exactly the keys the initiator asked for.
        pairing_data.local_features.initiator_key_distribution = peer_features.initiator_key_distribution;
        pairing_data.local_features.responder_key_distribution = peer_features.responder_key_distribution;
        pairing_data.peer_features = peer_features;

        pairing_data.secure_connections =
            crate::security_manager::pairing::util::secure_connections_in_use(&peer_features, &pairing_data.local_features);
        pairing_data.ct2 = ct2_in_use(&peer_features, &pairing_data.local_features);
        pairing_data.pairing_method = if pairing_data.secure_connections {
            choose_pairing_method(peer_features, pairing_data.local_features)
        } else {
            choose_legacy_pairing_method(peer_features, pairing_data.local_features)
        };
        info!(
            "[smp] Pairing method {:?}, secure connections: {}",
            pairing_data.pairing_method, pairing_data.secure_connections
        );

        check_secure_connections_policy(
            pairing_data.config.secure_connections_only,
            pairing_data.secure_connections,
            pairing_data.pairing_method,
        )?;

        pairing_data.local_i_key = pairing_data.local_features.initiator_key_distribution;
        pairing_data.local_r_key = pairing_data.local_features.responder_key_distribution;

        let mut packet = prepare_packet::<P>(Command::PairingResponse)?;
        let response = packet.payload_mut();
        pairing_data
            .local_features
            .encode(response)
            .map_err(|_| Error::InvalidValue)?;
        pairing_data.pres[0] = u8::from(Command::PairingResponse);
        pairing_data.pres[1..7].copy_from_slice(response);
        ops.try_send_packet(packet)?;

        if pairing_data.secure_connections {
            return Ok(Step::WaitingPublicKey);
        }

        // Legacy: generate the key material we will distribute.
        if pairing_data.want_bonding() && pairing_data.local_r_key.encryption_key() {
            let mut ltk_bytes = [0u8; 16];
            rng.fill_bytes(&mut ltk_bytes);
            pairing_data.long_term_key =
                LongTermKey::from_le_bytes(ltk_bytes).mask_to_key_size(pairing_data.negotiated_key_size());
            pairing_data.ediv = rng.gen();
            rng.fill_bytes(&mut pairing_data.rand);
        }

        match pairing_data.pairing_method {
            PairingMethod::JustWorks => {
                pairing_data.tk = 0;
                Ok(Step::WaitingConfirm)
            }
            PairingMethod::PassKeyEntry { responder, .. } => {
                if responder == PassKeyEntryAction::Display {
                    pairing_data.tk = rng.sample(rand::distributions::Uniform::new_inclusive(0u32, 999999)) as u128;
                    ops.try_send_security_event(SecurityEvent::PassKeyDisplay(PassKey(pairing_data.tk as u32)))?;
                    Ok(Step::WaitingConfirm)
                } else {
                    ops.try_send_security_event(SecurityEvent::PassKeyInput)?;
                    Ok(Step::WaitingTk(None))
                }
            }
            PairingMethod::OutOfBand => {
                ops.try_send_security_event(SecurityEvent::OobRequest)?;
                Ok(Step::WaitingTk(None))
            }
            PairingMethod::NumericComparison => Err(Error::Security(Reason::AuthenticationRequirements)),
        }
    }

    fn send_sconfirm<P: PacketPool, OPS: PairingOps<P>, RNG: RngCore>(
        ops: &mut OPS,
        pairing_data: &mut PairingData,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        let mut srand = [0u8; 16];
        rng.fill_bytes(&mut srand);
        pairing_data.local_nonce = Nonce(u128::from_be_bytes(srand));

        let sconfirm = crypto::c1(
            pairing_data.tk,
            pairing_data.local_nonce.0,
            &pairing_data.preq,
            &pairing_data.pres,
            pairing_data.iat(),
            &pairing_data.ia(),
            pairing_data.rat(),
            &pairing_data.ra(),
        );

        let mut packet = prepare_packet(Command::PairingConfirm)?;
        packet.payload_mut().copy_from_slice(&sconfirm.to_le_bytes());
        ops.try_send_packet(packet)?;
        Ok(())
    }

    fn handle_legacy_random<P: PacketPool, OPS: PairingOps<P>>(
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        let mrand: [u8; 16] = payload
            .try_into()
            .map_err(|_| Error::Security(Reason::InvalidParameters))?;
        pairing_data.peer_nonce = Nonce(u128::from_le_bytes(mrand));

        let expected_mconfirm = crypto::c1(
            pairing_data.tk,
            pairing_data.peer_nonce.0,
            &pairing_data.preq,
            &pairing_data.pres,
            pairing_data.iat(),
            &pairing_data.ia(),
            pairing_data.rat(),
            &pairing_data.ra(),
        );
        if expected_mconfirm != pairing_data.peer_confirm {
            error!("[smp] Legacy confirm value mismatch");
            return Err(Error::Security(Reason::ConfirmValueFailed));
        }

        let packet = make_pairing_random(&pairing_data.local_nonce)?;
        ops.try_send_packet(packet)?;

        let stk = crypto::s1(pairing_data.tk, pairing_data.local_nonce.0, pairing_data.peer_nonce.0);
        let stk = LongTermKey(stk).mask_to_key_size(pairing_data.negotiated_key_size());

        let bond = ops.try_enable_encryption(
            &stk,
            pairing_data.pairing_method.security_level(),
            false,
            0,
            [0; 8],
        )?;
        pairing_data.bond_information = Some(bond);

        Ok(Step::WaitingLinkEncrypted)
    }

    fn handle_public_key<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
        rng: &mut RNG,
    ) -> Result<Step, Error> {
        let peer_public_key = PublicKey::from_bytes(payload);
        if !peer_public_key.is_on_curve() {
            error!("[smp] Peer public key is not on the P-256 curve");
            return Err(Error::Security(Reason::AuthenticationRequirements));
        }

        let secret_key = SecretKey::new(rng);
        let public_key = secret_key.public_key();
        if peer_public_key == public_key {
            error!("[smp] Peer reflected our public key");
            return Err(Error::Security(Reason::AuthenticationRequirements));
        }
        let dh_key = secret_key
            .dh_key(peer_public_key)
            .ok_or(Error::Security(Reason::AuthenticationRequirements))?;

        pairing_data.peer_public_key = Some(peer_public_key);
        pairing_data.local_public_key = Some(public_key);
        pairing_data.private_key = Some(secret_key);
        pairing_data.dh_key = Some(dh_key);

        let packet = make_public_key_packet(&public_key)?;
        ops.try_send_packet(packet)?;

        match pairing_data.pairing_method {
            PairingMethod::JustWorks | PairingMethod::NumericComparison => {
                pairing_data.local_secret_rb = 0;
                pairing_data.peer_secret_ra = 0;
                pairing_data.local_nonce = Nonce::new(rng);
                let confirm = pairing_data.local_nonce.f4(
                    pairing_data.local_public_key.as_ref().ok_or(Error::InvalidValue)?.x(),
                    pairing_data.peer_public_key.as_ref().ok_or(Error::InvalidValue)?.x(),
                    0,
                );
                let packet = make_confirm_packet(&confirm)?;
                ops.try_send_packet(packet)?;
                Ok(Step::WaitingNonce)
            }
            PairingMethod::PassKeyEntry { responder, .. } => {
                if responder == PassKeyEntryAction::Display {
                    let passkey: u32 = rng.sample(rand::distributions::Uniform::new_inclusive(0u32, 999999));
                    pairing_data.local_secret_rb = passkey as u128;
                    pairing_data.peer_secret_ra = pairing_data.local_secret_rb;
                    ops.try_send_security_event(SecurityEvent::PassKeyDisplay(PassKey(passkey)))?;
                    Ok(Step::WaitingPassKeyEntryConfirm(0))
                } else {
                    ops.try_send_security_event(SecurityEvent::PassKeyInput)?;
                    Ok(Step::WaitingPassKeyInput(None))
                }
            }
            PairingMethod::OutOfBand => {
                pairing_data.local_secret_rb = 0;
                ops.try_send_security_event(SecurityEvent::OobRequest)?;
                Ok(Step::WaitingOobData)
            }
        }
    }

    fn handle_nonce<P: PacketPool, OPS: PairingOps<P>>(
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        pairing_data.peer_nonce = Nonce(u128::from_le_bytes(
            payload
                .try_into()
                .map_err(|_| Error::Security(Reason::InvalidParameters))?,
        ));

        let packet = make_pairing_random(&pairing_data.local_nonce)?;
        ops.try_send_packet(packet)?;

        match pairing_data.pairing_method {
            PairingMethod::NumericComparison => {
                let peer_public_key = pairing_data.peer_public_key.ok_or(Error::InvalidValue)?;
                let local_public_key = pairing_data.local_public_key.ok_or(Error::InvalidValue)?;
                let vb = pairing_data
                    .peer_nonce
                    .g2(peer_public_key.x(), local_public_key.x(), &pairing_data.local_nonce);
                info!("[smp] Numeric comparison value {}", vb);
                ops.try_send_security_event(SecurityEvent::PassKeyConfirm(PassKey(vb)))?;
                Ok(Step::WaitingUserConfirm(None))
            }
            PairingMethod::JustWorks => {
                if matches!(
                    pairing_data.config.io_capabilities,
                    IoCapabilities::DisplayYesNo | IoCapabilities::KeyboardDisplay
                ) {
                    ops.try_send_security_event(SecurityEvent::ConsentRequest)?;
                    Ok(Step::WaitingUserConfirm(None))
                } else {
                    Ok(Step::WaitingDhKeyCheck)
                }
            }
            PairingMethod::OutOfBand => Ok(Step::WaitingDhKeyCheck),
            PairingMethod::PassKeyEntry { .. } => Err(Error::InvalidState),
        }
    }

    fn handle_pass_key_confirm<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        round: u8,
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
        rng: &mut RNG,
    ) -> Result<Step, Error> {
        pairing_data.peer_confirm = u128::from_le_bytes(
            payload
                .try_into()
                .map_err(|_| Error::Security(Reason::InvalidParameters))?,
        );
        pairing_data.local_nonce = Nonce::new(rng);
        let z = 0x80 | (((pairing_data.local_secret_rb >> round) & 1) as u8);
        let confirm = pairing_data.local_nonce.f4(
            pairing_data.local_public_key.ok_or(Error::InvalidValue)?.x(),
            pairing_data.peer_public_key.ok_or(Error::InvalidValue)?.x(),
            z,
        );
        let packet = make_confirm_packet(&confirm)?;
        ops.try_send_packet(packet)?;
        Ok(Step::WaitingPassKeyEntryRandom(round))
    }

    fn handle_pass_key_random<P: PacketPool, OPS: PairingOps<P>>(
        round: u8,
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        pairing_data.peer_nonce = Nonce(u128::from_le_bytes(
            payload
                .try_into()
                .map_err(|_| Error::Security(Reason::InvalidParameters))?,
        ));
        let z = 0x80 | (((pairing_data.peer_secret_ra >> round) & 1) as u8);
        let expected = pairing_data.peer_nonce.f4(
            pairing_data.peer_public_key.ok_or(Error::InvalidValue)?.x(),
            pairing_data.local_public_key.ok_or(Error::InvalidValue)?.x(),
            z,
        );
        if Confirm(pairing_data.peer_confirm) != expected {
            error!("[smp] Passkey commitment mismatch in round {}", round);
            return Err(Error::Security(Reason::ConfirmValueFailed));
        }

        let packet = make_pairing_random(&pairing_data.local_nonce)?;
        ops.try_send_packet(packet)?;

        if round + 1 >= constants::PASSKEY_ENTRY_ROUNDS {
            Ok(Step::WaitingDhKeyCheck)
        } else {
            Ok(Step::WaitingPassKeyEntryConfirm(round + 1))
        }
    }

    fn handle_dhkey_check<P: PacketPool, OPS: PairingOps<P>>(
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        let (mac_key, ltk) = {
            let dh_key = pairing_data.dh_key.as_ref().ok_or(Error::InvalidValue)?;
            dh_key.f5(
                pairing_data.peer_nonce,
                pairing_data.local_nonce,
                pairing_data.peer_address,
                pairing_data.local_address,
            )
        };

        let expected = mac_key
            .f6(
                pairing_data.peer_nonce,
                pairing_data.local_nonce,
                pairing_data.local_secret_rb,
                pairing_data.peer_features.as_io_cap(),
                pairing_data.peer_address,
                pairing_data.local_address,
            )
            .0
            .to_le_bytes();
        if expected != payload {
            return Err(Error::Security(Reason::DHKeyCheckFailed));
        }

        let eb = mac_key.f6(
            pairing_data.local_nonce,
            pairing_data.peer_nonce,
            pairing_data.peer_secret_ra,
            pairing_data.local_features.as_io_cap(),
            pairing_data.local_address,
            pairing_data.peer_address,
        );
        let packet = make_dhkey_check_packet(&eb)?;
        ops.try_send_packet(packet)?;

        pairing_data.mac_key = Some(mac_key);
        pairing_data.long_term_key = ltk.mask_to_key_size(pairing_data.negotiated_key_size());

        let bond = ops.try_enable_encryption(
            &pairing_data.long_term_key,
            pairing_data.pairing_method.security_level(),
            pairing_data.want_bonding(),
            0,
            [0; 8],
        )?;
        pairing_data.bond_information = Some(bond);

        Ok(Step::WaitingLinkEncrypted)
    }

    /// Link is encrypted: distribute our keys, then receive the
    /// initiator's, then open the delayed-authorization window.
    fn start_key_distribution<P: PacketPool, OPS: PairingOps<P>>(
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        pairing_data.update_masks_on_encrypted();
        Self::send_local_keys(ops, pairing_data)?;
        Self::advance_distribution(ops, pairing_data)
    }

    fn send_local_keys<P: PacketPool, OPS: PairingOps<P>>(
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<(), Error> {
        while let Some(key) = pairing_data.local_r_key.next_key() {
            match key {
                KeyDistributionFlags::ENCRYPTION_KEY => {
                    ops.try_send_packet(make_encryption_information_packet(&pairing_data.long_term_key)?)?;
                    ops.try_send_packet(make_central_identification_packet(
                        pairing_data.ediv,
                        &pairing_data.rand,
                    )?)?;
                    if let Some(bond) = pairing_data.bond_information.as_mut() {
                        bond.ltk = pairing_data.long_term_key;
                        bond.ediv = pairing_data.ediv;
                        bond.rand = pairing_data.rand;
                        bond.is_bonded = true;
                    }
                }
                KeyDistributionFlags::IDENTITY_KEY => {
                    ops.try_send_packet(make_identity_information_packet(&pairing_data.config.local_irk)?)?;
                    ops.try_send_packet(make_identity_address_information_packet(&pairing_data.local_address)?)?;
                }
                KeyDistributionFlags::SIGNING_KEY => {
                    ops.try_send_packet(make_signing_information_packet(&pairing_data.config.local_csrk)?)?;
                }
                _ => {}
            }
            pairing_data.local_r_key.clear(key);
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

        if pairing_data.derive_lk {
            let link_key = derive_link_key(&pairing_data.long_term_key, pairing_data.ct2);
            debug!("[smp] Derived BR/EDR link key from LTK");
            ops.try_send_security_event(SecurityEvent::LinkKeyDerived(link_key))?;
            pairing_data.derive_lk = false;
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
        let next = match (stage, command.command) {
            (KeyStage::EncryptionInformation, Command::EncryptionInformation) => {
                // The bond keeps our own distributed LTK; the central's
                // key is only used by the central for re-encryption.
                let _ = LongTermKey::from_le_bytes(payload.try_into().map_err(|_| Error::InvalidValue)?);
                trace!("[smp] Received LTK from central");
                Step::ReceivingKeys(KeyStage::CentralIdentification)
            }
            (KeyStage::CentralIdentification, Command::CentralIdentification) => {
                if payload.len() < 10 {
                    return Err(Error::Security(Reason::InvalidParameters));
                }
                pairing_data.local_i_key.clear(KeyDistributionFlags::ENCRYPTION_KEY);
                return Self::advance_distribution(ops, pairing_data);
            }
            (KeyStage::IdentityInformation, Command::IdentityInformation) => {
                let irk = IdentityResolvingKey::from_le_bytes(payload.try_into().map_err(|_| Error::InvalidValue)?);
                if let Some(bond) = pairing_data.bond_information.as_mut() {
                    bond.identity.irk = Some(irk);
                }
                Step::ReceivingKeys(KeyStage::IdentityAddressInformation)
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
                pairing_data.local_i_key.clear(KeyDistributionFlags::IDENTITY_KEY);
                return Self::advance_distribution(ops, pairing_data);
            }
            (KeyStage::SigningInformation, Command::SigningInformation) => {
                let csrk = SigningKey::from_le_bytes(payload.try_into().map_err(|_| Error::InvalidValue)?);
                if let Some(bond) = pairing_data.bond_information.as_mut() {
                    bond.peer_csrk = Some(csrk);
                }
                pairing_data.local_i_key.clear(KeyDistributionFlags::SIGNING_KEY);
                return Self::advance_distribution(ops, pairing_data);
            }
            _ => return Err(Error::InvalidState),
        };
        Ok(next)
    }
}

#[cfg(test)]
impl Pairing {
    pub(crate) fn distribution_masks(&self) -> (u8, u8) {
        let data = self.pairing_data.borrow();
        (data.local_i_key.into(), data.local_r_key.into())
    }
}
