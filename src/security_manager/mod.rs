//! # Security manager
//!
//! LE pairing per Bluetooth Core [Vol 3] Part H: the SMP wire codec, the
//! pairing state machines (legacy and Secure Connections) and the bond
//! store. The manager is sans-IO; the surrounding stack feeds it
//! received PDUs and completion events and supplies the transport,
//! controller and timer glue through [`SecurityManagerOps`].

pub mod br;
pub(crate) mod constants;
pub mod crypto;
mod pairing;
pub mod types;

use core::cell::RefCell;

use bt_hci::param::LeConnRole;
use embassy_time::{Duration, Instant};
use heapless::Vec;
use rand_chacha::ChaCha12Rng;
use rand_core::SeedableRng;

pub use crypto::{IdentityResolvingKey, LinkKey, LongTermKey, SigningKey};
pub use pairing::{Event, PairingConfig, PairingOps};
use pairing::Pairing;
pub use types::{PassKey, Reason, SecurityLevel};
use types::{BondingFlag, Command};

use crate::{Address, Error, Identity, Packet, PacketPool};

/// An SMP PDU framed for the transport: opcode followed by the payload.
pub struct Pdu<P> {
    packet: P,
    len: usize,
}

impl<P: Packet> Pdu<P> {
    pub(crate) fn new(packet: P, len: usize) -> Self {
        Self { packet, len }
    }

    /// PDU length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the PDU is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<P: Packet> AsRef<[u8]> for Pdu<P> {
    fn as_ref(&self) -> &[u8] {
        &self.packet.as_ref()[..self.len]
    }
}

/// Packet structure for sending security manager protocol commands
pub struct TxPacket<P: PacketPool> {
    /// Underlying packet
    packet: P::Packet,
    /// Command to send
    command: Command,
}

impl<P: PacketPool> TxPacket<P> {
    /// Size of the command octet.
    const HEADER_SIZE: usize = 1;

    /// Frame a command into a packet from the pool.
    pub fn new(mut packet: P::Packet, command: Command) -> Result<Self, Error> {
        if P::MTU < Self::HEADER_SIZE + command.payload_size() as usize {
            return Err(Error::InsufficientSpace);
        }
        packet.as_mut()[0] = command.into();
        Ok(Self { packet, command })
    }

    /// Command of this packet.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Command payload.
    pub fn payload(&self) -> &[u8] {
        &self.packet.as_ref()[Self::HEADER_SIZE..Self::HEADER_SIZE + usize::from(self.command.payload_size())]
    }

    /// Mutable command payload.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.packet.as_mut()[Self::HEADER_SIZE..Self::HEADER_SIZE + usize::from(self.command.payload_size())]
    }

    /// Total framed size.
    pub fn total_size(&self) -> usize {
        usize::from(self.command.payload_size()) + Self::HEADER_SIZE
    }

    /// Finish into a PDU for the transport.
    pub fn into_pdu(self) -> Pdu<P::Packet> {
        let len = self.total_size();
        Pdu::new(self.packet, len)
    }
}

/// Bond information resulting from a pairing.
#[derive(Clone, Debug, PartialEq)]
pub struct BondInformation {
    /// Peer identity.
    pub identity: Identity,
    /// Long Term Key.
    pub ltk: LongTermKey,
    /// Security level the key authenticates.
    pub security_level: SecurityLevel,
    /// Whether the keys are to be stored.
    pub is_bonded: bool,
    /// EDIV of the LTK (legacy pairing only).
    pub ediv: u16,
    /// Rand of the LTK (legacy pairing only).
    pub rand: [u8; 8],
    /// Signature resolving key the peer distributed.
    pub peer_csrk: Option<SigningKey>,
}

impl core::fmt::Display for BondInformation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Identity {:?} LTK {}", self.identity, self.ltk)
    }
}

/// Events delivered to the application surface.
#[derive(Clone, Debug, PartialEq)]
pub enum SecurityEvent {
    /// Show this passkey to the user; the peer will enter it.
    PassKeyDisplay(PassKey),
    /// Ask the user to enter the passkey shown by the peer; answer with
    /// [`SecurityManager::handle_pass_key_input`].
    PassKeyInput,
    /// Show this value and ask the user whether the peer shows the
    /// same; answer with [`SecurityManager::handle_pass_key_confirm`].
    PassKeyConfirm(PassKey),
    /// Ask the user to consent to unauthenticated pairing.
    ConsentRequest,
    /// Out-of-band pairing material is required; answer with
    /// [`SecurityManager::handle_oob_data`].
    OobRequest,
    /// Locally generated out-of-band material is ready to be handed to
    /// the peer over the OOB channel.
    LocalOobDataReady {
        /// Randomizer.
        random: u128,
        /// Commitment over the local public key.
        confirm: u128,
    },
    /// Pairing finished successfully.
    PairingComplete {
        /// Security level of the resulting key.
        security_level: SecurityLevel,
        /// Bond to persist, when bonding was negotiated.
        bond: Option<BondInformation>,
    },
    /// Pairing ended in failure.
    PairingFailed(Reason),
    /// A BR/EDR link key was derived from the LE LTK.
    LinkKeyDerived(LinkKey),
}

/// Transport, controller and timer glue supplied by the surrounding
/// stack.
pub trait SecurityManagerOps<P: PacketPool> {
    /// Deliver an SMP PDU to the link's security manager channel.
    fn try_write_pdu(&mut self, pdu: Pdu<P::Packet>) -> Result<(), Error>;
    /// Ask the controller to start (central) or accept (peripheral)
    /// encryption with this key. Report completion back through
    /// [`SecurityManager::handle_link_encrypted`].
    fn try_enable_encryption(&mut self, ltk: &LongTermKey) -> Result<(), Error>;
    /// Deliver an event to the application.
    fn try_send_event(&mut self, event: SecurityEvent) -> Result<(), Error>;
    /// Arm the one-shot delayed-authorization timer; report expiry
    /// through [`SecurityManager::handle_delayed_auth_timeout`]. At most
    /// one firing is pending.
    fn schedule_delayed_auth(&mut self, duration: Duration) -> Result<(), Error>;
}

/// Security manager state.
struct SecurityManagerData<const BOND_COUNT: usize> {
    local_address: Option<Address>,
    bond: Vec<BondInformation, BOND_COUNT>,
    random_generator_seeded: bool,
}

/// Security manager handling one pairing at a time.
pub struct SecurityManager<const BOND_COUNT: usize = { crate::config::SMP_BOND_COUNT }> {
    rng: RefCell<ChaCha12Rng>,
    state: RefCell<SecurityManagerData<BOND_COUNT>>,
    pairing_sm: RefCell<Option<Pairing>>,
    config: RefCell<PairingConfig>,
    bonding: RefCell<BondingFlag>,
}

impl<const BOND_COUNT: usize> SecurityManager<BOND_COUNT> {
    /// Create a new security manager.
    pub fn new(config: PairingConfig) -> Self {
        Self {
            rng: RefCell::new(ChaCha12Rng::from_seed([0u8; 32])),
            state: RefCell::new(SecurityManagerData {
                local_address: None,
                bond: Vec::new(),
                random_generator_seeded: false,
            }),
            pairing_sm: RefCell::new(None),
            config: RefCell::new(config),
            bonding: RefCell::new(BondingFlag::Bonding),
        }
    }

    /// Seed the random generator from a cryptographically secure
    /// source. Required before any pairing traffic is processed.
    pub fn set_random_generator_seed(&self, random_seed: [u8; 32]) {
        self.rng.replace(ChaCha12Rng::from_seed(random_seed));
        self.state.borrow_mut().random_generator_seeded = true;
    }

    /// Set the local device address.
    pub fn set_local_address(&self, address: Address) {
        self.state.borrow_mut().local_address = Some(address);
    }

    /// Replace the pairing policy.
    pub fn set_pairing_config(&self, config: PairingConfig) {
        self.config.replace(config);
    }

    /// Request or refuse bonding in future pairings.
    pub fn set_bonding(&self, bonding: bool) {
        self.bonding.replace(if bonding {
            BondingFlag::Bonding
        } else {
            BondingFlag::NoBonding
        });
    }

    /// Look up the long term key stored for a peer.
    pub fn get_peer_long_term_key(&self, identity: &Identity) -> Option<LongTermKey> {
        trace!("[security manager] Find long term key for {:?}", identity);
        self.state.borrow().bond.iter().find_map(|bond| {
            if bond.identity.match_identity(identity) {
                Some(bond.ltk)
            } else {
                None
            }
        })
    }

    /// Add or replace a bond.
    pub fn add_bond_information(&self, bond_information: BondInformation) -> Result<(), Error> {
        trace!("[security manager] Add bond for {:?}", bond_information.identity);
        let index = self
            .state
            .borrow()
            .bond
            .iter()
            .position(|bond| bond_information.identity.match_identity(&bond.identity));
        match index {
            Some(index) => {
                self.state.borrow_mut().bond[index] = bond_information;
                Ok(())
            }
            None => self
                .state
                .borrow_mut()
                .bond
                .push(bond_information)
                .map_err(|_| Error::OutOfMemory),
        }
    }

    /// Remove a bond.
    pub fn remove_bond_information(&self, identity: Identity) -> Result<(), Error> {
        trace!("[security manager] Remove bond for {:?}", identity);
        let index = self
            .state
            .borrow_mut()
            .bond
            .iter()
            .position(|bond| bond.identity.match_identity(&identity));
        match index {
            Some(index) => {
                self.state.borrow_mut().bond.remove(index);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Get the stored bonds.
    pub fn get_bond_information(&self) -> Vec<BondInformation, BOND_COUNT> {
        Vec::from_slice(self.state.borrow().bond.as_slice()).unwrap()
    }

    /// Start pairing on a link. The peripheral role sends a Security
    /// Request; the central role sends the Pairing Request directly.
    pub fn initiate<P: PacketPool, OPS: SecurityManagerOps<P>>(
        &self,
        role: LeConnRole,
        peer_address: Address,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        if !self.state.borrow().random_generator_seeded {
            error!("[security manager] Random generator not seeded");
            return Err(Error::InvalidState);
        }
        let local_address = self.state.borrow().local_address.ok_or(Error::InvalidValue)?;
        let config = *self.config.borrow();
        let mut pairing_sm = self.pairing_sm.borrow_mut();
        if pairing_sm.is_some() {
            return Err(Error::Busy);
        }
        let mut pairing_ops = PairingOpsImpl {
            security_manager: self,
            ops,
            peer_address,
        };
        *pairing_sm = Some(if role == LeConnRole::Central {
            Pairing::initiate_central::<P, _>(local_address, peer_address, &mut pairing_ops, config)?
        } else {
            Pairing::initiate_peripheral::<P, _>(local_address, peer_address, &mut pairing_ops, config)?
        });
        Ok(())
    }

    /// Process an SMP PDU received from the transport.
    pub fn handle_l2cap_command<P: PacketPool, OPS: SecurityManagerOps<P>>(
        &self,
        role: LeConnRole,
        peer_address: Address,
        data: &[u8],
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let Some((&opcode, payload)) = data.split_first() else {
            warn!("[security manager] Empty PDU dropped");
            return Ok(());
        };

        let command = match Command::try_from(opcode) {
            Ok(command) => command,
            Err(_) => {
                warn!("[security manager] Unknown opcode {}", opcode);
                return self.reject(Reason::CommandNotSupported, ops);
            }
        };

        // A truncated Pairing Failed must not be answered, to avoid a
        // failure loop with a broken peer.
        if command == Command::PairingFailed {
            let reason = match payload.first() {
                Some(&code) => Reason::try_from(code).unwrap_or(Reason::UnspecifiedReason),
                None => {
                    warn!("[security manager] Truncated Pairing Failed");
                    Reason::InvalidParameters
                }
            };
            {
                let pairing_sm = self.pairing_sm.borrow();
                if let Some(sm) = pairing_sm.as_ref() {
                    let mut pairing_ops = PairingOpsImpl {
                        security_manager: self,
                        ops,
                        peer_address,
                    };
                    sm.handle_peer_failure::<P, _>(reason, &mut pairing_ops)?;
                }
            }
            self.pairing_sm.replace(None);
            return Ok(());
        }

        if usize::from(command.payload_size()) != payload.len() {
            warn!("[security manager] Payload size mismatch for {}", command);
            return self.reject(Reason::InvalidParameters, ops);
        }

        if !self.state.borrow().random_generator_seeded {
            error!("[security manager] Random generator not seeded");
            return self.reject(Reason::PairingNotSupported, ops);
        }

        {
            let mut pairing_sm = self.pairing_sm.borrow_mut();
            if pairing_sm.is_none() {
                // Only a procedure-initiating command may allocate a
                // pairing; anything else out of context is dropped.
                let start = (role == LeConnRole::Peripheral && command == Command::PairingRequest)
                    || (role == LeConnRole::Central && command == Command::SecurityRequest);
                if !start {
                    warn!("[security manager] Dropping {} without a pairing in progress", command);
                    return Ok(());
                }
                let local_address = self.state.borrow().local_address.ok_or(Error::InvalidValue)?;
                let config = *self.config.borrow();
                *pairing_sm = Some(if role == LeConnRole::Peripheral {
                    Pairing::new_peripheral(local_address, peer_address, config)
                } else {
                    Pairing::new_central(local_address, peer_address, config)
                });
            }
        }

        let result = {
            let pairing_sm = self.pairing_sm.borrow();
            let sm = pairing_sm.as_ref().ok_or(Error::InvalidState)?;
            if sm.is_central() != (role == LeConnRole::Central) {
                return Err(Error::InvalidState);
            }
            if sm.peer_address() != peer_address {
                warn!("[security manager] Dropping {} from unexpected peer", command);
                return Ok(());
            }

            let mut pairing_ops = PairingOpsImpl {
                security_manager: self,
                ops,
                peer_address,
            };
            let mut rng = self.rng.borrow_mut();
            let result = sm.handle_l2cap_command::<P, _, _>(command, payload, &mut pairing_ops, &mut *rng);
            drop(rng);
            if result.is_ok() {
                sm.reset_timeout();
            } else if let Err(e) = self.handle_security_error(&result, ops) {
                error!("[security manager] Failed sending pairing failed message! {:?}", e);
            }
            result
        };
        if result.is_err() {
            // Terminal failure: return to idle so a fresh pairing can
            // start.
            self.pairing_sm.replace(None);
        }
        result
    }

    /// The controller reports that link encryption is established.
    pub fn handle_link_encrypted<P: PacketPool, OPS: SecurityManagerOps<P>>(
        &self,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        self.handle_event(Event::LinkEncrypted, ops)
    }

    /// The delayed-authorization timer fired.
    pub fn handle_delayed_auth_timeout<P: PacketPool, OPS: SecurityManagerOps<P>>(
        &self,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        self.handle_event(Event::DelayedAuthExpired, ops)
    }

    /// The user entered a passkey.
    pub fn handle_pass_key_input<P: PacketPool, OPS: SecurityManagerOps<P>>(
        &self,
        input: u32,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        self.handle_event(Event::PassKeyInput(input), ops)
    }

    /// The user answered the numeric comparison or consent prompt.
    pub fn handle_pass_key_confirm<P: PacketPool, OPS: SecurityManagerOps<P>>(
        &self,
        confirmed: bool,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let event = if confirmed {
            Event::PassKeyConfirm
        } else {
            Event::PassKeyCancel
        };
        self.handle_event(event, ops)
    }

    /// Out-of-band pairing material arrived from the application.
    pub fn handle_oob_data<P: PacketPool, OPS: SecurityManagerOps<P>>(
        &self,
        ra: u128,
        confirm: Option<u128>,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        self.handle_event(Event::OobData { ra, confirm }, ops)
    }

    /// Generate local out-of-band material for the application to hand
    /// to the peer over the OOB channel.
    pub fn local_oob_data<P: PacketPool, OPS: SecurityManagerOps<P>>(&self, ops: &mut OPS) -> Result<(), Error> {
        use crate::security_manager::crypto::{Nonce, SecretKey};
        if !self.state.borrow().random_generator_seeded {
            return Err(Error::InvalidState);
        }
        let mut rng = self.rng.borrow_mut();
        let secret = SecretKey::new(&mut *rng);
        let public = secret.public_key();
        let random = Nonce::new(&mut *rng);
        let confirm = random.f4(public.x(), public.x(), 0);
        drop(rng);
        ops.try_send_event(SecurityEvent::LocalOobDataReady {
            random: random.0,
            confirm: confirm.0,
        })
    }

    /// Deadline at which the pairing in progress times out.
    pub fn timeout_at(&self) -> Instant {
        self.pairing_sm
            .borrow()
            .as_ref()
            .map(|x| x.timeout_at())
            .unwrap_or(Instant::now() + constants::TIMEOUT_DISABLE)
    }

    /// The SMP transaction timer expired; pairing is terminal.
    pub fn handle_timeout<P: PacketPool, OPS: SecurityManagerOps<P>>(&self, ops: &mut OPS) -> Result<(), Error> {
        let active = {
            let pairing_sm = self.pairing_sm.borrow();
            if let Some(pairing) = pairing_sm.as_ref() {
                pairing.mark_timeout();
                true
            } else {
                false
            }
        };
        if active {
            self.pairing_sm.replace(None);
            ops.try_send_event(SecurityEvent::PairingFailed(Reason::UnspecifiedReason))?;
        }
        Ok(())
    }

    /// Security level established by the pairing in progress.
    pub fn security_level(&self) -> SecurityLevel {
        self.pairing_sm
            .borrow()
            .as_ref()
            .map(|x| x.security_level())
            .unwrap_or(SecurityLevel::NoEncryption)
    }

    /// The link dropped; behave as cancellation.
    pub fn disconnect(&self, identity: Option<Identity>) {
        self.pairing_sm.replace(None);
        if let Some(identity) = identity {
            self.state.borrow_mut().bond.retain(|x| !x.identity.match_identity(&identity));
        }
    }

    fn handle_event<P: PacketPool, OPS: SecurityManagerOps<P>>(&self, event: Event, ops: &mut OPS) -> Result<(), Error> {
        let result = {
            let pairing_sm = self.pairing_sm.borrow();
            let Some(sm) = pairing_sm.as_ref() else {
                return Ok(());
            };
            let peer_address = sm.peer_address();
            let mut pairing_ops = PairingOpsImpl {
                security_manager: self,
                ops,
                peer_address,
            };
            let mut rng = self.rng.borrow_mut();
            let result = sm.handle_event::<P, _, _>(event, &mut pairing_ops, &mut *rng);
            drop(rng);
            if result.is_ok() {
                sm.reset_timeout();
            } else if let Err(e) = self.handle_security_error(&result, ops) {
                error!("[security manager] Failed sending pairing failed message! {:?}", e);
            }
            result
        };
        if result.is_err() {
            self.pairing_sm.replace(None);
        }
        result
    }

    fn handle_security_error<P: PacketPool, OPS: SecurityManagerOps<P>>(
        &self,
        result: &Result<(), Error>,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        if let Err(error) = result {
            let reason = if let Error::Security(security_error) = error {
                *security_error
            } else {
                Reason::UnspecifiedReason
            };
            error!("[security manager] Handling of command failed {:?}", error);
            // Cease sending security manager messages on timeout
            if *error != Error::Timeout {
                self.send_pairing_failed(reason, ops)?;
            }
        }
        Ok(())
    }

    fn reject<P: PacketPool, OPS: SecurityManagerOps<P>>(&self, reason: Reason, ops: &mut OPS) -> Result<(), Error> {
        // Malformed input is terminal for the procedure; return to idle.
        self.pairing_sm.replace(None);
        self.send_pairing_failed(reason, ops)?;
        ops.try_send_event(SecurityEvent::PairingFailed(reason))?;
        Err(Error::Security(reason))
    }

    fn send_pairing_failed<P: PacketPool, OPS: SecurityManagerOps<P>>(
        &self,
        reason: Reason,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let packet = P::allocate().ok_or(Error::OutOfMemory)?;
        let mut packet = TxPacket::<P>::new(packet, Command::PairingFailed)?;
        packet.payload_mut()[0] = reason.into();
        ops.try_write_pdu(packet.into_pdu())
    }
}

/// Fixed-depth queue decoupling the security manager from an async
/// event consumer.
///
/// A [`SecurityManagerOps`] implementation can push events here from the
/// receive path while an application task awaits them.
pub struct SecurityEventChannel<const N: usize = 4> {
    events: embassy_sync::channel::Channel<embassy_sync::blocking_mutex::raw::NoopRawMutex, SecurityEvent, N>,
}

impl<const N: usize> Default for SecurityEventChannel<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SecurityEventChannel<N> {
    /// Create an empty channel.
    pub const fn new() -> Self {
        Self {
            events: embassy_sync::channel::Channel::new(),
        }
    }

    /// Push an event; fails when the consumer lags behind.
    pub fn try_send(&self, event: SecurityEvent) -> Result<(), Error> {
        self.events.try_send(event).map_err(|_| Error::OutOfMemory)
    }

    /// Await the next event.
    pub async fn receive(&self) -> SecurityEvent {
        self.events.receive().await
    }

    /// Pop an event without waiting.
    pub fn try_receive(&self) -> Option<SecurityEvent> {
        self.events.try_receive().ok()
    }
}

struct PairingOpsImpl<'sm, 'o, const B: usize, OPS> {
    security_manager: &'sm SecurityManager<B>,
    ops: &'o mut OPS,
    peer_address: Address,
}

impl<'sm, 'o, const B: usize, P: PacketPool, OPS: SecurityManagerOps<P>> PairingOps<P>
    for PairingOpsImpl<'sm, 'o, B, OPS>
{
    fn try_send_packet(&mut self, packet: TxPacket<P>) -> Result<(), Error> {
        trace!("[security manager] Send {}", packet.command());
        self.ops.try_write_pdu(packet.into_pdu())
    }

    fn try_enable_encryption(
        &mut self,
        ltk: &LongTermKey,
        security_level: SecurityLevel,
        bonded: bool,
        ediv: u16,
        rand: [u8; 8],
    ) -> Result<BondInformation, Error> {
        info!("[security manager] Enabling encryption");
        let bond = BondInformation {
            identity: Identity {
                bd_addr: self.peer_address.addr,
                irk: None,
            },
            ltk: *ltk,
            security_level,
            is_bonded: bonded,
            ediv,
            rand,
            peer_csrk: None,
        };
        self.ops.try_enable_encryption(ltk)?;
        Ok(bond)
    }

    fn try_update_bond_information(&mut self, bond: &BondInformation) -> Result<(), Error> {
        self.security_manager.add_bond_information(bond.clone())
    }

    fn try_send_security_event(&mut self, event: SecurityEvent) -> Result<(), Error> {
        self.ops.try_send_event(event)
    }

    fn schedule_delayed_auth(&mut self) -> Result<(), Error> {
        self.ops.schedule_delayed_auth(crate::config::SMP_DELAYED_AUTH_TIMEOUT)
    }

    fn bonding_flag(&mut self) -> BondingFlag {
        *self.security_manager.bonding.borrow()
    }
}

#[cfg(test)]
mod tests {
    use bt_hci::param::LeConnRole;

    use super::*;
    use crate::security_manager::pairing::tests::{HeaplessPool, TestPacket};
    use crate::IoCapabilities;

    #[derive(Default)]
    struct Harness {
        written: heapless::Vec<heapless::Vec<u8, 72>, 16>,
        events: heapless::Vec<SecurityEvent, 8>,
        encryptions: usize,
        delayed: usize,
    }

    impl SecurityManagerOps<HeaplessPool> for Harness {
        fn try_write_pdu(&mut self, pdu: Pdu<TestPacket>) -> Result<(), Error> {
            let copy = heapless::Vec::from_slice(pdu.as_ref()).map_err(|_| Error::InsufficientSpace)?;
            self.written.push(copy).map_err(|_| Error::OutOfMemory)
        }

        fn try_enable_encryption(&mut self, _ltk: &LongTermKey) -> Result<(), Error> {
            self.encryptions += 1;
            Ok(())
        }

        fn try_send_event(&mut self, event: SecurityEvent) -> Result<(), Error> {
            self.events.push(event).map_err(|_| Error::OutOfMemory)
        }

        fn schedule_delayed_auth(&mut self, _duration: Duration) -> Result<(), Error> {
            self.delayed += 1;
            Ok(())
        }
    }

    fn manager() -> SecurityManager<4> {
        let manager = SecurityManager::new(PairingConfig {
            io_capabilities: IoCapabilities::NoInputNoOutput,
            ..Default::default()
        });
        manager.set_random_generator_seed([7u8; 32]);
        manager.set_local_address(Address::random([0xc0, 1, 2, 3, 4, 5]));
        manager
    }

    fn peer() -> Address {
        Address::random([0xc0, 9, 8, 7, 6, 5])
    }

    #[test]
    fn malformed_pairing_random_gets_invalid_parameters() {
        let manager = manager();
        let mut ops = Harness::default();

        manager
            .handle_l2cap_command::<HeaplessPool, _>(
                LeConnRole::Peripheral,
                peer(),
                &[0x01, 0x03, 0x00, 0x08, 16, 0x00, 0x00],
                &mut ops,
            )
            .unwrap();
        assert_eq!(ops.written.len(), 1);
        assert_eq!(ops.written[0][0], 0x02); // Pairing Response

        // Pairing Random with a 15 byte payload.
        let mut truncated = [0u8; 16];
        truncated[0] = 0x04;
        let result = manager.handle_l2cap_command::<HeaplessPool, _>(
            LeConnRole::Peripheral,
            peer(),
            &truncated,
            &mut ops,
        );
        assert!(matches!(result, Err(Error::Security(Reason::InvalidParameters))));
        let failed = ops.written.last().unwrap();
        assert_eq!(failed.as_slice(), &[0x05, 0x0a]);
        assert!(ops
            .events
            .iter()
            .any(|e| matches!(e, SecurityEvent::PairingFailed(Reason::InvalidParameters))));

        // Back in idle: a fresh Pairing Request is accepted.
        manager
            .handle_l2cap_command::<HeaplessPool, _>(
                LeConnRole::Peripheral,
                peer(),
                &[0x01, 0x03, 0x00, 0x08, 16, 0x00, 0x00],
                &mut ops,
            )
            .unwrap();
    }

    #[test]
    fn unknown_opcode_answered_with_command_not_supported() {
        let manager = manager();
        let mut ops = Harness::default();

        let result =
            manager.handle_l2cap_command::<HeaplessPool, _>(LeConnRole::Peripheral, peer(), &[0xab, 0x00], &mut ops);
        assert!(matches!(result, Err(Error::Security(Reason::CommandNotSupported))));
        assert_eq!(ops.written.last().unwrap().as_slice(), &[0x05, 0x07]);
    }

    #[test]
    fn truncated_pairing_failed_not_answered() {
        let manager = manager();
        let mut ops = Harness::default();

        manager
            .handle_l2cap_command::<HeaplessPool, _>(LeConnRole::Peripheral, peer(), &[0x05], &mut ops)
            .unwrap();
        assert!(ops.written.is_empty());
    }

    #[test]
    fn stray_mid_protocol_command_dropped() {
        let manager = manager();
        let mut ops = Harness::default();

        // Pairing Confirm with no pairing in progress: dropped without
        // a reply (no amplification against a buggy peer).
        let mut confirm = [0u8; 17];
        confirm[0] = 0x03;
        manager
            .handle_l2cap_command::<HeaplessPool, _>(LeConnRole::Peripheral, peer(), &confirm, &mut ops)
            .unwrap();
        assert!(ops.written.is_empty());
    }

    #[test]
    fn peer_pairing_failed_terminates_without_reply() {
        let manager = manager();
        let mut ops = Harness::default();

        manager
            .handle_l2cap_command::<HeaplessPool, _>(
                LeConnRole::Peripheral,
                peer(),
                &[0x01, 0x03, 0x00, 0x08, 16, 0x00, 0x00],
                &mut ops,
            )
            .unwrap();
        let written_before = ops.written.len();

        manager
            .handle_l2cap_command::<HeaplessPool, _>(LeConnRole::Peripheral, peer(), &[0x05, 0x03], &mut ops)
            .unwrap();
        assert_eq!(ops.written.len(), written_before);
        assert!(ops
            .events
            .iter()
            .any(|e| matches!(e, SecurityEvent::PairingFailed(Reason::AuthenticationRequirements))));
    }
}
