//! Pairing state machines
//!
//! One state machine per role, driven by received SMP commands and by
//! completion events (encryption started, user input, timer expiry). The
//! machines never perform IO themselves; everything goes through
//! [`PairingOps`].

use embassy_time::Instant;
use rand_core::{CryptoRng, RngCore};

use crate::security_manager::crypto::{IdentityResolvingKey, LongTermKey, SigningKey};
use crate::security_manager::types::{BondingFlag, Command, SecurityLevel};
use crate::security_manager::{BondInformation, SecurityEvent, TxPacket};
use crate::{Address, Error, IoCapabilities, PacketPool, Reason};

pub mod central;
pub mod peripheral;
pub(crate) mod util;

pub use util::PairingMethod;

/// Operations the pairing state machines perform through their host.
///
/// The cooperative model of the engine: a handler runs to completion and
/// parks in a waiting state; anything that needs the controller, the
/// application or a timer is requested through this trait and the answer
/// comes back later as a [`Event`].
pub trait PairingOps<P: PacketPool> {
    /// Queue an SMP PDU for transmission on the link.
    fn try_send_packet(&mut self, packet: TxPacket<P>) -> Result<(), Error>;
    /// Ask the controller to start (or accept) encryption with the given
    /// key. Completion is reported back as [`Event::LinkEncrypted`].
    fn try_enable_encryption(
        &mut self,
        ltk: &LongTermKey,
        security_level: SecurityLevel,
        bonded: bool,
        ediv: u16,
        rand: [u8; 8],
    ) -> Result<BondInformation, Error>;
    /// Update the stored bond after key distribution amended it.
    fn try_update_bond_information(&mut self, bond: &BondInformation) -> Result<(), Error>;
    /// Deliver an event to the application surface.
    fn try_send_security_event(&mut self, event: SecurityEvent) -> Result<(), Error>;
    /// Arm the one-shot delayed-authorization timer. Expiry is reported
    /// back as [`Event::DelayedAuthExpired`]. At most one firing is
    /// pending at a time.
    fn schedule_delayed_auth(&mut self) -> Result<(), Error>;
    /// Bonding flag the local host requests.
    fn bonding_flag(&mut self) -> BondingFlag;
}

/// Completion events delivered to a parked state machine.
pub enum Event {
    /// The controller reports link encryption established.
    LinkEncrypted,
    /// The user confirmed the numeric comparison value or gave consent.
    PassKeyConfirm,
    /// The user rejected the numeric comparison value or denied consent.
    PassKeyCancel,
    /// The user entered a passkey.
    PassKeyInput(u32),
    /// Out-of-band pairing material arrived: the peer randomizer and,
    /// when the OOB channel carried one, the peer commitment.
    OobData {
        /// Peer randomizer.
        ra: u128,
        /// Peer commitment over its own public key.
        confirm: Option<u128>,
    },
    /// The delayed-authorization timer fired.
    DelayedAuthExpired,
}

/// Local pairing policy and key material.
#[derive(Clone, Copy)]
pub struct PairingConfig {
    /// Local IO capabilities.
    pub io_capabilities: IoCapabilities,
    /// Advertise LE Secure Connections support.
    pub secure_connections: bool,
    /// Refuse every pairing that does not end in an authenticated
    /// Secure Connections key.
    pub secure_connections_only: bool,
    /// Smallest encryption key size accepted, 7..=16.
    pub minimum_encryption_key_size: u8,
    /// Identity Resolving Key distributed with the ID key.
    pub local_irk: IdentityResolvingKey,
    /// Connection Signature Resolving Key distributed with the CSRK key.
    pub local_csrk: SigningKey,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            io_capabilities: IoCapabilities::NoInputNoOutput,
            secure_connections: true,
            secure_connections_only: false,
            minimum_encryption_key_size: 7,
            local_irk: IdentityResolvingKey(0),
            local_csrk: SigningKey(0),
        }
    }
}

/// An in-progress pairing, in either role.
pub enum Pairing {
    /// Initiator role.
    Central(central::Pairing),
    /// Responder role.
    Peripheral(peripheral::Pairing),
}

impl Pairing {
    pub(crate) fn is_central(&self) -> bool {
        matches!(self, Pairing::Central(_))
    }

    pub(crate) fn new_central(local_address: Address, peer_address: Address, config: PairingConfig) -> Pairing {
        Pairing::Central(central::Pairing::new_idle(local_address, peer_address, config))
    }

    pub(crate) fn initiate_central<P: PacketPool, OPS: PairingOps<P>>(
        local_address: Address,
        peer_address: Address,
        ops: &mut OPS,
        config: PairingConfig,
    ) -> Result<Self, Error> {
        Ok(Pairing::Central(central::Pairing::initiate(
            local_address,
            peer_address,
            ops,
            config,
        )?))
    }

    pub(crate) fn new_peripheral(local_address: Address, peer_address: Address, config: PairingConfig) -> Pairing {
        Pairing::Peripheral(peripheral::Pairing::new(local_address, peer_address, config))
    }

    pub(crate) fn initiate_peripheral<P: PacketPool, OPS: PairingOps<P>>(
        local_address: Address,
        peer_address: Address,
        ops: &mut OPS,
        config: PairingConfig,
    ) -> Result<Self, Error> {
        Ok(Pairing::Peripheral(peripheral::Pairing::initiate(
            local_address,
            peer_address,
            ops,
            config,
        )?))
    }

    pub(crate) fn handle_l2cap_command<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        &self,
        command: Command,
        payload: &[u8],
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        match self {
            Pairing::Central(central) => central.handle_l2cap_command(command, payload, ops, rng),
            Pairing::Peripheral(peripheral) => peripheral.handle_l2cap_command(command, payload, ops, rng),
        }
    }

    pub(crate) fn handle_event<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        &self,
        event: Event,
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        match self {
            Pairing::Central(central) => central.handle_event(event, ops, rng),
            Pairing::Peripheral(peripheral) => peripheral.handle_event(event, ops, rng),
        }
    }

    /// Peer sent Pairing Failed; terminate without answering.
    pub(crate) fn handle_peer_failure<P: PacketPool, OPS: PairingOps<P>>(
        &self,
        reason: Reason,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        match self {
            Pairing::Central(central) => central.handle_peer_failure(reason, ops),
            Pairing::Peripheral(peripheral) => peripheral.handle_peer_failure(reason, ops),
        }
    }

    pub(crate) fn security_level(&self) -> SecurityLevel {
        match self {
            Pairing::Central(c) => c.security_level(),
            Pairing::Peripheral(p) => p.security_level(),
        }
    }

    pub(crate) fn peer_address(&self) -> Address {
        match self {
            Pairing::Central(central) => central.peer_address(),
            Pairing::Peripheral(per) => per.peer_address(),
        }
    }

    pub(crate) fn timeout_at(&self) -> Instant {
        match self {
            Pairing::Central(c) => c.timeout_at(),
            Pairing::Peripheral(p) => p.timeout_at(),
        }
    }

    pub(crate) fn reset_timeout(&self) {
        match self {
            Pairing::Central(c) => c.reset_timeout(),
            Pairing::Peripheral(p) => p.reset_timeout(),
        }
    }

    pub(crate) fn mark_timeout(&self) {
        match self {
            Pairing::Central(c) => c.mark_timeout(),
            Pairing::Peripheral(p) => p.mark_timeout(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use rand_chacha::{ChaCha12Core, ChaCha12Rng};
    use rand_core::SeedableRng;

    use super::*;
    use crate::security_manager::crypto::PublicKey;
    use crate::security_manager::types::PassKey;
    use crate::{Packet, Reason};

    #[derive(Debug)]
    pub(crate) struct TestPacket(pub(crate) heapless::Vec<u8, 128>);

    impl AsRef<[u8]> for TestPacket {
        fn as_ref(&self) -> &[u8] {
            self.0.as_slice()
        }
    }

    impl AsMut<[u8]> for TestPacket {
        fn as_mut(&mut self) -> &mut [u8] {
            self.0.as_mut_slice()
        }
    }

    impl Packet for TestPacket {}

    #[derive(Debug)]
    pub(crate) struct HeaplessPool;

    impl PacketPool for HeaplessPool {
        type Packet = TestPacket;
        const MTU: usize = 128;

        fn allocate() -> Option<Self::Packet> {
            let mut ret = TestPacket(heapless::Vec::new());
            ret.0.resize(Self::MTU, 0).unwrap();
            Some(ret)
        }

        fn capacity() -> usize {
            isize::MAX as usize
        }
    }

    #[derive(Default)]
    pub(crate) struct TestOps<const N: usize> {
        pub(crate) sent_packets: heapless::Vec<TxPacket<HeaplessPool>, N>,
        pub(crate) encryptions: heapless::Vec<LongTermKey, 4>,
        pub(crate) security_events: heapless::Vec<SecurityEvent, 16>,
        pub(crate) delayed_auth_scheduled: usize,
    }

    impl<const N: usize> PairingOps<HeaplessPool> for TestOps<N> {
        fn try_send_packet(&mut self, packet: TxPacket<HeaplessPool>) -> Result<(), Error> {
            self.sent_packets.push(packet).map_err(|_| Error::OutOfMemory)
        }

        fn try_enable_encryption(
            &mut self,
            ltk: &LongTermKey,
            security_level: SecurityLevel,
            bonded: bool,
            ediv: u16,
            rand: [u8; 8],
        ) -> Result<BondInformation, Error> {
            self.encryptions.push(*ltk).map_err(|_| Error::OutOfMemory)?;
            Ok(BondInformation {
                identity: crate::Identity::default(),
                ltk: *ltk,
                security_level,
                is_bonded: bonded,
                ediv,
                rand,
                peer_csrk: None,
            })
        }

        fn try_update_bond_information(&mut self, _bond: &BondInformation) -> Result<(), Error> {
            Ok(())
        }

        fn try_send_security_event(&mut self, event: SecurityEvent) -> Result<(), Error> {
            self.security_events.push(event).map_err(|_| Error::OutOfMemory)
        }

        fn schedule_delayed_auth(&mut self) -> Result<(), Error> {
            self.delayed_auth_scheduled += 1;
            Ok(())
        }

        fn bonding_flag(&mut self) -> BondingFlag {
            BondingFlag::Bonding
        }
    }

    impl<const N: usize> TestOps<N> {
        fn completed(&self) -> Option<SecurityLevel> {
            self.security_events.iter().find_map(|event| match event {
                SecurityEvent::PairingComplete { security_level, .. } => Some(*security_level),
                _ => None,
            })
        }

        fn numeric_value(&self) -> Option<PassKey> {
            self.security_events.iter().find_map(|event| match event {
                SecurityEvent::PassKeyConfirm(value) => Some(*value),
                _ => None,
            })
        }

        fn wants_pass_key_input(&self) -> bool {
            self.security_events
                .iter()
                .any(|event| matches!(event, SecurityEvent::PassKeyInput))
        }

        fn displayed_pass_key(&self) -> Option<PassKey> {
            self.security_events.iter().find_map(|event| match event {
                SecurityEvent::PassKeyDisplay(value) => Some(*value),
                _ => None,
            })
        }
    }

    /// Deliver every not-yet-delivered packet in both directions until
    /// the link is quiet. Returns the first state machine error.
    fn try_pump(
        central: &central::Pairing,
        peripheral: &peripheral::Pairing,
        central_ops: &mut TestOps<100>,
        peripheral_ops: &mut TestOps<100>,
        central_delivered: &mut usize,
        peripheral_delivered: &mut usize,
        rng: &mut ChaCha12Rng,
    ) -> Result<(), Error> {
        let mut progress = true;
        let mut loop_cnt = 0;
        while progress {
            progress = false;
            while *central_delivered < central_ops.sent_packets.len() {
                let packet = &central_ops.sent_packets[*central_delivered];
                let (command, payload) = (packet.command(), packet.payload());
                let mut buffer = [0u8; 64];
                buffer[..payload.len()].copy_from_slice(payload);
                let payload = &buffer[..payload.len()];
                *central_delivered += 1;
                peripheral.handle_l2cap_command::<HeaplessPool, _, _>(command, payload, peripheral_ops, rng)?;
                progress = true;
            }
            while *peripheral_delivered < peripheral_ops.sent_packets.len() {
                let packet = &peripheral_ops.sent_packets[*peripheral_delivered];
                let (command, payload) = (packet.command(), packet.payload());
                let mut buffer = [0u8; 64];
                buffer[..payload.len()].copy_from_slice(payload);
                let payload = &buffer[..payload.len()];
                *peripheral_delivered += 1;
                central.handle_l2cap_command::<HeaplessPool, _, _>(command, payload, central_ops, rng)?;
                progress = true;
            }
            loop_cnt += 1;
            if loop_cnt > 10000 {
                panic!("Too many loops");
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn pump(
        central: &central::Pairing,
        peripheral: &peripheral::Pairing,
        central_ops: &mut TestOps<100>,
        peripheral_ops: &mut TestOps<100>,
        central_delivered: &mut usize,
        peripheral_delivered: &mut usize,
        rng: &mut ChaCha12Rng,
    ) {
        try_pump(
            central,
            peripheral,
            central_ops,
            peripheral_ops,
            central_delivered,
            peripheral_delivered,
            rng,
        )
        .unwrap();
    }

    fn finish_after_encryption(
        central: &central::Pairing,
        peripheral: &peripheral::Pairing,
        central_ops: &mut TestOps<100>,
        peripheral_ops: &mut TestOps<100>,
        central_delivered: &mut usize,
        peripheral_delivered: &mut usize,
        rng: &mut ChaCha12Rng,
    ) {
        assert_eq!(central_ops.encryptions.len(), 1);
        assert_eq!(peripheral_ops.encryptions.len(), 1);
        assert_eq!(central_ops.encryptions[0], peripheral_ops.encryptions[0]);

        peripheral
            .handle_event::<HeaplessPool, _, _>(Event::LinkEncrypted, peripheral_ops, rng)
            .unwrap();
        central
            .handle_event::<HeaplessPool, _, _>(Event::LinkEncrypted, central_ops, rng)
            .unwrap();
        pump(
            central,
            peripheral,
            central_ops,
            peripheral_ops,
            central_delivered,
            peripheral_delivered,
            rng,
        );

        assert_eq!(central_ops.delayed_auth_scheduled, 1);
        assert_eq!(peripheral_ops.delayed_auth_scheduled, 1);
        assert_eq!(central.distribution_masks(), (0, 0));
        assert_eq!(peripheral.distribution_masks(), (0, 0));

        central
            .handle_event::<HeaplessPool, _, _>(Event::DelayedAuthExpired, central_ops, rng)
            .unwrap();
        peripheral
            .handle_event::<HeaplessPool, _, _>(Event::DelayedAuthExpired, peripheral_ops, rng)
            .unwrap();
    }

    #[test]
    fn sc_just_works() {
        let central_address = Address::random([0xff, 2, 2, 3, 4, 5]);
        let peripheral_address = Address::random([0xff, 1, 2, 3, 4, 5]);
        let mut central_ops: TestOps<100> = TestOps::default();
        let mut peripheral_ops: TestOps<100> = TestOps::default();
        let mut rng: ChaCha12Rng = ChaCha12Core::seed_from_u64(1).into();

        let peripheral = peripheral::Pairing::new(peripheral_address, central_address, PairingConfig::default());
        let central = central::Pairing::initiate::<HeaplessPool, _>(
            central_address,
            peripheral_address,
            &mut central_ops,
            PairingConfig::default(),
        )
        .unwrap();

        let (mut cd, mut pd) = (0, 0);
        pump(&central, &peripheral, &mut central_ops, &mut peripheral_ops, &mut cd, &mut pd, &mut rng);
        finish_after_encryption(
            &central,
            &peripheral,
            &mut central_ops,
            &mut peripheral_ops,
            &mut cd,
            &mut pd,
            &mut rng,
        );

        assert_eq!(central_ops.completed(), Some(SecurityLevel::Encrypted));
        assert_eq!(peripheral_ops.completed(), Some(SecurityLevel::Encrypted));
    }

    #[test]
    fn sc_numeric_comparison() {
        let central_address = Address::random([0xff, 2, 2, 3, 4, 5]);
        let peripheral_address = Address::random([0xff, 1, 2, 3, 4, 5]);
        let mut central_ops: TestOps<100> = TestOps::default();
        let mut peripheral_ops: TestOps<100> = TestOps::default();
        let mut rng: ChaCha12Rng = ChaCha12Core::seed_from_u64(2).into();
        let config = PairingConfig {
            io_capabilities: IoCapabilities::DisplayYesNo,
            ..Default::default()
        };

        let peripheral = peripheral::Pairing::new(peripheral_address, central_address, config);
        let central = central::Pairing::initiate::<HeaplessPool, _>(
            central_address,
            peripheral_address,
            &mut central_ops,
            config,
        )
        .unwrap();

        let (mut cd, mut pd) = (0, 0);
        pump(&central, &peripheral, &mut central_ops, &mut peripheral_ops, &mut cd, &mut pd, &mut rng);

        let central_value = central_ops.numeric_value().unwrap();
        let peripheral_value = peripheral_ops.numeric_value().unwrap();
        assert_eq!(central_value, peripheral_value);

        central
            .handle_event::<HeaplessPool, _, _>(Event::PassKeyConfirm, &mut central_ops, &mut rng)
            .unwrap();
        peripheral
            .handle_event::<HeaplessPool, _, _>(Event::PassKeyConfirm, &mut peripheral_ops, &mut rng)
            .unwrap();
        pump(&central, &peripheral, &mut central_ops, &mut peripheral_ops, &mut cd, &mut pd, &mut rng);
        finish_after_encryption(
            &central,
            &peripheral,
            &mut central_ops,
            &mut peripheral_ops,
            &mut cd,
            &mut pd,
            &mut rng,
        );

        assert_eq!(central_ops.completed(), Some(SecurityLevel::EncryptedAuthenticated));
        assert_eq!(peripheral_ops.completed(), Some(SecurityLevel::EncryptedAuthenticated));
    }

    #[test]
    fn sc_numeric_comparison_rejected_by_user() {
        let central_address = Address::random([0xff, 2, 2, 3, 4, 5]);
        let peripheral_address = Address::random([0xff, 1, 2, 3, 4, 5]);
        let mut central_ops: TestOps<100> = TestOps::default();
        let mut peripheral_ops: TestOps<100> = TestOps::default();
        let mut rng: ChaCha12Rng = ChaCha12Core::seed_from_u64(12).into();
        let config = PairingConfig {
            io_capabilities: IoCapabilities::DisplayYesNo,
            ..Default::default()
        };

        let peripheral = peripheral::Pairing::new(peripheral_address, central_address, config);
        let central = central::Pairing::initiate::<HeaplessPool, _>(
            central_address,
            peripheral_address,
            &mut central_ops,
            config,
        )
        .unwrap();

        let (mut cd, mut pd) = (0, 0);
        pump(&central, &peripheral, &mut central_ops, &mut peripheral_ops, &mut cd, &mut pd, &mut rng);

        let result = central.handle_event::<HeaplessPool, _, _>(Event::PassKeyCancel, &mut central_ops, &mut rng);
        assert!(matches!(
            result,
            Err(Error::Security(Reason::NumericComparisonFailed))
        ));
        assert!(central_ops
            .security_events
            .iter()
            .any(|e| matches!(e, SecurityEvent::PairingFailed(Reason::NumericComparisonFailed))));
    }

    #[test]
    fn sc_pass_key_entry_twenty_rounds() {
        let central_address = Address::random([0xff, 2, 2, 3, 4, 5]);
        let peripheral_address = Address::random([0xff, 1, 2, 3, 4, 5]);
        let mut central_ops: TestOps<100> = TestOps::default();
        let mut peripheral_ops: TestOps<100> = TestOps::default();
        let mut rng: ChaCha12Rng = ChaCha12Core::seed_from_u64(3).into();
        let config = PairingConfig {
            io_capabilities: IoCapabilities::KeyboardOnly,
            ..Default::default()
        };

        let peripheral = peripheral::Pairing::new(peripheral_address, central_address, config);
        let central = central::Pairing::initiate::<HeaplessPool, _>(
            central_address,
            peripheral_address,
            &mut central_ops,
            config,
        )
        .unwrap();

        let (mut cd, mut pd) = (0, 0);
        pump(&central, &peripheral, &mut central_ops, &mut peripheral_ops, &mut cd, &mut pd, &mut rng);

        assert!(central_ops.wants_pass_key_input());
        assert!(peripheral_ops.wants_pass_key_input());

        central
            .handle_event::<HeaplessPool, _, _>(Event::PassKeyInput(123456), &mut central_ops, &mut rng)
            .unwrap();
        peripheral
            .handle_event::<HeaplessPool, _, _>(Event::PassKeyInput(123456), &mut peripheral_ops, &mut rng)
            .unwrap();
        pump(&central, &peripheral, &mut central_ops, &mut peripheral_ops, &mut cd, &mut pd, &mut rng);

        // 20 commitment/nonce rounds on each side plus the feature,
        // key and check traffic.
        assert!(central_ops.sent_packets.len() > 40);
        finish_after_encryption(
            &central,
            &peripheral,
            &mut central_ops,
            &mut peripheral_ops,
            &mut cd,
            &mut pd,
            &mut rng,
        );

        assert_eq!(central_ops.completed(), Some(SecurityLevel::EncryptedAuthenticated));
        assert_eq!(peripheral_ops.completed(), Some(SecurityLevel::EncryptedAuthenticated));
    }

    #[test]
    fn sc_pass_key_entry_wrong_key_fails() {
        let central_address = Address::random([0xff, 2, 2, 3, 4, 5]);
        let peripheral_address = Address::random([0xff, 1, 2, 3, 4, 5]);
        let mut central_ops: TestOps<100> = TestOps::default();
        let mut peripheral_ops: TestOps<100> = TestOps::default();
        let mut rng: ChaCha12Rng = ChaCha12Core::seed_from_u64(4).into();
        let config = PairingConfig {
            io_capabilities: IoCapabilities::KeyboardOnly,
            ..Default::default()
        };

        let peripheral = peripheral::Pairing::new(peripheral_address, central_address, config);
        let central = central::Pairing::initiate::<HeaplessPool, _>(
            central_address,
            peripheral_address,
            &mut central_ops,
            config,
        )
        .unwrap();

        let (mut cd, mut pd) = (0, 0);
        pump(&central, &peripheral, &mut central_ops, &mut peripheral_ops, &mut cd, &mut pd, &mut rng);

        central
            .handle_event::<HeaplessPool, _, _>(Event::PassKeyInput(123456), &mut central_ops, &mut rng)
            .unwrap();
        peripheral
            .handle_event::<HeaplessPool, _, _>(Event::PassKeyInput(654321), &mut peripheral_ops, &mut rng)
            .unwrap();

        // The mismatch surfaces in the very first commitment round.
        let result = try_pump(
            &central,
            &peripheral,
            &mut central_ops,
            &mut peripheral_ops,
            &mut cd,
            &mut pd,
            &mut rng,
        );
        assert!(matches!(result, Err(Error::Security(Reason::ConfirmValueFailed))));
    }

    #[test]
    fn legacy_just_works() {
        let central_address = Address::random([0xff, 2, 2, 3, 4, 5]);
        let peripheral_address = Address::random([0xff, 1, 2, 3, 4, 5]);
        let mut central_ops: TestOps<100> = TestOps::default();
        let mut peripheral_ops: TestOps<100> = TestOps::default();
        let mut rng: ChaCha12Rng = ChaCha12Core::seed_from_u64(5).into();
        let config = PairingConfig {
            secure_connections: false,
            ..Default::default()
        };

        let peripheral = peripheral::Pairing::new(peripheral_address, central_address, config);
        let central = central::Pairing::initiate::<HeaplessPool, _>(
            central_address,
            peripheral_address,
            &mut central_ops,
            config,
        )
        .unwrap();

        let (mut cd, mut pd) = (0, 0);
        pump(&central, &peripheral, &mut central_ops, &mut peripheral_ops, &mut cd, &mut pd, &mut rng);
        finish_after_encryption(
            &central,
            &peripheral,
            &mut central_ops,
            &mut peripheral_ops,
            &mut cd,
            &mut pd,
            &mut rng,
        );

        assert_eq!(central_ops.completed(), Some(SecurityLevel::Encrypted));
        assert_eq!(peripheral_ops.completed(), Some(SecurityLevel::Encrypted));

        // The central keeps the LTK the responder distributed.
        let central_bond = central_ops
            .security_events
            .iter()
            .find_map(|event| match event {
                SecurityEvent::PairingComplete { bond: Some(bond), .. } => Some(bond.clone()),
                _ => None,
            })
            .unwrap();
        let peripheral_bond = peripheral_ops
            .security_events
            .iter()
            .find_map(|event| match event {
                SecurityEvent::PairingComplete { bond: Some(bond), .. } => Some(bond.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(central_bond.ltk, peripheral_bond.ltk);
        assert_eq!(central_bond.ediv, peripheral_bond.ediv);
        assert_eq!(central_bond.rand, peripheral_bond.rand);
    }

    #[test]
    fn legacy_pass_key_entry() {
        let central_address = Address::random([0xff, 2, 2, 3, 4, 5]);
        let peripheral_address = Address::random([0xff, 1, 2, 3, 4, 5]);
        let mut central_ops: TestOps<100> = TestOps::default();
        let mut peripheral_ops: TestOps<100> = TestOps::default();
        let mut rng: ChaCha12Rng = ChaCha12Core::seed_from_u64(6).into();

        // Peripheral displays, central enters.
        let peripheral = peripheral::Pairing::new(
            peripheral_address,
            central_address,
            PairingConfig {
                secure_connections: false,
                io_capabilities: IoCapabilities::DisplayOnly,
                ..Default::default()
            },
        );
        let central = central::Pairing::initiate::<HeaplessPool, _>(
            central_address,
            peripheral_address,
            &mut central_ops,
            PairingConfig {
                secure_connections: false,
                io_capabilities: IoCapabilities::KeyboardOnly,
                ..Default::default()
            },
        )
        .unwrap();

        let (mut cd, mut pd) = (0, 0);
        pump(&central, &peripheral, &mut central_ops, &mut peripheral_ops, &mut cd, &mut pd, &mut rng);

        let pass_key = peripheral_ops.displayed_pass_key().unwrap();
        assert!(central_ops.wants_pass_key_input());
        central
            .handle_event::<HeaplessPool, _, _>(Event::PassKeyInput(pass_key.value()), &mut central_ops, &mut rng)
            .unwrap();
        pump(&central, &peripheral, &mut central_ops, &mut peripheral_ops, &mut cd, &mut pd, &mut rng);
        finish_after_encryption(
            &central,
            &peripheral,
            &mut central_ops,
            &mut peripheral_ops,
            &mut cd,
            &mut pd,
            &mut rng,
        );

        assert_eq!(central_ops.completed(), Some(SecurityLevel::EncryptedAuthenticated));
        assert_eq!(peripheral_ops.completed(), Some(SecurityLevel::EncryptedAuthenticated));
    }

    #[test]
    fn reflected_public_key_fails() {
        let central_address = Address::random([0xff, 2, 2, 3, 4, 5]);
        let peripheral_address = Address::random([0xff, 1, 2, 3, 4, 5]);
        let mut central_ops: TestOps<100> = TestOps::default();
        let mut rng: ChaCha12Rng = ChaCha12Core::seed_from_u64(7).into();

        let central = central::Pairing::initiate::<HeaplessPool, _>(
            central_address,
            peripheral_address,
            &mut central_ops,
            PairingConfig::default(),
        )
        .unwrap();

        central
            .handle_l2cap_command::<HeaplessPool, _, _>(
                Command::PairingResponse,
                &[0x03, 0, 0x09, 16, 0x0f, 0x0f],
                &mut central_ops,
                &mut rng,
            )
            .unwrap();

        // Echo the central's own public key back at it.
        let own_key: heapless::Vec<u8, 64> =
            heapless::Vec::from_slice(central_ops.sent_packets[1].payload()).unwrap();
        let packets_before = central_ops.sent_packets.len();
        let result = central.handle_l2cap_command::<HeaplessPool, _, _>(
            Command::PairingPublicKey,
            &own_key,
            &mut central_ops,
            &mut rng,
        );
        assert!(matches!(
            result,
            Err(Error::Security(Reason::AuthenticationRequirements))
        ));
        // No further protocol PDU after the failure.
        assert_eq!(central_ops.sent_packets.len(), packets_before);
    }

    #[test]
    fn off_curve_public_key_fails() {
        let central_address = Address::random([0xff, 2, 2, 3, 4, 5]);
        let peripheral_address = Address::random([0xff, 1, 2, 3, 4, 5]);
        let mut central_ops: TestOps<100> = TestOps::default();
        let mut rng: ChaCha12Rng = ChaCha12Core::seed_from_u64(8).into();

        let central = central::Pairing::initiate::<HeaplessPool, _>(
            central_address,
            peripheral_address,
            &mut central_ops,
            PairingConfig::default(),
        )
        .unwrap();

        central
            .handle_l2cap_command::<HeaplessPool, _, _>(
                Command::PairingResponse,
                &[0x03, 0, 0x09, 16, 0x0f, 0x0f],
                &mut central_ops,
                &mut rng,
            )
            .unwrap();

        let mut tampered: heapless::Vec<u8, 64> =
            heapless::Vec::from_slice(central_ops.sent_packets[1].payload()).unwrap();
        tampered[32] ^= 0x01;
        assert!(!PublicKey::from_bytes(&tampered).is_on_curve());

        let result = central.handle_l2cap_command::<HeaplessPool, _, _>(
            Command::PairingPublicKey,
            &tampered,
            &mut central_ops,
            &mut rng,
        );
        assert!(matches!(
            result,
            Err(Error::Security(Reason::AuthenticationRequirements))
        ));
    }
}
