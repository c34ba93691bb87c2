#![no_std]
#![allow(clippy::needless_lifetimes)]
#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

use bt_hci::param::{AddrKind, BdAddr};

mod fmt;

mod codec;
pub mod config;

pub mod avdtp;
pub mod security_manager;

pub use security_manager::{
    BondInformation, IdentityResolvingKey, LongTermKey, PassKey, Reason, SecurityEvent, SecurityLevel,
};
pub use security_manager::types::IoCapabilities;

/// A Bluetooth device address together with its address type.
///
/// Every Bluetooth device is identified by a 48-bit *Bluetooth Device
/// Address*. For LE the address is either *Public* (IEEE assigned) or
/// *Random*; the distinction matters to the pairing cryptography, which
/// mixes the address type into the key derivation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Address {
    /// Address type.
    pub kind: AddrKind,
    /// Address value.
    pub addr: BdAddr,
}

impl Address {
    /// Create a new random address.
    pub fn random(val: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::RANDOM,
            addr: BdAddr::new(val),
        }
    }

    /// Create a new public address.
    pub fn public(val: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::PUBLIC,
            addr: BdAddr::new(val),
        }
    }

    /// Address type octet followed by the six address octets, most
    /// significant first. This is the `A`/`B` operand layout of the
    /// `f5` and `f6` toolbox functions.
    pub fn to_bytes(&self) -> [u8; 7] {
        let mut bytes = [0; 7];
        bytes[0] = self.kind.into_inner();
        let mut addr_bytes = self.addr.into_inner();
        addr_bytes.reverse();
        bytes[1..].copy_from_slice(&addr_bytes);
        bytes
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let a = self.addr.into_inner();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[5], a[4], a[3], a[2], a[1], a[0]
        )
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Address {
    fn format(&self, fmt: defmt::Formatter) {
        let a = self.addr.into_inner();
        defmt::write!(
            fmt,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[5],
            a[4],
            a[3],
            a[2],
            a[1],
            a[0]
        )
    }
}

/// Identity of a peer device.
///
/// The identity address together with the Identity Resolving Key the
/// peer distributed, if any. A peer that uses resolvable private
/// addresses is recognized through the IRK rather than the address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Identity {
    /// Random static or public identity address.
    pub bd_addr: BdAddr,
    /// Identity Resolving Key.
    pub irk: Option<IdentityResolvingKey>,
}

impl Identity {
    /// Check whether the given identity matches this identity.
    pub fn match_identity(&self, identity: &Identity) -> bool {
        if self.bd_addr == identity.bd_addr {
            return true;
        }
        matches!((self.irk, identity.irk), (Some(a), Some(b)) if a == b)
    }
}

/// Errors returned by the protocol engines.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Error from the security manager; carries the SMP reason code.
    Security(Reason),
    /// Insufficient space in a buffer or queue.
    InsufficientSpace,
    /// Invalid value.
    InvalidValue,
    /// Invalid channel or endpoint handle.
    InvalidHandle,
    /// Resource not found.
    NotFound,
    /// Invalid state.
    InvalidState,
    /// Out of memory.
    OutOfMemory,
    /// Unsupported operation.
    NotSupported,
    /// Channel closed.
    ChannelClosed,
    /// Operation timed out.
    Timeout,
    /// The engine is busy with a conflicting operation.
    Busy,
    /// The transport was lost.
    Disconnected,
}

impl From<codec::Error> for Error {
    fn from(error: codec::Error) -> Self {
        match error {
            codec::Error::InsufficientSpace => Error::InsufficientSpace,
            codec::Error::InvalidValue => Error::InvalidValue,
        }
    }
}

/// A Packet is a byte buffer for packet data.
/// Similar to a `Vec<u8>` it has a length and a capacity.
pub trait Packet: Sized + AsRef<[u8]> + AsMut<[u8]> {}

/// A Packet Pool that can allocate packets of the desired size.
///
/// The security manager frames its PDUs into packets drawn from a pool so
/// that the surrounding stack can hand them to the transport without
/// copying.
pub trait PacketPool: 'static {
    /// Packet type provided by this pool.
    type Packet: Packet;

    /// The maximum size a packet can have.
    const MTU: usize;

    /// Allocate a new buffer with space for `MTU` bytes.
    /// Return `None` when the allocation can't be fulfilled.
    fn allocate() -> Option<Self::Packet>;

    /// Capacity of this pool in the number of packets.
    fn capacity() -> usize;
}
