//! # rendezvous-punch-core
//!
//! Building blocks for punching a direct UDP path between two peers that
//! each sit behind a NAT, using a shared key-value store to exchange
//! endpoints. The driving state machine lives in the `rendezvous-punch`
//! crate; this crate has the leaves it is built from.
//!
//! - [`socket`] - the one UDP socket a peer punches and talks on
//! - [`store`] - rendezvous store adapters (Redis protocol, in-memory)
//! - [`protocol`] - punch/handshake datagrams and the session-bound
//!   handshake rules
//!
//! ## Handshake datagrams
//!
//! ```rust
//! use rendezvous_punch_core::protocol::{Handshake, HandshakePacket, ProtocolType};
//!
//! let handshake = Handshake::random();
//! let buf = handshake.syn().encode();
//! let packet = HandshakePacket::parse(&buf).unwrap();
//! assert_eq!(packet.kind, ProtocolType::Syn);
//! assert_eq!(packet.session_id, handshake.session_id());
//! ```

pub mod error;
pub mod protocol;
pub mod socket;
pub mod store;
