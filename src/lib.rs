//! RAET: reliable asynchronous event transport over UDP.
//!
//! Named endpoints ("estates") on a shared overlay ("road") exchange
//! authenticated, encrypted messages after two handshakes: a join that
//! establishes mutual long-term identity under an operator acceptance
//! policy, and an allow that agrees a fresh per-session box key. Identity
//! and acceptance survive restarts in a file-backed keep.
//!
//! A [`RoadStack`] owns one UDP socket and makes all progress inside
//! [`RoadStack::service_all`], a single cooperative tick driven by a wall
//! or virtual clock, so stacks compose into any fixed-step scheduler.

mod clock;
mod crypto;
mod error;
mod estate;
mod keep;
mod packet;
mod stack;
mod transaction;

pub use clock::{Store, Timer};
pub use crypto::{Boxer, Privateer, Pubber, Signer, Verfer};
pub use error::{Error, Result};
pub use estate::{Acceptance, AutoMode, Estate, RemoteEstate};
pub use keep::{KeepKind, LocalRecord, RemoteRecord, RoadKeep, RoleRecord};
pub use packet::{
    BodyKind, CoatKind, FootKind, Head, PacketKind, RxPacket, TransKind, MAX_PACKET_SIZE,
    MAX_SEGMENT_COUNT, SEGMENT_SIZE,
};
pub use stack::{RoadStack, StackConfig};
pub use transaction::{Index, Transaction};

/// Default port estates bind and dial.
pub const RAET_PORT: u16 = 7530;
/// Conventional second port for running two stacks on one host.
pub const RAET_TEST_PORT: u16 = 7531;
