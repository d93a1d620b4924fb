//! Local and remote endpoint state.
//!
//! An [`Estate`] is this stack's identity on the road; a [`RemoteEstate`] is
//! everything known about one peer: its long-term keys, the acceptance
//! decision for its role, the uid each side holds for the relationship, and
//! the ephemeral session state that exists only while allowed.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::crypto::{BoxKey, Privateer, Pubber, Signer, Verfer};
use crate::packet::BodyKind;

/// Operator or automatic decision on a role's long-term keys.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acceptance {
    Pending,
    Accepted,
    Rejected,
}

/// New-peer acceptance policy. `Once` is a fuse: it accepts one new role
/// and then demotes itself to `Never`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoMode {
    Never,
    Once,
    Always,
}

/// Next value of a nonzero wrapping counter (session and transaction ids;
/// 0 is reserved for the vacuous join).
pub fn next_nonzero(current: u32) -> u32 {
    match current.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// The local endpoint.
#[derive(Debug)]
pub struct Estate {
    pub name: String,
    pub uid: u32,
    /// Resolved address (wildcard host replaced by loopback).
    pub ha: SocketAddr,
    /// Advertised (bound) address.
    pub aha: SocketAddr,
    pub fqdn: String,
    pub role: String,
    /// Session id counter; nonzero once any session has been opened.
    pub sid: u32,
    pub signer: Signer,
    pub priver: Privateer,
}

impl Estate {
    pub fn next_sid(&mut self) -> u32 {
        self.sid = next_nonzero(self.sid);
        self.sid
    }

    pub fn ver_hex(&self) -> String {
        self.signer.ver_hex()
    }

    pub fn pub_hex(&self) -> String {
        self.priver.pub_hex()
    }
}

/// One peer on the road.
#[derive(Debug)]
pub struct RemoteEstate {
    pub name: String,
    /// Our table handle for this peer.
    pub uid: u32,
    /// The peer's table handle for us; 0 until a join completes.
    pub fuid: u32,
    pub ha: SocketAddr,
    pub fqdn: String,
    pub role: String,
    pub verfer: Option<Verfer>,
    pub pubber: Option<Pubber>,
    pub acceptance: Option<Acceptance>,
    pub joined: Option<bool>,
    pub allowed: Option<bool>,
    /// Peer participates as a hub.
    pub main: bool,
    /// Application-defined peer category.
    pub kind: u8,
    /// Current session id for this relationship.
    pub sid: u32,
    /// Next transaction id we will initiate.
    pub tid: u32,
    /// Body codec the peer declared at join.
    pub bulk: BodyKind,
    /// Our short-term agreement key, present during and after an allow.
    pub privee: Option<Privateer>,
    /// Peer short-term public, present during and after an allow.
    pub publee: Option<Pubber>,
    /// Derived session box key, present only while allowed.
    pub box_key: Option<BoxKey>,
}

impl RemoteEstate {
    /// A vacuous peer: address known, identity to be learned by joining.
    pub fn vacuous(ha: SocketAddr) -> Self {
        RemoteEstate {
            name: String::new(),
            uid: 0,
            fuid: 0,
            ha,
            fqdn: ha.ip().to_string(),
            role: String::new(),
            verfer: None,
            pubber: None,
            acceptance: None,
            joined: None,
            allowed: None,
            main: false,
            kind: 0,
            sid: 0,
            tid: 0,
            bulk: BodyKind::Json,
            privee: None,
            publee: None,
            box_key: None,
        }
    }

    /// A named peer with known long-term keys, e.g. preloaded from config.
    pub fn new(name: &str, ha: SocketAddr, verhex: &str, pubhex: &str) -> crate::Result<Self> {
        let mut remote = Self::vacuous(ha);
        remote.name = name.to_owned();
        remote.role = name.to_owned();
        remote.set_keys(verhex, pubhex)?;
        Ok(remote)
    }

    pub fn next_tid(&mut self) -> u32 {
        self.tid = next_nonzero(self.tid);
        self.tid
    }

    pub fn next_sid(&mut self) -> u32 {
        self.sid = next_nonzero(self.sid);
        self.sid
    }

    pub fn set_keys(&mut self, verhex: &str, pubhex: &str) -> crate::Result<()> {
        self.verfer = Some(Verfer::from_hex(verhex)?);
        self.pubber = Some(Pubber::from_hex(pubhex)?);
        Ok(())
    }

    pub fn ver_hex(&self) -> Option<String> {
        self.verfer.as_ref().map(Verfer::key_hex)
    }

    pub fn pub_hex(&self) -> Option<String> {
        self.pubber.as_ref().map(Pubber::key_hex)
    }

    /// True when the stored identity differs from the presented one.
    pub fn keys_differ(&self, verhex: &str, pubhex: &str) -> bool {
        match (self.ver_hex(), self.pub_hex()) {
            (Some(v), Some(p)) => v != verhex || p != pubhex,
            _ => false,
        }
    }

    /// Drops ephemeral session state, keeping long-term identity. A fresh
    /// allow must run before messages flow again.
    pub fn rekey(&mut self) {
        self.privee = None;
        self.publee = None;
        self.box_key = None;
        self.allowed = None;
    }

    /// Forgets the session entirely, forcing a rejoin.
    pub fn unjoin(&mut self) {
        self.rekey();
        self.joined = None;
        self.fuid = 0;
        self.sid = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:7530".parse().unwrap()
    }

    #[test]
    fn nonzero_counters_wrap_past_zero() {
        assert_eq!(next_nonzero(0), 1);
        assert_eq!(next_nonzero(1), 2);
        assert_eq!(next_nonzero(u32::MAX), 1);
    }

    #[test]
    fn estate_next_sid_skips_vacuous() {
        let mut local = Estate {
            name: "main".into(),
            uid: 1,
            ha: addr(),
            aha: addr(),
            fqdn: "127.0.0.1".into(),
            role: "main".into(),
            sid: u32::MAX,
            signer: Signer::new(),
            priver: Privateer::new(),
        };
        assert_eq!(local.next_sid(), 1);
        assert_eq!(local.next_sid(), 2);
    }

    #[test]
    fn rekey_preserves_identity() {
        let signer = Signer::new();
        let priver = Privateer::new();
        let mut remote =
            RemoteEstate::new("other", addr(), &signer.ver_hex(), &priver.pub_hex()).unwrap();
        remote.joined = Some(true);
        remote.allowed = Some(true);
        remote.privee = Some(Privateer::new());
        remote.publee = Some(priver.pubber());
        remote.box_key = Some(Privateer::new().shared(&priver.pubber()));

        remote.rekey();
        assert_eq!(remote.joined, Some(true));
        assert_eq!(remote.allowed, None);
        assert!(remote.privee.is_none());
        assert!(remote.box_key.is_none());
        assert_eq!(remote.ver_hex().unwrap(), signer.ver_hex());
    }

    #[test]
    fn keys_differ_detects_change() {
        let signer = Signer::new();
        let priver = Privateer::new();
        let remote =
            RemoteEstate::new("other", addr(), &signer.ver_hex(), &priver.pub_hex()).unwrap();
        assert!(!remote.keys_differ(&signer.ver_hex(), &priver.pub_hex()));
        assert!(remote.keys_differ(&Signer::new().ver_hex(), &priver.pub_hex()));

        // a vacuous remote has no stored keys to differ from
        let vacant = RemoteEstate::vacuous(addr());
        assert!(!vacant.keys_differ(&signer.ver_hex(), &priver.pub_hex()));
    }
}
