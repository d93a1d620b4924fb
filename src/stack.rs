//! The road stack: one endpoint's socket, peers, transactions, and keep.
//!
//! A [`RoadStack`] owns its UDP socket exclusively and makes all protocol
//! progress inside [`RoadStack::service_all`], one cooperative tick: drain
//! the socket, step every live transaction against its timers, turn queued
//! outbound messages into messengers, and flush the datagram queue. Nothing
//! blocks and nothing runs on another thread, so several stacks can share a
//! thread by interleaving their service calls.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;

use serde_json::Value;

use crate::clock::Store;
use crate::crypto::{Privateer, Signer};
use crate::error::{Error, Result};
use crate::estate::{next_nonzero, Acceptance, AutoMode, Estate, RemoteEstate};
use crate::keep::{KeepKind, LocalRecord, RemoteRecord, RoadKeep, RoleRecord};
use crate::packet::{self, BodyKind, Head, PacketKind, RxPacket, TransKind, MAX_PACKET_SIZE};
use crate::transaction::{
    self, Allower, Allowent, Index, JoinBody, Joinent, Joiner, Messengent, Messenger, Transaction,
};
use crate::RAET_PORT;

/// Stack construction options. Anything left at its default is either
/// derived (role from name, address from the default port) or restored from
/// an existing keep at `dirpath`.
#[derive(Clone, Debug)]
pub struct StackConfig {
    pub name: String,
    /// Local estate uid; 0 assigns 1.
    pub uid: u32,
    /// Bind address; defaults to all interfaces on [`RAET_PORT`].
    pub ha: Option<SocketAddr>,
    /// Keep base; the keep lives at `<base>/road/keep/<name>`.
    pub basedirpath: Option<PathBuf>,
    /// Full keep directory, overriding `basedirpath`.
    pub dirpath: Option<PathBuf>,
    /// Authorization role; defaults to `name`.
    pub role: Option<String>,
    /// Hex seed for the long-term signing key; fresh when absent.
    pub sigkey: Option<String>,
    /// Hex seed for the long-term agreement key; fresh when absent.
    pub prikey: Option<String>,
    /// New-peer acceptance policy.
    pub auto: AutoMode,
    /// Participates as a hub.
    pub main: bool,
    /// Tolerates changes to stored peer identities.
    pub mutable: bool,
    /// Application-defined estate category.
    pub kind: u8,
    /// On-disk keep codec.
    pub keep_kind: KeepKind,
    /// Wire body codec for messages we send.
    pub bulk: BodyKind,
    /// Injected clock; defaults to the wall clock.
    pub store: Option<Store>,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            name: "stack".into(),
            uid: 0,
            ha: None,
            basedirpath: None,
            dirpath: None,
            role: None,
            sigkey: None,
            prikey: None,
            auto: AutoMode::Never,
            main: false,
            mutable: false,
            kind: 0,
            keep_kind: KeepKind::Json,
            bulk: BodyKind::Json,
            store: None,
        }
    }
}

/// One RAET endpoint on a road.
pub struct RoadStack {
    pub local: Estate,
    /// Next remote uid allocator state.
    pub puid: u32,
    pub main: bool,
    pub mutable: bool,
    pub kind: u8,
    pub bulk: BodyKind,
    pub keep: RoadKeep,
    remotes: BTreeMap<u32, RemoteEstate>,
    names: HashMap<String, u32>,
    addrs: HashMap<SocketAddr, u32>,
    transactions: HashMap<Index, Transaction>,
    rx_msgs: VecDeque<(Value, String)>,
    tx_msgs: VecDeque<(Value, u32, bool)>,
    txes: VecDeque<(Vec<u8>, SocketAddr)>,
    socket: UdpSocket,
    store: Store,
}

impl RoadStack {
    /// Builds a stack, restoring local identity and remotes from the keep
    /// when records exist there.
    pub fn new(cfg: StackConfig) -> Result<Self> {
        let store = cfg.store.clone().unwrap_or_default();
        let name = cfg.name;
        let dirpath = cfg.dirpath.unwrap_or_else(|| {
            cfg.basedirpath
                .unwrap_or_else(|| PathBuf::from("/var/cache/raet"))
                .join("road")
                .join("keep")
                .join(&name)
        });
        let keep = RoadKeep::new(dirpath, &name, cfg.keep_kind, cfg.auto)?;

        let record = keep.load_local()?;
        let (signer, priver, uid, sid, puid, role) = match &record {
            Some(rec) => (
                Signer::from_hex(&rec.sighex)?,
                Privateer::from_hex(&rec.prihex)?,
                rec.uid,
                rec.sid,
                rec.puid,
                rec.role.clone(),
            ),
            None => (
                match cfg.sigkey.as_deref() {
                    Some(seed) => Signer::from_hex(seed)?,
                    None => Signer::new(),
                },
                match cfg.prikey.as_deref() {
                    Some(seed) => Privateer::from_hex(seed)?,
                    None => Privateer::new(),
                },
                if cfg.uid == 0 { 1 } else { cfg.uid },
                0,
                1,
                cfg.role.unwrap_or_else(|| name.clone()),
            ),
        };

        let bind = cfg
            .ha
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], RAET_PORT)));
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        let bound = socket.local_addr()?;
        let ha = if bound.ip().is_unspecified() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
        } else {
            bound
        };
        let aha = SocketAddr::new(bind.ip(), bound.port());

        let local = Estate {
            name: name.clone(),
            uid,
            ha,
            aha,
            fqdn: ha.ip().to_string(),
            role,
            sid,
            signer,
            priver,
        };
        let mut stack = RoadStack {
            local,
            puid,
            main: cfg.main,
            mutable: cfg.mutable,
            kind: cfg.kind,
            bulk: cfg.bulk,
            keep,
            remotes: BTreeMap::new(),
            names: HashMap::new(),
            addrs: HashMap::new(),
            transactions: HashMap::new(),
            rx_msgs: VecDeque::new(),
            tx_msgs: VecDeque::new(),
            txes: VecDeque::new(),
            socket,
            store,
        };
        stack.restore_remotes()?;
        stack.dump_local()?;
        Ok(stack)
    }

    pub fn name(&self) -> &str {
        &self.local.name
    }

    pub(crate) fn name_owned(&self) -> String {
        self.local.name.clone()
    }

    /// Resolved local address (loopback when bound to the wildcard).
    pub fn ha(&self) -> SocketAddr {
        self.local.ha
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn keep_auto(&self) -> AutoMode {
        self.keep.auto
    }

    pub(crate) fn keep_status(
        &mut self,
        role: &str,
        verhex: &str,
        pubhex: &str,
    ) -> Result<Acceptance> {
        let mutable = self.mutable;
        self.keep.status_remote(role, verhex, pubhex, mutable)
    }

    // ------------------------------------------------------------------
    // remotes

    /// Adds a remote, assigning a uid when it carries none.
    pub fn add_remote(&mut self, mut remote: RemoteEstate) -> Result<u32> {
        if remote.uid == 0 {
            remote.uid = self.next_uid();
        }
        let uid = remote.uid;
        if remote.name.is_empty() {
            remote.name = format!("estate.{uid}");
        }
        if self.remotes.contains_key(&uid) || self.names.contains_key(&remote.name) {
            return Err(Error::Duplicate(remote.name));
        }
        if uid > self.puid {
            self.puid = uid;
        }
        self.names.insert(remote.name.clone(), uid);
        self.addrs.insert(remote.ha, uid);
        self.remotes.insert(uid, remote);
        Ok(uid)
    }

    fn next_uid(&mut self) -> u32 {
        loop {
            self.puid = next_nonzero(self.puid);
            if self.puid != self.local.uid && !self.remotes.contains_key(&self.puid) {
                return self.puid;
            }
        }
    }

    /// Removes a remote and every transaction it owns; `clear` also scrubs
    /// its keep record.
    pub fn remove_remote(&mut self, uid: u32, clear: bool) -> Result<()> {
        let remote = self.remotes.remove(&uid).ok_or(Error::UnknownRemote(uid))?;
        self.names.remove(&remote.name);
        self.addrs.remove(&remote.ha);
        self.transactions.retain(|index, _| index.remote != uid);
        if clear {
            self.keep.clear_remote(&remote.name);
        }
        Ok(())
    }

    pub fn remove_all_remotes(&mut self, clear: bool) {
        let uids: Vec<u32> = self.remotes.keys().copied().collect();
        for uid in uids {
            let _ = self.remove_remote(uid, clear);
        }
    }

    pub(crate) fn remove_remote_quiet(&mut self, uid: u32) {
        let _ = self.remove_remote(uid, false);
    }

    pub(crate) fn remote(&self, uid: u32) -> Result<&RemoteEstate> {
        self.remotes.get(&uid).ok_or(Error::UnknownRemote(uid))
    }

    pub(crate) fn remote_mut(&mut self, uid: u32) -> Result<&mut RemoteEstate> {
        self.remotes.get_mut(&uid).ok_or(Error::UnknownRemote(uid))
    }

    pub fn remotes(&self) -> impl Iterator<Item = &RemoteEstate> {
        self.remotes.values()
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    pub fn first_remote_uid(&self) -> Option<u32> {
        self.remotes.keys().next().copied()
    }

    pub fn remote_uid_by_name(&self, name: &str) -> Option<u32> {
        self.names.get(name).copied()
    }

    pub fn remote_by_name(&self, name: &str) -> Option<&RemoteEstate> {
        self.remote_uid_by_name(name)
            .and_then(|uid| self.remotes.get(&uid))
    }

    /// Applies a join's identity tuple to a remote, keeping the name and
    /// address indexes straight.
    pub(crate) fn update_remote_identity(
        &mut self,
        uid: u32,
        body: &JoinBody,
        fuid: u32,
        ha: SocketAddr,
    ) -> Result<()> {
        let (old_name, old_ha) = {
            let remote = self.remote(uid)?;
            (remote.name.clone(), remote.ha)
        };
        if old_name != body.name {
            if let Some(holder) = self.remote_uid_by_name(&body.name) {
                if holder != uid {
                    // a stale namesake from an earlier identity
                    self.remove_remote_quiet(holder);
                }
            }
            self.names.remove(&old_name);
            self.names.insert(body.name.clone(), uid);
        }
        if old_ha != ha {
            self.addrs.remove(&old_ha);
            self.addrs.insert(ha, uid);
        }
        let bulk = BodyKind::try_from(body.bk)?;
        let remote = self.remote_mut(uid)?;
        if remote.keys_differ(&body.verhex, &body.pubhex) {
            // a new identity invalidates any session the old one held
            remote.rekey();
            remote.joined = None;
        }
        remote.name = body.name.clone();
        remote.role = body.role.clone();
        remote.set_keys(&body.verhex, &body.pubhex)?;
        remote.main = body.main;
        remote.kind = body.kind;
        remote.bulk = bulk;
        remote.fuid = fuid;
        remote.ha = ha;
        remote.fqdn = ha.ip().to_string();
        Ok(())
    }

    /// Operator decision: trust the pending remote's role keys.
    pub fn accept_remote(&mut self, uid: u32) -> Result<()> {
        self.decide_remote(uid, Acceptance::Accepted)
    }

    /// Operator decision: reject the pending remote's role keys.
    pub fn reject_remote(&mut self, uid: u32) -> Result<()> {
        self.decide_remote(uid, Acceptance::Rejected)
    }

    fn decide_remote(&mut self, uid: u32, acceptance: Acceptance) -> Result<()> {
        let (role, verhex, pubhex) = {
            let remote = self.remote_mut(uid)?;
            remote.acceptance = Some(acceptance);
            (
                remote.role.clone(),
                remote.ver_hex().unwrap_or_default(),
                remote.pub_hex().unwrap_or_default(),
            )
        };
        self.keep.dump_remote_role(&RoleRecord {
            role,
            acceptance: Some(acceptance),
            verhex,
            pubhex,
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // keep round trips

    pub fn dump_local(&self) -> Result<()> {
        self.keep.dump_local(&LocalRecord {
            name: self.local.name.clone(),
            uid: self.local.uid,
            ha: self.local.ha,
            aha: self.local.aha,
            fqdn: self.local.fqdn.clone(),
            role: self.local.role.clone(),
            sid: self.local.sid,
            puid: self.puid,
            sighex: self.local.signer.key_hex(),
            prihex: self.local.priver.key_hex(),
        })?;
        self.keep.dump_local_role(&RoleRecord {
            role: self.local.role.clone(),
            acceptance: None,
            verhex: self.local.ver_hex(),
            pubhex: self.local.pub_hex(),
        })
    }

    pub fn restore_local(&mut self) -> Result<()> {
        let Some(rec) = self.keep.load_local()? else {
            return Ok(());
        };
        self.local.name = rec.name;
        self.local.uid = rec.uid;
        self.local.role = rec.role;
        self.local.sid = rec.sid;
        self.local.signer = Signer::from_hex(&rec.sighex)?;
        self.local.priver = Privateer::from_hex(&rec.prihex)?;
        self.puid = rec.puid;
        Ok(())
    }

    pub fn dump_remote(&self, uid: u32) -> Result<()> {
        let remote = self.remote(uid)?;
        self.keep.dump_remote(&RemoteRecord {
            name: remote.name.clone(),
            uid: remote.uid,
            fuid: remote.fuid,
            ha: remote.ha,
            fqdn: remote.fqdn.clone(),
            role: remote.role.clone(),
            sid: remote.sid,
            main: remote.main,
            kind: remote.kind,
            joined: remote.joined,
            acceptance: remote.acceptance,
            verhex: remote.ver_hex().unwrap_or_default(),
            pubhex: remote.pub_hex().unwrap_or_default(),
        })
    }

    pub fn dump_remotes(&self) -> Result<()> {
        for uid in self.remotes.keys() {
            self.dump_remote(*uid)?;
        }
        Ok(())
    }

    pub(crate) fn dump_remote_and_role(&mut self, uid: u32) -> Result<()> {
        self.dump_remote(uid)?;
        let (role, acceptance, verhex, pubhex) = {
            let remote = self.remote(uid)?;
            (
                remote.role.clone(),
                remote.acceptance,
                remote.ver_hex().unwrap_or_default(),
                remote.pub_hex().unwrap_or_default(),
            )
        };
        self.keep.dump_remote_role(&RoleRecord {
            role,
            acceptance,
            verhex,
            pubhex,
        })
    }

    /// Loads every persisted remote not already in the table. A restored
    /// remote's session id advances by one so a restarted stack can never
    /// reuse a stale session; `allowed` is runtime-only and starts unset.
    pub fn restore_remotes(&mut self) -> Result<()> {
        for rec in self.keep.load_all_remotes()? {
            if self.remotes.contains_key(&rec.uid) || self.names.contains_key(&rec.name) {
                continue;
            }
            let mut remote = RemoteEstate::vacuous(rec.ha);
            remote.uid = rec.uid;
            remote.fuid = rec.fuid;
            remote.name = rec.name;
            remote.fqdn = rec.fqdn;
            remote.role = rec.role;
            remote.main = rec.main;
            remote.kind = rec.kind;
            remote.joined = rec.joined;
            remote.acceptance = rec.acceptance;
            remote.sid = next_nonzero(rec.sid);
            remote.set_keys(&rec.verhex, &rec.pubhex)?;
            self.add_remote(remote)?;
        }
        Ok(())
    }

    pub fn restore_remotes_clean(&mut self) -> Result<()> {
        self.remove_all_remotes(false);
        self.restore_remotes()
    }

    pub fn clear_all_keeps(&self) {
        self.keep.clear_all();
    }

    // ------------------------------------------------------------------
    // operations

    /// Starts a join with a remote (the first one when `uid` is `None`).
    /// A live joiner for that remote makes this a no-op.
    pub fn join(&mut self, uid: Option<u32>) -> Result<()> {
        let uid = self.resolve_uid(uid)?;
        let live = self.transactions.values().any(|trans| {
            matches!(trans, Transaction::Joiner(_)) && trans.index().remote == uid
        });
        if live {
            return Ok(());
        }
        Joiner::start(self, uid)
    }

    /// Starts a session-key agreement; requires the remote to be joined.
    pub fn allow(&mut self, uid: Option<u32>) -> Result<()> {
        let uid = self.resolve_uid(uid)?;
        let live = self.transactions.values().any(|trans| {
            matches!(trans, Transaction::Allower(_)) && trans.index().remote == uid
        });
        if live {
            return Ok(());
        }
        Allower::start(self, uid)
    }

    /// Queues a message for a remote. Delivery starts on the next service
    /// tick; a remote that is not yet allowed (or joined) is driven through
    /// the missing handshakes first.
    pub fn transmit(&mut self, msg: Value, uid: Option<u32>) -> Result<()> {
        let uid = self.resolve_uid(uid)?;
        self.tx_msgs.push_back((msg, uid, false));
        Ok(())
    }

    fn resolve_uid(&self, uid: Option<u32>) -> Result<u32> {
        match uid {
            Some(uid) => {
                self.remote(uid)?;
                Ok(uid)
            }
            None => self.first_remote_uid().ok_or(Error::UnknownRemote(0)),
        }
    }

    /// Next received message, with the sending remote's name.
    pub fn received(&mut self) -> Option<(Value, String)> {
        self.rx_msgs.pop_front()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// True when nothing is in flight: no live transactions, no queued
    /// messages, no undelivered datagrams.
    pub fn idle(&self) -> bool {
        self.transactions.is_empty() && self.tx_msgs.is_empty() && self.txes.is_empty()
    }

    pub(crate) fn push_tx(&mut self, raw: Vec<u8>, to: SocketAddr) {
        self.txes.push_back((raw, to));
    }

    pub(crate) fn push_rx(&mut self, msg: Value, from: String) {
        self.rx_msgs.push_back((msg, from));
    }

    pub(crate) fn requeue_msg(&mut self, uid: u32, msg: Value) {
        self.tx_msgs.push_back((msg, uid, true));
    }

    pub(crate) fn insert_transaction(&mut self, trans: Transaction) {
        self.transactions.insert(trans.index(), trans);
    }

    // ------------------------------------------------------------------
    // service

    /// One cooperative tick of protocol progress.
    pub fn service_all(&mut self) {
        self.service_receives();
        self.service_transactions();
        self.service_tx_msgs();
        self.service_txes();
    }

    fn service_receives(&mut self) {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => match RxPacket::parse(&buf[..len]) {
                    Ok(pckt) => self.process_rx(pckt, from),
                    Err(err) => {
                        tracing::debug!(
                            "{}: dropping datagram from {}: {}",
                            self.local.name,
                            from,
                            err
                        );
                    }
                },
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    tracing::warn!("{}: socket receive failed: {}", self.local.name, err);
                    break;
                }
            }
        }
    }

    fn process_rx(&mut self, pckt: RxPacket, from: SocketAddr) {
        let (Ok(pk), Ok(tk)) = (pckt.head.packet_kind(), pckt.head.trans_kind()) else {
            return;
        };
        // the owning remote: the destination handle, or on a vacuous join
        // whatever remote we already hold for the source address
        let uid = if pckt.head.de != 0 {
            pckt.head.de
        } else {
            self.addrs.get(&from).copied().unwrap_or(0)
        };
        let index = Index {
            remote: uid,
            rmt: !pckt.head.cf,
            ti: pckt.head.ti,
            kind: tk,
        };
        if let Some(mut trans) = self.transactions.remove(&index) {
            trans.receive(self, &pckt);
            if !trans.done() {
                self.transactions.insert(trans.index(), trans);
            }
            return;
        }

        let outcome = match (pk, tk) {
            (PacketKind::Request, TransKind::Join) => Joinent::correspond(self, &pckt, from),
            (PacketKind::Hello, TransKind::Allow) => Allowent::correspond(self, &pckt, from),
            (PacketKind::Message, TransKind::Message) => Messengent::correspond(self, &pckt, from),
            (PacketKind::Accept, TransKind::Join) => {
                self.re_ack_join(&pckt.head, from);
                Ok(())
            }
            (
                PacketKind::Cookie | PacketKind::Initiate | PacketKind::Resend,
                _,
            ) => {
                // substantive packet for a transaction we no longer hold
                transaction::reply_stateless(self, &pckt.head, from, PacketKind::Nack, false);
                Ok(())
            }
            _ => {
                tracing::debug!(
                    "{}: stale {:?} from {} ignored",
                    self.local.name,
                    pk,
                    from
                );
                Ok(())
            }
        };
        if let Err(err) = outcome {
            tracing::debug!("{}: inbound {:?} dropped: {}", self.local.name, pk, err);
        }
    }

    /// A duplicate accept after the joiner finished means our ack was lost;
    /// repeat it statelessly so the correspondent can finalize.
    fn re_ack_join(&mut self, rx: &Head, from: SocketAddr) {
        let Some(remote) = self.remotes.get(&rx.de) else {
            return;
        };
        if remote.joined != Some(true) || remote.fuid != rx.se {
            return;
        }
        let mut head = Head::new(PacketKind::Ack, TransKind::Join);
        head.se = rx.de;
        head.de = rx.se;
        head.cf = !rx.cf;
        head.si = rx.si;
        head.ti = rx.ti;
        if let Ok(raw) = packet::pack(head, &[], None, Some(&self.local.signer)) {
            self.push_tx(raw, from);
        }
    }

    fn service_transactions(&mut self) {
        let keys: Vec<Index> = self.transactions.keys().copied().collect();
        for key in keys {
            if let Some(mut trans) = self.transactions.remove(&key) {
                trans.service(self);
                if !trans.done() {
                    self.transactions.insert(trans.index(), trans);
                }
            }
        }
    }

    /// Turns queued messages into messengers, driving the missing join or
    /// allow first for remotes whose session lapsed.
    fn service_tx_msgs(&mut self) {
        for _ in 0..self.tx_msgs.len() {
            let Some((msg, uid, retried)) = self.tx_msgs.pop_front() else {
                break;
            };
            let Ok((allowed, joined)) = self
                .remote(uid)
                .map(|remote| (remote.allowed, remote.joined))
            else {
                tracing::warn!("{}: dropping message for dead remote {}", self.local.name, uid);
                continue;
            };
            if allowed == Some(true) {
                if let Err(err) = Messenger::start(self, uid, msg, retried) {
                    tracing::warn!("{}: dropping message: {}", self.local.name, err);
                }
            } else if joined == Some(true) {
                if let Err(err) = self.allow(Some(uid)) {
                    tracing::debug!("{}: allow for queued message: {}", self.local.name, err);
                }
                self.tx_msgs.push_back((msg, uid, retried));
            } else {
                if let Err(err) = self.join(Some(uid)) {
                    tracing::debug!("{}: join for queued message: {}", self.local.name, err);
                }
                self.tx_msgs.push_back((msg, uid, retried));
            }
        }
    }

    fn service_txes(&mut self) {
        while let Some((raw, to)) = self.txes.pop_front() {
            match self.socket.send_to(&raw, to) {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.txes.push_front((raw, to));
                    break;
                }
                Err(err) => {
                    tracing::debug!("{}: send to {} failed: {}", self.local.name, to, err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::SEGMENT_SIZE;
    use anyhow::Result;
    use serde_json::json;
    use tempfile::TempDir;

    fn build(name: &str, base: &std::path::Path, auto: AutoMode, store: &Store) -> RoadStack {
        build_with(name, base, auto, store, |_| {})
    }

    fn build_with(
        name: &str,
        base: &std::path::Path,
        auto: AutoMode,
        store: &Store,
        tweak: impl FnOnce(&mut StackConfig),
    ) -> RoadStack {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let mut cfg = StackConfig {
            name: name.into(),
            ha: Some("127.0.0.1:0".parse().unwrap()),
            basedirpath: Some(base.to_path_buf()),
            auto,
            store: Some(store.clone()),
            ..StackConfig::default()
        };
        tweak(&mut cfg);
        RoadStack::new(cfg).unwrap()
    }

    /// Interleaves service ticks until both stacks go idle, the way a
    /// fixed-step scheduler would, advancing shared virtual time.
    fn service(a: &mut RoadStack, b: &mut RoadStack, store: &Store, ticks: usize) {
        for _ in 0..ticks {
            a.service_all();
            b.service_all();
            if a.idle() && b.idle() {
                break;
            }
            store.advance(0.05);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        // every surviving transaction must still have its remote
        for stack in [&*a, &*b] {
            for index in stack.transactions.keys() {
                assert!(stack.remotes.contains_key(&index.remote));
            }
        }
    }

    fn join(initiator: &mut RoadStack, correspondent: &mut RoadStack, store: &Store) {
        if initiator.remote_count() == 0 {
            initiator
                .add_remote(RemoteEstate::vacuous(correspondent.ha()))
                .unwrap();
        }
        initiator.join(None).unwrap();
        service(initiator, correspondent, store, 60);
    }

    fn allow(initiator: &mut RoadStack, correspondent: &mut RoadStack, store: &Store) {
        initiator.allow(None).unwrap();
        service(initiator, correspondent, store, 60);
    }

    #[test]
    fn join_allow_and_message_both_ways() -> Result<()> {
        let base = TempDir::new()?;
        let store = Store::new(0.0);
        let mut main = build_with("main", base.path(), AutoMode::Once, &store, |cfg| {
            cfg.main = true;
        });
        let mut other = build("other", base.path(), AutoMode::Once, &store);

        join(&mut other, &mut main, &store);
        let main_remote = main.remote_by_name("other").expect("main sees other");
        let other_remote = other.remote_by_name("main").expect("other sees main");
        assert_eq!(main_remote.joined, Some(true));
        assert_eq!(other_remote.joined, Some(true));
        assert_eq!(main_remote.acceptance, Some(Acceptance::Accepted));
        assert_eq!(other_remote.acceptance, Some(Acceptance::Accepted));
        // cross uids agree
        assert_eq!(main_remote.fuid, other_remote.uid);
        assert_eq!(other_remote.fuid, main_remote.uid);
        // identity landed both ways
        assert_eq!(main_remote.ver_hex().unwrap(), other.local.ver_hex());
        assert_eq!(other_remote.ver_hex().unwrap(), main.local.ver_hex());
        assert!(main_remote.allowed.is_none());

        allow(&mut other, &mut main, &store);
        let main_remote = main.remote_by_name("other").unwrap();
        let other_remote = other.remote_by_name("main").unwrap();
        assert_eq!(main_remote.allowed, Some(true));
        assert_eq!(other_remote.allowed, Some(true));
        // allowed implies joined
        assert_eq!(main_remote.joined, Some(true));
        assert_eq!(other_remote.joined, Some(true));

        other.transmit(json!({"content": "hello main"}), None)?;
        main.transmit(json!({"content": "hello other"}), None)?;
        service(&mut other, &mut main, &store, 60);

        let (msg, from) = main.received().expect("main got the message");
        assert_eq!(msg["content"], json!("hello main"));
        assert_eq!(from, "other");
        let (msg, from) = other.received().expect("other got the message");
        assert_eq!(msg["content"], json!("hello other"));
        assert_eq!(from, "main");
        Ok(())
    }

    #[test]
    fn msgpack_bulk_interoperates() -> Result<()> {
        let base = TempDir::new()?;
        let store = Store::new(0.0);
        let mut main = build_with("main", base.path(), AutoMode::Once, &store, |cfg| {
            cfg.main = true;
        });
        let mut other = build_with("other", base.path(), AutoMode::Once, &store, |cfg| {
            cfg.bulk = BodyKind::Msgpack;
        });

        join(&mut other, &mut main, &store);
        allow(&mut other, &mut main, &store);
        // main learned other's codec at join
        assert_eq!(main.remote_by_name("other").unwrap().bulk, BodyKind::Msgpack);

        other.transmit(json!({"content": "packed"}), None)?;
        service(&mut other, &mut main, &store, 60);
        let (msg, _) = main.received().expect("delivered");
        assert_eq!(msg["content"], json!("packed"));
        Ok(())
    }

    #[test]
    fn pending_join_completes_after_operator_accept() -> Result<()> {
        let base = TempDir::new()?;
        let store = Store::new(0.0);
        let mut main = build_with("main", base.path(), AutoMode::Never, &store, |cfg| {
            cfg.main = true;
        });
        let mut other = build("other", base.path(), AutoMode::Once, &store);

        other.add_remote(RemoteEstate::vacuous(main.ha()))?;
        other.join(None)?;
        service(&mut other, &mut main, &store, 20);

        // held: one live transaction each side, nobody joined
        assert_eq!(main.transaction_count(), 1);
        assert_eq!(other.transaction_count(), 1);
        let held = main.remotes().next().expect("provisional remote");
        assert_eq!(held.acceptance, Some(Acceptance::Pending));
        assert_eq!(held.joined, None);
        assert_eq!(other.remotes().next().unwrap().acceptance, None);

        let uid = main.first_remote_uid().unwrap();
        main.accept_remote(uid)?;
        service(&mut other, &mut main, &store, 60);

        for stack in [&main, &other] {
            let remote = stack.remotes().next().unwrap();
            assert_eq!(remote.joined, Some(true));
            assert_eq!(remote.acceptance, Some(Acceptance::Accepted));
        }

        allow(&mut other, &mut main, &store);
        assert_eq!(main.remotes().next().unwrap().allowed, Some(true));
        assert_eq!(other.remotes().next().unwrap().allowed, Some(true));
        Ok(())
    }

    #[test]
    fn auto_once_burns_for_one_role_only() -> Result<()> {
        let base = TempDir::new()?;
        let store = Store::new(0.0);
        let mut main = build_with("main", base.path(), AutoMode::Once, &store, |cfg| {
            cfg.main = true;
        });
        let mut other = build("other", base.path(), AutoMode::Once, &store);
        join(&mut other, &mut main, &store);
        assert_eq!(main.remote_by_name("other").unwrap().joined, Some(true));

        // the free acceptance is consumed; a different role now pends
        let mut late = build("late", base.path(), AutoMode::Once, &store);
        late.add_remote(RemoteEstate::vacuous(main.ha()))?;
        late.join(None)?;
        service(&mut late, &mut main, &store, 20);
        let held = main.remote_by_name("late").expect("pending remote");
        assert_eq!(held.acceptance, Some(Acceptance::Pending));
        assert_eq!(held.joined, None);
        Ok(())
    }

    #[test]
    fn rejoin_from_keep_after_restart() -> Result<()> {
        let base = TempDir::new()?;
        let store = Store::new(0.0);
        let main_ha: SocketAddr = "127.0.0.1:27530".parse().unwrap();
        let other_ha: SocketAddr = "127.0.0.1:27531".parse().unwrap();

        let (main_ver, other_ver, main_sid, other_sid);
        {
            let mut main = build_with("main", base.path(), AutoMode::Once, &store, |cfg| {
                cfg.main = true;
                cfg.ha = Some(main_ha);
            });
            let mut other = build_with("other", base.path(), AutoMode::Once, &store, |cfg| {
                cfg.ha = Some(other_ha);
            });
            join(&mut other, &mut main, &store);
            allow(&mut other, &mut main, &store);
            assert_eq!(main.remote_by_name("other").unwrap().allowed, Some(true));
            main_ver = main.local.ver_hex();
            other_ver = other.local.ver_hex();
            main_sid = main.remote_by_name("other").unwrap().sid;
            other_sid = other.remote_by_name("main").unwrap().sid;
        } // sockets close, stacks forget everything not in the keep

        let mut main = build_with("main", base.path(), AutoMode::Never, &store, |cfg| {
            cfg.main = true;
            cfg.ha = Some(main_ha);
        });
        let mut other = build_with("other", base.path(), AutoMode::Never, &store, |cfg| {
            cfg.ha = Some(other_ha);
        });

        // identity and remotes came back from disk; sid moved up one
        assert_eq!(main.local.ver_hex(), main_ver);
        assert_eq!(other.local.ver_hex(), other_ver);
        let restored = main.remote_by_name("other").expect("restored remote");
        assert_eq!(restored.joined, Some(true));
        assert_eq!(restored.allowed, None);
        assert_eq!(restored.sid, main_sid + 1);
        assert_eq!(other.remote_by_name("main").unwrap().sid, other_sid + 1);

        // no interactive acceptance needed: the role records persist
        let uid = other.remote_uid_by_name("main");
        other.join(uid)?;
        service(&mut other, &mut main, &store, 60);
        assert_eq!(main.remote_by_name("other").unwrap().joined, Some(true));
        assert_eq!(other.remote_by_name("main").unwrap().joined, Some(true));

        allow(&mut other, &mut main, &store);
        other.transmit(json!({"content": "back again"}), None)?;
        service(&mut other, &mut main, &store, 60);
        assert_eq!(
            main.received().expect("delivered").0["content"],
            json!("back again")
        );
        Ok(())
    }

    #[test]
    fn lost_keep_rejected_until_mutable() -> Result<()> {
        let base = TempDir::new()?;
        let store = Store::new(0.0);
        let mut main = build_with("main", base.path(), AutoMode::Once, &store, |cfg| {
            cfg.main = true;
        });
        let mut other = build("other", base.path(), AutoMode::Once, &store);
        join(&mut other, &mut main, &store);
        allow(&mut other, &mut main, &store);
        let old_ver = main.remote_by_name("other").unwrap().ver_hex().unwrap();

        // other loses its keep and comes back with fresh keys
        let fresh_base = TempDir::new()?;
        let mut reborn = build("other", fresh_base.path(), AutoMode::Once, &store);
        reborn.add_remote(RemoteEstate::vacuous(main.ha()))?;
        reborn.join(None)?;
        service(&mut reborn, &mut main, &store, 60);

        // immutable main rejects; its stored remote is untouched
        let kept = main.remote_by_name("other").unwrap();
        assert_eq!(kept.joined, Some(true));
        assert_eq!(kept.ver_hex().unwrap(), old_ver);
        assert_eq!(reborn.remote_count(), 0);

        // a mutable main adopts the new identity in place
        main.mutable = true;
        reborn.add_remote(RemoteEstate::vacuous(main.ha()))?;
        reborn.join(None)?;
        service(&mut reborn, &mut main, &store, 60);
        let swapped = main.remote_by_name("other").unwrap();
        assert_eq!(swapped.joined, Some(true));
        assert_eq!(swapped.ver_hex().unwrap(), reborn.local.ver_hex());
        assert_ne!(swapped.ver_hex().unwrap(), old_ver);
        assert_eq!(reborn.remote_by_name("main").unwrap().joined, Some(true));
        Ok(())
    }

    #[test]
    fn rename_rejected_immutable_second_remote_mutable() -> Result<()> {
        let base = TempDir::new()?;
        let store = Store::new(0.0);
        let mut main = build_with("main", base.path(), AutoMode::Once, &store, |cfg| {
            cfg.main = true;
        });
        let mut other = build("other", base.path(), AutoMode::Once, &store);
        join(&mut other, &mut main, &store);
        allow(&mut other, &mut main, &store); // session id becomes nonzero

        // other renames itself and rejoins over the same session
        other.local.name = "whowho".into();
        other.join(None)?;
        service(&mut other, &mut main, &store, 60);

        // immutable main keeps the old record and rejects
        assert_eq!(main.remote_count(), 1);
        let kept = main.remotes().next().unwrap();
        assert_eq!(kept.name, "other");
        assert_eq!(kept.joined, Some(true));
        // the rejected joiner dropped its remote
        assert_eq!(other.remote_count(), 0);

        // mutable main accepts the new identity as a second remote
        main.mutable = true;
        join(&mut other, &mut main, &store);
        assert_eq!(main.remote_count(), 2);
        let added = main.remote_by_name("whowho").expect("new remote");
        assert_eq!(added.joined, Some(true));
        assert_eq!(added.acceptance, Some(Acceptance::Accepted));
        assert_eq!(other.remote_by_name("main").unwrap().joined, Some(true));

        // a repeat join from the same identity reuses the record
        let before = main.remote_by_name("whowho").unwrap().uid;
        let old_ha = main.remote_by_name("whowho").unwrap().ha;
        join(&mut other, &mut main, &store);
        assert_eq!(main.remote_count(), 2);
        let reused = main.remote_by_name("whowho").unwrap();
        assert_eq!(reused.uid, before);
        assert_eq!(reused.ha, old_ha);
        Ok(())
    }

    #[test]
    fn renew_restarts_vacuous_or_fails() -> Result<()> {
        let base = TempDir::new()?;
        let store = Store::new(0.0);
        let main_ha: SocketAddr = "127.0.0.1:27534".parse().unwrap();

        let mut other = build("other", base.path(), AutoMode::Once, &store);
        {
            let mut main = build_with("main", base.path(), AutoMode::Once, &store, |cfg| {
                cfg.main = true;
                cfg.ha = Some(main_ha);
            });
            join(&mut other, &mut main, &store);
            allow(&mut other, &mut main, &store); // session id becomes nonzero
            assert_eq!(other.remote_by_name("main").unwrap().joined, Some(true));
        }

        // main comes back with no keep and fresh keys on the same address
        let wiped = TempDir::new()?;
        let mut main = build_with("main", wiped.path(), AutoMode::Once, &store, |cfg| {
            cfg.main = true;
            cfg.ha = Some(main_ha);
        });

        // immutable never-accepting other refuses the renew and fails
        other.keep.auto = AutoMode::Never;
        let uid = other.remote_uid_by_name("main");
        other.join(uid)?;
        service(&mut other, &mut main, &store, 60);
        assert_eq!(main.remote_count(), 0);

        // a mutable other restarts vacuously and adopts main's new identity
        other.mutable = true;
        other.join(uid)?;
        service(&mut other, &mut main, &store, 60);
        let renewed = other.remote_by_name("main").expect("renewed remote");
        assert_eq!(renewed.joined, Some(true));
        assert_eq!(renewed.ver_hex().unwrap(), main.local.ver_hex());
        assert_eq!(main.remote_by_name("other").unwrap().joined, Some(true));
        Ok(())
    }

    #[test]
    fn segmented_message_reassembles() -> Result<()> {
        let base = TempDir::new()?;
        let store = Store::new(0.0);
        let mut main = build_with("main", base.path(), AutoMode::Once, &store, |cfg| {
            cfg.main = true;
        });
        let mut other = build("other", base.path(), AutoMode::Once, &store);
        join(&mut other, &mut main, &store);
        allow(&mut other, &mut main, &store);

        let stuff = "x".repeat(SEGMENT_SIZE * 2 + SEGMENT_SIZE / 2);
        other.transmit(json!({"content": stuff}), None)?;
        service(&mut other, &mut main, &store, 120);
        let (msg, from) = main.received().expect("reassembled");
        assert_eq!(from, "other");
        assert_eq!(msg["content"].as_str().unwrap().len(), stuff.len());
        assert_eq!(msg["content"], json!(stuff));
        Ok(())
    }

    #[test]
    fn transmit_drives_missing_handshakes() -> Result<()> {
        let base = TempDir::new()?;
        let store = Store::new(0.0);
        let mut main = build_with("main", base.path(), AutoMode::Once, &store, |cfg| {
            cfg.main = true;
        });
        let mut other = build("other", base.path(), AutoMode::Once, &store);

        // no join, no allow: a queued message pulls both through
        other.add_remote(RemoteEstate::vacuous(main.ha()))?;
        other.transmit(json!({"content": "eager"}), None)?;
        service(&mut other, &mut main, &store, 120);

        assert_eq!(other.remote_by_name("main").unwrap().allowed, Some(true));
        let (msg, _) = main.received().expect("delivered after handshakes");
        assert_eq!(msg["content"], json!("eager"));
        Ok(())
    }

    #[test]
    fn unjoined_reply_recovers_session() -> Result<()> {
        let base = TempDir::new()?;
        let store = Store::new(0.0);
        let other_ha: SocketAddr = "127.0.0.1:27536".parse().unwrap();
        let mut main = build_with("main", base.path(), AutoMode::Always, &store, |cfg| {
            cfg.main = true;
            cfg.mutable = true;
        });

        {
            let mut other = build_with("other", base.path(), AutoMode::Always, &store, |cfg| {
                cfg.ha = Some(other_ha);
            });
            join(&mut other, &mut main, &store);
            allow(&mut other, &mut main, &store);
        }

        // other is wiped and restarted at the same address; main still
        // believes the old session is allowed
        let wiped = TempDir::new()?;
        let mut other = build_with("other", wiped.path(), AutoMode::Always, &store, |cfg| {
            cfg.ha = Some(other_ha);
            cfg.mutable = true;
        });
        main.transmit(json!({"content": "are you there"}), None)?;
        service(&mut main, &mut other, &store, 200);

        // the unjoined reply forced a fresh join and allow, then delivery
        let (msg, from) = other.received().expect("recovered and delivered");
        assert_eq!(msg["content"], json!("are you there"));
        assert_eq!(from, "main");
        assert_eq!(main.remote_by_name("other").unwrap().allowed, Some(true));
        Ok(())
    }

    #[test]
    fn remove_remote_drops_transactions_and_keep() -> Result<()> {
        let base = TempDir::new()?;
        let store = Store::new(0.0);
        let mut main = build_with("main", base.path(), AutoMode::Once, &store, |cfg| {
            cfg.main = true;
        });
        let mut other = build("other", base.path(), AutoMode::Once, &store);
        join(&mut other, &mut main, &store);

        let uid = main.remote_uid_by_name("other").unwrap();
        assert!(main.keep.load_all_remotes()?.iter().any(|r| r.name == "other"));
        main.remove_remote(uid, true)?;
        assert_eq!(main.remote_count(), 0);
        assert_eq!(main.transaction_count(), 0);
        assert!(main.keep.load_all_remotes()?.is_empty());
        Ok(())
    }
}
