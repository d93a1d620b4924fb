//! Transaction engine: the six protocol roles.
//!
//! Every exchange on the road is a transaction between an initiator and a
//! correspondent: Joiner/Joinent establish mutual long-term identity,
//! Allower/Allowent agree a fresh session box key, Messenger/Messengent move
//! one application message. Each role is a distinct record behind the
//! [`Transaction`] sum type; the stack owns them all and drives them by
//! removing one from its table, feeding it a packet or a service tick, and
//! reinserting it unless it finished.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Timer;
use crate::crypto::{Boxer, Privateer, Pubber, Verfer};
use crate::error::{Error, Result};
use crate::estate::Acceptance;
use crate::packet::{self, BodyKind, Head, PacketKind, RxPacket, TransKind};
use crate::stack::RoadStack;

/// First retry interval; doubles per redo up to the max.
pub const REDO_TIMEOUT_MIN: f64 = 0.5;
pub const REDO_TIMEOUT_MAX: f64 = 4.0;
/// Total deadlines per transaction kind.
pub const JOIN_TIMEOUT: f64 = 10.0;
/// A join held for operator acceptance waits this long instead.
pub const PEND_TIMEOUT: f64 = 60.0;
pub const ALLOW_TIMEOUT: f64 = 10.0;
pub const MESSAGE_TIMEOUT: f64 = 10.0;

/// Identifies one live transaction: the owning remote's uid, whether the
/// remote initiated it, the transaction id, and the kind. On receipt the
/// remote-side flag is the complement of the packet's correspondent flag.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Index {
    pub remote: u32,
    pub rmt: bool,
    pub ti: u32,
    pub kind: TransKind,
}

/// Identity tuple carried by join requests and accepts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct JoinBody {
    pub name: String,
    pub verhex: String,
    pub pubhex: String,
    pub role: String,
    pub ha: String,
    pub main: bool,
    pub kind: u8,
    /// Body codec the sender will use for messages.
    pub bk: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloBody {
    /// Initiator short-term public key.
    she: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CookieBody {
    /// Correspondent short-term public key.
    she: String,
    /// Session cookie, echoed back in the initiate.
    oreo: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct InitiateBody {
    she: String,
    oreo: String,
    /// Long-term signature over the short-term public key.
    vouch: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResendBody {
    sns: Vec<u32>,
}

/// State shared by every role.
#[derive(Debug)]
struct Base {
    index: Index,
    si: u32,
    timeout: Timer,
    redo: Timer,
    tx: Option<Vec<u8>>,
    to: SocketAddr,
    done: bool,
}

impl Base {
    fn new(stack: &RoadStack, index: Index, si: u32, to: SocketAddr, deadline: f64) -> Self {
        Base {
            index,
            si,
            timeout: Timer::new(stack.store(), deadline),
            redo: Timer::new(stack.store(), REDO_TIMEOUT_MIN),
            tx: None,
            to,
            done: false,
        }
    }

    fn head(&self, pk: PacketKind, se: u32, de: u32) -> Head {
        let mut head = Head::new(pk, self.index.kind);
        head.se = se;
        head.de = de;
        head.cf = self.index.rmt;
        head.si = self.si;
        head.ti = self.index.ti;
        head
    }

    fn transmit(&mut self, stack: &mut RoadStack, raw: Vec<u8>) {
        stack.push_tx(raw.clone(), self.to);
        self.tx = Some(raw);
        self.redo.extend(REDO_TIMEOUT_MIN);
    }

    fn retransmit(&mut self, stack: &mut RoadStack) {
        if let Some(raw) = &self.tx {
            stack.push_tx(raw.clone(), self.to);
        }
        let backoff = (self.redo.duration() * 2.0).min(REDO_TIMEOUT_MAX);
        self.redo.extend(backoff);
    }
}

/// One live transaction of any role.
#[derive(Debug)]
pub enum Transaction {
    Joiner(Joiner),
    Joinent(Joinent),
    Allower(Allower),
    Allowent(Allowent),
    Messenger(Messenger),
    Messengent(Messengent),
}

impl Transaction {
    pub fn index(&self) -> Index {
        match self {
            Transaction::Joiner(t) => t.base.index,
            Transaction::Joinent(t) => t.base.index,
            Transaction::Allower(t) => t.base.index,
            Transaction::Allowent(t) => t.base.index,
            Transaction::Messenger(t) => t.base.index,
            Transaction::Messengent(t) => t.base.index,
        }
    }

    pub fn done(&self) -> bool {
        match self {
            Transaction::Joiner(t) => t.base.done,
            Transaction::Joinent(t) => t.base.done,
            Transaction::Allower(t) => t.base.done,
            Transaction::Allowent(t) => t.base.done,
            Transaction::Messenger(t) => t.base.done,
            Transaction::Messengent(t) => t.base.done,
        }
    }

    pub fn receive(&mut self, stack: &mut RoadStack, pckt: &RxPacket) {
        match self {
            Transaction::Joiner(t) => t.receive(stack, pckt),
            Transaction::Joinent(t) => t.receive(stack, pckt),
            Transaction::Allower(t) => t.receive(stack, pckt),
            Transaction::Allowent(t) => t.receive(stack, pckt),
            Transaction::Messenger(t) => t.receive(stack, pckt),
            Transaction::Messengent(t) => t.receive(stack, pckt),
        }
    }

    /// One timer tick: deadline, redo, and any state poll.
    pub fn service(&mut self, stack: &mut RoadStack) {
        match self {
            Transaction::Joiner(t) => t.service(stack),
            Transaction::Joinent(t) => t.service(stack),
            Transaction::Allower(t) => t.service(stack),
            Transaction::Allowent(t) => t.service(stack),
            Transaction::Messenger(t) => t.service(stack),
            Transaction::Messengent(t) => t.service(stack),
        }
    }
}

/// Stateless reply bound to a received head, used when no transaction can
/// or should be kept: nacks, renews, rejects, unjoined/unallowed notices.
pub(crate) fn reply_stateless(
    stack: &mut RoadStack,
    rx: &Head,
    to: SocketAddr,
    pk: PacketKind,
    sign: bool,
) {
    let Ok(tk) = rx.trans_kind() else { return };
    let mut head = Head::new(pk, tk);
    head.se = rx.de;
    head.de = rx.se;
    head.cf = !rx.cf;
    head.si = rx.si;
    head.ti = rx.ti;
    head.bk = BodyKind::Nada as u8;
    let signer = sign.then(|| stack.local.signer.clone());
    match packet::pack(head, &[], None, signer.as_ref()) {
        Ok(raw) => stack.push_tx(raw, to),
        Err(err) => tracing::debug!("{}: stateless {:?} failed: {}", stack.name_owned(), pk, err),
    }
}

fn local_join_body(stack: &RoadStack) -> JoinBody {
    JoinBody {
        name: stack.local.name.clone(),
        verhex: stack.local.ver_hex(),
        pubhex: stack.local.pub_hex(),
        role: stack.local.role.clone(),
        ha: stack.local.ha.to_string(),
        main: stack.main,
        kind: stack.kind,
        bk: stack.bulk as u8,
    }
}

// ---------------------------------------------------------------------------
// Join

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JoinerState {
    Joining,
    Pending,
    Joined,
    Refused,
    Rejected,
    Renewed,
    Nacked,
    TimedOut,
}

/// Initiator side of a join.
#[derive(Debug)]
pub struct Joiner {
    base: Base,
    pub state: JoinerState,
}

impl Joiner {
    /// Builds and transmits the join request, vacuous (`si = 0`) when we
    /// hold no far uid for the remote yet.
    pub(crate) fn start(stack: &mut RoadStack, uid: u32) -> Result<()> {
        let body = local_join_body(stack);
        let (ti, se, de, si, to) = {
            let remote = stack.remote_mut(uid)?;
            let si = if remote.fuid == 0 { 0 } else { remote.sid };
            (remote.next_tid(), remote.uid, remote.fuid, si, remote.ha)
        };
        let index = Index {
            remote: uid,
            rmt: false,
            ti,
            kind: TransKind::Join,
        };
        let mut joiner = Joiner {
            base: Base::new(stack, index, si, to, JOIN_TIMEOUT),
            state: JoinerState::Joining,
        };
        let raw = joiner.request(stack, &body, se, de)?;
        joiner.base.transmit(stack, raw);
        stack.insert_transaction(Transaction::Joiner(joiner));
        Ok(())
    }

    fn request(&self, stack: &RoadStack, body: &JoinBody, se: u32, de: u32) -> Result<Vec<u8>> {
        let mut head = self.base.head(PacketKind::Request, se, de);
        head.af = true;
        head.bk = BodyKind::Json as u8;
        let bytes = serde_json::to_vec(body)?;
        packet::pack(head, &bytes, None, Some(&stack.local.signer))
    }

    fn receive(&mut self, stack: &mut RoadStack, pckt: &RxPacket) {
        let result = match pckt.head.packet_kind() {
            Ok(PacketKind::Accept) => self.accept(stack, pckt),
            Ok(PacketKind::Pend) => self.pend(stack, pckt),
            Ok(PacketKind::Renew) => self.renew(stack, pckt),
            Ok(PacketKind::Refuse) => {
                tracing::debug!("{}: join refused", stack.name_owned());
                self.state = JoinerState::Refused;
                self.base.done = true;
                Ok(())
            }
            Ok(PacketKind::Reject) => self.reject(stack),
            Ok(PacketKind::Nack) => {
                self.state = JoinerState::Nacked;
                self.base.done = true;
                Ok(())
            }
            _ => Ok(()), // stale or duplicate, ignore
        };
        if let Err(err) = result {
            tracing::debug!("{}: joiner abort: {}", stack.name_owned(), err);
            self.state = JoinerState::Nacked;
            self.base.done = true;
        }
    }

    fn accept(&mut self, stack: &mut RoadStack, pckt: &RxPacket) -> Result<()> {
        let body: JoinBody = serde_json::from_value(pckt.body_value(None)?)?;
        let verfer = Verfer::from_hex(&body.verhex)?;
        pckt.verify(&verfer)?;

        let uid = self.base.index.remote;
        let differ = stack.remote(uid)?.keys_differ(&body.verhex, &body.pubhex);
        if differ && !stack.mutable {
            // stored identity wins on an immutable road
            reply_stateless(stack, &pckt.head, self.base.to, PacketKind::Nack, true);
            self.state = JoinerState::Rejected;
            self.base.done = true;
            return Ok(());
        }

        let status = stack.keep_status(&body.role, &body.verhex, &body.pubhex)?;
        match status {
            Acceptance::Rejected => {
                tracing::warn!(
                    "{}: rejected correspondent role '{}'",
                    stack.name_owned(),
                    body.role
                );
                stack.remove_remote_quiet(uid);
                self.state = JoinerState::Rejected;
                self.base.done = true;
                Ok(())
            }
            Acceptance::Pending | Acceptance::Accepted => {
                stack.update_remote_identity(uid, &body, pckt.head.se, self.base.to)?;
                if status == Acceptance::Pending {
                    let remote = stack.remote_mut(uid)?;
                    remote.acceptance = Some(Acceptance::Pending);
                    self.state = JoinerState::Pending;
                    self.base.timeout.extend(PEND_TIMEOUT);
                    self.base.tx = None;
                    Ok(())
                } else {
                    self.finish(stack)
                }
            }
        }
    }

    /// Acks the accept, marks joined, and persists remote and role.
    fn finish(&mut self, stack: &mut RoadStack) -> Result<()> {
        let uid = self.base.index.remote;
        let (se, de, name) = {
            let remote = stack.remote_mut(uid)?;
            remote.acceptance = Some(Acceptance::Accepted);
            remote.joined = Some(true);
            (remote.uid, remote.fuid, remote.name.clone())
        };
        let head = self.base.head(PacketKind::Ack, se, de);
        let raw = packet::pack(head, &[], None, Some(&stack.local.signer))?;
        self.base.transmit(stack, raw);
        stack.dump_remote_and_role(uid)?;
        tracing::info!("{}: joined with '{}'", stack.name_owned(), name);
        self.state = JoinerState::Joined;
        self.base.done = true;
        Ok(())
    }

    fn pend(&mut self, stack: &mut RoadStack, pckt: &RxPacket) -> Result<()> {
        // hold for the correspondent operator; stop redoing the request
        let uid = self.base.index.remote;
        if let Ok(remote) = stack.remote(uid) {
            if let Some(verfer) = &remote.verfer {
                pckt.verify(verfer)?;
            }
        }
        if self.state == JoinerState::Joining {
            self.state = JoinerState::Pending;
            self.base.timeout.extend(PEND_TIMEOUT);
            self.base.tx = None;
        }
        Ok(())
    }

    /// The correspondent lost our session: restart vacuously when policy
    /// permits, otherwise fail without side effects.
    ///
    /// A renew from a peer whose keys changed cannot verify against the
    /// stored verfer; only a mutable stack (one willing to adopt a new
    /// identity anyway) restarts on an unverifiable renew.
    fn renew(&mut self, stack: &mut RoadStack, pckt: &RxPacket) -> Result<()> {
        let uid = self.base.index.remote;
        let verified = {
            let remote = stack.remote(uid)?;
            match &remote.verfer {
                Some(verfer) => pckt.verify(verfer).is_ok(),
                None => false,
            }
        };
        let permitted = stack.mutable
            || (verified && stack.keep_auto() != crate::estate::AutoMode::Never);
        if !permitted {
            tracing::debug!("{}: refusing renew", stack.name_owned());
            self.state = JoinerState::Renewed;
            self.base.done = true;
            return Ok(());
        }
        let body = local_join_body(stack);
        let (ti, se) = {
            let remote = stack.remote_mut(uid)?;
            remote.fuid = 0;
            remote.sid = 0;
            (remote.next_tid(), remote.uid)
        };
        self.base.index.ti = ti;
        self.base.si = 0;
        self.base.timeout.extend(JOIN_TIMEOUT);
        self.state = JoinerState::Joining;
        let raw = self.request(stack, &body, se, 0)?;
        self.base.transmit(stack, raw);
        Ok(())
    }

    fn reject(&mut self, stack: &mut RoadStack) -> Result<()> {
        let uid = self.base.index.remote;
        stack.remove_remote_quiet(uid);
        tracing::warn!("{}: join rejected by correspondent", stack.name_owned());
        self.state = JoinerState::Rejected;
        self.base.done = true;
        Ok(())
    }

    fn service(&mut self, stack: &mut RoadStack) {
        if self.base.done {
            return;
        }
        if self.base.timeout.expired() {
            if let Ok(remote) = stack.remote_mut(self.base.index.remote) {
                remote.joined = Some(false);
            }
            tracing::debug!("{}: join timed out", stack.name_owned());
            self.state = JoinerState::TimedOut;
            self.base.done = true;
            return;
        }
        if self.state == JoinerState::Pending {
            // operator may have decided while we waited
            let acceptance = stack
                .remote(self.base.index.remote)
                .ok()
                .and_then(|remote| remote.acceptance);
            match acceptance {
                Some(Acceptance::Accepted) => {
                    if let Err(err) = self.finish(stack) {
                        tracing::debug!("{}: joiner abort: {}", stack.name_owned(), err);
                        self.base.done = true;
                    }
                }
                Some(Acceptance::Rejected) => {
                    stack.remove_remote_quiet(self.base.index.remote);
                    self.state = JoinerState::Rejected;
                    self.base.done = true;
                }
                _ => {}
            }
            return;
        }
        if self.base.redo.expired() {
            self.base.retransmit(stack);
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JoinentState {
    Pend,
    WaitAck,
    Joined,
    Rejected,
    Refused,
    Nacked,
    TimedOut,
}

/// Correspondent side of a join.
#[derive(Debug)]
pub struct Joinent {
    base: Base,
    pub state: JoinentState,
}

impl Joinent {
    /// Entry point for an inbound join request with no matching transaction.
    pub(crate) fn correspond(
        stack: &mut RoadStack,
        pckt: &RxPacket,
        from: SocketAddr,
    ) -> Result<()> {
        let body: JoinBody = serde_json::from_value(pckt.body_value(None)?)?;
        let verfer = Verfer::from_hex(&body.verhex)?;
        pckt.verify(&verfer)?;
        let head = &pckt.head;
        let vacuous = head.si == 0;

        let resolved = if vacuous {
            Self::correspond_vacuous(stack, &body, head, from)?
        } else {
            Self::correspond_session(stack, &body, head, from)?
        };
        let Some(resolved) = resolved else { return Ok(()) };

        let status = stack.keep_status(&body.role, &body.verhex, &body.pubhex)?;
        if status == Acceptance::Rejected {
            tracing::warn!("{}: rejecting join of role '{}'", stack.name_owned(), body.role);
            reply_stateless(stack, head, from, PacketKind::Reject, true);
            return Ok(());
        }

        let uid = match resolved {
            Some(uid) => uid,
            None => {
                let mut remote = crate::estate::RemoteEstate::vacuous(from);
                remote.name = body.name.clone();
                remote.role = body.role.clone();
                stack.add_remote(remote)?
            }
        };
        stack.update_remote_identity(uid, &body, head.se, from)?;
        let index = Index {
            remote: uid,
            rmt: true,
            ti: head.ti,
            kind: TransKind::Join,
        };
        let mut joinent = Joinent {
            base: Base::new(stack, index, head.si, from, JOIN_TIMEOUT),
            state: JoinentState::Pend,
        };
        if status == Acceptance::Pending {
            stack.remote_mut(uid)?.acceptance = Some(Acceptance::Pending);
            joinent.base.timeout.extend(PEND_TIMEOUT);
            let (se, de) = (uid, head.se);
            let pend = joinent.base.head(PacketKind::Pend, se, de);
            let raw = packet::pack(pend, &[], None, Some(&stack.local.signer))?;
            joinent.base.transmit(stack, raw);
        } else {
            stack.remote_mut(uid)?.acceptance = Some(Acceptance::Accepted);
            joinent.send_accept(stack)?;
        }
        stack.insert_transaction(Transaction::Joinent(joinent));
        Ok(())
    }

    /// Vacuous request: locate an existing remote by name, if any.
    /// `Ok(None)` means a reply already went out; `Ok(Some(None))` means a
    /// fresh remote is needed once acceptance clears.
    fn correspond_vacuous(
        stack: &mut RoadStack,
        body: &JoinBody,
        head: &Head,
        from: SocketAddr,
    ) -> Result<Option<Option<u32>>> {
        let Some(uid) = stack.remote_uid_by_name(&body.name) else {
            return Ok(Some(None));
        };
        let differ = stack.remote(uid)?.keys_differ(&body.verhex, &body.pubhex);
        if differ && !stack.mutable {
            reply_stateless(stack, head, from, PacketKind::Reject, true);
            return Ok(None);
        }
        Ok(Some(Some(uid)))
    }

    /// Non-vacuous request: the initiator claims an existing session.
    fn correspond_session(
        stack: &mut RoadStack,
        body: &JoinBody,
        head: &Head,
        from: SocketAddr,
    ) -> Result<Option<Option<u32>>> {
        let uid = head.de;
        let known = stack
            .remote(uid)
            .ok()
            .map(|remote| (remote.fuid, remote.name.clone()));
        let Some((fuid, name)) = known else {
            // no session state for the claimed uid: demand a vacuous redo
            reply_stateless(stack, head, from, PacketKind::Renew, true);
            return Ok(None);
        };
        if fuid != 0 && fuid != head.se {
            reply_stateless(stack, head, from, PacketKind::Renew, true);
            return Ok(None);
        }
        if name != body.name && !stack.mutable {
            // identity rename on an immutable road
            reply_stateless(stack, head, from, PacketKind::Reject, true);
            return Ok(None);
        }
        if stack.remote(uid)?.keys_differ(&body.verhex, &body.pubhex) && !stack.mutable {
            reply_stateless(stack, head, from, PacketKind::Reject, true);
            return Ok(None);
        }
        Ok(Some(Some(uid)))
    }

    fn send_accept(&mut self, stack: &mut RoadStack) -> Result<()> {
        let body = local_join_body(stack);
        let uid = self.base.index.remote;
        let (se, de) = {
            let remote = stack.remote(uid)?;
            (remote.uid, remote.fuid)
        };
        let mut head = self.base.head(PacketKind::Accept, se, de);
        head.af = true;
        head.bk = BodyKind::Json as u8;
        let bytes = serde_json::to_vec(&body)?;
        let raw = packet::pack(head, &bytes, None, Some(&stack.local.signer))?;
        self.base.transmit(stack, raw);
        self.state = JoinentState::WaitAck;
        Ok(())
    }

    fn receive(&mut self, stack: &mut RoadStack, pckt: &RxPacket) {
        let result = match pckt.head.packet_kind() {
            Ok(PacketKind::Request) => {
                // duplicate request: repeat our last answer
                self.base.retransmit(stack);
                Ok(())
            }
            Ok(PacketKind::Ack) => self.finish(stack, pckt),
            Ok(PacketKind::Refuse) => {
                self.state = JoinentState::Refused;
                self.base.done = true;
                Ok(())
            }
            Ok(PacketKind::Nack) => {
                self.state = JoinentState::Nacked;
                self.base.done = true;
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(err) = result {
            tracing::debug!("{}: joinent abort: {}", stack.name_owned(), err);
            self.state = JoinentState::Nacked;
            self.base.done = true;
        }
    }

    fn finish(&mut self, stack: &mut RoadStack, pckt: &RxPacket) -> Result<()> {
        if self.state != JoinentState::WaitAck {
            return Ok(());
        }
        let uid = self.base.index.remote;
        let name = {
            let remote = stack.remote_mut(uid)?;
            if let Some(verfer) = &remote.verfer {
                pckt.verify(verfer)?;
            }
            remote.joined = Some(true);
            remote.acceptance = Some(Acceptance::Accepted);
            remote.name.clone()
        };
        stack.dump_remote_and_role(uid)?;
        tracing::info!("{}: joined with '{}'", stack.name_owned(), name);
        self.state = JoinentState::Joined;
        self.base.done = true;
        Ok(())
    }

    fn service(&mut self, stack: &mut RoadStack) {
        if self.base.done {
            return;
        }
        if self.base.timeout.expired() {
            tracing::debug!("{}: joinent timed out", stack.name_owned());
            self.state = JoinentState::TimedOut;
            self.base.done = true;
            return;
        }
        if self.state == JoinentState::Pend {
            let acceptance = stack
                .remote(self.base.index.remote)
                .ok()
                .and_then(|remote| remote.acceptance);
            match acceptance {
                Some(Acceptance::Accepted) => {
                    if let Err(err) = self.send_accept(stack) {
                        tracing::debug!("{}: joinent abort: {}", stack.name_owned(), err);
                        self.base.done = true;
                    }
                }
                Some(Acceptance::Rejected) => {
                    let uid = self.base.index.remote;
                    let (se, de, to) = match stack.remote(uid) {
                        Ok(remote) => (remote.uid, remote.fuid, remote.ha),
                        Err(_) => {
                            self.base.done = true;
                            return;
                        }
                    };
                    let head = self.base.head(PacketKind::Reject, se, de);
                    if let Ok(raw) = packet::pack(head, &[], None, Some(&stack.local.signer)) {
                        stack.push_tx(raw, to);
                    }
                    stack.remove_remote_quiet(uid);
                    self.state = JoinentState::Rejected;
                    self.base.done = true;
                }
                _ => {}
            }
            return;
        }
        if self.base.redo.expired() {
            self.base.retransmit(stack);
        }
    }
}

// ---------------------------------------------------------------------------
// Allow

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllowerState {
    Hello,
    Allow,
    Allowed,
    Refused,
    Rejected,
    Nacked,
    TimedOut,
}

/// Initiator side of the session-key agreement.
#[derive(Debug)]
pub struct Allower {
    base: Base,
    pub state: AllowerState,
}

impl Allower {
    pub(crate) fn start(stack: &mut RoadStack, uid: u32) -> Result<()> {
        let (ti, si, se, de, to, she) = {
            let remote = stack.remote_mut(uid)?;
            if remote.joined != Some(true) {
                return Err(Error::Unjoined(remote.name.clone()));
            }
            remote.rekey();
            let privee = Privateer::new();
            let she = privee.pub_hex();
            remote.privee = Some(privee);
            (
                remote.next_tid(),
                remote.next_sid(),
                remote.uid,
                remote.fuid,
                remote.ha,
                she,
            )
        };
        let index = Index {
            remote: uid,
            rmt: false,
            ti,
            kind: TransKind::Allow,
        };
        let mut allower = Allower {
            base: Base::new(stack, index, si, to, ALLOW_TIMEOUT),
            state: AllowerState::Hello,
        };
        let mut head = allower.base.head(PacketKind::Hello, se, de);
        head.af = true;
        head.bk = BodyKind::Json as u8;
        let bytes = serde_json::to_vec(&HelloBody { she })?;
        let raw = packet::pack(head, &bytes, None, Some(&stack.local.signer))?;
        allower.base.transmit(stack, raw);
        stack.insert_transaction(Transaction::Allower(allower));
        Ok(())
    }

    fn receive(&mut self, stack: &mut RoadStack, pckt: &RxPacket) {
        let result = match pckt.head.packet_kind() {
            Ok(PacketKind::Cookie) => self.cookie(stack, pckt),
            Ok(PacketKind::Ack) => self.finish(stack, pckt),
            Ok(PacketKind::Refuse) => {
                self.abort(stack, AllowerState::Refused);
                Ok(())
            }
            Ok(PacketKind::Reject) => {
                self.abort(stack, AllowerState::Rejected);
                Ok(())
            }
            Ok(PacketKind::Nack) => {
                self.abort(stack, AllowerState::Nacked);
                Ok(())
            }
            Ok(PacketKind::Unjoined) => {
                if let Ok(remote) = stack.remote_mut(self.base.index.remote) {
                    remote.unjoin();
                }
                self.state = AllowerState::Refused;
                self.base.done = true;
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(err) = result {
            tracing::debug!("{}: allower abort: {}", stack.name_owned(), err);
            reply_stateless(stack, &pckt.head, self.base.to, PacketKind::Nack, true);
            self.abort(stack, AllowerState::Nacked);
        }
    }

    fn cookie(&mut self, stack: &mut RoadStack, pckt: &RxPacket) -> Result<()> {
        if self.state != AllowerState::Hello {
            return Ok(());
        }
        let uid = self.base.index.remote;
        let (se, de, cookie) = {
            let remote = stack.remote(uid)?;
            let verfer = remote.verfer.as_ref().ok_or(Error::Signature)?;
            pckt.verify(verfer)?;
            let privee = remote.privee.as_ref().ok_or(Error::Signature)?;
            let pubber = remote.pubber.as_ref().ok_or(Error::Signature)?;
            // cookie is sealed to our short-term key from their long-term key
            let shell = Boxer::new(&privee.shared(pubber));
            let cookie: CookieBody = serde_json::from_value(pckt.body_value(Some(&shell))?)?;
            (remote.uid, remote.fuid, cookie)
        };
        let publee = Pubber::from_hex(&cookie.she)?;
        let (she, short_pub, session) = {
            let remote = stack.remote_mut(uid)?;
            let privee = remote.privee.as_ref().ok_or(Error::Signature)?;
            let she = privee.pub_hex();
            let short_pub = privee.pubber().key_bytes();
            let session = privee.shared(&publee);
            remote.publee = Some(publee);
            (she, short_pub, session)
        };
        let vouch = hex::encode(stack.local.signer.sign(&short_pub));

        let mut head = self.base.head(PacketKind::Initiate, se, de);
        head.af = true;
        head.bk = BodyKind::Json as u8;
        let body = InitiateBody {
            she,
            oreo: cookie.oreo,
            vouch,
        };
        let bytes = serde_json::to_vec(&body)?;
        let boxer = Boxer::new(&session);
        let raw = packet::pack(head, &bytes, Some(&boxer), Some(&stack.local.signer))?;
        self.base.transmit(stack, raw);
        self.state = AllowerState::Allow;
        Ok(())
    }

    fn finish(&mut self, stack: &mut RoadStack, pckt: &RxPacket) -> Result<()> {
        if self.state != AllowerState::Allow {
            return Ok(());
        }
        let uid = self.base.index.remote;
        let name = {
            let remote = stack.remote_mut(uid)?;
            let verfer = remote.verfer.as_ref().ok_or(Error::Signature)?;
            pckt.verify(verfer)?;
            let privee = remote.privee.as_ref().ok_or(Error::Signature)?;
            let publee = remote.publee.as_ref().ok_or(Error::Signature)?;
            remote.box_key = Some(privee.shared(publee));
            remote.allowed = Some(true);
            remote.sid = self.base.si;
            remote.name.clone()
        };
        // keep the advanced session id durable across restarts
        stack.dump_remote(uid)?;
        tracing::info!("{}: allowed with '{}'", stack.name_owned(), name);
        self.state = AllowerState::Allowed;
        self.base.done = true;
        Ok(())
    }

    fn abort(&mut self, stack: &mut RoadStack, state: AllowerState) {
        if let Ok(remote) = stack.remote_mut(self.base.index.remote) {
            remote.rekey();
        }
        self.state = state;
        self.base.done = true;
    }

    fn service(&mut self, stack: &mut RoadStack) {
        if self.base.done {
            return;
        }
        if self.base.timeout.expired() {
            tracing::debug!("{}: allow timed out", stack.name_owned());
            self.abort(stack, AllowerState::TimedOut);
            return;
        }
        if self.base.redo.expired() {
            self.base.retransmit(stack);
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllowentState {
    Cookie,
    Allowed,
    Refused,
    Nacked,
    TimedOut,
}

/// Correspondent side of the session-key agreement.
#[derive(Debug)]
pub struct Allowent {
    base: Base,
    pub state: AllowentState,
    oreo: String,
}

impl Allowent {
    /// Entry point for an inbound hello with no matching transaction.
    pub(crate) fn correspond(
        stack: &mut RoadStack,
        pckt: &RxPacket,
        from: SocketAddr,
    ) -> Result<()> {
        let head = &pckt.head;
        let uid = head.de;
        let joined = stack
            .remote(uid)
            .ok()
            .map(|remote| remote.joined == Some(true))
            .unwrap_or(false);
        if !joined {
            reply_stateless(stack, head, from, PacketKind::Unjoined, true);
            return Ok(());
        }

        let hello: HelloBody = serde_json::from_value(pckt.body_value(None)?)?;
        let publee = Pubber::from_hex(&hello.she)?;
        let (se, de, she) = {
            let remote = stack.remote_mut(uid)?;
            let verfer = remote.verfer.as_ref().ok_or(Error::Signature)?;
            pckt.verify(verfer)?;
            remote.rekey();
            let privee = Privateer::new();
            let she = privee.pub_hex();
            remote.publee = Some(publee.clone());
            remote.privee = Some(privee);
            (remote.uid, remote.fuid, she)
        };
        let mut cookie = [0u8; 16];
        getrandom::getrandom(&mut cookie).unwrap();
        let oreo = hex::encode(cookie);

        let index = Index {
            remote: uid,
            rmt: true,
            ti: head.ti,
            kind: TransKind::Allow,
        };
        let mut allowent = Allowent {
            base: Base::new(stack, index, head.si, from, ALLOW_TIMEOUT),
            state: AllowentState::Cookie,
            oreo: oreo.clone(),
        };
        let body = CookieBody { she, oreo };
        let bytes = serde_json::to_vec(&body)?;
        // seal to the initiator's short-term key from our long-term key
        let boxer = Boxer::new(&stack.local.priver.shared(&publee));
        let mut cookie_head = allowent.base.head(PacketKind::Cookie, se, de);
        cookie_head.af = true;
        cookie_head.bk = BodyKind::Json as u8;
        let raw = packet::pack(cookie_head, &bytes, Some(&boxer), Some(&stack.local.signer))?;
        allowent.base.transmit(stack, raw);
        stack.insert_transaction(Transaction::Allowent(allowent));
        Ok(())
    }

    fn receive(&mut self, stack: &mut RoadStack, pckt: &RxPacket) {
        let result = match pckt.head.packet_kind() {
            Ok(PacketKind::Hello) => {
                self.base.retransmit(stack);
                Ok(())
            }
            Ok(PacketKind::Initiate) => self.initiate(stack, pckt),
            Ok(PacketKind::Refuse) => {
                self.abort(stack, AllowentState::Refused);
                Ok(())
            }
            Ok(PacketKind::Nack) => {
                self.abort(stack, AllowentState::Nacked);
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(err) = result {
            tracing::debug!("{}: allowent abort: {}", stack.name_owned(), err);
            reply_stateless(stack, &pckt.head, self.base.to, PacketKind::Nack, true);
            self.abort(stack, AllowentState::Nacked);
        }
    }

    fn initiate(&mut self, stack: &mut RoadStack, pckt: &RxPacket) -> Result<()> {
        if self.state != AllowentState::Cookie {
            return Ok(());
        }
        let uid = self.base.index.remote;
        let (se, de, name) = {
            let remote = stack.remote_mut(uid)?;
            let verfer = remote.verfer.as_ref().ok_or(Error::Signature)?;
            pckt.verify(verfer)?;
            let privee = remote.privee.as_ref().ok_or(Error::Signature)?;
            let publee = remote.publee.as_ref().ok_or(Error::Signature)?;
            let session = privee.shared(publee);
            let body: InitiateBody =
                serde_json::from_value(pckt.body_value(Some(&Boxer::new(&session)))?)?;
            if body.oreo != self.oreo || body.she != publee.key_hex() {
                return Err(Error::Signature);
            }
            // the long-term key vouches for the short-term one
            verfer.verify(&hex::decode(&body.vouch)?, &publee.key_bytes())?;
            remote.box_key = Some(session);
            remote.allowed = Some(true);
            remote.sid = self.base.si;
            (remote.uid, remote.fuid, remote.name.clone())
        };
        let head = self.base.head(PacketKind::Ack, se, de);
        let raw = packet::pack(head, &[], None, Some(&stack.local.signer))?;
        self.base.transmit(stack, raw);
        // keep the advanced session id durable across restarts
        stack.dump_remote(uid)?;
        tracing::info!("{}: allowed with '{}'", stack.name_owned(), name);
        self.state = AllowentState::Allowed;
        self.base.done = true;
        Ok(())
    }

    fn abort(&mut self, stack: &mut RoadStack, state: AllowentState) {
        if let Ok(remote) = stack.remote_mut(self.base.index.remote) {
            remote.rekey();
        }
        self.state = state;
        self.base.done = true;
    }

    fn service(&mut self, stack: &mut RoadStack) {
        if self.base.done {
            return;
        }
        if self.base.timeout.expired() {
            tracing::debug!("{}: allowent timed out", stack.name_owned());
            self.abort(stack, AllowentState::TimedOut);
            return;
        }
        if self.base.redo.expired() {
            self.base.retransmit(stack);
        }
    }
}

// ---------------------------------------------------------------------------
// Message

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessengerState {
    Message,
    Done,
    Refused,
    Nacked,
    TimedOut,
}

/// Initiator side of one message delivery.
#[derive(Debug)]
pub struct Messenger {
    base: Base,
    pub state: MessengerState,
    /// Packed wire image per segment, for selective retransmission.
    raws: Vec<Vec<u8>>,
    msg: Value,
    retried: bool,
}

impl Messenger {
    pub(crate) fn start(stack: &mut RoadStack, uid: u32, msg: Value, retried: bool) -> Result<()> {
        let bulk = stack.bulk;
        let (ti, si, se, de, to, box_key) = {
            let remote = stack.remote_mut(uid)?;
            if remote.allowed != Some(true) {
                return Err(Error::Unallowed(remote.name.clone()));
            }
            let box_key = remote
                .box_key
                .clone()
                .ok_or_else(|| Error::Unallowed(remote.name.clone()))?;
            (
                remote.next_tid(),
                remote.sid,
                remote.uid,
                remote.fuid,
                remote.ha,
                box_key,
            )
        };
        let bytes = packet::encode_body(&msg, bulk)?;
        let segments = packet::segmentize(&bytes)?;
        let sc = segments.len() as u32;

        let index = Index {
            remote: uid,
            rmt: false,
            ti,
            kind: TransKind::Message,
        };
        let mut messenger = Messenger {
            base: Base::new(stack, index, si, to, MESSAGE_TIMEOUT),
            state: MessengerState::Message,
            raws: Vec::with_capacity(segments.len()),
            msg,
            retried,
        };
        let boxer = Boxer::new(&box_key);
        for (sn, segment) in segments.iter().enumerate() {
            let mut head = messenger.base.head(PacketKind::Message, se, de);
            head.bk = bulk as u8;
            head.sn = sn as u32;
            head.sc = sc;
            head.bf = true;
            head.af = sn as u32 == sc - 1;
            let raw = packet::pack(head, segment, Some(&boxer), None)?;
            messenger.raws.push(raw);
        }
        // burst every segment; the redo timer re-offers only the last
        for raw in messenger.raws.clone() {
            stack.push_tx(raw, to);
        }
        messenger.base.tx = messenger.raws.last().cloned();
        messenger.base.redo.restart();
        stack.insert_transaction(Transaction::Messenger(messenger));
        Ok(())
    }

    fn receive(&mut self, stack: &mut RoadStack, pckt: &RxPacket) {
        match pckt.head.packet_kind() {
            Ok(PacketKind::Ack) => {
                self.state = MessengerState::Done;
                self.base.done = true;
            }
            Ok(PacketKind::Resend) => {
                let body: Result<ResendBody> = pckt
                    .body_value(None)
                    .and_then(|value| serde_json::from_value(value).map_err(Error::from));
                if let Ok(body) = body {
                    for sn in body.sns {
                        if let Some(raw) = self.raws.get(sn as usize) {
                            stack.push_tx(raw.clone(), self.base.to);
                        }
                    }
                    self.base.redo.restart();
                }
            }
            Ok(PacketKind::Refuse) => {
                if !self.retried {
                    stack.requeue_msg(self.base.index.remote, self.msg.clone());
                }
                self.state = MessengerState::Refused;
                self.base.done = true;
            }
            Ok(PacketKind::Nack) => {
                self.state = MessengerState::Nacked;
                self.base.done = true;
            }
            Ok(PacketKind::Unjoined) => {
                // correspondent lost the whole session: rejoin and retry
                if let Ok(remote) = stack.remote_mut(self.base.index.remote) {
                    remote.unjoin();
                }
                stack.requeue_msg(self.base.index.remote, self.msg.clone());
                self.state = MessengerState::Refused;
                self.base.done = true;
            }
            Ok(PacketKind::Unallowed) => {
                if let Ok(remote) = stack.remote_mut(self.base.index.remote) {
                    remote.rekey();
                }
                stack.requeue_msg(self.base.index.remote, self.msg.clone());
                self.state = MessengerState::Refused;
                self.base.done = true;
            }
            _ => {}
        }
    }

    fn service(&mut self, stack: &mut RoadStack) {
        if self.base.done {
            return;
        }
        if self.base.timeout.expired() {
            tracing::debug!("{}: message timed out", stack.name_owned());
            self.state = MessengerState::TimedOut;
            self.base.done = true;
            return;
        }
        if self.base.redo.expired() {
            self.base.retransmit(stack);
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessengentState {
    Message,
    Done,
    Nacked,
    TimedOut,
}

/// Correspondent side of one message delivery: reassembles segments and
/// acks the whole, asking for gaps by segment number.
#[derive(Debug)]
pub struct Messengent {
    base: Base,
    pub state: MessengentState,
    segments: Vec<Option<Vec<u8>>>,
    bulk: BodyKind,
}

impl Messengent {
    /// Entry point for an inbound message packet with no matching
    /// transaction.
    pub(crate) fn correspond(
        stack: &mut RoadStack,
        pckt: &RxPacket,
        from: SocketAddr,
    ) -> Result<()> {
        let head = &pckt.head;
        let uid = head.de;
        let session = stack
            .remote(uid)
            .ok()
            .map(|remote| (remote.joined, remote.allowed, remote.sid));
        let Some((joined, allowed, sid)) = session else {
            reply_stateless(stack, head, from, PacketKind::Unjoined, true);
            return Ok(());
        };
        if joined != Some(true) {
            reply_stateless(stack, head, from, PacketKind::Unjoined, true);
            return Ok(());
        }
        if allowed != Some(true) || head.si != sid {
            reply_stateless(stack, head, from, PacketKind::Unallowed, true);
            return Ok(());
        }
        if head.sc > packet::MAX_SEGMENT_COUNT || head.sn >= head.sc {
            tracing::warn!(
                "{}: dropping message of {} segments",
                stack.name_owned(),
                head.sc
            );
            reply_stateless(stack, head, from, PacketKind::Nack, false);
            return Ok(());
        }

        let index = Index {
            remote: uid,
            rmt: true,
            ti: head.ti,
            kind: TransKind::Message,
        };
        let mut messengent = Messengent {
            base: Base::new(stack, index, head.si, from, MESSAGE_TIMEOUT),
            state: MessengentState::Message,
            segments: vec![None; head.sc as usize],
            bulk: head.body_kind()?,
        };
        messengent.receive(stack, pckt);
        if !messengent.base.done {
            stack.insert_transaction(Transaction::Messengent(messengent));
        }
        Ok(())
    }

    fn receive(&mut self, stack: &mut RoadStack, pckt: &RxPacket) {
        let result = match pckt.head.packet_kind() {
            Ok(PacketKind::Message) => self.segment(stack, pckt),
            Ok(PacketKind::Nack) => {
                self.state = MessengentState::Nacked;
                self.base.done = true;
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(err) = result {
            tracing::debug!("{}: messengent abort: {}", stack.name_owned(), err);
            reply_stateless(stack, &pckt.head, self.base.to, PacketKind::Nack, false);
            self.state = MessengentState::Nacked;
            self.base.done = true;
        }
    }

    fn segment(&mut self, stack: &mut RoadStack, pckt: &RxPacket) -> Result<()> {
        let head = &pckt.head;
        if head.sn >= self.segments.len() as u32 {
            return Err(Error::Parse("segment number out of range".into()));
        }
        let uid = self.base.index.remote;
        let bytes = {
            let remote = stack.remote(uid)?;
            let box_key = remote
                .box_key
                .clone()
                .ok_or_else(|| Error::Unallowed(remote.name.clone()))?;
            pckt.body_bytes(Some(&Boxer::new(&box_key)))?
        };
        self.segments[head.sn as usize] = Some(bytes);

        if self.segments.iter().all(Option::is_some) {
            return self.finish(stack);
        }
        // final segment seen but gaps remain: ask for them now
        if head.sn == self.segments.len() as u32 - 1 {
            self.request_missing(stack)?;
        }
        Ok(())
    }

    fn finish(&mut self, stack: &mut RoadStack) -> Result<()> {
        let mut bytes = Vec::new();
        for segment in &self.segments {
            bytes.extend_from_slice(segment.as_ref().unwrap());
        }
        let value = packet::decode_body(&bytes, self.bulk)?;
        let uid = self.base.index.remote;
        let (se, de, name) = {
            let remote = stack.remote(uid)?;
            (remote.uid, remote.fuid, remote.name.clone())
        };
        let head = self.base.head(PacketKind::Ack, se, de);
        let raw = packet::pack(head, &[], None, None)?;
        self.base.transmit(stack, raw);
        stack.push_rx(value, name);
        self.state = MessengentState::Done;
        self.base.done = true;
        Ok(())
    }

    fn request_missing(&mut self, stack: &mut RoadStack) -> Result<()> {
        let sns: Vec<u32> = self
            .segments
            .iter()
            .enumerate()
            .filter(|(_, segment)| segment.is_none())
            .map(|(sn, _)| sn as u32)
            .collect();
        if sns.is_empty() {
            return Ok(());
        }
        let uid = self.base.index.remote;
        let (se, de) = {
            let remote = stack.remote(uid)?;
            (remote.uid, remote.fuid)
        };
        let mut head = self.base.head(PacketKind::Resend, se, de);
        head.bk = BodyKind::Json as u8;
        let bytes = serde_json::to_vec(&ResendBody { sns })?;
        let raw = packet::pack(head, &bytes, None, None)?;
        self.base.transmit(stack, raw);
        Ok(())
    }

    fn service(&mut self, stack: &mut RoadStack) {
        if self.base.done {
            return;
        }
        if self.base.timeout.expired() {
            tracing::debug!("{}: messengent timed out", stack.name_owned());
            self.state = MessengentState::TimedOut;
            self.base.done = true;
            return;
        }
        if self.base.redo.expired() {
            // stalled mid-reassembly: nudge the initiator for the gaps
            if let Err(err) = self.request_missing(stack) {
                tracing::debug!("{}: messengent abort: {}", stack.name_owned(), err);
                self.base.done = true;
            }
            let backoff = (self.base.redo.duration() * 2.0).min(REDO_TIMEOUT_MAX);
            self.base.redo.extend(backoff);
        }
    }
}
