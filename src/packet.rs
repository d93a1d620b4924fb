//! Wire codec.
//!
//! A packet is four concatenated sections: a JSON head of two-letter fields
//! terminated by a blank `\r\n\r\n` line, the body (or the coat sealing it),
//! and the foot. The head field codes and kind values are the wire contract;
//! peers disagreeing on them cannot interoperate.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{Boxer, Signer, SIG_SIZE};
use crate::error::{Error, Result};

pub const RAET_VERSION: u8 = 1;
pub const HEAD_END: &[u8] = b"\r\n\r\n";
/// Largest datagram the stack will emit or accept.
pub const MAX_PACKET_SIZE: usize = 65535;
/// Payload bytes carried per message segment.
pub const SEGMENT_SIZE: usize = 16 * 1024;
/// Segment counts above this abort the message with an overflow.
pub const MAX_SEGMENT_COUNT: u32 = 4096;

/// Packet kind, `pk`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PacketKind {
    /// Join request from the initiator.
    Request = 1,
    /// Join response carrying the correspondent identity and assigned uid.
    Accept = 2,
    /// Join held for operator acceptance.
    Pend = 3,
    Ack = 4,
    Nack = 5,
    /// Abort without penalty.
    Refuse = 6,
    /// Abort and poison acceptance.
    Reject = 7,
    /// Redo the join from scratch with vacuous semantics.
    Renew = 8,
    /// Allow opener carrying the initiator short-term public key.
    Hello = 9,
    Cookie = 10,
    Initiate = 11,
    Message = 12,
    /// Request retransmission of named segments.
    Resend = 13,
    Unjoined = 14,
    Unallowed = 15,
}

impl TryFrom<u8> for PacketKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        use PacketKind::*;
        Ok(match value {
            1 => Request,
            2 => Accept,
            3 => Pend,
            4 => Ack,
            5 => Nack,
            6 => Refuse,
            7 => Reject,
            8 => Renew,
            9 => Hello,
            10 => Cookie,
            11 => Initiate,
            12 => Message,
            13 => Resend,
            14 => Unjoined,
            15 => Unallowed,
            other => return Err(Error::Parse(format!("unknown packet kind {other}"))),
        })
    }
}

/// Transaction kind, `tk`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum TransKind {
    Join = 1,
    Allow = 2,
    Message = 3,
}

impl TryFrom<u8> for TransKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => TransKind::Join,
            2 => TransKind::Allow,
            3 => TransKind::Message,
            other => return Err(Error::Parse(format!("unknown transaction kind {other}"))),
        })
    }
}

/// Body codec, `bk`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum BodyKind {
    Nada = 0,
    Json = 1,
    Msgpack = 2,
}

impl TryFrom<u8> for BodyKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => BodyKind::Nada,
            1 => BodyKind::Json,
            2 => BodyKind::Msgpack,
            other => return Err(Error::Parse(format!("unknown body kind {other}"))),
        })
    }
}

/// Coat codec, `ck`. `Nacl` is the session box.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CoatKind {
    Nada = 0,
    Nacl = 1,
}

/// Foot codec, `fk`. `Nacl` is a 64-byte Ed25519 signature over everything
/// before the foot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FootKind {
    Nada = 0,
    Nacl = 1,
}

fn default_sc() -> u32 {
    1
}

/// Packet head. Field names are the on-wire codes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Head {
    /// Protocol version.
    pub vn: u8,
    /// Packet kind.
    pub pk: u8,
    /// Source estate uid: the sender's table handle for the remote.
    pub se: u32,
    /// Destination estate uid: the receiver's handle for the sender, 0 when
    /// vacuous.
    pub de: u32,
    /// Correspondent flag: sender is the transaction correspondent.
    #[serde(default)]
    pub cf: bool,
    /// Burst flag: segment sent without per-segment ack.
    #[serde(default)]
    pub bf: bool,
    /// Session id.
    pub si: u32,
    /// Transaction id.
    pub ti: u32,
    /// Transaction kind.
    pub tk: u8,
    /// Segment number.
    #[serde(default)]
    pub sn: u32,
    /// Segment count.
    #[serde(default = "default_sc")]
    pub sc: u32,
    /// Ack requested.
    #[serde(default)]
    pub af: bool,
    /// Nonce kind and length (inside the coat).
    #[serde(default)]
    pub nk: u8,
    #[serde(default)]
    pub nl: u32,
    /// Body kind and plaintext length.
    pub bk: u8,
    #[serde(default)]
    pub bl: u32,
    /// Coat kind and length.
    #[serde(default)]
    pub ck: u8,
    #[serde(default)]
    pub cl: u32,
    /// Foot kind and length.
    #[serde(default)]
    pub fk: u8,
    #[serde(default)]
    pub fl: u32,
    /// Reserved flags.
    #[serde(default)]
    pub fg: u8,
}

impl Head {
    pub fn new(pk: PacketKind, tk: TransKind) -> Self {
        Head {
            vn: RAET_VERSION,
            pk: pk as u8,
            se: 0,
            de: 0,
            cf: false,
            bf: false,
            si: 0,
            ti: 0,
            tk: tk as u8,
            sn: 0,
            sc: 1,
            af: false,
            nk: 0,
            nl: 0,
            bk: BodyKind::Nada as u8,
            bl: 0,
            ck: CoatKind::Nada as u8,
            cl: 0,
            fk: FootKind::Nada as u8,
            fl: 0,
            fg: 0,
        }
    }

    pub fn packet_kind(&self) -> Result<PacketKind> {
        PacketKind::try_from(self.pk)
    }

    pub fn trans_kind(&self) -> Result<TransKind> {
        TransKind::try_from(self.tk)
    }

    pub fn body_kind(&self) -> Result<BodyKind> {
        BodyKind::try_from(self.bk)
    }
}

/// Packs one packet: head, body (sealed in a coat when a boxer is given),
/// and an Ed25519 foot when a signer is given.
pub fn pack(mut head: Head, body: &[u8], boxer: Option<&Boxer>, signer: Option<&Signer>) -> Result<Vec<u8>> {
    head.bl = body.len() as u32;
    let payload = match boxer {
        Some(boxer) => {
            let coat = boxer.encrypt(body);
            head.ck = CoatKind::Nacl as u8;
            head.cl = coat.len() as u32;
            head.nk = 1;
            head.nl = crate::crypto::NONCE_SIZE as u32;
            coat
        }
        None => body.to_vec(),
    };
    if signer.is_some() {
        head.fk = FootKind::Nacl as u8;
        head.fl = SIG_SIZE as u32;
    }

    let mut raw = serde_json::to_vec(&head)?;
    raw.extend_from_slice(HEAD_END);
    raw.extend_from_slice(&payload);
    if let Some(signer) = signer {
        let sig = signer.sign(&raw);
        raw.extend_from_slice(&sig);
    }
    if raw.len() > MAX_PACKET_SIZE {
        return Err(Error::Parse(format!("packet of {} bytes too large", raw.len())));
    }
    Ok(raw)
}

/// A parsed inbound packet. Verification and unsealing are deferred until
/// the owning transaction knows which remote keys apply.
#[derive(Clone, Debug)]
pub struct RxPacket {
    pub head: Head,
    payload: Vec<u8>,
    foot: Vec<u8>,
    /// The span covered by the foot: head, separator, payload.
    signed: Vec<u8>,
}

impl RxPacket {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() > MAX_PACKET_SIZE {
            return Err(Error::Parse("datagram too large".into()));
        }
        let end = raw
            .windows(HEAD_END.len())
            .position(|window| window == HEAD_END)
            .ok_or_else(|| Error::Parse("unterminated head".into()))?;
        let head: Head = serde_json::from_slice(&raw[..end])?;
        if head.vn != RAET_VERSION {
            return Err(Error::Parse(format!("unsupported version {}", head.vn)));
        }
        head.packet_kind()?;
        head.trans_kind()?;

        let rest = &raw[end + HEAD_END.len()..];
        let payload_len = if head.ck == CoatKind::Nada as u8 {
            head.bl as usize
        } else {
            head.cl as usize
        };
        let foot_len = head.fl as usize;
        if rest.len() != payload_len + foot_len {
            return Err(Error::Parse("section lengths disagree with head".into()));
        }
        Ok(RxPacket {
            head,
            payload: rest[..payload_len].to_vec(),
            foot: rest[payload_len..].to_vec(),
            signed: raw[..raw.len() - foot_len].to_vec(),
        })
    }

    /// Checks the Ed25519 foot against a peer verify key.
    pub fn verify(&self, verfer: &crate::crypto::Verfer) -> Result<()> {
        if self.head.fk != FootKind::Nacl as u8 {
            return Err(Error::Signature);
        }
        verfer.verify(&self.foot, &self.signed)
    }

    /// Plaintext body bytes, unsealing the coat when one is present.
    pub fn body_bytes(&self, boxer: Option<&Boxer>) -> Result<Vec<u8>> {
        if self.head.ck == CoatKind::Nada as u8 {
            Ok(self.payload.clone())
        } else {
            boxer.ok_or(Error::Signature)?.decrypt(&self.payload)
        }
    }

    /// Decoded body value per the head's body kind.
    pub fn body_value(&self, boxer: Option<&Boxer>) -> Result<Value> {
        decode_body(&self.body_bytes(boxer)?, self.head.body_kind()?)
    }
}

pub fn encode_body(value: &Value, kind: BodyKind) -> Result<Vec<u8>> {
    match kind {
        BodyKind::Nada => Ok(Vec::new()),
        BodyKind::Json => Ok(serde_json::to_vec(value)?),
        BodyKind::Msgpack => Ok(rmp_serde::to_vec_named(value)?),
    }
}

pub fn decode_body(bytes: &[u8], kind: BodyKind) -> Result<Value> {
    match kind {
        BodyKind::Nada => Ok(Value::Null),
        BodyKind::Json => {
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            Ok(serde_json::from_slice(bytes)?)
        }
        BodyKind::Msgpack => {
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            Ok(rmp_serde::from_slice(bytes)?)
        }
    }
}

/// Splits a serialized message into segment payloads. An empty body still
/// occupies one segment.
pub fn segmentize(body: &[u8]) -> Result<Vec<Vec<u8>>> {
    if body.is_empty() {
        return Ok(vec![Vec::new()]);
    }
    let count = body.len().div_ceil(SEGMENT_SIZE);
    if count as u32 > MAX_SEGMENT_COUNT {
        return Err(Error::Overflow(count as u32));
    }
    Ok(body.chunks(SEGMENT_SIZE).map(<[u8]>::to_vec).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Privateer;

    #[test]
    fn head_json_roundtrip() {
        let mut head = Head::new(PacketKind::Request, TransKind::Join);
        head.se = 2;
        head.si = 0;
        head.ti = 7;
        head.bk = BodyKind::Json as u8;
        let text = serde_json::to_string(&head).unwrap();
        let back: Head = serde_json::from_str(&text).unwrap();
        assert_eq!(back.pk, PacketKind::Request as u8);
        assert_eq!(back.se, 2);
        assert_eq!(back.ti, 7);
        assert_eq!(back.sc, 1);
    }

    #[test]
    fn pack_parse_plain() {
        let mut head = Head::new(PacketKind::Ack, TransKind::Join);
        head.se = 2;
        head.de = 3;
        head.ti = 1;
        head.bk = BodyKind::Json as u8;
        let body = serde_json::to_vec(&serde_json::json!({"name": "other"})).unwrap();
        let raw = pack(head, &body, None, None).unwrap();

        let pckt = RxPacket::parse(&raw).unwrap();
        assert_eq!(pckt.head.packet_kind().unwrap(), PacketKind::Ack);
        assert_eq!(pckt.body_bytes(None).unwrap(), body);
        assert_eq!(
            pckt.body_value(None).unwrap()["name"],
            serde_json::json!("other")
        );
    }

    #[test]
    fn pack_parse_signed() {
        let signer = Signer::new();
        let mut head = Head::new(PacketKind::Request, TransKind::Join);
        head.bk = BodyKind::Json as u8;
        let body = br#"{"role":"other"}"#;
        let raw = pack(head, body, None, Some(&signer)).unwrap();

        let pckt = RxPacket::parse(&raw).unwrap();
        pckt.verify(&signer.verfer()).unwrap();
        assert!(pckt.verify(&Signer::new().verfer()).is_err());

        // flipping a body byte breaks the foot
        let mut bent = raw.clone();
        let at = bent.len() - SIG_SIZE - 2;
        bent[at] ^= 1;
        let pckt = RxPacket::parse(&bent).unwrap();
        assert!(pckt.verify(&signer.verfer()).is_err());
    }

    #[test]
    fn pack_parse_coated() {
        let ours = Privateer::new();
        let theirs = Privateer::new();
        let tx = Boxer::new(&ours.shared(&theirs.pubber()));
        let rx = Boxer::new(&theirs.shared(&ours.pubber()));

        let mut head = Head::new(PacketKind::Message, TransKind::Message);
        head.bk = BodyKind::Msgpack as u8;
        let body = encode_body(&serde_json::json!({"content": "hi"}), BodyKind::Msgpack).unwrap();
        let raw = pack(head, &body, Some(&tx), None).unwrap();

        let pckt = RxPacket::parse(&raw).unwrap();
        assert_eq!(pckt.head.ck, CoatKind::Nacl as u8);
        assert_eq!(pckt.head.bl as usize, body.len());
        let value = pckt.body_value(Some(&rx)).unwrap();
        assert_eq!(value["content"], serde_json::json!("hi"));

        // without the session key the coat stays shut
        assert!(pckt.body_bytes(None).is_err());
        let stranger = Boxer::new(&Privateer::new().shared(&ours.pubber()));
        assert!(pckt.body_bytes(Some(&stranger)).is_err());
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(RxPacket::parse(b"no head end here").is_err());
        assert!(RxPacket::parse(b"{}\r\n\r\n").is_err()); // missing required fields

        // length mismatch
        let head = Head::new(PacketKind::Ack, TransKind::Join);
        let mut raw = pack(head, b"", None, None).unwrap();
        raw.extend_from_slice(b"trailing");
        assert!(RxPacket::parse(&raw).is_err());

        // unknown kinds
        let mut head = Head::new(PacketKind::Ack, TransKind::Join);
        head.pk = 99;
        let raw = pack(head, b"", None, None).unwrap();
        assert!(RxPacket::parse(&raw).is_err());
    }

    #[test]
    fn segments_split_and_cap() {
        assert_eq!(segmentize(b"").unwrap().len(), 1);
        assert_eq!(segmentize(&[0u8; SEGMENT_SIZE]).unwrap().len(), 1);
        let split = segmentize(&[0u8; SEGMENT_SIZE + 1]).unwrap();
        assert_eq!(split.len(), 2);
        assert_eq!(split[0].len(), SEGMENT_SIZE);
        assert_eq!(split[1].len(), 1);

        let oversize = vec![0u8; (MAX_SEGMENT_COUNT as usize + 1) * SEGMENT_SIZE];
        assert!(matches!(segmentize(&oversize), Err(Error::Overflow(_))));
    }

    #[test]
    fn body_codecs_roundtrip() {
        let value = serde_json::json!({"content": "hello", "n": 3});
        for kind in [BodyKind::Json, BodyKind::Msgpack] {
            let bytes = encode_body(&value, kind).unwrap();
            assert_eq!(decode_body(&bytes, kind).unwrap(), value);
        }
        assert_eq!(decode_body(b"", BodyKind::Nada).unwrap(), Value::Null);
    }
}
