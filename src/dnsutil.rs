use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};

/// Maximum TTL from RFC 2181.
const MAX_TTL: u32 = (1 << 31) - 1;

/// 32-bit FNV-1a over the lowercased name plus qtype and qclass in network
/// order. The result doubles as the persistent cache key, so it has to stay
/// identical across restarts and platforms.
pub fn fingerprint(name: &str, qtype: u16, qclass: u16) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET;
    for b in name.bytes() {
        hash ^= b.to_ascii_lowercase() as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    for b in qtype.to_be_bytes().into_iter().chain(qclass.to_be_bytes()) {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Lowest TTL across the answer, authority and additional sections. OPT is a
/// pseudo record whose TTL field carries extended RCODE and flags, so it is
/// skipped.
pub fn min_ttl(msg: &Message) -> Duration {
    let mut ttl = MAX_TTL;
    for record in msg.answers() {
        ttl = ttl.min(record.ttl());
    }
    for record in msg.name_servers() {
        ttl = ttl.min(record.ttl());
    }
    for record in msg.additionals() {
        if record.record_type() == RecordType::OPT {
            continue;
        }
        ttl = ttl.min(record.ttl());
    }
    Duration::from_secs(ttl as u64)
}

/// Textual values of the answer section, in record order.
pub fn answers(msg: &Message) -> Vec<String> {
    let mut values = Vec::with_capacity(msg.answer_count() as usize);
    for record in msg.answers() {
        let value = match record.data() {
            Some(RData::A(a)) => a.0.to_string(),
            Some(RData::AAAA(aaaa)) => aaaa.0.to_string(),
            Some(RData::CNAME(cname)) => cname.0.to_string(),
            Some(RData::MX(mx)) => mx.exchange().to_string(),
            Some(RData::NS(ns)) => ns.0.to_string(),
            Some(RData::PTR(ptr)) => ptr.0.to_string(),
            Some(RData::TXT(txt)) => txt.to_string(),
            _ => continue,
        };
        values.push(value);
    }
    values
}

/// Starts a reply to `req`: response header, echoed id, opcode, question and
/// recursion-desired bit, with recursion-available set since the service
/// forwards on behalf of the client.
pub fn reply_to(req: &Message) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(req.op_code());
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::NoError);
    if let Some(q) = req.queries().first() {
        msg.add_query(q.clone());
    }
    msg
}

pub fn encode(msg: &Message) -> anyhow::Result<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder).context("encode message")?;
    }
    Ok(Bytes::from(out))
}

pub fn decode(packet: &[u8]) -> anyhow::Result<Message> {
    Message::from_bytes(packet).context("decode message")
}

/// SERVFAIL for a request that could not be handled. Falls back to a bare
/// header echo when the request itself does not decode.
pub fn servfail(packet: &[u8]) -> Option<Bytes> {
    if let Ok(req) = Message::from_bytes(packet) {
        let mut msg = reply_to(&req);
        msg.set_response_code(ResponseCode::ServFail);
        if let Ok(bytes) = encode(&msg) {
            return Some(bytes);
        }
    }
    if packet.len() < 2 {
        return None;
    }
    let mut msg = Message::new();
    msg.set_id(u16::from_be_bytes([packet[0], packet[1]]));
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::ServFail);
    encode(&msg).ok()
}
