use std::str::{from_utf8, FromStr};

use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};

const HEADER_LEN: usize = 12;
/// RR 固定部分：TYPE(2) CLASS(2) TTL(4) RDLENGTH(2)
const RR_FIXED_LEN: usize = 10;
/// OPT 伪记录的 TTL 字段承载 EDNS 标志，不参与 TTL 改写。
const TYPE_OPT: u16 = 41;
const TYPE_SOA: u16 = 6;
const MAX_POINTER_JUMPS: u8 = 5;

/// 快速解析出的查询要素，域名写入调用方缓冲区，避免分配。
/// Query essentials from the quick parser; the name lands in a caller
/// buffer so the hot path does not allocate.
pub struct QuickQuery<'a> {
    pub tx_id: u16,
    pub qname: &'a str,
    pub qtype: u16,
    pub qclass: u16,
}

/// Parse the DNS header and first question only. `buf` receives the
/// lowercased, dot-joined name and should hold at least 256 bytes.
/// Returns `None` for anything malformed; callers treat that as a drop.
pub fn parse_query_quick<'a>(packet: &[u8], buf: &'a mut [u8]) -> Option<QuickQuery<'a>> {
    if packet.len() < HEADER_LEN {
        return None;
    }

    let tx_id = u16::from_be_bytes([packet[0], packet[1]]);
    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    if qd_count == 0 {
        return None;
    }

    let mut written = 0usize;
    let mut cursor = HEADER_LEN;
    // Position just past the name in the question section; only advanced
    // until the first compression pointer.
    let mut after_name = None;
    let mut jumps = 0u8;

    loop {
        let len = *packet.get(cursor)?;
        if len == 0 {
            if after_name.is_none() {
                after_name = Some(cursor + 1);
            }
            break;
        }
        if len & 0xC0 == 0xC0 {
            let low = *packet.get(cursor + 1)?;
            if after_name.is_none() {
                after_name = Some(cursor + 2);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return None;
            }
            cursor = usize::from(len & 0x3F) << 8 | usize::from(low);
            continue;
        }

        let label = packet.get(cursor + 1..cursor + 1 + usize::from(len))?;
        if written > 0 {
            *buf.get_mut(written)? = b'.';
            written += 1;
        }
        for &b in label {
            *buf.get_mut(written)? = b.to_ascii_lowercase();
            written += 1;
        }
        cursor += 1 + usize::from(len);
    }

    let fixed = after_name?;
    let qtype = u16::from_be_bytes([*packet.get(fixed)?, *packet.get(fixed + 1)?]);
    let qclass = u16::from_be_bytes([*packet.get(fixed + 2)?, *packet.get(fixed + 3)?]);
    let qname = from_utf8(&buf[..written]).ok()?;

    Some(QuickQuery {
        tx_id,
        qname,
        qtype,
        qclass,
    })
}

/// Skip over an encoded name without following compression pointers
/// (a pointer terminates the in-place encoding).
fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *packet.get(pos)?;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            if packet.len() < pos + 2 {
                return None;
            }
            return Some(pos + 2);
        }
        pos += 1 + usize::from(len);
    }
}

/// Cache-relevant response metadata without a full message parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseMeta {
    pub rcode: u8,
    pub answer_count: u16,
    /// Minimum TTL over answer + authority records (OPT excluded).
    pub min_rr_ttl: Option<u32>,
    /// SOA MINIMUM from the authority section, for RFC 2308 negative TTLs.
    pub soa_minimum: Option<u32>,
}

impl ResponseMeta {
    /// NXDOMAIN or NODATA; everything else is a positive answer.
    pub fn is_negative(&self) -> bool {
        self.rcode != 0 || self.answer_count == 0
    }
}

/// Walk the question, answer and authority sections of a response and
/// extract what the cache insert policy needs. `None` means the message
/// is malformed and must not touch cache state.
pub fn parse_response_meta(packet: &[u8]) -> Option<ResponseMeta> {
    if packet.len() < HEADER_LEN {
        return None;
    }

    let rcode = packet[3] & 0x0F;
    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    let an_count = u16::from_be_bytes([packet[6], packet[7]]);
    let ns_count = u16::from_be_bytes([packet[8], packet[9]]);

    let mut pos = HEADER_LEN;
    for _ in 0..qd_count {
        pos = skip_name(packet, pos)?;
        pos += 4;
    }
    if pos > packet.len() {
        return None;
    }

    let mut min_rr_ttl: Option<u32> = None;
    let mut soa_minimum: Option<u32> = None;

    for section in [an_count, ns_count] {
        for _ in 0..section {
            pos = skip_name(packet, pos)?;
            let fixed = packet.get(pos..pos + RR_FIXED_LEN)?;
            let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
            let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
            let rd_len = usize::from(u16::from_be_bytes([fixed[8], fixed[9]]));
            let rd_start = pos + RR_FIXED_LEN;
            if packet.len() < rd_start + rd_len {
                return None;
            }

            if rtype != TYPE_OPT {
                min_rr_ttl = Some(min_rr_ttl.map_or(ttl, |m| m.min(ttl)));
            }
            if rtype == TYPE_SOA && soa_minimum.is_none() {
                soa_minimum = parse_soa_minimum(packet, rd_start, rd_len);
            }
            pos = rd_start + rd_len;
        }
    }

    Some(ResponseMeta {
        rcode,
        answer_count: an_count,
        min_rr_ttl,
        soa_minimum,
    })
}

/// SOA RDATA = MNAME RNAME SERIAL(4) REFRESH(4) RETRY(4) EXPIRE(4) MINIMUM(4).
fn parse_soa_minimum(packet: &[u8], rd_start: usize, rd_len: usize) -> Option<u32> {
    let rd_end = rd_start + rd_len;
    let pos = skip_name(packet, rd_start)?;
    let pos = skip_name(packet, pos)?;
    if pos + 20 > rd_end {
        return None;
    }
    let minimum = packet.get(pos + 16..pos + 20)?;
    Some(u32::from_be_bytes([
        minimum[0], minimum[1], minimum[2], minimum[3],
    ]))
}

/// Re-stamp a cached reply for a client: overwrite the transaction id and
/// age every RR TTL down to `max(1, ttl - age_secs)`. OPT pseudo-records
/// keep their TTL field as-is.
pub fn rewrite_for_client(wire: &[u8], client_id: u16, age_secs: u64) -> Option<Bytes> {
    if wire.len() < HEADER_LEN {
        return None;
    }
    let mut out = wire.to_vec();
    out[0..2].copy_from_slice(&client_id.to_be_bytes());

    let qd_count = u16::from_be_bytes([out[4], out[5]]);
    let records = u16::from_be_bytes([out[6], out[7]]) as u32
        + u16::from_be_bytes([out[8], out[9]]) as u32
        + u16::from_be_bytes([out[10], out[11]]) as u32;
    let age = u32::try_from(age_secs).unwrap_or(u32::MAX);

    let mut pos = HEADER_LEN;
    for _ in 0..qd_count {
        pos = skip_name(&out, pos)?;
        pos += 4;
    }

    for _ in 0..records {
        pos = skip_name(&out, pos)?;
        if out.len() < pos + RR_FIXED_LEN {
            return None;
        }
        let rtype = u16::from_be_bytes([out[pos], out[pos + 1]]);
        if rtype != TYPE_OPT {
            let ttl = u32::from_be_bytes([out[pos + 4], out[pos + 5], out[pos + 6], out[pos + 7]]);
            let aged = ttl.saturating_sub(age).max(1);
            out[pos + 4..pos + 8].copy_from_slice(&aged.to_be_bytes());
        }
        let rd_len = usize::from(u16::from_be_bytes([out[pos + 8], out[pos + 9]]));
        pos += RR_FIXED_LEN + rd_len;
        if pos > out.len() {
            return None;
        }
    }

    Some(Bytes::from(out))
}

/// Synthesise an answerless reply (SERVFAIL and friends) echoing the
/// question from a quick-parsed query.
pub fn build_reply(
    tx_id: u16,
    qname: &str,
    qtype: u16,
    qclass: u16,
    rcode: ResponseCode,
) -> Option<Bytes> {
    let mut msg = Message::new();
    msg.set_id(tx_id);
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.set_recursion_available(true);
    msg.set_response_code(rcode);

    let name = Name::from_str(qname).ok()?;
    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(RecordType::from(qtype));
    query.set_query_class(DNSClass::from(qclass));
    msg.add_query(query);

    encode(&msg)
}

/// Synthesise a plain recursive query, used by background refresh.
pub fn build_query(tx_id: u16, qname: &str, qtype: u16, qclass: u16) -> Option<Bytes> {
    let mut msg = Message::new();
    msg.set_id(tx_id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);

    let name = Name::from_str(qname).ok()?;
    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(RecordType::from(qtype));
    query.set_query_class(DNSClass::from(qclass));
    msg.add_query(query);

    encode(&msg)
}

fn encode(msg: &Message) -> Option<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder).ok()?;
    }
    Some(Bytes::from(out))
}

/// Warmup-file qtype token: IANA mnemonic (case-insensitive) or a numeric
/// type id that maps to a known record type.
pub fn parse_qtype(token: &str) -> Option<u16> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    if token.bytes().all(|b| b.is_ascii_digit()) {
        let id: u16 = token.parse().ok()?;
        return match RecordType::from(id) {
            RecordType::Unknown(_) => None,
            _ => Some(id),
        };
    }
    let rtype = RecordType::from_str(&token.to_ascii_uppercase()).ok()?;
    Some(u16::from(rtype))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hickory_proto::op::Edns;
    use hickory_proto::rr::rdata::{A, SOA};
    use hickory_proto::rr::{RData, Record};
    use hickory_proto::serialize::binary::BinDecodable;

    fn a_query(id: u16, name: &str) -> Vec<u8> {
        build_query(id, name, u16::from(RecordType::A), u16::from(DNSClass::IN))
            .expect("query")
            .to_vec()
    }

    pub(crate) fn a_reply(id: u16, name: &str, addr: [u8; 4], ttl: u32) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.set_recursion_available(true);
        let owner = Name::from_str(name).expect("name");
        let mut query = Query::new();
        query.set_name(owner.clone());
        query.set_query_type(RecordType::A);
        query.set_query_class(DNSClass::IN);
        msg.add_query(query);
        msg.add_answer(Record::from_rdata(
            owner,
            ttl,
            RData::A(A::new(addr[0], addr[1], addr[2], addr[3])),
        ));
        msg.to_bytes().expect("encode")
    }

    fn nxdomain_with_soa(id: u16, name: &str, minimum: u32) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.set_response_code(ResponseCode::NXDomain);
        let owner = Name::from_str(name).expect("name");
        let mut query = Query::new();
        query.set_name(owner);
        query.set_query_type(RecordType::A);
        query.set_query_class(DNSClass::IN);
        msg.add_query(query);
        let zone = Name::from_str("example.com.").expect("zone");
        let soa = SOA::new(
            Name::from_str("ns1.example.com.").expect("mname"),
            Name::from_str("hostmaster.example.com.").expect("rname"),
            2024010101,
            7200,
            900,
            1209600,
            minimum,
        );
        msg.add_name_server(Record::from_rdata(zone, 3600, RData::SOA(soa)));
        msg.to_bytes().expect("encode")
    }

    #[test]
    fn quick_parse_recovers_and_lowercases_the_question() {
        let wire = a_query(0x1234, "WwW.ExAmPle.COM");
        let mut buf = [0u8; 256];
        let q = parse_query_quick(&wire, &mut buf).expect("parse");
        assert_eq!(q.tx_id, 0x1234);
        assert_eq!(q.qname, "www.example.com");
        assert_eq!(q.qtype, 1);
        assert_eq!(q.qclass, 1);
    }

    #[test]
    fn quick_parse_rejects_short_and_empty_packets() {
        let mut buf = [0u8; 256];
        assert!(parse_query_quick(&[], &mut buf).is_none());
        assert!(parse_query_quick(&[0u8; 11], &mut buf).is_none());
        // Header claims a question that is not there.
        let mut wire = vec![0u8; 12];
        wire[5] = 1;
        assert!(parse_query_quick(&wire, &mut buf).is_none());
    }

    #[test]
    fn quick_parse_rejects_pointer_loops() {
        // Question name is a pointer at offset 12 pointing to itself.
        let mut wire = vec![0u8; 18];
        wire[5] = 1; // qd_count
        wire[12] = 0xC0;
        wire[13] = 12;
        let mut buf = [0u8; 256];
        assert!(parse_query_quick(&wire, &mut buf).is_none());
    }

    #[test]
    fn response_meta_minimum_ttl_and_rcode() {
        let wire = a_reply(9, "example.com.", [93, 184, 216, 34], 300);
        let meta = parse_response_meta(&wire).expect("meta");
        assert_eq!(meta.rcode, 0);
        assert_eq!(meta.answer_count, 1);
        assert_eq!(meta.min_rr_ttl, Some(300));
        assert!(!meta.is_negative());
    }

    #[test]
    fn response_meta_finds_soa_minimum_for_negatives() {
        let wire = nxdomain_with_soa(9, "gone.example.com.", 60);
        let meta = parse_response_meta(&wire).expect("meta");
        assert_eq!(meta.rcode, 3);
        assert_eq!(meta.answer_count, 0);
        assert_eq!(meta.soa_minimum, Some(60));
        assert!(meta.is_negative());
    }

    #[test]
    fn response_meta_rejects_truncated_records() {
        let mut wire = a_reply(9, "example.com.", [1, 2, 3, 4], 300);
        wire.truncate(wire.len() - 3);
        assert!(parse_response_meta(&wire).is_none());
    }

    #[test]
    fn rewrite_decrements_ttls_and_stamps_the_client_id() {
        let wire = a_reply(0x0101, "example.com.", [93, 184, 216, 34], 300);
        let aged = rewrite_for_client(&wire, 0xBEEF, 10).expect("rewrite");
        let msg = Message::from_bytes(&aged).expect("decode");
        assert_eq!(msg.id(), 0xBEEF);
        assert_eq!(msg.answers()[0].ttl(), 290);
    }

    #[test]
    fn rewrite_floors_expired_ttls_at_one() {
        let wire = a_reply(7, "example.com.", [93, 184, 216, 34], 300);
        let aged = rewrite_for_client(&wire, 7, 310).expect("rewrite");
        let msg = Message::from_bytes(&aged).expect("decode");
        assert_eq!(msg.answers()[0].ttl(), 1);
    }

    #[test]
    fn rewrite_leaves_opt_pseudo_records_alone() {
        let mut msg = Message::new();
        msg.set_id(1);
        msg.set_message_type(MessageType::Response);
        let owner = Name::from_str("example.com.").expect("name");
        let mut query = Query::new();
        query.set_name(owner.clone());
        query.set_query_type(RecordType::A);
        msg.add_query(query);
        msg.add_answer(Record::from_rdata(owner, 120, RData::A(A::new(1, 2, 3, 4))));
        let mut edns = Edns::new();
        edns.set_max_payload(1232);
        msg.set_edns(edns);
        let wire = msg.to_bytes().expect("encode");

        let aged = rewrite_for_client(&wire, 1, 60).expect("rewrite");
        let back = Message::from_bytes(&aged).expect("decode");
        assert_eq!(back.answers()[0].ttl(), 60);
        let edns = back.extensions().as_ref().expect("edns survived");
        assert_eq!(edns.max_payload(), 1232);
    }

    #[test]
    fn build_reply_echoes_the_question() {
        let reply = build_reply(0x4242, "example.com", 1, 1, ResponseCode::ServFail).expect("build");
        let msg = Message::from_bytes(&reply).expect("decode");
        assert_eq!(msg.id(), 0x4242);
        assert_eq!(msg.response_code(), ResponseCode::ServFail);
        assert_eq!(msg.queries().len(), 1);
        assert_eq!(msg.queries()[0].name().to_ascii(), "example.com.");
    }

    #[test]
    fn qtype_tokens_accept_mnemonics_and_numbers() {
        assert_eq!(parse_qtype("a"), Some(1));
        assert_eq!(parse_qtype("AAAA"), Some(28));
        assert_eq!(parse_qtype("mx"), Some(15));
        assert_eq!(parse_qtype("28"), Some(28));
        assert_eq!(parse_qtype("not-a-type"), None);
        assert_eq!(parse_qtype(""), None);
    }
}
