//! DNS captive-portal responder (§4.K).
//!
//! Wire-format parsing follows the same label-walk texture as a resolver
//! client, but this side answers every A
//! query under the captive suffix with its own address, the standard
//! "every hostname resolves to me" trick a captive portal uses to get
//! clients to open the login page. Only type A / class IN queries are
//! answered (Non-goals: IPv6, so no AAAA support); anything else is
//! ignored rather than replied to with an error, matching §4.K.

use std::net::Ipv4Addr;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;
/// TTL preserved verbatim from the original firmware's hardcoded answer TTL.
const ANSWER_TTL: u32 = 0x0001_0001;

pub struct DnsResponder {
    answer_ip: Ipv4Addr,
    /// Queries for a name under this suffix (empty string matches any name)
    /// get answered; anything else is ignored. `""` means "answer every
    /// query", matching a pure captive-portal deployment.
    captive_suffix: String,
}

impl DnsResponder {
    pub fn new(answer_ip: Ipv4Addr, captive_suffix: &str) -> Self {
        DnsResponder { answer_ip, captive_suffix: captive_suffix.to_ascii_lowercase() }
    }

    fn matches_suffix(&self, name: &str) -> bool {
        self.captive_suffix.is_empty() || name.to_ascii_lowercase().ends_with(&self.captive_suffix)
    }

    /// Parse a DNS query packet, and if it is a single A/IN question this
    /// responder should answer, return the reply packet bytes. Returns
    /// `None` for anything else (multi-question packets, non-A/IN
    /// questions, or a name outside the captive suffix).
    pub fn handle(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let query = parse_query(packet)?;
        if query.qtype != TYPE_A || query.qclass != CLASS_IN {
            return None;
        }
        if !self.matches_suffix(&query.name) {
            return None;
        }
        Some(build_response(packet, &query, self.answer_ip))
    }
}

struct Query {
    name: String,
    qtype: u16,
    qclass: u16,
    /// Byte offset just past the question section, needed to locate where
    /// the question bytes end when copying them into the response.
    question_end: usize,
}

fn parse_query(packet: &[u8]) -> Option<Query> {
    if packet.len() < 12 {
        return None;
    }
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount != 1 {
        // Non-goals scope this to the single-question case a captive
        // client actually sends; anything else is simply not answered.
        return None;
    }
    let mut pos = 12;
    let mut labels = Vec::new();
    loop {
        let len = *packet.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        pos += 1;
        let label = packet.get(pos..pos + len)?;
        labels.push(std::str::from_utf8(label).ok()?.to_string());
        pos += len;
    }
    let qtype = u16::from_be_bytes([*packet.get(pos)?, *packet.get(pos + 1)?]);
    let qclass = u16::from_be_bytes([*packet.get(pos + 2)?, *packet.get(pos + 3)?]);
    pos += 4;
    Some(Query { name: labels.join("."), qtype, qclass, question_end: pos })
}

fn build_response(packet: &[u8], query: &Query, answer_ip: Ipv4Addr) -> Vec<u8> {
    let mut out = Vec::with_capacity(packet.len() + 16);
    out.extend_from_slice(&packet[0..2]); // transaction id
    out.push(0x84); // QR=1, opcode=0, AA=1, TC=0, RD=0
    out.push(0x00); // RA=0, Z=0, RCODE=0 (authoritative, non-recursive, no error)
    out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    out.extend_from_slice(&1u16.to_be_bytes()); // ancount
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&0u16.to_be_bytes()); // arcount
    out.extend_from_slice(&packet[12..query.question_end]); // echo the question verbatim

    out.extend_from_slice(&[0xC0, 0x0C]); // name: pointer back to the question
    out.extend_from_slice(&TYPE_A.to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    out.extend_from_slice(&ANSWER_TTL.to_be_bytes());
    out.extend_from_slice(&4u16.to_be_bytes()); // rdlength
    out.extend_from_slice(&answer_ip.octets());
    out
}
