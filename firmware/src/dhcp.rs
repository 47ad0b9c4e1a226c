//! DHCP responder for the captive-portal `/24` subnet (§4.J).
//!
//! Packet-field layout and option parsing follow standard BOOTP/DHCP wire
//! texture; this firmware plays the server role, so the DISCOVER/REQUEST
//! handling and lease table are specific to that. The lease table is a
//! plain `Vec<Lease>` kept sorted with `Vec::sort_by_key`, which is stable
//! and total regardless of ties (an in-place pointer-swap insertion sort
//! can leave two equal-comparing leases unsorted; this avoids that class
//! of bug entirely).

use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

#[derive(Debug, Clone)]
pub struct Lease {
    /// `None` marks the server's own reserved entry (§3: "the server owns
    /// the first lease (itself)"); it never matches a client's request and
    /// never expires.
    pub mac: Option<MacAddr>,
    pub ip: Ipv4Addr,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Request,
    Decline,
    Release,
    Inform,
}

#[derive(Debug)]
pub struct DhcpRequest {
    pub mac: MacAddr,
    pub message_type: MessageType,
    pub requested_ip: Option<Ipv4Addr>,
}

#[derive(Debug)]
pub enum DhcpReply {
    Offer(Ipv4Addr),
    Ack(Ipv4Addr),
    Nak,
    /// No reply is sent (Release/Inform, or Decline from an unknown host).
    None,
}

pub const LEASE_DURATION: Duration = Duration::from_secs(3600);

/// BOOTP magic cookie that marks the start of the DHCP options area (RFC 1497).
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
const OP_BOOTREQUEST: u8 = 1;
const OP_BOOTREPLY: u8 = 2;
const HTYPE_ETHER: u8 = 1;
const HLEN_ETHER: u8 = 6;
const OPT_PAD: u8 = 0;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_SERVER_ID: u8 = 54;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_LEASE_TIME: u8 = 51;
const OPT_END: u8 = 255;
const DHCPDISCOVER: u8 = 1;
const DHCPREQUEST: u8 = 3;
const DHCPDECLINE: u8 = 4;
const DHCPACK: u8 = 5;
const DHCPNAK: u8 = 6;
const DHCPRELEASE: u8 = 7;
const DHCPINFORM: u8 = 8;

/// Walks the `(type, length, value)` option area of a BOOTP packet (§4.J),
/// honoring `PAD` (0, length-less) and stopping at `END` (255) or the end
/// of the buffer, whichever comes first.
fn parse_options(mut opts: &[u8]) -> Vec<(u8, &[u8])> {
    let mut out = Vec::new();
    while let Some(&tag) = opts.first() {
        if tag == OPT_END {
            break;
        }
        if tag == OPT_PAD {
            opts = &opts[1..];
            continue;
        }
        let Some(&len) = opts.get(1) else { break };
        let len = len as usize;
        let Some(value) = opts.get(2..2 + len) else { break };
        out.push((tag, value));
        opts = &opts[2 + len..];
    }
    out
}

/// Decodes a BOOTREQUEST packet into the fields the lease logic needs.
/// Rejects relayed requests (`giaddr != 0`) per spec §4.J ("no subnets" —
/// this responder only ever talks to clients on its own broadcast domain).
pub fn decode_request(packet: &[u8]) -> Option<(DhcpRequest, u32)> {
    if packet.len() < 240 || packet[0] != OP_BOOTREQUEST {
        return None;
    }
    let htype = packet[1];
    let hlen = packet[2];
    let xid = u32::from_be_bytes(packet[4..8].try_into().ok()?);
    let giaddr = &packet[24..28];
    if giaddr != [0, 0, 0, 0] {
        return None;
    }
    if htype != HTYPE_ETHER || hlen != HLEN_ETHER {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&packet[28..34]);
    if packet[236..240] != MAGIC_COOKIE {
        return None;
    }
    let opts = parse_options(&packet[240..]);
    let mut message_type = None;
    let mut requested_ip = None;
    for (tag, value) in &opts {
        match *tag {
            OPT_MESSAGE_TYPE if value.len() == 1 => {
                message_type = Some(match value[0] {
                    DHCPDISCOVER => MessageType::Discover,
                    DHCPREQUEST => MessageType::Request,
                    DHCPDECLINE => MessageType::Decline,
                    DHCPRELEASE => MessageType::Release,
                    DHCPINFORM => MessageType::Inform,
                    _ => return None,
                });
            }
            OPT_REQUESTED_IP if value.len() == 4 => {
                requested_ip = Some(Ipv4Addr::new(value[0], value[1], value[2], value[3]));
            }
            _ => {}
        }
    }
    let message_type = message_type?;
    Some((DhcpRequest { mac: MacAddr(mac), message_type, requested_ip }, xid))
}

/// Encodes a BOOTREPLY for `reply`, echoing `xid` and `chaddr` from the
/// originating request. Returns `None` for `DhcpReply::None` (Release and
/// Inform never get a reply, per spec §4.J).
pub fn encode_reply(reply: &DhcpReply, xid: u32, chaddr: MacAddr, server_ip: Ipv4Addr, subnet_mask: Ipv4Addr) -> Option<Vec<u8>> {
    let (yiaddr, msg_type) = match reply {
        DhcpReply::Offer(ip) => (*ip, DHCPOFFER),
        DhcpReply::Ack(ip) => (*ip, DHCPACK),
        DhcpReply::Nak => (Ipv4Addr::UNSPECIFIED, DHCPNAK),
        DhcpReply::None => return None,
    };

    let mut pkt = vec![0u8; 240];
    pkt[0] = OP_BOOTREPLY;
    pkt[1] = HTYPE_ETHER;
    pkt[2] = HLEN_ETHER;
    pkt[3] = 0; // hops
    pkt[4..8].copy_from_slice(&xid.to_be_bytes());
    pkt[8..10].copy_from_slice(&0u16.to_be_bytes()); // secs
    pkt[10..12].copy_from_slice(&0u16.to_be_bytes()); // flags (unicast)
    pkt[12..16].copy_from_slice(&[0, 0, 0, 0]); // ciaddr
    pkt[16..20].copy_from_slice(&yiaddr.octets());
    pkt[20..24].copy_from_slice(&server_ip.octets()); // siaddr
    pkt[24..28].copy_from_slice(&[0, 0, 0, 0]); // giaddr
    pkt[28..34].copy_from_slice(&chaddr.0);
    // sname/file (34..236) left zeroed
    pkt[236..240].copy_from_slice(&MAGIC_COOKIE);

    let mut opts = Vec::new();
    opts.push(OPT_MESSAGE_TYPE);
    opts.push(1);
    opts.push(msg_type);
    opts.push(OPT_SERVER_ID);
    opts.push(4);
    opts.extend_from_slice(&server_ip.octets());
    if !matches!(reply, DhcpReply::Nak) {
        opts.push(OPT_SUBNET_MASK);
        opts.push(4);
        opts.extend_from_slice(&subnet_mask.octets());
        opts.push(OPT_ROUTER);
        opts.push(4);
        opts.extend_from_slice(&server_ip.octets());
        opts.push(OPT_LEASE_TIME);
        opts.push(4);
        opts.extend_from_slice(&(LEASE_DURATION.as_secs() as u32).to_be_bytes());
    }
    opts.push(OPT_END);

    pkt.extend_from_slice(&opts);
    Some(pkt)
}

const DHCPOFFER: u8 = 2;

/// Server for a single `/24` (Non-goals: "subnets other than `/24`" are out
/// of scope). `base` is the network address, e.g. `192.168.4.0`.
pub struct DhcpServer {
    base: Ipv4Addr,
    server_ip: Ipv4Addr,
    /// Highest host octet the pool may hand out. The pool always starts
    /// immediately above the server's own address — there is no separate
    /// `pool_start`, since `next_ip` derives the first candidate from the
    /// server's self-lease rather than a configured floor.
    pool_end: u8,
    /// First entry is always the server's own reserved lease (`mac: None`),
    /// sorted ascending by IP thereafter; never empty.
    leases: Vec<Lease>,
}

impl DhcpServer {
    /// `max_leases` bounds how many host addresses above `server_ip` the
    /// pool may ever hand out (ground truth `original_source/src/net/dhcpserver.c`
    /// default is 10).
    pub fn new(base: Ipv4Addr, server_ip: Ipv4Addr, max_leases: u8) -> Self {
        let pool_end = server_ip.octets()[3].saturating_add(max_leases);
        let self_lease = Lease { mac: None, ip: server_ip, expires_at_ms: u64::MAX };
        DhcpServer { base, server_ip, pool_end, leases: vec![self_lease] }
    }

    fn host_ip(&self, host: u8) -> Ipv4Addr {
        let octets = self.base.octets();
        Ipv4Addr::new(octets[0], octets[1], octets[2], host)
    }

    fn lease_for_mac(&self, mac: MacAddr) -> Option<&Lease> {
        self.leases.iter().find(|l| l.mac == Some(mac))
    }

    /// First IP above the server's own address with no live lease: walk the
    /// sorted, non-expired host octets (the server's self-lease is always
    /// first and never expires) and return the first gap, or one past the
    /// highest in-use address if the run is unbroken. Fails once the pool's
    /// capacity is reached (§4.J `next_ip`).
    fn next_ip(&self, now_ms: u64) -> Option<Ipv4Addr> {
        let mut hosts: Vec<u8> =
            self.leases.iter().filter(|l| l.expires_at_ms > now_ms).map(|l| l.ip.octets()[3]).collect();
        hosts.sort_unstable();
        hosts.dedup();
        let mut prev = hosts[0];
        for &host in &hosts[1..] {
            let next = prev.checked_add(1)?;
            if host != next {
                return Some(self.host_ip(next));
            }
            prev = host;
        }
        let candidate = prev.checked_add(1)?;
        (candidate <= self.pool_end).then(|| self.host_ip(candidate))
    }

    /// Remove leases whose expiry has passed. Called from the periodic
    /// housekeeping tick alongside `ConnTable::tick`.
    pub fn reap_expired(&mut self, now_ms: u64) {
        self.leases.retain(|l| l.expires_at_ms > now_ms);
    }

    /// Re-sort the lease table by IP address. `Vec::sort_by_key` is a
    /// stable total order, so leases that somehow compare equal never
    /// leave the table in an inconsistent order the way a manual
    /// pointer-swap insertion sort could.
    fn resort(&mut self) {
        self.leases.sort_by_key(|l| l.ip.octets());
    }

    pub fn handle(&mut self, req: &DhcpRequest, now_ms: u64) -> DhcpReply {
        match req.message_type {
            MessageType::Discover => {
                if let Some(lease) = self.lease_for_mac(req.mac) {
                    return DhcpReply::Offer(lease.ip);
                }
                match self.next_ip(now_ms) {
                    Some(ip) => DhcpReply::Offer(ip),
                    None => DhcpReply::Nak,
                }
            }
            MessageType::Request => {
                let wanted = req.requested_ip;
                let existing_ip = self.lease_for_mac(req.mac).map(|l| l.ip);
                let ip = match (wanted, existing_ip) {
                    (Some(w), _) => w,
                    (None, Some(existing)) => existing,
                    (None, None) => return DhcpReply::Nak,
                };
                let host = ip.octets()[3];
                if host <= self.server_ip.octets()[3] || host > self.pool_end {
                    return DhcpReply::Nak;
                }
                let conflict = self
                    .leases
                    .iter()
                    .any(|l| l.ip == ip && l.mac != Some(req.mac) && l.expires_at_ms > now_ms);
                if conflict {
                    return DhcpReply::Nak;
                }
                self.leases.retain(|l| l.mac != Some(req.mac));
                self.leases.push(Lease {
                    mac: Some(req.mac),
                    ip,
                    expires_at_ms: now_ms + LEASE_DURATION.as_millis() as u64,
                });
                self.resort();
                DhcpReply::Ack(ip)
            }
            MessageType::Release => {
                self.leases.retain(|l| l.mac != Some(req.mac));
                DhcpReply::None
            }
            MessageType::Decline | MessageType::Inform => DhcpReply::None,
        }
    }

    pub fn leases(&self) -> &[Lease] {
        &self.leases
    }

    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip
    }
}

/// Builds a minimal BOOTREQUEST packet for tests: the fixed 236-byte
/// header, magic cookie, and a message-type option (plus optional
/// requested-IP option), terminated with `END`.
#[cfg(test)]
fn build_discover_packet(mac: [u8; 6], xid: u32, giaddr: [u8; 4]) -> Vec<u8> {
    let mut pkt = vec![0u8; 240];
    pkt[0] = OP_BOOTREQUEST;
    pkt[1] = HTYPE_ETHER;
    pkt[2] = HLEN_ETHER;
    pkt[4..8].copy_from_slice(&xid.to_be_bytes());
    pkt[24..28].copy_from_slice(&giaddr);
    pkt[28..34].copy_from_slice(&mac);
    pkt[236..240].copy_from_slice(&MAGIC_COOKIE);
    pkt.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, DHCPDISCOVER, OPT_END]);
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddr {
        MacAddr([0, 0, 0, 0, 0, n])
    }

    fn server() -> DhcpServer {
        DhcpServer::new(Ipv4Addr::new(192, 168, 4, 0), Ipv4Addr::new(192, 168, 4, 1), 20)
    }

    /// §7 scenario 5: "yiaddr = server_ip + 1 (no prior leases)". The pool
    /// is anchored at the server's own address via the seeded self-lease,
    /// not a separately configured floor, so the very first offer must be
    /// exactly one past `server_ip` regardless of how the pool is sized.
    #[test]
    fn discover_with_no_prior_leases_offers_server_ip_plus_one() {
        let mut dhcp = server();
        let reply = dhcp.handle(
            &DhcpRequest { mac: mac(1), message_type: MessageType::Discover, requested_ip: None },
            0,
        );
        assert!(matches!(reply, DhcpReply::Offer(ip) if ip == Ipv4Addr::new(192, 168, 4, 2)));
    }

    #[test]
    fn request_then_ack_creates_a_lease_and_sorts_the_table() {
        let mut dhcp = server();
        dhcp.handle(
            &DhcpRequest {
                mac: mac(2),
                message_type: MessageType::Request,
                requested_ip: Some(Ipv4Addr::new(192, 168, 4, 15)),
            },
            0,
        );
        dhcp.handle(
            &DhcpRequest {
                mac: mac(1),
                message_type: MessageType::Request,
                requested_ip: Some(Ipv4Addr::new(192, 168, 4, 11)),
            },
            0,
        );
        let ips: Vec<_> = dhcp.leases().iter().map(|l| l.ip).collect();
        assert_eq!(
            ips,
            vec![
                Ipv4Addr::new(192, 168, 4, 1),
                Ipv4Addr::new(192, 168, 4, 11),
                Ipv4Addr::new(192, 168, 4, 15),
            ]
        );
    }

    #[test]
    fn conflicting_request_from_another_mac_is_nak() {
        let mut dhcp = server();
        dhcp.handle(
            &DhcpRequest {
                mac: mac(1),
                message_type: MessageType::Request,
                requested_ip: Some(Ipv4Addr::new(192, 168, 4, 10)),
            },
            0,
        );
        let reply = dhcp.handle(
            &DhcpRequest {
                mac: mac(2),
                message_type: MessageType::Request,
                requested_ip: Some(Ipv4Addr::new(192, 168, 4, 10)),
            },
            0,
        );
        assert!(matches!(reply, DhcpReply::Nak));
    }

    #[test]
    fn expired_lease_address_becomes_available_again() {
        let mut dhcp = server();
        dhcp.handle(
            &DhcpRequest {
                mac: mac(1),
                message_type: MessageType::Request,
                requested_ip: Some(Ipv4Addr::new(192, 168, 4, 2)),
            },
            0,
        );
        dhcp.reap_expired(LEASE_DURATION.as_millis() as u64 + 1);
        // Only the server's own never-expiring self-lease survives.
        assert_eq!(dhcp.leases().len(), 1);
        let reply = dhcp.handle(
            &DhcpRequest { mac: mac(2), message_type: MessageType::Discover, requested_ip: None },
            LEASE_DURATION.as_millis() as u64 + 1,
        );
        assert!(matches!(reply, DhcpReply::Offer(ip) if ip == Ipv4Addr::new(192, 168, 4, 2)));
    }

    #[test]
    fn pool_exhaustion_yields_nak() {
        let mut dhcp = DhcpServer::new(Ipv4Addr::new(192, 168, 4, 0), Ipv4Addr::new(192, 168, 4, 1), 1);
        dhcp.handle(
            &DhcpRequest {
                mac: mac(1),
                message_type: MessageType::Request,
                requested_ip: Some(Ipv4Addr::new(192, 168, 4, 2)),
            },
            0,
        );
        let reply = dhcp.handle(
            &DhcpRequest { mac: mac(2), message_type: MessageType::Discover, requested_ip: None },
            0,
        );
        assert!(matches!(reply, DhcpReply::Nak));
    }

    #[test]
    fn release_frees_the_lease_immediately() {
        let mut dhcp = server();
        dhcp.handle(
            &DhcpRequest {
                mac: mac(1),
                message_type: MessageType::Request,
                requested_ip: Some(Ipv4Addr::new(192, 168, 4, 10)),
            },
            0,
        );
        dhcp.handle(&DhcpRequest { mac: mac(1), message_type: MessageType::Release, requested_ip: None }, 0);
        // Only the server's own self-lease remains.
        assert_eq!(dhcp.leases().len(), 1);
    }

    #[test]
    fn decode_request_rejects_relayed_packets() {
        let pkt = build_discover_packet([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff], 0xDEADBEEF, [10, 0, 0, 1]);
        assert!(decode_request(&pkt).is_none());
    }

    #[test]
    fn decode_then_handle_then_encode_matches_the_discover_scenario() {
        let pkt = build_discover_packet([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff], 0xDEADBEEF, [0, 0, 0, 0]);
        let (req, xid) = decode_request(&pkt).expect("valid discover decodes");
        assert_eq!(xid, 0xDEADBEEF);
        assert_eq!(req.mac, MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]));
        assert_eq!(req.message_type, MessageType::Discover);

        let mut dhcp = server();
        let reply = dhcp.handle(&req, 0);
        assert!(matches!(reply, DhcpReply::Offer(ip) if ip == Ipv4Addr::new(192, 168, 4, 2)));

        let out = encode_reply(&reply, xid, req.mac, dhcp.server_ip(), Ipv4Addr::new(255, 255, 255, 0))
            .expect("offer encodes to a reply packet");
        assert_eq!(out[0], OP_BOOTREPLY);
        assert_eq!(u32::from_be_bytes(out[4..8].try_into().unwrap()), 0xDEADBEEF);
        assert_eq!(&out[16..20], &Ipv4Addr::new(192, 168, 4, 2).octets());
        assert_eq!(&out[236..240], &MAGIC_COOKIE);
        let opts = parse_options(&out[240..]);
        let (tag, value) = opts[0];
        assert_eq!(tag, OPT_MESSAGE_TYPE);
        assert_eq!(value, &[DHCPOFFER]);
    }

    #[test]
    fn encode_reply_returns_none_for_release_and_inform() {
        assert!(encode_reply(&DhcpReply::None, 0, mac(1), Ipv4Addr::new(192, 168, 4, 1), Ipv4Addr::new(255, 255, 255, 0)).is_none());
    }
}
