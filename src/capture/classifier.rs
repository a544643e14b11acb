use log::{log_enabled, trace, Level};
use pnet::packet::{
    ethernet::{EtherType, EtherTypes, EthernetPacket},
    ipv4::Ipv4Packet,
    ipv6::Ipv6Packet,
    vlan::VlanPacket,
    Packet as PnetPacket,
};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Framing of captured data, as reported by the capture backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Ethernet II, optionally with one 802.1Q tag
    Ethernet,
    /// Linux cooked capture (`any` device, some tunnels)
    LinuxSll,
    /// BSD loopback: 4-byte address family in host byte order
    Null,
    /// Bare IPv4/IPv6 packets
    Raw,
}

/// Direction of a packet relative to the local host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketDirection {
    /// Sent by the local host
    Up,
    /// Received by the local host
    Down,
}

/// A frame attributed to a remote endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifiedPacket {
    pub remote: IpAddr,
    pub direction: PacketDirection,
    /// Length on the wire, not the captured length
    pub len: usize,
}

const SLL_HEADER_LEN: usize = 16;
const NULL_HEADER_LEN: usize = 4;

/// Attributes raw frames to remote endpoints.
///
/// Holds only immutable configuration; frames that are not IP, are truncated,
/// or have no single remote endpoint are ignored without error.
#[derive(Debug, Clone)]
pub struct Classifier {
    link: LinkKind,
    local: HashSet<IpAddr>,
    skip_non_global: bool,
}

impl Classifier {
    /// Create a classifier for one device.
    ///
    /// With an empty `local` set, an endpoint counts as local when it is not
    /// globally routable.
    pub fn new(link: LinkKind, local: HashSet<IpAddr>) -> Self {
        Self {
            link,
            local,
            skip_non_global: false,
        }
    }

    /// Ignore remotes that are not globally routable (LAN chatter)
    pub fn skip_non_global(mut self, skip: bool) -> Self {
        self.skip_non_global = skip;
        self
    }

    /// Classify one frame; `wire_len` is the frame's original length
    pub fn classify(&self, frame: &[u8], wire_len: usize) -> Option<ClassifiedPacket> {
        let (src, dst) = self.endpoints(frame)?;

        let (direction, remote) = match (self.is_local(&src), self.is_local(&dst)) {
            (true, false) => (PacketDirection::Up, dst),
            (false, true) => (PacketDirection::Down, src),
            _ => return None,
        };

        if self.skip_non_global && !is_global(&remote) {
            return None;
        }

        if log_enabled!(Level::Trace) {
            trace!("{:?} {} bytes, remote {}", direction, wire_len, remote);
        }

        Some(ClassifiedPacket {
            remote,
            direction,
            len: wire_len,
        })
    }

    fn is_local(&self, ip: &IpAddr) -> bool {
        if self.local.is_empty() {
            !is_global(ip)
        } else {
            self.local.contains(ip)
        }
    }

    /// Source and destination of the IP header inside the frame
    fn endpoints(&self, frame: &[u8]) -> Option<(IpAddr, IpAddr)> {
        match self.link {
            LinkKind::Ethernet => {
                let eth = EthernetPacket::new(frame)?;
                match eth.get_ethertype() {
                    EtherTypes::Vlan => {
                        let vlan = VlanPacket::new(eth.payload())?;
                        ip_by_ethertype(vlan.get_ethertype(), vlan.payload())
                    }
                    ethertype => ip_by_ethertype(ethertype, eth.payload()),
                }
            }
            LinkKind::LinuxSll => {
                if frame.len() < SLL_HEADER_LEN {
                    return None;
                }
                let protocol = u16::from_be_bytes([frame[14], frame[15]]);
                ip_by_ethertype(EtherType(protocol), &frame[SLL_HEADER_LEN..])
            }
            LinkKind::Null => ip_by_version(frame.get(NULL_HEADER_LEN..)?),
            LinkKind::Raw => ip_by_version(frame),
        }
    }
}

fn ip_by_ethertype(ethertype: EtherType, payload: &[u8]) -> Option<(IpAddr, IpAddr)> {
    match ethertype {
        EtherTypes::Ipv4 => ipv4_endpoints(payload),
        EtherTypes::Ipv6 => ipv6_endpoints(payload),
        _ => None,
    }
}

fn ip_by_version(packet: &[u8]) -> Option<(IpAddr, IpAddr)> {
    match packet.first()? >> 4 {
        4 => ipv4_endpoints(packet),
        6 => ipv6_endpoints(packet),
        _ => None,
    }
}

fn ipv4_endpoints(packet: &[u8]) -> Option<(IpAddr, IpAddr)> {
    let ip = Ipv4Packet::new(packet)?;
    if ip.get_version() != 4 || ip.get_header_length() < 5 {
        return None;
    }

    Some((ip.get_source().into(), ip.get_destination().into()))
}

fn ipv6_endpoints(packet: &[u8]) -> Option<(IpAddr, IpAddr)> {
    let ip = Ipv6Packet::new(packet)?;
    if ip.get_version() != 6 {
        return None;
    }

    Some((ip.get_source().into(), ip.get_destination().into()))
}

/// Whether an address is routable on the public internet
pub fn is_global(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_global_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_global_v4(&v4),
            None => is_global_v6(v6),
        },
    }
}

fn is_global_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    let shared = a == 100 && (b & 0xc0) == 64; // 100.64.0.0/10, carrier-grade NAT

    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || shared)
}

fn is_global_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;

    !(ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() || unique_local || link_local)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL_V4: [u8; 4] = [192, 168, 1, 20];
    const REMOTE_V4: [u8; 4] = [203, 0, 113, 5];

    fn ipv4_header(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut h = vec![0u8; 20];
        h[0] = 0x45;
        h[2..4].copy_from_slice(&20u16.to_be_bytes());
        h[8] = 64;
        h[9] = 6;
        h[12..16].copy_from_slice(&src);
        h[16..20].copy_from_slice(&dst);
        h
    }

    fn ipv6_header(src: Ipv6Addr, dst: Ipv6Addr) -> Vec<u8> {
        let mut h = vec![0u8; 40];
        h[0] = 0x60;
        h[6] = 17;
        h[7] = 64;
        h[8..24].copy_from_slice(&src.octets());
        h[24..40].copy_from_slice(&dst.octets());
        h
    }

    fn ethernet(ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![0u8; 12];
        f.extend_from_slice(&ethertype.to_be_bytes());
        f.extend_from_slice(payload);
        f
    }

    fn local_set() -> HashSet<IpAddr> {
        [IpAddr::from(LOCAL_V4), "2001:db8::20".parse().unwrap()]
            .into_iter()
            .collect()
    }

    fn classifier(link: LinkKind) -> Classifier {
        Classifier::new(link, local_set())
    }

    #[test]
    fn outgoing_ipv4_over_ethernet() {
        let frame = ethernet(0x0800, &ipv4_header(LOCAL_V4, REMOTE_V4));
        let packet = classifier(LinkKind::Ethernet).classify(&frame, 1000).unwrap();

        assert_eq!(packet.remote, IpAddr::from(REMOTE_V4));
        assert_eq!(packet.direction, PacketDirection::Up);
        assert_eq!(packet.len, 1000);
    }

    #[test]
    fn incoming_ipv4_over_ethernet() {
        let frame = ethernet(0x0800, &ipv4_header(REMOTE_V4, LOCAL_V4));
        let packet = classifier(LinkKind::Ethernet).classify(&frame, 60).unwrap();

        assert_eq!(packet.remote, IpAddr::from(REMOTE_V4));
        assert_eq!(packet.direction, PacketDirection::Down);
    }

    #[test]
    fn vlan_tagged_ipv6() {
        let remote: Ipv6Addr = "2606:4700::1111".parse().unwrap();
        let ip = ipv6_header(remote, "2001:db8::20".parse().unwrap());

        let mut tagged = vec![0x00, 0x0a, 0x86, 0xdd];
        tagged.extend_from_slice(&ip);
        let frame = ethernet(0x8100, &tagged);

        let packet = classifier(LinkKind::Ethernet).classify(&frame, 120).unwrap();
        assert_eq!(packet.remote, IpAddr::V6(remote));
        assert_eq!(packet.direction, PacketDirection::Down);
    }

    #[test]
    fn linux_cooked_and_raw_links() {
        let ip = ipv4_header(LOCAL_V4, REMOTE_V4);

        let mut sll = vec![0u8; 14];
        sll.extend_from_slice(&0x0800u16.to_be_bytes());
        sll.extend_from_slice(&ip);
        let packet = classifier(LinkKind::LinuxSll).classify(&sll, 80).unwrap();
        assert_eq!(packet.remote, IpAddr::from(REMOTE_V4));

        let packet = classifier(LinkKind::Raw).classify(&ip, 80).unwrap();
        assert_eq!(packet.direction, PacketDirection::Up);

        let mut null = 2u32.to_ne_bytes().to_vec();
        null.extend_from_slice(&ip);
        assert!(classifier(LinkKind::Null).classify(&null, 80).is_some());
    }

    #[test]
    fn non_ip_and_truncated_frames_are_ignored() {
        let c = classifier(LinkKind::Ethernet);

        let arp = ethernet(0x0806, &[0u8; 28]);
        assert!(c.classify(&arp, 42).is_none());

        let truncated = ethernet(0x0800, &ipv4_header(LOCAL_V4, REMOTE_V4)[..12]);
        assert!(c.classify(&truncated, 26).is_none());

        assert!(c.classify(&[], 0).is_none());

        let mut bad_version = ipv4_header(LOCAL_V4, REMOTE_V4);
        bad_version[0] = 0x55;
        assert!(c.classify(&ethernet(0x0800, &bad_version), 34).is_none());
    }

    #[test]
    fn no_single_remote_is_ignored() {
        let c = classifier(LinkKind::Ethernet);

        let both_local = ethernet(0x0800, &ipv4_header(LOCAL_V4, LOCAL_V4));
        assert!(c.classify(&both_local, 60).is_none());

        let transit = ethernet(0x0800, &ipv4_header([8, 8, 8, 8], REMOTE_V4));
        assert!(c.classify(&transit, 60).is_none());
    }

    #[test]
    fn empty_local_set_falls_back_to_routability() {
        let c = Classifier::new(LinkKind::Ethernet, HashSet::new());

        let frame = ethernet(0x0800, &ipv4_header([10, 0, 0, 7], [1, 1, 1, 1]));
        let packet = c.classify(&frame, 90).unwrap();
        assert_eq!(packet.remote, IpAddr::from([1, 1, 1, 1]));
        assert_eq!(packet.direction, PacketDirection::Up);
    }

    #[test]
    fn skip_non_global_drops_lan_remotes() {
        let frame = ethernet(0x0800, &ipv4_header(LOCAL_V4, [192, 168, 1, 1]));

        assert!(classifier(LinkKind::Ethernet).classify(&frame, 60).is_some());
        assert!(classifier(LinkKind::Ethernet)
            .skip_non_global(true)
            .classify(&frame, 60)
            .is_none());
    }

    #[test]
    fn global_address_rules() {
        let global = |s: &str| is_global(&s.parse().unwrap());

        assert!(global("1.1.1.1"));
        assert!(global("2606:4700::1111"));
        assert!(!global("172.16.4.4"));
        assert!(!global("100.64.0.1"));
        assert!(!global("169.254.10.1"));
        assert!(!global("fe80::1"));
        assert!(!global("fd00::1"));
        assert!(!global("::ffff:10.0.0.1"));
    }
}
