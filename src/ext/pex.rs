use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use serde_bytes::ByteBuf;
use serde_derive::{Deserialize, Serialize};

// A ut_pex payload: compact peer lists, 6 bytes per IPv4 entry and 18 per
// IPv6, with one flag byte per added peer.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PexMessage {

    #[serde(default, skip_serializing_if = "no_bytes")]
    pub added: ByteBuf,

    #[serde(rename = "added.f", default, skip_serializing_if = "no_bytes")]
    pub added_f: ByteBuf,

    #[serde(default, skip_serializing_if = "no_bytes")]
    pub added6: ByteBuf,

    #[serde(rename = "added6.f", default, skip_serializing_if = "no_bytes")]
    pub added6_f: ByteBuf,

    #[serde(default, skip_serializing_if = "no_bytes")]
    pub dropped: ByteBuf,

    #[serde(default, skip_serializing_if = "no_bytes")]
    pub dropped6: ByteBuf,

}

fn no_bytes(buf: &ByteBuf) -> bool {
    buf.is_empty()
}

impl PexMessage {

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.added6.is_empty()
            && self.dropped.is_empty()
            && self.dropped6.is_empty()
    }

    pub fn push_added(&mut self, addr: SocketAddr) {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.added.extend_from_slice(&ip.octets());
                self.added.extend_from_slice(&addr.port().to_be_bytes());
                self.added_f.push(0);
            }
            IpAddr::V6(ip) => {
                self.added6.extend_from_slice(&ip.octets());
                self.added6.extend_from_slice(&addr.port().to_be_bytes());
                self.added6_f.push(0);
            }
        }
    }

    pub fn push_dropped(&mut self, addr: SocketAddr) {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.dropped.extend_from_slice(&ip.octets());
                self.dropped.extend_from_slice(&addr.port().to_be_bytes());
            }
            IpAddr::V6(ip) => {
                self.dropped6.extend_from_slice(&ip.octets());
                self.dropped6.extend_from_slice(&addr.port().to_be_bytes());
            }
        }
    }

    pub fn added_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs = parse_compact_v4(&self.added);
        addrs.extend(parse_compact_v6(&self.added6));
        addrs
    }

    pub fn dropped_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs = parse_compact_v4(&self.dropped);
        addrs.extend(parse_compact_v6(&self.dropped6));
        addrs
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_bencode::to_bytes(self).expect("pex dict serializes")
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(buf)
    }
}

fn parse_compact_v4(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(6)
        .map(|c| {
            let ip: [u8; 4] = c[..4].try_into().unwrap();
            SocketAddr::new(IpAddr::from(ip), u16::from_be_bytes([c[4], c[5]]))
        })
        .collect()
}

fn parse_compact_v6(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(18)
        .map(|c| {
            let ip: [u8; 16] = c[..16].try_into().unwrap();
            SocketAddr::new(IpAddr::from(ip), u16::from_be_bytes([c[16], c[17]]))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PexEvent {
    added: bool,
    addr: SocketAddr,
}

// Append-only log of swarm membership changes. Each connected peer keeps a
// cursor into it, so a share carries exactly the delta since that peer's
// previous share.
#[derive(Debug, Default)]
pub struct PexHistory {
    events: Vec<PexEvent>,
}

impl PexHistory {

    pub fn record_added(&mut self, addr: SocketAddr) {
        self.events.push(PexEvent { added: true, addr });
    }

    pub fn record_dropped(&mut self, addr: SocketAddr) {
        self.events.push(PexEvent { added: false, addr });
    }

    // Cursor value a share taken now should advance to.
    pub fn tip(&self) -> usize {
        self.events.len()
    }

    // Delta message since `cursor`, collapsing add/drop flapping to each
    // address's final state. `exclude` keeps a peer from being told about
    // itself.
    pub fn message_since(&self, cursor: usize, exclude: SocketAddr) -> PexMessage {
        let mut last: HashMap<SocketAddr, bool> = HashMap::new();
        let mut order: Vec<SocketAddr> = Vec::new();
        for event in self.events.iter().skip(cursor) {
            if event.addr == exclude {
                continue;
            }
            if last.insert(event.addr, event.added).is_none() {
                order.push(event.addr);
            }
        }

        let mut msg = PexMessage::default();
        for addr in order {
            if last[&addr] {
                msg.push_added(addr);
            } else if cursor > 0 {
                // An initial share only advertises live peers.
                msg.push_dropped(addr);
            }
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_message_round_trip() {
        let mut msg = PexMessage::default();
        msg.push_added(addr("10.1.2.3:6881"));
        msg.push_added(addr("[2001:db8::1]:51413"));
        msg.push_dropped(addr("192.168.0.9:1"));

        let back = PexMessage::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(back.added_addrs(), vec![addr("10.1.2.3:6881"), addr("[2001:db8::1]:51413")]);
        assert_eq!(back.dropped_addrs(), vec![addr("192.168.0.9:1")]);
        assert_eq!(back.added_f.len(), 1);
        assert_eq!(back.added6_f.len(), 1);
    }

    #[test]
    fn test_history_delta_and_flap_collapse() {
        let mut history = PexHistory::default();
        history.record_added(addr("10.0.0.1:1"));
        history.record_added(addr("10.0.0.2:2"));
        let cursor = history.tip();

        history.record_added(addr("10.0.0.3:3"));
        history.record_dropped(addr("10.0.0.3:3"));
        history.record_dropped(addr("10.0.0.1:1"));

        let msg = history.message_since(cursor, addr("10.0.0.9:9"));
        assert_eq!(msg.added_addrs(), Vec::<SocketAddr>::new());
        assert_eq!(
            msg.dropped_addrs(),
            vec![addr("10.0.0.3:3"), addr("10.0.0.1:1")],
        );
    }

    #[test]
    fn test_initial_share_skips_dead_peers_and_self() {
        let mut history = PexHistory::default();
        history.record_added(addr("10.0.0.1:1"));
        history.record_added(addr("10.0.0.2:2"));
        history.record_dropped(addr("10.0.0.2:2"));

        let msg = history.message_since(0, addr("10.0.0.1:1"));
        assert!(msg.added_addrs().is_empty());
        assert!(msg.dropped_addrs().is_empty());

        let msg = history.message_since(0, addr("10.0.0.9:9"));
        assert_eq!(msg.added_addrs(), vec![addr("10.0.0.1:1")]);
        assert!(msg.dropped_addrs().is_empty());
    }
}
