//! Port claims and the pairwise conflict rule

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::Protocol;

/// A single listen port and the protocols requested on it
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PortStruct {
    pub port: u16,
    pub protocols: Vec<Protocol>,
}

/// A half-open port range `[start, end)`
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PortSegment {
    pub start: u16,
    pub end: u16,
    #[serde(default)]
    pub protocols: Vec<Protocol>,
}

/// What one resource asks for on a load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortClaim {
    Port(PortStruct),
    Segment(PortSegment),
}

impl PortClaim {
    pub fn port(port: u16, protocols: Vec<Protocol>) -> Self {
        PortClaim::Port(PortStruct { port, protocols })
    }

    pub fn segment(start: u16, end: u16, protocols: Vec<Protocol>) -> Self {
        PortClaim::Segment(PortSegment { start, end, protocols })
    }

    /// Covered ports as `[start, end)` in u32 so `65535 + 1` fits
    fn range(&self) -> (u32, u32) {
        match self {
            PortClaim::Port(p) => (u32::from(p.port), u32::from(p.port) + 1),
            PortClaim::Segment(s) => (u32::from(s.start), u32::from(s.end)),
        }
    }

    pub fn protocols(&self) -> &[Protocol] {
        match self {
            PortClaim::Port(p) => &p.protocols,
            PortClaim::Segment(s) => &s.protocols,
        }
    }

    pub fn overlaps(&self, other: &PortClaim) -> bool {
        let (a_start, a_end) = self.range();
        let (b_start, b_end) = other.range();
        a_start < b_end && b_start < a_end
    }

    /// Ranges intersect and the protocols cannot share the ports
    pub fn conflicts_with(&self, other: &PortClaim) -> bool {
        self.overlaps(other) && !reuse_exempt(self.protocols(), other.protocols())
    }
}

impl fmt::Display for PortClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocols = self
            .protocols()
            .iter()
            .map(Protocol::as_str)
            .collect::<Vec<_>>()
            .join("/");
        match self {
            PortClaim::Port(p) => write!(f, "{}:{}", protocols, p.port),
            PortClaim::Segment(s) => write!(f, "{}:[{},{})", protocols, s.start, s.end),
        }
    }
}

/// TCP and UDP may share a port with each other, nothing else may.
///
/// Both lists must be non-empty, hold only TCP/UDP, and have no protocol in
/// common. An empty list is treated as conflicting with everything.
pub fn reuse_exempt(a: &[Protocol], b: &[Protocol]) -> bool {
    let transport_only = |list: &[Protocol]| {
        !list.is_empty() && list.iter().all(|p| matches!(p, Protocol::Tcp | Protocol::Udp))
    };
    transport_only(a) && transport_only(b) && !a.iter().any(|p| b.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use Protocol::*;

    #[test]
    fn test_tcp_udp_share_identical_range() {
        let a = PortClaim::segment(1000, 2000, vec![Tcp]);
        let b = PortClaim::segment(1000, 2000, vec![Udp]);
        assert!(!a.conflicts_with(&b));
        assert!(!b.conflicts_with(&a));
    }

    #[test]
    fn test_tcp_http_overlap_conflicts() {
        let a = PortClaim::port(80, vec![Tcp]);
        let b = PortClaim::segment(50, 100, vec![Http]);
        assert!(a.conflicts_with(&b));
        assert!(b.conflicts_with(&a));
    }

    #[test]
    fn test_single_port_inside_segment() {
        let x = PortClaim::port(100, vec![Tcp]);
        let y = PortClaim::segment(90, 110, vec![Tcp]);
        assert!(x.conflicts_with(&y));
    }

    #[test]
    fn test_segment_end_is_exclusive() {
        let seg = PortClaim::segment(90, 110, vec![Tcp]);
        assert!(!seg.conflicts_with(&PortClaim::port(110, vec![Tcp])));
        assert!(seg.conflicts_with(&PortClaim::port(109, vec![Tcp])));
        assert!(!seg.conflicts_with(&PortClaim::segment(110, 120, vec![Tcp])));
    }

    #[test]
    fn test_disjoint_ranges_never_conflict() {
        let a = PortClaim::port(80, vec![Http]);
        let b = PortClaim::port(81, vec![Http]);
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn test_shared_protocol_conflicts() {
        let a = PortClaim::port(53, vec![Tcp, Udp]);
        let b = PortClaim::port(53, vec![Udp]);
        assert!(a.conflicts_with(&b));
    }

    #[test]
    fn test_empty_protocol_list_is_conservative() {
        let a = PortClaim::port(53, vec![]);
        let b = PortClaim::port(53, vec![Udp]);
        assert!(a.conflicts_with(&b));
        assert!(b.conflicts_with(&a));
    }

    #[test]
    fn test_relation_is_symmetric() {
        let claims = vec![
            PortClaim::port(80, vec![Tcp]),
            PortClaim::port(80, vec![Udp]),
            PortClaim::port(80, vec![Http]),
            PortClaim::segment(70, 90, vec![Tcp, Udp]),
            PortClaim::segment(80, 81, vec![Quic]),
            PortClaim::segment(81, 200, vec![Tcp]),
            PortClaim::port(65535, vec![TcpSsl]),
            PortClaim::segment(65000, 65535, vec![TcpSsl]),
        ];
        for a in &claims {
            for b in &claims {
                assert_eq!(a.conflicts_with(b), b.conflicts_with(a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(PortClaim::port(80, vec![Tcp, Udp]).to_string(), "TCP/UDP:80");
        assert_eq!(PortClaim::segment(1, 5, vec![Udp]).to_string(), "UDP:[1,5)");
    }
}
