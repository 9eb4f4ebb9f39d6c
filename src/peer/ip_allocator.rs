//! Tunnel IP allocator
//!
//! Peers get a single host address from the configured subnet. Candidates
//! are the host identifiers `.2` through `.254` of the subnet's third-octet
//! block, scanned in ascending order; `.1` belongs to the server side of the
//! tunnel. Addresses held by any registry record, blocked ones included, are
//! skipped. Deleted peers no longer appear in the registry, so their
//! addresses are reused.
//!
//! The allocator holds no state of its own: the registry is the source of
//! truth and the caller serializes allocation with the mutation lock.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use super::registry::PeerRecord;

/// First host identifier handed out to peers
pub const FIRST_PEER_HOST: u8 = 2;

/// Last host identifier handed out to peers
pub const LAST_PEER_HOST: u8 = 254;

/// Error types for IP allocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpAllocatorError {
    /// No IPs available
    #[error("No available IP addresses in subnet {0}")]
    Exhausted(Ipv4Net),
}

/// Pick the lowest free peer address in `subnet`
///
/// # Errors
///
/// Returns `IpAllocatorError::Exhausted` if every candidate is taken or
/// falls outside the subnet.
///
/// # Example
///
/// ```
/// use wg_peerd::peer::ip_allocator::allocate;
///
/// let subnet = "10.0.70.0/24".parse().unwrap();
/// assert_eq!(allocate(&[], subnet).unwrap().to_string(), "10.0.70.2");
/// ```
pub fn allocate(records: &[PeerRecord], subnet: Ipv4Net) -> Result<Ipv4Addr, IpAllocatorError> {
    allocate_excluding(records.iter().map(|r| r.address), subnet)
}

/// Pick the lowest free peer address given the addresses already in use
pub fn allocate_excluding(
    used: impl IntoIterator<Item = Ipv4Addr>,
    subnet: Ipv4Net,
) -> Result<Ipv4Addr, IpAllocatorError> {
    let used: HashSet<Ipv4Addr> = used.into_iter().collect();

    candidates(subnet)
        .find(|ip| !used.contains(ip))
        .ok_or(IpAllocatorError::Exhausted(subnet))
}

/// Candidate addresses in ascending order
///
/// Only addresses strictly inside the subnet are produced: the network and
/// broadcast addresses never are.
pub fn candidates(subnet: Ipv4Net) -> impl Iterator<Item = Ipv4Addr> {
    let [a, b, c, _] = subnet.network().octets();
    let network = subnet.network();
    let broadcast = subnet.broadcast();

    (FIRST_PEER_HOST..=LAST_PEER_HOST)
        .map(move |host| Ipv4Addr::new(a, b, c, host))
        .filter(move |ip| subnet.contains(ip) && *ip != network && *ip != broadcast)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn record(name: &str, ip: &str, blocked: bool) -> PeerRecord {
        PeerRecord {
            name: name.into(),
            public_key: format!("{name}-pub"),
            address: ip.parse().unwrap(),
            created_at: Utc::now(),
            blocked,
        }
    }

    // =========================================================================
    // Allocation Order
    // =========================================================================

    #[test]
    fn test_first_allocation() {
        let ip = allocate(&[], net("10.0.70.0/24")).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 70, 2));
    }

    #[test]
    fn test_lowest_gap_is_used() {
        let records = vec![
            record("a", "10.0.70.2", false),
            record("b", "10.0.70.3", false),
            record("c", "10.0.70.5", false),
        ];
        let ip = allocate(&records, net("10.0.70.0/24")).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 70, 4));
    }

    #[test]
    fn test_blocked_peers_keep_their_address() {
        let records = vec![record("a", "10.0.70.2", true)];
        let ip = allocate(&records, net("10.0.70.0/24")).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 70, 3));
    }

    #[test]
    fn test_deterministic() {
        let records = vec![record("a", "10.0.70.2", false)];
        let first = allocate(&records, net("10.0.70.0/24")).unwrap();
        let second = allocate(&records, net("10.0.70.0/24")).unwrap();
        assert_eq!(first, second);
    }

    // =========================================================================
    // Subnet Boundaries
    // =========================================================================

    #[test]
    fn test_exhausted() {
        let records: Vec<PeerRecord> = (2..=254)
            .map(|i| record(&format!("p{i}"), &format!("10.0.70.{i}"), false))
            .collect();
        assert_eq!(
            allocate(&records, net("10.0.70.0/24")),
            Err(IpAllocatorError::Exhausted(net("10.0.70.0/24")))
        );
    }

    #[test]
    fn test_small_subnet_stays_inside() {
        // 10.0.70.0/29 -> hosts .1 to .6, peers get .2 to .6
        let all: Vec<Ipv4Addr> = candidates(net("10.0.70.0/29")).collect();
        assert_eq!(all.first(), Some(&Ipv4Addr::new(10, 0, 70, 2)));
        assert_eq!(all.last(), Some(&Ipv4Addr::new(10, 0, 70, 6)));
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn test_offset_subnet_skips_outside_candidates() {
        // 10.0.70.16/28 -> .17 to .30
        let ip = allocate(&[], net("10.0.70.16/28")).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 70, 17));
        assert!(candidates(net("10.0.70.16/28")).all(|ip| ip.octets()[3] < 31));
    }

    #[test]
    fn test_wide_subnet_uses_third_octet_block() {
        let ip = allocate(&[], net("10.8.0.0/16")).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(candidates(net("10.8.0.0/16")).count(), 253);
    }

    #[test]
    fn test_allocate_excluding_foreign_addresses() {
        let used = [Ipv4Addr::new(10, 0, 70, 2), Ipv4Addr::new(192, 168, 1, 3)];
        let ip = allocate_excluding(used, net("10.0.70.0/24")).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 70, 3));
    }
}
