//! Candidate sources of a download.
use std::{
    fmt,
    hash::{Hash, Hasher},
    net::SocketAddr,
    time::Instant,
};

use rand::Rng;
use speedy::{Readable, Writable};

use crate::{
    hash_tree::Digest,
    interval::{Interval, IntervalSet},
};

/// Identifier of a client on the overlay, used to reach firewalled
/// hosts through their push proxies.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Content hash identifying the file, a SHA1 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Readable, Writable)]
pub struct Urn(pub Digest);

impl From<Digest> for Urn {
    fn from(value: Digest) -> Self {
        Self(value)
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "urn:sha1:{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Logical identity of a host.
///
/// Direct hosts are known by their address, firewalled ones by their
/// guid, whatever proxies they are currently reachable through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostKey {
    Direct(SocketAddr),
    Push(Guid),
}

/// What a host said about the file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HasFile {
    #[default]
    Unknown,
    Yes,
    No,
}

/// Everything known about one candidate source.
#[derive(Clone, Debug)]
pub struct HostContext {
    /// Where to connect to. For firewalled hosts this is the address used
    /// for firewall to firewall transfers, if any.
    pub addr: SocketAddr,
    pub guid: Guid,
    pub firewalled: bool,
    pub push_proxies: Vec<SocketAddr>,
    /// Can do firewall to firewall transfers.
    pub fwt_capable: bool,
    pub urn: Option<Urn>,
    pub file_size: u64,
    /// Ranges the host claims to have, `None` when it has the whole file.
    pub available: Option<IntervalSet>,
    /// Negative values are free upload slots, positive ones the position
    /// in the host's upload queue.
    pub queue_status: i32,
    pub has_file: HasFile,
    pub busy_until: Option<Instant>,
    /// Learned from another host rather than from a search result.
    pub from_alt_location: bool,
}

impl HostContext {
    pub fn new(addr: SocketAddr, urn: Option<Urn>, file_size: u64) -> Self {
        Self {
            addr,
            guid: Guid::default(),
            firewalled: false,
            push_proxies: Vec::new(),
            fwt_capable: false,
            urn,
            file_size,
            available: None,
            queue_status: 0,
            has_file: HasFile::Unknown,
            busy_until: None,
            from_alt_location: false,
        }
    }

    /// A host behind a firewall, reachable through `proxies`.
    pub fn firewalled(
        guid: Guid,
        addr: SocketAddr,
        proxies: Vec<SocketAddr>,
        urn: Option<Urn>,
        file_size: u64,
    ) -> Self {
        Self {
            guid,
            firewalled: true,
            push_proxies: proxies,
            ..Self::new(addr, urn, file_size)
        }
    }

    pub fn key(&self) -> HostKey {
        if self.firewalled {
            HostKey::Push(self.guid)
        } else {
            HostKey::Direct(self.addr)
        }
    }

    /// The host holds only part of the file.
    pub fn is_partial(&self) -> bool {
        self.available.is_some()
    }

    pub fn is_busy(&self, now: Instant) -> bool {
        self.busy_until.is_some_and(|until| until > now)
    }

    /// Ranges that can be requested from this host.
    pub fn ranges(&self) -> IntervalSet {
        match &self.available {
            Some(ranges) => ranges.clone(),
            None => IntervalSet::full(self.file_size),
        }
    }

    pub fn set_ranges(&mut self, ranges: impl IntoIterator<Item = Interval>) {
        let bounds = match self.file_size {
            0 => None,
            size => Some(Interval::new(0, size - 1)),
        };
        let ranges: IntervalSet = ranges.into_iter().collect();
        self.available = Some(match bounds {
            Some(bounds) => ranges.clip(bounds),
            None => IntervalSet::new(),
        });
    }
}

impl PartialEq for HostContext {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for HostContext {}

impl Hash for HostContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.firewalled {
            write!(f, "{} via {} proxies", self.guid, self.push_proxies.len())
        } else {
            write!(f, "{}", self.addr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_the_logical_endpoint() {
        let addr: SocketAddr = "1.2.3.4:6346".parse().unwrap();
        let mut a = HostContext::new(addr, None, 10);
        let b = HostContext::new(addr, Some(Urn([1; 20])), 99);
        assert_eq!(a, b);

        a.addr = "1.2.3.4:6347".parse().unwrap();
        assert_ne!(a, b);

        let guid = Guid([7; 16]);
        let p1 = HostContext::firewalled(guid, addr, vec![addr], None, 10);
        let p2 = HostContext::firewalled(guid, a.addr, vec![], None, 10);
        assert_eq!(p1, p2);
        assert_ne!(p1, b);
    }

    #[test]
    fn ranges_are_clipped_to_the_file() {
        let addr: SocketAddr = "1.2.3.4:6346".parse().unwrap();
        let mut host = HostContext::new(addr, None, 100);
        assert!(!host.is_partial());
        assert_eq!(host.ranges(), IntervalSet::full(100));

        host.set_ranges([Interval::new(10, 19), Interval::new(90, 200)]);
        assert!(host.is_partial());
        assert_eq!(
            host.ranges(),
            [Interval::new(10, 19), Interval::new(90, 99)]
                .into_iter()
                .collect()
        );
    }

    #[test]
    fn urn_display() {
        let urn = Urn([0xab; 20]);
        assert_eq!(urn.to_string(), format!("urn:sha1:{}", "ab".repeat(20)));
    }
}
