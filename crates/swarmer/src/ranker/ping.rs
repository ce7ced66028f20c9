use std::{
    cmp::Ordering,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use hashbrown::{HashMap, HashSet};
use tracing::{debug, info};

use crate::{
    config::RankerConfig,
    error::Error,
    host::{Guid, HasFile, HostContext, HostKey, Urn},
};

use super::{
    probe::{HeadPing, HeadPong},
    LocalNetwork, MeshHandler, Pinger, RankerKind, SourceRanker,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Probe {
    New,
    Pinged,
    Verified,
    Busy,
}

/// Rank classes, best first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Class {
    Good,
    Unprobed,
    Queued,
    Busy,
}

#[derive(Debug)]
struct Entry {
    host: HostContext,
    probe: Probe,
    seq: u64,
}

impl Entry {
    fn class(&self, now: Instant) -> Class {
        match self.probe {
            Probe::Busy => Class::Busy,
            _ if self.host.is_busy(now) => Class::Busy,
            Probe::Verified if self.host.queue_status > 0 => Class::Queued,
            Probe::Verified => Class::Good,
            Probe::New | Probe::Pinged => Class::Unprobed,
        }
    }

    fn pingable(&self, now: Instant) -> bool {
        matches!(self.probe, Probe::New | Probe::Busy) && !self.host.is_busy(now)
    }
}

fn firewall_rank(host: &HostContext, prefer_fwt: bool) -> u8 {
    if prefer_fwt {
        u8::from(!(host.firewalled && host.fwt_capable))
    } else {
        u8::from(host.firewalled)
    }
}

fn compare(a: &Entry, b: &Entry, prefer_fwt: bool, now: Instant) -> Ordering {
    let class = a.class(now);
    class
        .cmp(&b.class(now))
        .then_with(|| match class {
            Class::Good | Class::Queued => {
                a.host.queue_status.cmp(&b.host.queue_status)
            }
            _ => Ordering::Equal,
        })
        .then_with(|| {
            firewall_rank(&a.host, prefer_fwt)
                .cmp(&firewall_rank(&b.host, prefer_fwt))
        })
        .then_with(|| b.host.is_partial().cmp(&a.host.is_partial()))
        .then_with(|| a.host.from_alt_location.cmp(&b.host.from_alt_location))
        .then_with(|| a.seq.cmp(&b.seq))
}

/// Probes to send once the lock is released.
struct Outgoing {
    targets: Vec<SocketAddr>,
    ping: HeadPing,
}

enum Report {
    Absent(HostContext),
    Learned(Vec<HostContext>),
}

struct Inner {
    entries: HashMap<HostKey, Entry>,
    /// Probe target -> host the probe is about.
    pinged: HashMap<SocketAddr, HostKey>,
    /// Hosts that answered they do not have the file.
    absent: HashSet<HostKey>,
    urn: Option<Urn>,
    running: bool,
    last_ping: Option<Instant>,
    seq: u64,
    mesh: Option<Arc<dyn MeshHandler>>,
}

impl Inner {
    fn verified(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.probe == Probe::Verified)
            .count()
    }

    /// Returns false for a host already known or known to lack the file.
    fn add(&mut self, host: HostContext) -> bool {
        self.insert(host, Probe::New)
    }

    fn insert(&mut self, host: HostContext, probe: Probe) -> bool {
        let key = host.key();
        if self.absent.contains(&key) {
            return false;
        }
        if let Some(known) = self.entries.get_mut(&key) {
            if known.host.urn.is_none() && host.urn.is_some() {
                known.host = host;
            }
            return false;
        }
        if self.urn.is_none() {
            self.urn = host.urn;
        }
        self.seq += 1;
        let seq = self.seq;
        self.entries.insert(
            key,
            Entry {
                host,
                probe,
                seq,
            },
        );
        true
    }

    fn forget_probes(&mut self, key: &HostKey) {
        self.pinged.retain(|_, k| k != key);
    }
}

/// Ranker that probes sources with UDP pings before they are used.
///
/// New sources are pinged in batches, at most once per ping interval,
/// while fewer than `max_verified_hosts` sources confirmed having the
/// file. Answers move sources up or down the ranking, sources without the
/// file are evicted and reported to the mesh.
pub struct PingRanker {
    network: Arc<dyn LocalNetwork>,
    pinger: Arc<dyn Pinger>,
    config: RankerConfig,
    guid: Guid,
    inner: Mutex<Inner>,
}

impl PingRanker {
    pub fn new(
        network: Arc<dyn LocalNetwork>,
        pinger: Arc<dyn Pinger>,
        config: RankerConfig,
    ) -> Self {
        Self {
            network,
            pinger,
            config,
            guid: Guid::random(),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                pinged: HashMap::new(),
                absent: HashSet::new(),
                urn: None,
                running: true,
                last_ping: None,
                seq: 0,
                mesh: None,
            }),
        }
    }

    /// Guid sent in our pings.
    pub fn guid(&self) -> Guid {
        self.guid
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flags(&self) -> u8 {
        let mut flags = HeadPing::RANGES | HeadPing::ALT_LOCS;
        if self.network.accepts_incoming() || self.network.can_do_fwt() {
            flags |= HeadPing::PUSH_ALT_LOCS;
        }
        flags
    }

    /// Pick the next batch of hosts to ping.
    fn ping_new_hosts(&self, inner: &mut Inner, now: Instant) -> Vec<Outgoing> {
        if !inner.running || inner.verified() >= self.config.max_verified_hosts {
            return Vec::new();
        }
        let Some(urn) = inner.urn else {
            return Vec::new();
        };
        let interval = Duration::from_millis(self.config.ping_interval_ms);
        if inner
            .last_ping
            .is_some_and(|last| now.duration_since(last) < interval)
        {
            return Vec::new();
        }

        let mut batch: Vec<(bool, u64, HostKey)> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.pingable(now))
            .map(|(k, e)| (e.host.from_alt_location, e.seq, *k))
            .collect();
        if batch.is_empty() {
            return Vec::new();
        }
        // seq is unique
        batch.sort_unstable_by_key(|(alt, seq, _)| (*alt, *seq));
        batch.truncate(self.config.ping_batch);

        let ping = HeadPing {
            guid: self.guid,
            urn,
            client_guid: None,
            flags: self.flags(),
        };
        let accepts_incoming = self.network.accepts_incoming();
        let can_do_fwt = self.network.can_do_fwt();

        let mut direct = Vec::new();
        let mut out = Vec::new();
        for (_, _, key) in &batch {
            let Some(entry) = inner.entries.get_mut(key) else {
                continue;
            };
            entry.probe = Probe::Pinged;
            let host = &entry.host;

            if !host.firewalled {
                direct.push(host.addr);
                inner.pinged.insert(host.addr, *key);
                continue;
            }

            let reachable = accepts_incoming || (can_do_fwt && host.fwt_capable);
            if reachable && host.urn.is_some() && !host.push_proxies.is_empty() {
                for proxy in &host.push_proxies {
                    inner.pinged.insert(*proxy, *key);
                }
                out.push(Outgoing {
                    targets: host.push_proxies.clone(),
                    ping: HeadPing {
                        client_guid: Some(host.guid),
                        ..ping.clone()
                    },
                });
            } else {
                debug!("cannot probe firewalled host {host}");
            }
        }
        if !direct.is_empty() {
            out.push(Outgoing {
                targets: direct,
                ping,
            });
        }

        debug!(
            "pinging {} hosts, {} verified, {} known",
            batch.len(),
            inner.verified(),
            inner.entries.len()
        );
        inner.last_ping = Some(now);
        out
    }

    fn dispatch(&self, out: Vec<Outgoing>) {
        for o in out {
            self.pinger.send_probe(&o.targets, &o.ping);
        }
    }
}

impl SourceRanker for PingRanker {
    fn kind(&self) -> RankerKind {
        RankerKind::Ping
    }

    fn add_to_pool(&self, hosts: Vec<HostContext>) -> bool {
        let (added, out) = {
            let mut inner = self.lock();
            let mut added = false;
            for host in hosts {
                added |= inner.add(host);
            }
            let out = if added {
                self.ping_new_hosts(&mut inner, Instant::now())
            } else {
                Vec::new()
            };
            (added, out)
        };
        self.dispatch(out);
        added
    }

    fn return_host(&self, host: HostContext) -> bool {
        let probe = if host.has_file == HasFile::Yes {
            Probe::Verified
        } else {
            Probe::New
        };
        let out = {
            let mut inner = self.lock();
            if !inner.insert(host, probe) {
                return false;
            }
            match probe {
                Probe::New => self.ping_new_hosts(&mut inner, Instant::now()),
                _ => Vec::new(),
            }
        };
        self.dispatch(out);
        true
    }

    fn get_best(&self) -> Result<HostContext, Error> {
        let now = Instant::now();
        let prefer_fwt =
            !self.network.accepts_incoming() && !self.network.can_do_fwt();

        let (host, out) = {
            let mut inner = self.lock();
            let key = inner
                .entries
                .iter()
                .min_by(|(_, a), (_, b)| compare(a, b, prefer_fwt, now))
                .map(|(k, _)| *k)
                .ok_or(Error::Exhausted)?;
            let entry = inner.entries.remove(&key).ok_or(Error::Exhausted)?;
            inner.forget_probes(&key);
            let out = self.ping_new_hosts(&mut inner, now);
            (entry.host, out)
        };

        self.dispatch(out);
        debug!("best host {host}");
        Ok(host)
    }

    fn has_more(&self) -> bool {
        !self.lock().entries.is_empty()
    }

    fn shareable_hosts(&self) -> Vec<HostContext> {
        self.lock().entries.values().map(|e| e.host.clone()).collect()
    }

    fn num_known_hosts(&self) -> usize {
        self.lock().entries.len()
    }

    fn set_mesh_handler(&self, mesh: Option<Arc<dyn MeshHandler>>) {
        self.lock().mesh = mesh;
    }

    fn process_pong(&self, from: SocketAddr, pong: HeadPong) {
        let now = Instant::now();
        let (out, report, mesh) = {
            let mut inner = self.lock();
            if !inner.running {
                return;
            }
            let Some(key) = inner.pinged.remove(&from) else {
                debug!("dropping unsolicited pong from {from}");
                return;
            };
            // first answer wins for hosts pinged through several proxies
            inner.forget_probes(&key);

            let report = if !pong.has_file {
                let Some(entry) = inner.entries.remove(&key) else {
                    return;
                };
                info!("{} does not have the file", entry.host);
                inner.absent.insert(key);
                Report::Absent(entry.host)
            } else {
                let Some(entry) = inner.entries.get_mut(&key) else {
                    return;
                };
                let host = &mut entry.host;
                host.has_file = HasFile::Yes;
                host.queue_status = pong.queue_status;
                if pong.complete {
                    host.available = None;
                } else {
                    host.set_ranges(pong.valid_ranges());
                }
                if pong.busy {
                    entry.probe = Probe::Busy;
                    host.busy_until = Some(
                        now + Duration::from_secs(self.config.busy_retry_secs),
                    );
                } else {
                    entry.probe = Probe::Verified;
                    host.busy_until = None;
                }
                debug!("{} answered, queue {}", host, host.queue_status);

                let alts = pong.alternate_sources(host);
                let learned: Vec<HostContext> = alts
                    .into_iter()
                    .filter(|alt| inner.add(alt.clone()))
                    .collect();
                Report::Learned(learned)
            };

            let out = self.ping_new_hosts(&mut inner, now);
            (out, report, inner.mesh.clone())
        };

        self.dispatch(out);
        let Some(mesh) = mesh else {
            return;
        };
        match report {
            Report::Absent(host) => mesh.inform_mesh(&host, false),
            Report::Learned(hosts) if !hosts.is_empty() => {
                mesh.add_possible_sources(hosts)
            }
            Report::Learned(_) => {}
        }
    }

    fn stop(&self) {
        let mut inner = self.lock();
        inner.running = false;
        inner.pinged.clear();
        inner.last_ping = None;
        for entry in inner.entries.values_mut() {
            entry.probe = Probe::New;
        }
        debug!("ranker stopped with {} hosts", inner.entries.len());
    }
}

#[cfg(test)]
mod tests {
    use crate::{interval::Interval, ranker::{probe::WireAddr, NetworkState}};
    use std::sync::atomic::Ordering as AtomicOrdering;

    use super::*;

    #[derive(Default)]
    struct MockPinger {
        sent: Mutex<Vec<(Vec<SocketAddr>, HeadPing)>>,
    }

    impl MockPinger {
        fn targets(&self) -> Vec<SocketAddr> {
            let sent = self.sent.lock().unwrap();
            sent.iter().flat_map(|(t, _)| t.clone()).collect()
        }

        fn pings(&self) -> Vec<HeadPing> {
            let sent = self.sent.lock().unwrap();
            sent.iter().map(|(_, p)| p.clone()).collect()
        }
    }

    impl Pinger for MockPinger {
        fn send_probe(&self, targets: &[SocketAddr], ping: &HeadPing) {
            self.sent.lock().unwrap().push((targets.to_vec(), ping.clone()));
        }
    }

    #[derive(Default)]
    struct MockMesh {
        bad: Mutex<Vec<HostContext>>,
        learned: Mutex<Vec<HostContext>>,
    }

    impl MeshHandler for MockMesh {
        fn inform_mesh(&self, host: &HostContext, good: bool) {
            if !good {
                self.bad.lock().unwrap().push(host.clone());
            }
        }

        fn add_possible_sources(&self, hosts: Vec<HostContext>) {
            self.learned.lock().unwrap().extend(hosts);
        }
    }

    const URN: Urn = Urn([5; 20]);

    struct Fixture {
        ranker: PingRanker,
        pinger: Arc<MockPinger>,
        mesh: Arc<MockMesh>,
        network: Arc<NetworkState>,
    }

    fn fixture_with(config: RankerConfig) -> Fixture {
        let pinger = Arc::new(MockPinger::default());
        let mesh = Arc::new(MockMesh::default());
        let network = Arc::new(NetworkState::new(true, false, true));
        let ranker = PingRanker::new(network.clone(), pinger.clone(), config);
        ranker.set_mesh_handler(Some(mesh.clone()));
        Fixture {
            ranker,
            pinger,
            mesh,
            network,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RankerConfig {
            ping_interval_ms: 0,
            ..Default::default()
        })
    }

    fn addr(i: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, i], 6346))
    }

    fn host(i: u8) -> HostContext {
        HostContext::new(addr(i), Some(URN), 1000)
    }

    fn pushed(i: u8, proxies: &[u8], fwt: bool) -> HostContext {
        let mut h = HostContext::firewalled(
            Guid([i; 16]),
            addr(i),
            proxies.iter().map(|p| addr(*p)).collect(),
            Some(URN),
            1000,
        );
        h.fwt_capable = fwt;
        h
    }

    fn pong() -> HeadPong {
        HeadPong {
            has_file: true,
            complete: true,
            ..Default::default()
        }
    }

    fn queued(status: i32) -> HeadPong {
        HeadPong {
            queue_status: status,
            ..pong()
        }
    }

    #[test]
    fn pings_new_hosts() {
        let f = fixture();
        f.ranker.add_host(host(1));
        assert_eq!(f.pinger.targets(), vec![addr(1)]);
        let ping = &f.pinger.pings()[0];
        assert_eq!(ping.urn, URN);
        assert!(ping.wants(HeadPing::RANGES) && ping.wants(HeadPing::ALT_LOCS));
        assert!(ping.wants(HeadPing::PUSH_ALT_LOCS));
        assert_eq!(ping.guid, f.ranker.guid());
    }

    #[test]
    fn stops_pinging_once_enough_hosts_answered() {
        let f = fixture_with(RankerConfig {
            ping_interval_ms: 0,
            max_verified_hosts: 1,
            ..Default::default()
        });
        f.ranker.add_host(host(1));
        f.ranker.process_pong(addr(1), pong());

        f.ranker.add_to_pool((2..12).map(host).chain([host(2)]).collect());
        assert_eq!(f.pinger.targets().len(), 1);
        assert_eq!(f.ranker.num_known_hosts(), 11);

        assert_eq!(f.ranker.get_best().unwrap(), host(1));
        assert_eq!(f.pinger.targets().len(), 11);
    }

    #[test]
    fn respects_the_ping_interval() {
        let f = fixture_with(RankerConfig::default());
        f.ranker.add_host(host(1));
        f.ranker.add_host(host(2));
        assert_eq!(f.pinger.targets(), vec![addr(1)]);
    }

    #[test]
    fn learns_from_alternate_locations() {
        let f = fixture();
        f.ranker.add_host(host(1));
        f.ranker.process_pong(
            addr(1),
            HeadPong {
                alt_locs: vec![addr(2).into(), addr(3).into()],
                ..pong()
            },
        );

        assert_eq!(f.pinger.targets(), vec![addr(1), addr(2), addr(3)]);
        assert_eq!(f.mesh.learned.lock().unwrap().len(), 2);
        assert_eq!(f.ranker.get_best().unwrap(), host(1));
        assert_eq!(f.ranker.num_known_hosts(), 2);
    }

    #[test]
    fn ignores_known_alternate_locations() {
        let f = fixture();
        f.ranker.add_to_pool(vec![host(1), host(2), host(3)]);
        assert_eq!(f.pinger.targets().len(), 3);

        f.ranker.process_pong(
            addr(1),
            HeadPong {
                alt_locs: vec![addr(2).into(), addr(3).into(), addr(3).into()],
                ..pong()
            },
        );
        assert_eq!(f.pinger.targets().len(), 3);
        assert!(f.mesh.learned.lock().unwrap().is_empty());
        assert_eq!(f.ranker.num_known_hosts(), 3);
    }

    #[test]
    fn pings_push_proxies_of_firewalled_hosts() {
        let f = fixture();
        f.ranker.add_host(pushed(1, &[7, 8], false));

        let sent = f.pinger.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, vec![addr(7), addr(8)]);
        assert_eq!(sent[0].1.client_guid, Some(Guid([1; 16])));
    }

    #[test]
    fn skips_firewalled_hosts_it_cannot_reach() {
        let f = fixture();
        f.network.incoming.store(false, AtomicOrdering::Relaxed);
        f.ranker.add_host(pushed(1, &[7], false));
        assert!(f.pinger.targets().is_empty());

        f.network.fwt.store(true, AtomicOrdering::Relaxed);
        f.ranker.add_host(pushed(2, &[8], false));
        assert!(f.pinger.targets().is_empty());

        f.ranker.add_host(pushed(3, &[9], true));
        assert_eq!(f.pinger.targets(), vec![addr(9)]);
        assert_eq!(f.ranker.num_known_hosts(), 3);
    }

    #[test]
    fn drops_unsolicited_pongs() {
        let f = fixture();
        f.ranker.add_host(host(1));
        f.ranker.process_pong(addr(9), HeadPong::no_file());
        f.ranker.process_pong(addr(1), pong());
        // a second answer from the same host is unsolicited too
        f.ranker.process_pong(addr(1), HeadPong::no_file());

        assert_eq!(f.ranker.num_known_hosts(), 1);
        assert!(f.mesh.bad.lock().unwrap().is_empty());
    }

    #[test]
    fn first_proxy_answer_wins() {
        let f = fixture();
        f.ranker.add_to_pool(vec![pushed(1, &[7, 8], false), host(2)]);
        f.ranker.process_pong(addr(7), pong());
        f.ranker.process_pong(addr(8), HeadPong::no_file());

        assert_eq!(f.ranker.num_known_hosts(), 2);
        assert!(f.mesh.bad.lock().unwrap().is_empty());
        assert_eq!(f.ranker.get_best().unwrap(), pushed(1, &[], false));
    }

    #[test]
    fn prefers_hosts_that_answered() {
        let f = fixture();
        f.ranker.add_to_pool((1..=10).map(host).collect());
        f.ranker.process_pong(addr(5), pong());

        let best = f.ranker.get_best().unwrap();
        assert_eq!(best, host(5));
        assert_eq!(best.has_file, HasFile::Yes);
    }

    #[test]
    fn evicts_hosts_without_the_file() {
        let f = fixture();
        f.ranker.add_to_pool(vec![host(1), host(2)]);
        f.ranker.process_pong(addr(1), HeadPong::no_file());

        assert_eq!(f.ranker.num_known_hosts(), 1);
        assert_eq!(f.mesh.bad.lock().unwrap().clone(), vec![host(1)]);
        assert_eq!(f.ranker.get_best().unwrap(), host(2));
        assert!(matches!(f.ranker.get_best(), Err(Error::Exhausted)));
    }

    #[test]
    fn busy_hosts_come_last() {
        let f = fixture();
        f.ranker.add_to_pool(vec![host(1), host(2), host(3)]);
        f.ranker.process_pong(addr(1), HeadPong { busy: true, ..pong() });
        f.ranker.process_pong(addr(2), queued(2));

        assert_eq!(f.ranker.get_best().unwrap(), host(3));
        assert_eq!(f.ranker.get_best().unwrap(), host(2));
        assert_eq!(f.ranker.get_best().unwrap(), host(1));
    }

    #[test]
    fn sorted_by_queue_status() {
        let f = fixture();
        f.ranker.add_to_pool(vec![host(1), host(2), host(3)]);
        f.ranker.process_pong(addr(1), queued(-1));
        f.ranker.process_pong(addr(2), queued(0));
        f.ranker.process_pong(addr(3), queued(-3));

        assert_eq!(f.ranker.get_best().unwrap(), host(3));
        assert_eq!(f.ranker.get_best().unwrap(), host(1));
        assert_eq!(f.ranker.get_best().unwrap(), host(2));
    }

    #[test]
    fn firewall_preference_follows_the_network() {
        for incoming in [true, false] {
            let f = fixture();
            f.ranker.add_to_pool(vec![pushed(2, &[7], true), host(1)]);
            f.ranker.process_pong(addr(1), pong());
            f.ranker.process_pong(addr(7), pong());

            f.network.incoming.store(incoming, AtomicOrdering::Relaxed);
            let best = f.ranker.get_best().unwrap();
            assert_eq!(best.firewalled, !incoming);
            assert_eq!(f.ranker.get_best().unwrap().firewalled, incoming);
        }
    }

    #[test]
    fn prefers_partial_sources() {
        let f = fixture();
        f.ranker.add_to_pool(vec![host(1), host(2)]);
        f.ranker.process_pong(addr(1), pong());
        f.ranker.process_pong(
            addr(2),
            HeadPong {
                complete: false,
                ranges: vec![Interval::new(0, 499)],
                ..pong()
            },
        );

        let best = f.ranker.get_best().unwrap();
        assert_eq!(best, host(2));
        assert!(best.is_partial());
        assert_eq!(best.ranges().size(), 500);
    }

    #[test]
    fn evicted_hosts_are_not_learned_again() {
        let f = fixture();
        f.ranker.add_to_pool(vec![host(1), host(2)]);
        f.ranker.process_pong(addr(1), HeadPong::no_file());
        f.ranker.process_pong(
            addr(2),
            HeadPong {
                alt_locs: vec![addr(1).into()],
                ..pong()
            },
        );
        assert!(!f.ranker.add_host(host(1)));
        assert!(!f.ranker.return_host(host(1)));

        assert_eq!(f.ranker.get_best().unwrap(), host(2));
        assert!(f.ranker.get_best().is_err());
        assert!(f.mesh.learned.lock().unwrap().is_empty());
    }

    #[test]
    fn returned_hosts_keep_their_rank() {
        let f = fixture();
        f.ranker.add_to_pool(vec![host(1), host(2)]);
        f.ranker.process_pong(addr(2), pong());

        let best = f.ranker.get_best().unwrap();
        assert_eq!(best, host(2));
        assert!(f.ranker.return_host(best));

        assert_eq!(f.pinger.targets().len(), 2);
        assert_eq!(f.ranker.get_best().unwrap(), host(2));
    }

    #[test]
    fn shares_every_known_host() {
        let f = fixture();
        f.ranker.add_to_pool(vec![host(1), host(2)]);
        f.ranker.process_pong(
            addr(1),
            HeadPong {
                alt_locs: vec![addr(3).into(), WireAddr::from(addr(4))],
                ..pong()
            },
        );
        assert_eq!(f.ranker.shareable_hosts().len(), 4);
    }

    #[test]
    fn waits_for_a_hash_before_pinging() {
        let f = fixture();
        f.ranker.add_host(HostContext::new(addr(1), None, 1000));
        assert!(f.pinger.targets().is_empty());

        f.ranker.add_host(host(2));
        assert_eq!(f.pinger.targets(), vec![addr(1), addr(2)]);
    }

    #[test]
    fn stop_forgets_outstanding_pings() {
        let f = fixture();
        f.ranker.add_host(host(1));
        f.ranker.stop();
        f.ranker.process_pong(addr(1), HeadPong::no_file());
        assert_eq!(f.ranker.num_known_hosts(), 1);

        f.ranker.add_host(host(2));
        assert_eq!(f.pinger.targets().len(), 1);
        assert!(f.ranker.has_more());
    }
}
