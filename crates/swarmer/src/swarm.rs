//! Workers pulling ranges of one file from many sources at once.
//!
//! Each worker repeatedly takes the best host from the ranker, leases a
//! range that host claims to have, fetches it through the [`Transport`] and
//! streams the body into the [`VerifyingFile`]. Whatever could not be
//! written is released for another worker.
use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::{future::BoxFuture, stream::BoxStream, StreamExt};
use tokio::{task::JoinSet, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    config::RankerConfig,
    error::Error,
    host::HostContext,
    interval::{Interval, IntervalSet},
    ranker::SourceRanker,
    verifying::VerifyingFile,
};

/// How long an idle worker waits before looking for work again.
static IDLE_WAIT: Duration = Duration::from_millis(50);

/// Answer of a host to a range request.
pub struct Fetched {
    /// Ranges the host has, if it said so.
    pub available: Option<IntervalSet>,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("host is busy")]
    Busy,

    #[error("host does not have the file")]
    NoFile,

    #[error("host does not have the range")]
    Unavailable { available: IntervalSet },

    #[error("connection failed")]
    Io(#[from] io::Error),
}

/// How ranges are fetched from a host.
pub trait Transport: Send + Sync + 'static {
    fn fetch(
        &self,
        host: &HostContext,
        range: Interval,
    ) -> BoxFuture<'static, Result<Fetched, FetchError>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwarmOutcome {
    Complete,
    Hopeless,
    /// No host could provide the missing bytes.
    OutOfSources,
}

pub struct Swarm {
    file: VerifyingFile,
    ranker: Arc<dyn SourceRanker>,
    transport: Arc<dyn Transport>,
    workers: usize,
    busy_retry: Duration,
}

impl Swarm {
    pub fn new(
        file: VerifyingFile,
        ranker: Arc<dyn SourceRanker>,
        transport: Arc<dyn Transport>,
        workers: usize,
    ) -> Self {
        Self {
            file,
            ranker,
            transport,
            workers: workers.max(1),
            busy_retry: Duration::from_secs(
                RankerConfig::default().busy_retry_secs,
            ),
        }
    }

    /// How long a host that said it is busy is left alone.
    pub fn with_busy_retry(mut self, busy_retry: Duration) -> Self {
        self.busy_retry = busy_retry;
        self
    }

    pub fn file(&self) -> &VerifyingFile {
        &self.file
    }

    /// Run the workers until the file is complete, hopeless, or no host
    /// can help anymore.
    pub async fn run(self) -> Result<SwarmOutcome, Error> {
        let active = Arc::new(AtomicUsize::new(0));
        let mut workers = JoinSet::new();

        for id in 0..self.workers {
            let worker = Worker {
                id,
                file: self.file.clone(),
                ranker: self.ranker.clone(),
                transport: self.transport.clone(),
                active: active.clone(),
                busy_retry: self.busy_retry,
            };
            workers.spawn(worker.run());
        }

        while let Some(r) = workers.join_next().await {
            r?;
        }

        self.file.wait_for_pending_if_needed().await;
        let outcome = if self.file.is_complete() {
            SwarmOutcome::Complete
        } else if self.file.is_hopeless() {
            SwarmOutcome::Hopeless
        } else {
            SwarmOutcome::OutOfSources
        };
        info!(
            "swarm finished: {outcome:?}, {} of {} bytes verified, {} lost",
            self.file.verified_block_size(),
            self.file.total_size(),
            self.file.amount_lost()
        );
        Ok(outcome)
    }
}

/// What a worker does with a host after using it.
enum Fate {
    Keep(HostContext),
    Drop,
    Stop(HostContext),
}

struct Worker {
    id: usize,
    file: VerifyingFile,
    ranker: Arc<dyn SourceRanker>,
    transport: Arc<dyn Transport>,
    /// Workers holding a host, or about to take one.
    active: Arc<AtomicUsize>,
    busy_retry: Duration,
}

impl Worker {
    fn done(&self) -> bool {
        self.file.is_complete() || self.file.is_hopeless() || !self.file.is_open()
    }

    #[tracing::instrument(skip(self), name = "worker", fields(id = self.id))]
    async fn run(self) {
        while !self.done() {
            self.active.fetch_add(1, Ordering::SeqCst);
            let host = match self.ranker.get_best() {
                Ok(host) => host,
                Err(_) => {
                    let active = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
                    if active == 0 && self.file.pending_tasks() == 0 {
                        debug!("out of sources");
                        break;
                    }
                    sleep(IDLE_WAIT).await;
                    continue;
                }
            };

            let now = Instant::now();
            if let Some(until) = host.busy_until.filter(|u| *u > now) {
                self.ranker.return_host(host);
                self.active.fetch_sub(1, Ordering::SeqCst);
                sleep((until - now).min(IDLE_WAIT)).await;
                continue;
            }

            // hosts go back to the pool before this worker stops counting
            let stop = match self.download_from(host).await {
                Fate::Keep(host) => {
                    self.ranker.return_host(host);
                    false
                }
                Fate::Drop => false,
                Fate::Stop(host) => {
                    self.ranker.return_host(host);
                    true
                }
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            if stop {
                break;
            }
        }
        debug!("worker done");
    }

    async fn download_from(&self, mut host: HostContext) -> Fate {
        let range = loop {
            match self.file.lease_white_from(&host.ranges(), self.file.chunk_size()) {
                Ok(range) => break range,
                Err(Error::Exhausted) => {
                    if self.file.pending_tasks() > 0 {
                        self.file.wait_for_pending_if_needed().await;
                        if self.done() {
                            return Fate::Stop(host);
                        }
                        continue;
                    }
                    if self.file.needed().intersect(&host.ranges()).is_empty() {
                        debug!("{host} has nothing we need");
                        return Fate::Drop;
                    }
                    // other workers hold what this host has
                    sleep(IDLE_WAIT).await;
                    return Fate::Keep(host);
                }
                Err(e) => {
                    debug!("cannot lease: {e}");
                    return Fate::Stop(host);
                }
            }
        };

        let fetched = match self.transport.fetch(&host, range).await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.file.release_block(range);
                return match e {
                    FetchError::Busy => {
                        debug!("{host} is busy");
                        host.busy_until = Some(Instant::now() + self.busy_retry);
                        Fate::Keep(host)
                    }
                    FetchError::NoFile => {
                        info!("{host} does not have the file");
                        Fate::Drop
                    }
                    FetchError::Unavailable { available } => {
                        host.set_ranges(available.iter());
                        Fate::Keep(host)
                    }
                    FetchError::Io(e) => {
                        warn!("fetching {range} from {host} failed: {e}");
                        Fate::Drop
                    }
                };
            }
        };

        if let Some(available) = &fetched.available {
            host.set_ranges(available.iter());
        }

        let written = self.stream_into_file(range, fetched.body).await;
        if written <= range.high() {
            self.file.release_block(Interval::new(written, range.high()));
        }

        match written {
            w if w > range.high() => {
                debug!("got {range} from {host}");
                Fate::Keep(host)
            }
            _ if !self.file.is_open() => Fate::Stop(host),
            w => {
                warn!("{host} sent {} of {} bytes", w - range.low(), range.len());
                Fate::Drop
            }
        }
    }

    /// Write the body into the file, returns the offset after the last
    /// written byte.
    async fn stream_into_file(
        &self,
        range: Interval,
        mut body: BoxStream<'static, io::Result<Bytes>>,
    ) -> u64 {
        let mut at = range.low();

        while at <= range.high() {
            let piece = match body.next().await {
                Some(Ok(piece)) => piece,
                Some(Err(e)) => {
                    debug!("body failed at {at}: {e}");
                    break;
                }
                None => break,
            };
            let room = (range.high() - at + 1) as usize;
            let piece = piece.slice(..piece.len().min(room));
            let len = piece.len() as u64;

            if let Err(e) = self.file.write_all(at, piece).await {
                debug!("write at {at} failed: {e}");
                break;
            }
            at += len;
        }
        at
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::{stream, FutureExt};
    use hashbrown::HashMap;

    use crate::{
        config::{Config, VerifyingConfig},
        hash_tree::HashTree,
        host::Urn,
        ranker::LegacyRanker,
        strategy::SequentialStrategy,
        verifying::MemoryStorage,
    };

    use super::*;

    const SIZE: u64 = 300 * 1024 + 77;

    fn content() -> Vec<u8> {
        (0..SIZE).map(|i| (i * 7 % 253) as u8).collect()
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum Behavior {
        Good,
        Corrupt,
        /// Busy the first time it is asked.
        BusyOnce,
        NoFile,
    }

    struct MockTransport {
        data: Bytes,
        hosts: HashMap<u16, Behavior>,
        calls: Mutex<Vec<u16>>,
    }

    impl MockTransport {
        fn new(hosts: &[Behavior]) -> Self {
            Self {
                data: content().into(),
                hosts: hosts
                    .iter()
                    .enumerate()
                    .map(|(i, b)| (i as u16 + 1, *b))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for MockTransport {
        fn fetch(
            &self,
            host: &HostContext,
            range: Interval,
        ) -> BoxFuture<'static, Result<Fetched, FetchError>> {
            let port = host.addr.port();
            let asked = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(port);
                calls.iter().filter(|p| **p == port).count()
            };
            let behavior = self.hosts[&port];
            let mut body = self
                .data
                .slice(range.low() as usize..=range.high() as usize)
                .to_vec();

            let result = match behavior {
                Behavior::NoFile => Err(FetchError::NoFile),
                Behavior::BusyOnce if asked == 1 => Err(FetchError::Busy),
                Behavior::Corrupt => {
                    body.iter_mut().for_each(|b| *b = !*b);
                    Ok(body)
                }
                _ => Ok(body),
            };

            async move {
                let body = result?;
                let pieces: Vec<io::Result<Bytes>> = body
                    .chunks(4096)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                Ok(Fetched {
                    available: None,
                    body: stream::iter(pieces).boxed(),
                })
            }
            .boxed()
        }
    }

    fn file(config: &VerifyingConfig) -> VerifyingFile {
        let file = VerifyingFile::with_strategy(
            SIZE,
            config,
            Box::new(SequentialStrategy::new(SIZE)),
        );
        file.open(Arc::new(MemoryStorage::new(SIZE as usize))).unwrap();
        file.set_hash_tree(Arc::new(HashTree::create(&content()))).unwrap();
        file
    }

    fn ranker(hosts: usize) -> Arc<dyn SourceRanker> {
        let ranker = LegacyRanker::new();
        ranker.add_to_pool(
            (1..=hosts as u16)
                .map(|port| {
                    HostContext::new(
                        ([127, 0, 0, 1], port).into(),
                        Some(Urn([1; 20])),
                        SIZE,
                    )
                })
                .collect(),
        );
        Arc::new(ranker)
    }

    async fn swarm(
        behaviors: &[Behavior],
        config: &VerifyingConfig,
        workers: usize,
    ) -> (SwarmOutcome, VerifyingFile, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new(behaviors));
        let file = file(config);
        let swarm = Swarm::new(
            file.clone(),
            ranker(behaviors.len()),
            transport.clone(),
            workers,
        )
        .with_busy_retry(Duration::from_millis(20));
        let outcome = swarm.run().await.unwrap();
        (outcome, file, transport)
    }

    #[tokio::test]
    async fn downloads_from_every_host() {
        let config = Config::default().verifying;
        let (outcome, file, transport) =
            swarm(&[Behavior::Good; 3], &config, 3).await;

        assert_eq!(outcome, SwarmOutcome::Complete);
        assert_eq!(file.verified_block_size(), SIZE);
        assert_eq!(file.amount_lost(), 0);
        assert!(transport.calls.lock().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn busy_hosts_are_retried() {
        let config = VerifyingConfig::default();
        let (outcome, file, transport) =
            swarm(&[Behavior::BusyOnce], &config, 2).await;

        assert_eq!(outcome, SwarmOutcome::Complete);
        assert!(file.is_complete());
        assert!(transport.calls.lock().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn runs_out_of_sources() {
        let config = VerifyingConfig::default();
        let (outcome, file, transport) =
            swarm(&[Behavior::NoFile, Behavior::NoFile], &config, 2).await;

        assert_eq!(outcome, SwarmOutcome::OutOfSources);
        assert_eq!(file.white().size(), SIZE);
        assert_eq!(transport.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn gives_up_when_hopeless() {
        let config = VerifyingConfig {
            max_corruption: 0.1,
            ..Default::default()
        };
        let (outcome, file, _) =
            swarm(&[Behavior::Corrupt, Behavior::Corrupt], &config, 1).await;

        assert_eq!(outcome, SwarmOutcome::Hopeless);
        assert!(file.amount_lost() > SIZE / 10);
        assert_eq!(file.verified_block_size(), 0);
    }
}
