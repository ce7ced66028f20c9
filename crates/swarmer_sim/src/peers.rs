//! Simulated peers: a UDP probe responder each, and an in-memory transport
//! serving the file the way every peer would.
use std::{
    net::SocketAddr,
    sync::Mutex,
    time::Duration,
};

use bytes::Bytes;
use futures::{future::BoxFuture, stream, FutureExt, SinkExt, StreamExt};
use rand::{rngs::StdRng, Rng, SeedableRng};
use swarmer::{
    error::Error,
    host::HostContext,
    interval::{Interval, IntervalSet},
    ranker::probe::{HeadPong, ProbeCodec, ProbeMsg},
    swarm::{FetchError, Fetched, Transport},
};
use tokio::{net::UdpSocket, spawn, time::sleep};
use tokio_util::udp::UdpFramed;
use tracing::debug;

use crate::args::Args;

static PIECE: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Behavior {
    Honest,
    Liar,
    Busy,
    Partial,
    Empty,
}

impl Behavior {
    fn pong(self, size: u64) -> HeadPong {
        let has = HeadPong {
            has_file: true,
            complete: true,
            queue_status: -1,
            ..Default::default()
        };
        match self {
            Behavior::Honest | Behavior::Liar => has,
            Behavior::Busy => HeadPong {
                queue_status: 3,
                ..has
            },
            Behavior::Partial => HeadPong {
                complete: false,
                ranges: vec![first_half(size)],
                ..has
            },
            Behavior::Empty => HeadPong::no_file(),
        }
    }
}

fn first_half(size: u64) -> Interval {
    Interval::new(0, (size / 2).max(1) - 1)
}

pub(crate) fn roster(args: &Args) -> Vec<Behavior> {
    [
        (Behavior::Honest, args.honest),
        (Behavior::Liar, args.liars),
        (Behavior::Busy, args.busy),
        (Behavior::Partial, args.partial),
        (Behavior::Empty, args.empty),
    ]
    .into_iter()
    .flat_map(|(b, n)| std::iter::repeat(b).take(n))
    .collect()
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct SimPeer {
    pub addr: SocketAddr,
    pub behavior: Behavior,
}

/// Bind a probe responder for every behavior.
pub(crate) async fn spawn_peers(
    behaviors: &[Behavior],
    size: u64,
) -> Result<Vec<SimPeer>, Error> {
    let mut peers = Vec::with_capacity(behaviors.len());

    for behavior in behaviors {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let pong = behavior.pong(size);
        let mut framed = UdpFramed::new(socket, ProbeCodec);

        spawn(async move {
            while let Some(msg) = framed.next().await {
                match msg {
                    Ok((ProbeMsg::Ping(ping), from)) => {
                        debug!("{addr} pinged by {} for {}", ping.guid, ping.urn);
                        let _ = framed.send((ProbeMsg::Pong(pong.clone()), from)).await;
                    }
                    Ok(_) => {}
                    Err(e) => debug!("{addr} got a bad datagram: {e}"),
                }
            }
        });

        peers.push(SimPeer {
            addr,
            behavior: *behavior,
        });
    }
    Ok(peers)
}

/// Serves every simulated peer out of memory.
pub(crate) struct SimTransport {
    data: Bytes,
    peers: Vec<SimPeer>,
    rng: Mutex<StdRng>,
}

impl SimTransport {
    pub fn new(data: Vec<u8>, peers: &[SimPeer], seed: u64) -> Self {
        Self {
            data: data.into(),
            peers: peers.to_vec(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn behavior(&self, addr: SocketAddr) -> Behavior {
        self.peers
            .iter()
            .find(|p| p.addr == addr)
            .map(|p| p.behavior)
            .unwrap_or(Behavior::Empty)
    }
}

impl Transport for SimTransport {
    fn fetch(
        &self,
        host: &HostContext,
        range: Interval,
    ) -> BoxFuture<'static, Result<Fetched, FetchError>> {
        let behavior = self.behavior(host.addr);
        let size = self.data.len() as u64;

        let (latency, roll, flip) = match self.rng.lock() {
            Ok(mut rng) => (
                rng.gen_range(1..20),
                rng.gen::<f64>(),
                rng.gen_range(0..range.len()) as usize,
            ),
            Err(_) => (1, 1.0, 0),
        };

        let mut body = self
            .data
            .slice(range.low() as usize..=range.high() as usize)
            .to_vec();
        let answer = match behavior {
            Behavior::Empty => Err(FetchError::NoFile),
            Behavior::Busy if roll < 0.7 => Err(FetchError::Busy),
            Behavior::Partial if !first_half(size).contains(range.high()) => {
                Err(FetchError::Unavailable {
                    available: first_half(size).into(),
                })
            }
            Behavior::Liar => {
                body[flip] ^= 0xff;
                Ok((body, None))
            }
            Behavior::Partial => Ok((body, Some(IntervalSet::from(first_half(size))))),
            Behavior::Honest | Behavior::Busy => Ok((body, None)),
        };

        async move {
            sleep(Duration::from_millis(latency)).await;
            let (body, available) = answer?;
            let pieces: Vec<std::io::Result<Bytes>> = body
                .chunks(PIECE)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(Fetched {
                available,
                body: stream::iter(pieces).boxed(),
            })
        }
        .boxed()
    }
}
