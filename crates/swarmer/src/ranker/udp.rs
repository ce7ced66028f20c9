//! Probes sent and answered over a UDP socket.
use std::{net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{ToSocketAddrs, UdpSocket},
    select, spawn,
    sync::mpsc,
};
use tokio_util::udp::UdpFramed;
use tracing::{debug, warn};

use crate::error::Error;

use super::{
    probe::{HeadPing, HeadPong, ProbeCodec, ProbeMsg},
    Pinger, SourceRanker,
};

static OUTGOING_CAPACITY: usize = 64;
static PONG_CAPACITY: usize = 256;

type Outgoing = (Vec<SocketAddr>, HeadPing);

/// [`Pinger`] backed by a UDP socket owned by a background task.
///
/// Pongs arriving on the socket are handed out through the receiver
/// returned by [`UdpPinger::bind`], see [`deliver_pongs`].
#[derive(Debug, Clone)]
pub struct UdpPinger {
    tx: mpsc::Sender<Outgoing>,
    local_addr: SocketAddr,
}

impl UdpPinger {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
    ) -> Result<(Self, mpsc::Receiver<(SocketAddr, HeadPong)>), Error> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;

        let (tx, rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (pong_tx, pong_rx) = mpsc::channel(PONG_CAPACITY);
        spawn(Self::run(UdpFramed::new(socket, ProbeCodec), rx, pong_tx));

        debug!("pinger bound to {local_addr}");
        Ok((Self { tx, local_addr }, pong_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[tracing::instrument(skip_all, name = "pinger::run")]
    async fn run(
        socket: UdpFramed<ProbeCodec>,
        mut rx: mpsc::Receiver<Outgoing>,
        pongs: mpsc::Sender<(SocketAddr, HeadPong)>,
    ) {
        let (mut sink, mut stream) = socket.split();

        loop {
            select! {
                msg = rx.recv() => {
                    let Some((targets, ping)) = msg else { break };
                    for target in targets {
                        let msg = ProbeMsg::Ping(ping.clone());
                        if let Err(e) = sink.send((msg, target)).await {
                            warn!("could not ping {target}: {e}");
                        }
                    }
                }
                Some(incoming) = stream.next() => {
                    match incoming {
                        Ok((ProbeMsg::Pong(pong), from)) => {
                            if pongs.send((from, pong)).await.is_err() {
                                break;
                            }
                        }
                        Ok((ProbeMsg::Ping(_), from)) => {
                            debug!("ignoring ping from {from}");
                        }
                        Err(e) => debug!("malformed datagram: {e}"),
                    }
                }
            }
        }

        debug!("pinger stopped");
    }
}

impl Pinger for UdpPinger {
    fn send_probe(&self, targets: &[SocketAddr], ping: &HeadPing) {
        if let Err(e) = self.tx.try_send((targets.to_vec(), ping.clone())) {
            debug!("dropping probe to {} hosts: {e}", targets.len());
        }
    }
}

/// Feed pongs into `ranker` until the pinger goes away.
pub async fn deliver_pongs(
    mut rx: mpsc::Receiver<(SocketAddr, HeadPong)>,
    ranker: Arc<dyn SourceRanker>,
) {
    while let Some((from, pong)) = rx.recv().await {
        ranker.process_pong(from, pong);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use crate::{
        config::RankerConfig,
        host::{Guid, HasFile, HostContext, Urn},
        ranker::{NetworkState, PingRanker},
    };

    use super::*;

    /// Answers every ping with `pong`.
    async fn responder(pong: HeadPong) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let mut framed = UdpFramed::new(socket, ProbeCodec);
        spawn(async move {
            while let Some(Ok((msg, from))) = framed.next().await {
                if let ProbeMsg::Ping(_) = msg {
                    let _ = framed.send((ProbeMsg::Pong(pong.clone()), from)).await;
                }
            }
        });
        addr
    }

    fn pong() -> HeadPong {
        HeadPong {
            has_file: true,
            complete: true,
            queue_status: -2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ping_gets_answered() {
        let peer = responder(pong()).await;
        let (pinger, mut pongs) = UdpPinger::bind("127.0.0.1:0").await.unwrap();

        let ping = HeadPing {
            guid: Guid([1; 16]),
            urn: Urn([2; 20]),
            client_guid: None,
            flags: HeadPing::RANGES,
        };
        pinger.send_probe(&[peer], &ping);

        let (from, answer) = timeout(Duration::from_secs(5), pongs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, peer);
        assert_eq!(answer, pong());
    }

    #[tokio::test]
    async fn ranker_learns_from_the_socket() {
        let peer = responder(pong()).await;
        let (pinger, pongs) = UdpPinger::bind("127.0.0.1:0").await.unwrap();

        let ranker = Arc::new(PingRanker::new(
            Arc::new(NetworkState::new(true, false, true)),
            Arc::new(pinger),
            RankerConfig {
                ping_interval_ms: 0,
                ..Default::default()
            },
        ));
        spawn(deliver_pongs(pongs, ranker.clone()));
        ranker.add_host(HostContext::new(peer, Some(Urn([2; 20])), 100));

        let answered = async {
            loop {
                let hosts = ranker.shareable_hosts();
                if hosts[0].has_file == HasFile::Yes {
                    return hosts[0].queue_status;
                }
                sleep(Duration::from_millis(10)).await;
            }
        };
        let status = timeout(Duration::from_secs(5), answered).await.unwrap();
        assert_eq!(status, -2);
    }
}
