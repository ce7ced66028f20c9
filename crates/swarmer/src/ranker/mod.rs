//! Pools of candidate sources, handing out the most promising one first.
//!
//! [`LegacyRanker`] is a plain in-memory pool for hosts that cannot receive
//! probe answers. [`PingRanker`] probes every new source over UDP before a
//! worker connects to it, and ranks sources by what they answered.
//! [`select_ranker`] picks the right one for the current network state.
mod legacy;
mod ping;
pub mod probe;
pub mod udp;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

pub use legacy::LegacyRanker;
pub use ping::PingRanker;

use crate::{config::RankerConfig, error::Error, host::HostContext};

use probe::{HeadPing, HeadPong};

/// Receives what rankers learn about sources, so other downloads of the
/// same file can use it.
pub trait MeshHandler: Send + Sync {
    /// `good` is false for a source that does not have the file.
    fn inform_mesh(&self, host: &HostContext, good: bool);
    /// Sources learned from probe answers.
    fn add_possible_sources(&self, hosts: Vec<HostContext>);
}

/// What the local host can do on the network.
pub trait LocalNetwork: Send + Sync {
    fn accepts_incoming(&self) -> bool;
    /// Firewall to firewall transfers.
    fn can_do_fwt(&self) -> bool;
    /// Whether probe answers can reach us.
    fn can_receive_unsolicited(&self) -> bool;
}

/// [`LocalNetwork`] backed by flags that can be flipped at runtime.
#[derive(Debug, Default)]
pub struct NetworkState {
    pub incoming: AtomicBool,
    pub fwt: AtomicBool,
    pub unsolicited: AtomicBool,
}

impl NetworkState {
    pub fn new(incoming: bool, fwt: bool, unsolicited: bool) -> Self {
        Self {
            incoming: AtomicBool::new(incoming),
            fwt: AtomicBool::new(fwt),
            unsolicited: AtomicBool::new(unsolicited),
        }
    }
}

impl LocalNetwork for NetworkState {
    fn accepts_incoming(&self) -> bool {
        self.incoming.load(Ordering::Relaxed)
    }

    fn can_do_fwt(&self) -> bool {
        self.fwt.load(Ordering::Relaxed)
    }

    fn can_receive_unsolicited(&self) -> bool {
        self.unsolicited.load(Ordering::Relaxed)
    }
}

/// Sends probes. Implementations must not block.
pub trait Pinger: Send + Sync {
    fn send_probe(&self, targets: &[SocketAddr], ping: &HeadPing);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RankerKind {
    Legacy,
    Ping,
}

pub trait SourceRanker: Send + Sync {
    fn kind(&self) -> RankerKind;

    /// Add candidates, returns true if at least one was new.
    fn add_to_pool(&self, hosts: Vec<HostContext>) -> bool;

    fn add_host(&self, host: HostContext) -> bool {
        self.add_to_pool(vec![host])
    }

    /// Give back a host taken with [`SourceRanker::get_best`] that is
    /// still worth using. What the ranker learned about it is kept.
    fn return_host(&self, host: HostContext) -> bool {
        self.add_host(host)
    }

    /// Remove and return the most desirable host.
    ///
    /// # Errors
    ///
    /// [`Error::Exhausted`] when the pool is empty.
    fn get_best(&self) -> Result<HostContext, Error>;

    fn has_more(&self) -> bool;

    /// Every host known right now.
    fn shareable_hosts(&self) -> Vec<HostContext>;

    fn num_known_hosts(&self) -> usize;

    fn set_mesh_handler(&self, mesh: Option<Arc<dyn MeshHandler>>);

    /// Answer to a probe this ranker sent. Rankers that never probe
    /// ignore it.
    fn process_pong(&self, _from: SocketAddr, _pong: HeadPong) {}

    /// Stop any network activity. Hosts stay in the pool.
    fn stop(&self);
}

/// The ranker that suits the network right now.
///
/// `previous` is kept when it is already of the right kind, otherwise it
/// is stopped and its hosts move to the new ranker.
pub fn select_ranker(
    network: Arc<dyn LocalNetwork>,
    pinger: Arc<dyn Pinger>,
    config: &RankerConfig,
    previous: Option<Arc<dyn SourceRanker>>,
    mesh: Option<Arc<dyn MeshHandler>>,
) -> Arc<dyn SourceRanker> {
    let wanted = if network.can_receive_unsolicited() {
        RankerKind::Ping
    } else {
        RankerKind::Legacy
    };

    if let Some(previous) = &previous {
        if previous.kind() == wanted {
            return previous.clone();
        }
    }

    let ranker: Arc<dyn SourceRanker> = match wanted {
        RankerKind::Ping => {
            Arc::new(PingRanker::new(network, pinger, config.clone()))
        }
        RankerKind::Legacy => Arc::new(LegacyRanker::new()),
    };
    ranker.set_mesh_handler(mesh);

    if let Some(previous) = previous {
        previous.stop();
        ranker.add_to_pool(previous.shareable_hosts());
    }
    ranker
}
