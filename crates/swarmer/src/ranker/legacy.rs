use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hashbrown::HashMap;
use tracing::debug;

use crate::{
    error::Error,
    host::{HostContext, HostKey},
};

use super::{MeshHandler, RankerKind, SourceRanker};

#[derive(Default)]
struct Pool {
    hosts: HashMap<HostKey, (u64, HostContext)>,
    seq: u64,
}

/// In-memory pool without network activity.
///
/// Hosts carrying the file's hash are handed out first, then hosts in the
/// order they were added.
#[derive(Default)]
pub struct LegacyRanker {
    pool: Mutex<Pool>,
}

impl LegacyRanker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SourceRanker for LegacyRanker {
    fn kind(&self) -> RankerKind {
        RankerKind::Legacy
    }

    fn add_to_pool(&self, hosts: Vec<HostContext>) -> bool {
        let mut pool = self.lock();
        let mut added = false;
        for host in hosts {
            let key = host.key();
            match pool.hosts.get_mut(&key) {
                Some((_, known)) => {
                    if known.urn.is_none() && host.urn.is_some() {
                        *known = host;
                    }
                }
                None => {
                    pool.seq += 1;
                    let seq = pool.seq;
                    pool.hosts.insert(key, (seq, host));
                    added = true;
                }
            }
        }
        added
    }

    fn get_best(&self) -> Result<HostContext, Error> {
        let mut pool = self.lock();
        let key = pool
            .hosts
            .iter()
            .min_by_key(|(_, (seq, host))| (host.urn.is_none(), *seq))
            .map(|(key, _)| *key)
            .ok_or(Error::Exhausted)?;
        let (_, host) = pool.hosts.remove(&key).ok_or(Error::Exhausted)?;
        debug!("best host {host}");
        Ok(host)
    }

    fn has_more(&self) -> bool {
        !self.lock().hosts.is_empty()
    }

    fn shareable_hosts(&self) -> Vec<HostContext> {
        self.lock().hosts.values().map(|(_, h)| h.clone()).collect()
    }

    fn num_known_hosts(&self) -> usize {
        self.lock().hosts.len()
    }

    fn set_mesh_handler(&self, _mesh: Option<Arc<dyn MeshHandler>>) {}

    fn stop(&self) {}
}
