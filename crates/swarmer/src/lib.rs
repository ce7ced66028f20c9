//! A library for downloading a single file from many sources at once.
//!
//! The download core is made of three cooperating pieces:
//!
//! * A [strategy] decides which byte range to request next, trading off
//!   early previewability against spreading requests over the whole file.
//! * A [verifying] file tracks every byte range through its lifecycle
//!   (needed, leased, written, verified) and checks written chunks against
//!   a merkle [hash_tree] in the background.
//! * A [ranker] keeps the pool of candidate sources, probes them with
//!   lightweight UDP pings and hands out the most promising one first.
//!
//! The [swarm] module wires the three together with a pool of async workers
//! that fetch ranges through a user provided [swarm::Transport].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use swarmer::{config::Config, verifying::{MemoryStorage, VerifyingFile}};
//!
//! # async fn run() -> Result<(), swarmer::error::Error> {
//! let config = Config::default();
//! let file = VerifyingFile::new(1 << 20, &config);
//! file.open(Arc::new(MemoryStorage::new(1 << 20)))?;
//!
//! let range = file.lease_white(file.chunk_size())?;
//! // fetch `range` from a source, then
//! file.write_all(range.low(), vec![0; range.len() as usize].into()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hash_tree;
pub mod host;
pub mod interval;
pub mod ranker;
pub mod strategy;
pub mod swarm;
pub mod verifying;
