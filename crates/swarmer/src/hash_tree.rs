//! Merkle hash tree over a file, used to verify chunks independently.
//!
//! The file is cut in 1 KiB segments. Each segment is hashed with a `0x00`
//! prefix, then pairs are hashed together with a `0x01` prefix until a
//! single root remains, an odd node being carried up unchanged.
//!
//! A tree keeps the hashes of the generation whose nodes span
//! [`HashTree::node_size`] bytes. Those nodes are the chunks a
//! [`crate::verifying::VerifyingFile`] verifies.
use std::fmt;

use sha1_smol::Sha1;

use crate::{error::Error, interval::Interval};

/// Size of the leaf segments.
pub const BASE_SEGMENT: u64 = 1024;

const LEAF_PREFIX: u8 = 0x00;
const INTERNAL_PREFIX: u8 = 0x01;

/// A 20 bytes SHA1 digest.
pub type Digest = [u8; 20];

#[derive(Clone, PartialEq, Eq)]
pub struct HashTree {
    file_size: u64,
    node_size: u64,
    nodes: Vec<Digest>,
    root: Digest,
}

impl fmt::Debug for HashTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTree")
            .field("root", &hex::encode(self.root))
            .field("file_size", &self.file_size)
            .field("node_size", &self.node_size)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

/// Depth of the tree that is kept, by file size.
pub fn calculate_depth(file_size: u64) -> u32 {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    match file_size {
        s if s < 256 * KB => 0,
        s if s < 512 * KB => 1,
        s if s < MB => 2,
        s if s < 2 * MB => 3,
        s if s < 4 * MB => 4,
        s if s < 8 * MB => 5,
        s if s < 16 * MB => 6,
        s if s < 32 * MB => 7,
        s if s < 64 * MB => 8,
        s if s < 256 * MB => 9,
        s if s < 1024 * MB => 10,
        _ => 11,
    }
}

/// Smallest power of two node size that fits the file in `2^depth` nodes.
pub fn calculate_node_size(file_size: u64, depth: u32) -> u64 {
    let max_nodes = 1u64 << depth;
    let ideal = file_size.div_ceil(max_nodes).max(1);
    ideal.next_power_of_two().max(BASE_SEGMENT)
}

fn hash_leaf(segment: &[u8]) -> Digest {
    let mut h = Sha1::new();
    h.update(&[LEAF_PREFIX]);
    h.update(segment);
    h.digest().bytes()
}

fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    let mut h = Sha1::new();
    h.update(&[INTERNAL_PREFIX]);
    h.update(left);
    h.update(right);
    h.digest().bytes()
}

/// Fold a generation of hashes into its root.
fn fold(mut level: Vec<Digest>) -> Digest {
    if level.is_empty() {
        return hash_leaf(&[]);
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [l, r] => hash_pair(l, r),
                [odd] => *odd,
                _ => unreachable!(),
            })
            .collect();
    }
    level[0]
}

/// Hash of one node, computed from its bytes.
pub fn node_hash(data: &[u8]) -> Digest {
    fold(data.chunks(BASE_SEGMENT as usize).map(hash_leaf).collect())
}

impl HashTree {
    /// Build the tree of a whole file held in memory.
    pub fn create(data: &[u8]) -> Self {
        let size = data.len() as u64;
        let node_size = calculate_node_size(size, calculate_depth(size));
        let nodes = data.chunks(node_size as usize).map(node_hash).collect();
        Self::assemble(size, node_size, nodes)
    }

    /// Rebuild a tree from the node hashes received from a source.
    pub fn from_node_hashes(
        file_size: u64,
        node_size: u64,
        nodes: Vec<Digest>,
    ) -> Result<Self, Error> {
        if node_size < BASE_SEGMENT || !node_size.is_power_of_two() {
            return Err(Error::InvalidNodeSize(node_size));
        }
        let expected = file_size.div_ceil(node_size).max(1) as usize;
        if nodes.len() != expected {
            return Err(Error::NodeCountMismatch {
                expected,
                got: nodes.len(),
            });
        }
        Ok(Self::assemble(file_size, node_size, nodes))
    }

    fn assemble(file_size: u64, node_size: u64, mut nodes: Vec<Digest>) -> Self {
        if nodes.is_empty() {
            nodes.push(hash_leaf(&[]));
        }
        let root = fold(nodes.clone());
        Self {
            file_size,
            node_size,
            nodes,
            root,
        }
    }

    pub fn root_hash(&self) -> Digest {
        self.root
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.root)
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes covered by one chunk, every chunk but the last is this long.
    pub fn node_size(&self) -> u64 {
        self.node_size
    }

    pub fn node_hashes(&self) -> &[Digest] {
        &self.nodes
    }

    pub fn num_chunks(&self) -> usize {
        self.nodes.len()
    }

    /// Byte range of a chunk, `None` past the end or for an empty file.
    pub fn chunk_range(&self, chunk: usize) -> Option<Interval> {
        let low = chunk as u64 * self.node_size;
        if low >= self.file_size {
            return None;
        }
        let high = (low + self.node_size).min(self.file_size) - 1;
        Some(Interval::new(low, high))
    }

    /// Check the bytes of a chunk against its node hash.
    pub fn verify(&self, chunk: usize, data: &[u8]) -> bool {
        let Some(range) = self.chunk_range(chunk) else {
            return false;
        };
        data.len() as u64 == range.len() && node_hash(data) == self.nodes[chunk]
    }
}
