use std::io;

use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No more ranges can be selected")]
    Exhausted,

    #[error("Too much of the file was lost to corruption, the download is hopeless")]
    Hopeless,

    #[error("The file is closed")]
    FileClosed,

    #[error("The file is not open, storage must be attached first")]
    FileNotOpen,

    #[error("Hash tree describes {tree} bytes but the file has {file}")]
    TreeSizeMismatch { tree: u64, file: u64 },

    #[error("A different hash tree was refused, too many chunks were already verified against the current one")]
    TreeRefused,

    #[error("Node size {0} is not a power of two of at least 1024 bytes")]
    InvalidNodeSize(u64),

    #[error("Expected {expected} node hashes, got {got}")]
    NodeCountMismatch { expected: usize, got: usize },

    #[error("Write of {len} bytes at {offset} does not fit in a file of {size} bytes")]
    WriteOutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("No async runtime is running")]
    NoRuntime,

    #[error("Failed to encode or decode a probe packet")]
    ProbeCodec(#[from] speedy::Error),

    #[error("Could not find a home folder for the configuration")]
    HomeInvalid,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Could not serialize the configuration")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Could not parse the configuration")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error("The sender of a response was dropped")]
    ReceiveError(#[from] oneshot::error::RecvError),

    #[error("A background task panicked or was cancelled")]
    Join(#[from] tokio::task::JoinError),
}
