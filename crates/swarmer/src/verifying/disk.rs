//! Disk is responsible for the file I/O of one verifying file.
//!
//! Writes are queued in a bounded channel, which is the write buffer of
//! the file. The actor performs them one by one on the blocking pool and
//! reports every landed write back to the file.
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{Arc, Mutex, Weak},
};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::interval::Interval;

use super::{Shared, WriteRequest};

/// Positional storage behind a verifying file.
///
/// Calls are blocking, they are only made from the blocking pool.
pub trait Storage: Send + Sync {
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    /// Bytes currently held, which may be less than the file size.
    fn len(&self) -> io::Result<u64>;
    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// A file on disk.
#[derive(Debug)]
pub struct FileStorage {
    file: Mutex<File>,
}

impl FileStorage {
    /// Open or create the file at `path`, keeping existing content.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn file(&self) -> io::Result<std::sync::MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "poisoned file lock"))
    }
}

impl Storage for FileStorage {
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    fn flush(&self) -> io::Result<()> {
        self.file()?.sync_data()
    }
}

/// Storage held in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryStorage {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Storage that already holds `bytes`, as left by an earlier session.
    pub fn with_content(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    /// Copy of the whole content.
    pub fn to_vec(&self) -> Vec<u8> {
        match self.bytes.lock() {
            Ok(b) => b.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn bytes(&self) -> io::Result<std::sync::MutexGuard<'_, Vec<u8>>> {
        self.bytes
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "poisoned buffer lock"))
    }
}

impl Storage for MemoryStorage {
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut bytes = self.bytes()?;
        let start = offset as usize;
        let end = start + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let bytes = self.bytes()?;
        let start = offset as usize;
        let end = start + buf.len();
        if bytes.len() < end {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.bytes()?.len() as u64)
    }
}

#[derive(Debug)]
pub(crate) enum DiskMsg {
    /// Write the bytes to storage, then report them as written.
    Write(WriteRequest),
    Quit,
}

/// Serializes the writes of one file.
pub(crate) struct Disk {
    rx: mpsc::Receiver<DiskMsg>,
    storage: Arc<dyn Storage>,
    file: Weak<Shared>,
}

impl Disk {
    pub fn new(
        rx: mpsc::Receiver<DiskMsg>,
        storage: Arc<dyn Storage>,
        file: Weak<Shared>,
    ) -> Self {
        Self { rx, storage, file }
    }

    #[tracing::instrument(skip(self), name = "disk::run")]
    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                DiskMsg::Write(req) => {
                    if !self.write(req).await {
                        break;
                    }
                    // a slot was freed, resume writers that were waiting
                    // for one
                    loop {
                        let Some(file) = self.file.upgrade() else {
                            return;
                        };
                        let Some((req, callback)) = file.next_waiting() else {
                            break;
                        };
                        drop(file);
                        if !self.write(req).await {
                            return;
                        }
                        callback();
                    }
                }
                DiskMsg::Quit => {
                    debug!("quit");
                    break;
                }
            }
        }

        let storage = self.storage.clone();
        if let Ok(Err(e)) =
            tokio::task::spawn_blocking(move || storage.flush()).await
        {
            warn!("could not flush storage: {e}");
        }
    }

    /// Returns false once the file is gone.
    async fn write(&mut self, req: WriteRequest) -> bool {
        let Some(range) = req.range() else {
            return true;
        };
        let storage = self.storage.clone();
        let data = req.data.clone();
        let result = tokio::task::spawn_blocking(move || {
            storage.write_at(range.low(), &data)
        })
        .await;

        let Some(file) = self.file.upgrade() else {
            return false;
        };
        match result {
            Ok(Ok(())) => file.write_landed(range),
            Ok(Err(e)) => file.write_failed(range, &e.to_string()),
            Err(e) => file.write_failed(range, &e.to_string()),
        }
        true
    }
}

/// Read a chunk back from storage, retrying transient failures.
pub(crate) fn read_chunk(
    storage: &dyn Storage,
    range: Interval,
    retries: usize,
) -> Option<Vec<u8>> {
    let mut buf = vec![0; range.len() as usize];
    for attempt in 0..=retries {
        match storage.read_at(range.low(), &mut buf) {
            Ok(()) => return Some(buf),
            Err(e) => {
                debug!("read of {range} failed, attempt {attempt}: {e}");
            }
        }
    }
    warn!("giving up reading {range} back from storage");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_round_trip() {
        let s = MemoryStorage::new(0);
        s.write_at(4, b"abcd").unwrap();
        assert_eq!(s.len().unwrap(), 8);

        let mut buf = [0u8; 6];
        s.read_at(2, &mut buf).unwrap();
        assert_eq!(&buf, b"\0\0abcd");
        assert!(s.read_at(6, &mut buf).is_err());
    }

    #[test]
    fn file_storage_round_trip() {
        let mut path = std::env::temp_dir();
        path.push(format!("swarmer-disk-{}", std::process::id()));
        let s = FileStorage::open(&path).unwrap();
        s.write_at(10, b"hello").unwrap();
        assert_eq!(s.len().unwrap(), 15);

        let mut buf = [0u8; 5];
        s.read_at(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(read_chunk(&s, Interval::new(10, 14), 0).is_some());
        assert!(read_chunk(&s, Interval::new(10, 20), 2).is_none());

        std::fs::remove_file(&path).unwrap();
    }
}
