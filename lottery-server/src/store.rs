//! Persistent bet storage and the gateway every connection goes through.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::debug;

use crate::{bet::Bet, message::DecodeError};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bet store I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("stored record on line {line} is corrupt: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: DecodeError,
    },
    #[error("bet {record:?} cannot be stored on a single line")]
    Unencodable { record: String },
    #[error("bet store lock poisoned by a panicked writer")]
    Poisoned,
    #[error("bet store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Backing storage for accepted bets.
///
/// Implementations may block; the gateway calls them off the async runtime
/// and never concurrently.
pub trait BetStore: Send {
    /// Durably appends every bet, in order, before returning.
    fn append(&mut self, bets: &[Bet]) -> Result<(), StorageError>;

    /// Returns every bet stored so far.
    fn read_all(&self) -> Result<Vec<Bet>, StorageError>;
}

/// Stores one bet per line in a CSV file.
#[derive(Debug, Clone)]
pub struct FileBetStore {
    path: PathBuf,
}

impl FileBetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BetStore for FileBetStore {
    fn append(&mut self, bets: &[Bet]) -> Result<(), StorageError> {
        // Encode the whole batch up front so it lands in a single write.
        let mut encoded = String::new();
        for bet in bets {
            let record = bet.to_string();
            if record.contains(['\n', '\r']) {
                return Err(StorageError::Unencodable { record });
            }
            encoded.push_str(&record);
            encoded.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(encoded.as_bytes())?;
        file.sync_data()?;
        debug!(path = %self.path.display(), count = bets.len(), "appended bets");
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<Bet>, StorageError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut bets = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let bet = Bet::parse_record(&line).map_err(|source| StorageError::Corrupt {
                line: index + 1,
                source,
            })?;
            bets.push(bet);
        }
        Ok(bets)
    }
}

/// Keeps bets in memory; nothing survives the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryBetStore {
    bets: Vec<Bet>,
}

impl MemoryBetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BetStore for MemoryBetStore {
    fn append(&mut self, bets: &[Bet]) -> Result<(), StorageError> {
        self.bets.extend_from_slice(bets);
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<Bet>, StorageError> {
        Ok(self.bets.clone())
    }
}

/// The only path to the bet store.
///
/// One lock covers both appends and reads, so batches from different
/// agencies never interleave and a read never sees half a batch.
#[derive(Clone)]
pub struct BetStoreGateway {
    store: Arc<Mutex<Box<dyn BetStore>>>,
}

impl BetStoreGateway {
    pub fn new(store: impl BetStore + 'static) -> Self {
        Self {
            store: Arc::new(Mutex::new(Box::new(store))),
        }
    }

    pub async fn append_batch(&self, bets: Vec<Bet>) -> Result<(), StorageError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let mut store = store.lock().map_err(|_| StorageError::Poisoned)?;
            store.append(&bets)
        })
        .await?
    }

    pub async fn read_all(&self) -> Result<Vec<Bet>, StorageError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let store = store.lock().map_err(|_| StorageError::Poisoned)?;
            store.read_all()
        })
        .await?
    }
}
