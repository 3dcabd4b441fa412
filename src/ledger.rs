//! Solidarity Token Ledger
//!
//! Every clearing payment is minted as a token record keyed by its epoch.
//! Records stay redistributable until they are `expiry` epochs old; expiry is
//! the only way a record leaves the ledger.
//!
//! ## Backends
//! - `FileLedger`: append-only JSON Lines file, synced after every mint
//! - `MemoryLedger`: in-process vector with the same semantics
//!
//! Mutating calls take `&mut self`. A ledger has one writer at a time and
//! independent runs use independent ledgers.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::market::AgentId;

/// One minted levy. Also the on-disk line schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub epoch: u64,
    pub donor: AgentId,
    pub tokens: f64,
}

/// Oldest epoch still live at `epoch` for a given horizon.
pub fn live_threshold(epoch: u64, expiry: u64) -> u64 {
    epoch.saturating_sub(expiry)
}

pub trait TokenLedger {
    /// Append a record. Durable once this returns.
    fn mint(&mut self, epoch: u64, donor: &str, amount: f64) -> Result<(), LedgerError>;

    /// `(donor, tokens)` for every record minted at or after `epoch - expiry`,
    /// in insertion order.
    fn load(&self, epoch: u64, expiry: u64) -> Result<Vec<(AgentId, f64)>, LedgerError>;

    /// Delete records minted before `epoch - expiry` and return their total.
    fn expire(&mut self, epoch: u64, expiry: u64) -> Result<f64, LedgerError>;

    /// Drop every record.
    fn reset(&mut self) -> Result<(), LedgerError>;

    /// Sum of all records currently held.
    fn total_mass(&self) -> f64;
}

fn check_amount(amount: f64) -> Result<(), LedgerError> {
    if amount.is_finite() && amount >= 0.0 {
        Ok(())
    } else {
        Err(LedgerError::InvalidAmount(amount))
    }
}

fn live_rows(records: &[TokenRecord], epoch: u64, expiry: u64) -> Vec<(AgentId, f64)> {
    let threshold = live_threshold(epoch, expiry);
    records
        .iter()
        .filter(|r| r.epoch >= threshold)
        .map(|r| (r.donor.clone(), r.tokens))
        .collect()
}

/// Split off expired records, returning their summed amount.
fn drain_expired(records: &mut Vec<TokenRecord>, epoch: u64, expiry: u64) -> f64 {
    let threshold = live_threshold(epoch, expiry);
    let mut removed = 0.0;
    records.retain(|r| {
        if r.epoch < threshold {
            removed += r.tokens;
            false
        } else {
            true
        }
    });
    removed
}

#[derive(Clone, Debug, Default)]
pub struct MemoryLedger {
    records: Vec<TokenRecord>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[TokenRecord] {
        &self.records
    }
}

impl TokenLedger for MemoryLedger {
    fn mint(&mut self, epoch: u64, donor: &str, amount: f64) -> Result<(), LedgerError> {
        check_amount(amount)?;
        self.records.push(TokenRecord {
            epoch,
            donor: donor.to_string(),
            tokens: amount,
        });
        Ok(())
    }

    fn load(&self, epoch: u64, expiry: u64) -> Result<Vec<(AgentId, f64)>, LedgerError> {
        Ok(live_rows(&self.records, epoch, expiry))
    }

    fn expire(&mut self, epoch: u64, expiry: u64) -> Result<f64, LedgerError> {
        Ok(drain_expired(&mut self.records, epoch, expiry))
    }

    fn reset(&mut self) -> Result<(), LedgerError> {
        self.records.clear();
        Ok(())
    }

    fn total_mass(&self) -> f64 {
        self.records.iter().map(|r| r.tokens).sum()
    }
}

/// File-backed ledger. Each line is one JSON-encoded `TokenRecord`.
///
/// The file is replayed on `open`, so a ledger survives process restart.
/// Expiry and reset rewrite the file through a synced temp file and rename.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    records: Vec<TokenRecord>,
}

impl FileLedger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let records = match File::open(&path) {
            Ok(file) => read_records(&path, file)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(io_err(&path, e)),
        };
        Ok(Self { path, records })
    }

    pub fn records(&self) -> &[TokenRecord] {
        &self.records
    }

    fn rewrite(&self, records: &[TokenRecord]) -> Result<(), LedgerError> {
        let mut bytes = Vec::new();
        for record in records {
            serde_json::to_writer(&mut bytes, record)?;
            bytes.push(b'\n');
        }

        let temp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&temp_path).map_err(|e| io_err(&temp_path, e))?;
            file.write_all(&bytes).map_err(|e| io_err(&temp_path, e))?;
            file.sync_all().map_err(|e| io_err(&temp_path, e))?;
        }
        fs::rename(&temp_path, &self.path).map_err(|e| io_err(&self.path, e))?;
        sync_dir(parent_dir(&self.path))
    }
}

/// Directory holding `path`; a bare file name lives in `.`.
fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Persist a rename by syncing the directory entry.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), LedgerError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| io_err(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), LedgerError> {
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> LedgerError {
    LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_records(path: &Path, file: File) -> Result<Vec<TokenRecord>, LedgerError> {
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| io_err(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| LedgerError::Corrupt {
            path: path.to_path_buf(),
            line: idx + 1,
            message: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

impl TokenLedger for FileLedger {
    fn mint(&mut self, epoch: u64, donor: &str, amount: f64) -> Result<(), LedgerError> {
        check_amount(amount)?;
        let record = TokenRecord {
            epoch,
            donor: donor.to_string(),
            tokens: amount,
        };

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_err(&self.path, e))?;
        file.write_all(&line).map_err(|e| io_err(&self.path, e))?;
        file.sync_all().map_err(|e| io_err(&self.path, e))?;

        self.records.push(record);
        Ok(())
    }

    fn load(&self, epoch: u64, expiry: u64) -> Result<Vec<(AgentId, f64)>, LedgerError> {
        Ok(live_rows(&self.records, epoch, expiry))
    }

    fn expire(&mut self, epoch: u64, expiry: u64) -> Result<f64, LedgerError> {
        let threshold = live_threshold(epoch, expiry);
        if self.records.iter().all(|r| r.epoch >= threshold) {
            return Ok(0.0);
        }
        let mut kept = self.records.clone();
        let removed = drain_expired(&mut kept, epoch, expiry);
        // in-memory view only moves once the file is replaced
        self.rewrite(&kept)?;
        self.records = kept;
        Ok(removed)
    }

    fn reset(&mut self) -> Result<(), LedgerError> {
        self.rewrite(&[])?;
        self.records.clear();
        Ok(())
    }

    fn total_mass(&self) -> f64 {
        self.records.iter().map(|r| r.tokens).sum()
    }
}
