//! Persistent peer directory.
//!
//! One record per address in the `peers` table, serialized as JSON. Records
//! are created by seeding, inbound handshakes, and gossip; they are updated
//! in place and never deleted.

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use emberd_storage::{KeyValueStore, StoreError, Table, WriteBatch};

use crate::StartupError;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub last_seen: u64,
    pub last_attempt: u64,
    pub height: u64,
    pub version: String,
    pub score: u64,
}

impl Default for PeerRecord {
    fn default() -> Self {
        Self {
            last_seen: 0,
            last_attempt: 0,
            height: 1,
            version: String::new(),
            score: 0,
        }
    }
}

pub struct PeerDirectory<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> PeerDirectory<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Seeds the directory from a one-address-per-line text file. Addresses
    /// already present keep their records. The whole pass commits as one
    /// batch. An unreadable file is a fatal startup error.
    pub fn seed_from_file(&self, path: &Path) -> Result<usize, StartupError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            StartupError::SeedFile(format!("could not open {}: {err}", path.display()))
        })?;

        let mut batch = WriteBatch::new();
        let mut staged = std::collections::HashSet::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let key = canonical_address(line);
            if self.get(&key)?.is_none() && staged.insert(key.clone()) {
                stage_record(&mut batch, &key, &PeerRecord::default())?;
            }
        }
        let inserted = staged.len();
        self.commit(batch)?;
        Ok(inserted)
    }

    pub fn get(&self, addr: &str) -> Result<Option<PeerRecord>, StoreError> {
        let Some(bytes) = self.store.get(Table::Peers, addr.as_bytes())? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                debug!("dropping undecodable peer record for {addr}: {err}");
                Ok(None)
            }
        }
    }

    pub fn upsert(&self, addr: &str, record: &PeerRecord) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        stage_record(&mut batch, addr, record)?;
        self.commit(batch)
    }

    /// One full scan of the directory in storage order.
    pub fn entries(&self) -> Result<Vec<(String, PeerRecord)>, StoreError> {
        let mut out = Vec::new();
        self.store
            .for_each_prefix(Table::Peers, b"", &mut |key, value| {
                let Ok(addr) = std::str::from_utf8(key) else {
                    return Ok(());
                };
                match serde_json::from_slice::<PeerRecord>(value) {
                    Ok(record) => out.push((addr.to_string(), record)),
                    Err(err) => debug!("skipping undecodable peer record for {addr}: {err}"),
                }
                Ok(())
            })?;
        Ok(out)
    }

    pub fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.store.write_batch(batch)
    }
}

/// Stages one record write into a batch for a later atomic commit.
pub fn stage_record(
    batch: &mut WriteBatch,
    addr: &str,
    record: &PeerRecord,
) -> Result<(), StoreError> {
    let value =
        serde_json::to_vec(record).map_err(|err| StoreError::Backend(err.to_string()))?;
    batch.put(Table::Peers, addr, value);
    Ok(())
}

/// Parseable addresses are stored in their canonical textual form; anything
/// else is kept verbatim and filtered out at dial time.
fn canonical_address(line: &str) -> String {
    match line.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_storage::memory::MemoryStore;
    use std::path::PathBuf;

    fn directory() -> PeerDirectory<MemoryStore> {
        PeerDirectory::new(Arc::new(MemoryStore::new()))
    }

    fn temp_seed_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("emberd-seed-{}-{name}", std::process::id()));
        fs::write(&path, contents).expect("write seed file");
        path
    }

    #[test]
    fn seeds_missing_records_with_defaults() {
        let directory = directory();
        let path = temp_seed_file("basic", "1.2.3.4\n5.6.7.8\n\n");

        let inserted = directory.seed_from_file(&path).expect("seed");
        assert_eq!(inserted, 2);

        for addr in ["1.2.3.4", "5.6.7.8"] {
            let record = directory.get(addr).expect("get").expect("record");
            assert_eq!(record.last_seen, 0);
            assert_eq!(record.height, 1);
            assert_eq!(record.score, 0);
        }

        fs::remove_file(path).ok();
    }

    #[test]
    fn reseeding_keeps_existing_records() {
        let directory = directory();
        let path = temp_seed_file("reseed", "1.2.3.4\n");
        directory.seed_from_file(&path).expect("seed");

        let mut record = directory.get("1.2.3.4").expect("get").expect("record");
        record.height = 99;
        record.last_seen = 1_000;
        directory.upsert("1.2.3.4", &record).expect("upsert");

        let inserted = directory.seed_from_file(&path).expect("reseed");
        assert_eq!(inserted, 0);
        assert_eq!(
            directory.get("1.2.3.4").expect("get").expect("record"),
            record
        );

        fs::remove_file(path).ok();
    }

    #[test]
    fn missing_seed_file_is_fatal() {
        let directory = directory();
        let missing = std::env::temp_dir().join("emberd-seed-definitely-missing");
        assert!(matches!(
            directory.seed_from_file(&missing),
            Err(StartupError::SeedFile(_))
        ));
    }

    #[test]
    fn entries_scans_all_records() {
        let directory = directory();
        directory
            .upsert("1.1.1.1", &PeerRecord::default())
            .expect("upsert");
        directory
            .upsert(
                "2.2.2.2",
                &PeerRecord {
                    height: 12,
                    ..PeerRecord::default()
                },
            )
            .expect("upsert");

        let entries = directory.entries().expect("entries");
        assert_eq!(entries.len(), 2);
        let heights: Vec<u64> = entries.iter().map(|(_, record)| record.height).collect();
        assert!(heights.contains(&12));
    }

    #[test]
    fn seed_addresses_are_canonicalized() {
        let directory = directory();
        let path = temp_seed_file("canon", "::ffff:1.2.3.4\n");
        directory.seed_from_file(&path).expect("seed");
        // the parsed form is stored, not the raw line
        assert!(directory
            .get(&"::ffff:1.2.3.4".parse::<IpAddr>().unwrap().to_string())
            .expect("get")
            .is_some());
        fs::remove_file(path).ok();
    }
}
