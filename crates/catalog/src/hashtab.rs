//! Hashtable loading and the hashtable catalog service.
//!
//! On disk a hashtable is a stream of `(hash: u64 BE, len: u32 BE, bytes)`
//! records. Records with `hash == 0` are informational headers. The reserved
//! record [`VERSION_SENTINEL`] carries the authoritative firmware version,
//! overriding whatever the filename encodes.

use crate::{parse_version, CatalogError};
use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::{error, info, warn};
use walkdir::WalkDir;

/// Hash of the reserved record whose string overrides the filename-derived
/// OS version.
pub const VERSION_SENTINEL: u64 = 17_607_111_715_072_197_239;

/// One loaded firmware hashtable.
#[derive(Debug, Clone)]
pub struct Hashtab {
    /// File basename; unique within a catalog.
    pub name: String,
    pub path: PathBuf,
    pub os_version: String,
    pub device: String,
    pub entries: HashMap<u64, String>,
}

impl Hashtab {
    /// Loads a hashtable from a record-stream file.
    ///
    /// # Errors
    /// Fails on I/O errors and on streams truncated mid-record.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let file = File::open(path)?;
        let (entries, embedded_version) = read_records(file, path)?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let (mut os_version, device) = parse_version(&name);
        if let Some(version) = embedded_version {
            os_version = version;
        }

        Ok(Self {
            name,
            path: path.to_path_buf(),
            os_version,
            device,
            entries,
        })
    }

    /// A "hashlist" carries only hashes: every entry string is empty.
    /// Semantically identical for validation; tracked for logging only.
    pub fn is_hashlist(&self) -> bool {
        self.entries.values().all(|v| v.is_empty())
    }
}

fn read_records<R: Read>(
    mut reader: R,
    path: &Path,
) -> Result<(HashMap<u64, String>, Option<String>), CatalogError> {
    let mut entries = HashMap::new();
    let mut version = None;

    loop {
        let mut hash_buf = [0u8; 8];
        match reader.read_exact(&mut hash_buf) {
            Ok(()) => {}
            // Clean EOF is only legal at a record boundary.
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let hash = u64::from_be_bytes(hash_buf);

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).map_err(|e| truncated(e, path))?;
        let len = u32::from_be_bytes(len_buf) as usize;

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data).map_err(|e| truncated(e, path))?;
        let value = String::from_utf8_lossy(&data).into_owned();

        if hash == 0 {
            continue;
        }
        if hash == VERSION_SENTINEL {
            version = Some(value.clone());
        }
        entries.insert(hash, value);
    }

    Ok((entries, version))
}

fn truncated(err: std::io::Error, path: &Path) -> CatalogError {
    if err.kind() == ErrorKind::UnexpectedEof {
        CatalogError::TruncatedRecord {
            path: path.display().to_string(),
        }
    } else {
        err.into()
    }
}

/// DJB2 over a symbol name, as used by the hashlist format.
pub fn djb2_hash(s: &str) -> u64 {
    let mut hash: u64 = 5481;
    for byte in s.bytes() {
        hash = (hash << 5).wrapping_add(hash).wrapping_add(u64::from(byte));
    }
    hash
}

/// Writes a bare hashlist: every record has an empty string payload.
pub fn write_hashlist(hashes: &[u64], output_path: &Path) -> Result<(), CatalogError> {
    let mut file = File::create(output_path)?;
    for &hash in hashes {
        file.write_all(&hash.to_be_bytes())?;
        file.write_all(&0u32.to_be_bytes())?;
    }
    Ok(())
}

#[derive(Default)]
struct State {
    tables: Vec<Arc<Hashtab>>,
    mod_times: HashMap<PathBuf, SystemTime>,
}

/// Refresh-aware catalog of every hashtable under a directory.
pub struct HashtabService {
    dir: PathBuf,
    state: RwLock<State>,
}

impl HashtabService {
    /// Walks `dir` and loads every hashtable in it.
    ///
    /// A missing directory is not fatal: it is created and the catalog starts
    /// empty. Files that fail to load are logged and skipped.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let dir = dir.into();
        let service = Self {
            dir: dir.clone(),
            state: RwLock::new(State::default()),
        };

        if !dir.exists() {
            warn!(dir = %dir.display(), "hashtable directory does not exist, creating");
            std::fs::create_dir_all(&dir)?;
            return Ok(service);
        }

        let state = load_dir(&dir);
        *service.state.write().expect("hashtab lock poisoned") = state;
        Ok(service)
    }

    /// Snapshot of all loaded hashtables.
    pub fn hashtables(&self) -> Vec<Arc<Hashtab>> {
        self.state
            .read()
            .expect("hashtab lock poisoned")
            .tables
            .clone()
    }

    /// Looks a hashtable up by its unique name.
    pub fn get(&self, name: &str) -> Option<Arc<Hashtab>> {
        self.state
            .read()
            .expect("hashtab lock poisoned")
            .tables
            .iter()
            .find(|ht| ht.name == name)
            .cloned()
    }

    /// Re-walks the directory and rebuilds the catalog if membership or any
    /// modification time changed. Idempotent when the filesystem is
    /// unchanged.
    pub fn check_and_reload(&self) -> Result<(), CatalogError> {
        let mut state = self.state.write().expect("hashtab lock poisoned");

        let mut current: HashMap<PathBuf, SystemTime> = HashMap::new();
        for entry in WalkDir::new(&self.dir).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                if let Ok(mtime) = meta.modified() {
                    current.insert(entry.path().to_path_buf(), mtime);
                }
            }
        }

        let changed = current.len() != state.mod_times.len()
            || current
                .iter()
                .any(|(path, mtime)| state.mod_times.get(path) != Some(mtime));
        if !changed {
            return Ok(());
        }

        info!(dir = %self.dir.display(), "detected hashtable changes, reloading");
        *state = load_dir(&self.dir);
        info!(count = state.tables.len(), "hashtable reload complete");
        Ok(())
    }
}

fn load_dir(dir: &Path) -> State {
    let mut state = State::default();
    let mut loaded_names: HashMap<String, PathBuf> = HashMap::new();

    for entry in WalkDir::new(dir).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        if let Some(existing) = loaded_names.get(&filename) {
            warn!(
                file = %path.display(),
                existing = %existing.display(),
                "skipping duplicate hashtable file"
            );
            continue;
        }

        let table = match Hashtab::load(path) {
            Ok(table) => table,
            Err(err) => {
                error!(file = %filename, error = %err, "failed to load hashtable");
                continue;
            }
        };

        let format = if table.is_hashlist() {
            "hashlist (hash-only)"
        } else {
            "hashtab (with strings)"
        };
        info!(
            file = %filename,
            format,
            entries = table.entries.len(),
            version = %table.os_version,
            "loaded hashtable"
        );

        loaded_names.insert(filename, path.to_path_buf());
        state.tables.push(Arc::new(table));
        if let Ok(meta) = entry.metadata() {
            if let Ok(mtime) = meta.modified() {
                state.mod_times.insert(path.to_path_buf(), mtime);
            }
        }
    }

    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp_dir(name: &str) -> PathBuf {
        let d = std::env::temp_dir().join(name);
        fs::remove_dir_all(&d).ok();
        fs::create_dir_all(&d).ok();
        d
    }

    fn record(hash: u64, value: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&hash.to_be_bytes());
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
        out
    }

    #[test]
    fn test_load_parses_records() {
        let tmp = tmp_dir("catalog_ht_load");
        let mut bytes = record(0, "header junk");
        bytes.extend(record(101, "SymbolA"));
        bytes.extend(record(202, "SymbolB"));
        let path = tmp.join("3.20.0.92-rmpp");
        fs::write(&path, &bytes).ok();

        let table = Hashtab::load(&path).unwrap();
        assert_eq!(table.name, "3.20.0.92-rmpp");
        assert_eq!(table.os_version, "3.20.0.92");
        assert_eq!(table.device, "rmpp");
        assert_eq!(table.entries.len(), 2);
        assert_eq!(table.entries[&101], "SymbolA");
        assert!(!table.is_hashlist());

        fs::remove_dir_all(tmp).ok();
    }

    #[test]
    fn test_sentinel_overrides_version() {
        let tmp = tmp_dir("catalog_ht_sentinel");
        let mut bytes = record(VERSION_SENTINEL, "9.9.9");
        bytes.extend(record(5, "X"));
        let path = tmp.join("1.0-rm2");
        fs::write(&path, &bytes).ok();

        let table = Hashtab::load(&path).unwrap();
        assert_eq!(table.os_version, "9.9.9");
        assert_eq!(table.device, "rm2");
        // The sentinel record itself still lands in the entry map.
        assert_eq!(table.entries[&VERSION_SENTINEL], "9.9.9");

        fs::remove_dir_all(tmp).ok();
    }

    #[test]
    fn test_hashlist_classification() {
        let tmp = tmp_dir("catalog_ht_hashlist");
        let mut bytes = record(1, "");
        bytes.extend(record(2, ""));
        let path = tmp.join("2.0-rmpp");
        fs::write(&path, &bytes).ok();

        let table = Hashtab::load(&path).unwrap();
        assert!(table.is_hashlist());

        fs::remove_dir_all(tmp).ok();
    }

    #[test]
    fn test_truncated_record_fails() {
        let tmp = tmp_dir("catalog_ht_trunc");
        let mut bytes = record(1, "ok");
        bytes.extend_from_slice(&42u64.to_be_bytes());
        bytes.extend_from_slice(&[0, 0]); // half a length field
        let path = tmp.join("bad-rm2");
        fs::write(&path, &bytes).ok();

        let err = Hashtab::load(&path).unwrap_err();
        assert!(matches!(err, CatalogError::TruncatedRecord { .. }));

        fs::remove_dir_all(tmp).ok();
    }

    #[test]
    fn test_missing_dir_creates_empty_catalog() {
        let tmp = std::env::temp_dir().join("catalog_ht_missing");
        fs::remove_dir_all(&tmp).ok();

        let service = HashtabService::new(&tmp).unwrap();
        assert!(service.hashtables().is_empty());
        assert!(tmp.exists());

        fs::remove_dir_all(tmp).ok();
    }

    #[test]
    fn test_duplicate_basenames_first_wins() {
        let tmp = tmp_dir("catalog_ht_dup");
        fs::create_dir_all(tmp.join("a")).ok();
        fs::create_dir_all(tmp.join("b")).ok();
        fs::write(tmp.join("a/1.0-rm2"), record(1, "x")).ok();
        fs::write(tmp.join("b/1.0-rm2"), record(2, "y")).ok();

        let service = HashtabService::new(&tmp).unwrap();
        let tables = service.hashtables();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "1.0-rm2");

        fs::remove_dir_all(tmp).ok();
    }

    #[test]
    fn test_reload_picks_up_new_and_removed_files() {
        let tmp = tmp_dir("catalog_ht_reload");
        fs::write(tmp.join("1.0-rm2"), record(1, "x")).ok();

        let service = HashtabService::new(&tmp).unwrap();
        assert_eq!(service.hashtables().len(), 1);

        // Unchanged filesystem: listing is stable.
        service.check_and_reload().unwrap();
        assert_eq!(service.hashtables().len(), 1);

        fs::write(tmp.join("2.0-rmpp"), record(2, "y")).ok();
        service.check_and_reload().unwrap();
        assert_eq!(service.hashtables().len(), 2);

        fs::remove_file(tmp.join("1.0-rm2")).ok();
        service.check_and_reload().unwrap();
        let tables = service.hashtables();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "2.0-rmpp");

        fs::remove_dir_all(tmp).ok();
    }

    #[test]
    fn test_get_by_name() {
        let tmp = tmp_dir("catalog_ht_get");
        fs::write(tmp.join("1.0-rm2"), record(1, "x")).ok();

        let service = HashtabService::new(&tmp).unwrap();
        assert!(service.get("1.0-rm2").is_some());
        assert!(service.get("nope").is_none());

        fs::remove_dir_all(tmp).ok();
    }

    #[test]
    fn test_djb2_known_values() {
        assert_eq!(djb2_hash(""), 5481);
        // hash = 5481*33 + 'a'
        assert_eq!(djb2_hash("a"), 5481 * 33 + 97);
        assert_eq!(djb2_hash("ab"), (5481 * 33 + 97) * 33 + 98);
    }

    #[test]
    fn test_hashlist_roundtrip() {
        let tmp = tmp_dir("catalog_ht_writelist");
        let path = tmp.join("out-rm2");
        write_hashlist(&[10, 20, 30], &path).unwrap();

        let table = Hashtab::load(&path).unwrap();
        assert!(table.is_hashlist());
        assert_eq!(table.entries.len(), 3);
        assert!(table.entries.contains_key(&20));

        fs::remove_dir_all(tmp).ok();
    }
}
