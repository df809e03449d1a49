//! Slot allocation table with on-disk persistence.

// Standard library
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

// External crates
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ws_core::{Error, Result};

// Internal imports
use crate::allocation::{SlotAllocation, POOL_SIZE};

const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlotTable {
    next_slot: u32,
    #[serde(default)]
    free: BTreeSet<u32>,
    #[serde(default)]
    allocations: BTreeMap<String, SlotAllocation>,
}

impl SlotTable {
    fn take_slot(&mut self) -> Result<u32> {
        if let Some(slot) = self.free.pop_first() {
            return Ok(slot);
        }
        if self.next_slot >= POOL_SIZE {
            return Err(Error::Runtime(format!(
                "network slot pool exhausted ({} slots in use)",
                self.allocations.len()
            )));
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        Ok(slot)
    }
}

/// Hands out network slots to workspaces by name.
///
/// One allocator is built per process and shared behind an `Arc`. Mutations
/// are serialised by an internal mutex and written to disk under an exclusive
/// file lock before they are returned to the caller.
#[derive(Debug)]
pub struct SlotAllocator {
    table: Mutex<SlotTable>,
    path: Option<PathBuf>,
}

impl SlotAllocator {
    /// Default table location, `~/.ws/slots.json`.
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("could not determine home directory".into()))?;
        Ok(home.join(".ws").join("slots.json"))
    }

    /// Open the table stored at `path`. A missing or unreadable table starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let table = load_table(&path);
        info!(
            path = %path.display(),
            allocated = table.allocations.len(),
            "loaded network slot table"
        );
        Ok(Self {
            table: Mutex::new(table),
            path: Some(path),
        })
    }

    /// Allocator that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            table: Mutex::new(SlotTable::default()),
            path: None,
        }
    }

    /// Return the slot bound to `name`, binding the lowest free one if needed.
    pub fn allocate(&self, name: &str) -> Result<SlotAllocation> {
        let mut table = self.lock_table()?;
        if let Some(existing) = table.allocations.get(name) {
            return Ok(existing.clone());
        }

        let mut updated = table.clone();
        let slot = updated.take_slot()?;
        let allocation = SlotAllocation::for_slot(slot)?;
        updated
            .allocations
            .insert(name.to_string(), allocation.clone());

        self.persist(&updated)?;
        *table = updated;

        debug!(name, slot, guest_ip = %allocation.guest_ip, "allocated network slot");
        Ok(allocation)
    }

    /// Unbind `name` and return its slot to the free list.
    pub fn release(&self, name: &str) -> Result<()> {
        let mut table = self.lock_table()?;
        if !table.allocations.contains_key(name) {
            return Ok(());
        }

        let mut updated = table.clone();
        if let Some(allocation) = updated.allocations.remove(name) {
            updated.free.insert(allocation.slot);
            debug!(name, slot = allocation.slot, "released network slot");
        }

        self.persist(&updated)?;
        *table = updated;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<SlotAllocation> {
        self.table
            .lock()
            .ok()
            .and_then(|table| table.allocations.get(name).cloned())
    }

    fn lock_table(&self) -> Result<std::sync::MutexGuard<'_, SlotTable>> {
        self.table
            .lock()
            .map_err(|_| Error::Internal("slot table mutex poisoned".into()))
    }

    fn persist(&self, table: &SlotTable) -> Result<()> {
        match &self.path {
            Some(path) => write_table(path, table),
            None => Ok(()),
        }
    }
}

fn load_table(path: &Path) -> SlotTable {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SlotTable::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "slot table unreadable, starting empty");
            return SlotTable::default();
        }
    };

    if content.trim().is_empty() {
        return SlotTable::default();
    }

    match serde_json::from_str(&content) {
        Ok(table) => table,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "slot table corrupt, starting empty");
            SlotTable::default()
        }
    }
}

/// Write the table atomically under an exclusive lock on a sidecar lock file.
fn write_table(path: &Path, table: &SlotTable) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let lock_path = path.with_extension("json.lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)?;

    let lock_start = Instant::now();
    loop {
        match lock_file.try_lock_exclusive() {
            Ok(()) => break,
            Err(e) => {
                if lock_start.elapsed() > LOCK_TIMEOUT {
                    return Err(Error::Timeout(format!(
                        "waiting for lock on {}: {}",
                        lock_path.display(),
                        e
                    )));
                }
                std::thread::sleep(LOCK_RETRY_DELAY);
            }
        }
    }

    let _guard = scopeguard::guard((), |_| {
        let _ = FileExt::unlock(&lock_file);
    });

    let json = serde_json::to_string_pretty(table)?;
    let temp_path = path.with_extension(format!("json.tmp.{}", std::process::id()));
    fs::write(&temp_path, json)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_allocate_is_idempotent() {
        let allocator = SlotAllocator::in_memory();
        let first = allocator.allocate("alpha").unwrap();
        let second = allocator.allocate("alpha").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.slot, 0);
    }

    #[test]
    fn test_release_then_allocate_reuses_slot() {
        let allocator = SlotAllocator::in_memory();
        allocator.allocate("alpha").unwrap();
        let beta = allocator.allocate("beta").unwrap();
        allocator.allocate("gamma").unwrap();

        allocator.release("beta").unwrap();
        assert!(allocator.get("beta").is_none());

        let delta = allocator.allocate("delta").unwrap();
        assert_eq!(delta.slot, beta.slot);
        assert_eq!(delta.guest_ip, beta.guest_ip);
    }

    #[test]
    fn test_release_unbound_is_noop() {
        let allocator = SlotAllocator::in_memory();
        allocator.release("ghost").unwrap();
        assert_eq!(allocator.allocate("alpha").unwrap().slot, 0);
    }

    #[test]
    fn test_lowest_free_slot_wins() {
        let allocator = SlotAllocator::in_memory();
        for name in ["a", "b", "c", "d"] {
            allocator.allocate(name).unwrap();
        }
        allocator.release("d").unwrap();
        allocator.release("b").unwrap();
        assert_eq!(allocator.allocate("e").unwrap().slot, 1);
        assert_eq!(allocator.allocate("f").unwrap().slot, 3);
        assert_eq!(allocator.allocate("g").unwrap().slot, 4);
    }

    #[test]
    fn test_held_slots_are_distinct() {
        let allocator = Arc::new(SlotAllocator::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || allocator.allocate(&format!("ws-{}", i)).unwrap())
            })
            .collect();
        let allocations: Vec<SlotAllocation> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let ips: HashSet<_> = allocations.iter().map(|a| &a.guest_ip).collect();
        let taps: HashSet<_> = allocations.iter().map(|a| &a.tap_name).collect();
        let macs: HashSet<_> = allocations.iter().map(|a| &a.guest_mac).collect();
        assert_eq!(ips.len(), 8);
        assert_eq!(taps.len(), 8);
        assert_eq!(macs.len(), 8);
    }

    #[test]
    fn test_table_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("slots.json");

        {
            let allocator = SlotAllocator::open(&path).unwrap();
            allocator.allocate("alpha").unwrap();
            allocator.allocate("beta").unwrap();
            allocator.release("alpha").unwrap();
        }

        let reopened = SlotAllocator::open(&path).unwrap();
        assert_eq!(reopened.get("beta").unwrap().slot, 1);
        assert!(reopened.get("alpha").is_none());
        assert_eq!(reopened.allocate("gamma").unwrap().slot, 0);
    }

    #[test]
    fn test_corrupt_table_loads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slots.json");
        fs::write(&path, "{ not json").unwrap();

        let allocator = SlotAllocator::open(&path).unwrap();
        assert!(allocator.get("anything").is_none());
        assert_eq!(allocator.allocate("alpha").unwrap().slot, 0);

        let on_disk: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["nextSlot"], 1);
        assert_eq!(on_disk["allocations"]["alpha"]["tapName"], "fctap0");
    }

    #[test]
    fn test_pool_exhaustion_is_an_error() {
        let allocator = SlotAllocator::in_memory();
        {
            let mut table = allocator.table.lock().unwrap();
            table.next_slot = POOL_SIZE;
        }
        assert!(allocator.allocate("overflow").is_err());
        assert!(allocator.get("overflow").is_none());
    }
}
