//! Registry of frozen byte ranges, overlaid onto every store update and
//! periodically pushed back to the emulator.
use crate::property::expr::{self, CompiledExpr, ExprError};
use crate::utils::now_ms;
use shared::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

/// Shared view of the monitor's last property snapshot, the scope freeze
/// predicates evaluate against.
pub type SnapshotScope = Arc<RwLock<HashMap<String, Value>>>;

#[derive(Debug, thiserror::Error)]
pub enum FreezeError {
    #[error("address {0:#06x} is not frozen")]
    NotFrozen(u32),

    #[error("freeze conflict: {0}")]
    Conflict(String),

    #[error("invalid freeze predicate: {0}")]
    Predicate(#[from] ExprError),
}

/// Who installed a freeze entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
pub enum FreezeSource {
    #[default]
    Manual,
    Automatic,
    Default,
}

#[derive(Debug, Clone)]
pub struct FreezeEntry {
    pub address: u32,
    pub bytes: Vec<u8>,
    pub frozen_at_ms: u64,
    pub last_write_back_ms: Option<u64>,
    /// Overlay corrections applied since the freeze was installed.
    pub write_attempts: u64,
    pub expires_at_ms: Option<u64>,
    /// Entry applies only while the predicate holds over the last snapshot.
    pub predicate: Option<CompiledExpr>,
    pub source: FreezeSource,
}

impl FreezeEntry {
    fn end(&self) -> u32 {
        self.address + self.bytes.len() as u32
    }

    fn intersects(&self, start: u32, len: usize) -> bool {
        self.address < start + len as u32 && start < self.end()
    }

    fn inside(&self, start: u32, len: usize) -> bool {
        self.address >= start && self.end() <= start + len as u32
    }
}

#[derive(Debug, Clone, Default)]
pub struct FreezeOptions {
    pub expires_at_ms: Option<u64>,
    pub predicate: Option<String>,
    pub source: FreezeSource,
}

/// Diagnostics for one overlay pass over a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayStats {
    pub applied: usize,
    pub skipped_cross_block: usize,
    pub skipped_predicate: usize,
}

pub struct FreezeRegistry {
    entries: Mutex<BTreeMap<u32, FreezeEntry>>,
    scope: SnapshotScope,
}

impl FreezeRegistry {
    pub fn new(scope: SnapshotScope) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            scope,
        }
    }

    /// Installs or replaces the entry at `address`.
    ///
    /// Replacing the same address is the re-freeze-with-new-value path;
    /// overlapping a different entry's range is a conflict.
    pub fn freeze(
        &self,
        address: u32,
        bytes: Vec<u8>,
        options: FreezeOptions,
    ) -> Result<(), FreezeError> {
        let predicate = options
            .predicate
            .as_deref()
            .map(expr::compile)
            .transpose()?;

        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values() {
            if entry.address != address && entry.intersects(address, bytes.len()) {
                return Err(FreezeError::Conflict(format!(
                    "range {:#06x}+{} overlaps the freeze at {:#06x}",
                    address,
                    bytes.len(),
                    entry.address
                )));
            }
        }
        entries.insert(
            address,
            FreezeEntry {
                address,
                bytes,
                frozen_at_ms: now_ms(),
                last_write_back_ms: None,
                write_attempts: 0,
                expires_at_ms: options.expires_at_ms,
                predicate,
                source: options.source,
            },
        );
        Ok(())
    }

    pub fn unfreeze(&self, address: u32) -> Result<FreezeEntry, FreezeError> {
        self.entries
            .lock()
            .unwrap()
            .remove(&address)
            .ok_or(FreezeError::NotFrozen(address))
    }

    pub fn is_frozen(&self, address: u32) -> bool {
        self.entries.lock().unwrap().contains_key(&address)
    }

    /// Whether any entry intersects `[address, address + width)`.
    pub fn range_frozen(&self, address: u32, width: usize) -> bool {
        self.entries
            .lock()
            .unwrap()
            .values()
            .any(|e| e.intersects(address, width))
    }

    /// Snapshot of all live entries. Expired entries are reaped first.
    pub fn list(&self) -> Vec<FreezeEntry> {
        self.cleanup_expired(now_ms());
        self.entries.lock().unwrap().values().cloned().collect()
    }

    /// Removes entries past their expiry; returns the freed addresses.
    pub fn cleanup_expired(&self, now: u64) -> Vec<u32> {
        let mut entries = self.entries.lock().unwrap();
        let expired: Vec<u32> = entries
            .values()
            .filter(|e| e.expires_at_ms.is_some_and(|t| t <= now))
            .map(|e| e.address)
            .collect();
        for address in &expired {
            entries.remove(address);
        }
        expired
    }

    /// Copies frozen bytes over an incoming block before it is published.
    ///
    /// Only entries fully inside the block apply; entries straddling the
    /// block edge are counted and left for a pass over their own block.
    pub fn overlay_block(&self, start: u32, bytes: &mut [u8]) -> OverlayStats {
        let mut stats = OverlayStats::default();
        let scope = self.scope.read().unwrap();
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            if !entry.intersects(start, bytes.len()) {
                continue;
            }
            if !entry.inside(start, bytes.len()) {
                stats.skipped_cross_block += 1;
                continue;
            }
            if let Some(predicate) = &entry.predicate {
                match predicate.eval_bool(&*scope) {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        stats.skipped_predicate += 1;
                        continue;
                    }
                }
            }
            let offset = (entry.address - start) as usize;
            bytes[offset..offset + entry.bytes.len()].copy_from_slice(&entry.bytes);
            entry.write_attempts += 1;
            stats.applied += 1;
        }
        stats
    }

    /// Entries due for the periodic emulator write-back, with bookkeeping.
    pub fn write_back_targets(&self, now: u64) -> Vec<(u32, Vec<u8>)> {
        let scope = self.scope.read().unwrap();
        let mut entries = self.entries.lock().unwrap();
        let mut targets = Vec::new();
        for entry in entries.values_mut() {
            if let Some(predicate) = &entry.predicate
                && !predicate.eval_bool(&*scope).unwrap_or(false)
            {
                continue;
            }
            entry.last_write_back_ms = Some(now);
            targets.push((entry.address, entry.bytes.clone()));
        }
        targets
    }

    /// Drops every entry without emitting anything; reload path only.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FreezeRegistry {
        FreezeRegistry::new(Arc::new(RwLock::new(HashMap::new())))
    }

    #[test]
    fn overlay_rewrites_frozen_slice() {
        let reg = registry();
        reg.freeze(0xC102, vec![0x96, 0x00], FreezeOptions::default())
            .unwrap();

        let mut block = vec![0u8; 8];
        block[2] = 0x4B;
        let stats = reg.overlay_block(0xC100, &mut block);
        assert_eq!(stats.applied, 1);
        assert_eq!(&block[2..4], &[0x96, 0x00]);
    }

    #[test]
    fn overlay_is_idempotent() {
        let reg = registry();
        reg.freeze(0xC102, vec![0x96, 0x00], FreezeOptions::default())
            .unwrap();
        let mut once = vec![0x11u8; 8];
        reg.overlay_block(0xC100, &mut once);
        let mut twice = once.clone();
        reg.overlay_block(0xC100, &mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn cross_block_entries_are_skipped_and_counted() {
        let reg = registry();
        reg.freeze(0xC0FE, vec![1, 2, 3, 4], FreezeOptions::default())
            .unwrap();
        let mut block = vec![0u8; 16];
        let stats = reg.overlay_block(0xC100, &mut block);
        assert_eq!(stats.applied, 0);
        assert_eq!(stats.skipped_cross_block, 1);
        assert_eq!(block, vec![0u8; 16], "no partial overlay");
    }

    #[test]
    fn overlapping_ranges_conflict_but_same_address_replaces() {
        let reg = registry();
        reg.freeze(0xD000, vec![1, 2], FreezeOptions::default())
            .unwrap();
        let err = reg
            .freeze(0xD001, vec![9], FreezeOptions::default())
            .unwrap_err();
        assert!(matches!(err, FreezeError::Conflict(_)));
        // Re-freezing the same address carries the new value.
        reg.freeze(0xD000, vec![7, 8], FreezeOptions::default())
            .unwrap();
        assert_eq!(reg.list()[0].bytes, vec![7, 8]);
    }

    #[test]
    fn expired_entries_are_reaped() {
        let reg = registry();
        reg.freeze(
            0xD000,
            vec![1],
            FreezeOptions {
                expires_at_ms: Some(5),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(reg.cleanup_expired(4), Vec::<u32>::new());
        assert_eq!(reg.cleanup_expired(5), vec![0xD000]);
        assert!(!reg.is_frozen(0xD000));
    }

    #[test]
    fn predicate_gates_the_overlay() {
        let scope: SnapshotScope = Arc::new(RwLock::new(HashMap::new()));
        let reg = FreezeRegistry::new(scope.clone());
        reg.freeze(
            0xC000,
            vec![0xFF],
            FreezeOptions {
                predicate: Some("hp < 100".into()),
                ..Default::default()
            },
        )
        .unwrap();

        scope
            .write()
            .unwrap()
            .insert("hp".into(), Value::Int(150));
        let mut block = vec![0u8; 4];
        let stats = reg.overlay_block(0xC000, &mut block);
        assert_eq!(stats.skipped_predicate, 1);
        assert_eq!(block[0], 0);

        scope.write().unwrap().insert("hp".into(), Value::Int(50));
        let stats = reg.overlay_block(0xC000, &mut block);
        assert_eq!(stats.applied, 1);
        assert_eq!(block[0], 0xFF);
    }

    #[test]
    fn bad_predicate_fails_the_freeze_call() {
        let reg = registry();
        let err = reg
            .freeze(
                0xC000,
                vec![0],
                FreezeOptions {
                    predicate: Some("hp <".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, FreezeError::Predicate(_)));
    }

    #[test]
    fn write_back_targets_stamp_bookkeeping() {
        let reg = registry();
        reg.freeze(0xC000, vec![5], FreezeOptions::default())
            .unwrap();
        let targets = reg.write_back_targets(1234);
        assert_eq!(targets, vec![(0xC000, vec![5])]);
        assert_eq!(reg.list()[0].last_write_back_ms, Some(1234));
    }
}
