//! Process-wide cache of recently fetched RAM blocks.
//!
//! Updates come from the monitor's region fetch; freezes are overlaid before
//! a block becomes visible, so readers never observe unfrozen bytes at a
//! frozen address.
use crate::freeze::FreezeRegistry;
use crate::mapping::{CharMap, Endianness};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no cached block covers {len} byte(s) at {addr:#06x}")]
    OutOfRange { addr: u32, len: usize },
}

/// One block-level difference observed during an update.
#[derive(Debug, Clone)]
pub struct BlockChange {
    pub start: u32,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

pub type ChangeListener = Arc<dyn Fn(BlockChange) + Send + Sync>;

pub struct MemoryStore {
    blocks: RwLock<HashMap<u32, Vec<u8>>>,
    listeners: Mutex<Vec<ChangeListener>>,
    freeze: Arc<FreezeRegistry>,
}

impl MemoryStore {
    pub fn new(freeze: Arc<FreezeRegistry>) -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            freeze,
        }
    }

    /// Registers a block-change listener. Listeners run on spawned tasks and
    /// must not assume any ordering across blocks.
    pub fn add_listener(&self, listener: ChangeListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Replaces the named blocks atomically.
    ///
    /// Freeze entries are overlaid under the write lock, so no reader ever
    /// sees the uncorrected bytes. Listener dispatch happens after every
    /// lock is released.
    pub fn update(&self, incoming: HashMap<u32, Vec<u8>>) {
        let mut changes = Vec::new();
        {
            let mut blocks = self.blocks.write().unwrap();
            for (start, mut bytes) in incoming {
                self.freeze.overlay_block(start, &mut bytes);
                let old = blocks.insert(start, bytes.clone());
                if old.as_deref() != Some(bytes.as_slice()) {
                    changes.push(BlockChange {
                        start,
                        old: old.unwrap_or_default(),
                        new: bytes,
                    });
                }
            }
        }
        if changes.is_empty() {
            return;
        }
        let listeners = self.listeners.lock().unwrap().clone();
        for change in changes {
            for listener in &listeners {
                let listener = listener.clone();
                let change = change.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        // A panicking listener only kills its own task.
                        handle.spawn(async move { listener(change) });
                    }
                    Err(_) => listener(change),
                }
            }
        }
    }

    /// Copies `len` bytes at `addr` out of the containing block.
    ///
    /// Reads that straddle a block boundary or hit no block fail; there is
    /// no implicit zero-fill.
    pub fn read_bytes(&self, addr: u32, len: usize) -> Result<Vec<u8>, StoreError> {
        let blocks = self.blocks.read().unwrap();
        for (start, bytes) in blocks.iter() {
            if addr >= *start {
                let offset = (addr - start) as usize;
                if offset + len <= bytes.len() {
                    return Ok(bytes[offset..offset + len].to_vec());
                }
            }
        }
        Err(StoreError::OutOfRange { addr, len })
    }

    /// Writes through the cache so reads observe the bytes before the next
    /// fetch. The caller still pushes the same bytes to the transport.
    pub fn patch(&self, addr: u32, data: &[u8]) -> Result<(), StoreError> {
        let mut blocks = self.blocks.write().unwrap();
        for (start, bytes) in blocks.iter_mut() {
            if addr >= *start {
                let offset = (addr - start) as usize;
                if offset + data.len() <= bytes.len() {
                    bytes[offset..offset + data.len()].copy_from_slice(data);
                    return Ok(());
                }
            }
        }
        Err(StoreError::OutOfRange {
            addr,
            len: data.len(),
        })
    }

    /// Drops every cached block; reload path only.
    pub fn clear(&self) {
        self.blocks.write().unwrap().clear();
    }

    pub fn read_u8(&self, addr: u32) -> Result<u8, StoreError> {
        Ok(self.read_bytes(addr, 1)?[0])
    }

    pub fn read_u16(&self, addr: u32, endian: Endianness) -> Result<u16, StoreError> {
        let b = self.read_bytes(addr, 2)?;
        Ok(match endian {
            Endianness::Little => u16::from_le_bytes([b[0], b[1]]),
            Endianness::Big => u16::from_be_bytes([b[0], b[1]]),
        })
    }

    pub fn read_u32(&self, addr: u32, endian: Endianness) -> Result<u32, StoreError> {
        let b = self.read_bytes(addr, 4)?;
        Ok(match endian {
            Endianness::Little => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            Endianness::Big => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        })
    }

    pub fn read_i8(&self, addr: u32) -> Result<i8, StoreError> {
        Ok(self.read_u8(addr)? as i8)
    }

    pub fn read_i16(&self, addr: u32, endian: Endianness) -> Result<i16, StoreError> {
        Ok(self.read_u16(addr, endian)? as i16)
    }

    pub fn read_i32(&self, addr: u32, endian: Endianness) -> Result<i32, StoreError> {
        Ok(self.read_u32(addr, endian)? as i32)
    }

    pub fn read_f32(&self, addr: u32, endian: Endianness) -> Result<f32, StoreError> {
        Ok(f32::from_bits(self.read_u32(addr, endian)?))
    }

    pub fn read_f64(&self, addr: u32, endian: Endianness) -> Result<f64, StoreError> {
        let b = self.read_bytes(addr, 8)?;
        let arr = [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]];
        Ok(match endian {
            Endianness::Little => f64::from_le_bytes(arr),
            Endianness::Big => f64::from_be_bytes(arr),
        })
    }

    pub fn read_bool(&self, addr: u32) -> Result<bool, StoreError> {
        Ok(self.read_u8(addr)? != 0)
    }

    /// Packed binary-coded decimal, most significant byte first.
    pub fn read_bcd(&self, addr: u32, len: usize) -> Result<u64, StoreError> {
        let bytes = self.read_bytes(addr, len)?;
        let mut value = 0u64;
        for b in bytes {
            let hi = ((b >> 4) & 0xF).min(9) as u64;
            let lo = (b & 0xF).min(9) as u64;
            value = value * 100 + hi * 10 + lo;
        }
        Ok(value)
    }

    /// Character-mapped or ASCII string of at most `len` bytes.
    pub fn read_string(
        &self,
        addr: u32,
        len: usize,
        charmap: Option<&CharMap>,
    ) -> Result<String, StoreError> {
        let bytes = self.read_bytes(addr, len)?;
        Ok(match charmap {
            Some(map) => map.decode(&bytes),
            None => bytes
                .iter()
                .take_while(|&&b| b != 0)
                .map(|&b| b as char)
                .collect(),
        })
    }

    /// All bits of `len` bytes, least significant bit of each byte first.
    pub fn read_bitfield(&self, addr: u32, len: usize) -> Result<Vec<bool>, StoreError> {
        let bytes = self.read_bytes(addr, len)?;
        let mut bits = Vec::with_capacity(len * 8);
        for byte in bytes {
            for bit in 0..8 {
                bits.push((byte >> bit) & 1 == 1);
            }
        }
        Ok(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freeze::{FreezeOptions, FreezeRegistry};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(FreezeRegistry::new(Arc::new(RwLock::new(
            HashMap::new(),
        )))))
    }

    fn filled(start: u32, bytes: Vec<u8>) -> HashMap<u32, Vec<u8>> {
        HashMap::from([(start, bytes)])
    }

    #[test]
    fn reads_resolve_inside_the_containing_block() {
        let store = store();
        let mut block = vec![0u8; 0x800];
        block[0x30] = 0x05;
        store.update(filled(0x0000, block));
        assert_eq!(store.read_bytes(0x30, 1).unwrap(), vec![0x05]);
        assert_eq!(store.read_u8(0x30).unwrap(), 5);
    }

    #[test]
    fn straddling_reads_fail_without_zero_fill() {
        let store = store();
        store.update(filled(0x100, vec![1, 2, 3, 4]));
        assert_eq!(
            store.read_bytes(0x102, 4).unwrap_err(),
            StoreError::OutOfRange { addr: 0x102, len: 4 }
        );
        assert!(store.read_bytes(0x090, 2).is_err());
    }

    #[test]
    fn endianness_of_word_readers() {
        let store = store();
        store.update(filled(0xC000, vec![0x34, 0x12, 0x78, 0x56]));
        assert_eq!(store.read_u16(0xC000, Endianness::Little).unwrap(), 0x1234);
        assert_eq!(store.read_u16(0xC000, Endianness::Big).unwrap(), 0x3412);
        assert_eq!(
            store.read_u32(0xC000, Endianness::Little).unwrap(),
            0x5678_1234
        );
    }

    #[test]
    fn bcd_reader_matches_packed_digits() {
        let store = store();
        store.update(filled(0xD347, vec![0x12, 0x34, 0x56]));
        assert_eq!(store.read_bcd(0xD347, 3).unwrap(), 123456);
    }

    #[test]
    fn patch_is_visible_before_the_next_fetch() {
        let store = store();
        store.update(filled(0xC000, vec![0u8; 16]));
        store.patch(0xC004, &[0xAA, 0xBB]).unwrap();
        assert_eq!(store.read_bytes(0xC004, 2).unwrap(), vec![0xAA, 0xBB]);
        assert!(store.patch(0x8000, &[1]).is_err());
    }

    #[test]
    fn freeze_overlay_applies_before_readers_see_the_block() {
        let scope = Arc::new(RwLock::new(HashMap::new()));
        let freeze = Arc::new(FreezeRegistry::new(scope));
        let store = MemoryStore::new(freeze.clone());

        store.update(filled(0xC100, vec![0x96, 0x00, 0x01]));
        freeze
            .freeze(0xC100, vec![0x96, 0x00], FreezeOptions::default())
            .unwrap();

        // Emulator-side change arrives; the frozen slice must win.
        store.update(filled(0xC100, vec![0x4B, 0x00, 0x02]));
        assert_eq!(store.read_bytes(0xC100, 2).unwrap(), vec![0x96, 0x00]);
        assert_eq!(store.read_u8(0xC102).unwrap(), 0x02, "unfrozen tail moves");
    }

    #[test]
    fn listeners_see_old_and_new_bytes_for_changed_blocks() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let calls = calls.clone();
            let seen = seen.clone();
            store.add_listener(Arc::new(move |change: BlockChange| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push((change.old, change.new));
            }));
        }

        store.update(filled(0x00, vec![1, 2]));
        store.update(filled(0x00, vec![1, 2]));
        store.update(filled(0x00, vec![1, 3]));

        assert_eq!(calls.load(Ordering::SeqCst), 2, "identical update is quiet");
        let seen = seen.lock().unwrap();
        assert_eq!(seen[1], (vec![1, 2], vec![1, 3]));
    }

    #[test]
    fn string_reader_honors_charmap_terminators() {
        let store = store();
        store.update(filled(0xD158, vec![0x80, 0x91, 0x84, 0x50, 0x80]));
        let charmap = CharMap {
            map: HashMap::from([
                (0x80, "A".to_string()),
                (0x84, "E".to_string()),
                (0x91, "R".to_string()),
                (0x50, " ".to_string()),
            ]),
            terminators: vec![0x50, 0xFF],
        };
        assert_eq!(
            store.read_string(0xD158, 5, Some(&charmap)).unwrap(),
            "ARE"
        );
    }

    #[test]
    fn bitfield_reader_is_lsb_first() {
        let store = store();
        store.update(filled(0x10, vec![0b0000_0101]));
        let bits = store.read_bitfield(0x10, 1).unwrap();
        assert_eq!(
            bits,
            vec![true, false, true, false, false, false, false, false]
        );
    }
}
