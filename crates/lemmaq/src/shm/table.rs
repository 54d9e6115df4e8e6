//! Fixed-geometry slot table in a named shared memory segment.
//!
//! Layout (native endian, every field 8 bytes):
//!
//! ```text
//! header  [magic][version][slot_count][text_capacity][occupied][next_id][pad][pad]
//! slot i  [id][stamp][len][text: text_capacity bytes, padded to 8]
//! ```
//!
//! `id == 0` marks a free slot. The geometry fields are written once by the
//! creator; `occupied`, `next_id` and all slots are only touched through a
//! [`TableView`], which callers obtain while holding the table's semaphore.

use std::fs::File;

use memmap2::{MmapOptions, MmapRaw};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;

use super::ShmError;

const MAGIC: u64 = 0x4c45_4d4d_4151_5442; // "LEMMAQTB"
/// Bumped whenever the header or slot layout changes.
pub const LAYOUT_VERSION: u64 = 1;

const HEADER_LEN: usize = 64;
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_SLOT_COUNT: usize = 16;
const OFF_TEXT_CAPACITY: usize = 24;
const OFF_OCCUPIED: usize = 32;
const OFF_NEXT_ID: usize = 40;

const SLOT_HEADER_LEN: usize = 24;
const SLOT_OFF_ID: usize = 0;
const SLOT_OFF_STAMP: usize = 8;
const SLOT_OFF_LEN: usize = 16;

fn slot_len(text_capacity: usize) -> usize {
    (SLOT_HEADER_LEN + text_capacity).next_multiple_of(8)
}

fn table_len(slot_count: usize, text_capacity: usize) -> usize {
    HEADER_LEN + slot_count * slot_len(text_capacity)
}

/// A mapped slot table. Dropping unmaps; only [`SlotTable::destroy`] unlinks.
pub struct SlotTable {
    name: String,
    map: MmapRaw,
    slot_count: usize,
    text_capacity: usize,
}

impl std::fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotTable")
            .field("name", &self.name)
            .field("slot_count", &self.slot_count)
            .field("text_capacity", &self.text_capacity)
            .finish()
    }
}

impl SlotTable {
    /// Create, size, zero-fill and map a new segment, replacing any stale one.
    pub fn create(name: &str, slot_count: usize, text_capacity: usize) -> Result<Self, ShmError> {
        if slot_count == 0 || text_capacity == 0 {
            return Err(ShmError::Layout {
                name: name.to_string(),
                reason: format!("empty geometry ({slot_count} slots x {text_capacity} bytes)"),
            });
        }

        if shm_unlink(name).is_ok() {
            tracing::warn!(name, "Removed stale shared memory segment");
        }

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| ShmError::shared_memory(name, "shm_open(O_CREAT)", e.into()))?;
        let file = File::from(fd);

        let len = table_len(slot_count, text_capacity);
        let map = file
            .set_len(len as u64)
            .map_err(|e| ShmError::shared_memory(name, "ftruncate", e))
            .and_then(|()| {
                MmapOptions::new()
                    .len(len)
                    .map_raw(&file)
                    .map_err(|e| ShmError::shared_memory(name, "mmap", e))
            });
        let map = match map {
            Ok(map) => map,
            Err(e) => {
                // The segment was created above; never leave it linked half-built.
                let _ = shm_unlink(name);
                return Err(e);
            }
        };

        let table = Self {
            name: name.to_string(),
            map,
            slot_count,
            text_capacity,
        };

        // SAFETY: the segment was created exclusively above and no other
        // process can reach it through the semaphore yet.
        let mut view = unsafe { table.view() };
        view.bytes.fill(0);
        view.put(OFF_VERSION, LAYOUT_VERSION);
        view.put(OFF_SLOT_COUNT, slot_count as u64);
        view.put(OFF_TEXT_CAPACITY, text_capacity as u64);
        view.put(OFF_MAGIC, MAGIC);

        tracing::debug!(name, slot_count, text_capacity, len, "Created slot table");
        Ok(table)
    }

    /// Map an existing segment, reading its geometry from the header.
    pub fn attach(name: &str) -> Result<Self, ShmError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| ShmError::shared_memory(name, "shm_open", e.into()))?;
        let file = File::from(fd);

        let file_len = file
            .metadata()
            .map_err(|e| ShmError::shared_memory(name, "fstat", e))?
            .len() as usize;
        if file_len < HEADER_LEN {
            return Err(ShmError::Layout {
                name: name.to_string(),
                reason: format!("segment is {file_len} bytes, shorter than the header"),
            });
        }

        let map = MmapOptions::new()
            .len(file_len)
            .map_raw(&file)
            .map_err(|e| ShmError::shared_memory(name, "mmap", e))?;

        let header = |offset: usize| -> u64 {
            // SAFETY: offset + 8 <= HEADER_LEN <= map.len(); geometry fields are
            // immutable once the magic is written.
            let mut raw = [0u8; 8];
            unsafe {
                std::ptr::copy_nonoverlapping(map.as_ptr().add(offset), raw.as_mut_ptr(), 8);
            }
            u64::from_ne_bytes(raw)
        };

        let layout_error = |reason: String| ShmError::Layout {
            name: name.to_string(),
            reason,
        };

        if header(OFF_MAGIC) != MAGIC {
            return Err(layout_error("missing magic (not initialized)".to_string()));
        }
        let version = header(OFF_VERSION);
        if version != LAYOUT_VERSION {
            return Err(layout_error(format!(
                "layout version {version}, expected {LAYOUT_VERSION}"
            )));
        }
        let slot_count = header(OFF_SLOT_COUNT) as usize;
        let text_capacity = header(OFF_TEXT_CAPACITY) as usize;
        let expected = table_len(slot_count, text_capacity);
        if slot_count == 0 || file_len < expected {
            return Err(layout_error(format!(
                "{slot_count} slots x {text_capacity} bytes need {expected} bytes, segment has {file_len}"
            )));
        }

        tracing::trace!(name, slot_count, text_capacity, "Attached slot table");
        Ok(Self {
            name: name.to_string(),
            map,
            slot_count,
            text_capacity,
        })
    }

    /// Unlink the segment name. Existing mappings stay valid until unmapped.
    /// A missing name is not an error.
    pub fn destroy(name: &str) -> Result<(), ShmError> {
        match shm_unlink(name) {
            Ok(()) | Err(nix::errno::Errno::ENOENT) => Ok(()),
            Err(e) => Err(ShmError::shared_memory(name, "shm_unlink", e.into())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn text_capacity(&self) -> usize {
        self.text_capacity
    }

    /// Mutable view over the whole segment.
    ///
    /// # Safety
    ///
    /// The caller must guarantee exclusive access for the lifetime of the view,
    /// normally by holding the table's semaphore. Two live views over the same
    /// segment, in this or any other process, are a data race.
    pub unsafe fn view(&self) -> TableView<'_> {
        let len = table_len(self.slot_count, self.text_capacity);
        // SAFETY: the mapping is at least `len` bytes (checked at create/attach)
        // and exclusivity is the caller's contract.
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.map.as_mut_ptr(), len) };
        TableView {
            bytes,
            slot_count: self.slot_count,
            text_capacity: self.text_capacity,
        }
    }
}

/// Exclusive access to a table's header and slots.
pub struct TableView<'a> {
    bytes: &'a mut [u8],
    slot_count: usize,
    text_capacity: usize,
}

impl TableView<'_> {
    fn get(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[offset..offset + 8]);
        u64::from_ne_bytes(raw)
    }

    fn put(&mut self, offset: usize, value: u64) {
        self.bytes[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }

    fn slot_offset(&self, index: usize) -> usize {
        assert!(index < self.slot_count, "slot index {index} out of range");
        HEADER_LEN + index * slot_len(self.text_capacity)
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn text_capacity(&self) -> usize {
        self.text_capacity
    }

    /// Number of slots with a nonzero id.
    pub fn occupied(&self) -> usize {
        self.get(OFF_OCCUPIED) as usize
    }

    pub fn is_full(&self) -> bool {
        self.occupied() >= self.slot_count
    }

    /// Advance the shared id counter. Never returns 0.
    pub fn next_id(&mut self) -> u64 {
        let mut id = self.get(OFF_NEXT_ID).wrapping_add(1);
        if id == 0 {
            id = 1;
        }
        self.put(OFF_NEXT_ID, id);
        id
    }

    pub fn id(&self, index: usize) -> u64 {
        self.get(self.slot_offset(index) + SLOT_OFF_ID)
    }

    pub fn stamp(&self, index: usize) -> u64 {
        self.get(self.slot_offset(index) + SLOT_OFF_STAMP)
    }

    /// First slot whose id satisfies `pred`.
    pub fn position(&self, pred: impl Fn(u64) -> bool) -> Option<usize> {
        (0..self.slot_count).find(|&i| pred(self.id(i)))
    }

    pub fn text(&self, index: usize) -> &[u8] {
        let offset = self.slot_offset(index);
        let len = (self.get(offset + SLOT_OFF_LEN) as usize).min(self.text_capacity);
        let start = offset + SLOT_HEADER_LEN;
        &self.bytes[start..start + len]
    }

    /// Occupy `index` with `id` and `text`. Text beyond the capacity is
    /// dropped; callers truncate on their own terms first.
    pub fn store(&mut self, index: usize, id: u64, text: &[u8], stamp: u64) {
        debug_assert_ne!(id, 0, "id 0 marks a free slot");
        let offset = self.slot_offset(index);
        let was_free = self.get(offset + SLOT_OFF_ID) == 0;

        let len = text.len().min(self.text_capacity);
        let start = offset + SLOT_HEADER_LEN;
        self.bytes[start..start + len].copy_from_slice(&text[..len]);
        self.bytes[start + len..start + self.text_capacity].fill(0);
        self.put(offset + SLOT_OFF_LEN, len as u64);
        self.put(offset + SLOT_OFF_STAMP, stamp);
        self.put(offset + SLOT_OFF_ID, id);

        if was_free {
            let occupied = self.get(OFF_OCCUPIED) + 1;
            self.put(OFF_OCCUPIED, occupied);
        }
    }

    /// Free `index` and zero its contents.
    pub fn clear(&mut self, index: usize) {
        let offset = self.slot_offset(index);
        let was_occupied = self.get(offset + SLOT_OFF_ID) != 0;
        let end = offset + SLOT_HEADER_LEN + self.text_capacity;
        self.bytes[offset..end].fill(0);

        if was_occupied {
            let occupied = self.get(OFF_OCCUPIED).saturating_sub(1);
            self.put(OFF_OCCUPIED, occupied);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        format!("/lemmaq-shm-test-{}", uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn create_zero_fills_and_attach_reads_geometry() {
        let name = unique_name();
        let created = SlotTable::create(&name, 4, 32).unwrap();
        let attached = SlotTable::attach(&name).unwrap();

        assert_eq!(attached.slot_count(), 4);
        assert_eq!(attached.text_capacity(), 32);

        let view = unsafe { attached.view() };
        assert_eq!(view.occupied(), 0);
        assert_eq!(view.position(|id| id != 0), None);
        drop(view);

        drop(created);
        SlotTable::destroy(&name).unwrap();
    }

    #[test]
    fn writes_are_visible_through_other_mappings() {
        let name = unique_name();
        let a = SlotTable::create(&name, 2, 16).unwrap();
        let b = SlotTable::attach(&name).unwrap();

        {
            let mut view = unsafe { a.view() };
            let id = view.next_id();
            view.store(1, id, b"hello", 7);
        }
        {
            let view = unsafe { b.view() };
            assert_eq!(view.id(1), 1);
            assert_eq!(view.text(1), b"hello");
            assert_eq!(view.stamp(1), 7);
            assert_eq!(view.occupied(), 1);
            assert_eq!(view.position(|id| id != 0), Some(1));
        }

        SlotTable::destroy(&name).unwrap();
    }

    #[test]
    fn store_truncates_and_clear_frees() {
        let name = unique_name();
        let table = SlotTable::create(&name, 1, 4).unwrap();
        let mut view = unsafe { table.view() };

        view.store(0, 9, b"abcdefgh", 0);
        assert_eq!(view.text(0), b"abcd");
        assert!(view.is_full());

        view.store(0, 10, b"xy", 0);
        assert_eq!(view.text(0), b"xy");
        assert_eq!(view.occupied(), 1);

        view.clear(0);
        assert_eq!(view.id(0), 0);
        assert_eq!(view.text(0), b"");
        assert_eq!(view.occupied(), 0);

        view.clear(0);
        assert_eq!(view.occupied(), 0);

        drop(view);
        SlotTable::destroy(&name).unwrap();
    }

    #[test]
    fn id_counter_skips_zero_on_wrap() {
        let name = unique_name();
        let table = SlotTable::create(&name, 1, 8).unwrap();
        let mut view = unsafe { table.view() };

        view.put(OFF_NEXT_ID, u64::MAX - 1);
        assert_eq!(view.next_id(), u64::MAX);
        assert_eq!(view.next_id(), 1);
        assert_eq!(view.next_id(), 2);

        drop(view);
        SlotTable::destroy(&name).unwrap();
    }

    #[test]
    fn attach_missing_segment_fails() {
        let err = SlotTable::attach(&unique_name()).unwrap_err();
        assert!(
            matches!(err, ShmError::SharedMemory { .. }),
            "unexpected error: {err}"
        );
        assert!(err.is_transient());
    }

    #[test]
    fn attach_rejects_foreign_segment() {
        let name = unique_name();
        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .unwrap();
        File::from(fd).set_len(4096).unwrap();

        let err = SlotTable::attach(&name).unwrap_err();
        assert!(matches!(err, ShmError::Layout { .. }), "unexpected error: {err}");

        SlotTable::destroy(&name).unwrap();
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn failed_sizing_unlinks_the_segment() {
        let name = unique_name();
        // 2^58 slots of 32 bytes exceed the largest file size ftruncate accepts.
        let err = SlotTable::create(&name, 1 << 58, 8).unwrap_err();
        assert!(
            matches!(err, ShmError::SharedMemory { op: "ftruncate", .. }),
            "unexpected error: {err}"
        );

        let err = SlotTable::attach(&name).unwrap_err();
        assert!(err.is_transient(), "segment still linked: {err}");
    }

    #[test]
    fn destroy_missing_segment_is_ok() {
        SlotTable::destroy(&unique_name()).unwrap();
    }
}
