use std::sync::Arc;

use crate::error::Result;
use crate::format::{InternalKey, LookupKey};
use crate::memtable::LookupResult;
use crate::table::TableCache;

pub const NUM_LEVELS: usize = 7;

/// Highest level a fresh memtable flush may be placed at when its key range
/// overlaps nothing below.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// A new table stops being pushed to a deeper level once it would overlap
/// this many bytes two levels down.
const MAX_GRANDPARENT_OVERLAP_BYTES: u64 = 20 * 1024 * 1024;

/// Descriptor of one sorted table on storage.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

impl FileMetaData {
    /// Placeholder metadata for a table under construction.
    pub fn placeholder(number: u64) -> Self {
        use crate::format::ValueType;
        Self {
            number,
            file_size: 0,
            smallest: InternalKey::new(b"", 0, ValueType::Value),
            largest: InternalKey::new(b"", 0, ValueType::Value),
        }
    }
}

/// A snapshot of the sorted-table set at every level. Immutable once built;
/// shared through `Arc`.
pub struct Version {
    files: Vec<Vec<Arc<FileMetaData>>>,
}

impl Version {
    pub fn empty() -> Self {
        Self {
            files: vec![Vec::new(); NUM_LEVELS],
        }
    }

    pub fn with_files(files: Vec<Vec<Arc<FileMetaData>>>) -> Self {
        debug_assert_eq!(files.len(), NUM_LEVELS);
        Self { files }
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    pub fn levels(&self) -> &[Vec<Arc<FileMetaData>>] {
        &self.files
    }

    fn file_may_contain(file: &FileMetaData, user_key: &[u8]) -> bool {
        user_key >= file.smallest.user_key() && user_key <= file.largest.user_key()
    }

    /// Point lookup across all levels. Level 0 is probed newest table
    /// first because its key ranges overlap; deeper levels hold at most one
    /// candidate table for any user key.
    pub fn get(&self, cache: &TableCache, lookup: &LookupKey) -> Result<LookupResult> {
        let user_key = lookup.user_key();

        let mut level0: Vec<&Arc<FileMetaData>> = self.files[0]
            .iter()
            .filter(|f| Self::file_may_contain(f, user_key))
            .collect();
        level0.sort_by(|a, b| b.number.cmp(&a.number));
        for file in level0 {
            match cache.get(file.number, file.file_size, lookup)? {
                LookupResult::Missing => continue,
                hit => return Ok(hit),
            }
        }

        for level in 1..NUM_LEVELS {
            for file in &self.files[level] {
                if Self::file_may_contain(file, user_key) {
                    match cache.get(file.number, file.file_size, lookup)? {
                        LookupResult::Missing => continue,
                        hit => return Ok(hit),
                    }
                }
            }
        }

        Ok(LookupResult::Missing)
    }

    /// Whether any file in `level` overlaps the user-key range.
    pub fn overlap_in_level(&self, level: usize, smallest_user: &[u8], largest_user: &[u8]) -> bool {
        self.files[level].iter().any(|f| {
            !(largest_user < f.smallest.user_key() || smallest_user > f.largest.user_key())
        })
    }

    fn overlapping_bytes(&self, level: usize, smallest_user: &[u8], largest_user: &[u8]) -> u64 {
        self.files[level]
            .iter()
            .filter(|f| {
                !(largest_user < f.smallest.user_key() || smallest_user > f.largest.user_key())
            })
            .map(|f| f.file_size)
            .sum()
    }

    /// Picks the deepest level, up to `MAX_MEM_COMPACT_LEVEL`, where a
    /// freshly flushed table with this key range overlaps nothing, and
    /// would not drag excessive overlap two levels down.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest_user: &[u8],
        largest_user: &[u8],
    ) -> u32 {
        let mut level = 0;
        if !self.overlap_in_level(0, smallest_user, largest_user) {
            while level < MAX_MEM_COMPACT_LEVEL {
                if self.overlap_in_level(level + 1, smallest_user, largest_user) {
                    break;
                }
                if level + 2 < NUM_LEVELS {
                    let bytes = self.overlapping_bytes(level + 2, smallest_user, largest_user);
                    if bytes > MAX_GRANDPARENT_OVERLAP_BYTES {
                        break;
                    }
                }
                level += 1;
            }
        }
        level as u32
    }
}
