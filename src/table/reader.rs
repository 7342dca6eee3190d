use crate::coding::{decode_fixed32, decode_fixed64, get_varint32};
use crate::corruption;
use crate::env::SequentialFile;
use crate::error::Result;
use crate::format::{InternalKey, LookupKey, ValueType};
use crate::memtable::LookupResult;
use crate::wal::CRC32;

use super::{FOOTER_SIZE, TABLE_MAGIC};

/// An open, fully decoded sorted table. Entries are held in ascending
/// internal-key order, so lookups binary-search and scans walk the vector.
pub struct Table {
    entries: Vec<(InternalKey, Vec<u8>)>,
}

impl Table {
    /// Reads and validates an entire table file.
    pub fn open(mut file: Box<dyn SequentialFile>, file_size: u64) -> Result<Table> {
        if (file_size as usize) < FOOTER_SIZE {
            return Err(corruption!("table file too small for footer"));
        }

        let mut image = vec![0u8; file_size as usize];
        let mut filled = 0;
        while filled < image.len() {
            let n = file.read(&mut image[filled..])?;
            if n == 0 {
                return Err(corruption!("table file shorter than recorded size"));
            }
            filled += n;
        }

        let footer_start = image.len() - FOOTER_SIZE;
        let entry_count = decode_fixed64(&image[footer_start..footer_start + 8]);
        let expected_crc = decode_fixed32(&image[footer_start + 8..footer_start + 12]);
        let magic = decode_fixed64(&image[footer_start + 12..]);
        if magic != TABLE_MAGIC {
            return Err(corruption!("bad table magic"));
        }
        let records = &image[..footer_start];
        if CRC32.checksum(records) != expected_crc {
            return Err(corruption!("table checksum mismatch"));
        }

        let mut entries = Vec::with_capacity(entry_count as usize);
        let mut rest = records;
        for _ in 0..entry_count {
            let klen = get_varint32(&mut rest)? as usize;
            if rest.len() < klen {
                return Err(corruption!("table record key truncated"));
            }
            let (key_bytes, after_key) = rest.split_at(klen);
            rest = after_key;
            let key = InternalKey::decode(key_bytes)?;

            let vlen = get_varint32(&mut rest)? as usize;
            if rest.len() < vlen {
                return Err(corruption!("table record value truncated"));
            }
            let (value, after_value) = rest.split_at(vlen);
            rest = after_value;

            entries.push((key, value.to_vec()));
        }
        if !rest.is_empty() {
            return Err(corruption!("table has bytes past the last record"));
        }

        Ok(Table { entries })
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Point lookup at the snapshot encoded in `lookup`.
    pub fn get(&self, lookup: &LookupKey) -> LookupResult {
        let target = lookup.internal_key();
        let idx = self
            .entries
            .partition_point(|(key, _)| key < target);
        if let Some((key, value)) = self.entries.get(idx) {
            if key.user_key() == lookup.user_key() {
                return match key.value_type() {
                    ValueType::Value => LookupResult::Found(value.clone()),
                    ValueType::Deletion => LookupResult::Deleted,
                };
            }
        }
        LookupResult::Missing
    }

    pub fn iter(&self) -> impl Iterator<Item = (InternalKey, Vec<u8>)> + '_ {
        self.entries.iter().map(|(k, v)| (k.clone(), v.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Env, FsEnv};
    use crate::table::builder::TableBuilder;
    use crate::tmpfs::TempDir;

    fn write_and_open(entries: &[(&[u8], u64, ValueType, &[u8])]) -> (TempDir, Table) {
        let dir = TempDir::new().unwrap();
        let env = FsEnv::new();
        let path = dir.path().join("000001.sst");

        let mut builder = TableBuilder::new();
        for &(user_key, seq, vtype, value) in entries {
            builder.add(&InternalKey::new(user_key, seq, vtype), value);
        }
        let image = builder.finish();
        let mut file = env.new_writable_file(&path).unwrap();
        file.append(&image).unwrap();
        file.sync().unwrap();
        drop(file);

        let size = env.get_file_size(&path).unwrap();
        let table = Table::open(env.new_sequential_file(&path).unwrap(), size).unwrap();
        (dir, table)
    }

    #[test]
    fn build_then_lookup() {
        let (_dir, table) = write_and_open(&[
            (b"a", 3, ValueType::Value, b"a3"),
            (b"b", 5, ValueType::Value, b"b5"),
            (b"b", 2, ValueType::Value, b"b2"),
            (b"c", 4, ValueType::Deletion, b""),
        ]);

        assert_eq!(table.num_entries(), 4);
        assert_eq!(
            table.get(&LookupKey::new(b"a", 10)),
            LookupResult::Found(b"a3".to_vec())
        );
        assert_eq!(
            table.get(&LookupKey::new(b"b", 10)),
            LookupResult::Found(b"b5".to_vec())
        );
        assert_eq!(
            table.get(&LookupKey::new(b"b", 2)),
            LookupResult::Found(b"b2".to_vec())
        );
        assert_eq!(table.get(&LookupKey::new(b"c", 10)), LookupResult::Deleted);
        assert_eq!(table.get(&LookupKey::new(b"d", 10)), LookupResult::Missing);
        // Below every stored sequence for the key.
        assert_eq!(table.get(&LookupKey::new(b"b", 1)), LookupResult::Missing);
    }

    #[test]
    fn corrupt_record_region_is_detected() {
        let dir = TempDir::new().unwrap();
        let env = FsEnv::new();
        let path = dir.path().join("000002.sst");

        let mut builder = TableBuilder::new();
        builder.add(&InternalKey::new(b"k", 1, ValueType::Value), b"v");
        let mut image = builder.finish();
        image[2] ^= 0xff;

        let mut file = env.new_writable_file(&path).unwrap();
        file.append(&image).unwrap();
        file.sync().unwrap();
        drop(file);

        let size = env.get_file_size(&path).unwrap();
        let result = Table::open(env.new_sequential_file(&path).unwrap(), size);
        assert!(matches!(result, Err(crate::error::Error::Corruption(_))));
    }

    #[test]
    fn bad_magic_is_detected() {
        let dir = TempDir::new().unwrap();
        let env = FsEnv::new();
        let path = dir.path().join("000003.sst");

        let mut builder = TableBuilder::new();
        builder.add(&InternalKey::new(b"k", 1, ValueType::Value), b"v");
        let mut image = builder.finish();
        let len = image.len();
        image[len - 1] ^= 0x01;

        let mut file = env.new_writable_file(&path).unwrap();
        file.append(&image).unwrap();
        file.sync().unwrap();
        drop(file);

        let size = env.get_file_size(&path).unwrap();
        let result = Table::open(env.new_sequential_file(&path).unwrap(), size);
        assert!(matches!(result, Err(crate::error::Error::Corruption(_))));
    }

    #[test]
    fn iteration_preserves_order() {
        let (_dir, table) = write_and_open(&[
            (b"a", 1, ValueType::Value, b"1"),
            (b"b", 2, ValueType::Value, b"2"),
        ]);
        let keys: Vec<_> = table.iter().map(|(k, _)| k.user_key().to_vec()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
