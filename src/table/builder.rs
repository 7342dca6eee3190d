use std::path::Path;

use crate::coding::{put_fixed32, put_fixed64, put_varint32};
use crate::env::Env;
use crate::error::Result;
use crate::filename::table_file_name;
use crate::format::InternalKey;
use crate::table::cache::TableCache;
use crate::version::version::FileMetaData;
use crate::wal::CRC32;

use super::TABLE_MAGIC;

/// Accumulates ordered records and writes them with a checksummed footer.
pub struct TableBuilder {
    buf: Vec<u8>,
    num_entries: u64,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            num_entries: 0,
        }
    }

    /// Keys must arrive in ascending internal order.
    pub fn add(&mut self, key: &InternalKey, value: &[u8]) {
        put_varint32(&mut self.buf, key.encoded().len() as u32);
        self.buf.extend_from_slice(key.encoded());
        put_varint32(&mut self.buf, value.len() as u32);
        self.buf.extend_from_slice(value);
        self.num_entries += 1;
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Appends the footer and returns the finished file image.
    pub fn finish(mut self) -> Vec<u8> {
        let crc = CRC32.checksum(&self.buf);
        put_fixed64(&mut self.buf, self.num_entries);
        put_fixed32(&mut self.buf, crc);
        put_fixed64(&mut self.buf, TABLE_MAGIC);
        self.buf
    }
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains `iter` into a new table file and fills `meta` with the file size
/// and key range. An empty iterator produces no file and leaves
/// `meta.file_size` at zero. The finished table is opened back through the
/// cache to verify it is readable.
pub fn build_table<I>(
    dbname: &Path,
    env: &dyn Env,
    cache: &TableCache,
    iter: I,
    meta: &mut FileMetaData,
) -> Result<()>
where
    I: Iterator<Item = (InternalKey, Vec<u8>)>,
{
    meta.file_size = 0;
    let path = table_file_name(dbname, meta.number);

    let mut builder = TableBuilder::new();
    let mut smallest: Option<InternalKey> = None;
    let mut largest: Option<InternalKey> = None;

    for (key, value) in iter {
        if smallest.is_none() {
            smallest = Some(key.clone());
        }
        largest = Some(key.clone());
        builder.add(&key, &value);
    }

    if builder.num_entries() == 0 {
        return Ok(());
    }

    let image = builder.finish();
    let result = (|| -> Result<()> {
        let mut file = env.new_writable_file(&path)?;
        file.append(&image)?;
        file.sync()?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            meta.file_size = image.len() as u64;
            meta.smallest = smallest.expect("non-empty table has a smallest key");
            meta.largest = largest.expect("non-empty table has a largest key");
            // Verify the table is usable before it is committed anywhere.
            cache.find_table(meta.number, meta.file_size).map(|_| ())
        }
        Err(e) => {
            let _ = env.remove_file(&path);
            Err(e)
        }
    }
}
