use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::env::Env;
use crate::error::Result;
use crate::filename::table_file_name;
use crate::format::LookupKey;
use crate::memtable::LookupResult;
use crate::table::reader::Table;

/// Keeps open tables keyed by file number. Deleted files must be evicted so
/// a later reincarnation of the number is never served stale data.
pub struct TableCache {
    env: Arc<dyn Env>,
    dbname: PathBuf,
    tables: Mutex<HashMap<u64, Arc<Table>>>,
}

impl TableCache {
    pub fn new(env: Arc<dyn Env>, dbname: PathBuf) -> Self {
        Self {
            env,
            dbname,
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the open table for `file_number`, opening and caching it on
    /// first use.
    pub fn find_table(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.tables.lock()?.get(&file_number) {
            return Ok(table.clone());
        }

        let path = table_file_name(&self.dbname, file_number);
        let file = self.env.new_sequential_file(&path)?;
        let table = Arc::new(Table::open(file, file_size)?);

        let mut tables = self.tables.lock()?;
        let entry = tables.entry(file_number).or_insert_with(|| table.clone());
        Ok(entry.clone())
    }

    /// Point lookup in one table.
    pub fn get(&self, file_number: u64, file_size: u64, lookup: &LookupKey) -> Result<LookupResult> {
        let table = self.find_table(file_number, file_size)?;
        Ok(table.get(lookup))
    }

    /// Materialized ordered contents of one table.
    pub fn new_iterator(
        &self,
        file_number: u64,
        file_size: u64,
    ) -> Result<Vec<(crate::format::InternalKey, Vec<u8>)>> {
        let table = self.find_table(file_number, file_size)?;
        Ok(table.iter().collect())
    }

    pub fn evict(&self, file_number: u64) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.remove(&file_number);
        }
    }
}
