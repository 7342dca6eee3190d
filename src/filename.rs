//! Database file naming.
//!
//! All files live directly under the database directory:
//! `CURRENT`, `LOCK`, `LOG`/`LOG.old`, `MANIFEST-<n>`, `<n>.log`,
//! `<n>.sst`, `<n>.tmp`.

use std::path::{Path, PathBuf};

use crate::env::Env;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    WalFile,
    DbLockFile,
    TableFile,
    DescriptorFile,
    CurrentFile,
    TempFile,
    InfoLogFile,
}

pub fn wal_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{number:06}.log"))
}

pub fn table_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{number:06}.sst"))
}

pub fn descriptor_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("MANIFEST-{number:06}"))
}

pub fn current_file_name(dbname: &Path) -> PathBuf {
    dbname.join("CURRENT")
}

pub fn lock_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOCK")
}

pub fn temp_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{number:06}.tmp"))
}

/// Classifies a directory entry; returns `None` for foreign files.
pub fn parse_file_name(name: &str) -> Option<(u64, FileType)> {
    match name {
        "CURRENT" => return Some((0, FileType::CurrentFile)),
        "LOCK" => return Some((0, FileType::DbLockFile)),
        "LOG" | "LOG.old" => return Some((0, FileType::InfoLogFile)),
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let number = rest.parse::<u64>().ok()?;
        return Some((number, FileType::DescriptorFile));
    }
    if let Some(stem) = name.strip_suffix(".log") {
        let number = stem.parse::<u64>().ok()?;
        return Some((number, FileType::WalFile));
    }
    if let Some(stem) = name.strip_suffix(".sst") {
        let number = stem.parse::<u64>().ok()?;
        return Some((number, FileType::TableFile));
    }
    if let Some(stem) = name.strip_suffix(".tmp") {
        let number = stem.parse::<u64>().ok()?;
        return Some((number, FileType::TempFile));
    }
    None
}

/// Points `CURRENT` at the given manifest, using a synced temp file plus
/// rename so the pointer flips atomically.
pub fn set_current_file(env: &dyn Env, dbname: &Path, descriptor_number: u64) -> Result<()> {
    let contents = format!("MANIFEST-{descriptor_number:06}\n");
    let tmp = temp_file_name(dbname, descriptor_number);

    let mut file = env.new_writable_file(&tmp)?;
    let result = file
        .append(contents.as_bytes())
        .and_then(|_| file.sync());
    drop(file);

    match result {
        Ok(()) => env.rename_file(&tmp, &current_file_name(dbname)),
        Err(e) => {
            let _ = env.remove_file(&tmp);
            Err(e)
        }
    }
}
