/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the database directory and initial manifest if absent
    /// (default: true).
    pub create_if_missing: bool,

    /// Fail open if the database already exists (default: false).
    pub error_if_exists: bool,

    /// Treat any corruption seen during WAL replay as fatal instead of
    /// dropping the bad bytes and continuing (default: false).
    pub paranoid_checks: bool,

    /// Fsync the WAL after every write (default: false).
    pub sync: bool,

    /// Size threshold at which a replay scratch memtable is flushed to a
    /// level-0 table during recovery (default: 4MB).
    pub write_buffer_size: usize,

    /// Number of sequence numbers one writable memtable owns. The memtable
    /// rotates when its window is exhausted (default: 65536).
    pub memtable_seq_window: u64,

    /// Reuse the last WAL file across a clean reopen when replaying it
    /// triggered no flush (default: false).
    pub reuse_logs: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,
            sync: false,
            write_buffer_size: 4 * 1024 * 1024,
            memtable_seq_window: 65536,
            reuse_logs: false,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_if_missing(mut self, v: bool) -> Self {
        self.create_if_missing = v;
        self
    }

    pub fn error_if_exists(mut self, v: bool) -> Self {
        self.error_if_exists = v;
        self
    }

    pub fn paranoid_checks(mut self, v: bool) -> Self {
        self.paranoid_checks = v;
        self
    }

    pub fn sync(mut self, v: bool) -> Self {
        self.sync = v;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn memtable_seq_window(mut self, window: u64) -> Self {
        self.memtable_seq_window = window;
        self
    }

    pub fn reuse_logs(mut self, v: bool) -> Self {
        self.reuse_logs = v;
        self
    }
}
