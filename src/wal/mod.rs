//! Framed, checksummed record log shared by the write-ahead log and the
//! manifest.
//!
//! The file is a sequence of 32 KiB blocks. Each physical record carries a
//! 7-byte header:
//!
//! ```text
//! +-------------+--------------+-----------+---------+
//! | crc32c : u32| length : u16 | type : u8 | payload |
//! +-------------+--------------+-----------+---------+
//! ```
//!
//! The checksum covers the type byte and the payload. A logical record that
//! does not fit in the current block is split into First/Middle/Last
//! fragments; a block tail shorter than the header is zero-padded and the
//! writer moves to the next block.

pub mod reader;
pub mod writer;

use crc::{Crc, CRC_32_ISCSI};

pub use reader::{Reader, Reporter};
pub use writer::Writer;

pub const BLOCK_SIZE: usize = 32 * 1024;
pub const HEADER_SIZE: usize = 4 + 2 + 1;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Zero-filled region produced by block padding or preallocation;
    /// skipped silently.
    Zero = 0,
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

pub const MAX_RECORD_TYPE: u8 = RecordType::Last as u8;

pub(crate) fn record_crc(record_type: RecordType, payload: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&[record_type as u8]);
    digest.update(payload);
    digest.finalize()
}
