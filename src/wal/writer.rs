use byteorder::{ByteOrder, LittleEndian};

use super::{record_crc, RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::env::WritableFile;
use crate::error::Result;

/// Appends logical records to a block-framed log file.
pub struct Writer {
    file: Box<dyn WritableFile>,
    block_offset: usize,
}

impl Writer {
    pub fn new(file: Box<dyn WritableFile>) -> Self {
        Self {
            file,
            block_offset: 0,
        }
    }

    /// Resumes writing a log whose current length is `offset`, so fragment
    /// accounting continues from the correct position within its block.
    pub fn with_offset(file: Box<dyn WritableFile>, offset: u64) -> Self {
        Self {
            file,
            block_offset: (offset % BLOCK_SIZE as u64) as usize,
        }
    }

    /// Frames `record` into one or more physical records and appends them.
    /// The bytes are flushed to the OS but not fsynced; call `sync` for
    /// durability.
    pub fn add_record(&mut self, record: &[u8]) -> Result<()> {
        let mut left = record;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                if leftover > 0 {
                    const ZEROES: [u8; HEADER_SIZE] = [0; HEADER_SIZE];
                    self.file.append(&ZEROES[..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = left.len().min(avail);
            let end = fragment_len == left.len();

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(record_type, &left[..fragment_len])?;
            left = &left[fragment_len..];
            begin = false;
            if end {
                break;
            }
        }
        self.file.flush()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync()
    }

    fn emit_physical_record(&mut self, record_type: RecordType, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= u16::MAX as usize);
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        let mut header = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], record_crc(record_type, payload));
        LittleEndian::write_u16(&mut header[4..6], payload.len() as u16);
        header[6] = record_type as u8;

        self.file.append(&header)?;
        self.file.append(payload)?;
        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }
}
