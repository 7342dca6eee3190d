use byteorder::{ByteOrder, LittleEndian};

use super::{record_crc, RecordType, BLOCK_SIZE, HEADER_SIZE, MAX_RECORD_TYPE};
use crate::env::SequentialFile;
use crate::error::Result;

/// Receives notice of corrupt or skipped regions during a read pass. The
/// caller decides whether a report is fatal.
pub trait Reporter {
    fn corruption(&mut self, bytes: usize, reason: &str);
}

/// Outcome of reading one physical record.
enum Physical {
    Record(RecordType, Vec<u8>),
    /// Corrupt or padding bytes were skipped; keep scanning.
    Bad,
    Eof,
}

/// Reads logical records back out of a block-framed log file, reassembling
/// fragmented records and dropping corrupt regions.
pub struct Reader {
    file: Box<dyn SequentialFile>,
    checksum: bool,
    buffer: Vec<u8>,
    buffer_pos: usize,
    eof: bool,
}

impl Reader {
    pub fn new(file: Box<dyn SequentialFile>, checksum: bool) -> Self {
        Self {
            file,
            checksum,
            buffer: Vec::new(),
            buffer_pos: 0,
            eof: false,
        }
    }

    /// Returns the next logical record, or `None` at end of log. Corrupt
    /// regions are reported and skipped; only environment IO failures
    /// surface as `Err`.
    pub fn read_record(&mut self, reporter: &mut dyn Reporter) -> Result<Option<Vec<u8>>> {
        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;

        loop {
            match self.read_physical_record(reporter)? {
                Physical::Record(RecordType::Full, payload) => {
                    if in_fragmented_record {
                        reporter.corruption(scratch.len(), "partial record without end");
                    }
                    return Ok(Some(payload));
                }
                Physical::Record(RecordType::First, payload) => {
                    if in_fragmented_record {
                        reporter.corruption(scratch.len(), "partial record without end");
                    }
                    scratch = payload;
                    in_fragmented_record = true;
                }
                Physical::Record(RecordType::Middle, payload) => {
                    if !in_fragmented_record {
                        reporter.corruption(payload.len(), "missing start of fragmented record");
                    } else {
                        scratch.extend_from_slice(&payload);
                    }
                }
                Physical::Record(RecordType::Last, payload) => {
                    if !in_fragmented_record {
                        reporter.corruption(payload.len(), "missing start of fragmented record");
                    } else {
                        scratch.extend_from_slice(&payload);
                        return Ok(Some(scratch));
                    }
                }
                Physical::Record(RecordType::Zero, _) => unreachable!("zero type is filtered"),
                Physical::Bad => {
                    if in_fragmented_record {
                        reporter.corruption(scratch.len(), "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
                Physical::Eof => {
                    // A fragmented record cut off by EOF means the writer
                    // died mid-append; the tail is dropped without report.
                    return Ok(None);
                }
            }
        }
    }

    fn read_physical_record(&mut self, reporter: &mut dyn Reporter) -> Result<Physical> {
        loop {
            if self.buffer.len() - self.buffer_pos < HEADER_SIZE {
                if !self.eof {
                    // Skip the padded tail of the previous block and read
                    // the next one.
                    self.buffer.clear();
                    self.buffer_pos = 0;
                    self.buffer.resize(BLOCK_SIZE, 0);
                    let mut filled = 0;
                    while filled < BLOCK_SIZE {
                        let n = self.file.read(&mut self.buffer[filled..])?;
                        if n == 0 {
                            self.eof = true;
                            break;
                        }
                        filled += n;
                    }
                    self.buffer.truncate(filled);
                    if filled == 0 {
                        return Ok(Physical::Eof);
                    }
                    continue;
                }
                // A truncated header at EOF is a dead writer's tail.
                return Ok(Physical::Eof);
            }

            let header = &self.buffer[self.buffer_pos..self.buffer_pos + HEADER_SIZE];
            let expected_crc = LittleEndian::read_u32(&header[0..4]);
            let length = LittleEndian::read_u16(&header[4..6]) as usize;
            let type_byte = header[6];

            if type_byte == RecordType::Zero as u8 && length == 0 {
                // Padding; rest of the buffer holds no further records
                // only when the whole remainder is zero, so just skip the
                // empty physical record.
                self.buffer_pos += HEADER_SIZE;
                if self.buffer[self.buffer_pos..].iter().all(|&b| b == 0) {
                    self.buffer_pos = self.buffer.len();
                }
                continue;
            }

            if HEADER_SIZE + length > self.buffer.len() - self.buffer_pos {
                let dropped = self.buffer.len() - self.buffer_pos;
                self.buffer_pos = self.buffer.len();
                if !self.eof {
                    reporter.corruption(dropped, "bad record length");
                    return Ok(Physical::Bad);
                }
                // Truncated mid-write at EOF; drop silently.
                return Ok(Physical::Eof);
            }

            if type_byte > MAX_RECORD_TYPE {
                let dropped = self.buffer.len() - self.buffer_pos;
                self.buffer_pos = self.buffer.len();
                reporter.corruption(dropped, "unknown record type");
                return Ok(Physical::Bad);
            }
            let record_type = match type_byte {
                1 => RecordType::Full,
                2 => RecordType::First,
                3 => RecordType::Middle,
                4 => RecordType::Last,
                _ => {
                    let dropped = self.buffer.len() - self.buffer_pos;
                    self.buffer_pos = self.buffer.len();
                    reporter.corruption(dropped, "unexpected zero record type");
                    return Ok(Physical::Bad);
                }
            };

            let payload_start = self.buffer_pos + HEADER_SIZE;
            let payload = &self.buffer[payload_start..payload_start + length];

            if self.checksum && record_crc(record_type, payload) != expected_crc {
                // Drop the whole rest of the block: the length field itself
                // may be corrupt, so nothing after this point can be trusted.
                let dropped = self.buffer.len() - self.buffer_pos;
                self.buffer_pos = self.buffer.len();
                reporter.corruption(dropped, "checksum mismatch");
                return Ok(Physical::Bad);
            }

            let payload = payload.to_vec();
            self.buffer_pos = payload_start + length;
            return Ok(Physical::Record(record_type, payload));
        }
    }
}
