use crate::coding::{
    get_length_prefixed, get_varint32, get_varint64, put_length_prefixed, put_varint32,
    put_varint64,
};
use crate::corruption;
use crate::error::Result;
use crate::format::InternalKey;
use crate::version::version::{FileMetaData, NUM_LEVELS};

// Field tags. The numbering is part of the on-disk format; unknown tags in
// a decoded edit are corruption, never skipped.
const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
const TAG_PREV_LOG_NUMBER: u32 = 9;

/// A delta between two versions; the unit appended to the manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub deleted_files: Vec<(u32, u64)>,
    pub new_files: Vec<(u32, FileMetaData)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator_name = Some(name.to_string());
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    pub fn set_prev_log_number(&mut self, number: u64) {
        self.prev_log_number = Some(number);
    }

    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    pub fn set_last_sequence(&mut self, seq: u64) {
        self.last_sequence = Some(seq);
    }

    pub fn add_file(
        &mut self,
        level: u32,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files.push((
            level,
            FileMetaData {
                number,
                file_size,
                smallest,
                largest,
            },
        ));
    }

    pub fn remove_file(&mut self, level: u32, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        if let Some(name) = &self.comparator_name {
            put_varint32(&mut buf, TAG_COMPARATOR);
            put_length_prefixed(&mut buf, name.as_bytes());
        }
        if let Some(number) = self.log_number {
            put_varint32(&mut buf, TAG_LOG_NUMBER);
            put_varint64(&mut buf, number);
        }
        if let Some(number) = self.prev_log_number {
            put_varint32(&mut buf, TAG_PREV_LOG_NUMBER);
            put_varint64(&mut buf, number);
        }
        if let Some(number) = self.next_file_number {
            put_varint32(&mut buf, TAG_NEXT_FILE_NUMBER);
            put_varint64(&mut buf, number);
        }
        if let Some(seq) = self.last_sequence {
            put_varint32(&mut buf, TAG_LAST_SEQUENCE);
            put_varint64(&mut buf, seq);
        }
        for (level, number) in &self.deleted_files {
            put_varint32(&mut buf, TAG_DELETED_FILE);
            put_varint32(&mut buf, *level);
            put_varint64(&mut buf, *number);
        }
        for (level, meta) in &self.new_files {
            put_varint32(&mut buf, TAG_NEW_FILE);
            put_varint32(&mut buf, *level);
            put_varint64(&mut buf, meta.number);
            put_varint64(&mut buf, meta.file_size);
            put_length_prefixed(&mut buf, meta.smallest.encoded());
            put_length_prefixed(&mut buf, meta.largest.encoded());
        }

        buf
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::new();

        while !src.is_empty() {
            let tag = get_varint32(&mut src)?;
            match tag {
                TAG_COMPARATOR => {
                    let name = get_length_prefixed(&mut src)?;
                    let name = std::str::from_utf8(name)
                        .map_err(|_| corruption!("comparator name is not utf-8"))?;
                    edit.comparator_name = Some(name.to_string());
                }
                TAG_LOG_NUMBER => edit.log_number = Some(get_varint64(&mut src)?),
                TAG_PREV_LOG_NUMBER => edit.prev_log_number = Some(get_varint64(&mut src)?),
                TAG_NEXT_FILE_NUMBER => edit.next_file_number = Some(get_varint64(&mut src)?),
                TAG_LAST_SEQUENCE => edit.last_sequence = Some(get_varint64(&mut src)?),
                TAG_DELETED_FILE => {
                    let level = decode_level(&mut src)?;
                    let number = get_varint64(&mut src)?;
                    edit.deleted_files.push((level, number));
                }
                TAG_NEW_FILE => {
                    let level = decode_level(&mut src)?;
                    let number = get_varint64(&mut src)?;
                    let file_size = get_varint64(&mut src)?;
                    let smallest = InternalKey::decode(get_length_prefixed(&mut src)?)?;
                    let largest = InternalKey::decode(get_length_prefixed(&mut src)?)?;
                    edit.new_files.push((
                        level,
                        FileMetaData {
                            number,
                            file_size,
                            smallest,
                            largest,
                        },
                    ));
                }
                other => return Err(corruption!("unknown version edit tag {other}")),
            }
        }

        Ok(edit)
    }
}

fn decode_level(src: &mut &[u8]) -> Result<u32> {
    let level = get_varint32(src)?;
    if level as usize >= NUM_LEVELS {
        return Err(corruption!("level {level} out of range"));
    }
    Ok(level)
}
