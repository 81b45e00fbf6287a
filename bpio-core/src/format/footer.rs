//! Trailing footer, step table and metadata index records
//!
//! A finished metadata file ends with a step table (one entry per step,
//! pointing at that step's merged chunk) followed by the fixed 28-byte
//! footer. The footer is the last thing written, so a reader can always
//! locate the step table by seeking from the end of the file.

use super::constants::{footer, index_table, step_table, FORMAT_VERSION};
use super::header::host_endianness;
use crate::error::{FormatError, Result};

/// Fixed-size trailing record of the metadata file
///
/// Layout (little endian):
/// `metadata_offset u64 | metadata_length u64 | step_count u64 |
/// endianness u8 | magic "BX" | version u8`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// Absolute offset of the step table
    pub metadata_offset: u64,
    /// Length in bytes of the step table
    pub metadata_length: u64,
    /// Number of steps recorded
    pub step_count: u64,
    pub endianness: u8,
    pub version: u8,
}

impl Footer {
    pub const SIZE: usize = footer::SIZE;

    pub const fn new(metadata_offset: u64, metadata_length: u64, step_count: u64) -> Self {
        Self {
            metadata_offset,
            metadata_length,
            step_count,
            endianness: host_endianness(),
            version: FORMAT_VERSION,
        }
    }

    pub fn to_bytes(&self) -> [u8; footer::SIZE] {
        let mut bytes = [0u8; footer::SIZE];
        bytes[0..8].copy_from_slice(&self.metadata_offset.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.metadata_length.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.step_count.to_le_bytes());
        bytes[24] = self.endianness;
        bytes[25..27].copy_from_slice(&footer::MAGIC);
        bytes[27] = self.version;
        bytes
    }

    /// Parse the footer from the last [`Footer::SIZE`] bytes of a file
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < footer::SIZE {
            return Err(FormatError::InsufficientBuffer);
        }
        let bytes = &bytes[bytes.len() - footer::SIZE..];
        if bytes[25..27] != footer::MAGIC {
            return Err(FormatError::InvalidFooter);
        }

        let read_u64 = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let footer = Self {
            metadata_offset: read_u64(0),
            metadata_length: read_u64(8),
            step_count: read_u64(16),
            endianness: bytes[24],
            version: bytes[27],
        };

        if footer.version == 0 || footer.version > FORMAT_VERSION {
            return Err(FormatError::UnsupportedFormat);
        }
        if footer.endianness != host_endianness() {
            return Err(FormatError::UnsupportedFormat);
        }
        let expected = footer
            .step_count
            .checked_mul(step_table::ENTRY_SIZE as u64)
            .ok_or(FormatError::ArraySizeOverflow)?;
        if expected != footer.metadata_length {
            return Err(FormatError::InvalidFooter);
        }
        Ok(footer)
    }
}

/// One entry of the step table, pointing at a merged step chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepTableEntry {
    pub step: u64,
    /// Absolute offset of the chunk in the metadata file
    pub chunk_offset: u64,
    pub chunk_length: u64,
    pub block_count: u32,
    pub variable_count: u32,
}

impl StepTableEntry {
    pub const SIZE: usize = step_table::ENTRY_SIZE;

    pub fn to_bytes(&self) -> [u8; step_table::ENTRY_SIZE] {
        let mut bytes = [0u8; step_table::ENTRY_SIZE];
        bytes[0..8].copy_from_slice(&self.step.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.chunk_offset.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.chunk_length.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.block_count.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.variable_count.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(FormatError::InsufficientBuffer);
        }
        let mut r = super::cursor::ByteReader::new(&bytes[..Self::SIZE]);
        Ok(Self {
            step: r.u64()?,
            chunk_offset: r.u64()?,
            chunk_length: r.u64()?,
            block_count: r.u32()?,
            variable_count: r.u32()?,
        })
    }
}

/// Per-step record of the metadata index file (`md.idx`)
///
/// The index file is appended to after each step is flushed so that
/// readers can follow a dataset that is still being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexRecord {
    pub step: u64,
    pub chunk_offset: u64,
    pub chunk_length: u64,
    pub block_count: u64,
    /// Number of writer ranks that contributed to the step
    pub rank_count: u64,
    /// Milliseconds since the Unix epoch when the step was flushed
    pub timestamp_ms: u64,
}

impl IndexRecord {
    pub const SIZE: usize = index_table::RECORD_SIZE;

    pub fn to_bytes(&self) -> [u8; index_table::RECORD_SIZE] {
        let mut bytes = [0u8; index_table::RECORD_SIZE];
        let fields = [
            self.step,
            self.chunk_offset,
            self.chunk_length,
            self.block_count,
            self.rank_count,
            self.timestamp_ms,
        ];
        for (i, field) in fields.iter().enumerate() {
            bytes[i * 8..i * 8 + 8].copy_from_slice(&field.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(FormatError::InsufficientBuffer);
        }
        let mut r = super::cursor::ByteReader::new(&bytes[..Self::SIZE]);
        Ok(Self {
            step: r.u64()?,
            chunk_offset: r.u64()?,
            chunk_length: r.u64()?,
            block_count: r.u64()?,
            rank_count: r.u64()?,
            timestamp_ms: r.u64()?,
        })
    }

    /// The step table entry equivalent of this record
    pub fn to_step_entry(&self, variable_count: u32) -> StepTableEntry {
        StepTableEntry {
            step: self.step,
            chunk_offset: self.chunk_offset,
            chunk_length: self.chunk_length,
            block_count: self.block_count as u32,
            variable_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footer_is_found_from_end_of_file() {
        let footer = Footer::new(4096, 64, 2);
        let mut file = [0xAAu8; 100];
        file[100 - Footer::SIZE..].copy_from_slice(&footer.to_bytes());

        let parsed = Footer::from_bytes(&file).unwrap();
        assert_eq!(parsed, footer);
    }

    #[test]
    fn test_footer_layout() {
        let bytes = Footer::new(1, 32, 1).to_bytes();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[25..27], b"BX");
        assert_eq!(bytes[27], FORMAT_VERSION);
    }

    #[test]
    fn test_footer_rejects_bad_magic_and_length() {
        let mut bytes = Footer::new(0, 32, 1).to_bytes();
        bytes[25] = b'Z';
        assert_eq!(Footer::from_bytes(&bytes), Err(FormatError::InvalidFooter));

        let bytes = Footer::new(0, 33, 1).to_bytes();
        assert_eq!(Footer::from_bytes(&bytes), Err(FormatError::InvalidFooter));
    }

    #[test]
    fn test_index_record_layout() {
        let record = IndexRecord {
            step: 3,
            chunk_offset: 64,
            chunk_length: 200,
            block_count: 4,
            rank_count: 2,
            timestamp_ms: 1_700_000_000_000,
        };
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), 48);
        assert_eq!(IndexRecord::from_bytes(&bytes), Ok(record));

        let entry = record.to_step_entry(1);
        assert_eq!(StepTableEntry::from_bytes(&entry.to_bytes()), Ok(entry));
    }
}
