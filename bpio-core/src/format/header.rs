//! File header and type tags
//!
//! Every physical file of a dataset starts with a 64-byte header carrying a
//! readable version tag, the byte order of the writer and, for the metadata
//! index file, the writer-active flag polled by streaming readers.

use super::constants::{
    index_table::ACTIVE_FLAG_POSITION, FILE_HEADER_SIZE, FORMAT_VERSION, LITTLE_ENDIAN,
    VERSION_TAG_LENGTH,
};
use crate::error::{FormatError, Result};

/// Kind of physical file a header belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum FileKind {
    /// Payload subfile (`data.N`)
    Data = 0,
    /// Global metadata file (`md.0`)
    Metadata = 1,
    /// Per-step metadata index (`md.idx`)
    MetadataIndex = 2,
}

impl FileKind {
    /// Convert from u8 representation
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FileKind::Data),
            1 => Some(FileKind::Metadata),
            2 => Some(FileKind::MetadataIndex),
            _ => None,
        }
    }

    const fn label(self) -> &'static [u8] {
        match self {
            FileKind::Data => b"Data",
            FileKind::Metadata => b"Metadata",
            FileKind::MetadataIndex => b"Index Table",
        }
    }
}

/// Fixed-size header at the start of every dataset file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Which file this header belongs to
    pub kind: FileKind,
    /// Byte order of the writer (0 = little endian)
    pub endianness: u8,
    /// Format version
    pub version: u8,
    /// Writer still appending steps (index file only)
    pub active: bool,
}

impl FileHeader {
    /// Readable tag prefix
    pub const TAG: &'static [u8] = b"BPIO v1 ";

    /// Size of the header in bytes
    pub const SIZE: usize = FILE_HEADER_SIZE;

    /// Create a header for the current host
    pub const fn new(kind: FileKind) -> Self {
        Self {
            kind,
            endianness: host_endianness(),
            version: FORMAT_VERSION,
            active: false,
        }
    }

    /// Set the writer-active flag
    pub const fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Serialize to the fixed 64-byte layout
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut bytes = [0u8; FILE_HEADER_SIZE];
        let label = self.kind.label();
        bytes[..Self::TAG.len()].copy_from_slice(Self::TAG);
        let end = (Self::TAG.len() + label.len()).min(VERSION_TAG_LENGTH);
        bytes[Self::TAG.len()..end].copy_from_slice(&label[..end - Self::TAG.len()]);

        bytes[32] = self.endianness;
        bytes[33] = self.version;
        bytes[34] = self.kind as u8;
        bytes[ACTIVE_FLAG_POSITION] = self.active as u8;
        bytes
    }

    /// Parse and validate a header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(FormatError::InsufficientBuffer);
        }
        if &bytes[..Self::TAG.len()] != Self::TAG {
            return Err(FormatError::InvalidHeader);
        }

        let kind = FileKind::from_u8(bytes[34]).ok_or(FormatError::InvalidHeader)?;
        let header = Self {
            kind,
            endianness: bytes[32],
            version: bytes[33],
            active: bytes[ACTIVE_FLAG_POSITION] != 0,
        };

        if header.version == 0 || header.version > FORMAT_VERSION {
            return Err(FormatError::UnsupportedFormat);
        }
        if header.endianness != host_endianness() {
            return Err(FormatError::UnsupportedFormat);
        }
        Ok(header)
    }

    /// Read only the active flag from raw header bytes
    pub fn read_active_flag(bytes: &[u8]) -> Result<bool> {
        bytes
            .get(ACTIVE_FLAG_POSITION)
            .map(|&flag| flag != 0)
            .ok_or(FormatError::InsufficientBuffer)
    }
}

/// Byte-order marker of the running host
pub const fn host_endianness() -> u8 {
    if cfg!(target_endian = "little") {
        LITTLE_ENDIAN
    } else {
        super::constants::BIG_ENDIAN
    }
}

/// Element types supported by the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum DataType {
    I8 = 0,
    I16 = 1,
    I32 = 2,
    I64 = 3,
    U8 = 4,
    U16 = 5,
    U32 = 6,
    U64 = 7,
    F32 = 8,
    F64 = 9,
    /// Pair of 32-bit floats
    Complex32 = 10,
    /// Pair of 64-bit floats
    Complex64 = 11,
    /// UTF-8 string, single values only
    String = 12,
}

impl DataType {
    /// Convert from u8 representation
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DataType::I8),
            1 => Some(DataType::I16),
            2 => Some(DataType::I32),
            3 => Some(DataType::I64),
            4 => Some(DataType::U8),
            5 => Some(DataType::U16),
            6 => Some(DataType::U32),
            7 => Some(DataType::U64),
            8 => Some(DataType::F32),
            9 => Some(DataType::F64),
            10 => Some(DataType::Complex32),
            11 => Some(DataType::Complex64),
            12 => Some(DataType::String),
            _ => None,
        }
    }

    /// Convert to u8 representation
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Size in bytes of one element, 0 for variable-sized types
    pub const fn size_bytes(self) -> usize {
        match self {
            DataType::I8 | DataType::U8 => 1,
            DataType::I16 | DataType::U16 => 2,
            DataType::I32 | DataType::U32 | DataType::F32 => 4,
            DataType::I64 | DataType::U64 | DataType::F64 | DataType::Complex32 => 8,
            DataType::Complex64 => 16,
            DataType::String => 0,
        }
    }

    /// Whether elements have no fixed size
    pub const fn is_variable_sized(self) -> bool {
        matches!(self, DataType::String)
    }

    /// Lower-case type name as printed by tools
    pub const fn name(self) -> &'static str {
        match self {
            DataType::I8 => "int8_t",
            DataType::I16 => "int16_t",
            DataType::I32 => "int32_t",
            DataType::I64 => "int64_t",
            DataType::U8 => "uint8_t",
            DataType::U16 => "uint16_t",
            DataType::U32 => "uint32_t",
            DataType::U64 => "uint64_t",
            DataType::F32 => "float",
            DataType::F64 => "double",
            DataType::Complex32 => "float complex",
            DataType::Complex64 => "double complex",
            DataType::String => "string",
        }
    }
}

impl core::fmt::Display for DataType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Variable shape classification, derived from the define signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ShapeId {
    /// Single value shared by all writers
    GlobalValue = 0,
    /// Array addressed in a global index space
    GlobalArray = 1,
    /// Global array whose joined dimension is the sum of local extents
    JoinedArray = 2,
    /// One independent value per writer, read back as a 1-D array
    LocalValue = 3,
    /// Independent per-writer blocks without a global shape
    LocalArray = 4,
}

impl ShapeId {
    /// Convert from u8 representation
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ShapeId::GlobalValue),
            1 => Some(ShapeId::GlobalArray),
            2 => Some(ShapeId::JoinedArray),
            3 => Some(ShapeId::LocalValue),
            4 => Some(ShapeId::LocalArray),
            _ => None,
        }
    }

    /// Classify a variable from its define-time dimensions
    pub fn classify(shape: &[u64], count: &[u64]) -> Self {
        use super::constants::{JOINED_DIM, LOCAL_VALUE_DIM};

        if shape.is_empty() {
            if count.is_empty() {
                ShapeId::GlobalValue
            } else {
                ShapeId::LocalArray
            }
        } else if shape.len() == 1 && shape[0] == LOCAL_VALUE_DIM {
            ShapeId::LocalValue
        } else if shape.contains(&JOINED_DIM) {
            ShapeId::JoinedArray
        } else {
            ShapeId::GlobalArray
        }
    }

    /// Whether the variable holds one value per block
    pub const fn is_single_value(self) -> bool {
        matches!(self, ShapeId::GlobalValue | ShapeId::LocalValue)
    }
}

impl core::fmt::Display for ShapeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ShapeId::GlobalValue => "GlobalValue",
            ShapeId::GlobalArray => "GlobalArray",
            ShapeId::JoinedArray => "JoinedArray",
            ShapeId::LocalValue => "LocalValue",
            ShapeId::LocalArray => "LocalArray",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::constants::{JOINED_DIM, LOCAL_VALUE_DIM};

    #[test]
    fn test_header_roundtrip_keeps_active_flag() {
        let header = FileHeader::new(FileKind::MetadataIndex).with_active(true);
        let bytes = header.to_bytes();

        assert_eq!(&bytes[..8], b"BPIO v1 ");
        assert_eq!(FileHeader::read_active_flag(&bytes), Ok(true));
        assert_eq!(FileHeader::from_bytes(&bytes), Ok(header));
    }

    #[test]
    fn test_header_rejects_foreign_bytes() {
        let bytes = [0u8; 64];
        assert_eq!(FileHeader::from_bytes(&bytes), Err(FormatError::InvalidHeader));
        assert_eq!(
            FileHeader::from_bytes(&bytes[..10]),
            Err(FormatError::InsufficientBuffer)
        );
    }

    #[test]
    fn test_shape_classification() {
        assert_eq!(ShapeId::classify(&[], &[]), ShapeId::GlobalValue);
        assert_eq!(ShapeId::classify(&[], &[4]), ShapeId::LocalArray);
        assert_eq!(ShapeId::classify(&[10], &[5]), ShapeId::GlobalArray);
        assert_eq!(
            ShapeId::classify(&[JOINED_DIM, 3], &[2, 3]),
            ShapeId::JoinedArray
        );
        assert_eq!(
            ShapeId::classify(&[LOCAL_VALUE_DIM], &[1]),
            ShapeId::LocalValue
        );
    }

    #[test]
    fn test_data_type_tags() {
        for tag in 0..=12u8 {
            let dt = DataType::from_u8(tag).unwrap();
            assert_eq!(dt.to_u8(), tag);
        }
        assert_eq!(DataType::from_u8(13), None);
        assert_eq!(DataType::Complex64.size_bytes(), 16);
        assert!(DataType::String.is_variable_sized());
    }
}
