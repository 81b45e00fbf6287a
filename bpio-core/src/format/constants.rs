//! Format constants and magic bytes for the binary-pack container

/// Size of the readable header at the start of every data and metadata file
pub const FILE_HEADER_SIZE: usize = 64;

/// Length of the readable version tag at the start of a file header
pub const VERSION_TAG_LENGTH: usize = 32;

/// Current on-disk format version
pub const FORMAT_VERSION: u8 = 1;

/// Byte-order marker values
pub const LITTLE_ENDIAN: u8 = 0;
pub const BIG_ENDIAN: u8 = 1;

/// Marker for a joinable dimension in a variable shape
pub const JOINED_DIM: u64 = u64::MAX - 1;

/// Shape marker for local single values (one value per writer)
pub const LOCAL_VALUE_DIM: u64 = u64::MAX - 2;

/// Maximum number of dimensions a variable may have
pub const MAX_DIMS: usize = 32;

/// Maximum variable or attribute name length in bytes
pub const MAX_NAME_LENGTH: usize = u16::MAX as usize;

/// Footer constants
pub mod footer {
    /// Magic bytes stored in the footer
    pub const MAGIC: [u8; 2] = *b"BX";

    /// Fixed footer size
    pub const SIZE: usize = 28;
}

/// Step table constants
pub mod step_table {
    /// Size of one step table entry
    pub const ENTRY_SIZE: usize = 32;
}

/// Metadata index (`md.idx`) constants
pub mod index_table {
    /// Position of the writer-active flag inside the index file header
    pub const ACTIVE_FLAG_POSITION: usize = 38;

    /// Size of one per-step index record
    pub const RECORD_SIZE: usize = 48;
}

/// Record tags used in metadata streams
pub mod record {
    /// Per-block variable characteristics
    pub const BLOCK: u8 = b'B';
    /// Attribute definition
    pub const ATTRIBUTE: u8 = b'A';
    /// End-of-step boundary marker
    pub const STEP_END: u8 = b'S';
    /// Start of a merged step chunk
    pub const CHUNK: u8 = b'C';
}

/// File names inside a dataset directory
pub mod files {
    /// Global metadata file
    pub const METADATA: &str = "md.0";
    /// Per-step metadata index file
    pub const METADATA_INDEX: &str = "md.idx";
    /// Prefix for data subfiles (`data.0`, `data.1`, ...)
    pub const DATA_PREFIX: &str = "data.";
    /// Profiling output
    pub const PROFILING: &str = "profiling.json";
}
