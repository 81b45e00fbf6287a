//! Binary container format definitions
//!
//! Pure data structure definitions for the on-disk layout: file headers,
//! metadata records, step table and footer. No I/O happens here.

pub mod constants;
pub mod cursor;
pub mod footer;
pub mod header;
pub mod record;

pub use cursor::{ByteReader, ByteWriter};
pub use footer::{Footer, IndexRecord, StepTableEntry};
pub use header::{host_endianness, DataType, FileHeader, FileKind, ShapeId};
pub use record::{
    patch_block_location, AttributeRecord, BlockRecord, ChunkHeader, Record, RecordIter,
    StepMarker,
};
