//! Error types for container format operations

/// Errors that can occur while encoding or decoding format structures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    /// Invalid file header (bad magic or tag)
    InvalidHeader,
    /// Invalid trailing footer
    InvalidFooter,
    /// Index out of bounds
    IndexOutOfBounds,
    /// Unsupported format version or byte order
    UnsupportedFormat,
    /// Data corruption detected
    CorruptedData,
    /// Insufficient buffer space
    InsufficientBuffer,
    /// Malformed range or box
    InvalidRange,
    /// Byte length not a multiple of the element size
    ArrayAlignment,
    /// Size computation overflowed
    ArraySizeOverflow,
    /// Unknown data type tag
    UnknownDataType,
    /// Unknown shape id tag
    UnknownShapeId,
    /// Unknown record tag in a metadata stream
    UnknownRecord,
}

impl core::fmt::Display for FormatError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            FormatError::InvalidHeader => "Invalid file header",
            FormatError::InvalidFooter => "Invalid footer",
            FormatError::IndexOutOfBounds => "Index out of bounds",
            FormatError::UnsupportedFormat => "Unsupported format version or byte order",
            FormatError::CorruptedData => "Data corruption detected",
            FormatError::InsufficientBuffer => "Insufficient buffer space",
            FormatError::InvalidRange => "Invalid range",
            FormatError::ArrayAlignment => "Array length not aligned to element size",
            FormatError::ArraySizeOverflow => "Array size overflow",
            FormatError::UnknownDataType => "Unknown data type tag",
            FormatError::UnknownShapeId => "Unknown shape id tag",
            FormatError::UnknownRecord => "Unknown metadata record tag",
        };
        write!(f, "{msg}")
    }
}

/// Result type for format operations
pub type Result<T> = core::result::Result<T, FormatError>;
