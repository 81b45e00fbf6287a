//! Validation utilities
//!
//! Pure validation and parsing functions with no I/O dependencies.

pub mod bounds;
pub mod parsing;

pub use bounds::{checked_element_count, validate_array_bounds, validate_dims};
pub use parsing::{parse_f64, parse_flag, parse_size, parse_u64};
