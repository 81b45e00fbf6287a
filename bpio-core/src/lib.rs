#![no_std]

//! bpio core - binary-pack container format definitions
//!
//! This crate provides the on-disk format, element types, selection
//! geometry and validation helpers shared by the I/O engines. It performs
//! no I/O.

extern crate alloc;

pub mod error;
pub mod format;
pub mod selection;
pub mod traits;
pub mod validation;

pub use error::*;
pub use format::*;
pub use selection::{Region, Selection};
pub use traits::*;
