//! Abstract interfaces shared by every crate in the workspace

pub mod element;

pub use element::{Complex32, Complex64, Element};
