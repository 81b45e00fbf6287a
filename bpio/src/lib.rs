//! bpio - step-based I/O for distributed array data
//!
//! Distributed writers put typed, multi-dimensional variables and scalar
//! attributes into a self-describing binary-pack dataset, one step at a
//! time; readers follow the steps as they are published or open the finished
//! dataset for random access.
//!
//! ## Architecture
//!
//! - **bpio-core**: container format, element types and selection math (no I/O)
//! - **bpio**: catalog, engines, serializer, aggregator, deserializer, transports
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bpio::{Adios, Mode};
//!
//! fn example() -> bpio::Result<()> {
//!     let adios = Adios::default();
//!     let io = adios.declare_io("output")?;
//!     let temperature = io.define_variable::<f64>("T", &[100], &[0], &[100], true)?;
//!
//!     let mut writer = io.open("run.bp", Mode::Write)?;
//!     for step in 0..3 {
//!         writer.begin_step()?;
//!         let values = vec![step as f64; 100];
//!         writer.put(&temperature, &values, Mode::Sync)?;
//!         writer.end_step()?;
//!     }
//!     writer.close()?;
//!
//!     let reader_io = adios.declare_io("input")?;
//!     let mut reader = reader_io.open("run.bp", Mode::ReadRandomAccess)?;
//!     let t = reader_io.inquire_variable::<f64>("T")?.expect("T was written");
//!     t.set_selection(&[10], &[5])?;
//!     t.set_step_selection(2, 1)?;
//!     assert_eq!(reader.get(&t)?, vec![2.0; 5]);
//!     reader.close()
//! }
//! ```
//!
//! ## Features
//!
//! - **Aggregation**: per-rank, grouped or size-balanced subfiles over a [`Comm`]
//! - **Selections**: bounding boxes, point lists, write blocks, step ranges
//! - **Streams**: the same step protocol between threads of one process
//! - **Operators**: per-variable byte shuffle and bzip2 compression
//! - **Memory mapping**: `Library=mmap` reads subfiles through `memmap2`

pub use bpio_core::{
    // Element types
    Complex32, Complex64, DataType, Element, ShapeId,
    // Selection geometry
    Region, Selection,
    // Format errors
    FormatError,
};

pub mod adios;
pub mod aggregator;
pub mod buffer;
pub mod comm;
pub mod deserializer;
pub mod engine;
pub mod error;
pub mod io;
pub mod operator;
pub mod params;
pub mod profiling;
pub mod serializer;
pub mod transport;
pub mod variable;

pub use adios::{Adios, AdiosConfig};
pub use buffer::SharedBuffer;
pub use comm::{Comm, SelfComm, ThreadComm};
pub use deserializer::BlockSummary;
pub use engine::{Engine, Mode, PutData, StepMode, StepStatus};
pub use error::{Error, Result};
pub use io::{EngineKind, Io};
pub use operator::{Operator, OperatorRegistry};
pub use params::{
    AggregationType, BufferOverflowPolicy, EngineParams, QueueFullPolicy, TransportLibrary,
};
pub use transport::{OpenMode, Transport};
pub use variable::{Attribute, AttributeDesc, Variable, VariableDesc};

/// Dimension marker for a joinable dimension in a shape
pub const JOINED_DIM: u64 = bpio_core::format::constants::JOINED_DIM;

/// Shape of a local value, one value per writer
pub const LOCAL_VALUE_DIM: u64 = bpio_core::format::constants::LOCAL_VALUE_DIM;
