//! Sink implementations.

#[cfg(feature = "memory")]
pub mod memory;
pub mod writer;

#[cfg(feature = "memory")]
pub use memory::MemorySink;
pub use writer::WriterSink;
