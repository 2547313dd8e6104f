#![deny(warnings, rust_2024_compatibility)]
// Specific pedantic lints enforced (not blanket allow):
#![deny(
    clippy::explicit_iter_loop,
    clippy::manual_let_else,
    clippy::semicolon_if_nothing_returned,
    clippy::inconsistent_struct_constructor
)]
// Noisy pedantic lints suppressed:
#![allow(
    clippy::cast_lossless,
    clippy::cast_possible_truncation, // byte counts stay far below the pointer width
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,      // jitter and throughput figures
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,  // e.g. SinkError in sink module
    clippy::must_use_candidate,
    clippy::doc_markdown
)]

pub mod app;
pub mod buffer;
pub mod pipeline;
pub mod scanner;
pub mod sink;
pub mod source;

pub use app::{App, Config};
pub use pipeline::{PipelineError, SplitPipeline, SplitReport, SplitSettings};
pub use sink::{LocalDirStore, MemoryStore, ShardStore};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
