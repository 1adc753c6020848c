//! # Stevedore UI
//!
//! Terminal output for task runs:
//! - [`Console`]: colored, bolded, cursor-addressable writes
//! - [`SimpleLogger`]: one line per salient event, append-only
//! - [`FancyLogger`]: a live multi-line progress region
//! - [`QuietLogger`]: failures only
//!
//! All three implement the engine's `EventLogger` observer interface and
//! are driven off the same event stream.

mod console;
mod fancy;
mod logger;

pub use console::Console;
pub use fancy::FancyLogger;
pub use logger::{select_logger, OutputMode, QuietLogger, RunDisplay, SimpleLogger};
