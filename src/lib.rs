//! Spawn processes and pipelines without a shell.
//!
//! Commands are plain argument vectors; redirections are attached as
//! values instead of being parsed from a command line.
//!
//! ```no_run
//! use noshell::{Command, Redirect};
//!
//! let exit = (Command::new("ls").arg("-l") | Command::from_args(["grep", "rs"]))
//!     .stdout_to("listing.txt")
//!     .run_wait();
//! for (stage, handle) in exit.failures() {
//!     eprintln!("stage {stage} failed: {:?}", handle.error());
//! }
//! ```
//!
//! Nothing here panics or returns early on an OS failure: every error is
//! recorded in the [`Handle`] of the process it belongs to.

#[cfg(not(unix))]
compile_error!("noshell only supports unix targets");

mod error;
mod signals;
pub mod engine;

pub use engine::*;
pub use error::SetupError;
