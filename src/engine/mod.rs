pub mod fd;
mod redirect;
mod command;
mod pipeline;
mod handle;
mod status;

// Re-export the public API so callers can use `engine::Command`,
// `engine::Exit`, etc. without reaching into submodules.
pub use redirect::{Channel, Direction, IntoFds, PathMode, PipeEnd, Redirect, Redirection, Sink, Target};
pub use command::Command;
pub use pipeline::PipeLine;
pub use handle::{Exit, Failures, Handle};
pub use status::{ResourceUsage, Status};
