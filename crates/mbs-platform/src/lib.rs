mod commands;
mod paths;

pub use commands::{DetachProcess, HideWindow};
pub use paths::{AppPaths, AppPathsError};
