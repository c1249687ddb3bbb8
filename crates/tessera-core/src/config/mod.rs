pub mod daemon;

pub use daemon::{DaemonMode, DaemonSettings};
