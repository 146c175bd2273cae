pub mod daemon;
pub mod sessions;

pub use daemon::{DaemonHandle, RouterDaemon};
pub use sessions::SessionTable;
