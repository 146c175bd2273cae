pub mod binder;
pub mod executor;
pub mod memory;
pub mod panel;

pub use binder::{is_scriptable_url, TabBinder, TabBinding};
pub use executor::{ActionExecutor, TabHost, TabId, TabInfo};
pub use memory::{EchoExecutor, MemoryTabHost};
pub use panel::{LogEntry, LogPane, SidePanel};
