pub mod database;
pub mod logger;
pub mod memory;
pub mod store;
pub mod types;

pub use database::DatabaseLogger;
pub use logger::RequestLogger;
#[allow(unused_imports)]
pub use memory::MemoryLogStore;
pub use store::RequestLogStore;
#[allow(unused_imports)]
pub use types::{LogEntry, RequestLog, RequestStats};
