pub mod env;
pub mod mapping;
pub mod tracing_init;

pub use env::{AppConfig, DestinationConfig, SourceConfig, SyncSettings};
pub use mapping::{ColumnTarget, FieldMapping, SourceField};
pub use tracing_init::init_tracing;
