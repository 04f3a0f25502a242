pub mod database;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use database::Database;
pub use error::StoreError;
pub use gateway::{LoadedSubChat, PersistenceGateway};
pub use memory::MemoryGateway;
pub use sqlite::SqliteGateway;
