pub mod db;
pub mod error;
pub mod store;

pub use db::init_db;
pub use error::StoreError;
pub use store::SqliteStore;
