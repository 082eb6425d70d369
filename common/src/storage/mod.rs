pub mod db;
pub mod store;
pub mod types;
pub mod vault;
