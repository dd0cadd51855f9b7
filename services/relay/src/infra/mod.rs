pub mod broker;
pub mod cache;
pub mod db;
pub mod lock;
pub mod memory;
