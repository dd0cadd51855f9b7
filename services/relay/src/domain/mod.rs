pub mod publish;
pub mod repository;
pub mod types;
