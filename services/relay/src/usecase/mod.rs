pub mod admin;
pub mod consume;
pub mod produce;
