pub mod add;
pub mod changes;
pub mod common;
pub mod goals;
pub mod list;
pub mod mirror;
pub mod status;
