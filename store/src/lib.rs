#[macro_use]
extern crate log;

pub mod store;

pub use store::run_store;
