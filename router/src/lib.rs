#[macro_use]
extern crate log;

pub mod router;

pub use router::run_router;
