#[macro_use]
extern crate log;

pub mod shard;

pub use shard::run_shard;
