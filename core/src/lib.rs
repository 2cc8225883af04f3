#[macro_use]
extern crate log;

pub mod codec;
pub mod config;
pub mod error;
pub mod gossip;
pub mod halloc;
pub mod lql;
pub mod mcq;
pub mod net;
pub mod pool;
pub mod protocol;
pub mod reslock;
pub mod table;
pub mod taskman;
pub mod timer;
