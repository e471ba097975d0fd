pub mod band;
pub mod cli;
pub mod console;
pub mod device;
pub mod error;
pub mod frame;
pub mod port;
pub mod proto;
pub mod scheduler;
