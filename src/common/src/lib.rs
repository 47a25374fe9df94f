pub mod config;
pub mod storage;
pub mod time;

pub use config::Configuration;
pub use time::TimeBound;
