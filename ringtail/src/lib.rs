pub mod config;
pub mod tail;

pub use config::Config;
pub use tail::{drain, format_record, spawn_demo_producer, Summary};
