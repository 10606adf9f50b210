pub mod activity;
pub mod client_pool;
pub mod clock;
pub mod config;
pub mod content;
pub mod entity;
pub mod error;
pub mod io;
pub mod migrations;
pub mod paths;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod usage;
pub mod work_pattern;

pub use error::{CadenceError, Result};
