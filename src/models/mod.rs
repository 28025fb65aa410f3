pub mod config;
mod target;

pub use config::*;
pub use target::*;
