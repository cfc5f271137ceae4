pub mod audio;
pub mod config;

pub use config::SessionConfig;
