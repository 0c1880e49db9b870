pub mod config;
pub mod sessions;
pub mod synthesis;

pub use config::*;
pub use sessions::*;
pub use synthesis::*;
