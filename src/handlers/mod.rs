pub mod config;
pub mod downloads;
pub mod source;

pub use self::config::*;
pub use self::downloads::*;
pub use self::source::*;
