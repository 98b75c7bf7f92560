pub mod error;
pub mod types;
pub mod value;

pub use error::{KvError, Result};
pub use types::{BufferStats, Settings, SettingsOverrides};
