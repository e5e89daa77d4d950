pub mod browser;
pub mod core;
pub mod engine;
pub mod features;

// --- Primary core exports ---
pub use core::config::{load_engine_config, EngineConfig};
pub use core::error::{DomError, EngineError};
pub use core::types;
pub use core::types::*;
pub use core::AppState;

// --- Engine entry points ---
pub use browser::DomProvider;
pub use engine::runner::ChromiumSessions;
pub use engine::{Engine, Runner, SessionFactory};
