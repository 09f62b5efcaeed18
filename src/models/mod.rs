//! Data models for the Rota engine

pub mod backend;
pub mod context;
pub mod health;
pub mod stats;

pub use backend::*;
pub use context::*;
pub use health::*;
pub use stats::*;
