//! Small building blocks shared by the coordination primitives.

pub mod arena;
pub mod once;

pub use arena::{Arena, ArenaIndex};
pub use once::OnceFlag;
