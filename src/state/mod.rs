//! Atomic plan persistence and resume compatibility

mod store;

pub use store::{StateStore, default_state_path};
