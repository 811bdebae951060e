//! Infrastructure layer - persistence and process plumbing

pub mod db;
pub mod logging;
pub mod queue;
pub mod store;
