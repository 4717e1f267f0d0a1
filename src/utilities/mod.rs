//! Shared helpers: cooperative shutdown and lenient value parsing.

pub mod shutdown;
pub mod string_utils;

pub use shutdown::Shutdown;
