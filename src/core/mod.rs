//! Core linear-algebra traits and their `faer` / `Vec` implementations.

pub mod traits;
pub mod wrappers;
