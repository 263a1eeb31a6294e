//! Shared data types
//!
//! Definitions used across the engine, storage and front-end.

pub mod character;

pub use character::Persona;
