//! Shared traits for the object graph

pub mod graph;

pub use graph::{GraphResult, ObjectGraph};
