//! Canopy Graph - static dependency tracking
//!
//! Determines which state paths each binding reads, links bindings into a
//! graph keyed by those paths, and blocks any subgraph that feeds back into
//! itself.

mod cycle;
mod error;
mod extract;
mod graph;

pub use error::*;
pub use extract::*;
pub use graph::*;
