//! Canopy - reactive state and query execution for visual app builders
//!
//! Re-exports the workspace crates:
//! - [`ast`]: spans, expressions, templates and state paths
//! - [`parser`]: template and expression parsing
//! - [`eval`]: the sandboxed binding interpreter
//! - [`graph`]: dependency tracking and cycle detection
//! - [`runtime`]: sessions, queries, events, pages and the debug log

pub use canopy_ast as ast;
pub use canopy_eval as eval;
pub use canopy_graph as graph;
pub use canopy_parser as parser;
pub use canopy_runtime as runtime;

pub use canopy_runtime::{AppDefinition, EngineConfig, Session};
