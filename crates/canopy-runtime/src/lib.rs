//! Canopy Runtime
//!
//! Live state for one open app: the state store, binding propagation, query
//! execution, event action chains, the page graph and the debug log, all
//! reachable through a [`Session`].

mod config;
mod connector;
mod debug_log;
mod definition;
mod error;
mod events;
mod host;
mod pages;
mod query;
mod session;
mod store;

pub use config::*;
pub use connector::*;
pub use debug_log::*;
pub use definition::*;
pub use error::*;
pub use host::*;
pub use pages::*;
pub use query::{QueryRun, QueryStats, QueryStatus, RunOutcome, RunStatus};
pub use session::{BindingFault, EventSource, Session, SessionBuilder};
pub use store::*;
