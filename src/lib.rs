#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod error;
mod graph;
mod invalidate;
mod schema;
mod state;
mod watch;

pub use error::*;
pub use graph::*;
pub use schema::*;
pub use state::*;
