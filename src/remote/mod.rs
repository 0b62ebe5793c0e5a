//! The remote clause service.

mod client;
mod types;

pub use client::{HttpRemote, Remote};
pub use types::{Clause, ClauseDraft};
