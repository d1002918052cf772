//! Domain types shared across pushgate crates.

mod callback;
mod log;
mod provider;
mod rule;
mod task;

pub use callback::*;
pub use log::*;
pub use provider::*;
pub use rule::*;
pub use task::*;
