//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod retry;
mod timer;

pub use error::DiscoverdError;
pub use print::{logger_init, ME};
pub use retry::Attempts;
pub use timer::Timer;
