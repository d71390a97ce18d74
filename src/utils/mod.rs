//! The `utils` module holds the pieces every other module leans on: the
//! error taxonomy, the injected logging sink, and the shutdown latch shared by
//! the tasks of one client.

pub mod error;
pub mod logging;
pub mod shutdown;
