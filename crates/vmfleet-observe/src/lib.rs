mod logger;
pub use logger::*;

mod listener;

#[cfg(feature = "listener")]
pub use listener::*;
