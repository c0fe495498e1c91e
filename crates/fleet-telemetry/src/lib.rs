//! Logging setup shared by the fleet daemon and CLI.
//!
//! Output is human-readable by default or JSON lines when the config asks for
//! it. Both honour `RUST_LOG` before falling back to the configured level.

pub mod logging;
