//! Core session components.
//!
//! - **pty**: console program on a pseudo-terminal (portable-pty)
//! - **term**: escape classifier and virtual line buffer
//! - **normalize**: line grammar normalizer
//! - **pipeline**: per-chunk reprocessing built from the above
//! - **session**: one client connection proxied to one console program
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── ConsolePty (child process + pty reader/writer)
//! ├── input relay   client -> pty, raw bytes
//! └── output relay  pty -> Reprocessor -> client
//!     ├── Classifier (escape sequences -> tokens)
//!     ├── LineBuffer (tokens -> logical lines)
//!     └── Normalizer (logical lines -> canonical lines)
//! ```

pub mod normalize;
pub mod pipeline;
pub mod pty;
pub mod session;
pub mod term;
