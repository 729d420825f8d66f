//! Terminal output reconstruction
//!
//! - **parser**: escape sequence classifier
//! - **state**: single-row virtual line buffer

pub mod parser;
pub mod state;

pub use parser::{classify, split_incomplete_tail};
pub use state::{replay, LineBuffer};
