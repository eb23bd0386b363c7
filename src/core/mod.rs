//! LSP Protocol - Core
//!
//! Constants, parameters, errors and the transport trait. Always compiled,
//! independent of the async runtime.

pub mod constants;
mod error;
mod params;
mod traits;

pub use error::*;
pub use params::*;
pub use traits::*;
