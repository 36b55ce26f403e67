//! Provider routing: tier/capability resolution with fallback and circuit breaking.
//!
//! The registry is purely a selection algorithm; it never performs AI calls.

mod circuit;
mod registry;

pub use circuit::{CircuitBreaker, CircuitState};
pub use registry::ProviderRegistry;
