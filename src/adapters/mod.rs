//! Adapters between the reconcilers and the Kubernetes API

mod resources;
mod secrets;
mod volumes;

pub use resources::*;
pub use secrets::*;
pub use volumes::*;
