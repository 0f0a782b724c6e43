#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

// Re-export the engine wholesale; the facade exists so applications depend
// on one crate and get one coherent surface.
pub use tether_core::*;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use tether::prelude::*;
/// ```
pub mod prelude {
    pub use tether_core::{
        CallArgs, CallError, Capability, Channel, ChannelBuilder, ChannelOptions, DispatchTable,
        InvokeContext, Proxy, RemoteError, RemoteObject, ReturnValue,
    };
}
