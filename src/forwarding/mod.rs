//! Local port forwarding
//!
//! Each session keeps its forwards keyed by local port; a forward dies
//! with the transport that carries it.

mod local;

pub use local::{start_local_forward, ForwardStats, LocalForward, LocalForwardHandle};
