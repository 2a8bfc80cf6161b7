//! Message passing: pluggable communicator backends, collectives built from
//! them, the system topology, and the wire encodings.

pub mod collectives;
pub mod communicator;
pub mod system;
pub mod wire;
