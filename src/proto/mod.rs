//! Generated protobuf modules.
//!
//! Conditionally includes code generated from the Meshtastic `.proto`
//! definitions (`FromRadio`, `ToRadio`, `MeshPacket`, `Data`, `NodeInfo`,
//! `Config`, `ModuleConfig`, ...) when the `meshtastic-proto` feature is
//! enabled. `build.rs` compiles whatever lives under `protos/` (or
//! `MESHTASTIC_PROTO_DIR`), falling back to a placeholder proto so the build
//! never breaks on a checkout without vendored Meshtastic protos.

#[cfg(feature = "meshtastic-proto")]
pub mod meshtastic_generated {
    //! Generated Meshtastic protobuf types.
    //! All Meshtastic protos share the `meshtastic` package, so prost emits
    //! a single `meshtastic.rs` file containing all definitions.

    #[cfg(feature = "proto-silence")]
    #[allow(dead_code, unused_imports, unused_variables, unused_mut, unused_macros)]
    #[allow(clippy::all)]
    pub mod inner {
        include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
    }

    #[cfg(feature = "proto-silence")]
    pub use inner::*;

    #[cfg(not(feature = "proto-silence"))]
    include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
}

#[cfg(not(feature = "meshtastic-proto"))]
pub mod meshtastic_generated {
    //! Stub types used when protobufs are not compiled in.
    #[derive(Debug, Clone)]
    pub struct Placeholder {
        pub note: String,
    }
}

pub use meshtastic_generated::*;
