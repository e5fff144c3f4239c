//! Envoy wire protocol: `ext_proc` server and `ratelimit` client.
//!
//! Generated message types live under [`envoy`], mirroring the protobuf
//! package layout so cross-package references resolve.

mod client;
mod convert;
mod server;
mod service;

pub use client::GrpcRateLimitClient;
pub use convert::{json_to_struct, struct_to_json};
pub use server::{serve, shutdown_signal};
pub use service::ExtProcService;

#[allow(clippy::all, missing_docs)]
pub mod envoy {
    pub mod config {
        pub mod core {
            pub mod v3 {
                tonic::include_proto!("envoy.config.core.v3");
            }
        }
    }

    pub mod extensions {
        pub mod common {
            pub mod ratelimit {
                pub mod v3 {
                    tonic::include_proto!("envoy.extensions.common.ratelimit.v3");
                }
            }
        }
    }

    pub mod service {
        pub mod ext_proc {
            pub mod v3 {
                tonic::include_proto!("envoy.service.ext_proc.v3");
            }
        }

        pub mod ratelimit {
            pub mod v3 {
                tonic::include_proto!("envoy.service.ratelimit.v3");
            }
        }
    }
}
