pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod keepalive;
pub mod model;
pub mod sandbox;
pub mod shell;
pub mod shutdown;
pub mod store;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    pub mod judge {
        tonic::include_proto!("judge");
    }

    pub mod sandbox {
        tonic::include_proto!("sandbox");
    }
}
