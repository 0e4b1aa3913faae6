pub mod bc;
pub mod config;
pub mod env;
pub mod error;
pub mod store;

pub use error::{Error, Result};

pub mod proto {
    pub mod environment {
        tonic::include_proto!("imitation.environment");
    }

    pub mod graph {
        tonic::include_proto!("imitation.graph");
    }
}
