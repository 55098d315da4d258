//! Barrier coordinator for multi-process training jobs
//!
//! Global rank 0 hosts a small gRPC server; every rank, rank 0 included,
//! joins it through [`CoordinatorProcessGroup`], a [`runtime_core::ProcessGroup`]
//! whose barriers are `WaitBarrier` calls. The server releases a barrier
//! once all `world_size` ranks have arrived.
//!
//! # Example
//!
//! ```ignore
//! use coordinator::{BarrierService, CoordinatorProcessGroup, CoordinatorServer};
//!
//! let server = CoordinatorServer::new(BarrierService::new(2)?).spawn().await?;
//! let group = CoordinatorProcessGroup::connect(server.local_addr().to_string(), 0, 2).await?;
//! group.barrier().await?;
//! ```

pub mod group;
pub mod server;
pub mod service;

/// Wire messages and generated service stubs
pub mod proto {
    /// One rank arriving at a barrier
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BarrierRequest {
        /// Identifies one barrier; every rank sends the same id
        #[prost(string, tag = "1")]
        pub barrier_id: ::prost::alloc::string::String,
        #[prost(uint64, tag = "2")]
        pub rank: u64,
        /// World size the caller was launched with
        #[prost(uint64, tag = "3")]
        pub world_size: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BarrierResponse {
        #[prost(bool, tag = "1")]
        pub released: bool,
        #[prost(string, tag = "2")]
        pub barrier_id: ::prost::alloc::string::String,
        #[prost(uint64, tag = "3")]
        pub participants: u64,
        /// 1-based position of the caller among arrivals
        #[prost(uint64, tag = "4")]
        pub arrival_order: u64,
    }

    include!(concat!(env!("OUT_DIR"), "/coordinator.Coordinator.rs"));
}

pub use group::{CoordinatorAddr, CoordinatorProcessGroup};
pub use proto::coordinator_client::CoordinatorClient;
pub use proto::coordinator_server::CoordinatorServer as CoordinatorServiceServer;
pub use server::{CoordinatorServer, RunningServer, ServerConfig};
pub use service::BarrierService;
