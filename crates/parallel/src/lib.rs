//! Parallel layout of a training job
//!
//! Builds the 2-D `(dp, tp)` device mesh from the process topology and
//! computes the tensor-parallel sharding assignment for a transformer's
//! named submodules.

pub mod device;
pub mod layout;
pub mod mesh;
pub mod planner;

pub use device::{Accelerator, CpuAccelerator, MemoryStats};
pub use layout::{Layout, ParameterPlacement, ShardingPolicy};
pub use mesh::{DeviceMesh, MeshCoordinate};
pub use planner::{
    LayoutMismatch, ParamSpec, ShardableModel, ShardingAssignment, ShardingPlanner, ShardingRule,
    TransformerNames,
};
