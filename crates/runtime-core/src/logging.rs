//! Tracing subscriber setup

use crate::ClusterTopology;
use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Directives used when `RUST_LOG` is not set
pub const DEFAULT_DIRECTIVES: &str =
    "trainer=info,checkpoint=info,data_shard=info,parallel=info,storage=warn,runtime_core=info";

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(default_directives: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directives.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Root span tagging every event with the process rank
pub fn rank_span(topology: &ClusterTopology) -> Span {
    tracing::info_span!(
        "rank",
        rank = topology.rank(),
        local_rank = topology.local_rank()
    )
}
