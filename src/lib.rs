//! Client-side cluster layer for RPC calls: pluggable load balancing and
//! fault-tolerance strategies over a dynamic set of endpoints.
//!
//! The moving parts:
//! - [`directory::Directory`] lists the candidate endpoints for a call
//! - [`loadbalance::LoadBalance`] picks one endpoint from the candidates
//! - [`cluster::ClusterInvoker`] wraps both with a fault-tolerance policy
//!   (failover, failfast, failsafe, failback, broadcast)
//! - [`stats::StatsRegistry`] feeds the adaptive policies with per
//!   (endpoint, method) call statistics
//!
//! ```no_run
//! use std::sync::Arc;
//! use rpc_cluster::cluster::build_cluster;
//! use rpc_cluster::config::ClusterConfig;
//! use rpc_cluster::directory::StaticDirectory;
//! use rpc_cluster::invocation::Invocation;
//!
//! # async fn run(endpoints: Vec<Arc<dyn rpc_cluster::invoker::Invoker>>) {
//! let directory = Arc::new(StaticDirectory::new(endpoints));
//! let cluster = build_cluster(directory, ClusterConfig::default());
//! let invocation = Arc::new(Invocation::new("echo", vec!["hello".into()]));
//! let response = cluster.invoke(invocation).await;
//! # let _ = response;
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod directory;
pub mod error;
pub mod invocation;
pub mod invoker;
pub mod loadbalance;
pub mod mock;
pub mod stats;

pub use cluster::{build_cluster, ClusterInvoker};
pub use config::ClusterConfig;
pub use directory::Directory;
pub use error::Error;
pub use invocation::Invocation;
pub use invoker::{Invoker, Response};
