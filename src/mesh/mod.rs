//! Peer mesh networking using Chitchat.
//!
//! Nodes gossip their own sliding-window hit logs to each other, so a limit
//! can be shared between instances without a central counter server. Each
//! node only ever writes its own state; a window's count is the sum of what
//! every live node reports.

mod cluster;

pub use cluster::{Cluster, ClusterConfig, ClusterError};
