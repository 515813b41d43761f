//! InfiniBand SR-IOV CNI plugin for Kubernetes
//!
//! This implementation provides a pure Rust CNI plugin that:
//! - Moves a host VF netdev into the container namespace under the requested name
//! - Brings it up inside the container
//! - Returns it to the host, renamed back and left down, on container deletion
//! - Stops at the first failed step so a retry can find the VF where it was left

pub mod config;
pub mod netlink;
pub mod netns;
pub mod plugin;
pub mod types;
pub mod commands;

// Re-export commonly used items
pub use config::NetConf;
pub use netlink::{Link, LinkError, NetlinkManager, RtNetlink};
pub use netns::{NetNamespace, NetNs, NsError};
pub use plugin::{SriovError, SriovManager, Step, VfState};
pub use commands::{run_cni, cmd_add, cmd_del, cmd_check};
