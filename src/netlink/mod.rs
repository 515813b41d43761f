//! Host link operations.
//!
//! `NetlinkManager` is the only surface the plugin uses to touch network
//! interfaces: lookup by name, admin state, rename and namespace moves.
//! `RtNetlink` talks to the kernel, `mock::MockNetlink` records calls for
//! tests.

pub mod mock;

use std::fmt;
use std::future::Future;
use std::os::unix::io::RawFd;

use futures::TryStreamExt;
use nix::errno::Errno;
use rtnetlink::packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
use rtnetlink::{new_connection, Handle, LinkUnspec};
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tracing::trace;

/// Boxed error returned by the underlying link primitive.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors reported by a link operation
#[derive(Debug, Error)]
pub enum LinkError {
    /// No link with the requested name exists in the current namespace
    #[error("link {name} not found")]
    NotFound { name: String },

    /// The kernel rejected the operation
    #[error("{op} failed: {source}")]
    System {
        op: &'static str,
        #[source]
        source: BoxError,
    },
}

impl LinkError {
    /// Wrap a primitive failure for the named operation
    pub fn system<E>(op: &'static str, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        LinkError::System {
            op,
            source: source.into(),
        }
    }

    /// Whether retrying the same request may succeed without reconfiguration
    pub fn is_retryable(&self) -> bool {
        matches!(self, LinkError::System { .. })
    }
}

/// A resolved network interface.
///
/// `index` is the identity of the link once resolved; `name` and
/// `admin_up` reflect the last state this process observed or set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Kernel interface index
    pub index: u32,
    /// Current interface name
    pub name: String,
    /// Administrative state
    pub admin_up: bool,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (index {})", self.name, self.index)
    }
}

/// Minimal set of link operations needed to migrate a VF.
///
/// Implementations are pass-through: no retries and no caching. Everything
/// after `link_by_name` addresses the link by `Link::index`.
pub trait NetlinkManager {
    /// Resolve a link by name in the calling thread's namespace
    fn link_by_name(&self, name: &str) -> Result<Link, LinkError>;

    /// Set the link administratively down
    fn link_set_down(&self, link: &Link) -> Result<(), LinkError>;

    /// Set the link administratively up
    fn link_set_up(&self, link: &Link) -> Result<(), LinkError>;

    /// Rename the link
    fn link_set_name(&self, link: &Link, name: &str) -> Result<(), LinkError>;

    /// Move the link into the namespace referred to by `ns_fd`
    fn link_set_ns_fd(&self, link: &Link, ns_fd: RawFd) -> Result<(), LinkError>;
}

/// Kernel-backed link manager using rtnetlink.
///
/// Each call opens its own netlink socket, so requests land in whatever
/// namespace the calling thread is in at that moment. The runtime is
/// current-thread and only driven from inside a call, which keeps every
/// operation blocking on the caller's thread.
pub struct RtNetlink {
    runtime: Runtime,
}

impl RtNetlink {
    /// Create a new kernel link manager
    pub fn new() -> Result<Self, LinkError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| LinkError::system("create netlink runtime", e))?;

        Ok(Self { runtime })
    }

    fn exec<T, F, Fut>(&self, op: &'static str, request: F) -> Result<T, LinkError>
    where
        F: FnOnce(Handle) -> Fut,
        Fut: Future<Output = Result<T, LinkError>>,
    {
        self.runtime.block_on(async {
            let (connection, handle, _) =
                new_connection().map_err(|e| LinkError::system(op, e))?;
            let conn_task = tokio::spawn(connection);

            let result = request(handle).await;
            conn_task.abort();
            result
        })
    }
}

fn link_from_message(msg: LinkMessage) -> Link {
    let name = msg
        .attributes
        .iter()
        .find_map(|attr| match attr {
            LinkAttribute::IfName(name) => Some(name.clone()),
            _ => None,
        })
        .unwrap_or_default();

    Link {
        index: msg.header.index,
        name,
        admin_up: msg.header.flags.contains(LinkFlags::Up),
    }
}

fn is_no_device(err: &rtnetlink::Error) -> bool {
    match err {
        rtnetlink::Error::NetlinkError(msg) => {
            msg.to_io().raw_os_error() == Some(Errno::ENODEV as i32)
        }
        _ => false,
    }
}

impl NetlinkManager for RtNetlink {
    fn link_by_name(&self, name: &str) -> Result<Link, LinkError> {
        trace!("netlink: get link {}", name);
        self.exec("get link", |handle| async move {
            let mut links = handle.link().get().match_name(name.to_string()).execute();
            match links.try_next().await {
                Ok(Some(msg)) => Ok(link_from_message(msg)),
                Ok(None) => Err(LinkError::NotFound {
                    name: name.to_string(),
                }),
                Err(e) if is_no_device(&e) => Err(LinkError::NotFound {
                    name: name.to_string(),
                }),
                Err(e) => Err(LinkError::system("get link", e)),
            }
        })
    }

    fn link_set_down(&self, link: &Link) -> Result<(), LinkError> {
        trace!("netlink: set {} down", link);
        let index = link.index;
        self.exec("set link down", |handle| async move {
            handle
                .link()
                .set(LinkUnspec::new_with_index(index).down().build())
                .execute()
                .await
                .map_err(|e| LinkError::system("set link down", e))
        })
    }

    fn link_set_up(&self, link: &Link) -> Result<(), LinkError> {
        trace!("netlink: set {} up", link);
        let index = link.index;
        self.exec("set link up", |handle| async move {
            handle
                .link()
                .set(LinkUnspec::new_with_index(index).up().build())
                .execute()
                .await
                .map_err(|e| LinkError::system("set link up", e))
        })
    }

    fn link_set_name(&self, link: &Link, name: &str) -> Result<(), LinkError> {
        trace!("netlink: rename {} to {}", link, name);
        let index = link.index;
        let name = name.to_string();
        self.exec("rename link", |handle| async move {
            handle
                .link()
                .set(LinkUnspec::new_with_index(index).name(name).build())
                .execute()
                .await
                .map_err(|e| LinkError::system("rename link", e))
        })
    }

    fn link_set_ns_fd(&self, link: &Link, ns_fd: RawFd) -> Result<(), LinkError> {
        trace!("netlink: move {} to netns fd {}", link, ns_fd);
        let index = link.index;
        self.exec("move link to netns", |handle| async move {
            handle
                .link()
                .set(LinkUnspec::new_with_index(index).setns_by_fd(ns_fd).build())
                .execute()
                .await
                .map_err(|e| LinkError::system("move link to netns", e))
        })
    }
}
