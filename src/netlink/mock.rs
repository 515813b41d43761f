//! Recording test doubles for `NetlinkManager` and `NetNamespace`.
//!
//! `MockNetlink` keeps a small in-memory link table, applies every
//! successful operation to it and records each call in order. Any operation
//! can be made to fail with `fail_on`.
//!
//! Links live in a namespace keyed by descriptor. `FakeNs::run_in` switches
//! the calling thread's current namespace, and every operation only sees
//! links in that namespace, the way a netlink socket would.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;

use super::{Link, LinkError, NetlinkManager};
use crate::netns::{NetNamespace, NsError};

thread_local! {
    static CURRENT_NS: Cell<Option<RawFd>> = Cell::new(None);
}

/// Namespace the calling thread is in, `None` for the one it started in
pub fn current_ns() -> Option<RawFd> {
    CURRENT_NS.with(Cell::get)
}

/// Link operations, used to select a failure and to count calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    LinkByName,
    LinkSetDown,
    LinkSetUp,
    LinkSetName,
    LinkSetNsFd,
}

/// A recorded call with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    LinkByName(String),
    LinkSetDown(u32),
    LinkSetUp(u32),
    LinkSetName(u32, String),
    LinkSetNsFd(u32, RawFd),
}

impl Call {
    /// The operation this call invoked
    pub fn op(&self) -> Op {
        match self {
            Call::LinkByName(_) => Op::LinkByName,
            Call::LinkSetDown(_) => Op::LinkSetDown,
            Call::LinkSetUp(_) => Op::LinkSetUp,
            Call::LinkSetName(..) => Op::LinkSetName,
            Call::LinkSetNsFd(..) => Op::LinkSetNsFd,
        }
    }
}

/// State of a link held by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockLink {
    pub index: u32,
    pub name: String,
    pub admin_up: bool,
    /// Namespace holding the link, `None` for the one the test started in
    pub netns: Option<RawFd>,
}

/// In-memory `NetlinkManager` that records every call
#[derive(Debug, Default)]
pub struct MockNetlink {
    links: RefCell<Vec<MockLink>>,
    calls: RefCell<Vec<Call>>,
    failures: RefCell<HashMap<Op, String>>,
}

impl MockNetlink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host link that is administratively up
    pub fn with_link(self, index: u32, name: &str) -> Self {
        self.add_link(index, name, None)
    }

    /// Add a link that is administratively up inside namespace `ns_fd`
    pub fn with_link_in(self, index: u32, name: &str, ns_fd: RawFd) -> Self {
        self.add_link(index, name, Some(ns_fd))
    }

    fn add_link(self, index: u32, name: &str, netns: Option<RawFd>) -> Self {
        self.links.borrow_mut().push(MockLink {
            index,
            name: name.to_string(),
            admin_up: true,
            netns,
        });
        self
    }

    /// Make every call to `op` fail with `msg`
    pub fn fail_on(self, op: Op, msg: &str) -> Self {
        self.failures.borrow_mut().insert(op, msg.to_string());
        self
    }

    /// Let `op` succeed again
    pub fn clear_failure(&self, op: Op) {
        self.failures.borrow_mut().remove(&op);
    }

    /// All calls so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    /// Operations invoked so far, in order
    pub fn ops(&self) -> Vec<Op> {
        self.calls.borrow().iter().map(Call::op).collect()
    }

    /// Number of times `op` was invoked
    pub fn count(&self, op: Op) -> usize {
        self.calls.borrow().iter().filter(|c| c.op() == op).count()
    }

    /// Current state of the link with `index`
    pub fn link(&self, index: u32) -> Option<MockLink> {
        self.links
            .borrow()
            .iter()
            .find(|l| l.index == index)
            .cloned()
    }

    /// Index of the link currently called `name` in any namespace, without
    /// recording a call
    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.links
            .borrow()
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.index)
    }

    fn record(&self, call: Call) -> Result<(), LinkError> {
        let op = call.op();
        self.calls.borrow_mut().push(call);
        let failure = self.failures.borrow().get(&op).cloned();
        match failure {
            Some(msg) => Err(LinkError::system(op_name(op), msg)),
            None => Ok(()),
        }
    }

    fn update<F>(&self, op: Op, link: &Link, f: F) -> Result<(), LinkError>
    where
        F: FnOnce(&mut MockLink) -> Result<(), LinkError>,
    {
        let ns = current_ns();
        let mut links = self.links.borrow_mut();
        let entry = links
            .iter_mut()
            .find(|l| l.index == link.index && l.netns == ns)
            .ok_or_else(|| LinkError::system(op_name(op), "No such device"))?;
        f(entry)
    }
}

fn op_name(op: Op) -> &'static str {
    match op {
        Op::LinkByName => "get link",
        Op::LinkSetDown => "set link down",
        Op::LinkSetUp => "set link up",
        Op::LinkSetName => "rename link",
        Op::LinkSetNsFd => "move link to netns",
    }
}

impl NetlinkManager for MockNetlink {
    fn link_by_name(&self, name: &str) -> Result<Link, LinkError> {
        self.record(Call::LinkByName(name.to_string()))?;
        let ns = current_ns();
        self.links
            .borrow()
            .iter()
            .find(|l| l.name == name && l.netns == ns)
            .map(|l| Link {
                index: l.index,
                name: l.name.clone(),
                admin_up: l.admin_up,
            })
            .ok_or_else(|| LinkError::NotFound {
                name: name.to_string(),
            })
    }

    fn link_set_down(&self, link: &Link) -> Result<(), LinkError> {
        self.record(Call::LinkSetDown(link.index))?;
        self.update(Op::LinkSetDown, link, |l| {
            l.admin_up = false;
            Ok(())
        })
    }

    fn link_set_up(&self, link: &Link) -> Result<(), LinkError> {
        self.record(Call::LinkSetUp(link.index))?;
        self.update(Op::LinkSetUp, link, |l| {
            l.admin_up = true;
            Ok(())
        })
    }

    fn link_set_name(&self, link: &Link, name: &str) -> Result<(), LinkError> {
        self.record(Call::LinkSetName(link.index, name.to_string()))?;
        let ns = current_ns();
        let taken = self
            .links
            .borrow()
            .iter()
            .any(|l| l.name == name && l.netns == ns && l.index != link.index);
        if taken {
            return Err(LinkError::system("rename link", "File exists"));
        }
        self.update(Op::LinkSetName, link, |l| {
            if l.admin_up {
                return Err(LinkError::system("rename link", "Device or resource busy"));
            }
            l.name = name.to_string();
            Ok(())
        })
    }

    fn link_set_ns_fd(&self, link: &Link, ns_fd: RawFd) -> Result<(), LinkError> {
        self.record(Call::LinkSetNsFd(link.index, ns_fd))?;
        self.update(Op::LinkSetNsFd, link, |l| {
            if l.admin_up {
                return Err(LinkError::system(
                    "move link to netns",
                    "Device or resource busy",
                ));
            }
            l.netns = Some(ns_fd);
            Ok(())
        })
    }
}

/// Namespace handle that never touches the kernel
#[derive(Debug)]
pub struct FakeNs {
    fd: RawFd,
    path: PathBuf,
    entered: Cell<usize>,
    fail_enter: bool,
    fail_restore: bool,
}

impl FakeNs {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            path: PathBuf::from(format!("/var/run/netns/fake-{}", fd)),
            entered: Cell::new(0),
            fail_enter: false,
            fail_restore: false,
        }
    }

    /// A namespace that cannot be entered
    pub fn unenterable(fd: RawFd) -> Self {
        Self {
            fail_enter: true,
            ..Self::new(fd)
        }
    }

    /// A namespace that can be entered but reports a failed switch back
    /// after running the closure
    pub fn stranding(fd: RawFd) -> Self {
        Self {
            fail_restore: true,
            ..Self::new(fd)
        }
    }

    /// How many times `run_in` switched into this namespace
    pub fn entered(&self) -> usize {
        self.entered.get()
    }
}

impl NetNamespace for FakeNs {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn run_in<T, F>(&self, f: F) -> Result<T, NsError>
    where
        F: FnOnce() -> T,
    {
        if self.fail_enter {
            return Err(NsError::Enter {
                path: self.path.clone(),
                source: Errno::EBADF,
            });
        }
        self.entered.set(self.entered.get() + 1);

        let origin = CURRENT_NS.with(|ns| ns.replace(Some(self.fd)));
        let result = f();
        CURRENT_NS.with(|ns| ns.set(origin));

        if self.fail_restore {
            return Err(NsError::Restore {
                source: Errno::EPERM,
            });
        }
        Ok(result)
    }
}
