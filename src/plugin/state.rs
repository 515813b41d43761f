//! Typed step sequence for moving a VF between namespaces.
//!
//! A `VfLink<S>` can only take the step that follows `S`:
//! down, rename, move, then either up (attach) or park (release).

use std::fmt;
use std::marker::PhantomData;

use tracing::{debug, warn};

use super::SriovError;
use crate::netlink::{Link, LinkError, NetlinkManager};
use crate::netns::NetNamespace;

/// Where a link stands in the migration sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfState {
    /// The link was never resolved
    Unresolved,
    Resolved,
    Down,
    Renamed,
    Migrated,
    Finalized,
}

impl fmt::Display for VfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VfState::Unresolved => "unresolved",
            VfState::Resolved => "resolved",
            VfState::Down => "down",
            VfState::Renamed => "renamed",
            VfState::Migrated => "migrated",
            VfState::Finalized => "finalized",
        };
        f.write_str(s)
    }
}

/// A single link operation in the sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Lookup,
    SetDown,
    Rename,
    MoveNamespace,
    SetUp,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Lookup => "lookup",
            Step::SetDown => "set down",
            Step::Rename => "rename",
            Step::MoveNamespace => "namespace move",
            Step::SetUp => "set up",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Resolved;
#[derive(Debug)]
pub struct Down;
#[derive(Debug)]
pub struct Renamed;
#[derive(Debug)]
pub struct Migrated;

/// Marker states a `VfLink` can be in
pub trait Stage {
    const STATE: VfState;
}

impl Stage for Resolved {
    const STATE: VfState = VfState::Resolved;
}

impl Stage for Down {
    const STATE: VfState = VfState::Down;
}

impl Stage for Renamed {
    const STATE: VfState = VfState::Renamed;
}

impl Stage for Migrated {
    const STATE: VfState = VfState::Migrated;
}

/// A link part way through the migration sequence
#[derive(Debug)]
pub struct VfLink<S> {
    link: Link,
    _stage: PhantomData<S>,
}

impl<S: Stage> VfLink<S> {
    fn new(link: Link) -> Self {
        Self {
            link,
            _stage: PhantomData,
        }
    }

    /// Last known state of the link
    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn state(&self) -> VfState {
        S::STATE
    }

    fn stall(self, step: Step, source: LinkError) -> SriovError {
        warn!(
            "VF {}: {} failed, link left {}: {}",
            self.link,
            step,
            S::STATE,
            source
        );
        SriovError::Step {
            step,
            reached: S::STATE,
            link: Some(self.link),
            source,
        }
    }

    fn advance<T: Stage>(self, step: Step, link: Link) -> VfLink<T> {
        debug!("VF {}: {} done, now {}", link, step, T::STATE);
        VfLink::new(link)
    }
}

impl VfLink<Resolved> {
    /// Look the link up by name
    pub fn resolve<N: NetlinkManager>(nlink: &N, name: &str) -> Result<Self, SriovError> {
        match nlink.link_by_name(name) {
            Ok(link) => {
                debug!("VF {}: resolved", link);
                Ok(Self::new(link))
            }
            Err(source) => {
                warn!("VF {}: lookup failed: {}", name, source);
                Err(SriovError::Step {
                    step: Step::Lookup,
                    reached: VfState::Unresolved,
                    link: None,
                    source,
                })
            }
        }
    }

    pub fn set_down<N: NetlinkManager>(self, nlink: &N) -> Result<VfLink<Down>, SriovError> {
        match nlink.link_set_down(&self.link) {
            Ok(()) => {
                let link = Link {
                    admin_up: false,
                    ..self.link.clone()
                };
                Ok(self.advance(Step::SetDown, link))
            }
            Err(e) => Err(self.stall(Step::SetDown, e)),
        }
    }
}

impl VfLink<Down> {
    pub fn rename<N: NetlinkManager>(
        self,
        nlink: &N,
        name: &str,
    ) -> Result<VfLink<Renamed>, SriovError> {
        match nlink.link_set_name(&self.link, name) {
            Ok(()) => {
                let link = Link {
                    name: name.to_string(),
                    ..self.link.clone()
                };
                Ok(self.advance(Step::Rename, link))
            }
            Err(e) => Err(self.stall(Step::Rename, e)),
        }
    }
}

impl VfLink<Renamed> {
    pub fn move_to<N, T>(self, nlink: &N, netns: &T) -> Result<VfLink<Migrated>, SriovError>
    where
        N: NetlinkManager,
        T: NetNamespace,
    {
        match nlink.link_set_ns_fd(&self.link, netns.fd()) {
            Ok(()) => {
                let link = self.link.clone();
                Ok(self.advance(Step::MoveNamespace, link))
            }
            Err(e) => Err(self.stall(Step::MoveNamespace, e)),
        }
    }
}

impl VfLink<Migrated> {
    /// Bring the link up, finishing an attach
    pub fn set_up<N: NetlinkManager>(self, nlink: &N) -> Result<Link, SriovError> {
        match nlink.link_set_up(&self.link) {
            Ok(()) => {
                let link = Link {
                    admin_up: true,
                    ..self.link
                };
                debug!("VF {}: {} done, now {}", link, Step::SetUp, VfState::Finalized);
                Ok(link)
            }
            Err(e) => Err(self.stall(Step::SetUp, e)),
        }
    }

    /// Leave the link down, finishing a release
    pub fn park(self) -> Link {
        debug!("VF {}: left down, now {}", self.link, VfState::Finalized);
        self.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::mock::{FakeNs, MockNetlink, Op};

    #[test]
    fn test_full_sequence_tracks_link() {
        let mock = MockNetlink::new().with_link(1000, "ib1");
        let ns = FakeNs::new(42);

        let vf = VfLink::<Resolved>::resolve(&mock, "ib1").unwrap();
        assert_eq!(vf.state(), VfState::Resolved);
        let vf = vf.set_down(&mock).unwrap();
        assert!(!vf.link().admin_up);
        let vf = vf.rename(&mock, "net1").unwrap();
        assert_eq!(vf.link().name, "net1");
        let vf = vf.move_to(&mock, &ns).unwrap();
        assert_eq!(vf.state(), VfState::Migrated);

        let link = ns.run_in(|| vf.set_up(&mock)).unwrap().unwrap();
        assert!(link.admin_up);
        assert_eq!(link.index, 1000);
    }

    #[test]
    fn test_stall_reports_last_state() {
        let mock = MockNetlink::new()
            .with_link(1000, "ib1")
            .fail_on(Op::LinkSetName, "failed");

        let vf = VfLink::<Resolved>::resolve(&mock, "ib1").unwrap().set_down(&mock).unwrap();
        let err = vf.rename(&mock, "net1").unwrap_err();

        assert_eq!(err.step(), Some(Step::Rename));
        assert_eq!(err.reached(), Some(VfState::Down));
        let link = err.link().unwrap();
        assert_eq!(link.name, "ib1");
        assert!(!link.admin_up);
    }

    #[test]
    fn test_display() {
        assert_eq!(Step::MoveNamespace.to_string(), "namespace move");
        assert_eq!(VfState::Renamed.to_string(), "renamed");
    }
}
