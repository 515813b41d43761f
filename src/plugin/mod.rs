//! VF attach and release.
//!
//! `SriovManager::setup_vf` moves a host VF netdev into a container
//! namespace and `release_vf` hands it back to the host. Both walk the same
//! ordered sequence (down, rename, move) and stop at the first failure,
//! leaving the link wherever the last successful step put it. Nothing is
//! rolled back; a retry re-resolves the link under its current name.

mod state;

pub use state::{Down, Migrated, Renamed, Resolved, Stage, Step, VfLink, VfState};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::NetConf;
use crate::netlink::{Link, LinkError, NetlinkManager};
use crate::netns::{NetNamespace, NetNs, NsError};

/// Errors returned by VF operations
#[derive(Debug, Error)]
pub enum SriovError {
    /// A link operation failed; `reached` is where the link was left
    #[error("VF {step} failed, link left {reached}")]
    Step {
        step: Step,
        reached: VfState,
        link: Option<Link>,
        #[source]
        source: LinkError,
    },

    /// Switching into or out of a namespace failed.
    ///
    /// `reached` is `None` when the switch back failed after the steps ran.
    /// `step` and `link` are then where the sequence ended, whether or not
    /// that step succeeded.
    #[error("network namespace switch failed during VF {step}")]
    Namespace {
        step: Step,
        reached: Option<VfState>,
        link: Option<Link>,
        #[source]
        source: NsError,
    },

    /// The container interface exists but is administratively down
    #[error("VF {0} is not up")]
    NotUp(Link),
}

impl SriovError {
    /// The step that failed
    pub fn step(&self) -> Option<Step> {
        match self {
            SriovError::Step { step, .. } | SriovError::Namespace { step, .. } => Some(*step),
            SriovError::NotUp(_) => None,
        }
    }

    /// Where the link was left, if known
    pub fn reached(&self) -> Option<VfState> {
        match self {
            SriovError::Step { reached, .. } => Some(*reached),
            SriovError::Namespace { reached, .. } => *reached,
            SriovError::NotUp(_) => Some(VfState::Finalized),
        }
    }

    /// Last known state of the link, if it was resolved
    pub fn link(&self) -> Option<&Link> {
        match self {
            SriovError::Step { link, .. } | SriovError::Namespace { link, .. } => link.as_ref(),
            SriovError::NotUp(link) => Some(link),
        }
    }

    /// Whether the orchestrator may retry without changing configuration
    pub fn is_retryable(&self) -> bool {
        match self {
            SriovError::Step { source, .. } => source.is_retryable(),
            SriovError::Namespace { .. } => true,
            SriovError::NotUp(_) => false,
        }
    }
}

/// Moves VFs between the host and container namespaces.
///
/// The manager keeps no per-VF state. Calls for different VFs may run in
/// parallel on separate threads; calls for the same VF must be serialized
/// by the caller.
pub struct SriovManager<N, H = NetNs> {
    nlink: N,
    host_ns: H,
}

impl<N: NetlinkManager> SriovManager<N, NetNs> {
    /// Create a manager that releases VFs into the caller's namespace
    pub fn for_current_ns(nlink: N) -> Result<Self, NsError> {
        Ok(Self::new(nlink, NetNs::current()?))
    }
}

impl<N, H> SriovManager<N, H>
where
    N: NetlinkManager,
    H: NetNamespace,
{
    /// Create a manager; released VFs are moved into `host_ns`
    pub fn new(nlink: N, host_ns: H) -> Self {
        Self { nlink, host_ns }
    }

    /// Link manager in use
    pub fn netlink(&self) -> &N {
        &self.nlink
    }

    /// Namespace released VFs are returned to
    pub fn host_ns(&self) -> &H {
        &self.host_ns
    }

    /// Move the host VF `conf.host_if_names` into `netns` as `pod_ifname`
    /// and bring it up.
    ///
    /// `_cid` identifies the requesting container for the caller's own
    /// bookkeeping and is not used here.
    pub fn setup_vf<T: NetNamespace>(
        &self,
        conf: &NetConf,
        pod_ifname: &str,
        _cid: &str,
        netns: &T,
    ) -> Result<Link, SriovError> {
        info!(
            "Attaching VF {} as {} in {}",
            conf.host_if_names,
            pod_ifname,
            netns.path().display()
        );

        let vf = VfLink::<Resolved>::resolve(&self.nlink, &conf.host_if_names)?
            .set_down(&self.nlink)?
            .rename(&self.nlink, pod_ifname)?
            .move_to(&self.nlink, netns)?;

        // Once moved, the link is only reachable from inside the target namespace
        let parked = vf.link().clone();
        run_steps(
            netns,
            (Step::SetUp, Some(VfState::Migrated), Some(parked)),
            Step::SetUp,
            || vf.set_up(&self.nlink),
        )
    }

    /// Return the container VF `pod_ifname` in `netns` to the host as
    /// `conf.host_if_names`, leaving it down.
    pub fn release_vf<T: NetNamespace>(
        &self,
        conf: &NetConf,
        pod_ifname: &str,
        _cid: &str,
        netns: &T,
    ) -> Result<Link, SriovError> {
        info!(
            "Releasing VF {} from {} as {}",
            pod_ifname,
            netns.path().display(),
            conf.host_if_names
        );

        run_steps(
            netns,
            (Step::Lookup, Some(VfState::Unresolved), None),
            Step::MoveNamespace,
            || {
                let vf = VfLink::<Resolved>::resolve(&self.nlink, pod_ifname)?
                    .set_down(&self.nlink)?
                    .rename(&self.nlink, &conf.host_if_names)?
                    .move_to(&self.nlink, &self.host_ns)?;
                Ok(vf.park())
            },
        )
    }

    /// Confirm `pod_ifname` exists in `netns` and is up
    pub fn check_vf<T: NetNamespace>(&self, pod_ifname: &str, netns: &T) -> Result<Link, SriovError> {
        let link = run_steps(
            netns,
            (Step::Lookup, Some(VfState::Unresolved), None),
            Step::Lookup,
            || VfLink::<Resolved>::resolve(&self.nlink, pod_ifname).map(|vf| vf.link().clone()),
        )?;

        if !link.admin_up {
            return Err(SriovError::NotUp(link));
        }
        Ok(link)
    }
}

/// Run a step sequence with the thread switched into `netns`.
///
/// If the switch in fails nothing ran and the error carries `entry`. If only
/// the switch back fails, the error carries the step and link the sequence
/// ended on, with `reached` unknown. `last` is the final step of a sequence
/// that completed.
fn run_steps<T, F>(
    netns: &T,
    entry: (Step, Option<VfState>, Option<Link>),
    last: Step,
    steps: F,
) -> Result<Link, SriovError>
where
    T: NetNamespace,
    F: FnOnce() -> Result<Link, SriovError>,
{
    let mut ended = None;
    let switched = netns.run_in(|| {
        let result = steps();
        ended = Some(match &result {
            Ok(link) => (last, Some(link.clone())),
            Err(e) => (e.step().unwrap_or(last), e.link().cloned()),
        });
        result
    });

    match switched {
        Ok(result) => result,
        Err(source) => {
            let (step, reached, link) = match ended {
                Some((step, link)) => (step, None, link),
                None => entry,
            };
            warn!(
                "VF {}: namespace switch for {} failed: {}",
                link.as_ref().map_or_else(|| "?".to_string(), Link::to_string),
                step,
                source
            );
            Err(SriovError::Namespace {
                step,
                reached,
                link,
                source,
            })
        }
    }
}
