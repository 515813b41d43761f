use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::io::{self, Read};
use tracing::info;

use crate::config::{validate_ifname, NetConf};
use crate::netlink::{LinkError, NetlinkManager, RtNetlink};
use crate::netns::{NetNamespace, NetNs};
use crate::plugin::{SriovError, SriovManager, Step};
use crate::types::{CmdArgs, Interface, Result as CniResult, VersionInfo};

/// Parse command arguments from environment
pub fn parse_args() -> Result<CmdArgs> {
    // Get required environment variables
    let container_id = env::var("CNI_CONTAINERID")
        .context("CNI_CONTAINERID not found in environment")?;

    // May be empty on DEL once the sandbox is gone
    let netns = env::var("CNI_NETNS").unwrap_or_default();

    let ifname = env::var("CNI_IFNAME")
        .context("CNI_IFNAME not found in environment")?;

    let path = env::var("CNI_PATH")
        .context("CNI_PATH not found in environment")?;

    // Get args (if any)
    let args_str = env::var("CNI_ARGS").unwrap_or_default();
    let args = parse_cni_args(&args_str);

    // Read stdin data
    let mut stdin_data = Vec::new();
    io::stdin().read_to_end(&mut stdin_data)
        .context("Failed to read from stdin")?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Parse CNI_ARGS string into key-value pairs
fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn new_manager() -> Result<SriovManager<RtNetlink>> {
    let nlink = RtNetlink::new()?;
    let manager = SriovManager::for_current_ns(nlink)
        .context("Failed to open host network namespace")?;
    Ok(manager)
}

fn open_netns(path: &str) -> Result<NetNs> {
    NetNs::open(path).with_context(|| format!("Failed to open netns {}", path))
}

/// Attach the configured VF to the container and build the CNI result
pub fn add_network<N, H, T>(
    manager: &SriovManager<N, H>,
    mut conf: NetConf,
    args: &CmdArgs,
    netns: &T,
) -> Result<CniResult>
where
    N: NetlinkManager,
    H: NetNamespace,
    T: NetNamespace,
{
    validate_ifname(&args.ifname).context("Invalid CNI_IFNAME")?;
    conf.cont_if_names = args.ifname.clone();

    manager
        .setup_vf(&conf, &args.ifname, &args.container_id, netns)
        .with_context(|| format!("Failed to set up VF {}", conf.host_if_names))?;

    let mut result = CniResult::new(&conf.cni_version);
    result.add_interface(Interface {
        name: args.ifname.clone(),
        mac: None,
        sandbox: Some(args.netns.clone()),
    });

    Ok(result)
}

/// Return the VF to the host. A VF that is no longer in the container counts
/// as already released.
///
/// A release that stopped at the namespace move leaves the VF down under its
/// host name inside the container, so a missing `CNI_IFNAME` is retried under
/// that name before giving up.
pub fn del_network<N, H, T>(
    manager: &SriovManager<N, H>,
    conf: &NetConf,
    args: &CmdArgs,
    netns: &T,
) -> Result<()>
where
    N: NetlinkManager,
    H: NetNamespace,
    T: NetNamespace,
{
    let mut released = manager.release_vf(conf, &args.ifname, &args.container_id, netns);
    if is_missing(&released) && conf.host_if_names != args.ifname {
        info!(
            "Interface {} not found in container, looking for {}",
            args.ifname, conf.host_if_names
        );
        released = manager.release_vf(conf, &conf.host_if_names, &args.container_id, netns);
    }

    match released {
        Ok(link) => {
            info!("Released VF {}", link);
            Ok(())
        }
        Err(SriovError::Step {
            source: LinkError::NotFound { name },
            ..
        }) => {
            info!("Interface {} not found in container, nothing to release", name);
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to release VF {}", args.ifname)),
    }
}

fn is_missing<T>(released: &std::result::Result<T, SriovError>) -> bool {
    matches!(
        released,
        Err(SriovError::Step {
            step: Step::Lookup,
            source: LinkError::NotFound { .. },
            ..
        })
    )
}

/// Verify the container interface is in place and up
pub fn check_network<N, H, T>(manager: &SriovManager<N, H>, args: &CmdArgs, netns: &T) -> Result<()>
where
    N: NetlinkManager,
    H: NetNamespace,
    T: NetNamespace,
{
    manager
        .check_vf(&args.ifname, netns)
        .with_context(|| format!("Interface {} failed check in container", args.ifname))?;
    Ok(())
}

/// Execute the add command
pub fn cmd_add() -> Result<()> {
    let args = parse_args()?;

    // Parse network configuration
    let conf = NetConf::parse(&args.stdin_data)?;

    let manager = new_manager()?;
    let netns = open_netns(&args.netns)?;
    let result = add_network(&manager, conf, &args, &netns)?;

    // Output result as JSON
    result.print()?;

    Ok(())
}

/// Execute the delete command
pub fn cmd_del() -> Result<()> {
    let args = parse_args()?;

    // Parse network configuration
    let conf = NetConf::parse(&args.stdin_data)?;

    if args.netns.is_empty() {
        info!("No netns given, nothing to release for {}", args.container_id);
        return Ok(());
    }

    // The VF went back to the host with the namespace
    let netns = match NetNs::open(&args.netns) {
        Ok(netns) => netns,
        Err(e) => {
            info!("Netns {} is gone ({}), nothing to release", args.netns, e);
            return Ok(());
        }
    };

    let manager = new_manager()?;
    del_network(&manager, &conf, &args, &netns)
}

/// Execute the check command
pub fn cmd_check() -> Result<()> {
    let args = parse_args()?;

    // Parse network configuration
    NetConf::parse(&args.stdin_data)?;

    let manager = new_manager()?;
    let netns = open_netns(&args.netns)?;
    check_network(&manager, &args, &netns)
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> Result<()> {
    // Get command from environment
    let cmd = env::var("CNI_COMMAND")
        .context("CNI_COMMAND not found in environment")?;

    // Execute the appropriate command
    match cmd.as_str() {
        "ADD" => cmd_add(),
        "DEL" => cmd_del(),
        "CHECK" => cmd_check(),
        "VERSION" => {
            println!("{}", serde_json::to_string(&VersionInfo::current())?);
            Ok(())
        },
        _ => anyhow::bail!("Unknown CNI command: {}", cmd),
    }
}
