use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{FmtSubscriber, EnvFilter};

use ib_sriov_cni::config::{validate_ifname, Installer, NetConf, PluginConfig};
use ib_sriov_cni::netlink::{NetlinkManager, RtNetlink};
use ib_sriov_cni::netns::{NetNamespace, NetNs};
use ib_sriov_cni::plugin::SriovManager;

/// A command line tool to manage InfiniBand SR-IOV VF attachments
#[derive(Parser)]
#[command(name = "ib-sriov-ctl", author, version, about)]
struct Cli {
    /// Path to plugin config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a VF network configuration
    Generate {
        /// PF interface the VF belongs to
        #[arg(long)]
        master: Option<String>,

        /// PCI address of the VF
        #[arg(long)]
        device_id: String,

        /// VF index on the PF
        #[arg(long, default_value_t = 0)]
        vf: u32,

        /// VF interface name on the host
        #[arg(long)]
        host_if: String,

        /// Network name
        #[arg(long, default_value = "ib-sriov-network")]
        name: String,

        /// Output file path
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Move a host VF into a network namespace by hand
    Attach {
        /// Network namespace path
        #[arg(long)]
        netns: PathBuf,

        /// VF interface name on the host
        #[arg(long)]
        host_if: String,

        /// Interface name inside the namespace
        #[arg(long)]
        ifname: String,
    },

    /// Return a VF from a network namespace to the host by hand
    Detach {
        /// Network namespace path
        #[arg(long)]
        netns: PathBuf,

        /// Interface name inside the namespace
        #[arg(long)]
        ifname: String,

        /// Name to give the VF on the host
        #[arg(long)]
        host_if: String,
    },

    /// Show an interface's state
    Status {
        /// Interface name
        #[arg(long)]
        ifname: String,

        /// Network namespace path, host namespace if omitted
        #[arg(long)]
        netns: Option<PathBuf>,
    },

    /// Install the CNI directories and default network list
    Install {
        /// Host VF interface for the default network list
        #[arg(long)]
        host_if: Option<String>,

        /// Skip confirmation
        #[arg(long)]
        yes: bool,
    },
}

fn manual_conf(host_if: &str, ifname: &str) -> Result<NetConf> {
    validate_ifname(host_if).context("Invalid --host-if")?;
    validate_ifname(ifname).context("Invalid --ifname")?;

    let mut conf = NetConf::new_default("manual", "", "", 0, host_if);
    conf.cont_if_names = ifname.to_string();
    Ok(conf)
}

fn new_manager() -> Result<SriovManager<RtNetlink>> {
    let manager = SriovManager::for_current_ns(RtNetlink::new()?)
        .context("Failed to open host network namespace")?;
    Ok(manager)
}

fn print_status(nlink: &RtNetlink, ifname: &str, netns: Option<&Path>) -> Result<()> {
    let link = match netns {
        Some(path) => {
            let ns = NetNs::open(path)?;
            ns.run_in(|| nlink.link_by_name(ifname))??
        }
        None => nlink.link_by_name(ifname)?,
    };

    println!("Interface {}:", link.name);
    println!("  Index: {}", link.index);
    println!("  Admin state: {}", if link.admin_up { "up" } else { "down" });
    if let Some(path) = netns {
        println!("  Netns: {}", path.display());
    }
    Ok(())
}

fn run_install(config: PluginConfig, yes: bool) -> Result<()> {
    if !yes {
        println!("This will create {} and {}.", config.cni_bin_dir.display(), config.cni_conf_dir.display());
        println!("You may need root privileges to complete this operation.");
        println!("Continue? [y/N]");

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Installation aborted.");
            return Ok(());
        }
    }

    let path = Installer::new(config).install()?;
    println!("Network configuration written to {}", path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configure logging based on verbosity
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default subscriber")?;

    let config = match &cli.config {
        Some(path) => PluginConfig::load(path)?,
        None => PluginConfig::default(),
    };

    match cli.command {
        Commands::Generate { master, device_id, vf, host_if, name, output } => {
            validate_ifname(&host_if).context("Invalid --host-if")?;
            let master = master.unwrap_or_else(|| config.default_master.clone());
            let conf = NetConf::new_default(&name, &master, &device_id, vf, &host_if);

            if let Some(path) = output {
                conf.save(&path)?;
                println!("Network configuration written to {}", path.display());
            } else {
                println!("{}", serde_json::to_string_pretty(&conf)?);
            }
        },

        Commands::Attach { netns, host_if, ifname } => {
            let conf = manual_conf(&host_if, &ifname)?;
            let ns = NetNs::open(&netns)?;
            let link = new_manager()?.setup_vf(&conf, &ifname, "ib-sriov-ctl", &ns)?;
            info!("Attached {} to {}", link, netns.display());
            println!("VF {} attached as {} in {}", host_if, ifname, netns.display());
        },

        Commands::Detach { netns, ifname, host_if } => {
            let conf = manual_conf(&host_if, &ifname)?;
            let ns = NetNs::open(&netns)?;
            let link = new_manager()?.release_vf(&conf, &ifname, "ib-sriov-ctl", &ns)?;
            info!("Released {} from {}", link, netns.display());
            println!("VF {} returned to host as {}", ifname, host_if);
        },

        Commands::Status { ifname, netns } => {
            print_status(&RtNetlink::new()?, &ifname, netns.as_deref())?;
        },

        Commands::Install { host_if, yes } => {
            let mut config = config;
            if let Some(host_if) = host_if {
                config.default_host_if = host_if;
            }
            run_install(config, yes)?;
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_attach() {
        let cli = Cli::try_parse_from([
            "ib-sriov-ctl", "attach", "--netns", "/var/run/netns/pod", "--host-if", "ib1", "--ifname", "net1",
        ])
        .unwrap();

        match cli.command {
            Commands::Attach { netns, host_if, ifname } => {
                assert_eq!(netns, PathBuf::from("/var/run/netns/pod"));
                assert_eq!(host_if, "ib1");
                assert_eq!(ifname, "net1");
            }
            _ => panic!("expected attach"),
        }
    }

    #[test]
    fn test_cli_parses_install_host_if() {
        let cli = Cli::try_parse_from(["ib-sriov-ctl", "install", "--host-if", "ib4", "--yes"]).unwrap();

        match cli.command {
            Commands::Install { host_if, yes } => {
                assert_eq!(host_if.as_deref(), Some("ib4"));
                assert!(yes);
            }
            _ => panic!("expected install"),
        }
    }

    #[test]
    fn test_manual_conf() {
        let conf = manual_conf("ib1", "net1").unwrap();
        assert_eq!(conf.host_if_names, "ib1");
        assert_eq!(conf.cont_if_names, "net1");
        assert!(manual_conf("ib1", "").is_err());
    }

    #[test]
    fn test_generate_writes_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ib.conf");
        NetConf::new_default("n", "ib0", "0000:af:06.0", 2, "ib3").save(&path)?;
        let conf = NetConf::parse(&std::fs::read(&path)?)?;
        assert_eq!(conf.vf_id, 2);
        Ok(())
    }
}
