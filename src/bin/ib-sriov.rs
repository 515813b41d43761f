use anyhow::Result;
use tracing_subscriber::{FmtSubscriber, EnvFilter};
use tracing::{error, Level};
use ib_sriov_cni::commands::run_cni;
use ib_sriov_cni::types::Error as CniError;

fn main() -> Result<()> {
    // Set up tracing; stdout carries the CNI result
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    // Run the CNI plugin
    if let Err(err) = run_cni() {
        error!("CNI plugin error: {:#}", err);

        // Output error in CNI format
        let error_msg = serde_json::to_string(&CniError::from_anyhow(&err))?;
        println!("{}", error_msg);
        std::process::exit(1);
    }

    Ok(())
}
