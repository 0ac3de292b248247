//! The segment-owning daemon: creates the shared segment, then idles until a
//! termination signal, at which point it unlinks the backing object so no
//! stale segment survives.

use std::error::Error;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

#[derive(Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "mfserver.toml")]
    config: String,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ServerConfig {
    mf: mf::MfConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt().init();
    let opts: Opts = Opts::parse();
    let cfg: ServerConfig = confy::load_path(&opts.config)?;
    cfg.mf.validate()?;

    let session = mf::init(&cfg.mf)?;
    tracing::info!(
        "mfserver pid={} serving segment {:?} ({} bytes)",
        std::process::id(),
        cfg.mf.shmem_name,
        cfg.mf.shmem_size
    );

    let mut signals = Signals::new([SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    if let Some(signal) = signals.forever().next() {
        tracing::info!("signal {} received, tearing the segment down", signal);
    }
    session.destroy()?;
    Ok(())
}
