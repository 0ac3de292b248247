//! Example producer: attaches to a running mfserver's segment, opens (or
//! creates) a queue, and pushes a run of numbered messages through it.

use std::error::Error;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};

#[derive(Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "mf-sender.toml")]
    config: String,
    #[clap(short = 'q', long = "queue", default_value = "mq1")]
    queue: String,
    #[clap(long = "capacity", default_value_t = 4096)]
    capacity: usize,
    #[clap(short = 'n', long = "count", default_value_t = 10)]
    count: usize,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct SenderConfig {
    mf: mf::MfConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt().init();
    let opts: Opts = Opts::parse();
    let cfg: SenderConfig = confy::load_path(&opts.config)?;
    cfg.mf.validate()?;

    let mut session = mf::connect(&cfg.mf)?;
    let qid = match session.open(&opts.queue) {
        Ok(qid) => qid,
        Err(mf::MfError::NotFound) => {
            session.create(&opts.queue, opts.capacity)?;
            session.open(&opts.queue)?
        }
        Err(e) => return Err(Box::new(e)),
    };

    for i in 0..opts.count {
        let payload = format!("message-{:04}", i);
        session.send(qid, payload.as_bytes())?;
        tracing::debug!("sent {:?}", payload);
    }

    let stats = session.stats(qid)?;
    println!(
        "sent {} messages to {:?}; {} pending in {}/{} bytes",
        opts.count, opts.queue, stats.pending, stats.used_bytes, stats.capacity
    );

    session.close(qid)?;
    session.disconnect()?;
    Ok(())
}
