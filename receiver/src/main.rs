//! Example consumer: attaches to the segment, waits for the queue to appear
//! (the sender may not have created it yet), then drains messages in order.

use std::error::Error;
use std::thread;
use std::time::Duration;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};

#[derive(Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "mf-receiver.toml")]
    config: String,
    #[clap(short = 'q', long = "queue", default_value = "mq1")]
    queue: String,
    #[clap(short = 'n', long = "count", default_value_t = 10)]
    count: usize,
    #[clap(long = "bufsize", default_value_t = 1024)]
    bufsize: usize,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ReceiverConfig {
    mf: mf::MfConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt().init();
    let opts: Opts = Opts::parse();
    let cfg: ReceiverConfig = confy::load_path(&opts.config)?;
    cfg.mf.validate()?;

    let mut session = mf::connect(&cfg.mf)?;
    let qid = loop {
        match session.open(&opts.queue) {
            Ok(qid) => break qid,
            Err(mf::MfError::NotFound) => thread::sleep(Duration::from_millis(100)),
            Err(e) => return Err(Box::new(e)),
        }
    };
    tracing::debug!("queue {:?} opened as qid {}", opts.queue, qid);

    let mut buf = vec![0u8; opts.bufsize];
    for _ in 0..opts.count {
        let n = session.recv(qid, &mut buf)?;
        println!("{}", String::from_utf8_lossy(&buf[..n]));
    }

    session.close(qid)?;
    session.disconnect()?;
    Ok(())
}
