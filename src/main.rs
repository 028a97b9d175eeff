use std::net::TcpListener;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use avmdbg::ui::dap::{DapApplication, SessionConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen on 127.0.0.1:<port>, serving one DAP session per TCP
    /// connection. Without it a single session runs over stdio.
    #[clap(long)]
    server: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    let logger = env_logger::Logger::from_default_env();
    let filter = logger.filter();
    avmdbg::log::LOGGER.switch(logger, filter);

    let args = Args::parse();

    let config = match SessionConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("avmdbg: {e:#}");
            std::process::exit(1);
        }
    };

    match args.server {
        Some(port) => {
            let addr = format!("127.0.0.1:{port}");
            let listener = TcpListener::bind(&addr).with_context(|| format!("bind {addr}"))?;
            info!("listening on {addr}");

            // Server mode: accept clients sequentially, one debug session each.
            loop {
                let (stream, peer) = match listener.accept() {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("accept failed: {err:#}");
                        continue;
                    }
                };
                info!("DAP client connected: {peer}");

                let input = match stream.try_clone() {
                    Ok(input) => input,
                    Err(err) => {
                        warn!("cannot clone client stream: {err:#}");
                        continue;
                    }
                };

                if let Err(err) = DapApplication::new(input, stream, config.clone()).run() {
                    warn!("session ended with error: {err:#}");
                }
                info!("DAP client disconnected: {peer}");
            }
        }
        None => DapApplication::new(std::io::stdin(), std::io::stdout(), config).run(),
    }
}
