//! Standalone service directory daemon.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the standard qi port
//! qibus-directory --addr tcp://0.0.0.0:9559
//!
//! # TLS with a certificate configuration file
//! QILOOP_CERT_CONF=/etc/qibus/cert.conf qibus-directory --addr tcps://0.0.0.0:9443
//! ```

use std::sync::Arc;

use clap::Parser;
use qibus_server::{PermissiveAuthenticator, Server};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// qi-messaging service directory
#[derive(Parser, Debug)]
#[command(name = "qibus-directory")]
#[command(about = "qi-messaging service directory daemon")]
#[command(version)]
struct Args {
    /// Listen URL (tcp://, tcps://, quic://, unix:///, pipe:///)
    #[arg(long, default_value = "tcp://0.0.0.0:9559")]
    addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let server = Server::bind_directory(&args.addr, Arc::new(PermissiveAuthenticator)).await?;
    tracing::info!("service directory listening on {}", server.url());

    server.run().await?;
    Ok(())
}
