use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use wireforge::common;
use wireforge::config::{Config, TlsConfig};
use wireforge::server::Server;

/// Craft precise, reproducible, deliberately unusual HTTP responses.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address to listen on; port 0 picks any free port
    #[arg(short, long, default_value = "127.0.0.1:9999")]
    addr: SocketAddr,
    /// TLS certificate file (PEM)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,
    /// TLS private key file (PEM)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
    /// Path prefix under which response crafting is anchored
    #[arg(long, default_value = "/p/")]
    craft_anchor: String,
    /// Directory of static resources
    #[arg(long)]
    staticdir: Option<PathBuf>,
    /// Anchor of the form pattern=spec; may be repeated
    #[arg(short = 'A', long = "anchor", value_parser = parse_anchor)]
    anchors: Vec<(String, String)>,
    /// Limit the size of served responses, in bytes
    #[arg(long)]
    sizelimit: Option<u64>,
    /// Disable the web interface
    #[arg(long)]
    noweb: bool,
    /// Disable response crafting
    #[arg(long)]
    nocraft: bool,
    /// Disable the API and the transaction log
    #[arg(long)]
    noapi: bool,
    /// Disable pauses
    #[arg(long)]
    nohang: bool,
    /// Idle timeout for reads, in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Log raw request bytes
    #[arg(long)]
    logreq: bool,
    /// Log raw response bytes
    #[arg(long)]
    logresp: bool,
    /// Render byte logs as hex dumps
    #[arg(long)]
    hexdump: bool,
}

fn parse_anchor(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(pattern, spec)| (pattern.to_string(), spec.to_string()))
        .ok_or_else(|| "expected pattern=spec".to_string())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    common::initialize_logging();
    let args = Args::parse();

    let config = Config {
        addr: args.addr,
        tls: match (args.cert, args.key) {
            (Some(certfile), Some(keyfile)) => Some(TlsConfig { certfile, keyfile }),
            _ => None,
        },
        craft_anchor: args.craft_anchor,
        staticdir: args.staticdir,
        anchors: args.anchors,
        sizelimit: args.sizelimit,
        noweb: args.noweb,
        nocraft: args.nocraft,
        noapi: args.noapi,
        nohang: args.nohang,
        timeout: args.timeout.map(Duration::from_secs),
        logreq: args.logreq,
        logresp: args.logresp,
        hexdump: args.hexdump,
    };

    let server = Server::new(config)?;
    let listener = server.bind().await?;
    server.serve(listener).await
}
