//! dnsway - HTTP proxy over a DNS tunnel
//!
//! `dnsway client` runs the loopback HTTP proxy (and optionally the DNS relay);
//! `dnsway server` answers tunnel queries and forwards each session to an HTTP proxy.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dnsway::relay::detect_system_resolver;
use dnsway::{
    AcceptedSession, DnswayConfig, DownstreamMode, OtpAuthorizer, ProxyFrontEnd, RecursiveRelay,
    ServerConfig, TunnelContext, TunnelGuard, TunnelResponder, UdpExchange,
};

#[derive(Parser)]
#[command(name = "dnsway")]
#[command(author = "Sina Rabbani")]
#[command(version)]
#[command(long_version = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
))]
#[command(about = "HTTP proxy over a DNS tunnel", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TunnelArgs {
    /// Tunnel domain the responder is authoritative for
    #[arg(long)]
    domain: Option<String>,

    /// Shared secret for one-time authorization codes
    #[arg(long, env = "DNSWAY_SECRET", hide_env_values = true)]
    secret: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the local HTTP proxy
    Client {
        #[command(flatten)]
        tunnel: TunnelArgs,

        /// Proxy listen port on 127.0.0.1
        #[arg(short, long)]
        port: Option<u16>,

        /// Recursive resolver for tunnel queries (default: auto-detect)
        #[arg(long)]
        resolver: Option<SocketAddr>,

        /// Run the loopback DNS relay
        #[arg(long)]
        enable_relay: bool,

        /// DNS relay listen address
        #[arg(long)]
        relay_listen: Option<SocketAddr>,

        /// Use TXT answers downstream instead of CNAME targets
        #[arg(long)]
        txt: bool,

        /// Upstream segment length override (bytes)
        #[arg(long)]
        upstream_segment_len: Option<usize>,

        /// Downstream segment length override (bytes)
        #[arg(long)]
        downstream_segment_len: Option<usize>,
    },

    /// Run the DNS responder
    Server {
        #[command(flatten)]
        tunnel: TunnelArgs,

        /// HTTP proxy that receives tunnelled streams
        #[arg(long)]
        forward: Option<SocketAddr>,

        /// UDP listen address for DNS
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Resolver for queries outside the tunnel domain
        #[arg(long)]
        upstream_resolver: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    let level = if cli.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let mut config = match &cli.config {
        Some(path) => DnswayConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => DnswayConfig::default(),
    };

    match cli.command {
        Commands::Client {
            tunnel,
            port,
            resolver,
            enable_relay,
            relay_listen,
            txt,
            upstream_segment_len,
            downstream_segment_len,
        } => {
            tunnel.apply(&mut config);
            if let Some(port) = port {
                config.client.listen_addr = SocketAddr::from(([127, 0, 0, 1], port));
            }
            if resolver.is_some() {
                config.client.resolver = resolver;
            }
            config.client.enable_relay |= enable_relay;
            if let Some(addr) = relay_listen {
                config.client.relay_listen = addr;
            }
            if txt {
                config.tunnel.mode = DownstreamMode::Text;
            }
            if upstream_segment_len.is_some() {
                config.client.upstream_segment_len = upstream_segment_len;
            }
            if downstream_segment_len.is_some() {
                config.client.downstream_segment_len = downstream_segment_len;
            }

            run_client(config).await
        }
        Commands::Server {
            tunnel,
            forward,
            listen,
            upstream_resolver,
        } => {
            tunnel.apply(&mut config);
            if let Some(forward) = forward {
                config
                    .server
                    .get_or_insert_with(|| ServerConfig::new(forward))
                    .forward_addr = forward;
            }
            if let Some(server) = config.server.as_mut() {
                if let Some(listen) = listen {
                    server.listen_addr = listen;
                }
                if upstream_resolver.is_some() {
                    server.upstream_resolver = upstream_resolver;
                }
            }

            run_server(config).await
        }
    }
}

impl TunnelArgs {
    fn apply(self, config: &mut DnswayConfig) {
        if let Some(domain) = self.domain {
            config.tunnel.domain = domain;
        }
        if let Some(secret) = self.secret {
            config.tunnel.secret = secret;
        }
    }
}

async fn run_client(config: DnswayConfig) -> Result<()> {
    config.validate().context("Invalid client configuration")?;

    let codec = config.codec()?;
    let limits = config.segment_limits()?;
    let resolver = match config.client.resolver {
        Some(resolver) => resolver,
        None => detect_system_resolver().await,
    };

    info!("dnsway client for {} via resolver {}", codec.domain(), resolver);
    info!(
        "Mode: {:?}, segments: {} up / {} down, in-transit ceiling {}",
        config.tunnel.mode, limits.max_upstream, limits.max_downstream, limits.max_in_transit
    );

    let cancel = CancellationToken::new();
    spawn_shutdown_handler(cancel.clone());

    if config.client.enable_relay {
        let socket = UdpSocket::bind(config.client.relay_listen)
            .await
            .with_context(|| format!("Failed to bind DNS relay on {}", config.client.relay_listen))?;
        let codec = Arc::new(codec.clone());
        let relay = Arc::new(RecursiveRelay::new(
            Arc::clone(&codec),
            Arc::new(TunnelGuard::new(codec)),
            Some(resolver),
            config.tunnel.query_timeout,
        ));
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.serve(socket, cancel).await {
                error!("DNS relay failed: {}", e);
            }
        });
    }

    let exchange = Arc::new(UdpExchange::new(resolver, config.tunnel.query_timeout));
    let ctx = TunnelContext::new(
        codec,
        OtpAuthorizer::new(config.tunnel.secret.as_bytes()),
        exchange,
        config.tunnel.mode,
    )
    .with_limits(limits)
    .with_timing(config.tunnel.poll_interval, config.tunnel.inactivity_timeout)
    .with_cancel(cancel);

    ProxyFrontEnd::new(ctx)
        .listen(config.client.listen_addr)
        .await
        .with_context(|| format!("HTTP proxy on {} failed", config.client.listen_addr))?;

    Ok(())
}

async fn run_server(config: DnswayConfig) -> Result<()> {
    config.validate().context("Invalid server configuration")?;
    let server = config
        .server
        .clone()
        .context("Server mode needs a forward address (--forward or [server] forward_addr)")?;

    let codec = config.codec()?;
    info!(
        "dnsway responder for {} on {}, forwarding to {}",
        codec.domain(),
        server.listen_addr,
        server.forward_addr
    );

    let cancel = CancellationToken::new();
    spawn_shutdown_handler(cancel.clone());

    let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel::<AcceptedSession>();
    let responder = Arc::new(TunnelResponder::new(
        codec.clone(),
        OtpAuthorizer::new(config.tunnel.secret.as_bytes()),
        Arc::new(accepted_tx),
    ));

    // Idle session reaper
    {
        let responder = Arc::clone(&responder);
        let cancel = cancel.clone();
        let idle = config.tunnel.inactivity_timeout;
        let mut ticker = tokio::time::interval(server.reap_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = responder.reap_idle(idle);
                        if reaped > 0 {
                            debug!("Reaped {} idle sessions", reaped);
                        }
                    }
                }
            }
        });
    }

    // Accepted sessions go to the forward address
    {
        let cancel = cancel.clone();
        let forward_addr = server.forward_addr;
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = accepted_rx.recv() => match accepted {
                        Some(accepted) => accepted,
                        None => break,
                    },
                };
                tokio::spawn(forward_session(accepted, forward_addr));
            }
        });
    }

    let socket = UdpSocket::bind(server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind DNS listener on {}", server.listen_addr))?;
    let relay = Arc::new(RecursiveRelay::new(
        Arc::new(codec),
        responder,
        server.upstream_resolver,
        config.tunnel.query_timeout,
    ));
    relay.serve(socket, cancel).await?;

    Ok(())
}

async fn forward_session(accepted: AcceptedSession, forward_addr: SocketAddr) {
    let id = accepted.id;
    let mut stream = accepted.stream;

    let mut upstream = match TcpStream::connect(forward_addr).await {
        Ok(upstream) => upstream,
        Err(e) => {
            // Dropping the stream reports the session closed to the client
            warn!("Session {:04x}: cannot reach {}: {}", id, forward_addr, e);
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
        Ok((up, down)) => info!(
            "Session {:04x} finished: {} bytes up, {} bytes down",
            id, up, down
        ),
        Err(e) => debug!("Session {:04x} forwarding ended: {}", id, e),
    }
}

fn spawn_shutdown_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            return;
        }
        info!("Shutting down");
        cancel.cancel();
    });
}
