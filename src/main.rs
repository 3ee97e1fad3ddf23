use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sinkdns::config;
use sinkdns::proxy::Proxy;
use sinkdns::server::Server;

#[derive(Parser, Debug)]
#[command(author, version, about = "sinkdns - DNS forwarder with a policy-driven sinkhole", long_about = None)]
struct Args {
    /// Config file path (TOML)
    #[arg(short = 'c', long = "config", default_value = "/etc/sinkdns/config.toml")]
    config: PathBuf,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// Number of UDP workers (defaults to the CPU count)
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let config = config::load_config(&args.config)?;
    let listen: SocketAddr = config
        .dns
        .listen
        .parse()
        .context("parse listen address")?;
    let protocol = config.dns.protocol;
    let server = Arc::new(Server::new(config).await.context("start server")?);

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    let mut handles = Vec::new();

    if protocol.udp() {
        #[cfg(unix)]
        {
            // Individual sockets with SO_REUSEPORT so the kernel distributes
            // packets across workers.
            for worker_id in 0..udp_workers {
                let proxy = Arc::clone(&server.proxy);
                let std_socket = bind_udp_worker_socket(listen)
                    .with_context(|| format!("create udp socket for worker {}", worker_id))?;
                let socket = UdpSocket::from_std(std_socket)?;
                handles.push(tokio::spawn(async move {
                    if let Err(err) = run_udp_worker(Arc::new(socket), proxy).await {
                        error!(worker_id, error = %err, "udp worker exited");
                    }
                }));
            }
        }

        #[cfg(not(unix))]
        {
            // One shared socket; workers compete on recv.
            let socket = Arc::new(
                UdpSocket::bind(listen)
                    .await
                    .context("bind udp socket")?,
            );
            for worker_id in 0..udp_workers {
                let proxy = Arc::clone(&server.proxy);
                let socket = Arc::clone(&socket);
                handles.push(tokio::spawn(async move {
                    if let Err(err) = run_udp_worker(socket, proxy).await {
                        error!(worker_id, error = %err, "udp worker exited");
                    }
                }));
            }
        }
    }

    if protocol.tcp() {
        let listener = TcpListener::bind(listen)
            .await
            .context("bind tcp listener")?;
        let proxy = Arc::clone(&server.proxy);
        handles.push(tokio::spawn(async move {
            if let Err(err) = run_tcp(listener, proxy).await {
                error!(error = %err, "tcp server exited");
            }
        }));
    }

    info!(listen = %listen, udp = protocol.udp(), tcp = protocol.tcp(), udp_workers, "dns server started");

    wait_for_signals(&server).await?;

    // Stop accepting before draining queues.
    for handle in &handles {
        handle.abort();
    }
    server.close().await;
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// SIGHUP reloads the hosts sources; SIGTERM and SIGINT shut down.
#[cfg(unix)]
async fn wait_for_signals(server: &Server) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hangup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("received SIGHUP: reloading hosts");
                server.reload().await;
            }
            _ = terminate.recv() => {
                info!("received SIGTERM: shutting down");
                return Ok(());
            }
            _ = interrupt.recv() => {
                info!("received SIGINT: shutting down");
                return Ok(());
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_server: &Server) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("received interrupt: shutting down");
    Ok(())
}

/// Binds one worker's UDP socket. Every worker binds the same address with
/// SO_REUSEPORT so the kernel spreads queries across them; a platform that
/// refuses the option is a startup error, since the second bind would fail
/// anyway.
#[cfg(unix)]
fn bind_udp_worker_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use tracing::debug;
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("create udp socket")?;
    socket
        .set_reuse_address(true)
        .context("set SO_REUSEADDR")?;
    socket.set_reuse_port(true).context("set SO_REUSEPORT")?;
    // Best effort; the kernel clamps these to its configured maximum.
    if let Err(err) = socket.set_recv_buffer_size(4 * 1024 * 1024) {
        debug!(error = %err, "could not enlarge udp receive buffer");
    }
    if let Err(err) = socket.set_send_buffer_size(4 * 1024 * 1024) {
        debug!(error = %err, "could not enlarge udp send buffer");
    }
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind {addr}"))?;
    Ok(socket.into())
}

/// Receives queries and answers them, serving hijacks and cache hits inline
/// and spawning a task for anything that needs an upstream.
async fn run_udp_worker(socket: Arc<UdpSocket>, proxy: Arc<Proxy>) -> anyhow::Result<()> {
    use bytes::BytesMut;
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        buf.resize(4096, 0);
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                buf.truncate(len);
                let packet = buf.split().freeze();

                match proxy.handle_packet_fast(&packet, peer) {
                    Some(answer) => {
                        if socket.send_to(&answer.bytes, peer).await.is_ok() {
                            proxy.record(answer);
                        }
                    }
                    None => {
                        let proxy = Arc::clone(&proxy);
                        let socket = Arc::clone(&socket);
                        tokio::spawn(async move {
                            if let Some(answer) = proxy.handle_packet(&packet, peer).await {
                                if socket.send_to(&answer.bytes, peer).await.is_ok() {
                                    proxy.record(answer);
                                }
                            }
                        });
                    }
                }
            }
            Err(_) => {
                // Keep receiving; transient socket errors must not kill the
                // worker.
                buf.clear();
            }
        }
    }
}

async fn run_tcp(listener: TcpListener, proxy: Arc<Proxy>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let _ = handle_tcp_conn(stream, peer, proxy).await;
        });
    }
}

async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    proxy: Arc<Proxy>,
) -> anyhow::Result<()> {
    const MAX_TCP_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        if stream.read_exact(&mut buf).await.is_err() {
            return Ok(());
        }

        let Some(answer) = proxy.handle_packet(&buf, peer).await else {
            return Ok(());
        };

        if answer.bytes.len() <= u16::MAX as usize {
            let len_bytes = (answer.bytes.len() as u16).to_be_bytes();
            if stream.write_all(&len_bytes).await.is_err() {
                return Ok(());
            }
            if stream.write_all(&answer.bytes).await.is_err() {
                return Ok(());
            }
            proxy.record(answer);
        }
    }
}
