mod cache;
mod chaos;
mod config;
mod domainset;
mod engine;
mod ip4map;
mod proto_utils;
mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::BytesMut;
use clap::Parser;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Args, Config};
use crate::engine::Engine;
use crate::ip4map::Ip4Map;
use crate::upstream::Exchanger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = Config::from_args(args).context("load configuration")?;

    let cache = cache::new_cache(&cfg.redis_network, cfg.redis.as_deref(), cfg.redis_index)
        .context("create decision cache")?;
    info!(cache = %cache.info().await, "decision cache ready");

    let ip_map = Arc::new(ArcSwap::from_pointee(
        cfg.build_ip_map().context("load ip map")?,
    ));

    for (i, u) in cfg.upstreams.iter().enumerate() {
        info!(index = i, name = %u.name, endpoints = ?u.endpoints, "configured upstream");
    }

    let engine = Engine::new(
        cfg.upstreams.clone(),
        ip_map.clone(),
        cfg.block.clone(),
        cache.clone(),
        Exchanger::new(cfg.upstream_timeout, cfg.udp_size),
        cfg.min_ttl,
    );

    let udp_workers = if cfg.udp_workers > 0 {
        cfg.udp_workers
    } else {
        num_cpus::get()
    };
    info!(listen = %cfg.listen, udp_workers, "dns server started");

    #[cfg(unix)]
    {
        // Unix 上每个 worker 自带 SO_REUSEPORT 套接字，由内核分流
        for worker_id in 0..udp_workers {
            let engine = engine.clone();
            let std_socket = create_reuseport_udp_socket(cfg.listen)
                .with_context(|| format!("create udp socket for worker {worker_id}"))?;
            let socket = UdpSocket::from_std(std_socket)?;
            tokio::spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, Arc::new(socket), engine).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
        }
    }

    #[cfg(not(unix))]
    {
        use socket2::{Domain, Protocol, Socket, Type};
        let domain = if cfg.listen.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket =
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
        let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
        let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
        socket.set_nonblocking(true).context("set nonblocking")?;
        socket.bind(&cfg.listen.into()).context("bind socket")?;
        let udp_socket = Arc::new(UdpSocket::from_std(socket.into()).context("from_std")?);
        for worker_id in 0..udp_workers {
            let engine = engine.clone();
            let socket = Arc::clone(&udp_socket);
            tokio::spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, socket, engine).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
        }
    }

    process_signals(&cfg, &ip_map).await?;

    info!("quitting");
    cache.close().await;
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);
    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

// 在 Unix 上创建带 SO_REUSEPORT 的 UDP socket
#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    use libc::{c_int, c_void, setsockopt, socklen_t, SOL_SOCKET, SO_REUSEPORT};
    let val: c_int = 1;
    let fd = socket.as_raw_fd();
    let ret = unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        // non-fatal: continue without reuseport
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// UDP worker：接收循环里只做收包，处理与回包 spawn 出去，
/// handler 之间互不等待。
async fn run_udp_worker(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    engine: Engine,
) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if buf.capacity() < 4096 {
            buf.reserve(4096 - buf.len());
        }
        match socket.recv_buf_from(&mut buf).await {
            Ok((_len, peer)) => {
                let packet = buf.split().freeze();
                let engine = engine.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    match engine.handle(&packet, peer).await {
                        Ok(Some(reply)) => {
                            let _ = socket.send_to(&reply, peer).await;
                        }
                        // 上游全败：不回包
                        Ok(None) => {}
                        Err(err) => {
                            debug!(client = %peer, error = %err, "dropping bad datagram");
                        }
                    }
                });
            }
            Err(err) => {
                warn!(worker_id, error = %err, "udp recv failed");
                buf.clear();
            }
        }
    }
}

/// SIGINT/SIGTERM 优雅退出；SIGUSR1 重建分类表并原子换入，
/// 在途查询继续用旧表直到结束。
#[cfg(unix)]
async fn process_signals(cfg: &Config, ip_map: &Arc<ArcSwap<Ip4Map>>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut usr1 = signal(SignalKind::user_defined1()).context("install SIGUSR1 handler")?;
    loop {
        tokio::select! {
            _ = term.recv() => {
                info!("signal TERM, quitting");
                return Ok(());
            }
            _ = int.recv() => {
                info!("signal INT, quitting");
                return Ok(());
            }
            _ = usr1.recv() => {
                info!("signal USR1, reloading ip list files");
                match cfg.build_ip_map() {
                    Ok(new_map) => {
                        ip_map.store(Arc::new(new_map));
                        info!("ip map reloaded");
                    }
                    Err(err) => {
                        warn!(error = %err, "ip map reload failed, keeping old map");
                    }
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn process_signals(_cfg: &Config, _ip_map: &Arc<ArcSwap<Ip4Map>>) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("ctrl-c, quitting");
    Ok(())
}
