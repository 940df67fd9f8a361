// src/server/initialization.rs

//! Opens the listening sockets and prepares everything the dispatcher needs.

use super::context::{BoundAddresses, ServerContext};
use super::tls::setup_tls;
use crate::config::Config;
use crate::connection::{ConnectionTable, Endpoint};
use crate::core::introspection::StatusMirror;
use anyhow::{Result, anyhow};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket, UnixListener};
use tokio::sync::{Semaphore, broadcast};
use tracing::{info, warn};

/// Initializes all daemon components before starting the dispatcher.
pub async fn setup(config: Config) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let acceptor = setup_tls(&config.tls)?;

    let mut table = ConnectionTable::new();
    let mut bound = BoundAddresses::default();

    match &config.unicast_address {
        Some(address) => {
            let ip: IpAddr = address
                .parse()
                .map_err(|e| anyhow!("invalid unicast_address '{}': {}", address, e))?;
            let listener = TcpListener::bind((ip, config.unicast_port))
                .await
                .map_err(|e| anyhow!("Failed to bind {}:{}: {}", ip, config.unicast_port, e))?;
            let local = listener.local_addr()?;
            info!("flomd listening on tcp {}", local);
            bound.tcp = Some(local);
            table.add(Endpoint::TcpListener(listener));
        }
        None => {
            let path = PathBuf::from(&config.socket_path);
            remove_stale_socket(&path)?;
            let listener = UnixListener::bind(&path)
                .map_err(|e| anyhow!("Failed to bind unix socket '{}': {}", path.display(), e))?;
            info!("flomd listening on unix socket {}", path.display());
            bound.unix = Some(path);
            table.add(Endpoint::UnixListener(listener));
        }
    }

    if let Some(group) = &config.multicast_address {
        let socket = bind_discovery(group, config.multicast_port).await?;
        let local = socket.local_addr()?;
        info!("Discovery socket listening on udp {} (group {})", local, group);
        bound.discovery = Some(local);
        table.add(Endpoint::Discovery(socket));
    }

    let connection_permits = Arc::new(Semaphore::new(config.max_clients));

    Ok(ServerContext {
        config,
        table,
        bound,
        shutdown_tx,
        acceptor,
        mirror: StatusMirror::new(),
        connection_permits,
    })
}

/// Binds the discovery socket. A multicast group is joined on all interfaces;
/// any other address is bound directly.
async fn bind_discovery(group: &str, port: u16) -> Result<UdpSocket> {
    let ip: IpAddr = group
        .parse()
        .map_err(|e| anyhow!("invalid multicast_address '{}': {}", group, e))?;
    let socket = match ip {
        IpAddr::V4(v4) if v4.is_multicast() => {
            let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
            socket.join_multicast_v4(v4, Ipv4Addr::UNSPECIFIED)?;
            socket
        }
        IpAddr::V6(v6) if v6.is_multicast() => {
            let socket = UdpSocket::bind(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))).await?;
            socket.join_multicast_v6(&v6, 0)?;
            socket
        }
        _ => UdpSocket::bind(SocketAddr::from((ip, port))).await?,
    };
    Ok(socket)
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            warn!("Removed stale socket file '{}'", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow!(
            "Failed to remove stale socket '{}': {}",
            path.display(),
            e
        )),
    }
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    if config.idle_lifespan.is_zero() {
        info!("Idle lifespan is unlimited; the daemon runs until told to stop.");
    } else {
        info!(
            "Daemon exits after {:?} without lockers or clients.",
            config.idle_lifespan
        );
    }
    info!(
        "Lockers are reaped after {} idle sweeps every {:?}.",
        config.locker_idle_periods,
        config.sweep_interval()
    );
}
