use std::{
    io,
    net::{IpAddr, Ipv4Addr},
};

use local_ip_address::{list_afinet_netifas, local_ip};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default
/// `info` level. Safe to call more than once.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Prefers the address of the default route. Otherwise falls back to the first
/// interface that is neither loopback nor link-local, and finally to
/// `127.0.0.1` so that same-host sessions still work.
pub fn select_host_address() -> io::Result<IpAddr> {
    if let Ok(ip @ IpAddr::V4(_)) = local_ip() {
        debug!("Default route address: {}", ip);
        return Ok(ip);
    }

    let interfaces = list_afinet_netifas().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    for (name, ip) in interfaces {
        debug!("iface: {} / {:?}", name, ip);
        if let IpAddr::V4(v4) = ip {
            if !v4.is_loopback() && !v4.is_link_local() && !v4.is_broadcast() {
                return Ok(ip);
            }
        }
    }

    info!("Found no routable interface, using loopback");
    Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
