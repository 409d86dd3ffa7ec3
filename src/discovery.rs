//! mDNS advertisement so controllers and producers on the LAN can find the
//! session server without configuration.

use std::net::{IpAddr, SocketAddr};

use libmdns::{Responder, Service};

/// DNS-SD service type the server registers under.
pub const SERVICE_TYPE: &str = "_http._tcp";

/// Default instance name.
pub const DEFAULT_SERVICE_NAME: &str = "decksync";

/// Addresses to announce for `addr`. An unspecified bind address means
/// "all interfaces", which the responder expresses as an empty list.
pub fn announce_ips(addr: &SocketAddr) -> Vec<IpAddr> {
    if addr.ip().is_unspecified() {
        Vec::new()
    } else {
        vec![addr.ip()]
    }
}

/// Advertise the server bound at `addr`. The registration lasts as long as
/// the returned [`Service`] is alive.
pub fn advertise(addr: SocketAddr, name: &str) -> std::io::Result<Service> {
    let responder = Responder::new_with_ip_list(announce_ips(&addr))?;
    let service = responder.register(
        SERVICE_TYPE.to_owned(),
        name.to_owned(),
        addr.port(),
        &["path=/"],
    );
    tracing::info!(%addr, name, "advertising session server via mDNS");
    Ok(service)
}
