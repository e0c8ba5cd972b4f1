use crate::error::{Error, Result};
use crate::socks5::address::Target;
use std::net::{SocketAddr, SocketAddrV4};
use tokio::net::{TcpStream, lookup_host};
use tracing::debug;

/// open resolves the target if needed and establishes an outbound TCP
/// connection to it. Each call owns its own in-flight resolver and socket;
/// dropping the returned future cancels the attempt and closes anything
/// already opened
pub async fn open(target: &Target) -> Result<TcpStream> {
    let ep = target.to_string();

    match target {
        Target::IPv4(addr, port) => {
            TcpStream::connect(SocketAddr::V4(SocketAddrV4::new(*addr, *port)))
                .await
                .map_err(|_| Error::Network(format!("could not connect to host: {ep}")))
        }
        Target::DomainName(host, port) => {
            // Resolve first; candidates are tried in resolver order
            let candidates: Vec<SocketAddr> = lookup_host((host.as_str(), *port))
                .await
                .map_err(|_| Error::Network(format!("could not resolve host: {ep}")))?
                .collect();

            if candidates.is_empty() {
                return Err(Error::Network(format!("could not resolve host: {ep}")));
            }

            for addr in candidates {
                match TcpStream::connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => debug!("connect attempt to {addr} failed: {e}"),
                }
            }

            Err(Error::Network(format!("could not connect to host: {ep}")))
        }
    }
}
