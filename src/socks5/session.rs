use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, error, info};

use crate::connect;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::socks5::address::Target;
use crate::socks5::protocol::{AddressType, AuthMethod, Command, RSV, ReplyCode, Version};
use crate::users::UserTable;

/// Upper bound on a single read from either side of the relay
pub const MAX_CHUNK: usize = 8192;

/// Fixed wait after an error reply so the bytes flush before teardown
const GRACE_DELAY: Duration = Duration::from_secs(2);

/// State represents the per-connection protocol position. Transitions only
/// move forward; protocol errors jump straight to Terminated
#[derive(Debug)]
enum State {
    /// Expecting `[VER, NMETHODS]`
    MethodHeader,
    /// Expecting `NMETHODS` method bytes
    MethodList { nmethods: usize },
    /// Expecting `[VER, CMD, RSV, ATYP]`
    RequestHeader,
    /// Expecting 4-byte address + 2-byte port
    Ipv4Body,
    /// Expecting the 1-byte domain length
    DomainLength,
    /// Expecting `len` domain bytes + 2-byte port
    DomainBody { len: usize },
    /// Target parsed; the upstream connect is in flight
    Upstream(Target),
    /// Raw byte relay; no further protocol interpretation
    Relaying,
    Terminated,
}

/// State implementation block
impl State {
    /// wanted returns how many plaintext bytes the state consumes, or
    /// None once the session stops reading fixed-size records
    fn wanted(&self) -> Option<usize> {
        match self {
            State::MethodHeader => Some(2),
            State::MethodList { nmethods } => Some(*nmethods),
            State::RequestHeader => Some(4),
            State::Ipv4Body => Some(6),
            State::DomainLength => Some(1),
            State::DomainBody { len } => Some(*len + 2),
            _ => None,
        }
    }
}

/// Session drives the SOCKS5 protocol for one accepted connection: it owns
/// the client transport, parses the negotiation out of the (optionally
/// decrypted) byte stream, opens the upstream connection, and relays
pub struct Session<T> {
    local: T,
    peer: String,
    pipeline: Option<Pipeline>,
    /// Credential table shared by the dispatcher. Method selection only
    /// ever offers no-auth, so the table is not consulted here
    #[allow(dead_code)]
    users: Option<Arc<RwLock<UserTable>>>,
    timeout: Duration,
    state: State,
    pending: Vec<u8>,
}

/// Session implementation block
impl<T: AsyncRead + AsyncWrite + Unpin> Session<T> {
    /// new is a constructor for the Session type
    pub fn new(
        local: T,
        peer: String,
        pipeline: Option<Pipeline>,
        users: Option<Arc<RwLock<UserTable>>>,
        timeout: Duration,
    ) -> Self {
        Self {
            local,
            peer,
            pipeline,
            users,
            timeout,
            state: State::MethodHeader,
            pending: Vec::new(),
        }
    }

    /// run drives the session to completion: negotiation, upstream connect,
    /// then the relay. Protocol violations are handled here and are not
    /// reported as errors to the caller
    pub async fn run(mut self) -> Result<()> {
        let target = match self.negotiate().await {
            Ok(Some(target)) => target,
            Ok(None) => return Ok(()),
            Err(Error::Protocol(what)) => {
                error!("{}: {what}", self.peer);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.bridge(target).await
    }

    /// negotiate reads the handshake and request records. Inbound wire
    /// chunks are decrypted in arrival order into a plaintext buffer and
    /// the state machine consumes exact record lengths from it. Returns
    /// the parsed target, or None when the session ended during
    /// negotiation (reply sent, peer gone, or idle)
    async fn negotiate(&mut self) -> Result<Option<Target>> {
        let mut chunk = [0u8; MAX_CHUNK];

        loop {
            // Drain as many transitions as the buffered bytes allow
            while let Some(n) = self.state.wanted() {
                if self.pending.len() < n {
                    break;
                }
                let bytes: Vec<u8> = self.pending.drain(..n).collect();
                self.advance(&bytes).await?;

                match &self.state {
                    State::Terminated => return Ok(None),
                    State::Upstream(target) => return Ok(Some(target.clone())),
                    _ => {}
                }
            }

            let n = match self.read_local(&mut chunk).await? {
                Some(0) | None => return Ok(None),
                Some(n) => n,
            };
            let plain = self.decrypt(&chunk[..n])?;
            self.pending.extend_from_slice(&plain);
        }
    }

    /// advance applies the transition function for the current state to
    /// one complete plaintext record
    async fn advance(&mut self, bytes: &[u8]) -> Result<()> {
        match self.state {
            State::MethodHeader => self.on_method_header(bytes),
            State::MethodList { .. } => self.on_method_list(bytes).await,
            State::RequestHeader => self.on_request_header(bytes).await,
            State::Ipv4Body => self.on_ipv4_body(bytes),
            State::DomainLength => {
                self.state = State::DomainBody {
                    len: bytes[0] as usize,
                };
                Ok(())
            }
            State::DomainBody { .. } => self.on_domain_body(bytes),
            _ => Ok(()),
        }
    }

    fn on_method_header(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes[0] != Version::SOCKS5 as u8 {
            self.state = State::Terminated;
            return Err(Error::Protocol("protocol version mismatch".into()));
        }

        let nmethods = bytes[1] as usize;
        debug!("{}: method header (nmethods = {nmethods})", self.peer);
        self.state = State::MethodList { nmethods };
        Ok(())
    }

    async fn on_method_list(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.contains(&(AuthMethod::NoAuth as u8)) {
            self.write_client(&[Version::SOCKS5 as u8, AuthMethod::NoAuth as u8])
                .await?;
            self.state = State::RequestHeader;
        } else {
            error!("{}: no acceptable authentication method", self.peer);
            self.write_client(&[Version::SOCKS5 as u8, AuthMethod::NoAcceptable as u8])
                .await?;
            self.state = State::Terminated;
        }
        Ok(())
    }

    async fn on_request_header(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes[0] != Version::SOCKS5 as u8 {
            self.state = State::Terminated;
            return Err(Error::Protocol("protocol version mismatch".into()));
        }

        if Command::from_byte(bytes[1]) != Some(Command::Connect) {
            error!("{}: command not supported", self.peer);
            return self.reject(ReplyCode::CommandNotSupported).await;
        }

        match AddressType::from_byte(bytes[3]) {
            Some(AddressType::IPv4) => {
                debug!("{}: CMD[connect] ADDR[ipv4]", self.peer);
                self.state = State::Ipv4Body;
                Ok(())
            }
            Some(AddressType::DomainName) => {
                debug!("{}: CMD[connect] ADDR[domainname]", self.peer);
                self.state = State::DomainLength;
                Ok(())
            }
            None => {
                error!("{}: address type not supported", self.peer);
                self.reject(ReplyCode::AddrTypeUnsupported).await
            }
        }
    }

    fn on_ipv4_body(&mut self, bytes: &[u8]) -> Result<()> {
        let addr = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_be_bytes([bytes[4], bytes[5]]);
        self.state = State::Upstream(Target::IPv4(addr, port));
        Ok(())
    }

    fn on_domain_body(&mut self, bytes: &[u8]) -> Result<()> {
        let (host, port_bytes) = bytes.split_at(bytes.len() - 2);
        let host = String::from_utf8_lossy(host).into_owned();
        let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
        self.state = State::Upstream(Target::DomainName(host, port));
        Ok(())
    }

    /// reject sends a 4-byte request-level error reply, lets it flush
    /// through the grace delay, and terminates the session
    async fn reject(&mut self, code: ReplyCode) -> Result<()> {
        self.write_client(&[
            Version::SOCKS5 as u8,
            code as u8,
            RSV,
            AddressType::IPv4 as u8,
        ])
        .await?;
        time::sleep(GRACE_DELAY).await;
        self.state = State::Terminated;
        Ok(())
    }

    /// bridge awaits the upstream connect while buffering (but not
    /// interpreting) anything else the client sends, then answers the
    /// request and enters the relay
    async fn bridge(&mut self, target: Target) -> Result<()> {
        let ep = target.to_string();
        info!("{}: connect to {ep}", self.peer);

        let connect = connect::open(&target);
        tokio::pin!(connect);
        let mut chunk = [0u8; MAX_CHUNK];

        let remote = loop {
            tokio::select! {
                res = &mut connect => match res {
                    Ok(remote) => break remote,
                    Err(e) => {
                        error!("{}: {e}", self.peer);
                        let reply = target.encode_reply(ReplyCode::ConnectionRefused);
                        self.write_client(&reply).await?;
                        time::sleep(GRACE_DELAY).await;
                        self.state = State::Terminated;
                        return Ok(());
                    }
                },
                r = self.local.read(&mut chunk) => match r {
                    Ok(0) | Err(_) => {
                        // Client went away; dropping the in-flight connect
                        // cancels it and closes any socket it opened
                        self.state = State::Terminated;
                        return Ok(());
                    }
                    Ok(n) => {
                        let plain = self.decrypt(&chunk[..n])?;
                        self.pending.extend_from_slice(&plain);
                    }
                },
            }
        };

        info!("{}: {ep} connected", self.peer);
        let reply = target.encode_reply(ReplyCode::Succeeded);
        self.write_client(&reply).await?;
        self.state = State::Relaying;

        self.relay(remote).await
    }

    /// relay forwards bytes both ways until either side closes or the
    /// idle timeout fires; no protocol interpretation happens here
    async fn relay(&mut self, mut remote: TcpStream) -> Result<()> {
        // Bytes the client sent while the connect was in flight
        if !self.pending.is_empty() {
            let early = std::mem::take(&mut self.pending);
            if remote.write_all(&early).await.is_err() {
                self.state = State::Terminated;
                return Ok(());
            }
        }

        let mut lbuf = [0u8; MAX_CHUNK];
        let mut rbuf = [0u8; MAX_CHUNK];

        loop {
            tokio::select! {
                r = self.local.read(&mut lbuf) => match r {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = self.decrypt(&lbuf[..n])?;
                        if remote.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                },
                r = remote.read(&mut rbuf) => match r {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = self.encrypt(&rbuf[..n])?;
                        if self.local.write_all(&data).await.is_err()
                            || self.local.flush().await.is_err()
                        {
                            break;
                        }
                    }
                },
                _ = time::sleep(self.timeout), if !self.timeout.is_zero() => {
                    info!("{}: closing idle connection", self.peer);
                    break;
                }
            }
        }

        self.state = State::Terminated;
        let _ = remote.shutdown().await;
        let _ = self.local.shutdown().await;
        Ok(())
    }

    /// read_local reads one wire chunk, honoring the idle timeout during
    /// negotiation; None means the session should wind down quietly
    async fn read_local(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        if self.timeout.is_zero() {
            return Ok(Some(self.local.read(buf).await?));
        }

        match time::timeout(self.timeout, self.local.read(buf)).await {
            Ok(n) => Ok(Some(n?)),
            Err(_) => {
                info!("{}: negotiation timed out", self.peer);
                Ok(None)
            }
        }
    }

    /// write_client encrypts (when configured) and writes a buffer to the
    /// client, completing the flush before the caller moves on
    async fn write_client(&mut self, buf: &[u8]) -> Result<()> {
        let data = match &mut self.pipeline {
            Some(p) => p.encrypt(buf)?,
            None => buf.to_vec(),
        };
        self.local.write_all(&data).await?;
        self.local.flush().await?;
        Ok(())
    }

    fn decrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>> {
        match &mut self.pipeline {
            Some(p) => p.decrypt(buf),
            None => Ok(buf.to_vec()),
        }
    }

    fn encrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>> {
        match &mut self.pipeline {
            Some(p) => p.encrypt(buf),
            None => Ok(buf.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn spawn_session(
        server: tokio::io::DuplexStream,
        pipeline: Option<Pipeline>,
    ) -> tokio::task::JoinHandle<Result<()>> {
        let session = Session::new(server, "test".to_string(), pipeline, None, Duration::ZERO);
        tokio::spawn(session.run())
    }

    async fn spawn_echo() -> std::net::SocketAddrV4 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let std::net::SocketAddr::V4(addr) = listener.local_addr().unwrap() else {
            panic!("expected an IPv4 listener");
        };
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_no_auth_accepted() {
        let (mut client, server) = tokio::io::duplex(1024);
        spawn_session(server, None);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_fragmented_handshake() {
        let (mut client, server) = tokio::io::duplex(1024);
        spawn_session(server, None);

        // Record boundaries must not depend on read boundaries
        for byte in [0x05u8, 0x02, 0x01, 0x00] {
            client.write_all(&[byte]).await.unwrap();
        }
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = spawn_session(server, None);

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);

        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).await.unwrap(), 0);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_version_mismatch_closes_without_reply() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = spawn_session(server, None);

        client.write_all(&[0x04, 0x01]).await.unwrap();
        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).await.unwrap(), 0);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_command_grace_close() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = spawn_session(server, None);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        let started = time::Instant::now();
        client.write_all(&[0x05, 0x02, 0x00, 0x01]).await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x07, 0x00, 0x01]);

        // The close must come no earlier than the grace delay
        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).await.unwrap(), 0);
        assert!(started.elapsed() >= GRACE_DELAY);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_address_type_grace_close() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = spawn_session(server, None);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        let started = time::Instant::now();
        client.write_all(&[0x05, 0x01, 0x00, 0x04]).await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x08, 0x00, 0x01]);

        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).await.unwrap(), 0);
        assert!(started.elapsed() >= GRACE_DELAY);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_ipv4_and_relay() {
        let addr = spawn_echo().await;
        let (mut client, server) = tokio::io::duplex(4096);
        spawn_session(server, None);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&addr.ip().octets());
        request.extend_from_slice(&addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
        assert_eq!(&reply[4..8], addr.ip().octets().as_slice());
        assert_eq!(&reply[8..10], addr.port().to_be_bytes().as_slice());

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }

    #[tokio::test]
    async fn test_connect_domain_echoes_domain_reply() {
        let addr = spawn_echo().await;
        let (mut client, server) = tokio::io::duplex(4096);
        spawn_session(server, None);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        let host = b"127.0.0.1";
        let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
        request.extend_from_slice(host);
        request.extend_from_slice(&addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = vec![0u8; 4 + 1 + host.len() + 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x03]);
        assert_eq!(reply[4] as usize, host.len());
        assert_eq!(&reply[5..5 + host.len()], host);

        client.write_all(b"over domain").await.unwrap();
        let mut echoed = [0u8; 11];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"over domain");
    }

    #[tokio::test]
    async fn test_encrypted_negotiation_and_relay() {
        let addr = spawn_echo().await;
        let key = b"a shared secret";
        let seed = 99;

        let (mut client, server) = tokio::io::duplex(4096);
        spawn_session(server, Pipeline::build(key, seed, true));
        let mut mirror = Pipeline::build(key, seed, true).unwrap();

        let hello = mirror.encrypt(&[0x05, 0x01, 0x00]).unwrap();
        client.write_all(&hello).await.unwrap();

        let mut plain = Vec::new();
        let mut wire = [0u8; 256];
        while plain.len() < 2 {
            let n = client.read(&mut wire).await.unwrap();
            assert!(n > 0, "unexpected close");
            plain.extend(mirror.decrypt(&wire[..n]).unwrap());
        }
        assert_eq!(&plain[..2], &[0x05, 0x00]);
        plain.drain(..2);

        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&addr.ip().octets());
        request.extend_from_slice(&addr.port().to_be_bytes());
        let request = mirror.encrypt(&request).unwrap();
        client.write_all(&request).await.unwrap();

        while plain.len() < 10 {
            let n = client.read(&mut wire).await.unwrap();
            assert!(n > 0, "unexpected close");
            plain.extend(mirror.decrypt(&wire[..n]).unwrap());
        }
        assert_eq!(&plain[..4], &[0x05, 0x00, 0x00, 0x01]);
        plain.drain(..10);

        let payload = mirror.encrypt(b"secret ping").unwrap();
        client.write_all(&payload).await.unwrap();
        while plain.len() < 11 {
            let n = client.read(&mut wire).await.unwrap();
            assert!(n > 0, "unexpected close");
            plain.extend(mirror.decrypt(&wire[..n]).unwrap());
        }
        assert_eq!(&plain[..11], b"secret ping");
    }
}
