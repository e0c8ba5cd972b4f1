use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use rand::rngs::StdRng;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::socks5::session::Session;
use crate::users::UserTable;

// Depth of the accept and admin channels feeding the dispatch loop
const CHANNEL_DEPTH: usize = 64;

/// ServerConfig holds the live listening configuration. Changes apply to
/// connections accepted afterward, never to running sessions
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Cipher key; empty disables the encrypted client transport
    pub key: Vec<u8>,
    /// Wrap client traffic in a zlib stream
    pub zlib: bool,
    /// Idle timeout for sessions; zero disables it
    pub timeout: Duration,
    /// Log per-connection details such as the negotiated seed
    pub verbose: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            key: Vec::new(),
            zlib: false,
            timeout: Duration::from_secs(300),
            verbose: false,
        }
    }
}

/// Admin commands handled by the dispatch loop
enum AdminCmd {
    Publish {
        host: String,
        port: u16,
        reply: oneshot::Sender<Result<u16>>,
    },
    AddUser {
        username: String,
        password: String,
    },
    SetKey(Vec<u8>),
    SetCompression(bool),
}

/// ServerHandle is the in-process admin surface of a running dispatcher.
/// Commands are serialized through the dispatch loop, so no configuration
/// is ever touched concurrently
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<AdminCmd>,
}

/// ServerHandle implementation block
impl ServerHandle {
    /// publish binds a listener on every interface and returns the bound
    /// port (useful with port 0)
    pub async fn publish(&self, port: u16) -> Result<u16> {
        self.publish_on("0.0.0.0", port).await
    }

    /// publish_on binds a listener on a specific host
    pub async fn publish_on(&self, host: &str, port: u16) -> Result<u16> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AdminCmd::Publish {
                host: host.to_string(),
                port,
                reply,
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// add_user lazily creates the user table, then upserts the entry
    pub async fn add_user(&self, username: &str, password: &str) -> Result<()> {
        self.tx
            .send(AdminCmd::AddUser {
                username: username.to_string(),
                password: password.to_string(),
            })
            .await
            .map_err(|_| Error::Shutdown)
    }

    /// set_key replaces the cipher key for connections accepted afterward
    pub async fn set_key(&self, key: Vec<u8>) -> Result<()> {
        self.tx
            .send(AdminCmd::SetKey(key))
            .await
            .map_err(|_| Error::Shutdown)
    }

    /// set_compression toggles the zlib stage for connections accepted
    /// afterward
    pub async fn set_compression(&self, enabled: bool) -> Result<()> {
        self.tx
            .send(AdminCmd::SetCompression(enabled))
            .await
            .map_err(|_| Error::Shutdown)
    }
}

/// Socks5Server dispatches accepted connections: it performs the
/// out-of-band seed exchange, builds a fresh pipeline, and spawns one
/// session per connection. It owns the configuration and the user table
pub struct Socks5Server {
    config: ServerConfig,
    users: Option<Arc<RwLock<UserTable>>>,
    rng: StdRng,
    conn_tx: mpsc::Sender<(TcpStream, SocketAddr)>,
    conn_rx: mpsc::Receiver<(TcpStream, SocketAddr)>,
    admin_rx: mpsc::Receiver<AdminCmd>,
    admin_open: bool,
}

/// Socks5Server implementation block
impl Socks5Server {
    /// new is a constructor for the Socks5Server type; `rng` seeds the
    /// per-connection IV seed draws. Returns the dispatcher together with
    /// its admin handle
    pub fn new(config: ServerConfig, rng: StdRng) -> (Self, ServerHandle) {
        let (conn_tx, conn_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (admin_tx, admin_rx) = mpsc::channel(CHANNEL_DEPTH);

        let server = Self {
            config,
            users: None,
            rng,
            conn_tx,
            conn_rx,
            admin_rx,
            admin_open: true,
        };
        (server, ServerHandle { tx: admin_tx })
    }

    /// run is the dispatch loop: it consumes connections delivered by the
    /// listener tasks and admin commands, one at a time
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                Some((stream, peer)) = self.conn_rx.recv() => {
                    self.dispatch(stream, peer).await;
                }
                cmd = self.admin_rx.recv(), if self.admin_open => match cmd {
                    Some(cmd) => self.handle_admin(cmd).await,
                    None => self.admin_open = false,
                },
            }
        }
    }

    async fn handle_admin(&mut self, cmd: AdminCmd) {
        match cmd {
            AdminCmd::Publish { host, port, reply } => {
                let _ = reply.send(self.publish(&host, port).await);
            }
            AdminCmd::AddUser { username, password } => {
                let table = self
                    .users
                    .get_or_insert_with(|| Arc::new(RwLock::new(UserTable::new())));
                table.write().await.add(username, password);
            }
            AdminCmd::SetKey(key) => self.config.key = key,
            AdminCmd::SetCompression(enabled) => self.config.zlib = enabled,
        }
    }

    /// publish binds a listener and spawns its accept task, which feeds
    /// accepted connections back into the dispatch loop
    async fn publish(&mut self, host: &str, port: u16) -> Result<u16> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| Error::Bind {
                addr: format!("{host}:{port}"),
                source,
            })?;
        let bound = listener
            .local_addr()
            .map_err(|source| Error::Bind {
                addr: format!("{host}:{port}"),
                source,
            })?
            .port();

        info!("SOCKS5 proxy listening on {host}:{bound}");

        let tx = self.conn_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if tx.send((stream, peer)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("accept failed: {e}"),
                }
            }
        });

        Ok(bound)
    }

    /// dispatch runs the seed exchange when encryption is configured,
    /// builds the pipeline, and spawns the session task. A failing session
    /// is logged and never fatal to the dispatcher
    async fn dispatch(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let pipeline = if self.config.key.is_empty() {
            Pipeline::build(&[], 0, self.config.zlib)
        } else {
            let seed = self.rng.next_u32();
            if self.config.verbose {
                info!("{peer}: initialization vector seed [{seed}]");
            }
            // The raw seed travels in the clear, before any SOCKS bytes
            if let Err(e) = write_seed(&mut stream, seed).await {
                error!("{peer}: seed exchange failed: {e}");
                return;
            }
            Pipeline::build(&self.config.key, seed, self.config.zlib)
        };

        info!("new client: {peer}");

        let session = Session::new(
            stream,
            peer.to_string(),
            pipeline,
            self.users.clone(),
            self.config.timeout,
        );
        tokio::spawn(async move {
            if let Err(e) = session.run().await {
                error!("{peer}: session failed: {e}");
            }
        });
    }
}

async fn write_seed(stream: &mut TcpStream, seed: u32) -> std::io::Result<()> {
    stream.write_all(&seed.to_le_bytes()).await?;
    stream.flush().await
}
