//! The Node: pooled repositories served to authenticated peers.
//!
//! A node owns an identity keypair, a [`RepositoryPool`] and a
//! [`SessionRegistry`]. Each connection gets its own protocol stack built by
//! [`Node::build_session`]:
//!
//! ```text
//! MultiProtocol [ MutualAuthenticator (0..3) | SyncProtocol (13..17) ]
//! ```
//!
//! Sync starts locked. The authenticator's FINALIZE unlocks and initiates
//! it: when sent on the initiator, when received on the responder.

use std::net::SocketAddr;
use std::sync::Arc;

use replica_core::{BoxPublicKey, Ed25519PublicKey, Keypair};
use replica_store::{RepoId, Repository, RepositoryPool, StoreError};
use replica_sync::auth::msg as auth_msg;
use replica_sync::{
    ContentId, ContentStreams, Direction, DuplexReport, MultiProtocol, MutualAuthenticator,
    Protocol, ProtocolDuplex, ProtocolId, Role, SyncProtocol, SyncStats, Transition,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::error::Result;
use crate::session::{ConnectionId, SessionRegistry};

/// Position of the authenticator in every session.
pub const AUTH_PROTOCOL: ProtocolId = ProtocolId::new(0);
/// Position of the sync protocol in every session.
pub const SYNC_PROTOCOL: ProtocolId = ProtocolId::new(1);

/// Outcome of one completed session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: ConnectionId,
    /// Authenticated peer key, if the handshake got that far.
    pub peer: Option<BoxPublicKey>,
    pub authenticated: bool,
    pub transfer: SyncStats,
    pub frames: DuplexReport,
}

/// A replica node.
pub struct Node {
    keypair: Keypair,
    pool: Arc<RepositoryPool>,
    sessions: SessionRegistry,
    config: NodeConfig,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("public_key", &self.public_key())
            .field("pool", &self.pool.pool_id())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl Node {
    /// Validate `config` and open the repository pool.
    pub async fn open(keypair: Keypair, config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let pool = RepositoryPool::open(config.storage.clone()).await?;
        info!(
            public_key = %keypair.box_public_key(),
            pool = %pool.pool_id(),
            "node opened"
        );
        Ok(Self {
            keypair,
            pool: Arc::new(pool),
            sessions: SessionRegistry::new(),
            config,
        })
    }

    /// Key peers use to authenticate this node.
    pub fn public_key(&self) -> BoxPublicKey {
        self.keypair.box_public_key()
    }

    /// Ed25519 identity the box key is derived from.
    pub fn identity(&self) -> Ed25519PublicKey {
        self.keypair.public_key()
    }

    pub fn pool(&self) -> &Arc<RepositoryPool> {
        &self.pool
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────

    /// Build the protocol stack for one connection.
    ///
    /// `peer` is required for the initiator and optional for the responder,
    /// which learns the key from the challenge.
    pub fn build_session<I>(
        &self,
        role: Role,
        repo: Arc<Repository>,
        ids: I,
        peer: Option<BoxPublicKey>,
    ) -> Result<ProtocolDuplex>
    where
        I: IntoIterator<Item = ContentId>,
        I::IntoIter: Send + 'static,
    {
        let streams: Arc<dyn ContentStreams> = repo;
        let protocols: Vec<Box<dyn Protocol>> = vec![
            Box::new(MutualAuthenticator::new(
                self.keypair.to_box_keypair(),
                peer,
                self.config.auth.clone(),
            )),
            Box::new(SyncProtocol::new(streams, ids, self.config.sync.clone())?),
        ];

        let mut multi = MultiProtocol::new(protocols)?;
        multi.lock(SYNC_PROTOCOL)?;

        let finalize = multi.map_type(AUTH_PROTOCOL, auth_msg::FINALIZE)?;
        let direction = match role {
            Role::Initiator => Direction::Outgoing,
            Role::Responder => Direction::Incoming,
        };
        multi.register(finalize, direction, |_| Some(Transition::Unlock(SYNC_PROTOCOL)))?;
        multi.register(finalize, direction, |_| {
            Some(Transition::Initiate(SYNC_PROTOCOL))
        })?;

        Ok(ProtocolDuplex::new(multi, role).with_buffer(self.config.outbound_buffer))
    }

    /// Authenticate to `peer_key` over `io` and send `ids` from `repo`.
    pub async fn connect<T, I>(
        &self,
        io: T,
        peer_key: BoxPublicKey,
        repo: Arc<Repository>,
        ids: I,
    ) -> Result<SessionReport>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        I: IntoIterator<Item = ContentId>,
        I::IntoIter: Send + 'static,
    {
        self.connect_from(io, None, peer_key, repo, ids).await
    }

    /// Answer a peer over `io`, writing what it sends into `repo` and
    /// sending `ids` from `repo` back once authenticated.
    ///
    /// Both directions run concurrently on the one connection.
    pub async fn accept<T, I>(&self, io: T, repo: Arc<Repository>, ids: I) -> Result<SessionReport>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        I: IntoIterator<Item = ContentId>,
        I::IntoIter: Send + 'static,
    {
        self.accept_from(io, None, repo, ids).await
    }

    async fn connect_from<T, I>(
        &self,
        io: T,
        peer_addr: Option<SocketAddr>,
        peer_key: BoxPublicKey,
        repo: Arc<Repository>,
        ids: I,
    ) -> Result<SessionReport>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        I: IntoIterator<Item = ContentId>,
        I::IntoIter: Send + 'static,
    {
        let duplex = self.build_session(Role::Initiator, repo, ids, Some(peer_key))?;
        self.run_session(io, peer_addr, duplex).await
    }

    async fn accept_from<T, I>(
        &self,
        io: T,
        peer_addr: Option<SocketAddr>,
        repo: Arc<Repository>,
        ids: I,
    ) -> Result<SessionReport>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        I: IntoIterator<Item = ContentId>,
        I::IntoIter: Send + 'static,
    {
        let duplex = self.build_session(Role::Responder, repo, ids, None)?;
        self.run_session(io, peer_addr, duplex).await
    }

    async fn run_session<T>(
        &self,
        io: T,
        peer_addr: Option<SocketAddr>,
        mut duplex: ProtocolDuplex,
    ) -> Result<SessionReport>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = self.sessions.next_id(peer_addr, duplex.role());
        let _guard = self.sessions.register(id)?;
        info!(session = %id, "session started");

        let frames = match duplex.run(io).await {
            Ok(frames) => frames,
            Err(err) => {
                warn!(session = %id, error = %err, "session failed");
                return Err(err.into());
            }
        };

        let multi = duplex.multi();
        let auth = multi.protocol::<MutualAuthenticator>(AUTH_PROTOCOL);
        let report = SessionReport {
            id,
            peer: auth.and_then(|a| a.peer_public_key().copied()),
            authenticated: auth.map(|a| a.peer_authenticated()).unwrap_or(false),
            transfer: multi
                .protocol::<SyncProtocol>(SYNC_PROTOCOL)
                .map(|s| s.stats())
                .unwrap_or_default(),
            frames,
        };
        info!(
            session = %id,
            authenticated = report.authenticated,
            finished = frames.finished,
            sent = report.transfer.items_sent,
            received = report.transfer.items_received,
            "session ended"
        );
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // TCP
    // ─────────────────────────────────────────────────────────────────────────

    /// Accept connections on `listener` forever, syncing into `repo_id`.
    ///
    /// Served sessions only receive; use [`Node::accept`] to also send.
    ///
    /// Each connection runs on its own task. Session failures are logged
    /// and do not stop the loop; a listener error does.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, repo_id: RepoId) -> Result<()> {
        self.repository(&repo_id).await?;
        info!(addr = ?listener.local_addr().ok(), repo = %repo_id, "serving");

        loop {
            let (stream, addr) = listener.accept().await?;
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                let result = match node.repository(&repo_id).await {
                    Ok(repo) => node.accept_from(stream, Some(addr), repo, Vec::new()).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    warn!(peer = %addr, error = %err, "inbound session failed");
                }
            });
        }
    }

    /// Connect to `addr` and send `ids` from `repo_id` to the node holding `peer_key`.
    pub async fn sync_to<A, I>(
        &self,
        addr: A,
        peer_key: BoxPublicKey,
        repo_id: RepoId,
        ids: I,
    ) -> Result<SessionReport>
    where
        A: ToSocketAddrs,
        I: IntoIterator<Item = ContentId>,
        I::IntoIter: Send + 'static,
    {
        let repo = self.repository(&repo_id).await?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr().ok();
        self.connect_from(stream, peer_addr, peer_key, repo, ids).await
    }

    async fn repository(&self, id: &RepoId) -> Result<Arc<Repository>> {
        self.pool
            .get(id)
            .await?
            .ok_or_else(|| StoreError::RepositoryNotFound(id.to_string()).into())
    }
}
