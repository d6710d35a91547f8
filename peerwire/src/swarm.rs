//! The driver of all peer sessions of a single download.
//!
//! Sessions are sans-io state machines, so a single task can run all of them:
//! it waits until the socket of any session becomes ready for what that
//! session is interested in, or until the next periodic tick, and then runs a
//! pass of the affected sessions. The piece set, the storage, and the upload
//! throttle are owned by the swarm and lent to one session at a time.

use {
    crate::{
        alert::{Alert, AlertReceiver, AlertSender},
        conf::Conf,
        error::*,
        peer::{PeerSession, SessionContext},
        throttle::UploadThrottle,
        PieceSet, Sha1Hash, Storage, StorageInfo, TorrentInfo,
    },
    futures::{
        future::{self, BoxFuture},
        select,
        stream::{FuturesUnordered, StreamExt},
        FutureExt,
    },
    std::{
        collections::HashMap,
        net::SocketAddr,
        sync::Arc,
        time::Instant,
    },
    tokio::{
        net::{TcpListener, TcpStream},
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        task, time,
    },
};

/// The error count penalty of a peer that is not a seed.
const LEECHER_ERROR_PENALTY: u32 = 3;

/// A peer with at least this many errors is not connected again.
const MAX_PEER_ERROR_COUNT: u32 = 6;

/// What we remember about a peer across its connections.
#[derive(Debug)]
pub struct Peer {
    pub addr: SocketAddr,
    /// The sum of the penalties of the connections that failed with
    /// a transport error.
    pub error_count: u32,
    /// Whether the peer had all pieces the last time we talked to it.
    pub is_seed: bool,
    /// Whether we want to choke the peer.
    pub should_choke: bool,
}

impl Peer {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            error_count: 0,
            is_seed: false,
            should_choke: false,
        }
    }

    /// Penalizes the peer for a failed connection. Seeds are penalized less as
    /// they are more valuable to reconnect to.
    pub fn on_error(&mut self) {
        self.error_count += if self.is_seed { 1 } else { LEECHER_ERROR_PENALTY };
    }

    pub fn is_banned(&self) -> bool {
        self.error_count >= MAX_PEER_ERROR_COUNT
    }
}

/// The commands the swarm can receive from its handle.
enum Command {
    Connect(SocketAddr),
    Choke { addr: SocketAddr, choke: bool },
    SetUploadRate(Option<u64>),
    Shutdown,
}

/// Sends commands to a running [`Swarm`].
#[derive(Clone)]
pub struct SwarmHandle {
    cmd_chan: UnboundedSender<Command>,
}

impl SwarmHandle {
    /// Connects to a new peer.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.send(Command::Connect(addr))
    }

    /// Sets whether the peer is choked. This is the decision of a choke
    /// algorithm that lives outside of the swarm. Peers are unchoked by
    /// default.
    pub fn set_choke(&self, addr: SocketAddr, choke: bool) -> Result<()> {
        self.send(Command::Choke { addr, choke })
    }

    pub fn set_upload_rate(&self, rate: Option<u64>) -> Result<()> {
        self.send(Command::SetUploadRate(rate))
    }

    /// Closes all sessions and stops the swarm.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_chan.send(cmd).map_err(|_| Error::SwarmStopped)
    }
}

/// The collaborators the sessions share.
struct Shared {
    piece_set: Box<dyn PieceSet + Send>,
    storage: Box<dyn Storage + Send>,
    throttle: UploadThrottle,
    alerts: AlertSender,
}

impl Shared {
    fn ctx(&mut self, should_choke: bool, now: Instant) -> SessionContext<'_> {
        SessionContext {
            piece_set: &mut *self.piece_set,
            storage: &mut *self.storage,
            throttle: &mut self.throttle,
            alerts: Some(&self.alerts),
            should_choke,
            now,
        }
    }
}

type ConnectResult = (SocketAddr, std::io::Result<TcpStream>);

/// What woke up the swarm.
enum Event {
    Ready(usize),
    Tick,
    Command(Option<Command>),
    Connected(ConnectResult),
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
}

pub struct Swarm {
    torrent: Arc<TorrentInfo>,
    conf: Conf,
    shared: Shared,
    sessions: Vec<PeerSession<TcpStream>>,
    peers: HashMap<SocketAddr, Peer>,
    /// The outbound connections being established.
    connecting: FuturesUnordered<BoxFuture<'static, ConnectResult>>,
    listener: Option<TcpListener>,
    cmd_port: UnboundedReceiver<Command>,
    /// The position in the piece set's completion log up to which completed
    /// pieces were announced as alerts.
    completion_cursor: usize,
    download_complete: bool,
    last_tick: Instant,
}

impl Swarm {
    /// Creates a swarm of the download, with the pieces we already have
    /// recorded in the piece set.
    pub fn new(
        conf: Conf,
        info_hash: Sha1Hash,
        storage_info: StorageInfo,
        piece_set: Box<dyn PieceSet + Send>,
        storage: Box<dyn Storage + Send>,
    ) -> (Self, SwarmHandle, AlertReceiver) {
        debug_assert_eq!(piece_set.piece_count(), storage_info.piece_count);
        let now = Instant::now();
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let torrent = Arc::new(TorrentInfo {
            info_hash,
            client_id: conf.client_id,
            storage: storage_info,
        });
        let completion_cursor = piece_set.completion_log().len();
        let download_complete = piece_set.is_complete();
        let swarm = Self {
            torrent,
            shared: Shared {
                piece_set,
                storage,
                throttle: UploadThrottle::new(conf.upload_rate_limit, now),
                alerts: alert_chan,
            },
            conf,
            sessions: Vec::new(),
            peers: HashMap::new(),
            connecting: FuturesUnordered::new(),
            listener: None,
            cmd_port,
            completion_cursor,
            download_complete,
            last_tick: now,
        };
        (swarm, SwarmHandle { cmd_chan }, alert_port)
    }

    /// Accepts inbound connections on the address, returning the address
    /// actually bound (e.g. when binding to port 0).
    pub async fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        log::info!("Listening on {}", addr);
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Starts connecting to the peer.
    pub fn add_peer(&mut self, addr: SocketAddr) -> Result<()> {
        if self.sessions.iter().any(|s| s.addr() == addr) {
            return Err(Error::DuplicatePeer);
        }
        let peer = self.peers.entry(addr).or_insert_with(|| Peer::new(addr));
        if peer.is_banned() {
            log::info!("Not connecting to {} ({} errors)", addr, peer.error_count);
            return Err(Error::PeerBanned);
        }

        log::info!("Connecting to peer {}", addr);
        self.sessions.push(PeerSession::outbound(
            addr,
            Arc::clone(&self.torrent),
            self.conf.session.clone(),
            Instant::now(),
        ));
        self.connecting
            .push(async move { (addr, TcpStream::connect(addr).await) }.boxed());
        Ok(())
    }

    /// The peer records of the swarm.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Runs the swarm until it's shut down through its handle, or until all
    /// handles are dropped.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            let event = self.wait().await;
            let now = Instant::now();
            match event {
                Event::Ready(index) => self.run_pass(index, now),
                Event::Tick => {
                    let is_tick_due = now.saturating_duration_since(self.last_tick)
                        >= self.conf.session.check_interval;
                    if is_tick_due {
                        self.last_tick = now;
                    }
                    for index in 0..self.sessions.len() {
                        if is_tick_due || self.sessions[index].has_buffered_input() {
                            self.run_pass(index, now);
                        }
                    }
                }
                Event::Command(Some(cmd)) => {
                    if !self.handle_cmd(cmd) {
                        break;
                    }
                }
                Event::Command(None) => {
                    log::info!("All swarm handles dropped");
                    break;
                }
                Event::Connected((addr, result)) => self.on_connected(addr, result),
                Event::Accepted(Ok((socket, addr))) => self.on_accepted(socket, addr),
                Event::Accepted(Err(e)) => {
                    log::warn!("Error accepting connection: {}", e);
                }
            }

            self.sessions.retain(|s| !s.is_closed());
            self.announce_completions();
        }

        self.shutdown();
        Ok(())
    }

    /// Waits for the next event.
    async fn wait(&mut self) -> Event {
        // a session with whole messages in its buffer can make progress without
        // its socket being ready
        let deadline = if self.sessions.iter().any(|s| s.has_buffered_input()) {
            Instant::now()
        } else {
            self.last_tick + self.conf.session.check_interval
        };

        let sessions = &self.sessions;
        let listener = &self.listener;
        let mut ready = wait_ready(sessions).boxed().fuse();
        let mut tick = Box::pin(time::sleep_until(deadline.into())).fuse();
        let mut cmd = Box::pin(self.cmd_port.recv()).fuse();
        let mut connected = self.connecting.select_next_some();
        let mut accepted = async move {
            match listener {
                Some(listener) => listener.accept().await,
                None => future::pending().await,
            }
        }
        .boxed()
        .fuse();

        select! {
            index = ready => Event::Ready(index),
            _ = tick => Event::Tick,
            cmd = cmd => Event::Command(cmd),
            result = connected => Event::Connected(result),
            result = accepted => Event::Accepted(result),
        }
    }

    /// Handles a command and returns whether the swarm should keep running.
    fn handle_cmd(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect(addr) => {
                if let Err(e) = self.add_peer(addr) {
                    log::warn!("Cannot connect to {}: {}", addr, e);
                }
            }
            Command::Choke { addr, choke } => {
                let peer = self.peers.entry(addr).or_insert_with(|| Peer::new(addr));
                peer.should_choke = choke;
            }
            Command::SetUploadRate(rate) => {
                log::info!("Upload rate limit: {:?}", rate);
                self.shared.throttle.set_rate(rate, Instant::now());
            }
            Command::Shutdown => {
                log::info!("Shutting down swarm");
                return false;
            }
        }
        true
    }

    fn on_connected(&mut self, addr: SocketAddr, result: std::io::Result<TcpStream>) {
        let index = match self.sessions.iter().position(|s| s.addr() == addr) {
            Some(index) => index,
            None => return,
        };
        match result {
            Ok(socket) => {
                self.sessions[index].connected(socket, Instant::now());
                self.run_pass(index, Instant::now());
            }
            Err(e) => {
                log::info!("Could not connect to {}: {}", addr, e);
                let should_choke = self.peer_should_choke(addr);
                self.sessions[index]
                    .close(&mut self.shared.ctx(should_choke, Instant::now()));
                self.on_session_error(addr, PeerError::Io(e));
            }
        }
    }

    fn on_accepted(&mut self, socket: TcpStream, addr: SocketAddr) {
        if self.sessions.iter().any(|s| s.addr() == addr) {
            log::info!("Dropping duplicate connection from {}", addr);
            return;
        }
        let peer = self.peers.entry(addr).or_insert_with(|| Peer::new(addr));
        if peer.is_banned() {
            log::info!("Dropping connection from banned peer {}", addr);
            return;
        }

        log::info!("Accepted connection from {}", addr);
        self.sessions.push(PeerSession::inbound(
            addr,
            socket,
            Arc::clone(&self.torrent),
            self.conf.session.clone(),
            Instant::now(),
        ));
    }

    fn peer_should_choke(&self, addr: SocketAddr) -> bool {
        self.peers.get(&addr).map(|p| p.should_choke).unwrap_or(false)
    }

    fn run_pass(&mut self, index: usize, now: Instant) {
        let addr = self.sessions[index].addr();
        let should_choke = self.peer_should_choke(addr);
        let session = &mut self.sessions[index];
        let result = session.pass(&mut self.shared.ctx(should_choke, now));
        let is_seed = session.state().is_peer_seed();

        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.is_seed |= is_seed;
        }
        if let Err(e) = result {
            self.on_session_error(addr, e);
        }
    }

    fn on_session_error(&mut self, addr: SocketAddr, error: PeerError) {
        log::info!("Peer {} disconnected: {}", addr, error);
        if error.is_transport() {
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.on_error();
                log::debug!("Peer {} error count: {}", addr, peer.error_count);
            }
        }
        // the library user may not be listening for alerts
        let _ = self
            .shared
            .alerts
            .send(Alert::PeerDisconnected { addr, error });
    }

    /// Sends an alert for each piece completed since the last call, and one
    /// when the download completes.
    fn announce_completions(&mut self) {
        let log = self.shared.piece_set.completion_log();
        for index in &log[self.completion_cursor..] {
            let _ = self.shared.alerts.send(Alert::PieceComplete(*index));
        }
        self.completion_cursor = log.len();

        if !self.download_complete && self.shared.piece_set.is_complete() {
            log::info!("Download complete");
            self.download_complete = true;
            let _ = self.shared.alerts.send(Alert::DownloadComplete);
        }
    }

    fn shutdown(&mut self) {
        let now = Instant::now();
        for index in 0..self.sessions.len() {
            let addr = self.sessions[index].addr();
            let should_choke = self.peer_should_choke(addr);
            self.sessions[index].close(&mut self.shared.ctx(should_choke, now));
        }
        self.sessions.clear();
    }
}

/// Spawns the swarm on a new task.
pub fn spawn(mut swarm: Swarm) -> task::JoinHandle<Result<()>> {
    task::spawn(async move { swarm.run().await })
}

/// Waits until the socket of any of the sessions is ready for the session's
/// interest and returns the index of the session.
async fn wait_ready(sessions: &[PeerSession<TcpStream>]) -> usize {
    let ready: Vec<_> = sessions
        .iter()
        .enumerate()
        .filter_map(|(index, session)| {
            let interest = session.interest()?;
            let socket = session.socket()?;
            Some(
                async move {
                    // an error is also readiness: the pass will run into it
                    let _ = socket.ready(interest).await;
                    index
                }
                .boxed(),
            )
        })
        .collect();

    if ready.is_empty() {
        future::pending().await
    } else {
        future::select_all(ready).await.0
    }
}
