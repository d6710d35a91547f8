//! The per-connection side of the peer wire protocol.
//!
//! A [`PeerSession`] is a sans-io state machine: it never blocks and never
//! awaits. The driver runs a pass whenever the session's socket is ready for
//! the [`Interest`] the session reports, or when its timers are due, lending
//! the session the torrent wide collaborators for the duration of the pass
//! through a [`SessionContext`].

#[macro_use]
mod peer_log;

pub mod codec;
pub mod error;
mod fast;
mod flood;
pub mod queue;
pub mod request_slot;
pub mod state;

use {
    crate::{
        alert::{Alert, AlertSender},
        conf::SessionConf,
        download::PieceDownload,
        throttle::UploadThrottle,
        BlockInfo, PieceIndex, PieceSet, Storage, TorrentInfo,
    },
    bytes::BytesMut,
    codec::{Handshake, HandshakeCodec, Message, PeerCodec, MAX_BLOCK_LEN},
    error::{PeerError, Result},
    flood::FloodingStat,
    queue::OutboundQueue,
    request_slot::{RequestSlot, RequestSlotTable},
    state::{ConnectionState, PeerSessionState},
    std::{io, net::SocketAddr, sync::Arc, time::Instant},
    tokio::{io::Interest, net::TcpStream},
    tokio_util::codec::Decoder,
};

/// A non-blocking byte stream to a peer.
///
/// Both methods fail with `WouldBlock` if they cannot make progress right
/// now. `read` returns 0 once the peer closed the connection.
pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl Transport for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }
}

/// The collaborators shared by all sessions of a torrent, lent to a single
/// session for the duration of a pass.
pub struct SessionContext<'a> {
    pub piece_set: &'a mut dyn PieceSet,
    pub storage: &'a mut dyn Storage,
    /// Limits the upload of block data across all sessions.
    pub throttle: &'a mut UploadThrottle,
    pub alerts: Option<&'a AlertSender>,
    /// The decision of the choke scheduler for this peer.
    pub should_choke: bool,
    /// The time of the pass.
    pub now: Instant,
}

pub struct PeerSession<T> {
    /// The remote address of the peer.
    addr: SocketAddr,
    /// The socket, which is only set once connected and is dropped when the
    /// session is closed.
    socket: Option<T>,
    /// Shared information of the torrent.
    torrent: Arc<TorrentInfo>,
    conf: SessionConf,
    /// Session related information.
    state: PeerSessionState,
    /// Whether we initiated the connection, in which case we send the first
    /// handshake.
    is_outbound: bool,
    /// The piece we are downloading from this peer.
    download: Option<PieceDownload>,
    /// Our pending requests that we sent to peer. It represents the blocks that
    /// we are expecting. If we receive a block that is not in this table, it
    /// is dropped.
    slots: RequestSlotTable,
    /// The messages waiting to be written to the socket.
    queue: OutboundQueue,
    /// The bytes read from the socket and not yet decoded.
    read_buf: BytesMut,
    codec: PeerCodec,
    flood: FloodingStat,
    /// The number of messages received since the handshake.
    msg_count: u64,
    /// The choke message queued and not yet sent, if any: `Some(true)` for
    /// choke and `Some(false)` for unchoke.
    choke_pending: Option<bool>,
    /// Like `choke_pending` but for our interest.
    interest_pending: Option<bool>,
    /// The position in the piece set's completion log up to which the pieces
    /// were advertised to the peer.
    have_cursor: usize,
    /// The last time the periodic checks were run.
    last_check: Instant,
    /// The last time a message was queued, to know when a keep alive is due.
    last_queued: Instant,
    /// Set if the last write attempt could not send anything because all
    /// queued messages were throttled, in which case we don't wait for the
    /// socket to be writable.
    throttled: bool,
}

impl<T: Transport> PeerSession<T> {
    /// Creates a new outbound session with the peer at the given address. The
    /// session is in the `Connecting` state until [`Self::connected`] is
    /// called.
    pub fn outbound(
        addr: SocketAddr,
        torrent: Arc<TorrentInfo>,
        conf: SessionConf,
        now: Instant,
    ) -> Self {
        Self::new(addr, None, torrent, conf, now, true)
    }

    /// Creates a new session for a connection the peer initiated. The session
    /// waits for the peer's handshake first.
    pub fn inbound(
        addr: SocketAddr,
        socket: T,
        torrent: Arc<TorrentInfo>,
        conf: SessionConf,
        now: Instant,
    ) -> Self {
        let mut session = Self::new(addr, Some(socket), torrent, conf, now, false);
        session.state.connection = ConnectionState::AwaitHandshake;
        session
    }

    fn new(
        addr: SocketAddr,
        socket: Option<T>,
        torrent: Arc<TorrentInfo>,
        conf: SessionConf,
        now: Instant,
        is_outbound: bool,
    ) -> Self {
        let piece_count = torrent.storage.piece_count;
        Self {
            addr,
            socket,
            torrent,
            conf,
            state: PeerSessionState::new(piece_count, now),
            is_outbound,
            download: None,
            slots: RequestSlotTable::default(),
            queue: OutboundQueue::default(),
            read_buf: BytesMut::new(),
            codec: PeerCodec::new(piece_count),
            flood: FloodingStat::new(now),
            msg_count: 0,
            choke_pending: None,
            interest_pending: None,
            have_cursor: 0,
            last_check: now,
            last_queued: now,
            throttled: false,
        }
    }

    /// Hands the connected socket of an outbound session to the session, which
    /// then starts the handshake.
    pub fn connected(&mut self, socket: T, now: Instant) {
        debug_assert_eq!(self.state.connection, ConnectionState::Connecting);
        peer_info!(self, "Connected, sending handshake");
        self.socket = Some(socket);
        self.state.connection = ConnectionState::SendHandshake;
        self.queue_handshake(now);
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The socket of the session, once connected and until closed.
    pub fn socket(&self) -> Option<&T> {
        self.socket.as_ref()
    }

    pub fn state(&self) -> &PeerSessionState {
        &self.state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.connection
    }

    pub fn is_closed(&self) -> bool {
        self.state.connection == ConnectionState::Closed
    }

    /// The number of our outstanding requests.
    pub fn request_slot_count(&self) -> usize {
        self.slots.count()
    }

    /// The piece we are downloading from this peer, if any.
    pub fn in_flight_piece(&self) -> Option<PieceIndex> {
        self.download.as_ref().map(|d| d.piece_index())
    }

    /// The number of messages waiting to be written.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Returns the socket readiness the session waits for, or `None` if it
    /// doesn't have a socket to wait on.
    pub fn interest(&self) -> Option<Interest> {
        let wants_write = !self.queue.is_empty() && !self.throttled;
        match self.state.connection {
            ConnectionState::Connecting | ConnectionState::Closed => None,
            ConnectionState::SendHandshake => Some(Interest::WRITABLE),
            ConnectionState::AwaitHandshake | ConnectionState::Wired => {
                if wants_write {
                    Some(Interest::READABLE.add(Interest::WRITABLE))
                } else {
                    Some(Interest::READABLE)
                }
            }
        }
    }

    /// Returns whether a whole message is buffered, which is processed in the
    /// next pass even if the socket isn't readable.
    pub fn has_buffered_input(&self) -> bool {
        if self.read_buf.len() < 4 {
            return false;
        }
        let mut len = [0; 4];
        len.copy_from_slice(&self.read_buf[..4]);
        self.read_buf.len() >= 4 + u32::from_be_bytes(len) as usize
    }

    /// Runs a single pass of the session.
    ///
    /// An error is fatal to the session: by the time it's returned the session
    /// is closed and everything it held in the piece set is released.
    pub fn pass(&mut self, ctx: &mut SessionContext) -> Result<()> {
        match self.run(ctx) {
            Ok(()) => Ok(()),
            Err(e) => {
                peer_info!(self, "Session error: {}", e);
                self.teardown(ctx);
                Err(e)
            }
        }
    }

    /// Closes the session, e.g. on shutdown.
    pub fn close(&mut self, ctx: &mut SessionContext) {
        if !self.is_closed() {
            peer_info!(self, "Closing session");
            self.teardown(ctx);
        }
    }

    fn run(&mut self, ctx: &mut SessionContext) -> Result<()> {
        match self.state.connection {
            ConnectionState::Connecting | ConnectionState::Closed => {
                return Ok(())
            }
            ConnectionState::SendHandshake => {
                self.flush(ctx)?;
                if self.state.connection == ConnectionState::SendHandshake {
                    return Ok(());
                }
            }
            _ => {}
        }

        if self.state.connection == ConnectionState::AwaitHandshake {
            self.read_socket()?;
            if !self.receive_handshake(ctx)? {
                return self.flush(ctx);
            }
        }

        debug_assert_eq!(self.state.connection, ConnectionState::Wired);
        self.run_wired(ctx)
    }

    fn queue_handshake(&mut self, now: Instant) {
        let mut handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        if self.conf.fast_extension {
            handshake = handshake.with_fast_extension();
        }
        self.send(Message::Handshake(handshake), now);
    }

    /// Decodes and validates the peer's handshake, if it has fully arrived,
    /// and enters the `Wired` state. Returns whether it did.
    fn receive_handshake(&mut self, ctx: &mut SessionContext) -> Result<bool> {
        let handshake = match HandshakeCodec.decode(&mut self.read_buf)? {
            Some(handshake) => handshake,
            None => return Ok(false),
        };
        peer_debug!(
            self,
            "Received handshake (peer id: {})",
            hex::encode(&handshake.peer_id)
        );

        // verify that the advertised torrent info hash is the same as ours
        if handshake.info_hash != self.torrent.info_hash {
            peer_info!(self, "Handshake with invalid info hash");
            return Err(PeerError::InvalidInfoHash);
        }
        if handshake.peer_id == self.torrent.client_id {
            peer_info!(self, "Connected to ourselves");
            return Err(PeerError::SelfConnection);
        }

        self.state.peer_id = Some(handshake.peer_id);
        self.state.fast_extension =
            self.conf.fast_extension && handshake.supports_fast_extension();

        // we only know now whether the peer supports the extensions, so an
        // inbound connection responds only now
        if !self.is_outbound {
            self.queue_handshake(ctx.now);
        }

        self.enter_wired(ctx);
        Ok(true)
    }

    fn enter_wired(&mut self, ctx: &mut SessionContext) {
        let now = ctx.now;
        peer_info!(
            self,
            "Handshake complete (fast extension: {})",
            self.state.fast_extension
        );
        self.state.connection = ConnectionState::Wired;
        self.state.last_activity = now;
        self.state.last_interest = now;
        self.last_check = now;
        self.have_cursor = ctx.piece_set.completion_log().len();

        // announce our pieces
        let fast = self.state.fast_extension;
        if fast && ctx.piece_set.is_complete() {
            self.send(Message::HaveAll, now);
        } else if fast && ctx.piece_set.is_empty() {
            self.send(Message::HaveNone, now);
        } else if !ctx.piece_set.is_empty() {
            let bitfield = ctx.piece_set.own_pieces().clone();
            self.send(Message::Bitfield(bitfield), now);
        }

        if fast {
            let allowed = fast::allowed_fast_set(
                &self.torrent.info_hash,
                self.addr.ip(),
                self.torrent.storage.piece_count,
                self.conf.allowed_fast_set_len,
            );
            peer_debug!(self, "Allowed fast set: {:?}", allowed);
            for piece_index in allowed {
                self.send(Message::AllowedFast { piece_index }, now);
            }
        }
    }

    fn run_wired(&mut self, ctx: &mut SessionContext) -> Result<()> {
        let now = ctx.now;

        self.sync_download(ctx);
        self.apply_choke(ctx);

        if now.saturating_duration_since(self.last_check)
            >= self.conf.check_interval
        {
            self.tick(ctx)?;
            self.last_check = now;
        }

        self.read_socket()?;
        for _ in 0..self.conf.max_messages_per_pass {
            let msg = match self.codec.decode(&mut self.read_buf)? {
                Some(msg) => msg,
                None => break,
            };
            self.handle_msg(ctx, msg)?;
            self.msg_count += 1;
        }

        self.make_requests(ctx);
        self.flush(ctx)
    }

    /// Drops the in-flight piece if it was completed through another peer
    /// (which happens in the end game) and cancels its outstanding requests.
    fn sync_download(&mut self, ctx: &mut SessionContext) {
        let index = match &self.download {
            Some(download) => download.piece_index(),
            None => return,
        };
        if !ctx.piece_set.has(index) {
            return;
        }

        peer_debug!(self, "Piece {} was completed elsewhere", index);
        self.download = None;
        for slot in self.slots.remove_acquired(|s| s.piece_index == index) {
            self.send(Message::Cancel(slot.block_info()), ctx.now);
        }
    }

    fn apply_choke(&mut self, ctx: &mut SessionContext) {
        let is_choking = self.choke_pending.unwrap_or(self.state.am_choking);
        if ctx.should_choke == is_choking {
            return;
        }
        if ctx.should_choke {
            peer_info!(self, "Choking peer");
            self.send(Message::Choke, ctx.now);
        } else {
            peer_info!(self, "Unchoking peer");
            self.send(Message::Unchoke, ctx.now);
        }
        self.choke_pending = Some(ctx.should_choke);
    }

    /// Runs the periodic chores of the session.
    fn tick(&mut self, ctx: &mut SessionContext) -> Result<()> {
        let now = ctx.now;

        if let Err(flood) = self.flood.check(
            now,
            self.conf.flooding_window,
            self.conf.choke_flood_ratio,
            self.conf.keep_alive_flood_ratio,
        ) {
            peer_warn!(self, "Peer is flooding us: {:?}", flood);
            return Err(PeerError::Flooding);
        }

        let expired = self.slots.expire(self.conf.request_timeout, now);
        if !expired.is_empty() {
            peer_info!(self, "{} request(s) timed out", expired.len());
            self.state.snubbing = true;
            if let Some(download) = &mut self.download {
                for slot in expired.iter() {
                    if slot.piece_index == download.piece_index() {
                        download.cancel_request(&slot.block_info());
                    }
                }
            }
        }

        self.advertise_pieces(ctx);

        if now.saturating_duration_since(self.last_queued)
            >= self.conf.keep_alive_interval
        {
            peer_trace!(self, "Sending keep alive");
            self.send(Message::KeepAlive, now);
        }

        if self.state.am_interested || self.state.peer_interested {
            self.state.last_interest = now;
        } else if now.saturating_duration_since(self.state.last_interest)
            >= self.conf.not_interested_timeout
        {
            return Err(PeerError::NotMutuallyInterested);
        }

        if now.saturating_duration_since(self.state.last_activity)
            >= self.conf.inactivity_timeout
        {
            return Err(PeerError::InactivityTimeout);
        }

        Ok(())
    }

    /// Tells the peer about the pieces completed since the last
    /// advertisement, in a single message if there are many of them.
    fn advertise_pieces(&mut self, ctx: &mut SessionContext) {
        let log = ctx.piece_set.completion_log();
        if self.have_cursor >= log.len() {
            return;
        }
        let completed = log[self.have_cursor..].to_vec();
        self.have_cursor = log.len();

        if completed.len() >= self.conf.have_batch_threshold {
            peer_debug!(self, "Advertising {} pieces at once", completed.len());
            if self.state.fast_extension && ctx.piece_set.is_complete() {
                self.send(Message::HaveAll, ctx.now);
            } else {
                let bitfield = ctx.piece_set.own_pieces().clone();
                self.send(Message::Bitfield(bitfield), ctx.now);
            }
        } else {
            for piece_index in completed {
                self.send(Message::Have { piece_index }, ctx.now);
            }
        }
    }

    /// Handles a message received in the `Wired` state.
    fn handle_msg(&mut self, ctx: &mut SessionContext, msg: Message) -> Result<()> {
        if let Some(id) = msg.id() {
            if id.is_fast_extension() && !self.state.fast_extension {
                peer_warn!(self, "Sent {:?} without the fast extension", id);
                return Err(PeerError::FastExtensionDisabled(id));
            }
        }

        let piece_count = self.torrent.storage.piece_count;
        match msg {
            // the wire codec only decodes handshakes before the session is
            // wired
            Message::Handshake(_) => {}
            Message::KeepAlive => {
                peer_trace!(self, "Sent keep alive");
                self.flood.record_keep_alive();
            }
            Message::Choke => self.handle_choke(ctx),
            Message::Unchoke => {
                if self.state.peer_choking {
                    peer_info!(self, "Peer unchoked us");
                    self.flood.record_choke_unchoke();
                    self.state.peer_choking = false;
                }
            }
            Message::Interested => {
                if !self.state.peer_interested {
                    peer_info!(self, "Peer is interested");
                    self.state.peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.state.peer_interested {
                    peer_info!(self, "Peer is not interested");
                    self.state.peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                if piece_index as usize >= piece_count {
                    return Err(PeerError::InvalidPieceIndex);
                }
                if !self.state.bitfield[piece_index as usize] {
                    self.state.bitfield.set(piece_index as usize, true);
                    ctx.piece_set.register_have(piece_index);
                }
            }
            Message::Bitfield(bitfield) => {
                if self.msg_count > 0 {
                    peer_warn!(self, "Sent bitfield not right after handshake");
                }
                self.set_bitfield(ctx, bitfield);
            }
            Message::HaveAll => {
                self.set_bitfield(ctx, crate::Bitfield::repeat(true, piece_count));
            }
            Message::HaveNone => {
                self.set_bitfield(ctx, crate::Bitfield::repeat(false, piece_count));
            }
            Message::Request(block) => self.handle_request(ctx, block)?,
            Message::Cancel(block) => {
                let removed = self.queue.remove_pieces_matching(
                    block.piece_index,
                    block.offset,
                    block.len,
                );
                if removed == 0 {
                    peer_debug!(self, "Nothing to cancel for {:?}", block);
                }
            }
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                let block = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block(ctx, block, data)?;
            }
            Message::Port(port) => {
                peer_debug!(self, "Peer DHT port: {}", port);
                if let Some(alerts) = ctx.alerts {
                    // the receiving half may be gone, which is fine
                    let _ = alerts.send(Alert::DhtPort {
                        addr: self.addr,
                        port,
                    });
                }
            }
            Message::SuggestPiece { piece_index } => {
                peer_debug!(self, "Peer suggests piece {}", piece_index);
            }
            Message::Reject(block) => {
                match self.slots.remove_matching(
                    block.piece_index,
                    block.offset,
                    block.len,
                ) {
                    Some(slot) => {
                        peer_debug!(self, "Peer rejected {:?}", block);
                        if let Some(download) = &mut self.download {
                            if download.piece_index() == slot.piece_index {
                                download.cancel_request(&slot.block_info());
                            }
                        }
                    }
                    None => {
                        peer_warn!(self, "Rejected not requested {:?}", block);
                    }
                }
            }
            Message::AllowedFast { piece_index } => {
                if piece_index as usize >= piece_count {
                    return Err(PeerError::InvalidPieceIndex);
                }
                self.state.peer_allowed_fast.insert(piece_index);
            }
        }

        Ok(())
    }

    fn set_bitfield(&mut self, ctx: &mut SessionContext, bitfield: crate::Bitfield) {
        peer_debug!(self, "Peer has {} piece(s)", bitfield.count_ones());
        ctx.piece_set.unregister_bitfield(&self.state.bitfield);
        ctx.piece_set.register_bitfield(&bitfield);
        self.state.bitfield = bitfield;
        self.state.received_availability = true;
    }

    fn handle_choke(&mut self, ctx: &mut SessionContext) {
        if !self.state.peer_choking {
            peer_info!(self, "Peer choked us");
            self.flood.record_choke_unchoke();
            self.state.peer_choking = true;
        }
        self.state.snubbing = false;

        // requests for allowed fast pieces are still served while choked
        let is_allowed_fast = match &self.download {
            Some(download) => {
                self.state.fast_extension
                    && self
                        .state
                        .peer_allowed_fast
                        .contains(&download.piece_index())
            }
            None => false,
        };
        if is_allowed_fast {
            return;
        }

        // we don't expect to receive blocks for our pending requests
        let cancelled = self.slots.drain();
        if let Some(download) = self.download.take() {
            peer_debug!(
                self,
                "Relinquishing piece {} ({} request(s))",
                download.piece_index(),
                cancelled.len()
            );
            ctx.piece_set.cancel(download.piece_index());
        }
    }

    fn handle_request(
        &mut self,
        ctx: &mut SessionContext,
        block: BlockInfo,
    ) -> Result<()> {
        if !self.torrent.storage.is_valid_block(&block) || block.len > MAX_BLOCK_LEN
        {
            peer_warn!(self, "Requested invalid block {:?}", block);
            return Err(PeerError::InvalidBlock(block));
        }
        self.state.last_activity = ctx.now;

        // a choke queued but not yet sent already applies
        let is_choking = self.choke_pending.unwrap_or(self.state.am_choking);
        let index = block.piece_index;
        let may_download =
            !is_choking || self.state.am_allowed_fast.contains(&index);
        if ctx.piece_set.has(index) && may_download {
            peer_trace!(self, "Serving {:?}", block);
            let offset = self.torrent.storage.torrent_offset(&block);
            let data = ctx
                .storage
                .read(offset, block.len as usize)
                .map_err(PeerError::Storage)?;
            self.send(
                Message::Piece {
                    piece_index: index,
                    offset: block.offset,
                    data,
                },
                ctx.now,
            );
        } else if self.state.fast_extension {
            peer_debug!(self, "Rejecting {:?}", block);
            self.send(Message::Reject(block), ctx.now);
        } else {
            peer_debug!(self, "Ignoring {:?}", block);
        }
        Ok(())
    }

    /// Verifies that the block was requested, saves it, and finishes the piece
    /// if this was its last missing block.
    fn handle_block(
        &mut self,
        ctx: &mut SessionContext,
        block: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        peer_trace!(self, "Received block {:?}", block);

        if self
            .slots
            .remove_matching(block.piece_index, block.offset, block.len)
            .is_none()
        {
            // peer could keep us busy with unwanted blocks, but they are
            // dropped without being written
            peer_warn!(self, "Sent not requested block {:?}", block);
            return Ok(());
        }
        let download = match &mut self.download {
            Some(download) if download.piece_index() == block.piece_index => {
                download
            }
            _ => {
                peer_warn!(self, "Sent block of another piece {:?}", block);
                return Ok(());
            }
        };

        let offset = self.torrent.storage.torrent_offset(&block);
        ctx.storage.write(offset, &data).map_err(PeerError::Storage)?;
        self.state.downloaded += block.len as u64;
        self.state.last_activity = ctx.now;

        download.received_block(&block);
        if download.is_complete() {
            self.finish_piece(ctx);
        }
        Ok(())
    }

    fn finish_piece(&mut self, ctx: &mut SessionContext) {
        let mut download = match self.download.take() {
            Some(download) => download,
            None => return,
        };
        let index = download.piece_index();

        // in the end game another session may have been faster
        if ctx.piece_set.has(index) {
            peer_debug!(self, "Piece {} already complete", index);
            return;
        }

        if ctx.storage.verify_hash(index) {
            peer_info!(self, "Finished piece {} ({} bytes)", index, download.len());
            ctx.piece_set.mark_complete(index);
        } else {
            peer_warn!(self, "Piece {} hash mismatch, downloading again", index);
            download.reset();
            self.download = Some(download);
        }
    }

    /// Picks a piece to download if we have none and fills the request
    /// pipeline.
    fn make_requests(&mut self, ctx: &mut SessionContext) {
        let fast = self.state.fast_extension;

        if self.download.is_none() {
            let allowed = if !self.state.peer_choking {
                Some(None)
            } else if fast && !self.state.peer_allowed_fast.is_empty() {
                Some(Some(&self.state.peer_allowed_fast))
            } else {
                None
            };
            if let Some(allowed) = allowed {
                if let Some(index) =
                    ctx.piece_set.missing_for(&self.state.bitfield, allowed)
                {
                    peer_info!(self, "Downloading piece {}", index);
                    let len = ctx.piece_set.piece_len(index);
                    self.download = Some(PieceDownload::new(index, len));
                }
            }
        }

        self.update_interest(ctx);

        let download = match &mut self.download {
            Some(download) => download,
            None => return,
        };
        let index = download.piece_index();
        if self.state.peer_choking
            && !(fast && self.state.peer_allowed_fast.contains(&index))
        {
            return;
        }

        let count = self.conf.pipeline_len.saturating_sub(self.slots.count());
        if count == 0 || download.count_free_blocks() == 0 {
            return;
        }
        let mut blocks = Vec::with_capacity(count);
        if ctx.piece_set.is_end_game() {
            download.pick_end_game_blocks(count, &mut blocks);
        } else {
            download.pick_blocks(count, &mut blocks);
        }
        if blocks.is_empty() {
            return;
        }

        let missing = download.count_missing_blocks();
        peer_debug!(
            self,
            "Requesting {} block(s) ({} pending, {} missing in piece {})",
            blocks.len(),
            self.slots.count(),
            missing,
            index
        );
        for block in blocks {
            debug_assert!(!self
                .slots
                .contains_block(block.piece_index, block.index_in_piece() as u32));
            self.slots.add(RequestSlot::new(block, ctx.now));
            self.send(Message::Request(block), ctx.now);
        }
    }

    /// Tells the peer whether we are interested in it when this changes.
    fn update_interest(&mut self, ctx: &mut SessionContext) {
        let interested = self.download.is_some()
            || ctx.piece_set.has_missing_for(&self.state.bitfield);
        let is_interested =
            self.interest_pending.unwrap_or(self.state.am_interested);
        if interested == is_interested {
            return;
        }
        if interested {
            peer_info!(self, "Interested in peer");
            self.send(Message::Interested, ctx.now);
        } else {
            peer_info!(self, "Not interested in peer");
            self.send(Message::NotInterested, ctx.now);
        }
        self.interest_pending = Some(interested);
    }

    fn send(&mut self, msg: Message, now: Instant) {
        self.queue.push(msg);
        self.last_queued = now;
    }

    /// Reads everything the socket has into the read buffer, up to the
    /// largest message we accept.
    fn read_socket(&mut self) -> Result<()> {
        let limit = codec::HANDSHAKE_LEN
            + 4
            + codec::max_payload_len(self.torrent.storage.piece_count);
        let socket = match &mut self.socket {
            Some(socket) => socket,
            None => return Ok(()),
        };

        let mut buf = [0; 0x4000];
        while self.read_buf.len() < limit {
            match socket.read(&mut buf) {
                Ok(0) => return Err(PeerError::ConnectionClosed),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&buf[..n]);
                    self.state.downloaded_protocol += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Writes the queued messages and applies the effects of those fully
    /// sent.
    fn flush(&mut self, ctx: &mut SessionContext) -> Result<()> {
        let now = ctx.now;
        loop {
            let socket = match &mut self.socket {
                Some(socket) => socket,
                None => return Ok(()),
            };
            if self.queue.is_empty() {
                self.throttled = false;
                return Ok(());
            }

            let throttle = &mut *ctx.throttle;
            let outcome = self.queue.drain(
                |msg| match msg {
                    Message::Piece { .. } => {
                        throttle.try_consume(msg.wire_len(), now)
                    }
                    _ => true,
                },
                |buf| socket.write(buf),
            )?;
            self.state.uploaded_protocol += outcome.bytes_written as u64;
            self.throttled =
                outcome.deferred > 0 && outcome.deferred == self.queue.len();
            if self.throttled {
                peer_trace!(self, "{} message(s) throttled", outcome.deferred);
            }

            // the drain stops after a choke, whose effects must apply before
            // the messages behind it are written
            let choked = matches!(outcome.sent.last(), Some(Message::Choke));
            for msg in outcome.sent {
                self.on_sent(msg, now);
            }
            if !choked {
                return Ok(());
            }
        }
    }

    /// Applies the state transitions of a message that was fully written.
    fn on_sent(&mut self, msg: Message, now: Instant) {
        match msg {
            Message::Handshake(_) => {
                if self.state.connection == ConnectionState::SendHandshake {
                    peer_debug!(self, "Handshake sent");
                    self.state.connection = ConnectionState::AwaitHandshake;
                }
            }
            Message::Choke => {
                self.state.am_choking = true;
                if self.choke_pending == Some(true) {
                    self.choke_pending = None;
                }
                let dropped = self.queue.remove_unsent_pieces();
                if !dropped.is_empty() {
                    peer_debug!(self, "Dropped {} queued block(s)", dropped.len());
                }
                if self.state.fast_extension {
                    for block in dropped {
                        self.send(Message::Reject(block), now);
                    }
                }
            }
            Message::Unchoke => {
                self.state.am_choking = false;
                if self.choke_pending == Some(false) {
                    self.choke_pending = None;
                }
            }
            Message::Interested => {
                self.state.am_interested = true;
                if self.interest_pending == Some(true) {
                    self.interest_pending = None;
                }
            }
            Message::NotInterested => {
                self.state.am_interested = false;
                if self.interest_pending == Some(false) {
                    self.interest_pending = None;
                }
            }
            Message::AllowedFast { piece_index } => {
                self.state.am_allowed_fast.insert(piece_index);
            }
            Message::Piece { data, .. } => {
                self.state.uploaded += data.len() as u64;
            }
            _ => {}
        }
    }

    /// Releases everything the session holds in the piece set and closes the
    /// connection.
    fn teardown(&mut self, ctx: &mut SessionContext) {
        let slots = self.slots.drain();
        if let Some(download) = self.download.take() {
            let index = download.piece_index();
            peer_debug!(
                self,
                "Releasing piece {} ({} request(s))",
                index,
                slots.len()
            );
            if !ctx.piece_set.has(index) {
                ctx.piece_set.cancel(index);
            }
        }
        ctx.piece_set.unregister_bitfield(&self.state.bitfield);
        self.state.bitfield.fill(false);
        self.state.connection = ConnectionState::Closed;
        // dropping the socket deregisters its interest
        self.socket = None;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        net::{IpAddr, Ipv4Addr},
        rc::Rc,
        time::Duration,
    };

    use super::*;
    use crate::{
        Bitfield, MemoryStorage, PiecePicker, StorageInfo, BLOCK_LEN,
    };
    use codec::MessageId;
    use pretty_assertions::assert_eq;

    const INFO_HASH: [u8; 20] = [0x11; 20];
    const CLIENT_ID: [u8; 20] = [0x22; 20];
    const PEER_ID: [u8; 20] = [0x33; 20];
    const PIECE_LEN: u32 = 2 * BLOCK_LEN;

    #[derive(Default)]
    struct MockIo {
        input: Vec<u8>,
        output: Vec<u8>,
        closed: bool,
        write_limit: Option<usize>,
    }

    /// A socket whose input is fed and whose output is inspected by the test.
    #[derive(Clone, Default)]
    struct MockSocket(Rc<RefCell<MockIo>>);

    impl Transport for MockSocket {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut io = self.0.borrow_mut();
            if io.input.is_empty() {
                if io.closed {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(io.input.len());
            buf[..n].copy_from_slice(&io.input[..n]);
            io.input.drain(..n);
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut io = self.0.borrow_mut();
            let n = io.write_limit.map(|l| l.min(buf.len())).unwrap_or(buf.len());
            io.output.extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    impl MockSocket {
        fn feed(&self, msgs: &[Message]) {
            for msg in msgs {
                self.0.borrow_mut().input.extend(codec::encode(msg));
            }
        }

        fn feed_handshake(&self, info_hash: [u8; 20], fast: bool) {
            let mut handshake = Handshake::new(info_hash, PEER_ID);
            if fast {
                handshake = handshake.with_fast_extension();
            }
            self.feed(&[Message::Handshake(handshake)]);
        }

        /// Takes the written bytes and decodes them, with a leading handshake
        /// if `handshake` is set.
        fn sent(&self, piece_count: usize, handshake: bool) -> Vec<Message> {
            let output = std::mem::take(&mut self.0.borrow_mut().output);
            let mut buf = BytesMut::from(&output[..]);
            let mut msgs = Vec::new();
            if handshake {
                let handshake = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
                msgs.push(Message::Handshake(handshake));
            }
            let mut codec = PeerCodec::new(piece_count);
            while let Some(msg) = codec.decode(&mut buf).unwrap() {
                msgs.push(msg);
            }
            assert!(buf.is_empty());
            msgs
        }
    }

    /// The torrent wide collaborators of the sessions under test.
    struct Env {
        torrent: Arc<TorrentInfo>,
        picker: PiecePicker,
        storage: MemoryStorage,
        throttle: UploadThrottle,
        should_choke: bool,
        now: Instant,
    }

    impl Env {
        fn data(piece_count: usize) -> Vec<u8> {
            (0..piece_count * PIECE_LEN as usize)
                .map(|i| (i % 251) as u8)
                .collect()
        }

        fn torrent(piece_count: usize) -> Arc<TorrentInfo> {
            Arc::new(TorrentInfo {
                info_hash: INFO_HASH,
                client_id: CLIENT_ID,
                storage: StorageInfo::new(
                    piece_count as u64 * PIECE_LEN as u64,
                    PIECE_LEN,
                ),
            })
        }

        /// We have all pieces.
        fn seed(piece_count: usize) -> Self {
            let storage = MemoryStorage::with_data(Self::data(piece_count), PIECE_LEN);
            Self {
                torrent: Self::torrent(piece_count),
                picker: PiecePicker::with_own_pieces(
                    Bitfield::repeat(true, piece_count),
                    PIECE_LEN,
                    PIECE_LEN,
                ),
                storage,
                throttle: UploadThrottle::unlimited(),
                should_choke: false,
                now: Instant::now(),
            }
        }

        /// We have no pieces. The end game is off unless a test turns it on.
        fn leech(piece_count: usize) -> Self {
            let seed = MemoryStorage::with_data(Self::data(piece_count), PIECE_LEN);
            let mut picker = PiecePicker::new(piece_count, PIECE_LEN, PIECE_LEN);
            picker.set_end_game_threshold(0);
            Self {
                torrent: Self::torrent(piece_count),
                picker,
                storage: MemoryStorage::new(
                    piece_count as u64 * PIECE_LEN as u64,
                    PIECE_LEN,
                    seed.piece_hashes().to_vec(),
                ),
                throttle: UploadThrottle::unlimited(),
                should_choke: true,
                now: Instant::now(),
            }
        }

        fn addr() -> SocketAddr {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)), 6881)
        }

        fn conf(fast: bool) -> SessionConf {
            SessionConf {
                fast_extension: fast,
                ..SessionConf::default()
            }
        }

        fn pass(&mut self, session: &mut PeerSession<MockSocket>) -> Result<()> {
            let mut ctx = SessionContext {
                piece_set: &mut self.picker,
                storage: &mut self.storage,
                throttle: &mut self.throttle,
                alerts: None,
                should_choke: self.should_choke,
                now: self.now,
            };
            session.pass(&mut ctx)
        }

        fn advance(&mut self, duration: Duration) {
            self.now += duration;
        }

        /// Returns an inbound session that completed the handshake, and the
        /// messages it sent after its handshake.
        fn wired(
            &mut self,
            fast: bool,
        ) -> (PeerSession<MockSocket>, MockSocket, Vec<Message>) {
            self.wired_with(Self::conf(fast))
        }

        fn wired_with(
            &mut self,
            conf: SessionConf,
        ) -> (PeerSession<MockSocket>, MockSocket, Vec<Message>) {
            let fast = conf.fast_extension;
            let socket = MockSocket::default();
            let mut session = PeerSession::inbound(
                Self::addr(),
                socket.clone(),
                Arc::clone(&self.torrent),
                conf,
                self.now,
            );
            socket.feed_handshake(INFO_HASH, fast);
            self.pass(&mut session).unwrap();
            assert_eq!(session.connection_state(), ConnectionState::Wired);

            let mut sent = socket.sent(self.torrent.storage.piece_count, true);
            match sent.remove(0) {
                Message::Handshake(handshake) => {
                    assert_eq!(handshake.peer_id, CLIENT_ID);
                    assert_eq!(handshake.supports_fast_extension(), fast);
                }
                msg => panic!("expected handshake, got {:?}", msg),
            }
            (session, socket, sent)
        }
    }

    /// The piece messages answering the requests, with the right data.
    fn answers(blocks: &[BlockInfo], data: &[u8]) -> Vec<Message> {
        blocks
            .iter()
            .map(|b| {
                let start = b.piece_index as usize * PIECE_LEN as usize
                    + b.offset as usize;
                Message::Piece {
                    piece_index: b.piece_index,
                    offset: b.offset,
                    data: data[start..start + b.len as usize].to_vec(),
                }
            })
            .collect()
    }

    fn requests(msgs: &[Message]) -> Vec<BlockInfo> {
        msgs.iter()
            .filter_map(|msg| match msg {
                Message::Request(block) => Some(*block),
                _ => None,
            })
            .collect()
    }

    // Tests that an inbound session with a matching info hash becomes wired,
    // and that one with a different info hash is closed with an error.
    #[test]
    fn test_inbound_handshake() {
        let mut env = Env::seed(8);
        let (session, _, sent) = env.wired(false);
        assert_eq!(session.state().peer_id, Some(PEER_ID));
        assert!(!session.state().fast_extension);
        assert!(matches!(sent[0], Message::Bitfield(_)));

        let socket = MockSocket::default();
        let mut session = PeerSession::inbound(
            Env::addr(),
            socket.clone(),
            Arc::clone(&env.torrent),
            Env::conf(false),
            env.now,
        );
        socket.feed_handshake([0xff; 20], false);
        let result = env.pass(&mut session);
        assert!(matches!(result, Err(PeerError::InvalidInfoHash)));
        assert_eq!(session.connection_state(), ConnectionState::Closed);
        assert_eq!(session.interest(), None);
    }

    // Tests the outbound handshake sequence through all connection states,
    // including a handshake that takes several writes.
    #[test]
    fn test_outbound_handshake() {
        let mut env = Env::leech(8);
        let mut session = PeerSession::outbound(
            Env::addr(),
            Arc::clone(&env.torrent),
            Env::conf(true),
            env.now,
        );
        assert_eq!(session.connection_state(), ConnectionState::Connecting);
        assert_eq!(session.interest(), None);

        let socket = MockSocket::default();
        socket.0.borrow_mut().write_limit = Some(40);
        session.connected(socket.clone(), env.now);
        assert_eq!(session.connection_state(), ConnectionState::SendHandshake);
        assert_eq!(session.interest(), Some(Interest::WRITABLE));

        env.pass(&mut session).unwrap();
        assert_eq!(session.connection_state(), ConnectionState::SendHandshake);
        env.pass(&mut session).unwrap();
        assert_eq!(session.connection_state(), ConnectionState::AwaitHandshake);
        socket.0.borrow_mut().write_limit = None;

        socket.feed_handshake(INFO_HASH, true);
        env.pass(&mut session).unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Wired);
        assert!(session.state().fast_extension);

        let sent = socket.sent(8, true);
        // an empty piece set is announced with have none in the fast
        // extension, followed by the allowed fast set
        assert_eq!(sent[1], Message::HaveNone);
        let allowed: Vec<_> = sent[2..]
            .iter()
            .filter(|m| matches!(m, Message::AllowedFast { .. }))
            .collect();
        assert_eq!(allowed.len(), 8);
        assert_eq!(session.state().am_allowed_fast.len(), 8);
    }

    // Tests that connecting to ourselves is detected.
    #[test]
    fn test_self_connection() {
        let mut env = Env::seed(8);
        let socket = MockSocket::default();
        let mut session = PeerSession::inbound(
            Env::addr(),
            socket.clone(),
            Arc::clone(&env.torrent),
            Env::conf(false),
            env.now,
        );
        socket.feed(&[Message::Handshake(Handshake::new(INFO_HASH, CLIENT_ID))]);
        assert!(matches!(
            env.pass(&mut session),
            Err(PeerError::SelfConnection)
        ));
    }

    // Tests that a full bitfield of exactly the piece count is accepted, and
    // that stray bits past the piece count close the session.
    #[test]
    fn test_bitfield_validation() {
        let mut env = Env::leech(8);
        let (mut session, socket, _) = env.wired(false);
        socket.feed(&[Message::Bitfield(Bitfield::from_vec(vec![0xff]))]);
        env.pass(&mut session).unwrap();
        assert!(session.state().bitfield.all());
        assert_eq!(env.picker.frequency(7), 1);

        let mut env = Env::leech(5);
        let (mut session, socket, _) = env.wired(false);
        // the codec would refuse to encode it, so write the raw bytes
        socket
            .0
            .borrow_mut()
            .input
            .extend_from_slice(&[0, 0, 0, 2, MessageId::Bitfield as u8, 0xff]);
        let result = env.pass(&mut session);
        assert!(matches!(
            result,
            Err(PeerError::Protocol(
                crate::peer::error::ProtocolError::InvalidBitfield
            ))
        ));
        assert!(session.is_closed());
    }

    // Tests that a request for a piece we have is served with the block when
    // we're not choking the peer.
    #[test]
    fn test_serve_request() {
        let mut env = Env::seed(8);
        let (mut session, socket, sent) = env.wired(false);
        // the unchoke went out right after the handshake
        assert!(sent.contains(&Message::Unchoke));
        assert!(!session.state().am_choking);

        let block = BlockInfo {
            piece_index: 3,
            offset: 0,
            len: BLOCK_LEN,
        };
        socket.feed(&[Message::Interested, Message::Request(block)]);
        env.pass(&mut session).unwrap();

        let sent = socket.sent(8, false);
        let start = 3 * PIECE_LEN as usize;
        assert_eq!(
            sent,
            vec![Message::Piece {
                piece_index: 3,
                offset: 0,
                data: env.storage.data()[start..start + BLOCK_LEN as usize]
                    .to_vec(),
            }]
        );
        assert_eq!(session.state().uploaded, BLOCK_LEN as u64);
        assert!(session.state().peer_interested);
    }

    // Tests that requests while choking are rejected with the fast extension
    // unless they are in the allowed fast set, and that invalid requests are
    // fatal.
    #[test]
    fn test_reject_request_while_choking() {
        let mut env = Env::seed(30);
        env.should_choke = true;
        let (mut session, socket, sent) = env.wired(true);
        assert_eq!(sent[0], Message::HaveAll);

        let allowed = *session.state().am_allowed_fast.iter().next().unwrap();
        let not_allowed = (0..30)
            .find(|i| !session.state().am_allowed_fast.contains(i))
            .unwrap();
        let block = |piece_index| BlockInfo {
            piece_index,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        socket.feed(&[
            Message::Request(block(not_allowed)),
            Message::Request(block(allowed)),
        ]);
        env.pass(&mut session).unwrap();

        let sent = socket.sent(30, false);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], Message::Reject(block(not_allowed)));
        assert_eq!(sent[1].piece_block_info(), Some(block(allowed)));

        socket.feed(&[Message::Request(BlockInfo {
            piece_index: 0,
            offset: PIECE_LEN - 10,
            len: BLOCK_LEN,
        })]);
        assert!(matches!(
            env.pass(&mut session),
            Err(PeerError::InvalidBlock(_))
        ));
    }

    // Tests that a piece message queued behind the throttle is removed by the
    // peer's cancel, and that deferred messages don't make the session wait
    // for writability.
    #[test]
    fn test_throttled_piece_cancelled() {
        let mut env = Env::seed(8);
        let (mut session, socket, _) = env.wired(false);

        // drain the bucket
        env.throttle = UploadThrottle::new(Some(1), env.now);
        assert!(env.throttle.try_consume((4 + 9 + MAX_BLOCK_LEN) as usize, env.now));

        let block = BlockInfo {
            piece_index: 1,
            offset: 0,
            len: BLOCK_LEN,
        };
        socket.feed(&[Message::Request(block)]);
        env.pass(&mut session).unwrap();
        assert!(socket.sent(8, false).is_empty());
        assert_eq!(session.queue_len(), 1);
        assert_eq!(session.interest(), Some(Interest::READABLE));

        socket.feed(&[Message::Cancel(block)]);
        env.pass(&mut session).unwrap();
        assert_eq!(session.queue_len(), 0);
    }

    // Tests that without the fast extension any fast extension message is a
    // protocol violation.
    #[test]
    fn test_fast_extension_message_when_disabled() {
        let mut env = Env::leech(8);
        let (mut session, socket, _) = env.wired(false);
        socket.feed(&[Message::HaveAll]);
        assert!(matches!(
            env.pass(&mut session),
            Err(PeerError::FastExtensionDisabled(MessageId::HaveAll))
        ));
        assert!(session.is_closed());
    }

    // Tests downloading a piece from a seed: interest, requests after the
    // unchoke, and committing the verified piece.
    #[test]
    fn test_download_piece() {
        let mut env = Env::leech(1);
        let data = Env::data(1);
        let (mut session, socket, _) = env.wired(false);

        socket.feed(&[Message::Bitfield(Bitfield::repeat(true, 1))]);
        env.pass(&mut session).unwrap();
        // choked, so only interest is declared
        assert_eq!(socket.sent(1, false), vec![Message::Interested]);
        assert!(session.state().am_interested);

        socket.feed(&[Message::Unchoke]);
        env.pass(&mut session).unwrap();
        let blocks = requests(&socket.sent(1, false));
        // blocks are requested in order outside the end game
        assert_eq!(
            blocks,
            vec![
                BlockInfo {
                    piece_index: 0,
                    offset: 0,
                    len: BLOCK_LEN
                },
                BlockInfo {
                    piece_index: 0,
                    offset: BLOCK_LEN,
                    len: BLOCK_LEN
                },
            ]
        );
        assert_eq!(session.request_slot_count(), 2);
        assert_eq!(session.in_flight_piece(), Some(0));

        let pieces: Vec<_> = blocks
            .iter()
            .map(|b| Message::Piece {
                piece_index: b.piece_index,
                offset: b.offset,
                data: data[b.offset as usize..(b.offset + b.len) as usize]
                    .to_vec(),
            })
            .collect();
        socket.feed(&pieces);
        env.pass(&mut session).unwrap();
        assert!(env.picker.has(0));
        assert_eq!(session.in_flight_piece(), None);
        assert_eq!(session.state().downloaded, PIECE_LEN as u64);
        // nothing left to download
        assert_eq!(socket.sent(1, false), vec![Message::NotInterested]);
    }

    // Tests that a piece failing its hash check is downloaded again without
    // closing the session.
    #[test]
    fn test_hash_mismatch_rerequests_piece() {
        let mut env = Env::leech(1);
        let (mut session, socket, _) = env.wired(false);
        socket.feed(&[
            Message::Bitfield(Bitfield::repeat(true, 1)),
            Message::Unchoke,
        ]);
        env.pass(&mut session).unwrap();
        let blocks = requests(&socket.sent(1, false));
        assert_eq!(blocks.len(), 2);

        let garbage: Vec<_> = blocks
            .iter()
            .map(|b| Message::Piece {
                piece_index: b.piece_index,
                offset: b.offset,
                data: vec![0xee; b.len as usize],
            })
            .collect();
        socket.feed(&garbage);
        env.pass(&mut session).unwrap();

        assert!(!env.picker.has(0));
        assert_eq!(session.in_flight_piece(), Some(0));
        let mut again = requests(&socket.sent(1, false));
        let mut blocks = blocks;
        again.sort();
        blocks.sort();
        assert_eq!(again, blocks);
    }

    // Tests that being choked cancels the outstanding requests and gives the
    // piece back to the piece set.
    #[test]
    fn test_choke_clears_requests() {
        let mut env = Env::leech(8);
        let (mut session, socket, _) = env.wired(false);
        socket.feed(&[
            Message::Bitfield(Bitfield::repeat(true, 8)),
            Message::Unchoke,
        ]);
        env.pass(&mut session).unwrap();
        let index = session.in_flight_piece().unwrap();
        assert_eq!(session.request_slot_count(), 2);
        assert_eq!(env.picker.pending_count(index), 1);

        socket.feed(&[Message::Choke]);
        env.pass(&mut session).unwrap();
        assert_eq!(session.request_slot_count(), 0);
        assert_eq!(session.in_flight_piece(), None);
        assert_eq!(env.picker.pending_count(index), 0);
        assert!(session.state().peer_choking);
    }

    // Tests that requests for an allowed fast piece survive a choke.
    #[test]
    fn test_choke_keeps_allowed_fast_requests() {
        let mut env = Env::leech(8);
        let (mut session, socket, _) = env.wired(true);
        socket.feed(&[
            Message::HaveAll,
            Message::AllowedFast { piece_index: 5 },
        ]);
        env.pass(&mut session).unwrap();
        // choked, but the allowed fast piece can be downloaded
        assert_eq!(session.in_flight_piece(), Some(5));
        assert_eq!(requests(&socket.sent(8, false)).len(), 2);

        socket.feed(&[Message::Unchoke, Message::Choke]);
        env.pass(&mut session).unwrap();
        assert_eq!(session.in_flight_piece(), Some(5));
        assert_eq!(session.request_slot_count(), 2);
    }

    // Tests that a peer rapidly changing its choke state is disconnected.
    #[test]
    fn test_choke_flooding() {
        let mut env = Env::leech(8);
        let (mut session, socket, _) = env.wired(false);
        socket.feed(&[Message::Unchoke, Message::Choke]);
        env.pass(&mut session).unwrap();

        env.advance(Duration::from_millis(500));
        assert!(matches!(env.pass(&mut session), Err(PeerError::Flooding)));
        assert!(session.is_closed());
    }

    // Tests that newly completed pieces are advertised individually, and in a
    // single bitfield once there are enough of them.
    #[test]
    fn test_have_batching() {
        let mut env = Env::leech(30);
        let (mut session, socket, _) = env.wired(false);
        socket.feed(&[Message::Interested]);
        env.pass(&mut session).unwrap();

        for index in 0..3 {
            env.picker.mark_complete(index);
        }
        env.advance(Duration::from_millis(500));
        env.pass(&mut session).unwrap();
        assert_eq!(
            socket.sent(30, false),
            vec![
                Message::Have { piece_index: 0 },
                Message::Have { piece_index: 1 },
                Message::Have { piece_index: 2 },
            ]
        );

        for index in 3..23 {
            env.picker.mark_complete(index);
        }
        env.advance(Duration::from_millis(500));
        env.pass(&mut session).unwrap();
        let sent = socket.sent(30, false);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Message::Bitfield(bitfield) => assert_eq!(bitfield.count_ones(), 23),
            msg => panic!("expected bitfield, got {:?}", msg),
        }
    }

    // Tests that timed out requests free their blocks and mark the peer as
    // snubbing us.
    #[test]
    fn test_request_timeout() {
        let mut env = Env::leech(8);
        let conf = SessionConf {
            request_timeout: Duration::from_secs(30),
            ..Env::conf(false)
        };
        let (mut session, socket, _) = env.wired_with(conf);
        socket.feed(&[
            Message::Bitfield(Bitfield::repeat(true, 8)),
            Message::Unchoke,
        ]);
        env.pass(&mut session).unwrap();
        let first = requests(&socket.sent(8, false));
        assert_eq!(first.len(), 2);

        env.advance(Duration::from_secs(31));
        env.pass(&mut session).unwrap();
        assert!(session.state().snubbing);
        // the blocks were requested again
        let mut again = requests(&socket.sent(8, false));
        let mut first = first;
        again.sort();
        first.sort();
        assert_eq!(again, first);
    }

    // Tests that the session is dropped if neither side is interested.
    #[test]
    fn test_not_interested_timeout() {
        let mut env = Env::seed(8);
        let (mut session, _, _) = env.wired(false);
        env.advance(SessionConf::default().not_interested_timeout);
        assert!(matches!(
            env.pass(&mut session),
            Err(PeerError::NotMutuallyInterested)
        ));
    }

    // Tests that a closed connection releases the in-flight piece.
    #[test]
    fn test_connection_closed_releases_piece() {
        let mut env = Env::leech(8);
        let (mut session, socket, _) = env.wired(false);
        socket.feed(&[
            Message::Bitfield(Bitfield::repeat(true, 8)),
            Message::Unchoke,
        ]);
        env.pass(&mut session).unwrap();
        let index = session.in_flight_piece().unwrap();

        socket.0.borrow_mut().closed = true;
        assert!(matches!(
            env.pass(&mut session),
            Err(PeerError::ConnectionClosed)
        ));
        assert_eq!(env.picker.pending_count(index), 0);
        assert_eq!(env.picker.frequency(index), 0);
        assert_eq!(session.request_slot_count(), 0);
    }

    // Tests that a request arriving after our choke was queued, but before it
    // was sent, is not served, so no block goes out after the choke.
    #[test]
    fn test_request_after_queued_choke() {
        let block = BlockInfo {
            piece_index: 3,
            offset: 0,
            len: BLOCK_LEN,
        };

        // without the fast extension the request is ignored
        let mut env = Env::seed(8);
        let (mut session, socket, _) = env.wired(false);
        env.should_choke = true;
        socket.feed(&[Message::Interested, Message::Request(block)]);
        env.pass(&mut session).unwrap();
        assert_eq!(socket.sent(8, false), vec![Message::Choke]);
        assert!(session.state().am_choking);
        assert_eq!(session.state().uploaded, 0);

        // with it the request is rejected
        let mut env = Env::seed(30);
        let (mut session, socket, _) = env.wired(true);
        let not_allowed = (0..30)
            .find(|i| !session.state().am_allowed_fast.contains(i))
            .unwrap();
        let block = BlockInfo {
            piece_index: not_allowed,
            ..block
        };
        env.should_choke = true;
        socket.feed(&[Message::Interested, Message::Request(block)]);
        env.pass(&mut session).unwrap();
        assert_eq!(
            socket.sent(30, false),
            vec![Message::Choke, Message::Reject(block)]
        );
    }

    // Tests that sending our choke drops the blocks still queued for the peer
    // and, with the fast extension, rejects each of them.
    #[test]
    fn test_choke_drops_queued_pieces() {
        let mut env = Env::seed(30);
        let (mut session, socket, _) = env.wired(true);
        let not_allowed = (0..30)
            .find(|i| !session.state().am_allowed_fast.contains(i))
            .unwrap();
        let block = BlockInfo {
            piece_index: not_allowed,
            offset: 0,
            len: BLOCK_LEN,
        };

        // hold the block back in the queue with an empty bucket
        env.throttle = UploadThrottle::new(Some(1), env.now);
        assert!(env.throttle.try_consume((4 + 9 + MAX_BLOCK_LEN) as usize, env.now));
        socket.feed(&[Message::Request(block)]);
        env.pass(&mut session).unwrap();
        assert!(socket.sent(30, false).is_empty());
        assert_eq!(session.queue_len(), 1);

        env.should_choke = true;
        env.pass(&mut session).unwrap();
        assert_eq!(
            socket.sent(30, false),
            vec![Message::Choke, Message::Reject(block)]
        );
        assert_eq!(session.queue_len(), 0);
        assert_eq!(session.state().uploaded, 0);
    }

    // Tests that a block whose first write made no progress is charged to the
    // upload throttle only once.
    #[test]
    fn test_stalled_block_charged_once() {
        let mut env = Env::seed(8);
        let (mut session, socket, _) = env.wired(false);
        env.throttle = UploadThrottle::new(Some(1), env.now);
        let capacity = 4 + 9 + MAX_BLOCK_LEN as usize;
        let wire_len = 4 + 9 + BLOCK_LEN as usize;

        let block = BlockInfo {
            piece_index: 1,
            offset: 0,
            len: BLOCK_LEN,
        };
        socket.0.borrow_mut().write_limit = Some(0);
        socket.feed(&[Message::Request(block)]);
        env.pass(&mut session).unwrap();
        assert_eq!(session.queue_len(), 1);
        assert_eq!(
            session.interest(),
            Some(Interest::READABLE.add(Interest::WRITABLE))
        );

        socket.0.borrow_mut().write_limit = None;
        env.pass(&mut session).unwrap();
        assert_eq!(socket.sent(8, false).len(), 1);
        assert_eq!(session.state().uploaded, BLOCK_LEN as u64);

        // exactly what is left after a single charge
        assert!(env.throttle.try_consume(capacity - wire_len, env.now));
        assert!(!env.throttle.try_consume(1, env.now));
    }

    // Tests that a rejected request frees its slot and the block is requested
    // again.
    #[test]
    fn test_reject_frees_block() {
        let mut env = Env::leech(8);
        let (mut session, socket, _) = env.wired(true);
        socket.feed(&[Message::HaveAll, Message::Unchoke]);
        env.pass(&mut session).unwrap();
        let blocks = requests(&socket.sent(8, false));
        assert_eq!(blocks.len(), 2);

        socket.feed(&[Message::Reject(blocks[0])]);
        env.pass(&mut session).unwrap();
        assert_eq!(socket.sent(8, false), vec![Message::Request(blocks[0])]);
        assert_eq!(session.request_slot_count(), 2);

        // a reject for something we never asked for is tolerated
        let unknown = BlockInfo {
            piece_index: (blocks[0].piece_index + 1) % 8,
            offset: 0,
            len: BLOCK_LEN,
        };
        socket.feed(&[Message::Reject(unknown)]);
        env.pass(&mut session).unwrap();
        assert!(socket.sent(8, false).is_empty());
        assert_eq!(session.request_slot_count(), 2);
    }

    // Tests that a keep alive goes out once nothing was queued for the keep
    // alive interval.
    #[test]
    fn test_keep_alive() {
        let mut env = Env::seed(8);
        let conf = SessionConf {
            inactivity_timeout: Duration::from_secs(600),
            ..Env::conf(false)
        };
        let (mut session, socket, _) = env.wired_with(conf);
        socket.feed(&[Message::Interested]);
        env.pass(&mut session).unwrap();

        env.advance(Duration::from_secs(60));
        env.pass(&mut session).unwrap();
        assert!(socket.sent(8, false).is_empty());

        env.advance(Duration::from_secs(60));
        env.pass(&mut session).unwrap();
        assert_eq!(socket.sent(8, false), vec![Message::KeepAlive]);
    }

    // Tests that a peer that never answers our requests is dropped, even
    // though the timed out requests are sent again.
    #[test]
    fn test_inactivity_timeout() {
        let mut env = Env::leech(8);
        let conf = SessionConf {
            request_timeout: Duration::from_secs(30),
            ..Env::conf(false)
        };
        let (mut session, socket, _) = env.wired_with(conf);
        socket.feed(&[
            Message::Bitfield(Bitfield::repeat(true, 8)),
            Message::Unchoke,
        ]);
        env.pass(&mut session).unwrap();
        assert_eq!(requests(&socket.sent(8, false)).len(), 2);

        for _ in 0..3 {
            env.advance(Duration::from_secs(31));
            env.pass(&mut session).unwrap();
            assert_eq!(requests(&socket.sent(8, false)).len(), 2);
        }

        env.advance(Duration::from_secs(31));
        assert!(matches!(
            env.pass(&mut session),
            Err(PeerError::InactivityTimeout)
        ));
        assert!(session.is_closed());
    }

    // Tests that blocks received from the peer keep the session alive.
    #[test]
    fn test_received_blocks_reset_inactivity() {
        let mut env = Env::leech(8);
        let data = Env::data(8);
        let (mut session, socket, _) = env.wired(false);
        socket.feed(&[
            Message::Bitfield(Bitfield::repeat(true, 8)),
            Message::Unchoke,
        ]);
        env.pass(&mut session).unwrap();
        let blocks = requests(&socket.sent(8, false));

        env.advance(Duration::from_secs(100));
        socket.feed(&answers(&blocks[..1], &data));
        env.pass(&mut session).unwrap();

        env.advance(Duration::from_secs(100));
        env.pass(&mut session).unwrap();
        assert!(!session.is_closed());
    }

    // Tests that in the end game two sessions download the same piece, and
    // that the slower one cancels its requests once the other completes it.
    #[test]
    fn test_end_game_duplicate_requests() {
        let mut env = Env::leech(1);
        env.picker.set_end_game_threshold(PiecePicker::END_GAME_THRESHOLD);
        let data = Env::data(1);
        let (mut fast, fast_socket, _) = env.wired(false);
        let (mut slow, slow_socket, _) = env.wired(false);

        for (session, socket) in
            vec![(&mut fast, &fast_socket), (&mut slow, &slow_socket)]
        {
            socket.feed(&[
                Message::Bitfield(Bitfield::repeat(true, 1)),
                Message::Unchoke,
            ]);
            env.pass(session).unwrap();
            assert_eq!(session.in_flight_piece(), Some(0));
        }
        assert_eq!(env.picker.pending_count(0), 2);

        let fast_blocks = requests(&fast_socket.sent(1, false));
        let mut slow_blocks = requests(&slow_socket.sent(1, false));
        assert_eq!(fast_blocks.len(), 2);
        assert_eq!(slow_blocks.len(), 2);

        fast_socket.feed(&answers(&fast_blocks, &data));
        env.pass(&mut fast).unwrap();
        assert!(env.picker.has(0));

        env.pass(&mut slow).unwrap();
        assert_eq!(slow.in_flight_piece(), None);
        assert_eq!(slow.request_slot_count(), 0);
        let sent = slow_socket.sent(1, false);
        let mut cancelled: Vec<_> = sent
            .iter()
            .filter_map(|msg| match msg {
                Message::Cancel(block) => Some(*block),
                _ => None,
            })
            .collect();
        cancelled.sort();
        slow_blocks.sort();
        assert_eq!(cancelled, slow_blocks);
        assert_eq!(sent.last(), Some(&Message::NotInterested));
    }

    // Tests that a failing local storage closes the session without blaming
    // the peer's transport.
    #[test]
    fn test_storage_error() {
        let mut env = Env::seed(8);
        let (mut session, socket, _) = env.wired(false);
        // the storage only holds the first piece
        env.storage = MemoryStorage::with_data(Env::data(1), PIECE_LEN);
        socket.feed(&[Message::Request(BlockInfo {
            piece_index: 3,
            offset: 0,
            len: BLOCK_LEN,
        })]);
        match env.pass(&mut session) {
            Err(e @ PeerError::Storage(_)) => assert!(!e.is_transport()),
            result => panic!("expected storage error, got {:?}", result),
        }
        assert!(session.is_closed());
    }
}
