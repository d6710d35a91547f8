use std::time::Duration;

use crate::PeerId;

/// The global configuration of a swarm.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The arbitrary client id, chosen by the user of this library. This is
    /// advertised to peers in the handshake.
    pub client_id: PeerId,
    /// The upload rate cap in bytes per second, shared by all sessions of the
    /// swarm. `None` means unlimited.
    pub upload_rate_limit: Option<u64>,
    /// The configuration applied to every peer session.
    pub session: SessionConf,
}

impl Conf {
    /// Returns a configuration with the given client id and otherwise default
    /// values.
    pub fn new(client_id: PeerId) -> Self {
        Self {
            client_id,
            upload_rate_limit: None,
            session: SessionConf::default(),
        }
    }
}

/// Configuration of a single peer session.
///
/// The defaults are the empirically tuned values long used by BitTorrent
/// clients, none of them is known to be optimal.
#[derive(Clone, Debug)]
pub struct SessionConf {
    /// Whether we announce and accept the Fast extension (BEP 6).
    pub fast_extension: bool,
    /// The number of outstanding block requests we keep with a peer.
    pub pipeline_len: usize,
    /// A request that has not been served within this duration is cancelled
    /// and its block is free to be requested again.
    pub request_timeout: Duration,
    /// How often the periodic chores of a session are run (flood detection,
    /// request timeouts, have advertisement, keep alive).
    pub check_interval: Duration,
    /// A keep alive is sent if nothing else was queued for this long.
    pub keep_alive_interval: Duration,
    /// The most messages processed in a single pass of a session, so that
    /// a fast peer cannot starve the others.
    pub max_messages_per_pass: usize,
    /// If at least this many pieces were completed since the last
    /// advertisement, a bitfield is sent instead of individual haves.
    pub have_batch_threshold: usize,
    /// The number of pieces a peer may download from us while choked.
    pub allowed_fast_set_len: usize,
    /// The window over which abusive message rates are measured.
    pub flooding_window: Duration,
    /// Choke and unchoke messages per second of the window at which the
    /// connection is considered abusive.
    pub choke_flood_ratio: f64,
    /// Keep alive messages per second of the window at which the connection
    /// is considered abusive.
    pub keep_alive_flood_ratio: f64,
    /// The connection is dropped if neither side sent or requested a piece
    /// for this long.
    pub inactivity_timeout: Duration,
    /// The connection is dropped if neither side is interested in the other
    /// for this long.
    pub not_interested_timeout: Duration,
}

impl Default for SessionConf {
    fn default() -> Self {
        Self {
            fast_extension: true,
            pipeline_len: 6,
            request_timeout: Duration::from_secs(120),
            check_interval: Duration::from_millis(500),
            keep_alive_interval: Duration::from_secs(120),
            max_messages_per_pass: 50,
            have_batch_threshold: 20,
            allowed_fast_set_len: 10,
            flooding_window: Duration::from_secs(5),
            choke_flood_ratio: 0.4,
            keep_alive_flood_ratio: 1.0,
            inactivity_timeout: Duration::from_secs(120),
            not_interested_timeout: Duration::from_secs(30),
        }
    }
}
