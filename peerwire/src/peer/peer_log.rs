//! Logging macros for `peer::PeerSession` and its helpers.
//!
//! The first parameter is any value with an `addr` field (the session itself),
//! followed by the format string and its arguments. Every line is prefixed
//! with the remote address so that the log of a single connection can be
//! filtered out of the interleaved output of the swarm.

macro_rules! peer_log {
    ($lvl:ident, $self:ident, $($arg:tt)*) => ({
        ::log::$lvl!(
            target: "peerwire::peer",
            "[{}] {}",
            $self.addr,
            format_args!($($arg)*)
        );
    })
}

macro_rules! peer_warn {
    ($self:ident, $($arg:tt)*) => (peer_log!(warn, $self, $($arg)*))
}

macro_rules! peer_info {
    ($self:ident, $($arg:tt)*) => (peer_log!(info, $self, $($arg)*))
}

macro_rules! peer_debug {
    ($self:ident, $($arg:tt)*) => (peer_log!(debug, $self, $($arg)*))
}

macro_rules! peer_trace {
    ($self:ident, $($arg:tt)*) => (peer_log!(trace, $self, $($arg)*))
}
