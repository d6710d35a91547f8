use std::{collections::VecDeque, io};

use super::codec::{self, Message};
use crate::{BlockInfo, PieceIndex};

/// A message waiting to be written to the socket.
#[derive(Debug)]
struct Entry {
    msg: Message,
    /// The wire encoding of the message, produced when the first byte of it is
    /// about to be written.
    buf: Option<Vec<u8>>,
    /// The number of bytes of `buf` already written.
    send_progress: usize,
    /// Whether the send predicate accepted the message. It is asked only
    /// once per message.
    admitted: bool,
}

/// The result of a [`OutboundQueue::drain`] call.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    /// The messages that were completely written, in the order they were
    /// written. The caller applies their send-complete effects.
    pub sent: Vec<Message>,
    /// The total number of bytes written.
    pub bytes_written: usize,
    /// The number of messages that were refused by the send predicate and
    /// moved to the back of the queue.
    pub deferred: usize,
}

/// The messages of a session pending transmission, in order.
///
/// A message that has been partially written is always completed before any
/// other message is written, so the byte stream is never corrupted.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<Entry>,
}

impl OutboundQueue {
    pub fn push(&mut self, msg: Message) {
        self.entries.push_back(Entry {
            msg,
            buf: None,
            send_progress: 0,
            admitted: false,
        });
    }

    /// Writes as many messages as the writer accepts, stopping after a fully
    /// written `Choke` so the caller can apply it first.
    ///
    /// A message for which `can_send` returns false is moved behind the rest
    /// and not retried in this call. Once accepted, a message is not passed to
    /// `can_send` again. The writer returns the number of bytes it
    /// accepted, which may be fewer than it was given, in which case the
    /// progress is recorded, the message stays at the front, and draining
    /// stops. A `WouldBlock` error from the writer is the same as accepting
    /// nothing, other errors are returned.
    pub fn drain(
        &mut self,
        mut can_send: impl FnMut(&Message) -> bool,
        mut writer: impl FnMut(&[u8]) -> io::Result<usize>,
    ) -> io::Result<DrainOutcome> {
        let mut outcome = DrainOutcome::default();

        // each message present at the start is visited at most once
        let mut remaining = self.entries.len();
        while remaining > 0 {
            remaining -= 1;
            let mut entry = match self.entries.pop_front() {
                Some(entry) => entry,
                None => break,
            };

            if !entry.admitted {
                if !can_send(&entry.msg) {
                    self.entries.push_back(entry);
                    outcome.deferred += 1;
                    continue;
                }
                entry.admitted = true;
            }

            let msg = &entry.msg;
            let buf = entry.buf.get_or_insert_with(|| codec::encode(msg));
            let pending = &buf[entry.send_progress..];
            let n = match writer(pending) {
                Ok(n) => n.min(pending.len()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                Err(e) => {
                    self.entries.push_front(entry);
                    return Err(e);
                }
            };
            outcome.bytes_written += n;

            if n < pending.len() {
                entry.send_progress += n;
                self.entries.push_front(entry);
                break;
            }

            let is_choke = matches!(entry.msg, Message::Choke);
            outcome.sent.push(entry.msg);
            if is_choke {
                break;
            }
        }

        Ok(outcome)
    }

    /// Removes the unsent piece messages for the given block, e.g. because the
    /// peer cancelled its request. A message already partially written is
    /// kept. Returns the number of removed messages.
    pub fn remove_pieces_matching(
        &mut self,
        index: PieceIndex,
        begin: u32,
        length: u32,
    ) -> usize {
        let removed = self.remove_unsent_where(|msg| match msg {
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                *piece_index == index
                    && *offset == begin
                    && data.len() == length as usize
            }
            _ => false,
        });
        removed.len()
    }

    /// Removes all unsent piece messages, e.g. because we choked the peer,
    /// and returns the blocks they carried.
    pub fn remove_unsent_pieces(&mut self) -> Vec<BlockInfo> {
        self.remove_unsent_where(|msg| matches!(msg, Message::Piece { .. }))
            .iter()
            .filter_map(Message::piece_block_info)
            .collect()
    }

    fn remove_unsent_where(
        &mut self,
        pred: impl Fn(&Message) -> bool,
    ) -> Vec<Message> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.send_progress == 0 && pred(&entry.msg) {
                removed.push(entry.msg);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        removed
    }

    /// Returns whether the message at the front is partially written.
    pub fn is_sending_in_progress(&self) -> bool {
        self.entries
            .front()
            .map(|entry| entry.send_progress > 0)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
