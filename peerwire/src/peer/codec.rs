use {
    super::error::{PeerError, ProtocolError},
    crate::{BlockInfo, Bitfield, PieceIndex},
    bytes::{Buf, BufMut, BytesMut},
    std::convert::TryFrom,
    tokio_util::codec::{Decoder, Encoder},
};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The length of the handshake, which is not length prefixed like the rest of
/// the messages.
pub const HANDSHAKE_LEN: usize = 68;

/// The largest block we are willing to accept or serve. Clients in the wild
/// request 16 KiB blocks, but some accept up to 128 KiB.
pub(crate) const MAX_BLOCK_LEN: u32 = 0x20000;

/// The bit in the reserved field of the handshake that announces support for
/// the Fast extension (BEP 6): the third least significant bit of the last
/// byte.
const FAST_EXTENSION_BIT: u8 = 0x04;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Handshake {
    /// The protocol string, which must equal "BitTorrent protocol", as
    /// otherwise the connetion is aborted.
    pub prot: [u8; 19],
    /// A reserved field, where the client's supported extensions are
    /// announced.
    pub reserved: [u8; 8],
    /// The torrent's SHA1 info hash, used to identify the torrent in the
    /// handshake and to verify the peer.
    pub info_hash: [u8; 20],
    /// The arbitrary peer id, usually used to identify the torrent client.
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Announces support for the Fast extension in the reserved field.
    pub fn with_fast_extension(mut self) -> Self {
        self.reserved[7] |= FAST_EXTENSION_BIT;
        self
    }

    pub fn supports_fast_extension(&self) -> bool {
        self.reserved[7] & FAST_EXTENSION_BIT != 0
    }

    /// Decodes exactly one 68 byte handshake.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(ProtocolError::InvalidHandshake);
        }
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len()
            || &buf[1..20] != PROTOCOL_STRING.as_bytes()
        {
            return Err(ProtocolError::InvalidHandshake);
        }

        let mut handshake = Self::new([0; 20], [0; 20]);
        handshake.reserved.copy_from_slice(&buf[20..28]);
        handshake.info_hash.copy_from_slice(&buf[28..48]);
        handshake.peer_id.copy_from_slice(&buf[48..68]);
        Ok(handshake)
    }

    fn encode(&self, buf: &mut BytesMut) {
        // protocol length prefix
        debug_assert_eq!(self.prot.len(), 19);
        buf.put_u8(self.prot.len() as u8);
        // we should only be sending the bittorrent protocol string
        debug_assert_eq!(self.prot, PROTOCOL_STRING.as_bytes());
        // payload
        buf.extend_from_slice(&self.prot);
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    SuggestPiece = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
}

impl MessageId {
    /// Returns the exact payload length (the message id included) of messages
    /// with a fixed length, or `None` for the variable length bitfield and
    /// piece messages.
    fn fixed_payload_len(&self) -> Option<usize> {
        use MessageId::*;
        match self {
            Choke | Unchoke | Interested | NotInterested | HaveAll
            | HaveNone => Some(1),
            Have | SuggestPiece | AllowedFast => Some(5),
            Port => Some(3),
            Request | Cancel | Reject => Some(13),
            Bitfield | Piece => None,
        }
    }

    /// Whether the message is part of the Fast extension and may only be
    /// exchanged if both sides announced support for it.
    pub fn is_fast_extension(&self) -> bool {
        use MessageId::*;
        matches!(
            self,
            SuggestPiece | HaveAll | HaveNone | Reject | AllowedFast
        )
    }
}

impl TryFrom<u8> for MessageId {
    type Error = ProtocolError;

    fn try_from(k: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match k {
            k if k == Choke as u8 => Ok(Choke),
            k if k == Unchoke as u8 => Ok(Unchoke),
            k if k == Interested as u8 => Ok(Interested),
            k if k == NotInterested as u8 => Ok(NotInterested),
            k if k == Have as u8 => Ok(Have),
            k if k == Bitfield as u8 => Ok(Bitfield),
            k if k == Request as u8 => Ok(Request),
            k if k == Piece as u8 => Ok(Piece),
            k if k == Cancel as u8 => Ok(Cancel),
            k if k == Port as u8 => Ok(Port),
            k if k == SuggestPiece as u8 => Ok(SuggestPiece),
            k if k == HaveAll as u8 => Ok(HaveAll),
            k if k == HaveNone as u8 => Ok(HaveNone),
            k if k == Reject as u8 => Ok(Reject),
            k if k == AllowedFast as u8 => Ok(AllowedFast),
            k => Err(ProtocolError::UnknownMessageId(k)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Handshake(Handshake),
    KeepAlive,
    Bitfield(Bitfield),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Request(BlockInfo),
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    Port(u16),
    SuggestPiece {
        piece_index: PieceIndex,
    },
    HaveAll,
    HaveNone,
    Reject(BlockInfo),
    AllowedFast {
        piece_index: PieceIndex,
    },
}

impl Message {
    /// Returns the message's id, or `None` for the handshake and keep alive
    /// messages which don't have one.
    pub fn id(&self) -> Option<MessageId> {
        let id = match self {
            Self::Handshake(_) | Self::KeepAlive => return None,
            Self::Bitfield(_) => MessageId::Bitfield,
            Self::Choke => MessageId::Choke,
            Self::Unchoke => MessageId::Unchoke,
            Self::Interested => MessageId::Interested,
            Self::NotInterested => MessageId::NotInterested,
            Self::Have { .. } => MessageId::Have,
            Self::Request(_) => MessageId::Request,
            Self::Piece { .. } => MessageId::Piece,
            Self::Cancel(_) => MessageId::Cancel,
            Self::Port(_) => MessageId::Port,
            Self::SuggestPiece { .. } => MessageId::SuggestPiece,
            Self::HaveAll => MessageId::HaveAll,
            Self::HaveNone => MessageId::HaveNone,
            Self::Reject(_) => MessageId::Reject,
            Self::AllowedFast { .. } => MessageId::AllowedFast,
        };
        Some(id)
    }

    /// Returns the number of bytes the message occupies on the wire, including
    /// the 4 byte length prefix.
    pub fn wire_len(&self) -> usize {
        match self {
            Self::Handshake(_) => HANDSHAKE_LEN,
            Self::KeepAlive => 4,
            Self::Bitfield(bitfield) => 4 + 1 + bitfield.as_raw_slice().len(),
            Self::Piece { data, .. } => 4 + 9 + data.len(),
            // all other messages have a fixed length
            msg => {
                4 + msg
                    .id()
                    .and_then(|id| id.fixed_payload_len())
                    .unwrap_or_default()
            }
        }
    }

    /// Returns the block the message refers to, if it's a piece message.
    pub fn piece_block_info(&self) -> Option<BlockInfo> {
        match self {
            Self::Piece {
                piece_index,
                offset,
                data,
            } => Some(BlockInfo {
                piece_index: *piece_index,
                offset: *offset,
                len: data.len() as u32,
            }),
            _ => None,
        }
    }
}

/// Returns the largest message payload we accept. This is the larger of a block
/// message with the largest block length we serve, and of a bitfield of the
/// torrent's size.
pub fn max_payload_len(piece_count: usize) -> usize {
    std::cmp::max(9 + MAX_BLOCK_LEN as usize, 1 + bitfield_len(piece_count))
}

/// Returns the number of bytes needed to represent the given number of pieces.
fn bitfield_len(piece_count: usize) -> usize {
    (piece_count + 7) / 8
}

/// Encodes the message into a newly allocated buffer, including the length
/// prefix.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(msg.wire_len());
    encode_into(msg, &mut buf);
    buf.to_vec()
}

fn encode_into(msg: &Message, buf: &mut BytesMut) {
    use Message::*;
    match msg {
        Handshake(handshake) => handshake.encode(buf),
        KeepAlive => {
            // message length prefix, no id and no payload
            buf.put_u32(0);
        }
        Bitfield(bitfield) => {
            // NOTE: take the length of the underlying storage to get the number
            // of _bytes_, as `bitfield.len()` returns the number of _bits_
            let bytes = bitfield.as_raw_slice();
            buf.put_u32(1 + bytes.len() as u32);
            buf.put_u8(MessageId::Bitfield as u8);
            buf.extend_from_slice(bytes);
        }
        Choke => encode_empty(MessageId::Choke, buf),
        Unchoke => encode_empty(MessageId::Unchoke, buf),
        Interested => encode_empty(MessageId::Interested, buf),
        NotInterested => encode_empty(MessageId::NotInterested, buf),
        HaveAll => encode_empty(MessageId::HaveAll, buf),
        HaveNone => encode_empty(MessageId::HaveNone, buf),
        Have { piece_index } => {
            encode_piece_index(MessageId::Have, *piece_index, buf)
        }
        SuggestPiece { piece_index } => {
            encode_piece_index(MessageId::SuggestPiece, *piece_index, buf)
        }
        AllowedFast { piece_index } => {
            encode_piece_index(MessageId::AllowedFast, *piece_index, buf)
        }
        Request(block) => encode_block_info(MessageId::Request, block, buf),
        Cancel(block) => encode_block_info(MessageId::Cancel, block, buf),
        Reject(block) => encode_block_info(MessageId::Reject, block, buf),
        Piece {
            piece_index,
            offset,
            data,
        } => {
            // 1 byte message id, 4 byte piece index, 4 byte offset, and n byte
            // block
            buf.put_u32(1 + 4 + 4 + data.len() as u32);
            buf.put_u8(MessageId::Piece as u8);
            buf.put_u32(*piece_index);
            buf.put_u32(*offset);
            buf.extend_from_slice(data);
        }
        Port(port) => {
            buf.put_u32(1 + 2);
            buf.put_u8(MessageId::Port as u8);
            buf.put_u16(*port);
        }
    }
}

// Used for the messages that consist of only the message id.
fn encode_empty(id: MessageId, buf: &mut BytesMut) {
    // message length prefix: 1 byte message id
    buf.put_u32(1);
    buf.put_u8(id as u8);
}

fn encode_piece_index(
    id: MessageId,
    piece_index: PieceIndex,
    buf: &mut BytesMut,
) {
    // 1 byte message id and 4 byte piece index
    buf.put_u32(1 + 4);
    buf.put_u8(id as u8);
    buf.put_u32(piece_index);
}

fn encode_block_info(id: MessageId, block: &BlockInfo, buf: &mut BytesMut) {
    // 1 byte message id, 4 byte piece index, 4 byte offset, 4 byte length
    buf.put_u32(1 + 4 + 4 + 4);
    buf.put_u8(id as u8);
    buf.put_u32(block.piece_index);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
}

/// Decodes a single message payload, whose 4 byte length prefix has already
/// been stripped.
///
/// The piece count is needed to validate the bitfield message.
pub fn decode(
    payload: &[u8],
    piece_count: usize,
) -> Result<Message, ProtocolError> {
    // the message length is only 0 if this is a keep alive message (all
    // other message types have at least one more field, the message id)
    if payload.is_empty() {
        return Ok(Message::KeepAlive);
    }
    let id = MessageId::try_from(payload[0])?;
    decode_payload(id, payload, piece_count)
}

/// Decodes a payload that is expected to be of the given message type.
pub fn decode_as(
    expected: MessageId,
    payload: &[u8],
    piece_count: usize,
) -> Result<Message, ProtocolError> {
    let actual = match payload.first() {
        Some(id) => *id,
        None => return Err(ProtocolError::InvalidPayloadSize),
    };
    if actual != expected as u8 {
        return Err(ProtocolError::MessageIdMismatch { expected, actual });
    }
    decode_payload(expected, payload, piece_count)
}

fn decode_payload(
    id: MessageId,
    payload: &[u8],
    piece_count: usize,
) -> Result<Message, ProtocolError> {
    if let Some(len) = id.fixed_payload_len() {
        if payload.len() != len {
            return Err(ProtocolError::InvalidPayloadSize);
        }
    }

    // skip the message id
    let mut buf = &payload[1..];
    let msg = match id {
        MessageId::Choke => Message::Choke,
        MessageId::Unchoke => Message::Unchoke,
        MessageId::Interested => Message::Interested,
        MessageId::NotInterested => Message::NotInterested,
        MessageId::HaveAll => Message::HaveAll,
        MessageId::HaveNone => Message::HaveNone,
        MessageId::Have => Message::Have {
            piece_index: buf.get_u32(),
        },
        MessageId::SuggestPiece => Message::SuggestPiece {
            piece_index: buf.get_u32(),
        },
        MessageId::AllowedFast => Message::AllowedFast {
            piece_index: buf.get_u32(),
        },
        MessageId::Request => Message::Request(decode_block_info(&mut buf)),
        MessageId::Cancel => Message::Cancel(decode_block_info(&mut buf)),
        MessageId::Reject => Message::Reject(decode_block_info(&mut buf)),
        MessageId::Port => Message::Port(buf.get_u16()),
        MessageId::Bitfield => {
            if payload.len() <= 1 {
                return Err(ProtocolError::InvalidPayloadSize);
            }
            Message::Bitfield(decode_bitfield(buf, piece_count)?)
        }
        MessageId::Piece => {
            if payload.len() <= 9 {
                return Err(ProtocolError::InvalidPayloadSize);
            }
            let piece_index = buf.get_u32();
            let offset = buf.get_u32();
            Message::Piece {
                piece_index,
                offset,
                data: buf.to_vec(),
            }
        }
    };

    Ok(msg)
}

fn decode_block_info(buf: &mut &[u8]) -> BlockInfo {
    let piece_index = buf.get_u32();
    let offset = buf.get_u32();
    let len = buf.get_u32();
    BlockInfo {
        piece_index,
        offset,
        len,
    }
}

/// The bitfield raw data that is sent over the wire may be longer than the
/// logical pieces it represents, if the number of pieces in torrent is not
/// a multiple of 8. The spare bits must be cleared, and the bitfield is
/// truncated to the number of pieces.
fn decode_bitfield(
    bytes: &[u8],
    piece_count: usize,
) -> Result<Bitfield, ProtocolError> {
    if bytes.len() != bitfield_len(piece_count) {
        return Err(ProtocolError::InvalidBitfield);
    }
    let mut bitfield = Bitfield::from_vec(bytes.to_vec());
    for i in piece_count..bitfield.len() {
        if bitfield[i] {
            return Err(ProtocolError::InvalidBitfield);
        }
    }
    bitfield.truncate(piece_count);
    Ok(bitfield)
}

/// Splits the handshake off a byte stream.
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = PeerError;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), PeerError> {
        handshake.encode(buf);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = PeerError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Handshake>, PeerError> {
        if buf.is_empty() {
            return Ok(None);
        }

        // fail early if the protocol length prefix is already wrong, there is
        // no point in waiting for the rest of the handshake
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(ProtocolError::InvalidHandshake.into());
        }

        // check that we got the full payload in the buffer
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let handshake = Handshake::decode(&buf[..HANDSHAKE_LEN])?;
        buf.advance(HANDSHAKE_LEN);
        Ok(Some(handshake))
    }
}

/// Splits length prefixed peer messages off a byte stream.
pub struct PeerCodec {
    /// The number of pieces in torrent, used to validate bitfields and to
    /// bound the length of the messages we accept.
    piece_count: usize,
}

impl PeerCodec {
    pub fn new(piece_count: usize) -> Self {
        Self { piece_count }
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = PeerError;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), PeerError> {
        encode_into(&msg, buf);
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Message>, PeerError> {
        // the message length header must be present at the minimum, otherwise
        // we can't determine the message type
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut len_prefix = [0; 4];
        len_prefix.copy_from_slice(&buf[..4]);
        let msg_len = u32::from_be_bytes(len_prefix) as usize;

        // a peer may not make us buffer arbitrarily large messages
        if msg_len > max_payload_len(self.piece_count) {
            return Err(ProtocolError::PayloadTooLarge(msg_len).into());
        }

        // check that we got the full payload in the buffer
        if buf.len() < 4 + msg_len {
            return Ok(None);
        }

        buf.advance(4);
        let payload = buf.split_to(msg_len);
        let msg = decode(&payload, self.piece_count)?;
        Ok(Some(msg))
    }
}
