//! Control message protocol exchanged between swap clients and the daemon.
//!
//! Every message travels as one fixed-size frame:
//!
//! ```text
//! +---------+-----------+-------------------------+------------------------+
//! | tag u32 | count u32 | addr[max_entries]: u64  | rkey[max_entries]: u32 |
//! +---------+-----------+-------------------------+------------------------+
//! ```
//!
//! All integers are big-endian. Entry-bearing messages are positional: the
//! array index is the connection-local slot of the chunk, and a slot is
//! present iff its `rkey` is non-zero.

use crate::{Error, Result};
use std::fmt;
use std::num::NonZeroU32;

/// Remote access key handed out when a chunk region is registered.
///
/// Zero is reserved on the wire to mark an empty slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteKey(NonZeroU32);

impl RemoteKey {
    /// Wrap a raw key, returning `None` for zero.
    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(key) => Some(Self(key)),
            None => None,
        }
    }

    /// Raw wire value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for RemoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// Wire tag of a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageTag {
    /// Client finished releasing/acking.
    Done = 1,
    /// Server reply carrying newly bound chunks.
    Info = 2,
    /// Server reply carrying a single newly bound chunk.
    InfoSingle = 3,
    /// Server reply carrying the free-chunk count.
    FreeSize = 4,
    /// Server revokes chunks.
    Evict = 5,
    /// Client reports chunk access counts.
    Activity = 6,
    /// Server shuts down the connection's mapping.
    Stop = 7,
    /// Client requests `count` chunks.
    Bind = 8,
    /// Client requests exactly one chunk.
    BindSingle = 9,
    /// Client asks for the free-chunk count.
    Query = 10,
}

impl TryFrom<u32> for MessageTag {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        Ok(match raw {
            1 => Self::Done,
            2 => Self::Info,
            3 => Self::InfoSingle,
            4 => Self::FreeSize,
            5 => Self::Evict,
            6 => Self::Activity,
            7 => Self::Stop,
            8 => Self::Bind,
            9 => Self::BindSingle,
            10 => Self::Query,
            other => return Err(Error::UnknownTag(other)),
        })
    }
}

/// A chunk as seen by the client: its slot in the connection's address space
/// and the registration needed for remote access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Connection-local slot.
    pub slot: usize,
    /// Registered base address.
    pub addr: u64,
    /// Remote access key.
    pub rkey: RemoteKey,
}

/// Access count reported by the client for one of its chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityReport {
    /// Connection-local slot.
    pub slot: usize,
    /// Key of the chunk the client believes occupies the slot.
    pub rkey: RemoteKey,
    /// Recent access count.
    pub accesses: u64,
}

/// A decoded control message. Each variant carries only its own fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client acknowledgement (eviction or teardown); also the server's final
    /// teardown reply.
    Done,
    /// Newly bound chunks.
    Info {
        /// Descriptors, one per bound slot.
        chunks: Vec<ChunkDescriptor>,
    },
    /// Exactly one newly bound chunk.
    InfoSingle {
        /// The bound chunk.
        chunk: ChunkDescriptor,
    },
    /// Current free-chunk count.
    FreeSize {
        /// Chunks available for binding.
        free_chunks: u32,
    },
    /// Chunks the client must stop using.
    Evict {
        /// Revoked chunks.
        chunks: Vec<ChunkDescriptor>,
    },
    /// Access counts for owned chunks.
    Activity {
        /// One report per slot.
        reports: Vec<ActivityReport>,
    },
    /// Server is shutting down this connection's mapping.
    Stop,
    /// Request `chunks` new chunks.
    Bind {
        /// Chunks requested.
        chunks: u32,
    },
    /// Request exactly one chunk.
    BindSingle,
    /// Ask for the free-chunk count.
    Query,
}

impl Message {
    /// Wire tag for this message.
    #[must_use]
    pub const fn tag(&self) -> MessageTag {
        match self {
            Self::Done => MessageTag::Done,
            Self::Info { .. } => MessageTag::Info,
            Self::InfoSingle { .. } => MessageTag::InfoSingle,
            Self::FreeSize { .. } => MessageTag::FreeSize,
            Self::Evict { .. } => MessageTag::Evict,
            Self::Activity { .. } => MessageTag::Activity,
            Self::Stop => MessageTag::Stop,
            Self::Bind { .. } => MessageTag::Bind,
            Self::BindSingle => MessageTag::BindSingle,
            Self::Query => MessageTag::Query,
        }
    }
}

const HEADER_LEN: usize = 8;
const ADDR_LEN: usize = 8;
const RKEY_LEN: usize = 4;

/// Fixed-size frame encoder/decoder.
///
/// The entry capacity is chosen at construction and shared by both peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireCodec {
    max_entries: usize,
}

impl WireCodec {
    /// Create a codec for frames holding up to `max_entries` slots.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `max_entries` is zero or does not
    /// fit the 32-bit count field.
    pub fn new(max_entries: usize) -> Result<Self> {
        if max_entries == 0 || u32::try_from(max_entries).is_err() {
            return Err(Error::InvalidConfig(format!(
                "max_entries must be in 1..=u32::MAX, got {max_entries}"
            )));
        }
        Ok(Self { max_entries })
    }

    /// Slots per frame.
    #[must_use]
    pub const fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Frame length in bytes.
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        HEADER_LEN + self.max_entries * (ADDR_LEN + RKEY_LEN)
    }

    /// Encode a message into a freshly allocated frame.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry's slot is out of range or duplicated.
    pub fn encode(&self, msg: &Message) -> Result<Vec<u8>> {
        let mut frame = vec![0u8; self.frame_len()];
        self.encode_into(msg, &mut frame)?;
        Ok(frame)
    }

    /// Encode a message into `frame`, which must be exactly
    /// [`frame_len`](Self::frame_len) bytes. The frame is fully overwritten.
    ///
    /// # Errors
    ///
    /// Returns an error on a wrong-sized buffer or invalid entries.
    pub fn encode_into(&self, msg: &Message, frame: &mut [u8]) -> Result<()> {
        if frame.len() != self.frame_len() {
            return Err(Error::MalformedMessage(format!(
                "frame buffer is {} bytes, expected {}",
                frame.len(),
                self.frame_len()
            )));
        }
        frame.fill(0);

        let count = match msg {
            Message::Done | Message::Stop | Message::BindSingle | Message::Query => 0,
            Message::Bind { chunks } => *chunks,
            Message::FreeSize { free_chunks } => *free_chunks,
            Message::Info { chunks } | Message::Evict { chunks } => {
                self.check_len(chunks.len())?;
                for c in chunks {
                    self.put_entry(frame, c.slot, c.addr, c.rkey)?;
                }
                chunks.len() as u32
            }
            Message::InfoSingle { chunk } => {
                self.put_entry(frame, chunk.slot, chunk.addr, chunk.rkey)?;
                1
            }
            Message::Activity { reports } => {
                self.check_len(reports.len())?;
                for r in reports {
                    self.put_entry(frame, r.slot, r.accesses, r.rkey)?;
                }
                reports.len() as u32
            }
        };

        frame[0..4].copy_from_slice(&(msg.tag() as u32).to_be_bytes());
        frame[4..8].copy_from_slice(&count.to_be_bytes());
        Ok(())
    }

    /// Decode one frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTag`] for undefined tags and
    /// [`Error::MalformedMessage`] when the frame is the wrong size or the
    /// count disagrees with the populated slots.
    pub fn decode(&self, frame: &[u8]) -> Result<Message> {
        if frame.len() != self.frame_len() {
            return Err(Error::MalformedMessage(format!(
                "frame is {} bytes, expected {}",
                frame.len(),
                self.frame_len()
            )));
        }

        let tag = MessageTag::try_from(read_u32(frame, 0))?;
        let count = read_u32(frame, 4);

        let msg = match tag {
            MessageTag::Done => Message::Done,
            MessageTag::Stop => Message::Stop,
            MessageTag::BindSingle => Message::BindSingle,
            MessageTag::Query => Message::Query,
            MessageTag::Bind => Message::Bind { chunks: count },
            MessageTag::FreeSize => Message::FreeSize { free_chunks: count },
            MessageTag::Info => Message::Info {
                chunks: self.descriptors(frame, count)?,
            },
            MessageTag::Evict => Message::Evict {
                chunks: self.descriptors(frame, count)?,
            },
            MessageTag::InfoSingle => {
                let mut chunks = self.descriptors(frame, count)?;
                match (chunks.pop(), chunks.is_empty()) {
                    (Some(chunk), true) => Message::InfoSingle { chunk },
                    _ => {
                        return Err(Error::MalformedMessage(format!(
                            "INFO_SINGLE carries {count} entries"
                        )))
                    }
                }
            }
            MessageTag::Activity => Message::Activity {
                reports: self
                    .entries(frame, count)?
                    .map(|(slot, accesses, rkey)| ActivityReport {
                        slot,
                        rkey,
                        accesses,
                    })
                    .collect(),
            },
        };
        Ok(msg)
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.max_entries {
            return Err(Error::TooManyEntries {
                count: len,
                max: self.max_entries,
            });
        }
        Ok(())
    }

    fn put_entry(&self, frame: &mut [u8], slot: usize, addr: u64, rkey: RemoteKey) -> Result<()> {
        if slot >= self.max_entries {
            return Err(Error::TooManyEntries {
                count: slot + 1,
                max: self.max_entries,
            });
        }
        let rkey_off = self.rkey_offset(slot);
        if read_u32(frame, rkey_off) != 0 {
            return Err(Error::MalformedMessage(format!("slot {slot} encoded twice")));
        }
        let addr_off = HEADER_LEN + slot * ADDR_LEN;
        frame[addr_off..addr_off + ADDR_LEN].copy_from_slice(&addr.to_be_bytes());
        frame[rkey_off..rkey_off + RKEY_LEN].copy_from_slice(&rkey.get().to_be_bytes());
        Ok(())
    }

    fn rkey_offset(&self, slot: usize) -> usize {
        HEADER_LEN + self.max_entries * ADDR_LEN + slot * RKEY_LEN
    }

    fn entries<'a>(
        &self,
        frame: &'a [u8],
        count: u32,
    ) -> Result<impl Iterator<Item = (usize, u64, RemoteKey)> + 'a> {
        let this = *self;
        let present = (0..self.max_entries)
            .filter(|&slot| read_u32(frame, this.rkey_offset(slot)) != 0)
            .count();
        if present != count as usize {
            return Err(Error::MalformedMessage(format!(
                "count field is {count} but {present} slots are populated"
            )));
        }
        Ok((0..self.max_entries).filter_map(move |slot| {
            let rkey = RemoteKey::new(read_u32(frame, this.rkey_offset(slot)))?;
            let addr = read_u64(frame, HEADER_LEN + slot * ADDR_LEN);
            Some((slot, addr, rkey))
        }))
    }

    fn descriptors(&self, frame: &[u8], count: u32) -> Result<Vec<ChunkDescriptor>> {
        Ok(self
            .entries(frame, count)?
            .map(|(slot, addr, rkey)| ChunkDescriptor { slot, addr, rkey })
            .collect())
    }
}

fn read_u32(frame: &[u8], off: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&frame[off..off + 4]);
    u32::from_be_bytes(bytes)
}

fn read_u64(frame: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&frame[off..off + 8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: u32) -> RemoteKey {
        RemoteKey::new(raw).unwrap()
    }

    fn codec() -> WireCodec {
        WireCodec::new(32).unwrap()
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(codec().frame_len(), 8 + 32 * 12);
        assert_eq!(WireCodec::new(1).unwrap().frame_len(), 20);
    }

    #[test]
    fn test_zero_entries_rejected() {
        assert!(WireCodec::new(0).is_err());
    }

    #[test]
    fn test_remote_key_zero_reserved() {
        assert!(RemoteKey::new(0).is_none());
        assert_eq!(key(7).get(), 7);
    }

    #[test]
    fn test_header_is_network_byte_order() {
        let frame = codec().encode(&Message::Bind { chunks: 10 }).unwrap();
        assert_eq!(&frame[0..4], &[0, 0, 0, 8]);
        assert_eq!(&frame[4..8], &[0, 0, 0, 10]);
        assert!(frame[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_info_entries_are_positional() {
        let c = codec();
        let msg = Message::Info {
            chunks: vec![ChunkDescriptor {
                slot: 2,
                addr: 0x0102_0304_0506_0708,
                rkey: key(0xAABB_CCDD),
            }],
        };
        let frame = c.encode(&msg).unwrap();
        let addr_off = 8 + 2 * 8;
        assert_eq!(
            &frame[addr_off..addr_off + 8],
            &[1, 2, 3, 4, 5, 6, 7, 8]
        );
        let rkey_off = 8 + 32 * 8 + 2 * 4;
        assert_eq!(&frame[rkey_off..rkey_off + 4], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(c.decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_activity_carries_access_count_in_addr() {
        let c = codec();
        let msg = Message::Activity {
            reports: vec![
                ActivityReport { slot: 0, rkey: key(1), accesses: 0 },
                ActivityReport { slot: 5, rkey: key(9), accesses: 1234 },
            ],
        };
        let frame = c.encode(&msg).unwrap();
        assert_eq!(&frame[4..8], &2u32.to_be_bytes());
        assert_eq!(c.decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_decode_unknown_tag() {
        let c = codec();
        let mut frame = vec![0u8; c.frame_len()];
        frame[0..4].copy_from_slice(&99u32.to_be_bytes());
        assert!(matches!(c.decode(&frame), Err(Error::UnknownTag(99))));
    }

    #[test]
    fn test_decode_wrong_length() {
        let c = codec();
        assert!(matches!(
            c.decode(&[0u8; 16]),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_decode_count_mismatch() {
        let c = codec();
        let mut frame = c
            .encode(&Message::Evict {
                chunks: vec![ChunkDescriptor { slot: 1, addr: 4096, rkey: key(3) }],
            })
            .unwrap();
        frame[4..8].copy_from_slice(&2u32.to_be_bytes());
        assert!(matches!(c.decode(&frame), Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn test_info_single_requires_exactly_one_entry() {
        let c = codec();
        let mut frame = c.encode(&Message::Query).unwrap();
        frame[0..4].copy_from_slice(&(MessageTag::InfoSingle as u32).to_be_bytes());
        assert!(c.decode(&frame).is_err());
    }

    #[test]
    fn test_encode_slot_out_of_range() {
        let c = WireCodec::new(4).unwrap();
        let msg = Message::InfoSingle {
            chunk: ChunkDescriptor { slot: 4, addr: 0, rkey: key(1) },
        };
        assert!(matches!(c.encode(&msg), Err(Error::TooManyEntries { .. })));
    }

    #[test]
    fn test_encode_duplicate_slot() {
        let c = codec();
        let d = ChunkDescriptor { slot: 0, addr: 0, rkey: key(1) };
        let msg = Message::Info { chunks: vec![d, d] };
        assert!(matches!(c.encode(&msg), Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn test_encode_into_overwrites_previous_frame() {
        let c = codec();
        let mut frame = c
            .encode(&Message::Info {
                chunks: vec![ChunkDescriptor { slot: 3, addr: 1, rkey: key(2) }],
            })
            .unwrap();
        c.encode_into(&Message::Stop, &mut frame).unwrap();
        assert_eq!(c.decode(&frame).unwrap(), Message::Stop);
    }

    #[test]
    fn test_tag_values_match_wire() {
        assert_eq!(MessageTag::Done as u32, 1);
        assert_eq!(MessageTag::Query as u32, 10);
        for raw in 1..=10u32 {
            assert_eq!(MessageTag::try_from(raw).unwrap() as u32, raw);
        }
        assert!(MessageTag::try_from(0).is_err());
    }
}
