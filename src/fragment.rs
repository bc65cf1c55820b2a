// Message fragmentation (spec §4.6). A message larger than one ring slot's
// payload is split into `(conn_id, msg_id, remain, chunk)` fragments and
// reassembled on the receive side. `remain` carries two meanings: negative
// marks a single-fragment (already-complete) message, `0` marks the final
// fragment of a multi-fragment one, anything else is "more bytes follow".
//
// The reassembly cache is bounded: a sender that dies mid-message must not
// leak memory on every receiver forever. When it's full, the oldest partial
// message is evicted and its sender's later-arriving fragments are dropped
// until a fresh `msg_id` starts a new entry.

use std::collections::HashMap;
use std::time::Instant;

use crate::alloc::{ReassemblyAlloc, SystemAlloc};
use crate::error::{Error, Result};

/// Sentinel `remain` for a message that fits in a single fragment.
pub const REMAIN_INLINE: i32 = -1;

#[derive(Debug, Clone, Copy)]
pub struct FragmentHeader {
    pub conn_id: u32,
    pub msg_id: u32,
    pub remain: i32,
}

pub struct Fragment<'a> {
    pub header: FragmentHeader,
    pub chunk: &'a [u8],
}

pub struct Fragmenter {
    chunk_size: usize,
}

impl Fragmenter {
    pub fn new(chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidArgument("fragment chunk_size must be nonzero".into()));
        }
        Ok(Self { chunk_size })
    }

    /// Split `data` into fragments for `msg_id` sent by `conn_id`, in order.
    pub fn fragment<'a>(&self, conn_id: u32, msg_id: u32, data: &'a [u8]) -> Vec<Fragment<'a>> {
        if data.len() <= self.chunk_size {
            return vec![Fragment {
                header: FragmentHeader {
                    conn_id,
                    msg_id,
                    remain: REMAIN_INLINE,
                },
                chunk: data,
            }];
        }

        let mut out = Vec::with_capacity((data.len() + self.chunk_size - 1) / self.chunk_size);
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.chunk_size).min(data.len());
            let remain = (data.len() - end) as i32;
            out.push(Fragment {
                header: FragmentHeader { conn_id, msg_id, remain },
                chunk: &data[offset..end],
            });
            offset = end;
        }
        out
    }
}

struct Partial {
    buf: Vec<u8>,
    touched_at: Instant,
}

/// Bounded (conn_id, msg_id) -> in-progress message map. When full, the
/// least-recently-touched partial is dropped to admit a new one.
pub struct Reassembler {
    capacity: usize,
    partials: HashMap<(u32, u32), Partial>,
    alloc: Box<dyn ReassemblyAlloc>,
}

impl Reassembler {
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_allocator(capacity, Box::new(SystemAlloc))
    }

    pub fn with_allocator(capacity: usize, alloc: Box<dyn ReassemblyAlloc>) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("reassembler capacity must be nonzero".into()));
        }
        Ok(Self {
            capacity,
            partials: HashMap::with_capacity(capacity),
            alloc,
        })
    }

    /// Feed one fragment in. Returns `Ok(Some(message))` once `remain`
    /// reaches the terminal state, `Ok(None)` while more fragments are
    /// expected. `Err(Error::Overflow)` is returned (non-fatally — the
    /// fragment is still accepted) when admitting a new partial required
    /// evicting an older one.
    pub fn push(&mut self, header: FragmentHeader, chunk: &[u8]) -> Result<Option<Vec<u8>>> {
        if header.remain == REMAIN_INLINE {
            return Ok(Some(chunk.to_vec()));
        }

        let key = (header.conn_id, header.msg_id);
        let mut evicted = false;
        if !self.partials.contains_key(&key) && self.partials.len() >= self.capacity {
            if let Some(oldest_key) = self
                .partials
                .iter()
                .min_by_key(|(_, p)| p.touched_at)
                .map(|(k, _)| *k)
            {
                if let Some(dropped) = self.partials.remove(&oldest_key) {
                    self.alloc.deallocate(dropped.buf);
                }
                evicted = true;
                tracing::warn!(?oldest_key, "reassembly cache full, dropped oldest partial message");
            }
        }

        let chunk_size_hint = chunk.len();
        let alloc = &self.alloc;
        let entry = self.partials.entry(key).or_insert_with(|| Partial {
            buf: alloc.allocate(chunk_size_hint),
            touched_at: Instant::now(),
        });
        entry.buf.extend_from_slice(chunk);
        entry.touched_at = Instant::now();

        if header.remain == 0 {
            let Partial { buf, .. } = self.partials.remove(&key).unwrap();
            return if evicted {
                Err(Error::Overflow)
            } else {
                Ok(Some(buf))
            };
        }

        if evicted {
            return Err(Error::Overflow);
        }
        Ok(None)
    }

    pub fn pending_count(&self) -> usize {
        self.partials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_message_roundtrips_in_one_fragment() {
        let f = Fragmenter::new(64).unwrap();
        let data = b"hello";
        let frags = f.fragment(1, 1, data);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].header.remain, REMAIN_INLINE);

        let mut r = Reassembler::new(4).unwrap();
        let out = r.push(frags[0].header, frags[0].chunk).unwrap();
        assert_eq!(out.unwrap(), data);
    }

    #[test]
    fn large_message_splits_and_reassembles() {
        let f = Fragmenter::new(4).unwrap();
        let data: Vec<u8> = (0u8..20).collect();
        let frags = f.fragment(1, 7, &data);
        assert!(frags.len() > 1);

        let mut r = Reassembler::new(4).unwrap();
        let mut result = None;
        for frag in &frags {
            if let Some(msg) = r.push(frag.header, frag.chunk).unwrap() {
                result = Some(msg);
            }
        }
        assert_eq!(result.unwrap(), data);
    }

    #[test]
    fn overflow_evicts_oldest_partial() {
        let mut r = Reassembler::new(1).unwrap();
        let h1 = FragmentHeader { conn_id: 1, msg_id: 1, remain: 5 };
        r.push(h1, b"aa").unwrap();

        let h2 = FragmentHeader { conn_id: 1, msg_id: 2, remain: 5 };
        let res = r.push(h2, b"bb");
        assert!(matches!(res, Err(Error::Overflow)));
        assert_eq!(r.pending_count(), 1);
    }
}
