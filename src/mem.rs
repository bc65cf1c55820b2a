// Process-local allocator backends for the reassembly cache's bookkeeping.
// Neither of these ever touches the shared region — they exist only to
// trade general-purpose heap churn on a hot receive path for something more
// predictable, and are opt-in via feature flags.

#[cfg(feature = "bump_alloc")]
pub use bump::BumpArena;

#[cfg(feature = "slab_pool")]
pub use pool::SlabPool;

#[cfg(feature = "bump_alloc")]
mod bump {
    use bumpalo::Bump;

    /// Arena for short-lived scratch allocations (e.g. building a batch of
    /// evicted-partial log records before a cache sweep). Reset between
    /// sweeps rather than freed allocation-by-allocation.
    pub struct BumpArena {
        bump: Bump,
    }

    impl BumpArena {
        pub fn new() -> Self {
            Self { bump: Bump::new() }
        }

        pub fn alloc_slice_copy<'a>(&'a self, data: &[u8]) -> &'a [u8] {
            self.bump.alloc_slice_copy(data)
        }

        pub fn reset(&mut self) {
            self.bump.reset();
        }

        pub fn allocated_bytes(&self) -> usize {
            self.bump.allocated_bytes()
        }
    }

    impl Default for BumpArena {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(feature = "slab_pool")]
mod pool {
    use slab::Slab;

    /// Fixed-`BLOCK`-sized-block pool for reassembled message bytes, so the
    /// receive path reuses recently-freed blocks instead of round-tripping
    /// through the global allocator for every message.
    pub struct SlabPool<const BLOCK: usize> {
        slab: Slab<[u8; BLOCK]>,
    }

    impl<const BLOCK: usize> SlabPool<BLOCK> {
        pub fn new() -> Self {
            Self { slab: Slab::new() }
        }

        pub fn insert_from_slice(&mut self, data: &[u8]) -> Option<usize> {
            if data.len() > BLOCK {
                return None;
            }
            let mut block = [0u8; BLOCK];
            block[..data.len()].copy_from_slice(data);
            Some(self.slab.insert(block))
        }

        pub fn get(&self, key: usize) -> Option<&[u8; BLOCK]> {
            self.slab.get(key)
        }

        pub fn remove(&mut self, key: usize) -> [u8; BLOCK] {
            self.slab.remove(key)
        }

        pub fn len(&self) -> usize {
            self.slab.len()
        }

        pub fn is_empty(&self) -> bool {
            self.slab.is_empty()
        }
    }

    impl<const BLOCK: usize> Default for SlabPool<BLOCK> {
        fn default() -> Self {
            Self::new()
        }
    }
}
