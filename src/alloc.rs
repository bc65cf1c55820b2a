// The allocator seam for the reassembly cache's process-local bookkeeping
// (spec §6). Never touches the shared region — only where a partial
// message's bytes live while fragments are still arriving.

/// Where a [`crate::fragment::Reassembler`] gets the backing storage for an
/// in-progress partial message. The `bump_alloc`/`slab_pool` feature types in
/// [`crate::mem`] can back a custom implementation of this trait; neither is
/// wired in by default since a bump arena can't free a single partial
/// message's bytes independently of every other one allocated alongside it.
pub trait ReassemblyAlloc: Send + Sync {
    fn allocate(&self, size_hint: usize) -> Vec<u8>;
    fn deallocate(&self, _buf: Vec<u8>) {}
}

/// Default: the global heap allocator, same as a bare `Vec::with_capacity`.
pub struct SystemAlloc;

impl ReassemblyAlloc for SystemAlloc {
    fn allocate(&self, size_hint: usize) -> Vec<u8> {
        Vec::with_capacity(size_hint)
    }
}
