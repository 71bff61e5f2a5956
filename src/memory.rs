//! Linear memory: a page-granular, bounds-checked byte buffer.

use memory_units::{Bytes, Pages};

use crate::error::TrapCode;
use crate::store::{AsContext, AsContextMut, Stored};

/// The fixed size of one linear memory page: 64 KiB.
pub const PAGE_SIZE: Bytes = Bytes(65536);

/// A memory's shape: its initial page count and, if bounded, its maximum.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryType {
    initial: u32,
    maximum: Option<u32>,
}

impl MemoryType {
    /// Creates a new memory type.
    pub fn new(initial: u32, maximum: Option<u32>) -> Self {
        Self { initial, maximum }
    }

    /// The number of pages the memory starts with.
    pub fn initial(&self) -> u32 {
        self.initial
    }

    /// The maximum number of pages the memory may reach, if bounded.
    pub fn maximum(&self) -> Option<u32> {
        self.maximum
    }
}

/// The in-`Store` linear memory entity.
#[derive(Debug)]
pub struct MemoryEntity {
    bytes: Vec<u8>,
    current_pages: u32,
    maximum_pages: Option<u32>,
}

impl MemoryEntity {
    pub(crate) fn new(memory_type: MemoryType) -> Self {
        let initial_bytes: Bytes = Pages(memory_type.initial() as usize).into();
        Self {
            bytes: vec![0u8; initial_bytes.0],
            current_pages: memory_type.initial(),
            maximum_pages: memory_type.maximum(),
        }
    }

    /// The current size, in pages.
    pub fn size(&self) -> u32 {
        self.current_pages
    }

    /// Grows the memory by `delta` pages.
    ///
    /// Returns the previous page count, or `None` if growth was refused
    /// (the new size would exceed the declared maximum, or `u32` range).
    pub fn grow(&mut self, delta: u32) -> Option<u32> {
        let new_pages = self.current_pages.checked_add(delta)?;
        if let Some(max) = self.maximum_pages {
            if new_pages > max {
                return None;
            }
        }
        let old_pages = self.current_pages;
        let new_len: Bytes = Pages(new_pages as usize).into();
        self.bytes.resize(new_len.0, 0u8);
        self.current_pages = new_pages;
        Some(old_pages)
    }

    fn effective_address(&self, addr: u32, offset: u32, len: usize) -> Result<usize, TrapCode> {
        let effective = addr
            .checked_add(offset)
            .ok_or(TrapCode::OutOfBoundsMemoryAccess)? as usize;
        let end = effective
            .checked_add(len)
            .ok_or(TrapCode::OutOfBoundsMemoryAccess)?;
        if end > self.bytes.len() {
            return Err(TrapCode::OutOfBoundsMemoryAccess);
        }
        Ok(effective)
    }

    /// Reads a little-endian `T` from `addr + offset`.
    pub fn read<T: ReadLe>(&self, addr: u32, offset: u32) -> Result<T, TrapCode> {
        let len = core::mem::size_of::<T>();
        let start = self.effective_address(addr, offset, len)?;
        Ok(T::read_le(&self.bytes[start..start + len]))
    }

    /// Writes a little-endian `T` to `addr + offset`.
    pub fn write<T: WriteLe>(&mut self, addr: u32, offset: u32, value: T) -> Result<(), TrapCode> {
        let len = core::mem::size_of::<T>();
        let start = self.effective_address(addr, offset, len)?;
        value.write_le(&mut self.bytes[start..start + len]);
        Ok(())
    }

    /// Copies `bytes` into the memory starting at `offset`, used to apply
    /// data segments. Fails if the segment runs past the end of memory.
    pub(crate) fn init_data(&mut self, offset: u32, bytes: &[u8]) -> Result<(), TrapCode> {
        let start = self.effective_address(offset, 0, bytes.len())?;
        self.bytes[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// Reads a value from a little-endian byte slice.
pub trait ReadLe {
    /// Decodes `Self` from the first `size_of::<Self>()` bytes of `bytes`.
    fn read_le(bytes: &[u8]) -> Self;
}

/// Writes a value into a little-endian byte slice.
pub trait WriteLe {
    /// Encodes `self` into the first `size_of::<Self>()` bytes of `bytes`.
    fn write_le(&self, bytes: &mut [u8]);
}

macro_rules! impl_le {
    ($($t:ty),* $(,)?) => {
        $(
            impl ReadLe for $t {
                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; core::mem::size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    <$t>::from_le_bytes(buf)
                }
            }

            impl WriteLe for $t {
                fn write_le(&self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}
impl_le!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

/// A handle to a [`MemoryEntity`] allocated in a [`Store`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Memory {
    inner: Stored<crate::store::MemoryIdx>,
}

impl Memory {
    pub(crate) fn from_inner(inner: Stored<crate::store::MemoryIdx>) -> Self {
        Self { inner }
    }

    pub(crate) fn into_inner(self) -> Stored<crate::store::MemoryIdx> {
        self.inner
    }

    /// Allocates a new memory of the given shape in `store`.
    pub fn new(mut ctx: impl AsContextMut, memory_type: MemoryType) -> Self {
        ctx.as_context_mut()
            .store
            .alloc_memory(MemoryEntity::new(memory_type))
    }

    /// Returns the current size, in pages.
    pub fn size(&self, ctx: impl AsContext) -> u32 {
        ctx.as_context()
            .store
            .resolve_memory(*self)
            .expect("memory handle out of bounds")
            .size()
    }

    /// Grows the memory by `delta` pages.
    pub fn grow(&self, mut ctx: impl AsContextMut, delta: u32) -> Option<u32> {
        ctx.as_context_mut()
            .store
            .resolve_memory_mut(*self)
            .expect("memory handle out of bounds")
            .grow(delta)
    }
}
