//! Simulated address space
//!
//! The engine corrupts bytes through an [`AddressSpace`] instead of raw
//! pointers. [`FlatMemory`] is a single contiguous mapping, enough for trace
//! replay and tests.

/// Byte-addressable memory the engine can corrupt
pub trait AddressSpace: Send {
    /// Mutable view of `len` bytes at `start`, if fully mapped
    fn bytes_mut(&mut self, start: u64, len: usize) -> Option<&mut [u8]>;
}

/// One contiguous mapping starting at `base`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatMemory {
    base: u64,
    bytes: Vec<u8>,
}

impl FlatMemory {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            bytes: vec![0; size],
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn read(&self, address: u64, len: usize) -> Option<&[u8]> {
        let offset = usize::try_from(address.checked_sub(self.base)?).ok()?;
        self.bytes.get(offset..offset.checked_add(len)?)
    }

    /// Store `data` at `address`; false when it falls outside the mapping
    pub fn write(&mut self, address: u64, data: &[u8]) -> bool {
        match self.bytes_mut(address, data.len()) {
            Some(bytes) => {
                bytes.copy_from_slice(data);
                true
            }
            None => false,
        }
    }
}

impl AddressSpace for FlatMemory {
    fn bytes_mut(&mut self, start: u64, len: usize) -> Option<&mut [u8]> {
        let offset = start.checked_sub(self.base)?;
        let offset = usize::try_from(offset).ok()?;
        self.bytes.get_mut(offset..offset.checked_add(len)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_back_writes() {
        let mut memory = FlatMemory::new(0x100, 16);
        assert!(memory.write(0x104, &[1, 2, 3]));
        assert_eq!(memory.read(0x104, 3), Some(&[1u8, 2, 3][..]));
        assert_eq!(memory.read(0x100, 1), Some(&[0u8][..]));
    }

    #[test]
    fn test_rejects_unmapped_accesses() {
        let mut memory = FlatMemory::new(0x100, 16);
        assert!(memory.bytes_mut(0xff, 1).is_none());
        assert!(memory.bytes_mut(0x10f, 2).is_none());
        assert!(!memory.write(0x10e, &[0; 4]));
        assert!(memory.read(0x110, 1).is_none());
        assert_eq!(memory.bytes_mut(0x10f, 1).map(|b| b.len()), Some(1));
    }
}
