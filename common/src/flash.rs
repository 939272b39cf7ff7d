use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ERASED_BYTE: u8 = 0xFF;

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("range {offset:#x}+{len:#x} is outside the device ({capacity:#x} bytes)")]
    OutOfBounds { offset: u32, len: u32, capacity: u32 },
    #[error("erase range {offset:#x}+{len:#x} is not aligned to {erase_size:#x}")]
    Unaligned {
        offset: u32,
        len: u32,
        erase_size: u32,
    },
    #[error("flash device error: {0}")]
    Device(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Byte-addressed NOR-style flash: writes can only clear bits, erases set a
/// whole erase unit back to `0xFF`.
pub trait BlockDevice {
    fn capacity(&self) -> u32;
    fn erase_size(&self) -> u32;
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;
    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for Box<D> {
    fn capacity(&self) -> u32 {
        (**self).capacity()
    }

    fn erase_size(&self) -> u32 {
        (**self).erase_size()
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(offset, buf)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).write(offset, data)
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        (**self).erase(offset, len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashRegion {
    pub offset: u32,
    pub size: u32,
}

impl FlashRegion {
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.size)
    }

    pub fn overlaps(&self, other: &FlashRegion) -> bool {
        u64::from(self.offset) < other.end() && u64::from(other.offset) < self.end()
    }
}

pub fn check_range(capacity: u32, offset: u32, len: usize) -> Result<(), FlashError> {
    let len = u32::try_from(len).map_err(|_| FlashError::OutOfBounds {
        offset,
        len: u32::MAX,
        capacity,
    })?;
    if u64::from(offset) + u64::from(len) > u64::from(capacity) {
        return Err(FlashError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}

pub fn check_erase_alignment(erase_size: u32, offset: u32, len: u32) -> Result<(), FlashError> {
    if erase_size == 0 || offset % erase_size != 0 || len % erase_size != 0 {
        return Err(FlashError::Unaligned {
            offset,
            len,
            erase_size,
        });
    }
    Ok(())
}

pub fn region_is_erased<D: BlockDevice + ?Sized>(
    device: &mut D,
    region: FlashRegion,
) -> Result<bool, FlashError> {
    let mut chunk = [0_u8; 256];
    let mut offset = region.offset;
    let end = region.end();

    while u64::from(offset) < end {
        let remaining = (end - u64::from(offset)).min(chunk.len() as u64) as usize;
        device.read(offset, &mut chunk[..remaining])?;
        if chunk[..remaining].iter().any(|byte| *byte != ERASED_BYTE) {
            return Ok(false);
        }
        offset = offset.saturating_add(remaining as u32);
    }
    Ok(true)
}

#[derive(Debug, Clone)]
pub struct MemFlash {
    storage: Vec<u8>,
    erase_size: u32,
    erase_count: u32,
    fail_erase: bool,
    fail_write: bool,
    torn_write_after: Option<usize>,
}

impl MemFlash {
    pub fn new(capacity: u32, erase_size: u32) -> Self {
        Self {
            storage: vec![ERASED_BYTE; capacity as usize],
            erase_size,
            erase_count: 0,
            fail_erase: false,
            fail_write: false,
            torn_write_after: None,
        }
    }

    pub fn contents(&self, offset: u32, len: usize) -> &[u8] {
        let start = offset as usize;
        &self.storage[start..start + len]
    }

    pub fn erase_count(&self) -> u32 {
        self.erase_count
    }

    pub fn set_fail_erase(&mut self, fail: bool) {
        self.fail_erase = fail;
    }

    pub fn set_fail_write(&mut self, fail: bool) {
        self.fail_write = fail;
    }

    pub fn tear_next_write(&mut self, bytes: usize) {
        self.torn_write_after = Some(bytes);
    }
}

impl BlockDevice for MemFlash {
    fn capacity(&self) -> u32 {
        self.storage.len() as u32
    }

    fn erase_size(&self) -> u32 {
        self.erase_size
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        check_range(self.capacity(), offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.storage[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        check_range(self.capacity(), offset, data.len())?;
        if self.fail_write {
            return Err(FlashError::Device("injected write failure".to_string()));
        }

        let (len, torn) = match self.torn_write_after.take() {
            Some(limit) if limit < data.len() => (limit, true),
            _ => (data.len(), false),
        };

        let start = offset as usize;
        for (dst, src) in self.storage[start..start + len].iter_mut().zip(data) {
            *dst &= *src;
        }

        if torn {
            return Err(FlashError::Device("write interrupted".to_string()));
        }
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        check_range(self.capacity(), offset, len as usize)?;
        check_erase_alignment(self.erase_size, offset, len)?;
        if self.fail_erase {
            return Err(FlashError::Device("injected erase failure".to_string()));
        }

        let start = offset as usize;
        self.storage[start..start + len as usize].fill(ERASED_BYTE);
        self.erase_count = self.erase_count.saturating_add(1);
        Ok(())
    }
}
