use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use alloc::{vec, vec::Vec};
use core::fmt;

/// A block device kept entirely in kernel memory.
pub struct RamDisk {
    sects: Vec<[u8; BLOCK_SECTOR_SIZE]>,
    /// Rejects every write when set. Lets tests model a failing disk.
    fail_writes: bool,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        RamDisk {
            sects: vec![[0; BLOCK_SECTOR_SIZE]; sectors as usize],
            fail_writes: false,
        }
    }

    pub fn sectors(&self) -> BlockSector {
        self.sects.len() as BlockSector
    }

    #[cfg(test)]
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    fn sector(&self, sector: BlockSector) -> Result<&[u8; BLOCK_SECTOR_SIZE], BlockError> {
        self.sects
            .get(sector as usize)
            .ok_or(BlockError::SectorOutOfBounds)
    }
}

impl fmt::Debug for RamDisk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RamDisk")
            .field("sectors", &self.sects.len())
            .finish()
    }
}

impl BlockOp for RamDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let src = self.sector(sector)?;
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        if self.fail_writes {
            return Err(BlockError::WriteError);
        }
        let dst = self
            .sects
            .get_mut(sector as usize)
            .ok_or(BlockError::SectorOutOfBounds)?;
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        dst.copy_from_slice(buf);
        Ok(())
    }
}
