//! Aligned and unaligned block transfers
//!
//! 对齐与非对齐的块传输
//!
//! An aligned transfer must fit inside one block. An unaligned transfer is
//! split into a leading partial block followed by whole blocks until no bytes
//! remain. Both run under the cache lock; writers take the per-file write lock
//! before entering here.
//!
//! 对齐传输必须位于单个块之内。非对齐传输被拆分为开头的部分块和随后的完整块，
//! 直到没有剩余字节。两者都在缓存锁下执行；写入者在进入此处之前已获取文件写锁。

use super::CacheState;
use super::config::{BlockShift, CacheConfig};
use super::direct_io;
use super::mapper;
use super::registry::FileId;
use crate::error::{Error, Result};
use std::io;
use std::ops::Range;
use tracing::warn;

/// Caller buffer and the direction bytes move in
///
/// 调用者缓冲区及字节移动方向
pub(crate) enum Transfer<'a> {
    /// Block bytes are copied into the buffer
    Read(&'a mut [u8]),
    /// Buffer bytes are copied into the block
    Write(&'a [u8]),
}

impl Transfer<'_> {
    #[inline]
    pub(crate) fn len(&self) -> usize {
        match self {
            Transfer::Read(buf) => buf.len(),
            Transfer::Write(data) => data.len(),
        }
    }

    #[inline]
    fn copy(&mut self, part: Range<usize>, view: &mut [u8]) {
        match self {
            Transfer::Read(buf) => buf[part].copy_from_slice(view),
            Transfer::Write(data) => view.copy_from_slice(&data[part]),
        }
    }
}

/// Block index holding `offset`
fn block_index(shift: BlockShift, offset: u64) -> Result<u32> {
    u32::try_from(shift.block_of(offset)).map_err(|_| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("offset {offset} is beyond the last addressable block"),
        ))
    })
}

/// Move `part` of the caller buffer to or from one block
///
/// 在调用者缓冲区的 `part` 与单个块之间移动字节
fn transfer_block(
    state: &mut CacheState,
    config: &CacheConfig,
    file: FileId,
    block: u32,
    in_block: usize,
    transfer: &mut Transfer<'_>,
    part: Range<usize>,
) -> Result<()> {
    let len = part.len();
    match mapper::resolve(state, config, file, block) {
        Ok(view) => {
            transfer.copy(part, &mut view[in_block..in_block + len]);
            Ok(())
        }
        Err(err) if config.write_through && err.is_mapping_failure() => {
            let entry = state.registry.get(file)?;
            let offset = (u64::from(block) << entry.shift.get()) + in_block as u64;
            warn!(file = %file, block, error = %err, "block unavailable, using direct I/O");
            match transfer {
                Transfer::Read(buf) => direct_io::read_at(&entry.file, offset, &mut buf[part])?,
                Transfer::Write(data) => direct_io::write_at(&entry.file, offset, &data[part])?,
            }
            state.counters.write_through_ops += 1;
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Transfer a range that lies inside a single block
///
/// 传输位于单个块内的范围
pub(crate) fn aligned(
    state: &mut CacheState,
    config: &CacheConfig,
    file: FileId,
    offset: u64,
    mut transfer: Transfer<'_>,
) -> Result<()> {
    let shift = state.registry.get(file)?.shift;
    let len = transfer.len();
    let in_block = shift.offset_in_block(offset);
    if in_block + len as u64 > shift.block_size() {
        return Err(Error::CrossesBlock {
            offset,
            len,
            block_size: shift.block_size(),
        });
    }
    if len == 0 {
        return Ok(());
    }
    let block = block_index(shift, offset)?;
    transfer_block(state, config, file, block, in_block as usize, &mut transfer, 0..len)
}

/// Transfer a range that may span any number of blocks
///
/// 传输可能跨越任意数量块的范围
pub(crate) fn unaligned(
    state: &mut CacheState,
    config: &CacheConfig,
    file: FileId,
    offset: u64,
    mut transfer: Transfer<'_>,
) -> Result<()> {
    let shift = state.registry.get(file)?.shift;
    let block_size = shift.block_size();
    let len = transfer.len();

    let mut done = 0;
    let mut pos = offset;
    while done < len {
        let in_block = shift.offset_in_block(pos);
        let chunk = ((block_size - in_block) as usize).min(len - done);
        let block = block_index(shift, pos)?;
        transfer_block(
            state,
            config,
            file,
            block,
            in_block as usize,
            &mut transfer,
            done..done + chunk,
        )?;
        done += chunk;
        pos += chunk as u64;
    }
    Ok(())
}
