//! Direct positioned I/O used when a block cannot be mapped
//!
//! 块无法映射时使用的直接定位 I/O
//!
//! Callers hold the cache lock, so seeking the shared file cursor is not
//! raced by other cache operations.
//!
//! 调用者持有缓存锁，因此对共享文件游标的定位不会与其他缓存操作竞争。

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Fill `buf` from `offset`; bytes past end of file read as zero
///
/// 从 `offset` 读取填满 `buf`；超出文件末尾的字节读为 0
pub(crate) fn read_at(mut file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    buf[filled..].fill(0);
    Ok(())
}

/// Write all of `data` at `offset`, extending the file if needed
///
/// 在 `offset` 处写入全部 `data`，必要时扩展文件
pub(crate) fn write_at(mut file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn test_write_then_read_back() {
        let file = tempfile().unwrap();
        write_at(&file, 100, b"hello").unwrap();

        let mut buf = [0u8; 5];
        read_at(&file, 100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(file.metadata().unwrap().len(), 105);
    }

    #[test]
    fn test_read_past_end_is_zero_filled() {
        let file = tempfile().unwrap();
        write_at(&file, 0, b"abc").unwrap();

        let mut buf = [0xFFu8; 8];
        read_at(&file, 1, &mut buf).unwrap();
        assert_eq!(&buf, b"bc\0\0\0\0\0\0");
    }
}
