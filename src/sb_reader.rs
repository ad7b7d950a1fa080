use anyhow::{ensure, Result};

use std::io::{Read, Seek, SeekFrom};

/// Little-endian primitive reads over any byte source.
pub trait SbRead: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut data = [0; 1];
        self.read_exact(&mut data)?;
        Ok(data[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut data = [0; 2];
        self.read_exact(&mut data)?;
        Ok(u16::from_le_bytes(data))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut data = [0; 4];
        self.read_exact(&mut data)?;
        Ok(u32::from_le_bytes(data))
    }

    fn read_bytes_len_u16(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()?;
        let mut bytes = vec![0u8; len.into()];
        self.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

impl<R: Read> SbRead for R {}

/// Seekable access on top of [`SbRead`], including the indirect
/// `base + 8 * slot` addressing used by everything past the node array.
pub trait SbSeek: SbRead + Seek {
    fn byte_len(&mut self) -> Result<u64> {
        let here = self.stream_position()?;
        let len = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(here))?;
        Ok(len)
    }

    /// Table of `count` consecutive u16 entries at `offset`.
    fn read_u16_table(&mut self, offset: u64, count: usize) -> Result<Vec<u16>> {
        self.seek(SeekFrom::Start(offset))?;
        (0..count).map(|_| self.read_u16()).collect()
    }

    /// Seek to `base_addr + 8 * slot`, validating the target against
    /// the file length first.
    fn seek_indirect(
        &mut self,
        base_addr: u64,
        slot: u16,
        file_len: u64,
    ) -> Result<u64> {
        let addr = base_addr + 8 * u64::from(slot);
        ensure!(
            addr + 2 <= file_len,
            "indirect slot {slot} resolves to {addr}, past end of file \
             ({file_len} bytes)",
        );
        self.seek(SeekFrom::Start(addr))?;
        Ok(addr)
    }

    /// Length-prefixed record (`u16 length` then payload) at an
    /// indirect slot.
    fn read_indirect_record(
        &mut self,
        base_addr: u64,
        slot: u16,
        file_len: u64,
    ) -> Result<Vec<u8>> {
        let addr = self.seek_indirect(base_addr, slot, file_len)?;
        let len = self.read_u16()?;
        ensure!(
            addr + 2 + u64::from(len) <= file_len,
            "record at {addr} claims {len} bytes, past end of file",
        );
        let mut bytes = vec![0u8; len.into()];
        self.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// C string at an indirect slot; the length prefix counts the
    /// trailing NUL, which is stripped.
    fn read_indirect_c_string(
        &mut self,
        base_addr: u64,
        slot: u16,
        file_len: u64,
    ) -> Result<String> {
        let mut bytes = self.read_indirect_record(base_addr, slot, file_len)?;
        ensure!(!bytes.is_empty(), "empty C string record at slot {slot}");
        ensure!(
            bytes.pop() == Some(b'\x00'),
            "C string record at slot {slot} is not NUL terminated",
        );
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl<R: SbRead + Seek> SbSeek for R {}
