//! Little-endian byte streams for archive records.

use crate::error::{Error, Result};

use super::ArchiveId;

/// Appends archive records to a byte buffer.
#[derive(Debug, Default)]
pub struct ArchiveStreamWriter {
    data: Vec<u8>,
}

impl ArchiveStreamWriter {
    pub fn new() -> ArchiveStreamWriter {
        ArchiveStreamWriter::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_id(&mut self, id: ArchiveId) {
        self.write_u32(id);
    }

    /// Writes a length-prefixed byte string. Instruction byte strings fit a
    /// one-byte length.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > u8::MAX as usize {
            return Err(Error::Custom(format!(
                "byte string of {} does not fit an archive record",
                bytes.len()
            )));
        }
        self.write_u8(bytes.len() as u8);
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Reads archive records back out of a byte buffer.
#[derive(Debug)]
pub struct ArchiveStreamReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ArchiveStreamReader<'a> {
    pub fn new(data: &'a [u8]) -> ArchiveStreamReader<'a> {
        ArchiveStreamReader { data, offset: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.offset + count > self.data.len() {
            return Err(Error::EndOfStream);
        }
        let bytes = &self.data[self.offset..self.offset + count];
        self.offset += count;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut buffer = [0u8; 8];
        buffer.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buffer))
    }

    pub fn read_id(&mut self) -> Result<ArchiveId> {
        self.read_u32()
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_u8()? as usize;
        Ok(self.take(length)?.to_vec())
    }

    /// True once every byte has been consumed.
    pub fn at_end(&self) -> bool {
        self.offset == self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitives() {
        let mut writer = ArchiveStreamWriter::new();
        writer.write_u8(0x17);
        writer.write_u32(0xdead_beef);
        writer.write_u64(0x0123_4567_89ab_cdef);
        writer.write_bytes(&[1, 2, 3]).unwrap();

        let data = writer.into_vec();
        let mut reader = ArchiveStreamReader::new(&data);
        assert_eq!(reader.read_u8().unwrap(), 0x17);
        assert_eq!(reader.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(reader.read_u64().unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(reader.read_bytes().unwrap(), vec![1, 2, 3]);
        assert!(reader.at_end());
        assert!(reader.read_u8().is_err());
    }
}
