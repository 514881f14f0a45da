use crate::error::SyncError;

/// Widths of file addresses and lengths, fixed per file by the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sizes {
    pub offset: usize,
    pub length: usize,
}

/// Little-endian reader over one decoded structure.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    sizes: Sizes,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8], sizes: Sizes) -> Self {
        Self { buf, pos: 0, sizes }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], SyncError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                malformed(format!(
                    "structure truncated: wanted {len} bytes at offset {} of {}",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), SyncError> {
        self.bytes(len).map(|_| ())
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn u8(&mut self) -> Result<u8, SyncError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, SyncError> {
        Ok(self.uint(2)? as u16)
    }

    pub fn u32(&mut self) -> Result<u32, SyncError> {
        Ok(self.uint(4)? as u32)
    }

    pub fn uint(&mut self, width: usize) -> Result<u64, SyncError> {
        if width > 8 {
            return Err(malformed(format!("unsupported integer width {width}")));
        }
        Ok(le_uint(self.bytes(width)?))
    }

    /// A file address. The all-ones pattern marks an undefined address.
    pub fn address(&mut self) -> Result<Option<u64>, SyncError> {
        let raw = self.bytes(self.sizes.offset)?;
        if raw.iter().all(|byte| *byte == 0xff) {
            return Ok(None);
        }
        Ok(Some(le_uint(raw)))
    }

    pub fn required_address(&mut self, what: &str) -> Result<u64, SyncError> {
        self.address()?
            .ok_or_else(|| malformed(format!("undefined {what} address")))
    }

    pub fn length(&mut self) -> Result<u64, SyncError> {
        self.uint(self.sizes.length)
    }

    pub fn signature(&mut self, expected: &[u8; 4]) -> Result<(), SyncError> {
        let found = self.bytes(4)?;
        if found != expected {
            return Err(malformed(format!(
                "expected {} signature, found {:?}",
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(found)
            )));
        }
        Ok(())
    }

    /// Null-terminated string; returns the text and the bytes consumed,
    /// terminator included.
    pub fn cstring(&mut self) -> Result<(String, usize), SyncError> {
        let rest = &self.buf[self.pos..];
        let len = rest
            .iter()
            .position(|byte| *byte == 0)
            .ok_or_else(|| malformed("unterminated string"))?;
        let text = utf8(&rest[..len])?;
        self.pos += len + 1;
        Ok((text, len + 1))
    }
}

pub fn le_uint(raw: &[u8]) -> u64 {
    raw.iter()
        .rev()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
}

pub fn utf8(raw: &[u8]) -> Result<String, SyncError> {
    String::from_utf8(raw.to_vec()).map_err(|_| malformed("name is not valid UTF-8"))
}

/// Bytes up to the first null.
pub fn until_nul(raw: &[u8]) -> &[u8] {
    let end = raw.iter().position(|byte| *byte == 0).unwrap_or(raw.len());
    &raw[..end]
}

pub fn padded8(len: usize) -> usize {
    len.div_ceil(8) * 8
}

pub fn log2_floor(value: u64) -> u32 {
    if value == 0 { 0 } else { 63 - value.leading_zeros() }
}

/// Bytes needed to encode counts up to `max`.
pub fn encoded_width(max: u64) -> usize {
    (log2_floor(max) / 8 + 1) as usize
}

pub fn malformed(message: impl Into<String>) -> SyncError {
    SyncError::Hdf5Format(message.into())
}
