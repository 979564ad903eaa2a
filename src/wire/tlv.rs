// TLV helpers shared by structured payloads
//
// Each record is tag(1) | length(2, BE) | value. Readers skip unknown tags so
// newer peers can add fields without breaking older ones.

use crate::wire::codec::WireError;

#[derive(Default)]
pub struct TlvWriter {
    buf: Vec<u8>,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, tag: u8, value: &[u8]) -> Result<&mut Self, WireError> {
        let len = u16::try_from(value.len())
            .map_err(|_| WireError::MalformedTlv(format!("value for tag {} too long", tag)))?;
        self.buf.push(tag);
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(value);
        Ok(self)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Iterator over (tag, value) records
pub struct TlvReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> TlvReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = Result<(u8, &'a [u8]), WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.offset..];
        if rest.len() < 3 {
            self.offset = self.data.len();
            return Some(Err(WireError::MalformedTlv("truncated record header".to_string())));
        }
        let tag = rest[0];
        let len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
        if rest.len() < 3 + len {
            self.offset = self.data.len();
            return Some(Err(WireError::MalformedTlv(format!(
                "tag {} declares {} bytes, {} available",
                tag,
                len,
                rest.len() - 3
            ))));
        }
        self.offset += 3 + len;
        Some(Ok((tag, &rest[3..3 + len])))
    }
}
