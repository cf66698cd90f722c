//! Character sets used to encode entry filenames and disk names
//!
//! The format stores names as zero-padded byte strings and says nothing
//! about their encoding, so every encode/decode call takes a [`Charset`].

use crate::error::{Result, TevdError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    /// UTF-8; undecodable sequences are replaced with U+FFFD
    #[default]
    Utf8,
    /// ISO-8859-1, one byte per character
    Latin1,
}

impl Charset {
    pub fn name(&self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::Latin1 => "ISO-8859-1",
        }
    }

    pub fn encode(&self, s: &str) -> Result<Vec<u8>> {
        match self {
            Charset::Utf8 => Ok(s.as_bytes().to_vec()),
            Charset::Latin1 => s
                .chars()
                .map(|ch| {
                    u8::try_from(u32::from(ch)).map_err(|_| TevdError::Unencodable {
                        ch,
                        charset: self.name(),
                    })
                })
                .collect(),
        }
    }

    /// Decode a stored name, stripping trailing zero padding
    pub fn decode(&self, bytes: &[u8]) -> String {
        let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
        let bytes = &bytes[..end];
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }

    /// Encode into a fixed-width zero-padded field
    pub fn encode_fixed<const N: usize>(&self, s: &str) -> Result<[u8; N]> {
        let encoded = self.encode(s)?;
        if encoded.len() > N {
            return Err(TevdError::FilenameTooLong {
                len: encoded.len(),
                max: N,
            });
        }
        let mut field = [0u8; N];
        field[..encoded.len()].copy_from_slice(&encoded);
        Ok(field)
    }
}
