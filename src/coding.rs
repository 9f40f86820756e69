// Copyright (c) 2025-present, skarn-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Encoding and decoding of fixed-size log records.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Trait to serialize stuff
pub trait Encode {
    /// Serializes into writer.
    fn encode_into<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()>;
}

/// Trait to deserialize stuff
pub trait Decode: Sized {
    /// Deserializes from reader.
    fn decode_from<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self>;
}

/// A fixed-size key/value record as stored in the log.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Record {
    pub key: u64,
    pub value: u64,
}

impl Record {
    #[must_use]
    pub const fn new(key: u64, value: u64) -> Self {
        Self { key, value }
    }

    /// Serialized size in bytes.
    #[must_use]
    pub const fn serialized_len() -> usize {
        2 * std::mem::size_of::<u64>()
    }
}

impl Encode for Record {
    fn encode_into<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(self.key)?;
        writer.write_u64::<LittleEndian>(self.value)?;
        Ok(())
    }
}

impl Decode for Record {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        let key = reader.read_u64::<LittleEndian>()?;
        let value = reader.read_u64::<LittleEndian>()?;
        Ok(Self { key, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() -> std::io::Result<()> {
        let record = Record::new(42, 84);

        let mut bytes = vec![];
        record.encode_into(&mut bytes)?;
        assert_eq!(Record::serialized_len(), bytes.len());

        let decoded = Record::decode_from(&mut &bytes[..])?;
        assert_eq!(record, decoded);

        Ok(())
    }
}
