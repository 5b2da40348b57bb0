//! Metadata root: the `BSJB` header and the stream directory behind it
//!
//! [0]: ECMA-335, Partition II, 24.2.1

use crate::binary_format::{align_up, expect_magic, pad_to, slice_at, Deserialize, Serialize};
use crate::Error;
use std::io::{Cursor, Read};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRoot {
    /// Runtime version string (`v4.0.30319`, `PDB v1.0`, ...)
    pub version: String,

    /// Streams in the order they appear
    pub streams: Vec<(String, Vec<u8>)>,
}

impl MetadataRoot {
    pub const MAGIC: &'static [u8] = b"BSJB";

    pub fn new(version: &str) -> MetadataRoot {
        MetadataRoot {
            version: version.to_owned(),
            streams: vec![],
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<MetadataRoot, Error> {
        let mut reader = Cursor::new(bytes);
        expect_magic(&mut reader, MetadataRoot::MAGIC)?;
        let _major = u16::deserialize(&mut reader)?;
        let _minor = u16::deserialize(&mut reader)?;
        let _reserved = u32::deserialize(&mut reader)?;
        let version_len = u32::deserialize(&mut reader)?;
        let mut version = vec![0; version_len as usize];
        reader.read_exact(&mut version)?;
        let version_end = version.iter().position(|b| *b == 0).unwrap_or(version.len());
        version.truncate(version_end);
        let version = String::from_utf8(version)?;

        let _flags = u16::deserialize(&mut reader)?;
        let count = u16::deserialize(&mut reader)?;
        let mut streams = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let offset = u32::deserialize(&mut reader)?;
            let size = u32::deserialize(&mut reader)?;
            let mut name = vec![];
            loop {
                let mut chunk = [0; 4];
                reader.read_exact(&mut chunk)?;
                name.extend_from_slice(&chunk);
                if chunk.contains(&0) {
                    break;
                }
            }
            let name_end = name.iter().position(|b| *b == 0).unwrap_or(name.len());
            name.truncate(name_end);
            let name = String::from_utf8(name)?;

            let data = slice_at(bytes, offset as usize, size as usize, "metadata stream")?;
            streams.push((name, data.to_vec()));
        }

        Ok(MetadataRoot { version, streams })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut version = self.version.clone().into_bytes();
        version.push(0);
        pad_to(&mut version, 4);

        let header_len: usize = 16
            + version.len()
            + 4
            + self
                .streams
                .iter()
                .map(|(name, _)| 8 + align_up(name.len() as u32 + 1, 4) as usize)
                .sum::<usize>();

        let mut bytes = Vec::with_capacity(header_len);
        bytes.extend_from_slice(MetadataRoot::MAGIC);
        1u16.serialize(&mut bytes)?;
        1u16.serialize(&mut bytes)?;
        0u32.serialize(&mut bytes)?;
        (version.len() as u32).serialize(&mut bytes)?;
        bytes.extend_from_slice(&version);
        0u16.serialize(&mut bytes)?;
        (self.streams.len() as u16).serialize(&mut bytes)?;

        let mut offset = header_len as u32;
        for (name, data) in &self.streams {
            offset.serialize(&mut bytes)?;
            (data.len() as u32).serialize(&mut bytes)?;
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(0);
            pad_to(&mut bytes, 4);
            offset += align_up(data.len() as u32, 4);
        }
        for (_, data) in &self.streams {
            bytes.extend_from_slice(data);
            pad_to(&mut bytes, 4);
        }
        Ok(bytes)
    }

    pub fn stream(&self, name: &str) -> Option<&[u8]> {
        self.streams
            .iter()
            .find(|(stream, _)| stream == name)
            .map(|(_, data)| data.as_slice())
    }

    /// Replace a stream's contents, adding it at the end if it isn't there yet
    pub fn set_stream(&mut self, name: &str, data: Vec<u8>) {
        match self.streams.iter_mut().find(|(stream, _)| stream == name) {
            Some((_, existing)) => *existing = data,
            None => self.streams.push((name.to_owned(), data)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn streams_read_back() {
        let mut root = MetadataRoot::new("v4.0.30319");
        root.set_stream("#~", vec![1, 2, 3, 4, 5]);
        root.set_stream("#Strings", vec![0, b'A', 0]);
        root.set_stream("#~", vec![9; 8]);

        let bytes = root.to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"BSJB");
        // "v4.0.30319" plus its terminator pads to 12 bytes
        assert_eq!(&bytes[12..16], &12u32.to_le_bytes());

        let parsed = MetadataRoot::parse(&bytes).unwrap();
        assert_eq!(parsed, root);
        assert_eq!(parsed.stream("#~"), Some(&[9u8; 8][..]));
        assert_eq!(parsed.stream("#Blob"), None);
    }

    #[test]
    fn streams_past_the_end_are_rejected() {
        let mut root = MetadataRoot::new("v4.0.30319");
        root.set_stream("#GUID", vec![0; 16]);
        let mut bytes = root.to_bytes().unwrap();
        bytes.truncate(bytes.len() - 4);
        assert!(matches!(
            MetadataRoot::parse(&bytes),
            Err(Error::MalformedImage(_))
        ));
    }
}
