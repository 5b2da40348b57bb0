//! PE/COFF images
//!
//! Only what a managed assembly needs: the headers, the section table, and the data
//! directories. Rewritten images keep every original byte where it was and gain one extra
//! section, so native code, resources, and anything else this crate doesn't understand
//! survives untouched.
//!
//! [0]: ECMA-335, Partition II, 25

use crate::binary_format::{align_up, slice_at};
use crate::Error;
use byteorder::{ByteOrder, LittleEndian};

/// Data directory indices
pub mod dirs {
    pub const CERTIFICATE: usize = 4;
    pub const DEBUG: usize = 6;
    pub const CLI_HEADER: usize = 14;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct DataDirectory {
    pub rva: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub raw_size: u32,
    pub raw_pointer: u32,
    pub characteristics: u32,
}

impl Section {
    const HEADER_SIZE: usize = 40;

    pub fn name(&self) -> String {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    fn contains_rva(&self, rva: u32) -> bool {
        let extent = self.virtual_size.max(self.raw_size);
        rva >= self.virtual_address && rva - self.virtual_address < extent
    }
}

/// A parsed PE image, holding on to the file's bytes
#[derive(Clone, PartialEq, Eq)]
pub struct PeImage {
    bytes: Vec<u8>,
    coff_offset: usize,
    optional_offset: usize,
    pe32_plus: bool,
    sections: Vec<Section>,
}

impl PeImage {
    pub const PE32: u16 = 0x10B;
    pub const PE32_PLUS: u16 = 0x20B;

    // Offsets into the optional header (the same for PE32 and PE32+ up to the checksum)
    const SIZE_OF_CODE: usize = 4;
    const SECTION_ALIGNMENT: usize = 32;
    const FILE_ALIGNMENT: usize = 36;
    const SIZE_OF_IMAGE: usize = 56;
    const SIZE_OF_HEADERS: usize = 60;
    const CHECKSUM: usize = 64;

    pub fn parse(bytes: Vec<u8>) -> Result<PeImage, Error> {
        let dos = slice_at(&bytes, 0, 0x40, "DOS header")?;
        if &dos[..2] != b"MZ" {
            return Err(Error::BadMagic {
                expected: b"MZ",
                found: dos[..2].to_vec(),
            });
        }
        let pe_offset = LittleEndian::read_u32(&dos[0x3C..]) as usize;
        let signature = slice_at(&bytes, pe_offset, 4, "PE signature")?;
        if signature != b"PE\0\0" {
            return Err(Error::BadMagic {
                expected: b"PE\0\0",
                found: signature.to_vec(),
            });
        }

        let coff_offset = pe_offset + 4;
        let coff = slice_at(&bytes, coff_offset, 20, "COFF header")?;
        let section_count = LittleEndian::read_u16(&coff[2..]) as usize;
        let optional_size = LittleEndian::read_u16(&coff[16..]) as usize;

        let optional_offset = coff_offset + 20;
        let optional = slice_at(&bytes, optional_offset, optional_size, "optional header")?;
        if optional.len() < 2 {
            return Err(Error::MalformedImage(String::from("optional header is missing")));
        }
        let pe32_plus = match LittleEndian::read_u16(optional) {
            PeImage::PE32 => false,
            PeImage::PE32_PLUS => true,
            other => return Err(Error::UnsupportedVersion(other)),
        };

        let table_offset = optional_offset + optional_size;
        let table = slice_at(
            &bytes,
            table_offset,
            section_count * Section::HEADER_SIZE,
            "section table",
        )?;
        let sections = table
            .chunks_exact(Section::HEADER_SIZE)
            .map(|header| {
                let mut name = [0; 8];
                name.copy_from_slice(&header[..8]);
                Section {
                    name,
                    virtual_size: LittleEndian::read_u32(&header[8..]),
                    virtual_address: LittleEndian::read_u32(&header[12..]),
                    raw_size: LittleEndian::read_u32(&header[16..]),
                    raw_pointer: LittleEndian::read_u32(&header[20..]),
                    characteristics: LittleEndian::read_u32(&header[36..]),
                }
            })
            .collect();

        let image = PeImage {
            bytes,
            coff_offset,
            optional_offset,
            pe32_plus,
            sections,
        };
        if image.directory_count() <= dirs::CLI_HEADER {
            return Err(Error::MalformedImage(String::from(
                "image has no CLI header directory",
            )));
        }
        Ok(image)
    }

    /// Headers of an empty 32-bit DLL, ready for [`PeImage::with_section`]
    pub fn skeleton() -> PeImage {
        const PE_OFFSET: usize = 0x80;
        const OPTIONAL_SIZE: usize = 224;

        let mut bytes = vec![0; 0x200];
        bytes[..2].copy_from_slice(b"MZ");
        LittleEndian::write_u32(&mut bytes[0x3C..], PE_OFFSET as u32);
        bytes[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let coff = PE_OFFSET + 4;
        LittleEndian::write_u16(&mut bytes[coff..], 0x14C);
        LittleEndian::write_u16(&mut bytes[coff + 16..], OPTIONAL_SIZE as u16);
        LittleEndian::write_u16(&mut bytes[coff + 18..], 0x2102);

        let optional = coff + 20;
        let header = &mut bytes[optional..optional + OPTIONAL_SIZE];
        LittleEndian::write_u16(&mut header[0..], PeImage::PE32);
        header[2] = 8;
        LittleEndian::write_u32(&mut header[28..], 0x1000_0000);
        LittleEndian::write_u32(&mut header[PeImage::SECTION_ALIGNMENT..], 0x2000);
        LittleEndian::write_u32(&mut header[PeImage::FILE_ALIGNMENT..], 0x200);
        LittleEndian::write_u16(&mut header[40..], 4);
        LittleEndian::write_u16(&mut header[48..], 4);
        LittleEndian::write_u32(&mut header[PeImage::SIZE_OF_IMAGE..], 0x2000);
        LittleEndian::write_u32(&mut header[PeImage::SIZE_OF_HEADERS..], 0x200);
        LittleEndian::write_u16(&mut header[68..], 3);
        LittleEndian::write_u16(&mut header[70..], 0x8540);
        LittleEndian::write_u32(&mut header[72..], 0x10_0000);
        LittleEndian::write_u32(&mut header[76..], 0x1000);
        LittleEndian::write_u32(&mut header[80..], 0x10_0000);
        LittleEndian::write_u32(&mut header[84..], 0x1000);
        LittleEndian::write_u32(&mut header[92..], 16);

        PeImage {
            bytes,
            coff_offset: coff,
            optional_offset: optional,
            pe32_plus: false,
            sections: vec![],
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    fn optional_u32(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.bytes[self.optional_offset + offset..])
    }

    fn set_optional_u32(&mut self, offset: usize, value: u32) {
        LittleEndian::write_u32(&mut self.bytes[self.optional_offset + offset..], value)
    }

    fn directories_offset(&self) -> usize {
        if self.pe32_plus {
            112
        } else {
            96
        }
    }

    fn directory_count(&self) -> usize {
        self.optional_u32(self.directories_offset() - 4) as usize
    }

    pub fn directory(&self, index: usize) -> DataDirectory {
        if index >= self.directory_count() {
            return DataDirectory::default();
        }
        let offset = self.directories_offset() + index * 8;
        DataDirectory {
            rva: self.optional_u32(offset),
            size: self.optional_u32(offset + 4),
        }
    }

    fn set_directory(&mut self, index: usize, directory: DataDirectory) {
        let offset = self.directories_offset() + index * 8;
        self.set_optional_u32(offset, directory.rva);
        self.set_optional_u32(offset + 4, directory.size);
    }

    fn size_of_headers(&self) -> u32 {
        self.optional_u32(PeImage::SIZE_OF_HEADERS)
    }

    /// File offset of a relative virtual address
    pub fn rva_to_offset(&self, rva: u32) -> Result<usize, Error> {
        if rva < self.size_of_headers() {
            return Ok(rva as usize);
        }
        let section = self
            .sections
            .iter()
            .find(|section| section.contains_rva(rva))
            .ok_or_else(|| {
                Error::MalformedImage(format!("RVA 0x{:X} is not inside any section", rva))
            })?;
        let delta = rva - section.virtual_address;
        if delta >= section.raw_size {
            return Err(Error::MalformedImage(format!(
                "RVA 0x{:X} is in the uninitialized part of section '{}'",
                rva,
                section.name()
            )));
        }
        Ok((section.raw_pointer + delta) as usize)
    }

    /// Bytes at an RVA
    pub fn read(&self, rva: u32, len: u32) -> Result<&[u8], Error> {
        let offset = self.rva_to_offset(rva)?;
        slice_at(&self.bytes, offset, len as usize, "RVA range")
    }

    /// Everything from an RVA to the end of its section's raw data
    pub fn read_from(&self, rva: u32) -> Result<&[u8], Error> {
        let offset = self.rva_to_offset(rva)?;
        let end = self
            .sections
            .iter()
            .find(|section| section.contains_rva(rva))
            .map(|section| (section.raw_pointer + section.raw_size) as usize)
            .unwrap_or(self.size_of_headers() as usize)
            .min(self.bytes.len());
        self.bytes
            .get(offset..end)
            .ok_or_else(|| Error::MalformedImage(format!("RVA 0x{:X} is past the data", rva)))
    }

    /// RVA that a section appended now would start at
    pub fn next_section_rva(&self) -> u32 {
        let end = self
            .sections
            .iter()
            .map(|section| section.virtual_address + section.virtual_size.max(section.raw_size))
            .max()
            .unwrap_or_else(|| self.size_of_headers());
        align_up(end, self.optional_u32(PeImage::SECTION_ALIGNMENT))
    }

    /// Produce the final image with an extra section appended
    ///
    /// `contents` must have been laid out for [`PeImage::next_section_rva`]. The CLI header
    /// directory is pointed at `cli_header_offset` inside the new section. Any Authenticode
    /// signature is dropped, since it would no longer match.
    pub fn with_section(
        mut self,
        name: &str,
        contents: &[u8],
        cli_header_offset: u32,
    ) -> Result<Vec<u8>, Error> {
        let rva = self.next_section_rva();
        self.drop_certificate();
        self.make_room_for_section_header()?;

        let file_alignment = self.optional_u32(PeImage::FILE_ALIGNMENT);
        let raw_pointer = align_up(self.bytes.len() as u32, file_alignment);
        let raw_size = align_up(contents.len() as u32, file_alignment);
        self.bytes.resize(raw_pointer as usize, 0);
        self.bytes.extend_from_slice(contents);
        self.bytes.resize((raw_pointer + raw_size) as usize, 0);

        let mut section_name = [0; 8];
        for (slot, byte) in section_name.iter_mut().zip(name.bytes()) {
            *slot = byte;
        }
        let section = Section {
            name: section_name,
            virtual_size: contents.len() as u32,
            virtual_address: rva,
            raw_size,
            raw_pointer,
            characteristics: 0x6000_0020,
        };
        self.write_section_header(self.sections.len(), &section);
        self.sections.push(section);

        let coff = self.coff_offset;
        LittleEndian::write_u16(&mut self.bytes[coff + 2..], self.sections.len() as u16);

        let section_alignment = self.optional_u32(PeImage::SECTION_ALIGNMENT);
        let size_of_code = self.optional_u32(PeImage::SIZE_OF_CODE);
        self.set_optional_u32(PeImage::SIZE_OF_CODE, size_of_code + raw_size);
        self.set_optional_u32(
            PeImage::SIZE_OF_IMAGE,
            align_up(rva + contents.len() as u32, section_alignment),
        );
        self.set_optional_u32(PeImage::CHECKSUM, 0);
        self.set_directory(
            dirs::CLI_HEADER,
            DataDirectory {
                rva: rva + cli_header_offset,
                size: 72,
            },
        );

        Ok(self.bytes)
    }

    /// The certificate directory holds a file offset, not an RVA
    fn drop_certificate(&mut self) {
        let certificate = self.directory(dirs::CERTIFICATE);
        if certificate.size == 0 {
            return;
        }
        let end = certificate.rva as usize + certificate.size as usize;
        if align_up(end as u32, 8) as usize >= self.bytes.len() {
            self.bytes.truncate(certificate.rva as usize);
        }
        self.set_directory(dirs::CERTIFICATE, DataDirectory::default());
        log::debug!("Dropped the Authenticode signature");
    }

    /// Grow the headers by a file alignment unit if the section table is full
    fn make_room_for_section_header(&mut self) -> Result<(), Error> {
        let table_offset =
            self.optional_offset + LittleEndian::read_u16(&self.bytes[self.coff_offset + 16..]) as usize;
        let needed = (table_offset + (self.sections.len() + 1) * Section::HEADER_SIZE) as u32;
        let old_size = self.size_of_headers();
        if needed <= old_size {
            return Ok(());
        }

        let file_alignment = self.optional_u32(PeImage::FILE_ALIGNMENT);
        let new_size = align_up(needed, file_alignment);
        let first_section = self
            .sections
            .iter()
            .map(|section| section.virtual_address)
            .min()
            .unwrap_or(u32::MAX);
        if new_size > first_section {
            return Err(Error::UnsupportedImage(String::from(
                "no room for another section header",
            )));
        }

        let delta = new_size - old_size;
        let insert_at = old_size as usize;
        self.bytes
            .splice(insert_at..insert_at, std::iter::repeat(0).take(delta as usize));
        self.set_optional_u32(PeImage::SIZE_OF_HEADERS, new_size);

        for idx in 0..self.sections.len() {
            if self.sections[idx].raw_pointer >= old_size {
                self.sections[idx].raw_pointer += delta;
                let section = self.sections[idx].clone();
                self.write_section_header(idx, &section);
            }
        }

        // Debug directory entries point at their data by file offset too
        let debug = self.directory(dirs::DEBUG);
        if debug.size > 0 {
            let start = self.rva_to_offset(debug.rva)?;
            for entry in 0..(debug.size as usize / 28) {
                let field = start + entry * 28 + 24;
                if field + 4 > self.bytes.len() {
                    break;
                }
                let pointer = LittleEndian::read_u32(&self.bytes[field..]);
                if pointer >= old_size {
                    LittleEndian::write_u32(&mut self.bytes[field..], pointer + delta);
                }
            }
        }
        log::debug!("Grew the PE headers to 0x{:X} bytes", new_size);
        Ok(())
    }

    fn write_section_header(&mut self, idx: usize, section: &Section) {
        let optional_size = LittleEndian::read_u16(&self.bytes[self.coff_offset + 16..]) as usize;
        let start = self.optional_offset + optional_size + idx * Section::HEADER_SIZE;
        let header = &mut self.bytes[start..start + Section::HEADER_SIZE];
        header.fill(0);
        header[..8].copy_from_slice(&section.name);
        LittleEndian::write_u32(&mut header[8..], section.virtual_size);
        LittleEndian::write_u32(&mut header[12..], section.virtual_address);
        LittleEndian::write_u32(&mut header[16..], section.raw_size);
        LittleEndian::write_u32(&mut header[20..], section.raw_pointer);
        LittleEndian::write_u32(&mut header[36..], section.characteristics);
    }
}

impl std::fmt::Debug for PeImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeImage")
            .field("len", &self.bytes.len())
            .field("pe32_plus", &self.pe32_plus)
            .field("sections", &self.sections)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn skeleton_parses() {
        let skeleton = PeImage::skeleton();
        let parsed = PeImage::parse(skeleton.bytes().to_vec()).unwrap();
        assert!(parsed.sections().is_empty());
        assert_eq!(parsed.next_section_rva(), 0x2000);
        assert_eq!(parsed.directory(dirs::CLI_HEADER), DataDirectory::default());
    }

    #[test]
    fn appended_sections_are_addressable() {
        let contents: Vec<u8> = (0..100).collect();
        let bytes = PeImage::skeleton().with_section(".ilspan", &contents, 8).unwrap();
        let image = PeImage::parse(bytes).unwrap();

        assert_eq!(image.sections().len(), 1);
        assert_eq!(image.sections()[0].name(), ".ilspan");
        assert_eq!(image.directory(dirs::CLI_HEADER).rva, 0x2008);
        assert_eq!(image.read(0x2010, 4).unwrap(), &[16, 17, 18, 19]);
        assert_eq!(image.read_from(0x2060).unwrap()[..4], [96, 97, 98, 99]);
        assert!(image.rva_to_offset(0x4000).is_err());
        assert_eq!(image.bytes().len() % 0x200, 0);
    }

    #[test]
    fn full_section_tables_grow_the_headers() {
        let mut bytes = PeImage::skeleton().bytes().to_vec();
        for round in 0..4u8 {
            let image = PeImage::parse(bytes).unwrap();
            bytes = image.with_section(".ilspan", &[round; 16], 0).unwrap();
        }
        let image = PeImage::parse(bytes).unwrap();
        assert_eq!(image.size_of_headers(), 0x400);
        assert_eq!(image.sections().len(), 4);
        for (round, section) in image.sections().iter().enumerate() {
            assert_eq!(image.read(section.virtual_address, 16).unwrap(), &[round as u8; 16]);
        }
    }

    #[test]
    fn trailing_certificates_are_dropped() {
        let bytes = PeImage::skeleton().with_section(".ilspan", &[7; 16], 0).unwrap();
        let mut image = PeImage::parse(bytes).unwrap();
        let signed_len = image.bytes.len();
        image.bytes.extend_from_slice(&[0xCC; 24]);
        image.set_directory(
            dirs::CERTIFICATE,
            DataDirectory {
                rva: signed_len as u32,
                size: 24,
            },
        );

        let bytes = image.with_section(".ilspan", &[8; 16], 0).unwrap();
        assert!(!bytes.windows(24).any(|window| window == [0xCC; 24]));
        let image = PeImage::parse(bytes).unwrap();
        assert_eq!(image.directory(dirs::CERTIFICATE), DataDirectory::default());
    }

    #[test]
    fn not_a_pe_file() {
        let mut bytes = PeImage::skeleton().bytes().to_vec();
        bytes[0x80] = b'N';
        assert!(matches!(
            PeImage::parse(bytes),
            Err(Error::BadMagic { expected, .. }) if expected == b"PE\0\0"
        ));
        assert!(matches!(
            PeImage::parse(b"BSJB".to_vec()),
            Err(Error::MalformedImage(_))
        ));
    }
}
