//! The PE container around the metadata of a module image.
//!
//! Reading keeps everything the image model does not interpret: the PE headers, every
//! section with its data, the CLI header, the raw table rows and the original heaps.
//! Writing lays the kept sections out again at their original RVAs and appends one new
//! section that holds the CLI header, every method body, the metadata root and the debug
//! directory. A section appended by an earlier write is dropped first, so writing a parsed
//! image again produces the same layout.

use goblin::pe::PE;

use crate::{
    file::io::{read_le_at, write_le_at},
    image::PdbId,
    metadata::{cor20header::Cor20Header, root::Root, tables::TablesStream},
    Error::{self, OutOfBounds},
    Result,
};

/// Name of the section a write appends.
pub(crate) const CLI_SECTION: [u8; 8] = *b".dotswap";

/// `IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ`
const CLI_SECTION_CHARACTERISTICS: u32 = 0x6000_0020;

const SECTION_HEADER_SIZE: usize = 40;
const DEBUG_ENTRY_SIZE: usize = 28;

const PE32_MAGIC: u16 = 0x10B;
const DIRECTORY_SECURITY: usize = 4;
const DIRECTORY_DEBUG: usize = 6;
const DIRECTORY_CLI: usize = 14;

/// Debug directory entry types.
pub(crate) const DEBUG_CODEVIEW: u32 = 2;
pub(crate) const DEBUG_EMBEDDED_PORTABLE_PDB: u32 = 17;
const DEBUG_PDB_CHECKSUM: u32 = 19;

/// One section with the bytes it occupies in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Section {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub characteristics: u32,
    pub data: Vec<u8>,
}

impl Section {
    fn end_rva(&self) -> u32 {
        let size = u32::try_from(self.data.len()).unwrap_or(u32::MAX);
        self.virtual_address
            .saturating_add(self.virtual_size.max(size))
    }
}

/// An entry of the debug directory, with its data copied out of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DebugEntry {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub kind: u32,
    pub data: Vec<u8>,
}

impl DebugEntry {
    /// The guid of a CodeView `RSDS` record.
    fn codeview_guid(&self) -> Option<uguid::Guid> {
        if self.kind != DEBUG_CODEVIEW || self.data.get(..4) != Some(b"RSDS".as_slice()) {
            return None;
        }

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(self.data.get(4..20)?);
        Some(uguid::Guid::from_bytes(bytes))
    }
}

/// The headers and sections of a PE image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PeHeaders {
    /// File bytes up to the section table
    headers: Vec<u8>,
    pe_offset: usize,
    pe32_plus: bool,
    file_alignment: u32,
    section_alignment: u32,
    sections: Vec<Section>,
}

/// Where the appended section lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Plan {
    /// RVA of the appended section
    pub rva: u32,
    /// File offset of the appended section
    pub file_offset: u32,
    size_of_headers: u32,
}

/// Locations inside the appended section, relative to its start.
#[derive(Debug, Clone, Default)]
pub(crate) struct CliSection {
    pub data: Vec<u8>,
    pub cli_header: u32,
    pub debug_directory: Option<(u32, u32)>,
}

impl PeHeaders {
    fn from_pe(data: &[u8], pe: &PE) -> Result<PeHeaders> {
        let Some(optional_header) = pe.header.optional_header else {
            return Err(malformed_error!("File does not have an OptionalHeader"));
        };

        let pe_offset = pe.header.dos_header.pe_pointer as usize;
        let section_table =
            pe_offset + 24 + usize::from(pe.header.coff_header.size_of_optional_header);
        let Some(headers) = data.get(..section_table) else {
            return Err(OutOfBounds);
        };

        let mut sections = Vec::with_capacity(pe.sections.len());
        for section in &pe.sections {
            let start = section.pointer_to_raw_data as usize;
            let end = start
                .saturating_add(section.size_of_raw_data as usize)
                .min(data.len());
            let bytes = if section.pointer_to_raw_data == 0 || start >= end {
                Vec::new()
            } else {
                data[start..end].to_vec()
            };

            sections.push(Section {
                name: section.name,
                virtual_size: section.virtual_size,
                virtual_address: section.virtual_address,
                characteristics: section.characteristics,
                data: bytes,
            });
        }

        Ok(PeHeaders {
            headers: headers.to_vec(),
            pe_offset,
            pe32_plus: optional_header.standard_fields.magic != PE32_MAGIC,
            file_alignment: optional_header.windows_fields.file_alignment.max(0x200),
            section_alignment: optional_header.windows_fields.section_alignment.max(0x1000),
            sections,
        })
    }

    /// Headers of a fresh IL-only PE32 library without sections.
    pub(crate) fn synthesize() -> PeHeaders {
        let mut headers = vec![0u8; 0x80];
        headers[0] = b'M';
        headers[1] = b'Z';
        headers[0x3C] = 0x80;

        headers.extend_from_slice(b"PE\0\0");
        // COFF header: i386, no sections yet, DLL | EXECUTABLE_IMAGE | 32BIT_MACHINE
        for value in [0x014C_u16, 0] {
            headers.extend_from_slice(&value.to_le_bytes());
        }
        headers.extend_from_slice(&[0; 12]);
        for value in [0x00E0_u16, 0x2102] {
            headers.extend_from_slice(&value.to_le_bytes());
        }

        // Optional header, standard fields
        headers.extend_from_slice(&PE32_MAGIC.to_le_bytes());
        headers.extend_from_slice(&[8, 0]);
        headers.extend_from_slice(&[0; 24]);
        // Windows fields
        for value in [0x1000_0000_u32, 0x2000, 0x200] {
            headers.extend_from_slice(&value.to_le_bytes());
        }
        for value in [4_u16, 0, 0, 0, 4, 0] {
            headers.extend_from_slice(&value.to_le_bytes());
        }
        // Win32VersionValue, SizeOfImage, SizeOfHeaders, CheckSum
        headers.extend_from_slice(&[0; 16]);
        // Windows CUI, DYNAMIC_BASE | NX_COMPAT | NO_SEH | TERMINAL_SERVER_AWARE
        for value in [3_u16, 0x8540] {
            headers.extend_from_slice(&value.to_le_bytes());
        }
        for value in [0x0010_0000_u32, 0x1000, 0x0010_0000, 0x1000, 0, 16] {
            headers.extend_from_slice(&value.to_le_bytes());
        }
        headers.extend_from_slice(&[0; 16 * 8]);

        PeHeaders {
            headers,
            pe_offset: 0x80,
            pe32_plus: false,
            file_alignment: 0x200,
            section_alignment: 0x2000,
            sections: Vec::new(),
        }
    }

    /// The bytes from `rva` to the end of the section holding it.
    pub(crate) fn slice_from(&self, rva: u32) -> Result<&[u8]> {
        for section in &self.sections {
            if rva >= section.virtual_address && rva < section.end_rva() {
                let offset = (rva - section.virtual_address) as usize;
                return section.data.get(offset..).ok_or(OutOfBounds);
            }
        }

        Err(malformed_error!("RVA could not be converted to offset - {:#x}", rva))
    }

    /// `size` bytes at `rva`.
    pub(crate) fn slice(&self, rva: u32, size: u32) -> Result<&[u8]> {
        self.slice_from(rva)?
            .get(..size as usize)
            .ok_or(OutOfBounds)
    }

    fn kept_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.name != CLI_SECTION)
    }

    fn section_table_offset(&self) -> usize {
        self.headers.len()
    }

    fn optional_header_offset(&self) -> usize {
        self.pe_offset + 24
    }

    fn data_directory_offset(&self, index: usize) -> usize {
        let base = if self.pe32_plus { 112 } else { 96 };
        self.optional_header_offset() + base + index * 8
    }

    /// Decide where the appended section goes.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if the grown section table would overlap the first
    /// section.
    pub(crate) fn plan(&self) -> Result<Plan> {
        let count = self.kept_sections().count() + 1;
        let table_end = self.section_table_offset() + count * SECTION_HEADER_SIZE;
        let size_of_headers = align(to_u32(table_end)?, self.file_alignment);

        if let Some(first) = self.kept_sections().map(|s| s.virtual_address).min() {
            if size_of_headers > first {
                log::warn!("No room for another section header before RVA {:#x}", first);
                return Err(Error::NotSupported);
            }
        }

        let mut file_offset = size_of_headers;
        let mut end_rva = size_of_headers;
        for section in self.kept_sections() {
            file_offset += align(to_u32(section.data.len())?, self.file_alignment);
            end_rva = end_rva.max(section.end_rva());
        }

        Ok(Plan {
            rva: align(end_rva, self.section_alignment),
            file_offset,
            size_of_headers,
        })
    }

    /// Write the image: kept sections plus `cli` as the last section.
    ///
    /// # Errors
    /// Returns an error if the layout does not fit into 32-bit file offsets.
    pub(crate) fn write(&self, plan: &Plan, cli: &CliSection) -> Result<Vec<u8>> {
        let kept: Vec<&Section> = self.kept_sections().collect();
        let cli_size = to_u32(cli.data.len())?;
        let total = plan.file_offset as usize + align(cli_size, self.file_alignment) as usize;

        let mut out = self.headers.clone();
        out.reserve(total.saturating_sub(out.len()));
        write_le_at(&mut out, self.pe_offset + 6, u16::try_from(kept.len() + 1).map_err(
            |_| malformed_error!("Too many sections - {}", kept.len() + 1),
        )?)?;

        let mut file_offset = plan.size_of_headers;
        for section in &kept {
            let raw_size = align(to_u32(section.data.len())?, self.file_alignment);
            let pointer = if raw_size == 0 { 0 } else { file_offset };
            push_section_header(
                &mut out,
                &section.name,
                section.virtual_size,
                section.virtual_address,
                raw_size,
                pointer,
                section.characteristics,
            );
            file_offset += raw_size;
        }
        push_section_header(
            &mut out,
            &CLI_SECTION,
            cli_size,
            plan.rva,
            align(cli_size, self.file_alignment),
            plan.file_offset,
            CLI_SECTION_CHARACTERISTICS,
        );

        out.resize(plan.size_of_headers as usize, 0);
        for section in &kept {
            out.extend_from_slice(&section.data);
            let aligned = align(to_u32(out.len())?, self.file_alignment);
            out.resize(aligned as usize, 0);
        }
        out.extend_from_slice(&cli.data);
        out.resize(total, 0);

        let optional = self.optional_header_offset();
        let size_of_image = align(plan.rva + cli_size, self.section_alignment);
        write_le_at(&mut out, optional + 56, size_of_image)?;
        write_le_at(&mut out, optional + 60, plan.size_of_headers)?;
        write_le_at(&mut out, optional + 64, 0_u32)?;

        self.write_directory(&mut out, DIRECTORY_SECURITY, 0, 0)?;
        self.write_directory(&mut out, DIRECTORY_CLI, plan.rva + cli.cli_header, 72)?;
        match cli.debug_directory {
            Some((offset, size)) => {
                self.write_directory(&mut out, DIRECTORY_DEBUG, plan.rva + offset, size)?;
            }
            None => self.write_directory(&mut out, DIRECTORY_DEBUG, 0, 0)?,
        }

        Ok(out)
    }

    fn write_directory(&self, out: &mut [u8], index: usize, rva: u32, size: u32) -> Result<()> {
        let offset = self.data_directory_offset(index);
        write_le_at(out, offset, rva)?;
        write_le_at(out, offset + 4, size)
    }
}

fn push_section_header(
    out: &mut Vec<u8>,
    name: &[u8; 8],
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
    characteristics: u32,
) {
    out.extend_from_slice(name);
    for value in [
        virtual_size,
        virtual_address,
        size_of_raw_data,
        pointer_to_raw_data,
        0,
        0,
    ] {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&characteristics.to_le_bytes());
}

/// Everything of a parsed image that the image model does not hold itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Container {
    pub pe: PeHeaders,
    pub cor20: Cor20Header,
    /// Version string of the metadata root
    pub version: String,
    /// `#~`, or `#-` for uncompressed streams
    pub tables_name: String,
    pub tables: TablesStream,
    pub strings: Vec<u8>,
    pub blob: Vec<u8>,
    pub guid: Vec<u8>,
    /// Debug directory entries other than embedded symbols and their checksum
    pub debug_entries: Vec<DebugEntry>,
}

/// A container together with the parts the image reader consumes.
pub(crate) struct ParsedContainer {
    pub container: Container,
    pub user_strings: Vec<u8>,
    pub embedded_symbols: Option<Vec<u8>>,
}

impl Container {
    /// Parse the PE container and metadata of a module image.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if `data` is not a managed PE image, and a parse error
    /// if its CLI header or metadata is damaged.
    pub(crate) fn read(data: &[u8]) -> Result<ParsedContainer> {
        if data.is_empty() {
            return Err(Error::Empty);
        }
        if !data.starts_with(b"MZ") {
            return Err(Error::NotSupported);
        }

        let pe = PE::parse(data)?;
        let Some(optional_header) = pe.header.optional_header else {
            return Err(malformed_error!("File does not have an OptionalHeader"));
        };
        let Some(clr) = optional_header.data_directories.get_clr_runtime_header() else {
            return Err(Error::NotSupported);
        };
        let (clr_rva, clr_size) = (clr.virtual_address, clr.size);
        let debug = optional_header
            .data_directories
            .get_debug_table()
            .as_ref()
            .map(|dir| (dir.virtual_address, dir.size));

        let headers = PeHeaders::from_pe(data, &pe)?;
        let cor20 = Cor20Header::read(headers.slice(clr_rva, clr_size.max(72))?)?;
        let metadata = headers.slice(cor20.meta_data_rva, cor20.meta_data_size)?;
        let root = Root::read(metadata)?;

        let (tables_name, tables) = match root.stream(metadata, "#~") {
            Some(stream) => ("#~", stream),
            None => match root.stream(metadata, "#-") {
                Some(stream) => ("#-", stream),
                None => return Err(malformed_error!("Metadata has no table stream")),
            },
        };
        let tables = TablesStream::read(tables, None)?;

        let heap = |name: &str| root.stream(metadata, name).unwrap_or_default().to_vec();
        let strings = heap("#Strings");
        let blob = heap("#Blob");
        let guid = heap("#GUID");
        let user_strings = heap("#US");

        let mut debug_entries = Vec::new();
        let mut embedded_symbols = None;
        if let Some((rva, size)) = debug.filter(|(rva, size)| *rva != 0 && *size != 0) {
            for entry in read_debug_directory(data, &headers, rva, size)? {
                match entry.kind {
                    DEBUG_EMBEDDED_PORTABLE_PDB => embedded_symbols = Some(entry.data),
                    DEBUG_PDB_CHECKSUM => {}
                    _ => debug_entries.push(entry),
                }
            }
        }

        Ok(ParsedContainer {
            container: Container {
                pe: headers,
                cor20,
                version: root.version,
                tables_name: tables_name.to_string(),
                tables,
                strings,
                blob,
                guid,
                debug_entries,
            },
            user_strings,
            embedded_symbols,
        })
    }

    /// The pdb id recorded in the CodeView entry.
    pub(crate) fn pdb_id(&self) -> Option<PdbId> {
        self.debug_entries.iter().find_map(|entry| {
            entry.codeview_guid().map(|guid| PdbId {
                guid,
                stamp: entry.time_date_stamp,
            })
        })
    }

    /// Drop section data the image model has taken over.
    pub(crate) fn release_cli_section(&mut self) {
        self.pe.sections.retain(|s| s.name != CLI_SECTION);
    }
}

fn read_debug_directory(
    data: &[u8],
    headers: &PeHeaders,
    rva: u32,
    size: u32,
) -> Result<Vec<DebugEntry>> {
    let directory = headers.slice(rva, size)?;
    let mut entries = Vec::with_capacity(directory.len() / DEBUG_ENTRY_SIZE);

    for chunk in directory.chunks_exact(DEBUG_ENTRY_SIZE) {
        let mut offset = 0;
        let characteristics = read_le_at::<u32>(chunk, &mut offset)?;
        let time_date_stamp = read_le_at::<u32>(chunk, &mut offset)?;
        let major_version = read_le_at::<u16>(chunk, &mut offset)?;
        let minor_version = read_le_at::<u16>(chunk, &mut offset)?;
        let kind = read_le_at::<u32>(chunk, &mut offset)?;
        let size = read_le_at::<u32>(chunk, &mut offset)?;
        let address = read_le_at::<u32>(chunk, &mut offset)?;
        let pointer = read_le_at::<u32>(chunk, &mut offset)?;

        let entry_data = if size == 0 {
            Vec::new()
        } else if address != 0 {
            headers.slice(address, size)?.to_vec()
        } else {
            let start = pointer as usize;
            data.get(start..start + size as usize)
                .ok_or(OutOfBounds)?
                .to_vec()
        };

        entries.push(DebugEntry {
            characteristics,
            time_date_stamp,
            major_version,
            minor_version,
            kind,
            data: entry_data,
        });
    }

    Ok(entries)
}

/// Append a debug directory for `entries` to `section` and return its offset and size.
pub(crate) fn append_debug_directory(
    section: &mut Vec<u8>,
    entries: &[DebugEntry],
    plan: &Plan,
) -> Result<(u32, u32)> {
    pad4(section);
    let directory = section.len();
    let size = entries.len() * DEBUG_ENTRY_SIZE;
    section.resize(directory + size, 0);

    for (index, entry) in entries.iter().enumerate() {
        let (address, pointer) = if entry.data.is_empty() {
            (0, 0)
        } else {
            pad4(section);
            let offset = to_u32(section.len())?;
            section.extend_from_slice(&entry.data);
            (plan.rva + offset, plan.file_offset + offset)
        };

        let mut at = directory + index * DEBUG_ENTRY_SIZE;
        for value in [entry.characteristics, entry.time_date_stamp] {
            write_le_at(section, at, value)?;
            at += 4;
        }
        write_le_at(section, at, entry.major_version)?;
        write_le_at(section, at + 2, entry.minor_version)?;
        at += 4;
        for value in [entry.kind, to_u32(entry.data.len())?, address, pointer] {
            write_le_at(section, at, value)?;
            at += 4;
        }
    }

    Ok((to_u32(directory)?, to_u32(size)?))
}

pub(crate) fn pad4(data: &mut Vec<u8>) {
    let aligned = (data.len() + 3) & !3;
    data.resize(aligned, 0);
}

fn align(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

pub(crate) fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| malformed_error!("Image of {} bytes is too large", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_headers_parse() {
        let headers = PeHeaders::synthesize();
        let plan = headers.plan().unwrap();
        assert_eq!(plan.rva, 0x2000);
        assert_eq!(plan.file_offset, 0x200);

        let cli = CliSection {
            data: vec![0xCC; 0x30],
            cli_header: 0,
            debug_directory: None,
        };
        let bytes = headers.write(&plan, &cli).unwrap();
        assert_eq!(bytes.len(), 0x400);

        let pe = PE::parse(&bytes).unwrap();
        assert_eq!(pe.sections.len(), 1);
        assert_eq!(pe.sections[0].name, CLI_SECTION);
        assert_eq!(pe.sections[0].virtual_address, 0x2000);
        assert_eq!(pe.sections[0].pointer_to_raw_data, 0x200);

        let reread = PeHeaders::from_pe(&bytes, &pe).unwrap();
        assert_eq!(reread.slice(0x2010, 4).unwrap(), &[0xCC; 4]);
        assert!(reread.slice_from(0x5000).is_err());
    }

    #[test]
    fn rewrite_replaces_own_section() {
        let headers = PeHeaders::synthesize();
        let plan = headers.plan().unwrap();
        let cli = CliSection {
            data: vec![1; 8],
            ..CliSection::default()
        };
        let first = headers.write(&plan, &cli).unwrap();

        let pe = PE::parse(&first).unwrap();
        let reread = PeHeaders::from_pe(&first, &pe).unwrap();
        assert_eq!(reread.plan().unwrap(), plan);
        assert_eq!(reread.write(&plan, &cli).unwrap(), first);
    }

    #[test]
    fn debug_directory_layout() {
        let plan = Plan {
            rva: 0x4000,
            file_offset: 0x600,
            size_of_headers: 0x200,
        };
        let entries = vec![
            DebugEntry {
                characteristics: 0,
                time_date_stamp: 0x1234_5678,
                major_version: 0,
                minor_version: 0,
                kind: DEBUG_CODEVIEW,
                data: b"RSDS\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0a\x0b\x0c\x0d\x0e\x0f\x10\x01\0\0\0a.pdb\0"
                    .to_vec(),
            },
            DebugEntry {
                characteristics: 0,
                time_date_stamp: 0,
                major_version: 0,
                minor_version: 0,
                kind: 16,
                data: Vec::new(),
            },
        ];

        let mut section = vec![0u8; 6];
        let (offset, size) = append_debug_directory(&mut section, &entries, &plan).unwrap();
        assert_eq!((offset, size), (8, 56));

        let mut at = 8 + 20;
        assert_eq!(read_le_at::<u32>(&section, &mut at).unwrap(), 0x4000 + 64);
        assert_eq!(read_le_at::<u32>(&section, &mut at).unwrap(), 0x600 + 64);
        // Empty entries point nowhere
        let mut at = 8 + 28 + 20;
        assert_eq!(read_le_at::<u32>(&section, &mut at).unwrap(), 0);
        assert_eq!(&section[64..68], b"RSDS");

        assert_eq!(
            entries[0].codeview_guid(),
            Some(uguid::guid!("04030201-0605-0807-090a-0b0c0d0e0f10"))
        );
        assert_eq!(entries[1].codeview_guid(), None);
    }
}
