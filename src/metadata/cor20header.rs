//! The CLI header (ECMA-335 II.25.3.3), found through data directory 14 of the PE image.

use crate::{
    file::{parser::Parser, writer::Writer},
    Error::OutOfBounds,
    Result,
};

/// The CLI header of a managed image.
///
/// Every location is an RVA/size pair. Only `meta_data_*` and `flags` are rewritten when an
/// image is written back; the other directories keep pointing at the sections they were
/// read from.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cor20Header {
    pub cb: u32,
    pub major_runtime_version: u16,
    pub minor_runtime_version: u16,
    pub meta_data_rva: u32,
    pub meta_data_size: u32,
    pub flags: u32,
    pub entry_point_token: u32,
    pub resource_rva: u32,
    pub resource_size: u32,
    pub strong_name_signature_rva: u32,
    pub strong_name_signature_size: u32,
    pub code_manager_table_rva: u32,
    pub code_manager_table_size: u32,
    pub vtable_fixups_rva: u32,
    pub vtable_fixups_size: u32,
    pub export_address_table_jmp_rva: u32,
    pub export_address_table_jmp_size: u32,
    pub managed_native_header_rva: u32,
    pub managed_native_header_size: u32,
}

impl Cor20Header {
    /// Size of the header in bytes.
    pub const SIZE: usize = 72;

    /// A header for a new IL-only image, runtime version 2.5.
    #[must_use]
    pub fn new(flags: u32) -> Self {
        Cor20Header {
            cb: 72,
            major_runtime_version: 2,
            minor_runtime_version: 5,
            meta_data_rva: 0,
            meta_data_size: 0,
            flags,
            entry_point_token: 0,
            resource_rva: 0,
            resource_size: 0,
            strong_name_signature_rva: 0,
            strong_name_signature_size: 0,
            code_manager_table_rva: 0,
            code_manager_table_size: 0,
            vtable_fixups_rva: 0,
            vtable_fixups_size: 0,
            export_address_table_jmp_rva: 0,
            export_address_table_jmp_size: 0,
            managed_native_header_rva: 0,
            managed_native_header_size: 0,
        }
    }

    /// Read the header from the start of `data`.
    ///
    /// # Errors
    /// Returns an error if `data` is shorter than 72 bytes, `cb` is too small, or the
    /// metadata directory is empty.
    pub fn read(data: &[u8]) -> Result<Cor20Header> {
        if data.len() < Self::SIZE {
            return Err(OutOfBounds);
        }

        let mut parser = Parser::new(data);
        let header = Cor20Header {
            cb: parser.read_le()?,
            major_runtime_version: parser.read_le()?,
            minor_runtime_version: parser.read_le()?,
            meta_data_rva: parser.read_le()?,
            meta_data_size: parser.read_le()?,
            flags: parser.read_le()?,
            entry_point_token: parser.read_le()?,
            resource_rva: parser.read_le()?,
            resource_size: parser.read_le()?,
            strong_name_signature_rva: parser.read_le()?,
            strong_name_signature_size: parser.read_le()?,
            code_manager_table_rva: parser.read_le()?,
            code_manager_table_size: parser.read_le()?,
            vtable_fixups_rva: parser.read_le()?,
            vtable_fixups_size: parser.read_le()?,
            export_address_table_jmp_rva: parser.read_le()?,
            export_address_table_jmp_size: parser.read_le()?,
            managed_native_header_rva: parser.read_le()?,
            managed_native_header_size: parser.read_le()?,
        };

        if (header.cb as usize) < Self::SIZE {
            return Err(malformed_error!("Invalid CLR header size - {}", header.cb));
        }
        if header.meta_data_rva == 0 || header.meta_data_size == 0 {
            return Err(malformed_error!("CLR header has no metadata directory"));
        }

        Ok(header)
    }

    /// Write the 72 header bytes.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(72_u32);
        writer.write_le(self.major_runtime_version);
        writer.write_le(self.minor_runtime_version);
        for value in [
            self.meta_data_rva,
            self.meta_data_size,
            self.flags,
            self.entry_point_token,
            self.resource_rva,
            self.resource_size,
            self.strong_name_signature_rva,
            self.strong_name_signature_size,
            self.code_manager_table_rva,
            self.code_manager_table_size,
            self.vtable_fixups_rva,
            self.vtable_fixups_size,
            self.export_address_table_jmp_rva,
            self.export_address_table_jmp_size,
            self.managed_native_header_rva,
            self.managed_native_header_size,
        ] {
            writer.write_le(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crafted() {
        #[rustfmt::skip]
        let header_bytes = [
            0x48, 0x00, 0x00, 0x00, 0x02, 0x00, 0x05, 0x00,
            0x50, 0x20, 0x00, 0x00, 0x38, 0x04, 0x00, 0x00,
            0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x06,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];

        let header = Cor20Header::read(&header_bytes).unwrap();
        assert_eq!(header.meta_data_rva, 0x2050);
        assert_eq!(header.meta_data_size, 0x438);
        assert_eq!(header.flags, 1);
        assert_eq!(header.entry_point_token, 0x0600_0001);

        let mut writer = Writer::new();
        header.write(&mut writer);
        assert_eq!(writer.into_inner(), header_bytes);
    }

    #[test]
    fn invalid() {
        assert!(matches!(Cor20Header::read(&[0x48; 16]), Err(OutOfBounds)));

        let mut writer = Writer::new();
        Cor20Header::new(1).write(&mut writer);
        assert!(Cor20Header::read(&writer.into_inner()).is_err());
    }
}
