//! The PE optional header (PE32 and PE32+) and its data directories.

use crate::error::{Result, SolderError};
use crate::io::{ReadData, WriteData};

use super::{DllCharacteristics, Subsystem, DATA_DIRECTORY_COUNT};

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub enum OptionalHeaderMagic {
    Pe32,
    #[default]
    Pe32Plus,
}

impl OptionalHeaderMagic {
    pub const PE32: u16 = 0x10B;
    pub const PE32_PLUS: u16 = 0x20B;

    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            Self::PE32 => Ok(Self::Pe32),
            Self::PE32_PLUS => Ok(Self::Pe32Plus),
            _ => Err(SolderError::invalid_image_format(
                "bad optional header magic",
            )),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Pe32 => Self::PE32,
            Self::Pe32Plus => Self::PE32_PLUS,
        }
    }
}

/// Each data directory gives the address and size of a table that Windows
/// uses at run time.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageDataDirectory {
    /// The RVA of the table relative to the image base.
    pub virtual_address: u32,
    /// Size in bytes.
    pub size: u32,
}

impl ImageDataDirectory {
    pub const SIZE: usize = 8;
}

impl ReadData for ImageDataDirectory {
    fn read(reader: &mut impl crate::io::Reader) -> Result<Self> {
        Ok(Self {
            virtual_address: reader.read()?,
            size: reader.read()?,
        })
    }
}

impl WriteData for ImageDataDirectory {
    fn write_to(self, writer: &mut impl crate::io::Writer) -> Result<()> {
        writer.write(self.virtual_address)?;
        writer.write(self.size)?;
        Ok(())
    }
}

/// The optional header as the linker builds it. The `magic` selects between
/// the PE32 and PE32+ on-disk encodings (32 vs. 64-bit base/stack/heap
/// fields, plus the PE32-only `base_of_data`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OptionalHeader {
    pub magic: OptionalHeaderMagic,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    /// PE32 only; ignored when writing PE32+.
    pub base_of_data: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: Subsystem,
    pub dll_characteristics: DllCharacteristics,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directories: [ImageDataDirectory; DATA_DIRECTORY_COUNT],
}

impl Default for OptionalHeader {
    fn default() -> Self {
        Self {
            magic: OptionalHeaderMagic::Pe32Plus,
            major_linker_version: 0,
            minor_linker_version: 0,
            size_of_code: 0,
            size_of_initialized_data: 0,
            size_of_uninitialized_data: 0,
            address_of_entry_point: 0,
            base_of_code: 0,
            base_of_data: 0,
            image_base: 0,
            section_alignment: 0,
            file_alignment: 0,
            major_operating_system_version: 0,
            minor_operating_system_version: 0,
            major_image_version: 0,
            minor_image_version: 0,
            major_subsystem_version: 0,
            minor_subsystem_version: 0,
            win32_version_value: 0,
            size_of_image: 0,
            size_of_headers: 0,
            check_sum: 0,
            subsystem: Subsystem::Unknown,
            dll_characteristics: DllCharacteristics::empty(),
            size_of_stack_reserve: 0,
            size_of_stack_commit: 0,
            size_of_heap_reserve: 0,
            size_of_heap_commit: 0,
            loader_flags: 0,
            number_of_rva_and_sizes: DATA_DIRECTORY_COUNT as u32,
            data_directories: [ImageDataDirectory::default(); DATA_DIRECTORY_COUNT],
        }
    }
}

impl OptionalHeader {
    /// Size without data directories.
    pub const SIZE_PE32: usize = 96;
    /// Size without data directories.
    pub const SIZE_PE32_PLUS: usize = 112;
    /// Byte offset of `check_sum` from the start of the header (same in both
    /// encodings).
    pub const CHECK_SUM_OFFSET: usize = 64;

    pub fn size(&self) -> usize {
        let base = match self.magic {
            OptionalHeaderMagic::Pe32 => Self::SIZE_PE32,
            OptionalHeaderMagic::Pe32Plus => Self::SIZE_PE32_PLUS,
        };
        base + self.number_of_rva_and_sizes as usize * ImageDataDirectory::SIZE
    }
}

impl ReadData for OptionalHeader {
    fn read(reader: &mut impl crate::io::Reader) -> Result<Self> {
        let magic = OptionalHeaderMagic::from_u16(reader.read()?)?;
        let is_plus = magic == OptionalHeaderMagic::Pe32Plus;

        let major_linker_version = reader.read()?;
        let minor_linker_version = reader.read()?;
        let size_of_code = reader.read()?;
        let size_of_initialized_data = reader.read()?;
        let size_of_uninitialized_data = reader.read()?;
        let address_of_entry_point = reader.read()?;
        let base_of_code = reader.read()?;
        let base_of_data = if is_plus { 0 } else { reader.read()? };
        let image_base = if is_plus {
            reader.read()?
        } else {
            reader.read::<u32>()? as u64
        };

        let section_alignment = reader.read()?;
        let file_alignment = reader.read()?;
        let major_operating_system_version = reader.read()?;
        let minor_operating_system_version = reader.read()?;
        let major_image_version = reader.read()?;
        let minor_image_version = reader.read()?;
        let major_subsystem_version = reader.read()?;
        let minor_subsystem_version = reader.read()?;
        let win32_version_value = reader.read()?;
        let size_of_image = reader.read()?;
        let size_of_headers = reader.read()?;
        let check_sum = reader.read()?;
        let subsystem = Subsystem::from_u16(reader.read()?);
        let dll_characteristics = DllCharacteristics::from_bits_retain(reader.read()?);

        let (stack_reserve, stack_commit, heap_reserve, heap_commit) = if is_plus {
            (
                reader.read()?,
                reader.read()?,
                reader.read()?,
                reader.read()?,
            )
        } else {
            (
                reader.read::<u32>()? as u64,
                reader.read::<u32>()? as u64,
                reader.read::<u32>()? as u64,
                reader.read::<u32>()? as u64,
            )
        };

        let loader_flags = reader.read()?;
        let number_of_rva_and_sizes: u32 = reader.read()?;

        let mut data_directories = [ImageDataDirectory::default(); DATA_DIRECTORY_COUNT];
        for slot in data_directories
            .iter_mut()
            .take(number_of_rva_and_sizes as usize)
        {
            *slot = reader.read()?;
        }

        Ok(Self {
            magic,
            major_linker_version,
            minor_linker_version,
            size_of_code,
            size_of_initialized_data,
            size_of_uninitialized_data,
            address_of_entry_point,
            base_of_code,
            base_of_data,
            image_base,
            section_alignment,
            file_alignment,
            major_operating_system_version,
            minor_operating_system_version,
            major_image_version,
            minor_image_version,
            major_subsystem_version,
            minor_subsystem_version,
            win32_version_value,
            size_of_image,
            size_of_headers,
            check_sum,
            subsystem,
            dll_characteristics,
            size_of_stack_reserve: stack_reserve,
            size_of_stack_commit: stack_commit,
            size_of_heap_reserve: heap_reserve,
            size_of_heap_commit: heap_commit,
            loader_flags,
            number_of_rva_and_sizes,
            data_directories,
        })
    }
}

impl WriteData for &OptionalHeader {
    fn write_to(self, writer: &mut impl crate::io::Writer) -> Result<()> {
        let is_plus = self.magic == OptionalHeaderMagic::Pe32Plus;

        writer.write(self.magic.to_u16())?;
        writer.write(self.major_linker_version)?;
        writer.write(self.minor_linker_version)?;
        writer.write(self.size_of_code)?;
        writer.write(self.size_of_initialized_data)?;
        writer.write(self.size_of_uninitialized_data)?;
        writer.write(self.address_of_entry_point)?;
        writer.write(self.base_of_code)?;
        if is_plus {
            writer.write(self.image_base)?;
        } else {
            writer.write(self.base_of_data)?;
            writer.write(self.image_base as u32)?;
        }
        writer.write(self.section_alignment)?;
        writer.write(self.file_alignment)?;
        writer.write(self.major_operating_system_version)?;
        writer.write(self.minor_operating_system_version)?;
        writer.write(self.major_image_version)?;
        writer.write(self.minor_image_version)?;
        writer.write(self.major_subsystem_version)?;
        writer.write(self.minor_subsystem_version)?;
        writer.write(self.win32_version_value)?;
        writer.write(self.size_of_image)?;
        writer.write(self.size_of_headers)?;
        writer.write(self.check_sum)?;
        writer.write(self.subsystem.to_u16())?;
        writer.write(self.dll_characteristics.bits())?;
        if is_plus {
            writer.write(self.size_of_stack_reserve)?;
            writer.write(self.size_of_stack_commit)?;
            writer.write(self.size_of_heap_reserve)?;
            writer.write(self.size_of_heap_commit)?;
        } else {
            writer.write(self.size_of_stack_reserve as u32)?;
            writer.write(self.size_of_stack_commit as u32)?;
            writer.write(self.size_of_heap_reserve as u32)?;
            writer.write(self.size_of_heap_commit as u32)?;
        }
        writer.write(self.loader_flags)?;
        writer.write(self.number_of_rva_and_sizes)?;

        for directory in self
            .data_directories
            .iter()
            .take(self.number_of_rva_and_sizes as usize)
        {
            writer.write(*directory)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_header_pe32_plus_is_112() {
        let header = OptionalHeader {
            number_of_rva_and_sizes: 0,
            ..Default::default()
        };
        let mut out = Vec::new();
        (&header).write_to(&mut out).unwrap();
        assert_eq!(out.len(), OptionalHeader::SIZE_PE32_PLUS);
    }

    #[test]
    fn optional_header_pe32_is_96() {
        let header = OptionalHeader {
            magic: OptionalHeaderMagic::Pe32,
            number_of_rva_and_sizes: 0,
            ..Default::default()
        };
        let mut out = Vec::new();
        (&header).write_to(&mut out).unwrap();
        assert_eq!(out.len(), OptionalHeader::SIZE_PE32);
    }

    #[test]
    fn check_sum_offset_is_stable() {
        let mut header = OptionalHeader {
            check_sum: 0xAABBCCDD,
            ..Default::default()
        };
        header.number_of_rva_and_sizes = 0;
        let mut out = Vec::new();
        (&header).write_to(&mut out).unwrap();
        let field = &out[OptionalHeader::CHECK_SUM_OFFSET..OptionalHeader::CHECK_SUM_OFFSET + 4];
        assert_eq!(field, 0xAABBCCDDu32.to_le_bytes());
    }

    #[test]
    fn round_trip_pe32_plus() {
        let mut expected = OptionalHeader {
            image_base: 0x1_4000_0000,
            section_alignment: 0x1000,
            file_alignment: 0x200,
            size_of_image: 0x5000,
            subsystem: Subsystem::WindowsCui,
            size_of_stack_reserve: 0x100000,
            ..Default::default()
        };
        expected.data_directories[5] = ImageDataDirectory {
            virtual_address: 0x3000,
            size: 12,
        };
        let mut out = Vec::new();
        (&expected).write_to(&mut out).unwrap();
        assert_eq!(out.len(), expected.size());
        let read_back = OptionalHeader::read(&mut out.as_slice()).unwrap();
        assert_eq!(read_back, expected);
    }
}
