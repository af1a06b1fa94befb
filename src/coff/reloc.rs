//! COFF relocation records and the x64 relocation value computation.

use crate::error::Result;
use crate::io::{ReadData, Reader, WriteData, Writer};

/// x64 relocation kinds.
pub mod x64 {
    pub const ABSOLUTE: u16 = 0x0;
    pub const ADDR64: u16 = 0x1;
    pub const ADDR32: u16 = 0x2;
    pub const ADDR32NB: u16 = 0x3;
    pub const REL32: u16 = 0x4;
    pub const REL32_1: u16 = 0x5;
    pub const REL32_2: u16 = 0x6;
    pub const REL32_3: u16 = 0x7;
    pub const REL32_4: u16 = 0x8;
    pub const REL32_5: u16 = 0x9;
    pub const SECTION: u16 = 0xA;
    pub const SECREL: u16 = 0xB;
    pub const SECREL7: u16 = 0xC;
    pub const TOKEN: u16 = 0xD;
    pub const SREL32: u16 = 0xE;
    pub const PAIR: u16 = 0xF;
    pub const SSPAN32: u16 = 0x10;
    pub const LAST: u16 = SSPAN32;
}

/// A relocation record as stored after a section's raw data.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reloc {
    /// Offset of the relocation site from the beginning of the section.
    pub apply_off: u32,
    /// Symbol-table index of the target.
    pub symbol_index: u32,
    /// Machine-specific relocation kind.
    pub kind: u16,
}

impl Reloc {
    pub const SIZE: usize = 10;
}

impl ReadData for Reloc {
    fn read(reader: &mut impl Reader) -> Result<Self> {
        Ok(Self {
            apply_off: reader.read()?,
            symbol_index: reader.read()?,
            kind: reader.read()?,
        })
    }
}

impl WriteData for &Reloc {
    fn write_to(self, writer: &mut impl Writer) -> Result<()> {
        writer.write(self.apply_off)?;
        writer.write(self.symbol_index)?;
        writer.write(self.kind)?;
        Ok(())
    }
}

/// The value a relocation resolves to and the width of the site it patches.
/// A zero `size` means the relocation writes nothing (ABSOLUTE, PAIR, and
/// kinds the image does not encode).
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct RelocValue {
    pub value: u64,
    pub size: u8,
}

/// Computes the x64 relocation value for a site at `reloc_voff` targeting a
/// symbol at `(symbol_secnum, symbol_secoff)` with image VOFF `symbol_voff`.
pub fn reloc_value_x64(
    kind: u16,
    image_base: u64,
    reloc_voff: u64,
    symbol_secnum: u32,
    symbol_secoff: u32,
    symbol_voff: i64,
) -> RelocValue {
    match kind {
        x64::ADDR64 => RelocValue {
            value: (image_base as i64 + symbol_voff) as u64,
            size: 8,
        },
        x64::ADDR32 => RelocValue {
            value: (image_base as i64 + symbol_voff) as u64 & 0xFFFF_FFFF,
            size: 4,
        },
        x64::ADDR32NB => RelocValue {
            value: symbol_voff as u64 & 0xFFFF_FFFF,
            size: 4,
        },
        x64::REL32
        | x64::REL32_1
        | x64::REL32_2
        | x64::REL32_3
        | x64::REL32_4
        | x64::REL32_5 => {
            let distance = (kind - x64::REL32) as i64;
            let next_instruction = reloc_voff as i64 + 4 + distance;
            RelocValue {
                value: (symbol_voff - next_instruction) as u64 & 0xFFFF_FFFF,
                size: 4,
            }
        }
        x64::SECTION => RelocValue {
            value: symbol_secnum as u64 & 0xFFFF,
            size: 2,
        },
        x64::SECREL => RelocValue {
            value: symbol_secoff as u64,
            size: 4,
        },
        _ => RelocValue::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reloc_record_round_trip() {
        let expected = Reloc {
            apply_off: 0x10,
            symbol_index: 7,
            kind: x64::REL32,
        };
        let mut buffer = [0u8; Reloc::SIZE];
        (&expected).write_to(&mut buffer.as_mut_slice()).unwrap();
        assert_eq!(Reloc::read(&mut buffer.as_slice()).unwrap(), expected);
    }

    #[test]
    fn addr64_value() {
        let v = reloc_value_x64(x64::ADDR64, 0x1_4000_0000, 0x2000, 1, 0x10, 0x1010);
        assert_eq!(v.size, 8);
        assert_eq!(v.value, 0x1_4000_1010);
    }

    #[test]
    fn rel32_family_accounts_for_distance() {
        // site at 0x1000, target at 0x1100: REL32 is relative to the next
        // instruction, REL32_N to N bytes past it.
        let base = reloc_value_x64(x64::REL32, 0, 0x1000, 1, 0, 0x1100);
        assert_eq!(base.value as u32, 0x100 - 4);
        let plus3 = reloc_value_x64(x64::REL32_3, 0, 0x1000, 1, 0, 0x1100);
        assert_eq!(plus3.value as u32, 0x100 - 7);
    }

    #[test]
    fn rel32_negative_displacement() {
        let v = reloc_value_x64(x64::REL32, 0, 0x2000, 1, 0, 0x1000);
        assert_eq!(v.value as u32 as i32, -(0x1000 + 4i32));
    }

    #[test]
    fn secrel_and_section() {
        let v = reloc_value_x64(x64::SECREL, 0, 0, 3, 0x44, 0x2044);
        assert_eq!((v.value, v.size), (0x44, 4));
        let v = reloc_value_x64(x64::SECTION, 0, 0, 3, 0x44, 0x2044);
        assert_eq!((v.value, v.size), (3, 2));
    }

    #[test]
    fn absolute_writes_nothing() {
        assert_eq!(reloc_value_x64(x64::ABSOLUTE, 0, 0, 0, 0, 0).size, 0);
    }
}
