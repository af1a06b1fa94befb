pub mod baserel;
pub mod checksum;
pub mod dos;
pub mod optional_header;

use bitflags::bitflags;

use crate::coff::MachineType;

pub const PE_SIGNATURE: [u8; 4] = [b'P', b'E', 0, 0];

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct FileCharacteristics: u16 {
        /// Image only. This indicates that the file does not contain base relocations
        /// and must therefore be loaded at its preferred base address.
        const RELOCS_STRIPPED = 0x0001;
        /// Image only. This indicates that the image file is valid and can be run.
        const EXECUTABLE_IMAGE = 0x0002;
        /// COFF line numbers have been removed. This flag is deprecated and should be zero.
        const LINE_NUMBERS_STRIPPED = 0x0004;
        /// COFF symbol table entries for local symbols have been removed.
        /// This flag is deprecated and should be zero.
        const LOCAL_SYMS_STRIPPED = 0x0008;
        /// Application can handle > 2-GB addresses.
        const LARGE_ADDRESS_AWARE = 0x0020;
        /// Machine is based on a 32-bit-word architecture.
        const FOR_32BIT_MACHINE = 0x0100;
        /// Debugging information is removed from the image file.
        const DEBUG_STRIPPED = 0x0200;
        /// If the image is on removable media, fully load it and copy it to the swap file.
        const REMOVABLE_RUN_FROM_SWAP = 0x0400;
        /// If the image is on network media, fully load it and copy it to the swap file.
        const NET_RUN_FROM_SWAP = 0x0800;
        /// The image file is a system file, not a user program.
        const FILE_SYSTEM = 0x1000;
        /// The image file is a dynamic-link library (DLL).
        const FILE_DLL  = 0x2000;
        /// The file should be run only on a uniprocessor machine.
        const UP_SYSTEM_ONLY = 0x4000;
    }
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct DllCharacteristics: u16 {
        /// Image can handle a high entropy 64-bit virtual address space.
        const HIGH_ENTROPY_VA = 0x0020;
        /// DLL can be relocated at load time.
        const DYNAMIC_BASE = 0x0040;
        /// Code Integrity checks are enforced.
        const FORCE_INTEGRITY = 0x0080;
        /// Image is NX compatible.
        const NX_COMPAT = 0x0100;
        /// Isolation aware, but do not isolate the image.
        const NO_ISOLATION = 0x0200;
        /// Does not use structured exception handling.
        const NO_SEH = 0x0400;
        /// Do not bind the image.
        const NO_BIND = 0x0800;
        /// Image must execute in an AppContainer.
        const APPCONTAINER = 0x1000;
        /// A WDM driver.
        const WDM_DRIVER = 0x2000;
        /// Image supports Control Flow Guard.
        const GUARD_CF = 0x4000;
        /// Terminal Server aware.
        const TERMINAL_SERVER_AWARE = 0x8000;
    }
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub enum Subsystem {
    #[default]
    Unknown,
    Native,
    WindowsGui,
    WindowsCui,
    EfiApplication,
    EfiBootServiceDriver,
    EfiRuntimeDriver,
    EfiRom,
    Other(u16),
}

impl Subsystem {
    pub const ALL: [Subsystem; 7] = [
        Subsystem::Native,
        Subsystem::WindowsGui,
        Subsystem::WindowsCui,
        Subsystem::EfiApplication,
        Subsystem::EfiBootServiceDriver,
        Subsystem::EfiRuntimeDriver,
        Subsystem::EfiRom,
    ];

    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::Unknown,
            1 => Self::Native,
            2 => Self::WindowsGui,
            3 => Self::WindowsCui,
            10 => Self::EfiApplication,
            11 => Self::EfiBootServiceDriver,
            12 => Self::EfiRuntimeDriver,
            13 => Self::EfiRom,
            n => Self::Other(n),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Unknown => 0,
            Self::Native => 1,
            Self::WindowsGui => 2,
            Self::WindowsCui => 3,
            Self::EfiApplication => 10,
            Self::EfiBootServiceDriver => 11,
            Self::EfiRuntimeDriver => 12,
            Self::EfiRom => 13,
            Self::Other(n) => n,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Some(match name.to_ascii_uppercase().as_str() {
            "CONSOLE" => Self::WindowsCui,
            "WINDOWS" => Self::WindowsGui,
            "NATIVE" => Self::Native,
            "EFI_APPLICATION" => Self::EfiApplication,
            "EFI_BOOT_SERVICE_DRIVER" => Self::EfiBootServiceDriver,
            "EFI_RUNTIME_DRIVER" => Self::EfiRuntimeDriver,
            "EFI_ROM" => Self::EfiRom,
            _ => return None,
        })
    }
}

/// Entry point symbols the linker probes when `/ENTRY` is omitted, in probe
/// order. User-facing names remap to the CRT-wrapped form afterwards.
pub fn entry_point_names(
    machine: MachineType,
    subsystem: Subsystem,
    characteristics: FileCharacteristics,
) -> &'static [&'static str] {
    if characteristics.contains(FileCharacteristics::FILE_DLL) {
        return match machine {
            MachineType::I386 => &["__DllMainCRTStartup@12"],
            _ => &["_DllMainCRTStartup"],
        };
    }
    match subsystem {
        Subsystem::WindowsCui => &["mainCRTStartup", "wmainCRTStartup", "main", "wmain"],
        Subsystem::WindowsGui => &[
            "WinMainCRTStartup",
            "wWinMainCRTStartup",
            "WinMain",
            "wWinMain",
        ],
        Subsystem::Native => &["NtProcessStartup"],
        Subsystem::EfiApplication
        | Subsystem::EfiBootServiceDriver
        | Subsystem::EfiRuntimeDriver
        | Subsystem::EfiRom => &["EfiMain"],
        _ => &[],
    }
}

/// Remaps a user-facing entry point to the CRT startup wrapper that calls it.
pub fn remap_user_entry(name: &str) -> &str {
    match name {
        "main" => "mainCRTStartup",
        "wmain" => "wmainCRTStartup",
        "WinMain" => "WinMainCRTStartup",
        "wWinMain" => "wWinMainCRTStartup",
        other => other,
    }
}

pub fn has_plus_header(machine: MachineType) -> bool {
    machine.word_size() == 8
}

/// Section flags of well-known image sections.
pub mod section_flags {
    use crate::coff::SectionFlags;

    pub const TEXT: SectionFlags = SectionFlags::CNT_CODE
        .union(SectionFlags::MEM_EXECUTE)
        .union(SectionFlags::MEM_READ);
    pub const RDATA: SectionFlags = SectionFlags::CNT_INITIALIZED_DATA.union(SectionFlags::MEM_READ);
    pub const DATA: SectionFlags = SectionFlags::CNT_INITIALIZED_DATA
        .union(SectionFlags::MEM_READ)
        .union(SectionFlags::MEM_WRITE);
    pub const BSS: SectionFlags = SectionFlags::CNT_UNINITIALIZED_DATA
        .union(SectionFlags::MEM_READ)
        .union(SectionFlags::MEM_WRITE);
    pub const RELOC: SectionFlags = SectionFlags::CNT_INITIALIZED_DATA
        .union(SectionFlags::MEM_READ)
        .union(SectionFlags::MEM_DISCARDABLE);
    pub const IDATA: SectionFlags = SectionFlags::CNT_INITIALIZED_DATA
        .union(SectionFlags::MEM_READ)
        .union(SectionFlags::MEM_WRITE);
    pub const EDATA: SectionFlags =
        SectionFlags::CNT_INITIALIZED_DATA.union(SectionFlags::MEM_READ);
    pub const PDATA: SectionFlags =
        SectionFlags::CNT_INITIALIZED_DATA.union(SectionFlags::MEM_READ);
    pub const RSRC: SectionFlags = SectionFlags::CNT_INITIALIZED_DATA.union(SectionFlags::MEM_READ);
    pub const TLS: SectionFlags = SectionFlags::CNT_INITIALIZED_DATA
        .union(SectionFlags::MEM_READ)
        .union(SectionFlags::MEM_WRITE);
}

/// Names of the data directory slots, in on-disk order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataDirectoryName {
    ExportTable = 0,
    ImportTable = 1,
    ResourceTable = 2,
    ExceptionTable = 3,
    CertificateTable = 4,
    BaseRelocationTable = 5,
    Debug = 6,
    Architecture = 7,
    GlobalPtr = 8,
    TlsTable = 9,
    LoadConfigTable = 10,
    BoundImport = 11,
    Iat = 12,
    DelayImportDescriptor = 13,
    ClrRuntimeHeader = 14,
    Reserved = 15,
}

pub const DATA_DIRECTORY_COUNT: usize = 16;
