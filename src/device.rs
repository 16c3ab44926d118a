//! AVR8 device identification
//!
//! Maps the three signature bytes read from a part to its flash geometry.

use core::fmt;

/// Three signature bytes (SIG1, SIG2, SIG3) identifying an AVR part
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Signature(pub [u8; 3]);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

/// Flash geometry of a known part
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct CpuInfo {
    pub name: &'static str,
    pub signature: Signature,
    /// Flash size in bytes
    pub flash_size: u32,
    /// Page size in bytes (not words)
    pub page_size: u16,
    pub page_count: u32,
}

impl CpuInfo {
    const fn new(name: &'static str, signature: [u8; 3], page_size: u16, page_count: u32) -> Self {
        Self {
            name,
            signature: Signature(signature),
            flash_size: page_size as u32 * page_count,
            page_size,
            page_count,
        }
    }
}

/// Programmer (bootloader) identification
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ProgrammerInfo {
    /// Name reported on sign-on, Optiboot reports an empty string
    pub name: String,
    /// Software version (major, minor)
    pub sw_version: (u8, u8),
    pub hw_version: u8,
}

impl ProgrammerInfo {
    /// Software version formatted as `major.minor`
    pub fn sw_version_string(&self) -> String {
        format!("{}.{}", self.sw_version.0, self.sw_version.1)
    }
}

/// Parts found on Arduino and compatible boards
pub static CPUS: &[CpuInfo] = &[
    CpuInfo::new("ATmega2560", [0x1E, 0x98, 0x01], 256, 1024),
    CpuInfo::new("ATmega2561", [0x1E, 0x98, 0x02], 256, 1024),
    CpuInfo::new("ATmega1280", [0x1E, 0x97, 0x03], 256, 512),
    CpuInfo::new("ATmega1281", [0x1E, 0x97, 0x04], 256, 512),
    CpuInfo::new("ATmega1284P", [0x1E, 0x97, 0x05], 256, 512),
    CpuInfo::new("ATmega1284", [0x1E, 0x97, 0x06], 256, 512),
    CpuInfo::new("AT90USB1287", [0x1E, 0x97, 0x82], 256, 512),
    CpuInfo::new("ATmega128", [0x1E, 0x97, 0x02], 256, 512),
    CpuInfo::new("ATmega640", [0x1E, 0x96, 0x08], 256, 256),
    CpuInfo::new("ATmega64", [0x1E, 0x96, 0x02], 256, 256),
    CpuInfo::new("ATmega644P", [0x1E, 0x96, 0x0A], 256, 256),
    CpuInfo::new("ATmega328P", [0x1E, 0x95, 0x0F], 128, 256),
    CpuInfo::new("ATmega328", [0x1E, 0x95, 0x14], 128, 256),
    CpuInfo::new("ATmega32", [0x1E, 0x95, 0x02], 128, 256),
    CpuInfo::new("ATmega168", [0x1E, 0x94, 0x06], 128, 128),
    CpuInfo::new("ATmega168P", [0x1E, 0x94, 0x0B], 128, 128),
    CpuInfo::new("ATmega16", [0x1E, 0x94, 0x03], 128, 128),
    CpuInfo::new("ATmega162", [0x1E, 0x94, 0x04], 128, 128),
    CpuInfo::new("ATmega163", [0x1E, 0x94, 0x02], 128, 128),
    CpuInfo::new("ATmega169", [0x1E, 0x94, 0x05], 128, 128),
    CpuInfo::new("ATmega8", [0x1E, 0x93, 0x07], 64, 128),
    CpuInfo::new("ATmega88", [0x1E, 0x93, 0x0A], 64, 128),
    CpuInfo::new("ATmega88P", [0x1E, 0x93, 0x0F], 64, 128),
    CpuInfo::new("ATmega8515", [0x1E, 0x93, 0x06], 64, 128),
    CpuInfo::new("ATmega8535", [0x1E, 0x93, 0x08], 64, 128),
];

/// Look up a part by signature
pub fn lookup(signature: Signature) -> Option<CpuInfo> {
    CPUS.iter().find(|c| c.signature == signature).copied()
}
