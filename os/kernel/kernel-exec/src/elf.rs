//! # ELF64 Image View
//!
//! Allocation-free, bounds-checked view over an in-memory ELF64 executable.
//! Fields are decoded little-endian straight from the byte slice, so the image
//! needs no particular alignment.

use crate::addresses::VirtualAddress;
use bitfield_struct::bitfield;
use core::fmt;

/// Size of the ELF64 file header.
pub const FILE_HEADER_SIZE: usize = 64;

/// Size of one ELF64 program header entry.
pub const PROGRAM_HEADER_SIZE: usize = 56;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const EM_X86_64: u16 = 62;

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ElfError {
    #[error("image is shorter than the ELF64 file header")]
    TooShort,
    #[error("missing ELF magic")]
    BadMagic,
    #[error("not an ELF64 image")]
    BadClass,
    #[error("not a little-endian image")]
    BadEndianness,
    #[error("unsupported ELF version")]
    BadVersion,
    #[error("object type {0} is not a static executable")]
    NotExecutable(u16),
    #[error("machine {0} is not x86-64")]
    BadMachine(u16),
    #[error("invalid header size field")]
    BadHeaderSize,
    #[error("program header entry size {0} is not 56")]
    BadProgramHeaderSize(u16),
    #[error("program header table lies outside the image")]
    ProgramHeadersOutOfBounds,
}

/// `Elf64_Ehdr`, decoded.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::struct_field_names)]
pub struct FileHeader {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: VirtualAddress,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// `Elf64_Phdr`, decoded.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::struct_field_names)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: SegmentFlags,
    pub p_offset: u64,
    pub p_vaddr: VirtualAddress,
    /// Reserved; never consulted.
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl ProgramHeader {
    #[inline]
    #[must_use]
    pub const fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }
}

/// `Elf64_Phdr.p_flags`: bit0=X, bit1=W, bit2=R.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct SegmentFlags {
    /// `PF_X`
    pub execute: bool,
    /// `PF_W`
    pub write: bool,
    /// `PF_R`
    pub read: bool,
    #[bits(29)]
    __: u32,
}

#[inline]
fn le16(x: &[u8]) -> u16 {
    u16::from_le_bytes([x[0], x[1]])
}

#[inline]
fn le32(x: &[u8]) -> u32 {
    u32::from_le_bytes([x[0], x[1], x[2], x[3]])
}

#[inline]
fn le64(x: &[u8]) -> u64 {
    u64::from_le_bytes([x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7]])
}

/// Validated view over an ELF64 executable.
#[derive(Copy, Clone)]
pub struct ElfView<'a> {
    bytes: &'a [u8],
    header: FileHeader,
}

impl<'a> ElfView<'a> {
    /// Decode and validate the file header and the program header table bounds.
    ///
    /// # Errors
    /// Any [`ElfError`] describing the first inconsistency found.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ElfError> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(ElfError::TooShort);
        }

        let mut e_ident = [0u8; 16];
        e_ident.copy_from_slice(&bytes[0..16]);

        if e_ident[0..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if e_ident[4] != ELFCLASS64 {
            return Err(ElfError::BadClass);
        }
        if e_ident[5] != ELFDATA2LSB {
            return Err(ElfError::BadEndianness);
        }
        if e_ident[6] != EV_CURRENT {
            return Err(ElfError::BadVersion);
        }

        let header = FileHeader {
            e_ident,
            e_type: le16(&bytes[16..18]),
            e_machine: le16(&bytes[18..20]),
            e_version: le32(&bytes[20..24]),
            e_entry: VirtualAddress::new(le64(&bytes[24..32])),
            e_phoff: le64(&bytes[32..40]),
            e_shoff: le64(&bytes[40..48]),
            e_flags: le32(&bytes[48..52]),
            e_ehsize: le16(&bytes[52..54]),
            e_phentsize: le16(&bytes[54..56]),
            e_phnum: le16(&bytes[56..58]),
            e_shentsize: le16(&bytes[58..60]),
            e_shnum: le16(&bytes[60..62]),
            e_shstrndx: le16(&bytes[62..64]),
        };

        if header.e_version != u32::from(EV_CURRENT) {
            return Err(ElfError::BadVersion);
        }

        // ET_DYN would need relocation; only fixed-address executables load.
        if header.e_type != ET_EXEC {
            return Err(ElfError::NotExecutable(header.e_type));
        }

        if header.e_machine != EM_X86_64 {
            return Err(ElfError::BadMachine(header.e_machine));
        }

        let ehsize = usize::from(header.e_ehsize);
        if ehsize < FILE_HEADER_SIZE || ehsize > bytes.len() {
            return Err(ElfError::BadHeaderSize);
        }

        // An empty table is fine no matter what e_phentsize says.
        if header.e_phnum == 0 {
            return Ok(Self { bytes, header });
        }

        if usize::from(header.e_phentsize) != PROGRAM_HEADER_SIZE {
            return Err(ElfError::BadProgramHeaderSize(header.e_phentsize));
        }

        let phoff =
            usize::try_from(header.e_phoff).map_err(|_| ElfError::ProgramHeadersOutOfBounds)?;
        let table_len = usize::from(header.e_phnum)
            .checked_mul(PROGRAM_HEADER_SIZE)
            .ok_or(ElfError::ProgramHeadersOutOfBounds)?;
        let table_end = phoff
            .checked_add(table_len)
            .ok_or(ElfError::ProgramHeadersOutOfBounds)?;
        if table_end > bytes.len() {
            return Err(ElfError::ProgramHeadersOutOfBounds);
        }

        Ok(Self { bytes, header })
    }

    #[inline]
    #[must_use]
    pub const fn header(&self) -> &FileHeader {
        &self.header
    }

    /// The recorded entry point, verbatim.
    #[inline]
    #[must_use]
    pub const fn entry(&self) -> VirtualAddress {
        self.header.e_entry
    }

    /// Iterate all program headers in table order.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn program_headers(&self) -> ProgramHeaders<'a> {
        // Bounds were checked in `parse`, so the offset cannot truncate.
        ProgramHeaders {
            bytes: self.bytes,
            offset: self.header.e_phoff as usize,
            count: self.header.e_phnum as usize,
            index: 0,
        }
    }

    /// Iterate only `PT_LOAD` headers.
    pub fn loadable_segments(&self) -> impl Iterator<Item = ProgramHeader> + use<'a> {
        self.program_headers().filter(ProgramHeader::is_load)
    }

    /// File bytes backing `ph`: `[p_offset, p_offset + p_filesz)`.
    #[must_use]
    pub fn segment_bytes(&self, ph: &ProgramHeader) -> Option<&'a [u8]> {
        let start = usize::try_from(ph.p_offset).ok()?;
        let len = usize::try_from(ph.p_filesz).ok()?;
        let end = start.checked_add(len)?;
        self.bytes.get(start..end)
    }
}

impl fmt::Debug for ElfView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElfView")
            .field("len", &self.bytes.len())
            .field("header", &self.header)
            .finish()
    }
}

/// Program-header iterator without allocations.
#[derive(Clone)]
pub struct ProgramHeaders<'a> {
    bytes: &'a [u8],
    offset: usize,
    count: usize,
    index: usize,
}

impl ProgramHeaders<'_> {
    fn decode(&self, i: usize) -> Option<ProgramHeader> {
        let p = self.offset + i * PROGRAM_HEADER_SIZE;
        let s = self.bytes.get(p..p + PROGRAM_HEADER_SIZE)?;
        Some(ProgramHeader {
            p_type: le32(&s[0..4]),
            p_flags: SegmentFlags::from_bits(le32(&s[4..8])),
            p_offset: le64(&s[8..16]),
            p_vaddr: VirtualAddress::new(le64(&s[16..24])),
            p_paddr: le64(&s[24..32]),
            p_filesz: le64(&s[32..40]),
            p_memsz: le64(&s[40..48]),
            p_align: le64(&s[48..56]),
        })
    }
}

impl Iterator for ProgramHeaders<'_> {
    type Item = ProgramHeader;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }
        let ph = self.decode(self.index)?;
        self.index += 1;
        Some(ph)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let r = self.count.saturating_sub(self.index);
        (r, Some(r))
    }
}

impl ExactSizeIterator for ProgramHeaders<'_> {}

impl core::iter::FusedIterator for ProgramHeaders<'_> {}
