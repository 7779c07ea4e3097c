#![allow(dead_code, clippy::cast_possible_truncation)]

use kernel_exec::{
    AddressSpaceHandle, InterruptControl, MapError, PAGE_SIZE, PageAccess, USER_SPACE_END,
    UserEntry, UserModeTrampoline, UserPage, VirtualAddress, VirtualMemory,
};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const PT_LOAD: u32 = 1;
pub const PT_NOTE: u32 = 4;

/// Content of a freshly mapped frame; real frames are not zeroed either.
pub const FRESH_FILL: u8 = 0xCC;

pub const SPACE: AddressSpaceHandle = AddressSpaceHandle::from_root_register(0x0010_0000);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Op {
    Map(u64, PageAccess),
    Protect(u64, PageAccess),
    UnmapUser,
    Write(u64, usize),
    Zero(u64, u64),
}

pub struct FakePage {
    pub access: PageAccess,
    pub data: Box<[u8; PAGE_SIZE as usize]>,
}

/// Page-table stand-in: page base → permissions and contents.
pub struct FakeMemory {
    pub pages: BTreeMap<u64, FakePage>,
    pub ops: Vec<Op>,
    /// Refuse to map this page base with `OutOfMemory`.
    pub fail_map_at: Option<u64>,
    pub fail_unmap: bool,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
            ops: Vec::new(),
            fail_map_at: None,
            fail_unmap: false,
        }
    }

    /// Install a page as if a previous process had mapped it.
    pub fn with_page(mut self, base: u64, fill: u8, access: PageAccess) -> Self {
        self.pages.insert(
            base,
            FakePage {
                access,
                data: Box::new([fill; PAGE_SIZE as usize]),
            },
        );
        self
    }

    pub fn failing_map_at(mut self, base: u64) -> Self {
        self.fail_map_at = Some(base);
        self
    }

    pub fn failing_unmap(mut self) -> Self {
        self.fail_unmap = true;
        self
    }

    pub fn mapped(&self) -> Vec<u64> {
        self.pages.keys().copied().collect()
    }

    pub fn access(&self, va: u64) -> Option<PageAccess> {
        self.pages.get(&(va & !(PAGE_SIZE - 1))).map(|p| p.access)
    }

    pub fn read(&self, va: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| {
                let a = va + i;
                let page = &self.pages[&(a & !(PAGE_SIZE - 1))];
                page.data[(a % PAGE_SIZE) as usize]
            })
            .collect()
    }

    pub fn maps(&self) -> usize {
        self.ops.iter().filter(|o| matches!(o, Op::Map(..))).count()
    }

    fn byte_mut(&mut self, a: u64) -> Result<&mut u8, MapError> {
        let base = a & !(PAGE_SIZE - 1);
        self.pages
            .get_mut(&base)
            .map(|p| &mut p.data[(a % PAGE_SIZE) as usize])
            .ok_or(MapError::NotMapped(UserPage::containing(VirtualAddress::new(a))))
    }
}

impl VirtualMemory for FakeMemory {
    fn current_address_space(&self) -> AddressSpaceHandle {
        SPACE
    }

    fn map(
        &mut self,
        space: AddressSpaceHandle,
        page: UserPage,
        access: PageAccess,
    ) -> Result<(), MapError> {
        assert_eq!(space, SPACE);
        let base = page.base().as_u64();
        if self.fail_map_at == Some(base) {
            return Err(MapError::OutOfMemory(page));
        }
        if self.pages.contains_key(&base) {
            return Err(MapError::AlreadyMapped(page));
        }
        self.ops.push(Op::Map(base, access));
        self.pages.insert(
            base,
            FakePage {
                access,
                data: Box::new([FRESH_FILL; PAGE_SIZE as usize]),
            },
        );
        Ok(())
    }

    fn protect(
        &mut self,
        space: AddressSpaceHandle,
        page: UserPage,
        access: PageAccess,
    ) -> Result<(), MapError> {
        assert_eq!(space, SPACE);
        let base = page.base().as_u64();
        let entry = self.pages.get_mut(&base).ok_or(MapError::NotMapped(page))?;
        entry.access = access;
        self.ops.push(Op::Protect(base, access));
        Ok(())
    }

    fn unmap_user_region(&mut self, space: AddressSpaceHandle) -> Result<(), MapError> {
        assert_eq!(space, SPACE);
        if self.fail_unmap {
            return Err(MapError::UnmapFailed);
        }
        self.ops.push(Op::UnmapUser);
        self.pages.retain(|&base, _| base >= USER_SPACE_END.as_u64());
        Ok(())
    }

    fn write_bytes(
        &mut self,
        space: AddressSpaceHandle,
        dst: VirtualAddress,
        src: &[u8],
    ) -> Result<(), MapError> {
        assert_eq!(space, SPACE);
        self.ops.push(Op::Write(dst.as_u64(), src.len()));
        for (i, &b) in src.iter().enumerate() {
            *self.byte_mut(dst.as_u64() + i as u64)? = b;
        }
        Ok(())
    }

    fn zero_bytes(
        &mut self,
        space: AddressSpaceHandle,
        dst: VirtualAddress,
        len: u64,
    ) -> Result<(), MapError> {
        assert_eq!(space, SPACE);
        self.ops.push(Op::Zero(dst.as_u64(), len));
        for i in 0..len {
            *self.byte_mut(dst.as_u64() + i)? = 0;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeInterrupts {
    pub enabled: bool,
    pub suspends: usize,
    pub resumes: usize,
}

impl FakeInterrupts {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            suspends: 0,
            resumes: 0,
        }
    }
}

impl InterruptControl for FakeInterrupts {
    fn suspend(&mut self) -> bool {
        self.suspends += 1;
        let was = self.enabled;
        self.enabled = false;
        was
    }

    fn resume(&mut self, were_enabled: bool) {
        self.resumes += 1;
        if were_enabled {
            self.enabled = true;
        }
    }
}

/// Stands in for `iretq`: unwinds with the entry values as payload.
pub struct CapturingTrampoline;

impl UserModeTrampoline for CapturingTrampoline {
    unsafe fn enter(&self, entry: UserEntry) -> ! {
        panic::panic_any(entry)
    }
}

/// Run `f` and return the [`UserEntry`] it handed to [`CapturingTrampoline`].
pub fn capture_entry(f: impl FnOnce()) -> UserEntry {
    let payload = panic::catch_unwind(AssertUnwindSafe(f))
        .expect_err("the trampoline must not return");
    *payload
        .downcast::<UserEntry>()
        .expect("unwound with something other than a UserEntry")
}

struct Segment {
    p_type: u32,
    flags: u32,
    vaddr: u64,
    data: Vec<u8>,
    memsz: u64,
}

/// Minimal ELF64 executable writer.
pub struct ElfBuilder {
    entry: u64,
    e_type: u16,
    segments: Vec<Segment>,
}

impl ElfBuilder {
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            e_type: 2,
            segments: Vec::new(),
        }
    }

    pub fn e_type(mut self, e_type: u16) -> Self {
        self.e_type = e_type;
        self
    }

    pub fn load(self, flags: u32, vaddr: u64, data: &[u8], memsz: u64) -> Self {
        self.segment(PT_LOAD, flags, vaddr, data, memsz)
    }

    pub fn segment(mut self, p_type: u32, flags: u32, vaddr: u64, data: &[u8], memsz: u64) -> Self {
        self.segments.push(Segment {
            p_type,
            flags,
            vaddr,
            data: data.to_vec(),
            memsz,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let phnum = self.segments.len();
        let mut out = vec![0u8; 64 + 56 * phnum];

        out[0..4].copy_from_slice(b"\x7fELF");
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // little endian
        out[6] = 1;
        out[16..18].copy_from_slice(&self.e_type.to_le_bytes());
        out[18..20].copy_from_slice(&62u16.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[24..32].copy_from_slice(&self.entry.to_le_bytes());
        out[32..40].copy_from_slice(&64u64.to_le_bytes());
        out[52..54].copy_from_slice(&64u16.to_le_bytes());
        out[54..56].copy_from_slice(&56u16.to_le_bytes());
        out[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

        for (i, seg) in self.segments.iter().enumerate() {
            let offset = out.len() as u64;
            out.extend_from_slice(&seg.data);

            let p = 64 + 56 * i;
            out[p..p + 4].copy_from_slice(&seg.p_type.to_le_bytes());
            out[p + 4..p + 8].copy_from_slice(&seg.flags.to_le_bytes());
            out[p + 8..p + 16].copy_from_slice(&offset.to_le_bytes());
            out[p + 16..p + 24].copy_from_slice(&seg.vaddr.to_le_bytes());
            out[p + 24..p + 32].copy_from_slice(&seg.vaddr.to_le_bytes());
            out[p + 32..p + 40].copy_from_slice(&(seg.data.len() as u64).to_le_bytes());
            out[p + 40..p + 48].copy_from_slice(&seg.memsz.to_le_bytes());
            out[p + 48..p + 56].copy_from_slice(&PAGE_SIZE.to_le_bytes());
        }
        out
    }
}

/// A small two-segment program: RX text at 0x40_0000, RW data at 0x40_1000.
pub fn sample_image() -> Vec<u8> {
    ElfBuilder::new(0x40_0010)
        .load(PF_R | PF_X, 0x40_0000, &[0x90; 0x20], 0x20)
        .load(PF_R | PF_W, 0x40_1000, b"DATA", 0x100)
        .build()
}
