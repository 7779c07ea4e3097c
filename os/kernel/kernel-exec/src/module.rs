//! Boot module descriptor: the `[begin, end)` span of a raw executable image
//! that the boot loader left mapped for the kernel.

use core::fmt;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ModuleError {
    #[error("module ends at 0x{end:X} before it begins at 0x{begin:X}")]
    InvertedBounds { begin: u64, end: u64 },
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct BootModule<'n> {
    begin: u64,
    end: u64,
    name: Option<&'n str>,
}

impl<'n> BootModule<'n> {
    /// # Errors
    /// [`ModuleError::InvertedBounds`] if `end < begin`.
    pub const fn from_bounds(begin: u64, end: u64) -> Result<Self, ModuleError> {
        if end < begin {
            return Err(ModuleError::InvertedBounds { begin, end });
        }
        Ok(Self {
            begin,
            end,
            name: None,
        })
    }

    /// Describe an image that already lives in a kernel slice.
    #[must_use]
    pub fn from_slice(image: &[u8]) -> Self {
        let begin = image.as_ptr() as u64;
        Self {
            begin,
            end: begin + image.len() as u64,
            name: None,
        }
    }

    /// Attach the name (command line) the boot loader gave the module.
    #[must_use]
    pub const fn with_name(mut self, name: &'n str) -> Self {
        self.name = Some(name);
        self
    }

    #[inline]
    #[must_use]
    pub const fn begin(&self) -> u64 {
        self.begin
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end - self.begin
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> Option<&'n str> {
        self.name
    }

    /// The image bytes.
    ///
    /// # Safety
    /// `[begin, end)` must be mapped, readable and left unmodified for `'a`.
    /// The span must not lie in the user half that a launch tears down.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn bytes<'a>(&self) -> &'a [u8] {
        if self.size() == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.begin as *const u8, self.size() as usize) }
    }
}

impl fmt::Debug for BootModule<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootModule")
            .field("begin", &format_args!("0x{:016X}", self.begin))
            .field("end", &format_args!("0x{:016X}", self.end))
            .field("name", &self.name)
            .finish()
    }
}
