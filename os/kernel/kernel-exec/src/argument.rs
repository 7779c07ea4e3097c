//! # Launch Argument Buffer
//!
//! The caller's argument string may live in user mappings that the launch
//! tears down, so it is copied into this kernel-local buffer first and only
//! re-materialized on the new argument page once that page exists.

use core::fmt;

/// Capacity of the argument buffer in bytes, including the terminating NUL.
pub const ARGUMENT_CAPACITY: usize = 512;

/// Longest argument string that fits (without the terminator).
pub const MAX_ARGUMENT_LEN: usize = ARGUMENT_CAPACITY - 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ArgumentError {
    #[error("argument of {len} bytes exceeds the 511-byte limit")]
    TooLong { len: usize },
}

/// Kernel-local, NUL-terminated copy of the launch argument.
#[derive(Clone)]
pub struct ArgumentBuffer {
    bytes: [u8; ARGUMENT_CAPACITY],
    /// String length without the terminator.
    len: usize,
}

impl ArgumentBuffer {
    /// A buffer holding only the terminator.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            bytes: [0; ARGUMENT_CAPACITY],
            len: 0,
        }
    }

    /// Copy `arg` in. A NUL inside `arg` ends the string, as it would for the
    /// C-string reader on the other side.
    ///
    /// # Errors
    /// [`ArgumentError::TooLong`] if the string exceeds [`MAX_ARGUMENT_LEN`]
    /// bytes. Nothing is truncated.
    pub fn capture(arg: &[u8]) -> Result<Self, ArgumentError> {
        let len = arg.iter().position(|&b| b == 0).unwrap_or(arg.len());
        if len > MAX_ARGUMENT_LEN {
            return Err(ArgumentError::TooLong { len });
        }

        let mut buffer = Self::empty();
        buffer.bytes[..len].copy_from_slice(&arg[..len]);
        buffer.len = len;
        Ok(buffer)
    }

    /// Capture an optional argument; `None` yields [`ArgumentBuffer::empty`].
    ///
    /// # Errors
    /// See [`ArgumentBuffer::capture`].
    pub fn capture_optional(arg: Option<&[u8]>) -> Result<Self, ArgumentError> {
        arg.map_or_else(|| Ok(Self::empty()), Self::capture)
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The string bytes without the terminator.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// The string bytes followed by the NUL terminator.
    #[must_use]
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.bytes[..=self.len]
    }
}

impl Default for ArgumentBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for ArgumentBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgumentBuffer")
            .field("len", &self.len)
            .field("text", &core::str::from_utf8(self.as_bytes()).unwrap_or("<binary>"))
            .finish()
    }
}
