/// API types for staged file operations

use std::fs::OpenOptions;

use crate::error::UsageError;

/// Open flags (similar to POSIX)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    /// Read access
    pub read: bool,

    /// Write access
    pub write: bool,

    /// Create if doesn't exist
    pub create: bool,

    /// Fail if the file exists
    pub exclusive: bool,

    /// Truncate on open
    pub truncate: bool,

    /// Append mode
    pub append: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn write_only() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    /// `O_WRONLY | O_CREAT | O_TRUNC`, what a write mode opens with
    pub fn create() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Self::default()
        }
    }

    pub fn append() -> Self {
        Self {
            write: true,
            create: true,
            append: true,
            ..Self::default()
        }
    }

    /// Parse a stdio-style mode string (`"r"`, `"wb"`, `"a+"`, `"x"`, ...)
    pub fn from_mode(mode: &str) -> Result<Self, UsageError> {
        let invalid = || UsageError::InvalidMode(mode.to_string());

        let mut base = None;
        let mut update = false;
        let mut text_or_binary = false;

        for c in mode.chars() {
            match c {
                'r' | 'w' | 'a' | 'x' if base.is_none() => base = Some(c),
                '+' if !update => update = true,
                'b' | 't' if !text_or_binary => text_or_binary = true,
                _ => return Err(invalid()),
            }
        }

        let mut flags = match base.ok_or_else(invalid)? {
            'r' => Self::read_only(),
            'w' => Self::create(),
            'a' => Self::append(),
            'x' => Self {
                write: true,
                create: true,
                exclusive: true,
                ..Self::default()
            },
            _ => return Err(invalid()),
        };
        if update {
            flags.read = true;
            flags.write = true;
        }
        Ok(flags)
    }

    /// Convert POSIX `open(2)` flags
    pub fn from_posix(flags: i32) -> Self {
        let mut open_flags = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => Self::write_only(),
            libc::O_RDWR => Self::read_write(),
            _ => Self::read_only(),
        };

        open_flags.create = flags & libc::O_CREAT != 0;
        open_flags.exclusive = flags & libc::O_EXCL != 0;
        open_flags.truncate = flags & libc::O_TRUNC != 0;
        open_flags.append = flags & libc::O_APPEND != 0;

        open_flags
    }

    /// Pure read: the only mode that triggers a consume
    pub fn is_read_like(&self) -> bool {
        self.read && !self.write && !self.append
    }

    /// Pure truncating write: the only mode that triggers a produce
    pub fn is_write_like(&self) -> bool {
        self.write && !self.read && self.truncate && !self.append && !self.exclusive
    }

    /// Equivalent `std::fs::OpenOptions`
    pub fn to_open_options(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .read(self.read)
            .write(self.write && !self.append)
            .append(self.append)
            .truncate(self.truncate);
        if self.exclusive {
            options.create_new(true);
        } else {
            options.create(self.create);
        }
        options
    }
}

impl std::str::FromStr for OpenFlags {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_mode(s)
    }
}

/// Staging action attached to an open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Consume before the underlying open
    Consume,
    /// Produce after the underlying close
    ProduceOnClose,
    /// Plain local I/O
    Unmanaged,
}

/// Lifecycle state of a staged file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Closed,
    OpenForRead,
    OpenForWrite,
    /// Open in a mode that is never routed (append, update, exclusive create)
    OpenUnrouted,
}

impl FileState {
    /// State entered by a successful open with `flags`
    pub fn opened_with(flags: &OpenFlags) -> Self {
        if flags.is_read_like() {
            FileState::OpenForRead
        } else if flags.is_write_like() {
            FileState::OpenForWrite
        } else {
            FileState::OpenUnrouted
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, FileState::Closed)
    }
}
