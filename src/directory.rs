//! Base directories and open modes for remote file operations.
//!
//! File paths on the device are resolved against a [`BaseDirectory`]. The
//! selector is carried in the upper 16 bits of the index offset of an open
//! call, the [`OpenMode`] flags in the lower bits.
//!
//! | Directory | Selector | Description |
//! |-----------|:--------:|-------------|
//! | Generic | 1 | Absolute path as given |
//! | BootProject | 2 | PLC boot project folder |
//! | BootData | 3 | Persistent data folder |
//! | BootDir | 4 | Boot folder |
//! | TargetDir | 5 | Target folder |
//! | ConfigDir | 6 | Configuration folder |
//! | InstallDir | 7 | Installation folder |
//!
//! # Example
//!
//! ```
//! use ads_utilities::{BaseDirectory, OpenMode};
//!
//! let mode = OpenMode::READ | OpenMode::BINARY;
//! assert_eq!(BaseDirectory::Generic.open_offset(mode), 0x0001_0011);
//! assert_eq!(BaseDirectory::BootData.to_string(), "BootData");
//! ```

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Flags selecting how a remote file is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct OpenMode: u32 {
        /// Open for reading.
        const READ = 1;
        /// Open for writing, truncating an existing file.
        const WRITE = 2;
        /// Open for appending.
        const APPEND = 4;
        /// Open for reading and writing.
        const READ_WRITE = 8;
        /// Binary mode.
        const BINARY = 16;
        /// Text mode.
        const TEXT = 32;
    }
}

/// Directory a remote path is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BaseDirectory {
    /// Path is used as given.
    #[default]
    Generic,
    /// Boot project folder.
    BootProject,
    /// Persistent data folder.
    BootData,
    /// Boot folder.
    BootDir,
    /// Target folder.
    TargetDir,
    /// Configuration folder.
    ConfigDir,
    /// Installation folder.
    InstallDir,
}

impl BaseDirectory {
    /// Returns the selector as it appears in an index offset.
    pub(crate) fn selector(self) -> u32 {
        let code: u32 = match self {
            BaseDirectory::Generic => 1,
            BaseDirectory::BootProject => 2,
            BaseDirectory::BootData => 3,
            BaseDirectory::BootDir => 4,
            BaseDirectory::TargetDir => 5,
            BaseDirectory::ConfigDir => 6,
            BaseDirectory::InstallDir => 7,
        };
        code << 16
    }

    /// Returns the index offset for an open call with `mode` in this directory.
    pub fn open_offset(self, mode: OpenMode) -> u32 {
        self.selector() | mode.bits()
    }
}

impl fmt::Display for BaseDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BaseDirectory::Generic => "Generic",
            BaseDirectory::BootProject => "BootProject",
            BaseDirectory::BootData => "BootData",
            BaseDirectory::BootDir => "BootDir",
            BaseDirectory::TargetDir => "TargetDir",
            BaseDirectory::ConfigDir => "ConfigDir",
            BaseDirectory::InstallDir => "InstallDir",
        };
        write!(f, "{}", name)
    }
}
