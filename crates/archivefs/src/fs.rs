//! The archive-filesystem abstraction shared by readers and writers.
//!
//! A [`FileSystem`] is a read-only hierarchical view: archive readers
//! implement it, and archive writers consume it as their source.  Paths are
//! `/`-separated; a leading `/` and empty components are ignored, so
//! `"/etc/passwd"`, `"etc/passwd"` and `"etc//passwd"` name the same entry.

use std::io::Read;

use thiserror::Error;

/// Errors surfaced by filesystem implementations in this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// A path component does not exist.
    #[error("no such file or directory")]
    NotFound,
    /// A directory operation was attempted on a non-directory.
    #[error("not a directory")]
    NotADirectory,
    /// The argument is malformed, or the operation does not apply to the
    /// file type (e.g. `read_link` on a regular file).
    #[error("invalid argument")]
    Invalid,
    /// The on-disk data violates the format.
    #[error("corrupt image: {0}")]
    Corrupt(String),
    /// The image or source uses a feature outside the supported subset.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Too many levels of symbolic links.
    #[error("too many levels of symbolic links")]
    Loop,
    /// Failure of the underlying reader or writer.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/* POSIX mode bits, as stored on disk. */
pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// File type of a directory entry, using the on-disk dirent numbering shared
/// by ext2, EROFS and friends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    Regular = 1,
    Directory = 2,
    CharacterDevice = 3,
    BlockDevice = 4,
    Fifo = 5,
    Socket = 6,
    Symlink = 7,
}

impl FileType {
    /// Derives the file type from the `S_IFMT` bits of a POSIX mode.
    pub fn from_mode(mode: u32) -> FileType {
        match mode & S_IFMT {
            S_IFREG => FileType::Regular,
            S_IFDIR => FileType::Directory,
            S_IFCHR => FileType::CharacterDevice,
            S_IFBLK => FileType::BlockDevice,
            S_IFIFO => FileType::Fifo,
            S_IFSOCK => FileType::Socket,
            S_IFLNK => FileType::Symlink,
            _ => FileType::Unknown,
        }
    }

    /// Returns the `S_IFMT` bits for this file type (0 for `Unknown`).
    pub fn to_mode(self) -> u32 {
        match self {
            FileType::Regular => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::CharacterDevice => S_IFCHR,
            FileType::BlockDevice => S_IFBLK,
            FileType::Fifo => S_IFIFO,
            FileType::Socket => S_IFSOCK,
            FileType::Symlink => S_IFLNK,
            FileType::Unknown => 0,
        }
    }

    pub fn is_dir(self) -> bool {
        self == FileType::Directory
    }
}

/// Metadata for a single filesystem node, similar to `struct stat`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// Final path component naming this node ("" for the root).
    pub name: String,
    /// Data size in bytes.
    pub size: u64,
    /// Full POSIX mode, including the `S_IFMT` type bits.
    pub mode: u32,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
    /// Nanoseconds part of the modification time.
    pub mtime_nsec: u32,
    pub uid: u32,
    pub gid: u32,
    /// Number of hard links.
    pub nlink: u32,
    /// Implementation-defined inode number (the EROFS nid; 0 where the
    /// source has no such concept).
    pub ino: u64,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    /// The permission bits of the mode (including setuid/setgid/sticky).
    pub fn permissions(&self) -> u32 {
        self.mode & !S_IFMT
    }
}

/// One entry of a directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub file_type: FileType,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.file_type.is_dir()
    }
}

/// An open file handle: sequential reads plus metadata.
pub trait ReadableFile: Read {
    fn stat(&self) -> Result<FileInfo>;
}

/// A read-only hierarchical filesystem.
///
/// `read_link` and `stat_link` form the optional symlink capability: sources
/// that have no notion of symbolic links keep the defaults, and the EROFS
/// writer fails `Unsupported` if such a source nevertheless contains one.
pub trait FileSystem {
    /// Opens the file at `path`, following symbolic links.
    fn open(&self, path: &str) -> Result<Box<dyn ReadableFile + '_>>;

    /// Lists the directory at `path` in alphabetical order, excluding the
    /// `.` and `..` entries.
    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Returns metadata for `path`, following symbolic links.
    fn stat(&self, path: &str) -> Result<FileInfo>;

    /// Returns the target of the symbolic link at `path`.
    fn read_link(&self, _path: &str) -> Result<String> {
        Err(Error::Unsupported(
            "source filesystem does not support symbolic links".into(),
        ))
    }

    /// Returns metadata for `path` without following a final symbolic link.
    fn stat_link(&self, path: &str) -> Result<FileInfo> {
        self.stat(path)
    }
}

/// Splits a path into its non-empty components.
pub(crate) fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// Lexically normalizes a path: drops `.` components and collapses `..`
/// against a preceding component.  Leading `..`s of a relative path are
/// preserved; the empty result is `"."`.
pub(crate) fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();

    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => match out.last() {
                Some(&"..") => out.push(".."),
                Some(_) => {
                    out.pop();
                }
                None => {
                    if !absolute {
                        out.push("..");
                    }
                }
            },
            comp => out.push(comp),
        }
    }

    let joined = out.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Joins two relative path fragments the way a source walk names children:
/// joining anything onto `"."` yields the child itself.
pub(crate) fn join_path(base: &str, name: &str) -> String {
    if base == "." || base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}
