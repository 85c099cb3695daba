//! Filesystem images behind one read-only filesystem abstraction.
//!
//! The crate centers on an engine for the EROFS on-disk image format: open
//! an existing image over any random-access byte source, or create one from
//! any implementation of the [`FileSystem`] trait.  The engine holds no
//! caches; every operation works directly against the underlying reader.
//!
//! ```no_run
//! use archivefs::{erofs, memfs::{MemoryFilesystem, Stat}, FileSystem};
//!
//! # fn main() -> archivefs::Result<()> {
//! let mut src = MemoryFilesystem::new();
//! src.add_file("hello.txt", Stat::default(), "hello world\n")?;
//!
//! let mut image = Vec::new();
//! erofs::create_image(&mut image, &src)?;
//!
//! let fsys = erofs::open_image(image.as_slice())?;
//! assert_eq!(fsys.stat("hello.txt")?.size, 12);
//! # Ok(())
//! # }
//! ```

pub mod erofs;
pub mod fs;
pub mod io;
pub mod memfs;

pub use fs::{DirEntry, Error, FileInfo, FileSystem, FileType, ReadableFile, Result};
pub use io::{ReadAt, SectionReader, WriteAt};
