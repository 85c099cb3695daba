//! EROFS (Enhanced Read-Only File System) image support.
//!
//! [`open_image`] validates an image on any positional reader and exposes it
//! through the [`FileSystem`](crate::fs::FileSystem) abstraction;
//! [`create_image`] produces an image from any such filesystem.

pub mod format;
pub mod reader;
pub mod writer;

pub use reader::Filesystem;
pub use writer::create_image;

use crate::fs::Result;
use crate::io::ReadAt;

/// Opens an EROFS image, validating its superblock.  Equivalent to
/// [`Filesystem::open`].
pub fn open_image<R: ReadAt>(src: R) -> Result<Filesystem<R>> {
    Filesystem::open(src)
}
