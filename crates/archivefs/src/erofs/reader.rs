//! EROFS image reading.
//!
//! Provides access to the contents of an EROFS image backed by any
//! [`ReadAt`] source.  The reader never caches decoded inodes or directory
//! pages; every call works directly against the underlying source, so an
//! opened [`Filesystem`] can be shared freely whenever the source supports
//! concurrent positional reads.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::io::{Chain, Read};
use std::mem::size_of;
use std::ops::ControlFlow;

use zerocopy::FromBytes;

use super::format::{
    superblock_checksum, CompactInode, DataLayout, Dirent, ExtendedInode, FormatField, InodeLayout,
    Superblock, BLOCK_BITS, DIRENT_SIZE, FEATURE_COMPAT_SB_CHECKSUM, FEATURE_INCOMPAT_SUPPORTED,
    INODE_SLOT_SIZE, MAGIC_V1, MAX_NAME_LEN, SUPERBLOCK_OFFSET,
};
use crate::fs::{
    clean_path, split_path, DirEntry, Error, FileInfo, FileSystem, FileType, ReadableFile, Result,
    S_IFDIR, S_IFLNK, S_IFMT,
};
use crate::io::{ReadAt, SectionReader};

/// Total number of symbolic links a single resolution may traverse.
const MAX_SYMLINK_HOPS: u32 = 40;

/// Positional access to the raw image bytes, with typed decoding of the
/// fixed little-endian records.
pub(crate) struct BlockReader<R> {
    src: R,
}

impl<R: ReadAt> BlockReader<R> {
    fn new(src: R) -> Self {
        BlockReader { src }
    }

    /// Reads exactly `n` bytes at `offset`; a short read is an I/O error.
    pub(crate) fn read_exact(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.src.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Decodes a fixed-width record at `offset`.
    pub(crate) fn read_struct<T: FromBytes>(&self, offset: u64) -> Result<T> {
        let mut buf = vec![0u8; size_of::<T>()];
        self.src.read_exact_at(&mut buf, offset)?;
        Ok(T::read_from_bytes(&buf).expect("buffer is exactly sized"))
    }

    /// A lazy sequential view of `[offset, offset + len)`.
    pub(crate) fn section(&self, offset: u64, len: u64) -> SectionReader<'_, R> {
        SectionReader::new(&self.src, offset, len)
    }
}

/// Decoded view of one inode.  Transient: constructed on demand from the
/// on-disk record and dropped by the caller.
#[derive(Clone, Debug)]
pub(crate) struct Inode {
    pub(crate) nid: u64,
    pub(crate) mode: u32,
    pub(crate) size: u64,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) nlink: u32,
    pub(crate) mtime: u64,
    pub(crate) mtime_nsec: u32,
    /// Byte offset of the out-of-line data.
    pub(crate) data_off: u64,
    /// Byte offset of the tail-packed inline data, if any.
    pub(crate) idata_off: Option<u64>,
    /// Number of blocks covered by the data, counting the inline tail.
    pub(crate) blocks: u64,
}

impl Inode {
    pub(crate) fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub(crate) fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

/// Location and length of one block's worth of an inode's data.  The tail
/// block of an inline inode lives in the metadata region.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockData {
    base: u64,
    size: u32,
}

/// An open EROFS image: the positional reader plus the validated superblock.
pub(crate) struct Image<R> {
    pub(crate) src: BlockReader<R>,
    pub(crate) sb: Superblock,
}

impl<R: ReadAt> Image<R> {
    pub(crate) fn open(src: R) -> Result<Image<R>> {
        let src = BlockReader::new(src);
        let sb: Superblock = src.read_struct(SUPERBLOCK_OFFSET)?;

        if sb.magic.get() != MAGIC_V1 {
            return Err(Error::Corrupt(format!(
                "unknown magic: {:#010x}",
                sb.magic.get()
            )));
        }

        if sb.blkszbits != BLOCK_BITS {
            return Err(Error::Unsupported(format!(
                "block size of {} bits",
                sb.blkszbits
            )));
        }

        let image = Image { src, sb };
        image.verify_checksum()?;

        let feature_incompat = image.sb.feature_incompat.get() & !FEATURE_INCOMPAT_SUPPORTED;
        if feature_incompat != 0 {
            return Err(Error::Unsupported(format!(
                "incompatible features {feature_incompat:#x}"
            )));
        }

        Ok(image)
    }

    fn verify_checksum(&self) -> Result<()> {
        if self.sb.feature_compat.get() & FEATURE_COMPAT_SB_CHECKSUM == 0 {
            return Ok(());
        }

        let trailer_off = SUPERBLOCK_OFFSET + size_of::<Superblock>() as u64;
        let trailer = self
            .src
            .read_exact(trailer_off, (self.sb.block_size() - trailer_off) as usize)?;

        let checksum = superblock_checksum(&self.sb, &trailer);
        if checksum != self.sb.checksum.get() {
            return Err(Error::Corrupt(format!(
                "invalid checksum: {checksum:#010x}, expected: {:#010x}",
                self.sb.checksum.get()
            )));
        }

        Ok(())
    }

    pub(crate) fn block_size(&self) -> u64 {
        self.sb.block_size()
    }

    pub(crate) fn root_nid(&self) -> u64 {
        u64::from(self.sb.root_nid.get())
    }

    /// Decodes the inode identified by `nid` into the uniform view.
    pub(crate) fn inode(&self, nid: u64) -> Result<Inode> {
        let off = self.sb.nid_to_offset(nid);
        if off & (INODE_SLOT_SIZE - 1) != 0 {
            return Err(Error::Corrupt(format!(
                "invalid inode alignment at offset {off}"
            )));
        }

        let format: FormatField = self.src.read_struct(off)?;

        let record_size;
        let raw_block_addr;
        let mut inode = match format.layout() {
            InodeLayout::Compact => {
                let ino: CompactInode = self.src.read_struct(off)?;
                if ino.xattr_count.get() != 0 {
                    return Err(Error::Unsupported(format!("xattrs at inode {nid}")));
                }
                record_size = size_of::<CompactInode>() as u64;
                raw_block_addr = ino.raw_block_addr.get();
                Inode {
                    nid,
                    mode: u32::from(ino.mode.get()),
                    size: u64::from(ino.size.get()),
                    uid: u32::from(ino.uid.get()),
                    gid: u32::from(ino.gid.get()),
                    nlink: u32::from(ino.nlink.get()),
                    // Compact records carry no timestamp; the image build
                    // time stands in.
                    mtime: self.sb.build_time.get(),
                    mtime_nsec: self.sb.build_time_nsec.get(),
                    data_off: 0,
                    idata_off: None,
                    blocks: 0,
                }
            }
            InodeLayout::Extended => {
                let ino: ExtendedInode = self.src.read_struct(off)?;
                if ino.xattr_count.get() != 0 {
                    return Err(Error::Unsupported(format!("xattrs at inode {nid}")));
                }
                record_size = size_of::<ExtendedInode>() as u64;
                raw_block_addr = ino.raw_block_addr.get();
                Inode {
                    nid,
                    mode: u32::from(ino.mode.get()),
                    size: ino.size.get(),
                    uid: ino.uid.get(),
                    gid: ino.gid.get(),
                    nlink: ino.nlink.get(),
                    mtime: ino.mtime.get(),
                    mtime_nsec: ino.mtime_nsec.get(),
                    data_off: 0,
                    idata_off: None,
                    blocks: 0,
                }
            }
        };

        let block_size = self.block_size();
        inode.blocks = inode.size.div_ceil(block_size);

        match format.data_layout() {
            Some(DataLayout::FlatInline) => {
                // The tail must fit in the metadata block after the record.
                let tail = inode.size & (block_size - 1);
                if tail == 0 || tail > block_size - record_size {
                    return Err(Error::Corrupt(format!(
                        "inline data not found or crosses block boundary at inode {nid}, tail size: {tail}"
                    )));
                }
                inode.idata_off = Some(off + record_size);
                inode.data_off = self.sb.block_addr_to_offset(raw_block_addr);
            }
            Some(DataLayout::FlatPlain) => {
                inode.data_off = self.sb.block_addr_to_offset(raw_block_addr);
            }
            _ => {
                return Err(Error::Unsupported(format!("data layout at inode {nid}")));
            }
        }

        Ok(inode)
    }

    /// Reads the dirent record at `offset`, which must be 4-byte aligned.
    fn dirent_at(&self, offset: u64) -> Result<Dirent> {
        if offset & 3 != 0 {
            return Err(Error::Corrupt(format!(
                "invalid dirent alignment at offset {offset}"
            )));
        }
        self.src.read_struct(offset)
    }

    /// Locates block `block_idx` of the inode's data.
    ///
    /// Precondition: `block_idx < inode.blocks`.
    fn block_data(&self, inode: &Inode, block_idx: u64) -> BlockData {
        let block_size = self.block_size();
        let last_block = block_idx == inode.blocks - 1;

        let base = match inode.idata_off {
            Some(idata_off) if last_block => idata_off,
            _ => inode.data_off + block_idx * block_size,
        };

        let mut size = block_size as u32;
        if last_block {
            let tail = (inode.size & (block_size - 1)) as u32;
            if tail != 0 {
                size = tail;
            }
        }

        BlockData { base, size }
    }

    /// Reads and validates the first dirent of a directory block.  Its
    /// `name_off` doubles as the dirent count: the names start right after
    /// the dirent array.
    fn dirent0(&self, inode: &Inode, block: BlockData) -> Result<Dirent> {
        let d0 = self.dirent_at(block.base)?;
        let name_off = d0.name_off.get();
        if u64::from(name_off) < DIRENT_SIZE
            || u32::from(name_off) >= block.size
            || u64::from(name_off) % DIRENT_SIZE != 0
        {
            return Err(Error::Corrupt(format!(
                "invalid name offset {name_off} of first dirent at inode {}",
                inode.nid
            )));
        }
        Ok(d0)
    }

    /// Resolves the name of dirent `d` within `block`.  Non-final names span
    /// up to the next dirent's `name_off`; the final name runs to the end of
    /// the block with trailing NUL padding stripped.
    fn dirent_name(
        &self,
        d: &Dirent,
        dirent_off: u64,
        block: BlockData,
        last_dirent: bool,
    ) -> Result<Vec<u8>> {
        let name_off = u32::from(d.name_off.get());

        let name_len = if last_dirent {
            block.size.checked_sub(name_off)
        } else {
            let next = self.dirent_at(dirent_off + DIRENT_SIZE)?;
            u32::from(next.name_off.get()).checked_sub(name_off)
        };
        let name_len = match name_len {
            Some(n) if n > 0 && name_off + n <= block.size => n,
            _ => return Err(Error::Corrupt("corrupted dirent".into())),
        };

        let mut name = self
            .src
            .read_exact(block.base + u64::from(name_off), name_len as usize)?;
        if last_dirent {
            match name.iter().position(|&b| b == 0) {
                Some(0) => return Err(Error::Corrupt("corrupted dirent".into())),
                Some(n) => name.truncate(n),
                None => {}
            }
        }
        if name.len() > MAX_NAME_LEN {
            return Err(Error::Corrupt("corrupted dirent".into()));
        }

        Ok(name)
    }

    /// Invokes `f` on each `(name, file_type, nid)` of the directory, in
    /// alphabetical order, until exhaustion or `ControlFlow::Break`.
    pub(crate) fn for_each_entry(
        &self,
        inode: &Inode,
        mut f: impl FnMut(&str, FileType, u64) -> ControlFlow<()>,
    ) -> Result<()> {
        if !inode.is_dir() {
            return Err(Error::NotADirectory);
        }

        for block_idx in 0..inode.blocks {
            let block = self.block_data(inode, block_idx);
            let mut d = self.dirent0(inode, block)?;
            let num_dirents = d.name_off.get() / DIRENT_SIZE as u16;
            let mut dirent_off = block.base;

            for i in 0..num_dirents {
                let last = i == num_dirents - 1;
                let name = self.dirent_name(&d, dirent_off, block, last)?;
                let name = std::str::from_utf8(&name).map_err(|_| {
                    Error::Corrupt(format!("dirent name is not valid UTF-8 at inode {}", inode.nid))
                })?;

                if let ControlFlow::Break(()) = f(name, d.file_type.into(), d.nid.get()) {
                    return Ok(());
                }

                if !last {
                    dirent_off += DIRENT_SIZE;
                    d = self.dirent_at(dirent_off)?;
                }
            }
        }

        Ok(())
    }

    /// Looks up one name in a directory by two-level binary search: first
    /// over blocks, comparing against each block's first name, then within
    /// the candidate block.  Entries are strictly alphabetical, exactly as
    /// the kernel requires.
    pub(crate) fn lookup(&self, inode: &Inode, name: &str) -> Result<Dirent> {
        if !inode.is_dir() {
            return Err(Error::NotADirectory);
        }

        let name = name.as_bytes();

        let mut target: Option<(BlockData, u16)> = None;

        let (mut left, mut right) = (0i64, inode.blocks as i64 - 1);
        while left <= right {
            let mid = ((left + right) >> 1) as u64;
            let block = self.block_data(inode, mid);
            let d0 = self.dirent0(inode, block)?;
            let num_dirents = d0.name_off.get() / DIRENT_SIZE as u16;
            let d0_name = self.dirent_name(&d0, block.base, block, num_dirents == 1)?;
            match name.cmp(&d0_name[..]) {
                Ordering::Equal => return Ok(d0),
                Ordering::Greater => {
                    // This block may still contain the target.
                    target = Some((block, num_dirents));
                    left = mid as i64 + 1;
                }
                Ordering::Less => right = mid as i64 - 1,
            }
        }

        let Some((block, num_dirents)) = target else {
            return Err(Error::NotFound);
        };

        // The zeroth dirent was already checked during the block search and
        // compared less than the query.
        let (mut left, mut right) = (1u16, num_dirents - 1);
        while left <= right {
            let mid = (left + right) >> 1;
            let dirent_off = block.base + u64::from(mid) * DIRENT_SIZE;
            let d = self.dirent_at(dirent_off)?;
            let d_name = self.dirent_name(&d, dirent_off, block, mid == num_dirents - 1)?;
            match name.cmp(&d_name[..]) {
                Ordering::Equal => return Ok(d),
                Ordering::Greater => left = mid + 1,
                Ordering::Less => right = mid - 1,
            }
        }

        Err(Error::NotFound)
    }

    /// Reads a symlink target.
    pub(crate) fn read_link(&self, inode: &Inode) -> Result<String> {
        if !inode.is_symlink() {
            return Err(Error::Invalid);
        }

        let (off, size) = match inode.idata_off {
            Some(idata_off) => {
                // An inline target may not span blocks.
                if inode.blocks > 1 {
                    return Err(Error::Corrupt(format!(
                        "inline data crosses block boundary at inode {}",
                        inode.nid
                    )));
                }
                (idata_off, inode.size)
            }
            // Out-of-line targets are terminated at one byte short of a
            // block, matching how the kernel pages in symlinks.
            None => (inode.data_off, inode.size.min(self.block_size() - 1)),
        };

        let target = self.src.read_exact(off, size as usize)?;
        String::from_utf8(target).map_err(|_| {
            Error::Corrupt(format!(
                "symlink target is not valid UTF-8 at inode {}",
                inode.nid
            ))
        })
    }

    /// A sequential reader over the inode's data: the out-of-line span
    /// followed by the inline tail, either of which may be empty.
    fn data_reader(&self, inode: &Inode) -> Chain<SectionReader<'_, R>, SectionReader<'_, R>> {
        match inode.idata_off {
            Some(idata_off) => {
                let tail = inode.size & (self.block_size() - 1);
                self.src
                    .section(inode.data_off, inode.size - tail)
                    .chain(self.src.section(idata_off, tail))
            }
            None => self
                .src
                .section(inode.data_off, inode.size)
                .chain(self.src.section(0, 0)),
        }
    }
}

/// An entry produced by path resolution: the final component's name and the
/// inode it names.
#[derive(Clone, Debug)]
struct ResolvedEntry {
    name: String,
    nid: u64,
}

/// A read-only view of an EROFS image, implementing [`FileSystem`].
pub struct Filesystem<R> {
    pub(crate) image: Image<R>,
}

impl<R: ReadAt> Filesystem<R> {
    /// Validates the superblock of `src` and returns the filesystem view.
    /// Ownership of `src` transfers to the filesystem.
    pub fn open(src: R) -> Result<Filesystem<R>> {
        Ok(Filesystem {
            image: Image::open(src)?,
        })
    }

    fn root(&self) -> ResolvedEntry {
        ResolvedEntry {
            name: String::new(),
            nid: self.image.root_nid(),
        }
    }

    /// Walks `path` from the root, following symbolic links (except,
    /// optionally, one at the final component).  Wholly iterative: link
    /// targets are spliced into the pending component list, and the total
    /// number of links traversed is bounded.
    fn resolve(&self, path: &str, no_resolve_last_symlink: bool) -> Result<ResolvedEntry> {
        let mut components: VecDeque<String> =
            split_path(path).into_iter().map(String::from).collect();
        let mut walked: Vec<String> = Vec::new();
        let mut entry = self.root();
        let mut hops = 0u32;

        while let Some(comp) = components.pop_front() {
            let is_last = components.is_empty();

            let dir_inode = self.image.inode(entry.nid)?;
            let dirent = self.image.lookup(&dir_inode, &comp)?;
            let child = self.image.inode(dirent.nid.get())?;

            if child.is_symlink() && !(no_resolve_last_symlink && is_last) {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(Error::Loop);
                }

                let target = clean_path(&self.image.read_link(&child)?);
                let expansion = match target.strip_prefix('/') {
                    // Absolute target: restart from the root.
                    Some(rest) => rest.to_string(),
                    // Relative target: resolve against the walked prefix.
                    None if walked.is_empty() => target,
                    None => clean_path(&format!("{}/{}", walked.join("/"), target)),
                };

                for comp in split_path(&expansion).into_iter().rev() {
                    components.push_front(comp.to_string());
                }
                walked.clear();
                entry = self.root();
                continue;
            }

            walked.push(comp.clone());
            entry = ResolvedEntry {
                name: comp,
                nid: dirent.nid.get(),
            };
        }

        Ok(entry)
    }

    fn file_info(&self, name: &str, inode: &Inode) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            size: inode.size,
            mode: inode.mode,
            mtime: inode.mtime as i64,
            mtime_nsec: inode.mtime_nsec,
            uid: inode.uid,
            gid: inode.gid,
            nlink: inode.nlink,
            ino: inode.nid,
        }
    }
}

/// An open file within an EROFS image.
pub struct File<'img, R> {
    info: FileInfo,
    content: Chain<SectionReader<'img, R>, SectionReader<'img, R>>,
}

impl<R: ReadAt> Read for File<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.content.read(buf)
    }
}

impl<R: ReadAt> ReadableFile for File<'_, R> {
    fn stat(&self) -> Result<FileInfo> {
        Ok(self.info.clone())
    }
}

impl<R: ReadAt> FileSystem for Filesystem<R> {
    fn open(&self, path: &str) -> Result<Box<dyn ReadableFile + '_>> {
        let entry = self.resolve(path, false)?;
        let inode = self.image.inode(entry.nid)?;
        Ok(Box::new(File {
            info: self.file_info(&entry.name, &inode),
            content: self.image.data_reader(&inode),
        }))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let entry = self.resolve(path, false)?;
        let inode = self.image.inode(entry.nid)?;

        let mut entries = Vec::new();
        self.image.for_each_entry(&inode, |name, file_type, _nid| {
            if name != "." && name != ".." {
                entries.push(DirEntry {
                    name: name.to_string(),
                    file_type,
                });
            }
            ControlFlow::Continue(())
        })?;

        Ok(entries)
    }

    fn stat(&self, path: &str) -> Result<FileInfo> {
        let entry = self.resolve(path, false)?;
        let inode = self.image.inode(entry.nid)?;
        Ok(self.file_info(&entry.name, &inode))
    }

    fn read_link(&self, path: &str) -> Result<String> {
        let entry = self.resolve(path, true)?;
        let inode = self.image.inode(entry.nid)?;
        self.image.read_link(&inode)
    }

    fn stat_link(&self, path: &str) -> Result<FileInfo> {
        let entry = self.resolve(path, true)?;
        let inode = self.image.inode(entry.nid)?;
        Ok(self.file_info(&entry.name, &inode))
    }
}
