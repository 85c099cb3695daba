//! EROFS image creation.
//!
//! [`create_image`] lays out and writes an image from any [`FileSystem`]
//! source.  Planning is two-pass: the first pass walks the source in
//! deterministic order, sizes every node and assigns inode slots with
//! data-region-relative block addresses; the fix-up pass rebases those
//! addresses once the metadata region size is known.  The superblock is
//! written last so that its totals and checksum reflect the final image.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::mem::size_of;

use log::trace;
use zerocopy::IntoBytes;

use super::format::{
    round_up, superblock_checksum, CompactInode, DataLayout, Dirent, ExtendedInode, FormatField,
    InodeLayout, Superblock, BLOCK_BITS, BLOCK_SIZE, DIRENT_SIZE, FEATURE_COMPAT_SB_CHECKSUM,
    INODE_SLOT_BITS, INODE_SLOT_SIZE, MAGIC_V1, MAX_NAME_LEN, SUPERBLOCK_OFFSET,
};
use crate::fs::{
    join_path, Error, FileInfo, FileSystem, FileType, Result, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
};
use crate::io::{copy_to_at, WriteAt};

/// Node data up to a quarter block is tail-packed after the inode record.
pub const MAX_INLINE_DATA_SIZE: u64 = BLOCK_SIZE / 4;

/// Creates an EROFS image of the source filesystem on `dst`.
///
/// The source must support directory listing and file open; `read_link` is
/// required only if a symbolic link is encountered.  Device nodes, FIFOs and
/// sockets are not written.  On failure the destination may be left
/// partially written.
pub fn create_image<W, F>(dst: &mut W, src: &F) -> Result<()>
where
    W: WriteAt + ?Sized,
    F: FileSystem + ?Sized,
{
    Writer {
        src,
        dst,
        inodes: HashMap::new(),
        order: Vec::new(),
    }
    .write()
}

/// The two on-disk inode record variants, carried through planning as a
/// tagged value and projected to bytes at emission time.
enum InodeRecord {
    Compact(CompactInode),
    Extended(ExtendedInode),
}

impl InodeRecord {
    fn size(&self) -> u64 {
        match self {
            InodeRecord::Compact(_) => size_of::<CompactInode>() as u64,
            InodeRecord::Extended(_) => size_of::<ExtendedInode>() as u64,
        }
    }

    fn mode(&self) -> u32 {
        match self {
            InodeRecord::Compact(ino) => u32::from(ino.mode.get()),
            InodeRecord::Extended(ino) => u32::from(ino.mode.get()),
        }
    }
}

/// One planned inode: the prefilled record plus everything decided during
/// layout.  `block_addr` is `None` for nodes with no out-of-line data; after
/// the fix-up pass it is an absolute block address.
struct PlannedInode {
    record: InodeRecord,
    nid: u32,
    size: u64,
    data_layout: DataLayout,
    block_addr: Option<u32>,
}

impl PlannedInode {
    /// Builds the record for a source node.  The compact form is used
    /// whenever the metadata fits: it cannot carry a modification time, so
    /// any node with a nonzero mtime gets the extended form.
    fn new(info: &FileInfo, nlink: u32) -> PlannedInode {
        let compact = info.size <= u64::from(u32::MAX)
            && info.uid <= u32::from(u16::MAX)
            && info.gid <= u32::from(u16::MAX)
            && info.mtime == 0
            && info.mtime_nsec == 0;

        let record = if compact {
            InodeRecord::Compact(CompactInode {
                format: FormatField::new(InodeLayout::Compact, DataLayout::FlatPlain),
                mode: (info.mode as u16).into(),
                nlink: (nlink as u16).into(),
                uid: (info.uid as u16).into(),
                gid: (info.gid as u16).into(),
                ..Default::default()
            })
        } else {
            InodeRecord::Extended(ExtendedInode {
                format: FormatField::new(InodeLayout::Extended, DataLayout::FlatPlain),
                mode: (info.mode as u16).into(),
                nlink: nlink.into(),
                uid: info.uid.into(),
                gid: info.gid.into(),
                mtime: (info.mtime as u64).into(),
                mtime_nsec: info.mtime_nsec.into(),
                ..Default::default()
            })
        };

        PlannedInode {
            record,
            nid: 0,
            size: 0,
            data_layout: DataLayout::FlatPlain,
            block_addr: None,
        }
    }

    /// Serializes the record with the planned format, size, nid and block
    /// address filled in.
    fn record_bytes(&self) -> Vec<u8> {
        let raw_block_addr = self.block_addr.unwrap_or(0);
        match &self.record {
            InodeRecord::Compact(ino) => {
                let mut ino = ino.clone();
                ino.format = FormatField::new(InodeLayout::Compact, self.data_layout);
                ino.size = (self.size as u32).into();
                ino.ino = self.nid.into();
                ino.raw_block_addr = raw_block_addr.into();
                ino.as_bytes().to_vec()
            }
            InodeRecord::Extended(ino) => {
                let mut ino = ino.clone();
                ino.format = FormatField::new(InodeLayout::Extended, self.data_layout);
                ino.size = self.size.into();
                ino.ino = self.nid.into();
                ino.raw_block_addr = raw_block_addr.into();
                ino.as_bytes().to_vec()
            }
        }
    }
}

/// The data of one node, as produced on demand during planning and writing.
enum InodeData<'a> {
    File(Box<dyn crate::fs::ReadableFile + 'a>),
    Bytes(Cursor<Vec<u8>>),
}

impl Read for InodeData<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            InodeData::File(f) => f.read(buf),
            InodeData::Bytes(c) => c.read(buf),
        }
    }
}

/// A directory entry as planned for emission.
struct PlannedDirent {
    name: String,
    nid: u64,
    file_type: FileType,
}

struct Writer<'a, W: ?Sized, F: ?Sized> {
    src: &'a F,
    dst: &'a mut W,
    inodes: HashMap<String, PlannedInode>,
    order: Vec<String>,
}

impl<'a, W: WriteAt + ?Sized, F: FileSystem + ?Sized> Writer<'a, W, F> {
    fn write(&mut self) -> Result<()> {
        self.populate()?;

        let (meta_size, data_size) = self.first_pass()?;

        // The first block is reserved for the superblock.
        let meta_block_addr = 1u32;

        self.write_metadata(meta_block_addr)?;
        self.write_data()?;

        let root_nid = self.inodes["."].nid;
        let mut sb = Superblock {
            magic: MAGIC_V1.into(),
            blkszbits: BLOCK_BITS,
            root_nid: (root_nid as u16).into(),
            inos: (self.inodes.len() as u64).into(),
            blocks: ((1 + (meta_size + data_size) / BLOCK_SIZE) as u32).into(),
            meta_blkaddr: meta_block_addr.into(),
            feature_compat: FEATURE_COMPAT_SB_CHECKSUM.into(),
            ..Default::default()
        };
        let trailer =
            vec![0u8; (BLOCK_SIZE - SUPERBLOCK_OFFSET) as usize - size_of::<Superblock>()];
        sb.checksum = superblock_checksum(&sb, &trailer).into();

        self.dst.write_all_at(sb.as_bytes(), SUPERBLOCK_OFFSET)?;
        self.dst.set_len(u64::from(sb.blocks.get()) * BLOCK_SIZE)?;

        Ok(())
    }

    /// Walks the source depth-first in alphabetical order, parents before
    /// children, creating the planned inode for every node.
    fn populate(&mut self) -> Result<()> {
        self.visit(".".to_string())
    }

    fn visit(&mut self, path: String) -> Result<()> {
        let info = self.src.stat_link(&path)?;

        let mut children = Vec::new();
        if info.is_dir() {
            children = self.src.read_dir(&path)?;
            children.sort_by(|a, b| a.name.cmp(&b.name));
            for child in &children {
                if child.name.is_empty()
                    || child.name == "."
                    || child.name == ".."
                    || child.name.len() > MAX_NAME_LEN
                    || child.name.contains(['/', '\0'])
                {
                    return Err(Error::Invalid);
                }
            }
        }

        let nlink = if info.is_dir() {
            children.len() as u32 + 2
        } else {
            1
        };

        trace!("plan {path:?} nlink {nlink}");
        self.inodes.insert(path.clone(), PlannedInode::new(&info, nlink));
        self.order.push(path.clone());

        for child in children {
            self.visit(join_path(&path, &child.name))?;
        }

        Ok(())
    }

    /// Sizing pass: decides inline vs. out-of-line for every node, assigns
    /// slot-aligned nids and accumulates the metadata and data region sizes.
    /// Out-of-line addresses are data-region-relative until the fix-up at
    /// the end rebases them past the metadata region.
    fn first_pass(&mut self) -> Result<(u64, u64)> {
        let mut meta_size = 0u64;
        let mut data_size = 0u64;

        for i in 0..self.order.len() {
            let path = self.order[i].clone();
            let (data, size) = self.data_for_inode(&path)?;
            drop(data);

            let planned = self.inodes.get_mut(&path).expect("planned in populate");
            let record_size = planned.record.size();

            let inlined = size > 0 && size <= MAX_INLINE_DATA_SIZE;
            if inlined {
                // Tail-packed data may not cross a block boundary; pad the
                // metadata cursor to the next block if it would.
                let space_available = round_up(meta_size, BLOCK_SIZE) - meta_size;
                if space_available > 0 && record_size + size > space_available {
                    meta_size = round_up(meta_size, BLOCK_SIZE);
                }
            }

            if meta_size % INODE_SLOT_SIZE != 0 {
                return Err(Error::Invalid);
            }
            planned.nid = (meta_size >> INODE_SLOT_BITS) as u32;
            planned.size = size;

            if inlined {
                planned.data_layout = DataLayout::FlatInline;
            } else {
                planned.data_layout = DataLayout::FlatPlain;
                if size > 0 {
                    planned.block_addr = Some((data_size / BLOCK_SIZE) as u32);
                }
            }

            trace!(
                "  {path:?}: nid {} size {size} {:?} block {:?}",
                planned.nid,
                planned.data_layout,
                planned.block_addr
            );

            meta_size += record_size;
            if inlined {
                meta_size += size;
                meta_size = round_up(meta_size, INODE_SLOT_SIZE);
            } else {
                data_size += round_up(size, BLOCK_SIZE);
            }
        }

        meta_size = round_up(meta_size, BLOCK_SIZE);

        // Fix-up pass: rebase out-of-line addresses now that the size of the
        // metadata region is known.
        let data_block_base = (1 + meta_size / BLOCK_SIZE) as u32;
        for planned in self.inodes.values_mut() {
            if let Some(addr) = &mut planned.block_addr {
                *addr += data_block_base;
            }
        }

        Ok((meta_size, data_size))
    }

    fn write_metadata(&mut self, meta_block_addr: u32) -> Result<()> {
        let meta_base = u64::from(meta_block_addr) * BLOCK_SIZE;

        for i in 0..self.order.len() {
            let path = self.order[i].clone();
            let planned = &self.inodes[&path];
            let off = meta_base + u64::from(planned.nid) * INODE_SLOT_SIZE;
            let record = planned.record_bytes();
            let inlined = planned.data_layout == DataLayout::FlatInline;

            trace!("write inode {path:?} nid {} @{off}", planned.nid);
            self.dst.write_all_at(&record, off)?;

            if inlined {
                let (mut data, _) = self.data_for_inode(&path)?;
                copy_to_at(&mut data, self.dst, off + record.len() as u64)?;
            }
        }

        Ok(())
    }

    fn write_data(&mut self) -> Result<()> {
        for i in 0..self.order.len() {
            let path = self.order[i].clone();
            let planned = &self.inodes[&path];

            let Some(block_addr) = planned.block_addr else {
                continue;
            };

            trace!("write data {path:?} block {block_addr}");
            let (mut data, _) = self.data_for_inode(&path)?;
            copy_to_at(&mut data, self.dst, u64::from(block_addr) * BLOCK_SIZE)?;
        }

        Ok(())
    }

    /// Produces a node's data and its size: the opened file for regular
    /// files, the encoded dirent pages for directories, the target for
    /// symbolic links.
    fn data_for_inode(&self, path: &str) -> Result<(InodeData<'a>, u64)> {
        let src = self.src;
        let mode = self.inodes[path].record.mode();

        match mode & S_IFMT {
            S_IFREG => {
                let file = src.open(path)?;
                let size = file.stat()?.size;
                Ok((InodeData::File(file), size))
            }
            S_IFDIR => {
                let pages = self.directory_data(path)?;
                let size = pages.len() as u64;
                Ok((InodeData::Bytes(Cursor::new(pages)), size))
            }
            S_IFLNK => {
                let target = src.read_link(path)?;
                let size = target.len() as u64;
                Ok((InodeData::Bytes(Cursor::new(target.into_bytes())), size))
            }
            _ => Err(Error::Unsupported(format!(
                "writing file type {:o}",
                mode & S_IFMT
            ))),
        }
    }

    /// Encodes a directory's payload: its children plus the synthetic `.`
    /// and `..` entries (the root has no `..`), fully sorted, packed into
    /// block-sized pages.
    fn directory_data(&self, path: &str) -> Result<Vec<u8>> {
        let mut children = self.src.read_dir(path)?;
        children.sort_by(|a, b| a.name.cmp(&b.name));

        let mut entries = Vec::with_capacity(children.len() + 2);
        for child in children {
            let child_path = join_path(path, &child.name);
            let planned = self.inodes.get(&child_path).ok_or(Error::Invalid)?;
            entries.push(PlannedDirent {
                name: child.name,
                nid: u64::from(planned.nid),
                file_type: child.file_type,
            });
        }

        insert_sorted(&mut entries, ".", u64::from(self.inodes[path].nid));
        if path != "." {
            let parent = path.rsplit_once('/').map_or(".", |(parent, _)| parent);
            insert_sorted(&mut entries, "..", u64::from(self.inodes[parent].nid));
        }

        Ok(encode_dirent_pages(&entries))
    }
}

/// Inserts a directory entry into an already-sorted list.
fn insert_sorted(entries: &mut Vec<PlannedDirent>, name: &str, nid: u64) {
    let point = entries.partition_point(|e| e.name.as_str() < name);
    entries.insert(
        point,
        PlannedDirent {
            name: name.to_string(),
            nid,
            file_type: FileType::Directory,
        },
    );
}

/// Packs sorted dirents into pages: within each page the dirent records come
/// first, then the names back to back, then a single NUL after the final
/// name.  Pages other than the last are zero-padded to the block boundary; a
/// page is closed whenever the next record, name and NUL would no longer
/// fit.
fn encode_dirent_pages(entries: &[PlannedDirent]) -> Vec<u8> {
    let mut pages: Vec<&[PlannedDirent]> = Vec::new();
    let mut start = 0;
    let mut page_bytes = 0u64;

    for (i, entry) in entries.iter().enumerate() {
        let entry_size = DIRENT_SIZE + entry.name.len() as u64;
        if page_bytes + entry_size + 1 > BLOCK_SIZE {
            pages.push(&entries[start..i]);
            start = i;
            page_bytes = 0;
        }
        page_bytes += entry_size;
    }
    if start < entries.len() {
        pages.push(&entries[start..]);
    }

    let mut buf = Vec::new();
    for (i, page) in pages.iter().enumerate() {
        let mut name_off = (page.len() as u64 * DIRENT_SIZE) as u16;

        for entry in *page {
            let dirent = Dirent {
                nid: entry.nid.into(),
                name_off: name_off.into(),
                file_type: entry.file_type.into(),
                reserved: 0,
            };
            buf.extend_from_slice(dirent.as_bytes());
            name_off += entry.name.len() as u16;
        }

        for entry in *page {
            buf.extend_from_slice(entry.name.as_bytes());
        }

        // Terminate the final name; the reader strips this when computing
        // the last name's length.
        buf.push(0);

        if i < pages.len() - 1 {
            buf.resize(round_up(buf.len() as u64, BLOCK_SIZE) as usize, 0);
        }
    }

    buf
}

#[cfg(test)]
mod tests {
    use zerocopy::FromBytes;

    use super::*;

    fn dirent(name: &str, nid: u64) -> PlannedDirent {
        PlannedDirent {
            name: name.to_string(),
            nid,
            file_type: FileType::Regular,
        }
    }

    #[test]
    fn test_insert_sorted_dot_entries() {
        let mut entries = vec![dirent("!bang", 5), dirent("alpha", 6)];
        insert_sorted(&mut entries, ".", 1);
        insert_sorted(&mut entries, "..", 2);

        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["!bang", ".", "..", "alpha"]);
    }

    #[test]
    fn test_encode_single_page() {
        let entries = vec![dirent(".", 0), dirent("a", 1), dirent("bc", 2)];
        let page = encode_dirent_pages(&entries);

        // Three dirents, then ".abc", then the NUL.
        assert_eq!(page.len(), 3 * 12 + 4 + 1);

        let d0 = Dirent::read_from_bytes(&page[..12]).unwrap();
        assert_eq!(d0.name_off.get(), 36);
        assert_eq!(d0.nid.get(), 0);

        let d2 = Dirent::read_from_bytes(&page[24..36]).unwrap();
        assert_eq!(d2.name_off.get(), 38);
        assert_eq!(&page[38..40], b"bc");
        assert_eq!(page[40], 0);
    }

    #[test]
    fn test_encode_page_split() {
        // 300 entries of 12 + 7 bytes each overflow one 4096-byte page.
        let entries: Vec<PlannedDirent> = (0..300)
            .map(|i| dirent(&format!("file{i:03}"), i))
            .collect();
        let pages = encode_dirent_pages(&entries);

        assert!(pages.len() > BLOCK_SIZE as usize);
        // The first page is full and zero-padded to the boundary.
        let d0 = Dirent::read_from_bytes(&pages[..12]).unwrap();
        let per_page = usize::from(d0.name_off.get()) / 12;
        assert!(per_page < 300);

        // The second page starts at the block boundary with its own count.
        let d = Dirent::read_from_bytes(&pages[4096..4108]).unwrap();
        assert_eq!(usize::from(d.name_off.get()) / 12, 300 - per_page);
    }

    #[test]
    fn test_encode_long_names_split() {
        // 212 bytes per entry: 19 fit in the first page (4029 with the NUL),
        // the remaining 11 land unpadded in the second.
        let entries: Vec<PlannedDirent> = (0..30)
            .map(|i| dirent(&format!("{i:0>200}"), i))
            .collect();
        let pages = encode_dirent_pages(&entries);
        assert_eq!(pages.len(), 4096 + 11 * 212 + 1);
        assert_eq!(*pages.last().unwrap(), 0);

        let d0 = Dirent::read_from_bytes(&pages[..12]).unwrap();
        assert_eq!(usize::from(d0.name_off.get()) / 12, 19);
    }
}
