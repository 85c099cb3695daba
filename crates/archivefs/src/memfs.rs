//! An in-memory filesystem.
//!
//! [`MemoryFilesystem`] is a `BTreeMap`-backed tree implementing
//! [`FileSystem`].  It serves as a source for image creation and as the
//! reference collaborator in tests: build a tree with the `add_*` methods,
//! hand it to the writer, then compare the walk of the resulting image
//! against the walk of the tree.

use std::collections::{BTreeMap, VecDeque};
use std::io::{Cursor, Read};

use crate::fs::{
    clean_path, split_path, DirEntry, Error, FileInfo, FileSystem, FileType, ReadableFile, Result,
    S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
};

const MAX_SYMLINK_HOPS: u32 = 40;

/// File metadata supplied when adding nodes, similar to `struct stat`.
/// `st_mode` carries permission bits only; the type bits come from the kind
/// of node being added.
#[derive(Clone, Debug)]
pub struct Stat {
    pub st_mode: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_mtim_sec: i64,
    pub st_mtim_nsec: u32,
}

impl Default for Stat {
    fn default() -> Self {
        Stat {
            st_mode: 0o755,
            st_uid: 0,
            st_gid: 0,
            st_mtim_sec: 0,
            st_mtim_nsec: 0,
        }
    }
}

#[derive(Clone, Debug)]
struct Directory {
    stat: Stat,
    entries: BTreeMap<String, Node>,
}

#[derive(Clone, Debug)]
enum Node {
    Directory(Directory),
    File { stat: Stat, data: Vec<u8> },
    Symlink { stat: Stat, target: String },
}

impl Node {
    fn stat(&self) -> &Stat {
        match self {
            Node::Directory(dir) => &dir.stat,
            Node::File { stat, .. } => stat,
            Node::Symlink { stat, .. } => stat,
        }
    }

    fn file_type(&self) -> FileType {
        match self {
            Node::Directory(_) => FileType::Directory,
            Node::File { .. } => FileType::Regular,
            Node::Symlink { .. } => FileType::Symlink,
        }
    }

    fn mode(&self) -> u32 {
        let ifmt = match self {
            Node::Directory(_) => S_IFDIR,
            Node::File { .. } => S_IFREG,
            Node::Symlink { .. } => S_IFLNK,
        };
        ifmt | (self.stat().st_mode & !S_IFMT)
    }

    fn size(&self) -> u64 {
        match self {
            Node::Directory(_) => 0,
            Node::File { data, .. } => data.len() as u64,
            Node::Symlink { target, .. } => target.len() as u64,
        }
    }

    fn file_info(&self, name: &str) -> FileInfo {
        let stat = self.stat();
        let nlink = match self {
            Node::Directory(dir) => dir.entries.len() as u32 + 2,
            _ => 1,
        };
        FileInfo {
            name: name.to_string(),
            size: self.size(),
            mode: self.mode(),
            mtime: stat.st_mtim_sec,
            mtime_nsec: stat.st_mtim_nsec,
            uid: stat.st_uid,
            gid: stat.st_gid,
            nlink,
            ino: 0,
        }
    }
}

/// An in-memory [`FileSystem`].
#[derive(Clone, Debug)]
pub struct MemoryFilesystem {
    root: Node,
}

impl Default for MemoryFilesystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFilesystem {
    /// An empty filesystem whose root has the default stat.
    pub fn new() -> MemoryFilesystem {
        Self::with_root(Stat::default())
    }

    pub fn with_root(stat: Stat) -> MemoryFilesystem {
        MemoryFilesystem {
            root: Node::Directory(Directory {
                stat,
                entries: BTreeMap::new(),
            }),
        }
    }

    /// Adds a directory.  The parent must already exist.
    pub fn add_directory(&mut self, path: &str, stat: Stat) -> Result<()> {
        self.insert(
            path,
            Node::Directory(Directory {
                stat,
                entries: BTreeMap::new(),
            }),
        )
    }

    /// Adds a regular file.  The parent must already exist.
    pub fn add_file(&mut self, path: &str, stat: Stat, data: impl Into<Vec<u8>>) -> Result<()> {
        self.insert(
            path,
            Node::File {
                stat,
                data: data.into(),
            },
        )
    }

    /// Adds a symbolic link.  The parent must already exist.
    pub fn add_symlink(&mut self, path: &str, stat: Stat, target: &str) -> Result<()> {
        self.insert(
            path,
            Node::Symlink {
                stat,
                target: target.to_string(),
            },
        )
    }

    fn insert(&mut self, path: &str, node: Node) -> Result<()> {
        let components = split_path(path);
        let Some((name, parents)) = components.split_last() else {
            return Err(Error::Invalid);
        };
        if name.is_empty() || *name == "." || *name == ".." || name.contains('\0') {
            return Err(Error::Invalid);
        }

        let Node::Directory(root) = &mut self.root else {
            unreachable!("root is always a directory");
        };
        let mut dir = root;
        for comp in parents {
            match dir.entries.get_mut(*comp) {
                Some(Node::Directory(child)) => dir = child,
                Some(_) => return Err(Error::NotADirectory),
                None => return Err(Error::NotFound),
            }
        }

        dir.entries.insert(name.to_string(), node);
        Ok(())
    }

    /// Walks `path` from the root, following symbolic links (except,
    /// optionally, one at the final component).  Returns the final
    /// component's name and node; the root resolves with an empty name.
    fn resolve(&self, path: &str, no_resolve_last_symlink: bool) -> Result<(&str, &Node)> {
        let mut components: VecDeque<String> =
            split_path(path).into_iter().map(String::from).collect();
        let mut walked: Vec<String> = Vec::new();
        let mut entry: (&str, &Node) = ("", &self.root);
        let mut hops = 0u32;

        while let Some(comp) = components.pop_front() {
            if comp == "." {
                continue;
            }
            let is_last = components.is_empty();

            let Node::Directory(dir) = entry.1 else {
                return Err(Error::NotADirectory);
            };
            let (name, child) = dir
                .entries
                .get_key_value(comp.as_str())
                .ok_or(Error::NotFound)?;

            if let Node::Symlink { target, .. } = child {
                if !(no_resolve_last_symlink && is_last) {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(Error::Loop);
                    }

                    let target = clean_path(target);
                    let expansion = match target.strip_prefix('/') {
                        Some(rest) => rest.to_string(),
                        None if walked.is_empty() => target,
                        None => clean_path(&format!("{}/{}", walked.join("/"), target)),
                    };

                    for comp in split_path(&expansion).into_iter().rev() {
                        components.push_front(comp.to_string());
                    }
                    walked.clear();
                    entry = ("", &self.root);
                    continue;
                }
            }

            walked.push(comp);
            entry = (name.as_str(), child);
        }

        Ok(entry)
    }
}

/// An open in-memory file.
pub struct MemoryFile {
    info: FileInfo,
    data: Cursor<Vec<u8>>,
}

impl Read for MemoryFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.data.read(buf)
    }
}

impl ReadableFile for MemoryFile {
    fn stat(&self) -> Result<FileInfo> {
        Ok(self.info.clone())
    }
}

impl FileSystem for MemoryFilesystem {
    fn open(&self, path: &str) -> Result<Box<dyn ReadableFile + '_>> {
        let (name, node) = self.resolve(path, false)?;
        let data = match node {
            Node::File { data, .. } => data.clone(),
            Node::Symlink { target, .. } => target.clone().into_bytes(),
            Node::Directory(_) => Vec::new(),
        };
        Ok(Box::new(MemoryFile {
            info: node.file_info(name),
            data: Cursor::new(data),
        }))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let (_, node) = self.resolve(path, false)?;
        let Node::Directory(dir) = node else {
            return Err(Error::NotADirectory);
        };
        Ok(dir
            .entries
            .iter()
            .map(|(name, node)| DirEntry {
                name: name.clone(),
                file_type: node.file_type(),
            })
            .collect())
    }

    fn stat(&self, path: &str) -> Result<FileInfo> {
        let (name, node) = self.resolve(path, false)?;
        Ok(node.file_info(name))
    }

    fn read_link(&self, path: &str) -> Result<String> {
        let (_, node) = self.resolve(path, true)?;
        match node {
            Node::Symlink { target, .. } => Ok(target.clone()),
            _ => Err(Error::Invalid),
        }
    }

    fn stat_link(&self, path: &str) -> Result<FileInfo> {
        let (name, node) = self.resolve(path, true)?;
        Ok(node.file_info(name))
    }
}
