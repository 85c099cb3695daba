//! End-to-end tests for the EROFS engine: build a tree in memory, write an
//! image, read it back through the public surface, and round-trip it.

use std::io::Read;

use anyhow::Result;
use base64::prelude::{Engine, BASE64_STANDARD};
use sha2::{Digest, Sha256};
use similar_asserts::assert_eq;

use archivefs::{
    erofs::{create_image, open_image},
    memfs::{MemoryFilesystem, Stat},
    Error, FileSystem, FileType,
};

fn stat(mode: u32) -> Stat {
    Stat {
        st_mode: mode,
        ..Stat::default()
    }
}

/// Deterministic pseudo-random content, so digests are stable run to run.
fn content(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        out.extend_from_slice(&seed.to_le_bytes());
    }
    out.truncate(len);
    out
}

const TOYBOX_SIZE: usize = 120_000;

/// A miniature root filesystem in the shape of a toybox image: a busybox
/// style binary reached through two levels of symlinks, an /etc, and a few
/// odds and ends.
fn sample_tree() -> MemoryFilesystem {
    let mut fs = MemoryFilesystem::new();

    fs.add_directory("dev", stat(0o755)).unwrap();
    fs.add_directory("etc", stat(0o755)).unwrap();
    fs.add_file("etc/group", stat(0o644), "root:x:0:\n").unwrap();
    fs.add_file("etc/os-release", stat(0o644), "NAME=mini\n")
        .unwrap();
    fs.add_file("etc/passwd", stat(0o644), "root:x:0:0:root:/root:/bin/sh\n")
        .unwrap();
    fs.add_directory("etc/rc", stat(0o755)).unwrap();
    fs.add_file("etc/resolv.conf", stat(0o644), "nameserver ::1\n")
        .unwrap();
    fs.add_directory("usr", stat(0o755)).unwrap();
    fs.add_directory("usr/bin", stat(0o755)).unwrap();
    fs.add_file("usr/bin/toybox", stat(0o555), content(TOYBOX_SIZE, 42))
        .unwrap();
    fs.add_symlink("usr/bin/sh", stat(0o777), "toybox").unwrap();
    fs.add_symlink("bin", stat(0o777), "usr/bin").unwrap();

    fs
}

fn image_of(fs: &MemoryFilesystem) -> Vec<u8> {
    let mut image = Vec::new();
    create_image(&mut image, fs).unwrap();
    image
}

fn join(base: &str, name: &str) -> String {
    if base == "." {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

/// One node of a recursive walk, carrying everything the round-trip must
/// preserve.  Directory sizes are representation-dependent and excluded.
#[derive(Debug, PartialEq, Eq)]
struct WalkEntry {
    path: String,
    file_type: FileType,
    size: u64,
    permissions: u32,
    mtime: i64,
    uid: u32,
    gid: u32,
    target: Option<String>,
}

fn walk(fs: &impl FileSystem) -> Result<Vec<WalkEntry>> {
    fn visit(fs: &impl FileSystem, path: &str, out: &mut Vec<WalkEntry>) -> Result<()> {
        let info = fs.stat_link(path)?;
        let file_type = info.file_type();
        let target = match file_type {
            FileType::Symlink => Some(fs.read_link(path)?),
            _ => None,
        };
        out.push(WalkEntry {
            path: path.to_string(),
            file_type,
            size: if info.is_dir() { 0 } else { info.size },
            permissions: info.permissions(),
            mtime: info.mtime,
            uid: info.uid,
            gid: info.gid,
            target,
        });
        if info.is_dir() {
            for entry in fs.read_dir(path)? {
                visit(fs, &join(path, &entry.name), out)?;
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    visit(fs, ".", &mut out)?;
    Ok(out)
}

/// Hash over the sorted regular-file paths and their contents: one
/// `<sha256hex>  <path>` line per file, sha256 over the lines, base64.
fn dirhash(fs: &impl FileSystem) -> Result<String> {
    let mut lines = Vec::new();
    for entry in walk(fs)? {
        if entry.file_type != FileType::Regular {
            continue;
        }
        let mut file = fs.open(&entry.path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let digest: String = Sha256::digest(&data)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        lines.push(format!("{digest}  {}\n", entry.path));
    }
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line);
    }
    Ok(format!("h1:{}", BASE64_STANDARD.encode(hasher.finalize())))
}

#[test]
fn test_stat_regular_file() -> Result<()> {
    let image = image_of(&sample_tree());
    let fsys = open_image(image.as_slice())?;

    let info = fsys.stat("/usr/bin/toybox")?;
    assert_eq!(info.name, "toybox");
    assert_eq!(info.size, TOYBOX_SIZE as u64);
    assert_eq!(info.permissions(), 0o555);
    assert!(!info.is_dir());
    assert_eq!(info.uid, 0);
    assert_eq!(info.gid, 0);

    Ok(())
}

#[test]
fn test_open_follows_symlinks() -> Result<()> {
    let image = image_of(&sample_tree());
    let fsys = open_image(image.as_slice())?;

    // bin -> usr/bin, then sh -> toybox.
    let mut file = fsys.open("bin/sh")?;
    let info = file.stat()?;
    assert_eq!(info.name, "toybox");
    assert_eq!(info.permissions(), 0o555);
    assert!(!info.is_dir());

    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    assert_eq!(data.len(), TOYBOX_SIZE);
    assert_eq!(
        Sha256::digest(&data),
        Sha256::digest(content(TOYBOX_SIZE, 42))
    );

    Ok(())
}

#[test]
fn test_read_link_and_stat_link() -> Result<()> {
    let image = image_of(&sample_tree());
    let fsys = open_image(image.as_slice())?;

    assert_eq!(fsys.read_link("bin")?, "usr/bin");

    let info = fsys.stat_link("bin")?;
    assert_eq!(info.name, "bin");
    assert_eq!(info.permissions(), 0o777);
    assert!(!info.is_dir());
    assert_eq!(info.file_type(), FileType::Symlink);
    assert_ne!(info.ino, 0);

    Ok(())
}

#[test]
fn test_read_dir() -> Result<()> {
    let image = image_of(&sample_tree());
    let fsys = open_image(image.as_slice())?;

    let entries = fsys.read_dir("/etc")?;
    let listing: Vec<(String, bool)> = entries
        .into_iter()
        .map(|e| (e.is_dir(), e.name))
        .map(|(is_dir, name)| (name, is_dir))
        .collect();
    assert_eq!(
        listing,
        [
            ("group".to_string(), false),
            ("os-release".to_string(), false),
            ("passwd".to_string(), false),
            ("rc".to_string(), true),
            ("resolv.conf".to_string(), false),
        ]
    );

    for (name, is_dir) in [("group", false), ("rc", true)] {
        assert_eq!(fsys.stat(&format!("etc/{name}"))?.is_dir(), is_dir);
    }

    Ok(())
}

#[test]
fn test_full_walk_matches_source() -> Result<()> {
    let tree = sample_tree();
    let image = image_of(&tree);
    let fsys = open_image(image.as_slice())?;

    let from_image = walk(&fsys)?;
    let from_tree = walk(&tree)?;
    assert_eq!(from_image, from_tree);

    let paths: Vec<&str> = from_image.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(&paths[..5], &[".", "bin", "dev", "etc", "etc/group"]);

    assert_eq!(dirhash(&fsys)?, dirhash(&tree)?);

    Ok(())
}

#[test]
fn test_create_round_trip() -> Result<()> {
    let image_a = image_of(&sample_tree());
    let fsys_a = open_image(image_a.as_slice())?;

    // The opened image is itself a FileSystem, so it can source a new image.
    let mut image_b = Vec::new();
    create_image(&mut image_b, &fsys_a)?;
    let fsys_b = open_image(image_b.as_slice())?;

    assert_eq!(walk(&fsys_a)?, walk(&fsys_b)?);
    assert_eq!(dirhash(&fsys_a)?, dirhash(&fsys_b)?);

    Ok(())
}

#[test]
fn test_file_backed_destination() -> Result<()> {
    let tree = sample_tree();

    let mut file = tempfile::tempfile()?;
    create_image(&mut file, &tree)?;

    // The destination was truncated to a whole number of blocks.
    let len = file.metadata()?.len();
    assert!(len > 0);
    assert_eq!(len % 4096, 0);

    let fsys = open_image(file)?;
    assert_eq!(dirhash(&fsys)?, dirhash(&tree)?);

    Ok(())
}

#[test]
fn test_mtime_preserved() -> Result<()> {
    let mut tree = sample_tree();
    tree.add_file(
        "etc/stamped",
        Stat {
            st_mode: 0o600,
            st_uid: 1000,
            st_gid: 1000,
            st_mtim_sec: 1_700_000_000,
            st_mtim_nsec: 0,
        },
        "when",
    )?;

    let image = image_of(&tree);
    let fsys = open_image(image.as_slice())?;

    let info = fsys.stat("etc/stamped")?;
    assert_eq!(info.mtime, 1_700_000_000);
    assert_eq!(info.uid, 1000);
    assert_eq!(info.gid, 1000);
    assert_eq!(info.permissions(), 0o600);

    assert_eq!(walk(&fsys)?, walk(&tree)?);

    Ok(())
}

#[test]
fn test_empty_tree() -> Result<()> {
    let tree = MemoryFilesystem::new();
    let image = image_of(&tree);
    let fsys = open_image(image.as_slice())?;

    assert!(fsys.read_dir(".")?.is_empty());
    assert!(fsys.stat("/")?.is_dir());
    assert_eq!(walk(&fsys)?.len(), 1);

    Ok(())
}

#[test]
fn test_empty_file_round_trips() -> Result<()> {
    let mut tree = MemoryFilesystem::new();
    tree.add_file("void", stat(0o644), "")?;

    let image = image_of(&tree);
    let fsys = open_image(image.as_slice())?;

    assert_eq!(fsys.stat("void")?.size, 0);
    let mut data = Vec::new();
    fsys.open("void")?.read_to_end(&mut data)?;
    assert!(data.is_empty());

    Ok(())
}

#[test]
fn test_symlink_cycle_fails_with_loop() -> Result<()> {
    let mut tree = MemoryFilesystem::new();
    tree.add_symlink("a", stat(0o777), "b")?;
    tree.add_symlink("b", stat(0o777), "a")?;

    let image = image_of(&tree);
    let fsys = open_image(image.as_slice())?;

    assert!(matches!(fsys.open("a"), Err(Error::Loop)));
    assert!(matches!(fsys.stat("b"), Err(Error::Loop)));
    assert_eq!(fsys.read_link("a")?, "b");

    Ok(())
}

#[test]
fn test_big_directory_round_trips() -> Result<()> {
    let mut tree = MemoryFilesystem::new();
    tree.add_directory("spool", stat(0o755))?;
    for i in 0..500u64 {
        tree.add_file(
            &format!("spool/job-{i:04}"),
            stat(0o644),
            content((i % 37) as usize, i),
        )?;
    }

    let image = image_of(&tree);
    let fsys = open_image(image.as_slice())?;

    assert_eq!(fsys.read_dir("spool")?.len(), 500);
    assert_eq!(fsys.stat("spool")?.nlink, 502);
    assert_eq!(walk(&fsys)?, walk(&tree)?);
    assert_eq!(dirhash(&fsys)?, dirhash(&tree)?);

    assert!(matches!(fsys.stat("spool/job-0500"), Err(Error::NotFound)));

    Ok(())
}

#[test]
fn test_unsupported_source_node() -> Result<()> {
    // A source without the read_link capability can only be imaged if it
    // contains no symlinks.
    struct NoLinks(MemoryFilesystem);

    impl FileSystem for NoLinks {
        fn open(&self, path: &str) -> archivefs::Result<Box<dyn archivefs::ReadableFile + '_>> {
            self.0.open(path)
        }
        fn read_dir(&self, path: &str) -> archivefs::Result<Vec<archivefs::DirEntry>> {
            self.0.read_dir(path)
        }
        fn stat(&self, path: &str) -> archivefs::Result<archivefs::FileInfo> {
            self.0.stat(path)
        }
        fn stat_link(&self, path: &str) -> archivefs::Result<archivefs::FileInfo> {
            self.0.stat_link(path)
        }
    }

    let source = NoLinks(sample_tree());
    let mut image = Vec::new();
    assert!(matches!(
        create_image(&mut image, &source),
        Err(Error::Unsupported(_))
    ));

    let mut plain = MemoryFilesystem::new();
    plain.add_file("data", stat(0o644), "fine")?;
    let source = NoLinks(plain);
    let mut image = Vec::new();
    create_image(&mut image, &source)?;
    assert_eq!(open_image(image.as_slice())?.stat("data")?.size, 4);

    Ok(())
}
