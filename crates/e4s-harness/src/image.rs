//! In-memory ext4 image tree.
//!
//! Only what the binding layer can observe is modelled: a tree of
//! directories and regular files with inode numbers, `i_mode`, ownership
//! and timestamps. Errors are the engine's message strings.

use e4s_types::{DirEntry, InodeNumber, PERMISSION_MASK, S_IFDIR, S_IFREG, Stat};
use std::collections::HashMap;

pub(crate) type OpResult<T> = Result<T, String>;

pub(crate) const ROOT_INODE: u64 = 2;
/// First inode handed out for user-created entries.
pub(crate) const FIRST_USER_INODE: u64 = 12;
const EPOCH_START: i64 = 1_700_000_000;

pub(crate) const MSG_NOT_ABSOLUTE_NAMEI: &str = "Path must be absolute (e.g. /dir/file)";
pub(crate) const MSG_NOT_ABSOLUTE: &str = "Path must be absolute";
pub(crate) const MSG_NAMEI_NOT_FOUND: &str = "namei failed: File not found by ext2_lookup";
pub(crate) const MSG_NAMEI_NOT_DIR: &str = "namei failed: Ext2 inode is not a directory";
pub(crate) const MSG_EMPTY_BASENAME: &str = "Empty basename";
pub(crate) const MSG_NOT_FOUND: &str = "Not found";
pub(crate) const MSG_NOT_A_DIRECTORY: &str = "Not a directory";
pub(crate) const MSG_IS_A_DIRECTORY: &str = "Is a directory";
pub(crate) const MSG_SEGMENT_NOT_DIR: &str = "Path segment exists and is not a directory";
pub(crate) const MSG_TARGET_IS_DIR: &str = "Target exists and is a directory";
pub(crate) const MSG_TARGET_EXISTS: &str = "Target name already exists";
pub(crate) const MSG_DIR_NOT_EMPTY: &str = "unlink failed: Directory not empty";

#[derive(Debug, Clone)]
enum Body {
    File(Vec<u8>),
    /// Entries in insertion order. `.` and `..` are not stored; listings
    /// synthesize them from the node and its parent.
    Dir(Vec<(String, u64)>),
}

#[derive(Debug, Clone)]
struct Node {
    mode: u16,
    uid: u32,
    gid: u32,
    atime: i64,
    mtime: i64,
    ctime: i64,
    parent: u64,
    body: Body,
}

impl Node {
    fn is_dir(&self) -> bool {
        matches!(self.body, Body::Dir(_))
    }
}

/// One formatted image.
#[derive(Debug, Clone)]
pub(crate) struct MemImage {
    nodes: HashMap<u64, Node>,
    next_inode: u64,
    clock: i64,
    pub(crate) size_bytes: u64,
    pub(crate) block_size: u32,
    pub(crate) label: String,
    pub(crate) uuid: String,
}

impl MemImage {
    pub(crate) fn new(size_bytes: u64, block_size: u32, label: &str, uuid: &str) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INODE,
            Node {
                mode: S_IFDIR | 0o755,
                uid: 0,
                gid: 0,
                atime: EPOCH_START,
                mtime: EPOCH_START,
                ctime: EPOCH_START,
                parent: ROOT_INODE,
                body: Body::Dir(Vec::new()),
            },
        );
        Self {
            nodes,
            next_inode: FIRST_USER_INODE,
            clock: EPOCH_START,
            size_bytes,
            block_size,
            label: label.to_owned(),
            uuid: uuid.to_owned(),
        }
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn node(&self, ino: u64) -> OpResult<&Node> {
        self.nodes
            .get(&ino)
            .ok_or_else(|| "read_inode failed".to_owned())
    }

    fn children(&self, dir: u64) -> Option<&Vec<(String, u64)>> {
        match &self.nodes.get(&dir)?.body {
            Body::Dir(entries) => Some(entries),
            Body::File(_) => None,
        }
    }

    fn children_mut(&mut self, dir: u64) -> OpResult<&mut Vec<(String, u64)>> {
        match self.nodes.get_mut(&dir).map(|n| &mut n.body) {
            Some(Body::Dir(entries)) => Ok(entries),
            _ => Err(MSG_NAMEI_NOT_DIR.to_owned()),
        }
    }

    fn lookup(&self, dir: u64, name: &str) -> Option<u64> {
        self.children(dir)?
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, ino)| *ino)
    }

    /// Resolve an absolute path. Empty and `/` are the root.
    fn resolve(&self, path: &str) -> OpResult<u64> {
        if path.is_empty() || path == "/" {
            return Ok(ROOT_INODE);
        }
        if !path.starts_with('/') {
            return Err(MSG_NOT_ABSOLUTE_NAMEI.to_owned());
        }
        let mut cur = ROOT_INODE;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let node = self.node(cur)?;
            if !node.is_dir() {
                return Err(MSG_NAMEI_NOT_DIR.to_owned());
            }
            cur = match segment {
                "." => cur,
                ".." => node.parent,
                name => self
                    .lookup(cur, name)
                    .ok_or_else(|| MSG_NAMEI_NOT_FOUND.to_owned())?,
            };
        }
        Ok(cur)
    }

    fn split(path: &str) -> OpResult<(&str, &str)> {
        if !path.starts_with('/') {
            return Err(MSG_NOT_ABSOLUTE.to_owned());
        }
        let idx = path.rfind('/').unwrap_or(0);
        let base = &path[idx + 1..];
        if base.is_empty() {
            return Err(MSG_EMPTY_BASENAME.to_owned());
        }
        let parent = if idx == 0 { "/" } else { &path[..idx] };
        Ok((parent, base))
    }

    fn alloc(&mut self, parent: u64, mode: u16, body: Body) -> u64 {
        let ino = self.next_inode;
        self.next_inode += 1;
        let now = self.tick();
        self.nodes.insert(
            ino,
            Node {
                mode,
                uid: 0,
                gid: 0,
                atime: now,
                mtime: now,
                ctime: now,
                parent,
                body,
            },
        );
        ino
    }

    fn size_of(&self, node: &Node) -> u64 {
        match &node.body {
            Body::File(data) => data.len() as u64,
            Body::Dir(_) => u64::from(self.block_size),
        }
    }

    /// Directory records in on-disk order: `.`, `..`, then the children in
    /// the order they were linked.
    pub(crate) fn list(&self, path: &str) -> OpResult<Vec<DirEntry>> {
        let ino = self.resolve(path)?;
        let entries = self
            .children(ino)
            .ok_or_else(|| MSG_NOT_A_DIRECTORY.to_owned())?;
        let parent = self.node(ino)?.parent;
        [(".", ino), ("..", parent)]
            .into_iter()
            .chain(entries.iter().map(|(name, child)| (name.as_str(), *child)))
            .map(|(name, child)| {
                let node = self.node(child)?;
                Ok(DirEntry {
                    name: name.to_owned(),
                    inode: InodeNumber(child),
                    is_dir: node.is_dir(),
                    size: self.size_of(node),
                    mode: node.mode,
                })
            })
            .collect()
    }

    pub(crate) fn stat(&self, path: &str) -> OpResult<Stat> {
        let ino = self.resolve(path)?;
        let node = self.node(ino)?;
        Ok(Stat {
            inode: InodeNumber(ino),
            is_dir: node.is_dir(),
            size: self.size_of(node),
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            atime: node.atime,
            mtime: node.mtime,
            ctime: node.ctime,
        })
    }

    /// Up to `capacity` bytes of the file at `path`.
    pub(crate) fn read(&self, path: &str, capacity: usize) -> OpResult<&[u8]> {
        let ino = self.resolve(path)?;
        match &self.node(ino)?.body {
            Body::File(data) => Ok(&data[..data.len().min(capacity)]),
            Body::Dir(_) => Err(MSG_IS_A_DIRECTORY.to_owned()),
        }
    }

    /// Create every missing directory along `path`.
    pub(crate) fn mkdirs(&mut self, path: &str, mode: u16) -> OpResult<u64> {
        if !path.starts_with('/') {
            return Err(MSG_NOT_ABSOLUTE.to_owned());
        }
        let mut cur = ROOT_INODE;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            cur = match self.lookup(cur, segment) {
                Some(existing) => {
                    if !self.node(existing)?.is_dir() {
                        return Err(MSG_SEGMENT_NOT_DIR.to_owned());
                    }
                    existing
                }
                None => {
                    let ino = self.alloc(cur, S_IFDIR | mode, Body::Dir(Vec::new()));
                    self.children_mut(cur)?.push((segment.to_owned(), ino));
                    ino
                }
            };
        }
        Ok(cur)
    }

    /// Replace the content of the file at `path`, creating it and its
    /// parents if needed. An existing file keeps its mode.
    pub(crate) fn write_overwrite(&mut self, path: &str, data: &[u8], mode: u16) -> OpResult<()> {
        let (parent, base) = Self::split(path)?;
        let parent_ino = self.mkdirs(parent, 0o755)?;
        let now = self.tick();
        match self.lookup(parent_ino, base) {
            Some(existing) => {
                let node = self
                    .nodes
                    .get_mut(&existing)
                    .ok_or_else(|| "read_inode failed".to_owned())?;
                match &mut node.body {
                    Body::File(content) => {
                        content.clear();
                        content.extend_from_slice(data);
                    }
                    Body::Dir(_) => return Err(MSG_TARGET_IS_DIR.to_owned()),
                }
                node.mtime = now;
                node.ctime = now;
            }
            None => {
                let ino = self.alloc(
                    parent_ino,
                    S_IFREG | (mode & PERMISSION_MASK),
                    Body::File(data.to_vec()),
                );
                self.children_mut(parent_ino)?.push((base.to_owned(), ino));
            }
        }
        Ok(())
    }

    /// Unlink a file or an empty directory.
    pub(crate) fn remove(&mut self, path: &str) -> OpResult<()> {
        let (parent, base) = Self::split(path)?;
        let parent_ino = self.resolve(parent)?;
        let child = self
            .lookup(parent_ino, base)
            .ok_or_else(|| MSG_NOT_FOUND.to_owned())?;
        if self.children(child).is_some_and(|entries| !entries.is_empty()) {
            return Err(MSG_DIR_NOT_EMPTY.to_owned());
        }
        self.children_mut(parent_ino)?
            .retain(|(name, _)| name != base);
        self.nodes.remove(&child);
        Ok(())
    }

    /// Rename within the parent directory. The new name is linked after the
    /// existing entries, as ext2fs_link does.
    pub(crate) fn rename(&mut self, path: &str, new_name: &str) -> OpResult<()> {
        let (parent, base) = Self::split(path)?;
        let parent_ino = self.resolve(parent)?;
        let child = self
            .lookup(parent_ino, base)
            .ok_or_else(|| MSG_NOT_FOUND.to_owned())?;
        if self.lookup(parent_ino, new_name).is_some() {
            return Err(MSG_TARGET_EXISTS.to_owned());
        }
        let now = self.tick();
        let entries = self.children_mut(parent_ino)?;
        entries.retain(|(name, _)| name != base);
        entries.push((new_name.to_owned(), child));
        if let Some(node) = self.nodes.get_mut(&child) {
            node.ctime = now;
        }
        Ok(())
    }
}
