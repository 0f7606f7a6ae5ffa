use std::collections::{HashMap, HashSet};

use super::{Inode, NO_INODE};

/// Name → inode mapping of one directory.
///
/// `populated` tracks which names have a known mapping; a populated
/// name missing from `by_name` is known to not exist. `"."` and
/// `".."` are installed at creation and always populated; they carry
/// inode ids, not owning references (the refcount cascade skips them).
pub(super) struct DirEntries {
    by_name: HashMap<String, Inode>,
    populated: HashSet<String>,
}

impl DirEntries {
    pub(super) fn new(inode: Inode, parent: Inode) -> Self {
        let mut entries = Self {
            by_name: HashMap::new(),
            populated: HashSet::new(),
        };
        entries.set(".", inode);
        entries.set("..", parent);
        entries
    }

    /// Records a mapping for `name`; [NO_INODE] records the name as
    /// known-absent.
    pub(super) fn set(&mut self, name: &str, inode: Inode) {
        if inode == NO_INODE {
            self.by_name.remove(name);
        } else {
            self.by_name.insert(name.to_string(), inode);
        }
        self.populated.insert(name.to_string());
    }

    pub(super) fn is_populated(&self, name: &str) -> bool {
        self.populated.contains(name)
    }

    pub(super) fn get(&self, name: &str) -> Option<Inode> {
        self.by_name.get(name).copied()
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = (&str, Inode)> {
        self.by_name.iter().map(|(name, inode)| (name.as_str(), *inode))
    }
}
