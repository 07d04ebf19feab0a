//! The mount table: the sole authority for name resolution.
//!
//! A mount point maps to an ordered list of sources, searched first to
//! last. A source is either the root of a remote 9P tree or a bind onto
//! another local path. `bind`, `mount` and `unmount` all reduce to edits
//! of this table; the worker owns the single instance and serialises all
//! mutation.

use std::collections::{HashMap, HashSet};

use bitflags::bitflags;
use log::debug;

use crate::error::{Error, errno::*};
use crate::utils::Result;

/// Longest accepted path, in bytes.
const PATH_MAX: usize = 4096;

bitflags! {
    /// Mount placement and decoration flags.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct MountFlag: u32 {
        #[doc = "Replace the sources at the mount point"]
        const REPL      = 1;
        #[doc = "Place at the start of the search order"]
        const BEFORE    = 2;
        #[doc = "Place at the end of the search order"]
        const AFTER     = 4;
        #[doc = "Files may be created through this source"]
        const CREATE    = 8;
        #[doc = "The client may cache content from this source"]
        const CACHE     = 16;
    }
}

/// Identifies one 9P conversation owned by the worker.
pub type ConvId = u32;

/// What a mount-table source points at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// The root of an attached remote tree.
    Remote {
        conv: ConvId,
        root_fid: u32,
        aname: String,
    },
    /// A graft onto another local path.
    Bind { path: String },
}

/// One provider behind a mount point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Source {
    pub kind: SourceKind,
    pub flags: MountFlag,
}

impl Source {
    /// The name `unmount` selects this source by: the bound path for
    /// binds, the attach name for remote trees.
    fn matches(&self, name: &str) -> bool {
        match self.kind {
            SourceKind::Bind { ref path } => path == name,
            SourceKind::Remote { ref aname, .. } => aname == name,
        }
    }
}

/// Where a path resolves to, in search order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Candidate {
    /// Walk `walk` from `root_fid` on conversation `conv`.
    Remote {
        conv: ConvId,
        root_fid: u32,
        walk: Vec<String>,
        flags: MountFlag,
    },
    /// The path rewritten through binds, with no remote tree behind it.
    Local { path: String, flags: MountFlag },
}

impl Candidate {
    pub fn flags(&self) -> MountFlag {
        match *self {
            Candidate::Remote { flags, .. } | Candidate::Local { flags, .. } => flags,
        }
    }
}

enum Placement {
    Replace,
    Before,
    After,
}

fn placement(flags: MountFlag) -> Result<Placement> {
    let order = flags & (MountFlag::REPL | MountFlag::BEFORE | MountFlag::AFTER);
    if order == MountFlag::BEFORE {
        Ok(Placement::Before)
    } else if order == MountFlag::AFTER {
        Ok(Placement::After)
    } else if order == MountFlag::REPL || order.is_empty() {
        // Absent any placement flag the mount replaces.
        Ok(Placement::Replace)
    } else {
        Err(Error::No(EINVAL))
    }
}

/// Canonicalise a mount path: absolute, no empty, `.` or `..` elements,
/// no trailing slash (except the root itself).
fn canon(path: &str) -> Result<String> {
    if path.len() > PATH_MAX {
        return Err(Error::No(ENAMETOOLONG));
    }
    if !path.starts_with('/') {
        return Err(Error::No(EINVAL));
    }
    if path == "/" {
        return Ok(path.to_owned());
    }
    let mut out = String::with_capacity(path.len());
    for elem in path.trim_end_matches('/').split('/').skip(1) {
        if elem.is_empty() || elem == "." || elem == ".." {
            return Err(Error::No(EINVAL));
        }
        out.push('/');
        out.push_str(elem);
    }
    Ok(out)
}

fn join(prefix: &str, remainder: &str) -> String {
    if remainder.is_empty() {
        prefix.to_owned()
    } else if prefix == "/" {
        format!("/{}", remainder)
    } else {
        format!("{}/{}", prefix, remainder)
    }
}

/// The table itself: canonical mount point to ordered source list.
#[derive(Debug, Default)]
pub struct Namespace {
    table: HashMap<String, Vec<Source>>,
}

impl Namespace {
    pub fn new() -> Namespace {
        Namespace::default()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Graft `name`'s resolution onto the mount point `old`. Returns the
    /// sources a replacing placement displaced, so their root fids can be
    /// clunked.
    pub fn bind(&mut self, name: &str, old: &str, flags: MountFlag) -> Result<Vec<Source>> {
        let name = canon(name)?;
        let old = canon(old)?;
        let source = Source {
            kind: SourceKind::Bind { path: name },
            flags,
        };

        // Keep enough state around to undo the graft if it closes a loop.
        let previous = self.table.get(&old).cloned();
        let displaced = self.attach(old.clone(), source, flags)?;

        if let Err(e) = self.resolve(&old) {
            match previous {
                Some(sources) => {
                    self.table.insert(old, sources);
                }
                None => {
                    self.table.remove(&old);
                }
            }
            return Err(e);
        }
        Ok(displaced)
    }

    /// Associate an attached remote tree with the mount point `old`.
    /// Returns the sources the placement displaced, so their root fids can
    /// be clunked.
    pub fn mount_remote(
        &mut self,
        old: &str,
        conv: ConvId,
        root_fid: u32,
        aname: &str,
        flags: MountFlag,
    ) -> Result<Vec<Source>> {
        let old = canon(old)?;
        let source = Source {
            kind: SourceKind::Remote {
                conv,
                root_fid,
                aname: aname.to_owned(),
            },
            flags,
        };
        self.attach(old, source, flags)
    }

    fn attach(&mut self, old: String, source: Source, flags: MountFlag) -> Result<Vec<Source>> {
        let place = placement(flags)?;
        let sources = self.table.entry(old.clone()).or_default();
        let displaced = match place {
            Placement::Replace => {
                let previous = std::mem::take(sources);
                sources.push(source);
                previous
            }
            Placement::Before => {
                sources.insert(0, source);
                Vec::new()
            }
            Placement::After => {
                sources.push(source);
                Vec::new()
            }
        };
        debug!("{} now has {} source(s)", old, sources.len());
        Ok(displaced)
    }

    /// Remove sources mounted at `old`: all of them when `name` is None,
    /// otherwise only the named one. The removed sources are handed back
    /// for fid cleanup.
    pub fn unmount(&mut self, name: Option<&str>, old: &str) -> Result<Vec<Source>> {
        let old = canon(old)?;
        let sources = self.table.get_mut(&old).ok_or(Error::No(ENOENT))?;

        let removed = match name {
            None => std::mem::take(sources),
            Some(name) => {
                let matched = canon(name).ok();
                let selector =
                    |s: &Source| s.matches(name) || matched.as_deref().is_some_and(|n| s.matches(n));
                let (gone, kept) = std::mem::take(sources).into_iter().partition(selector);
                *sources = kept;
                gone
            }
        };

        if sources.is_empty() {
            self.table.remove(&old);
        }
        if removed.is_empty() {
            return Err(Error::No(ENOENT));
        }
        Ok(removed)
    }

    /// Remove every source from the table, for shutdown teardown.
    pub fn drain(&mut self) -> Vec<Source> {
        self.table.drain().flat_map(|(_, sources)| sources).collect()
    }

    /// Whether any surviving source still references the conversation.
    pub fn references_conv(&self, conv: ConvId) -> bool {
        self.table.values().flatten().any(|s| {
            matches!(s.kind, SourceKind::Remote { conv: c, .. } if c == conv)
        })
    }

    /// Drop every source served by a torn conversation.
    pub fn sever_conv(&mut self, conv: ConvId) {
        self.table.retain(|_, sources| {
            sources.retain(|s| !matches!(s.kind, SourceKind::Remote { conv: c, .. } if c == conv));
            !sources.is_empty()
        });
    }

    /// Resolve `path` to its providers, in search order.
    pub fn resolve(&self, path: &str) -> Result<Vec<Candidate>> {
        let path = canon(path)?;
        let mut out = Vec::new();
        self.resolve_into(&path, MountFlag::empty(), &mut HashSet::new(), &mut out)?;
        Ok(out)
    }

    /// Like [`resolve`](Self::resolve), but restricted to sources files
    /// may be created through.
    pub fn resolve_for_create(&self, path: &str) -> Result<Vec<Candidate>> {
        let mut candidates = self.resolve(path)?;
        candidates.retain(|c| c.flags().contains(MountFlag::CREATE));
        Ok(candidates)
    }

    fn resolve_into(
        &self,
        path: &str,
        inherited: MountFlag,
        visited: &mut HashSet<String>,
        out: &mut Vec<Candidate>,
    ) -> Result<()> {
        let Some((point, remainder)) = self.mount_point_of(path) else {
            out.push(Candidate::Local {
                path: path.to_owned(),
                flags: inherited,
            });
            return Ok(());
        };

        if !visited.insert(point.to_owned()) {
            return Err(Error::No(ELOOP));
        }

        for source in &self.table[point] {
            match source.kind {
                SourceKind::Remote {
                    conv, root_fid, ..
                } => out.push(Candidate::Remote {
                    conv,
                    root_fid,
                    walk: remainder
                        .split('/')
                        .filter(|e| !e.is_empty())
                        .map(str::to_owned)
                        .collect(),
                    flags: source.flags,
                }),
                SourceKind::Bind { ref path } => {
                    let rewritten = join(path, remainder);
                    self.resolve_into(&rewritten, source.flags, visited, out)?;
                }
            }
        }

        visited.remove(point);
        Ok(())
    }

    /// The longest mount point that is `path` or an ancestor of it,
    /// with the un-matched remainder.
    fn mount_point_of<'a>(&self, path: &'a str) -> Option<(&str, &'a str)> {
        self.table
            .keys()
            .filter(|point| {
                path == *point
                    || (path.starts_with(point.as_str())
                        && (*point == "/" || path.as_bytes()[point.len()] == b'/'))
            })
            .max_by_key(|point| point.len())
            .map(|point| {
                let rest = path[point.len()..].trim_start_matches('/');
                (point.as_str(), rest)
            })
    }

    #[cfg(test)]
    fn source_names(&self, old: &str) -> Vec<String> {
        self.table
            .get(old)
            .map(|sources| {
                sources
                    .iter()
                    .map(|s| match s.kind {
                        SourceKind::Bind { ref path } => path.clone(),
                        SourceKind::Remote { ref aname, .. } => aname.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_order_placement() {
        let mut ns = Namespace::new();
        ns.bind("/a", "/n", MountFlag::REPL).unwrap();
        ns.bind("/b", "/n", MountFlag::AFTER).unwrap();
        assert_eq!(ns.source_names("/n"), ["/a", "/b"]);

        ns.bind("/c", "/n", MountFlag::BEFORE).unwrap();
        assert_eq!(ns.source_names("/n"), ["/c", "/a", "/b"]);

        ns.bind("/a", "/n", MountFlag::AFTER).unwrap();
        ns.bind("/d", "/n", MountFlag::REPL).unwrap();
        assert_eq!(ns.source_names("/n"), ["/d"]);
    }

    #[test]
    fn flagless_bind_replaces() {
        let mut ns = Namespace::new();
        ns.bind("/a", "/n", MountFlag::empty()).unwrap();
        ns.bind("/b", "/n", MountFlag::empty()).unwrap();
        assert_eq!(ns.source_names("/n"), ["/b"]);
    }

    #[test]
    fn conflicting_placement_flags() {
        let mut ns = Namespace::new();
        let err = ns
            .bind("/a", "/n", MountFlag::BEFORE | MountFlag::AFTER)
            .unwrap_err();
        assert_eq!(err.errno(), EINVAL);
    }

    #[test]
    fn bind_grafts_resolution() {
        let mut ns = Namespace::new();
        ns.bind("/tmp", "/var/tmp", MountFlag::REPL).unwrap();

        let candidates = ns.resolve("/var/tmp/x").unwrap();
        assert_eq!(
            candidates,
            vec![Candidate::Local {
                path: "/tmp/x".to_owned(),
                flags: MountFlag::REPL,
            }]
        );
    }

    #[test]
    fn longest_prefix_wins() {
        let mut ns = Namespace::new();
        ns.bind("/one", "/n", MountFlag::REPL).unwrap();
        ns.bind("/two", "/n/sub", MountFlag::REPL).unwrap();

        let candidates = ns.resolve("/n/sub/x").unwrap();
        assert_eq!(
            candidates,
            vec![Candidate::Local {
                path: "/two/x".to_owned(),
                flags: MountFlag::REPL,
            }]
        );
    }

    #[test]
    fn bind_cycle_detected() {
        let mut ns = Namespace::new();
        ns.bind("/a", "/b", MountFlag::REPL).unwrap();
        let err = ns.bind("/b", "/a", MountFlag::REPL).unwrap_err();
        assert_eq!(err.errno(), ELOOP);

        // the failed bind must not be left behind
        assert_eq!(ns.len(), 1);
    }

    #[test]
    fn self_bind_is_a_cycle() {
        let mut ns = Namespace::new();
        let err = ns.bind("/a", "/a", MountFlag::REPL).unwrap_err();
        assert_eq!(err.errno(), ELOOP);
        assert_eq!(ns.len(), 0);
    }

    #[test]
    fn remote_sources_resolve_with_walk() {
        let mut ns = Namespace::new();
        ns.mount_remote("/n", 3, 0, "export", MountFlag::REPL)
            .unwrap();

        let candidates = ns.resolve("/n/usr/bin").unwrap();
        assert_eq!(
            candidates,
            vec![Candidate::Remote {
                conv: 3,
                root_fid: 0,
                walk: vec!["usr".to_owned(), "bin".to_owned()],
                flags: MountFlag::REPL,
            }]
        );
    }

    #[test]
    fn mount_repl_reports_displaced_sources() {
        let mut ns = Namespace::new();
        ns.mount_remote("/n", 1, 7, "a", MountFlag::REPL).unwrap();
        let displaced = ns.mount_remote("/n", 2, 9, "b", MountFlag::REPL).unwrap();
        assert_eq!(displaced.len(), 1);
        assert!(
            matches!(displaced[0].kind, SourceKind::Remote { conv: 1, root_fid: 7, .. })
        );
    }

    #[test]
    fn create_needs_mcreate() {
        let mut ns = Namespace::new();
        ns.mount_remote("/n", 1, 0, "ro", MountFlag::REPL).unwrap();
        ns.mount_remote("/n", 2, 0, "rw", MountFlag::AFTER | MountFlag::CREATE)
            .unwrap();

        let all = ns.resolve("/n/f").unwrap();
        assert_eq!(all.len(), 2);

        let writable = ns.resolve_for_create("/n/f").unwrap();
        assert_eq!(writable.len(), 1);
        assert!(matches!(writable[0], Candidate::Remote { conv: 2, .. }));
    }

    #[test]
    fn unmount_selects_by_name() {
        let mut ns = Namespace::new();
        ns.bind("/a", "/n", MountFlag::REPL).unwrap();
        ns.bind("/b", "/n", MountFlag::AFTER).unwrap();

        let removed = ns.unmount(Some("/a"), "/n").unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(ns.source_names("/n"), ["/b"]);

        let err = ns.unmount(Some("/a"), "/n").unwrap_err();
        assert_eq!(err.errno(), ENOENT);

        ns.unmount(None, "/n").unwrap();
        assert_eq!(ns.len(), 0);
        assert_eq!(ns.unmount(None, "/n").unwrap_err().errno(), ENOENT);
    }

    #[test]
    fn paths_are_canonicalised() {
        let mut ns = Namespace::new();
        ns.bind("/a", "/n//x", MountFlag::REPL).unwrap_err();
        ns.bind("/a/", "/n/", MountFlag::REPL).unwrap();
        assert_eq!(ns.source_names("/n"), ["/a"]);

        assert_eq!(
            ns.bind("relative", "/n", MountFlag::REPL)
                .unwrap_err()
                .errno(),
            EINVAL
        );
        assert_eq!(
            ns.bind("/x/../y", "/n", MountFlag::REPL)
                .unwrap_err()
                .errno(),
            EINVAL
        );

        let long = format!("/{}", "a".repeat(PATH_MAX));
        assert_eq!(
            ns.bind(&long, "/n", MountFlag::REPL).unwrap_err().errno(),
            ENAMETOOLONG
        );
    }
}
