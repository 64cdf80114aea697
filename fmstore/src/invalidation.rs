//! Turns a completed mutation into the cache keys it made stale.
//!
//! Executors call [`CacheInvalidationCoordinator::invalidate_for`] after a
//! batch of mutations succeeded. Cached listings are keyed by directory
//! prefix, so each touched location also invalidates every ancestor up to the
//! namespace root.

use std::sync::Arc;

use crate::cache::{CacheRegistry, canonical_archive_path};
use crate::error::Result;
use crate::locator::Locator;

/// A finished file operation and the locations it touched.
#[derive(Clone, Debug)]
pub enum Mutation {
    Create(Locator),
    Delete(Vec<Locator>),
    Copy {
        sources: Vec<Locator>,
        dest_dir: Locator,
    },
    Move {
        sources: Vec<Locator>,
        dest_dir: Locator,
    },
    /// An archive file was written, optionally from `sources`.
    Archive {
        archive: Locator,
        sources: Vec<Locator>,
    },
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Create(_) => "create",
            Mutation::Delete(_) => "delete",
            Mutation::Copy { .. } => "copy",
            Mutation::Move { .. } => "move",
            Mutation::Archive { .. } => "archive",
        }
    }

    /// Every location whose cached state may now be wrong.
    pub fn affected(&self) -> Vec<Locator> {
        let mut out = Vec::new();
        let push_with_parent = |loc: &Locator, out: &mut Vec<Locator>| {
            out.extend(loc.parent());
            out.push(loc.clone());
        };
        match self {
            Mutation::Create(path) => push_with_parent(path, &mut out),
            Mutation::Delete(paths) => {
                for path in paths {
                    push_with_parent(path, &mut out);
                }
            }
            Mutation::Copy { sources, dest_dir } => {
                out.push(dest_dir.clone());
                out.extend(sources.iter().map(|s| dest_dir.join(&s.name())));
            }
            Mutation::Move { sources, dest_dir } => {
                out.push(dest_dir.clone());
                for source in sources {
                    push_with_parent(source, &mut out);
                    out.push(dest_dir.join(&source.name()));
                }
            }
            Mutation::Archive { archive, sources } => {
                push_with_parent(archive, &mut out);
                out.extend(sources.iter().filter_map(Locator::parent));
            }
        }
        out
    }
}

/// Resources whose cached listing or stat covers `key`: the key itself, its
/// directory form, then each ancestor prefix in both forms, ending with the
/// bucket root `""`.
pub fn key_lineage(key: &str) -> Vec<String> {
    let key = key.trim_matches('/');
    let mut out = Vec::new();
    if key.is_empty() {
        out.push(String::new());
        return out;
    }
    out.push(key.to_string());
    out.push(format!("{key}/"));
    let mut rest = key;
    while let Some(idx) = rest.rfind('/') {
        rest = &rest[..idx];
        out.push(format!("{rest}/"));
        out.push(rest.to_string());
    }
    out.push(String::new());
    out
}

/// Same as [`key_lineage`] for absolute posix paths, ending with `/`.
pub fn posix_lineage(path: &str) -> Vec<String> {
    let mut out = vec![path.to_string()];
    let mut rest = path.trim_end_matches('/');
    while let Some(idx) = rest.rfind('/') {
        rest = &rest[..idx];
        out.push(if rest.is_empty() { "/".to_string() } else { rest.to_string() });
    }
    out.dedup();
    out
}

pub fn archive_namespace(archive_path: &std::path::Path) -> String {
    format!("archive:{}", archive_path.display())
}

/// Drops cached state for one location and all of its ancestors.
pub(crate) fn invalidate_location(registry: &CacheRegistry, loc: &Locator) -> Result<()> {
    let cache = registry.metadata();
    match loc {
        Locator::ObjectStore(o) => {
            let ns = o.namespace();
            for res in key_lineage(&o.key) {
                cache.invalidate_key(&ns, &res);
            }
            if !o.is_bucket_root() {
                cache.invalidate_prefix(&ns, &o.list_prefix());
            }
        }
        Locator::RemoteShell(s) => {
            let ns = s.namespace();
            for res in posix_lineage(&s.path) {
                cache.invalidate_key(&ns, &res);
            }
            if s.path != "/" {
                cache.invalidate_prefix(&ns, &format!("{}/", s.path));
            }
        }
        Locator::Local(l) => {
            // A rewritten or removed local path may be, or contain, an
            // archive someone has open.
            let path = canonical_archive_path(&l.path)?;
            registry.archives().invalidate_under(&path);
            cache.invalidate_namespace_tree(&archive_namespace(&path));
        }
        Locator::Archive(a) => {
            let path = canonical_archive_path(&a.archive_path)?;
            registry.archives().invalidate(&path);
            cache.invalidate_namespace(&archive_namespace(&path));
        }
    }
    Ok(())
}

pub struct CacheInvalidationCoordinator {
    registry: Arc<CacheRegistry>,
}

impl CacheInvalidationCoordinator {
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self { registry }
    }

    /// Never fails: a location that cannot be invalidated is logged and
    /// skipped, leaving it to expire by ttl.
    pub fn invalidate_for(&self, mutation: &Mutation) {
        let affected = mutation.affected();
        tracing::debug!(
            "invalidating {} locations after {}",
            affected.len(),
            mutation.kind()
        );
        for loc in &affected {
            if let Err(err) = invalidate_location(&self.registry, loc) {
                tracing::warn!("cache invalidation for {loc} after {} failed: {err}", mutation.kind());
            }
        }
    }
}
