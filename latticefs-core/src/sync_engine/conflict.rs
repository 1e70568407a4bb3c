//! Rebase/merge policy for a `STALE` push (spec §9's Open Question,
//! resolved in SPEC_FULL §4.7): last-writer-wins by `mtime` for file data,
//! union-of-adds/local-authoritative-removes for directories. Left as a
//! trait so a future policy can be swapped in without touching
//! `SyncEngine`'s retry loop.

use crate::remote::RemoteDirEntry;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};

pub struct FileConflict {
    pub local_bytes: Bytes,
    pub local_mtime: u64,
    pub remote_bytes: Bytes,
    pub remote_mtime: u64,
}

pub trait ConflictPolicy: Send + Sync {
    /// Resolves two whole-file byte strings that both claim to be the
    /// current content of the same inode after a STALE push.
    fn resolve_file(&self, conflict: FileConflict) -> Bytes;

    /// Merges a directory's local authoritative entry set with a freshly
    /// pulled remote listing. `removed_locally` holds names this push's
    /// caller explicitly removed since the last successful push; any other
    /// name present only remotely is treated as an addition by some other
    /// writer and kept.
    fn resolve_dir(
        &self,
        local_entries: Vec<(String, u64)>,
        remote_entries: Vec<RemoteDirEntry>,
        removed_locally: &HashSet<String>,
    ) -> Vec<(String, u64, RemoteDirEntry)>;
}

/// The default (and, per SPEC_FULL, only current) policy.
pub struct LastWriterWins;

impl ConflictPolicy for LastWriterWins {
    fn resolve_file(&self, conflict: FileConflict) -> Bytes {
        if conflict.local_mtime >= conflict.remote_mtime {
            conflict.local_bytes
        } else {
            conflict.remote_bytes
        }
    }

    fn resolve_dir(
        &self,
        local_entries: Vec<(String, u64)>,
        remote_entries: Vec<RemoteDirEntry>,
        removed_locally: &HashSet<String>,
    ) -> Vec<(String, u64, RemoteDirEntry)> {
        // This return shape pairs a name with its local inode id (for
        // names we already know about) and a placeholder remote entry;
        // callers (SyncEngine) reconcile the two id spaces. Simpler: build
        // a name -> local_id map and a name -> remote_entry map, union the
        // keys minus removals, preferring the local id when both exist.
        let local_by_name: HashMap<&str, u64> =
            local_entries.iter().map(|(n, id)| (n.as_str(), *id)).collect();
        let remote_by_name: HashMap<&str, &RemoteDirEntry> =
            remote_entries.iter().map(|e| (e.name.as_str(), e)).collect();

        let mut names: HashSet<&str> = local_by_name.keys().copied().collect();
        names.extend(remote_by_name.keys().copied());

        let mut merged = Vec::new();
        for name in names {
            if removed_locally.contains(name) && !local_by_name.contains_key(name) {
                // Locally removed and not re-added locally: respect the
                // removal even if remote still lists it.
                continue;
            }
            if let Some(&local_id) = local_by_name.get(name) {
                // Local is authoritative when we have an opinion, whether
                // or not remote agrees; carry the remote entry along if one
                // exists (useful for kind/child_ref bookkeeping upstream),
                // else a best-effort placeholder.
                let remote_entry = remote_by_name.get(name).copied().cloned().unwrap_or_else(|| RemoteDirEntry {
                    name: name.to_string(),
                    child_ref: crate::remote::RemoteRef(String::new()),
                    kind: crate::remote::RemoteNodeKind::File,
                });
                merged.push((name.to_string(), local_id, remote_entry));
            } else if let Some(entry) = remote_by_name.get(name) {
                // Present only remotely and not locally removed: someone
                // else added it; local id unknown yet (0 sentinel — the
                // caller resolves/creates the local inode for new remote
                // children before committing).
                merged.push((name.to_string(), 0, (*entry).clone()));
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteNodeKind, RemoteRef};

    #[test]
    fn newer_local_mtime_wins() {
        let policy = LastWriterWins;
        let resolved = policy.resolve_file(FileConflict {
            local_bytes: Bytes::from_static(b"local"),
            local_mtime: 10,
            remote_bytes: Bytes::from_static(b"remote"),
            remote_mtime: 5,
        });
        assert_eq!(resolved, Bytes::from_static(b"local"));
    }

    #[test]
    fn newer_remote_mtime_wins() {
        let policy = LastWriterWins;
        let resolved = policy.resolve_file(FileConflict {
            local_bytes: Bytes::from_static(b"local"),
            local_mtime: 1,
            remote_bytes: Bytes::from_static(b"remote"),
            remote_mtime: 99,
        });
        assert_eq!(resolved, Bytes::from_static(b"remote"));
    }

    #[test]
    fn remote_only_addition_is_kept() {
        let policy = LastWriterWins;
        let remote = vec![RemoteDirEntry {
            name: "new-from-elsewhere".into(),
            child_ref: RemoteRef("r1".into()),
            kind: RemoteNodeKind::File,
        }];
        let merged = policy.resolve_dir(vec![], remote, &HashSet::new());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].0, "new-from-elsewhere");
    }

    #[test]
    fn local_removal_is_respected_over_remote_listing() {
        let policy = LastWriterWins;
        let remote = vec![RemoteDirEntry {
            name: "gone".into(),
            child_ref: RemoteRef("r1".into()),
            kind: RemoteNodeKind::File,
        }];
        let mut removed = HashSet::new();
        removed.insert("gone".to_string());
        let merged = policy.resolve_dir(vec![], remote, &removed);
        assert!(merged.is_empty());
    }

    #[test]
    fn local_entry_wins_over_conflicting_remote_entry() {
        let policy = LastWriterWins;
        let remote = vec![RemoteDirEntry {
            name: "x".into(),
            child_ref: RemoteRef("remote-ref".into()),
            kind: RemoteNodeKind::File,
        }];
        let merged = policy.resolve_dir(vec![("x".into(), 42)], remote, &HashSet::new());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].1, 42);
    }
}
