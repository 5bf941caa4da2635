//! Snapshot diff
//!
//! Merge-style walk over two name-sorted entry lists producing the minimal
//! ordered set of fetches and deletes that turns the old tree into the new
//! one. Ties are broken by name order, so deletes and fetches interleave.

use std::cmp::Ordering;

use crate::snapshot::{FileEntry, Snapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Pull this entry's current bytes from the server
    Fetch(FileEntry),
    /// Remove this file locally
    Delete(String),
}

/// Compute the actions that bring `old` up to `new`. With no previous
/// snapshot every entry of `new` is fetched.
pub fn diff(old: Option<&Snapshot>, new: &Snapshot) -> Vec<Action> {
    let old = old.map(Snapshot::entries).unwrap_or(&[]);
    diff_entries(old, new.entries())
}

/// Same as [`diff`] over raw sorted slices
pub fn diff_entries(old: &[FileEntry], new: &[FileEntry]) -> Vec<Action> {
    let mut actions = Vec::new();
    let (mut o, mut n) = (0, 0);

    while o < old.len() || n < new.len() {
        if o == old.len() {
            actions.extend(new[n..].iter().cloned().map(Action::Fetch));
            break;
        }
        if n == new.len() {
            actions.extend(old[o..].iter().map(|e| Action::Delete(e.name.clone())));
            break;
        }

        let (oe, ne) = (&old[o], &new[n]);
        match oe.name.cmp(&ne.name) {
            Ordering::Equal => {
                if oe.mtime != ne.mtime {
                    actions.push(Action::Fetch(ne.clone()));
                }
                o += 1;
                n += 1;
            }
            // gone from the new tree
            Ordering::Less => {
                actions.push(Action::Delete(oe.name.clone()));
                o += 1;
            }
            // not yet seen in the old tree
            Ordering::Greater => {
                actions.push(Action::Fetch(ne.clone()));
                n += 1;
            }
        }
    }

    actions
}
