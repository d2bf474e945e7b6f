//! Per-instance multiplexing.
//!
//! Counter classes report one row per running instance (process, VM, task)
//! and often a synthetic aggregate row next to them. Collectors that report
//! per-instance metrics skip the aggregate by exact name match.
//!
//! Hierarchical sources (task folders) are flattened with
//! [`walk_depth_first`], which visits every reachable leaf exactly once.

use std::collections::HashSet;

use crate::session::{RawRow, SessionError, TaskFolder};

/// Aggregate row emitted by .NET CLR performance classes.
pub const GLOBAL_INSTANCE: &str = "_Global_";

/// Aggregate instance of most PDH counter objects.
pub const TOTAL_INSTANCE: &str = "_Total";

/// A typed row scoped to a named instance.
pub trait Instanced {
    fn instance_name(&self) -> &str;
}

/// Yields every row except those named exactly `sentinel`, in query order.
pub fn per_instance<'a, T: Instanced>(
    rows: &'a [T],
    sentinel: &'a str,
) -> impl Iterator<Item = &'a T> + 'a {
    rows.iter().filter(move |row| row.instance_name() != sentinel)
}

/// A node of a hierarchical source that holds leaves and sub-containers.
pub trait Container: Sized {
    type Leaf;
    type Error;

    /// Unique key of this container (its path).
    fn key(&self) -> String;

    fn leaves(&self) -> Result<Vec<Self::Leaf>, Self::Error>;

    fn children(&self) -> Result<Vec<Self>, Self::Error>;
}

impl Container for Box<dyn TaskFolder> {
    type Leaf = RawRow;
    type Error = SessionError;

    fn key(&self) -> String {
        self.path()
    }

    fn leaves(&self) -> Result<Vec<RawRow>, SessionError> {
        self.tasks()
    }

    fn children(&self) -> Result<Vec<Self>, SessionError> {
        self.folders()
    }
}

/// Walks `root` depth-first, calling `visit` for every leaf.
///
/// A container's leaves are visited before its children. Containers whose
/// key was already seen are skipped, so the walk terminates even if the
/// source reports a folder twice.
pub fn walk_depth_first<C, F>(root: C, mut visit: F) -> Result<(), C::Error>
where
    C: Container,
    F: FnMut(C::Leaf) -> Result<(), C::Error>,
{
    let mut seen = HashSet::new();
    let mut stack = vec![root];

    while let Some(container) = stack.pop() {
        if !seen.insert(container.key()) {
            continue;
        }

        for leaf in container.leaves()? {
            visit(leaf)?;
        }

        let mut children = container.children()?;
        // Reverse so the first child is walked first.
        children.reverse();
        stack.extend(children);
    }

    Ok(())
}
