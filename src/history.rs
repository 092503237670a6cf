//! History memory and entry-mode resolution.
//!
//! There is no separate history store: a composite's `current` slot is
//! left in place when the composite exits and is only overwritten by the
//! next entry of one of its children. Restoring history therefore just means
//! choosing the remembered child instead of the default one.

use crate::state::{HistoryKind, Hierarchy, NodeKind, StateId};
use crate::transition::EntryStep;
use std::fmt::Debug;
use std::hash::Hash;

/// How a state is being entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryMode<'a> {
    /// Default entry: initial children, or the state's own history marker.
    Default,
    /// Follow a precomputed entry path; off-path children take default entry.
    Path(&'a [EntryStep]),
    /// Restore remembered children.
    Restore(HistoryKind),
}

/// Which child a composite enters, how that child is entered in turn, and
/// whether the choice came from history.
pub(crate) fn composite_child<'a, S>(
    hierarchy: &Hierarchy<S>,
    id: StateId,
    mode: EntryMode<'a>,
) -> Option<(StateId, EntryMode<'a>, bool)>
where
    S: Clone + Debug + Eq + Hash,
{
    let initial = match &hierarchy.node(id).kind {
        NodeKind::Composite { initial, .. } => *initial,
        _ => return None,
    };

    let mode = match mode {
        EntryMode::Path(steps) => {
            let forced = steps.iter().find_map(|step| match step {
                EntryStep::Enter(child) if hierarchy.parent(*child) == Some(id) => Some(*child),
                _ => None,
            });
            if let Some(child) = forced {
                return Some((child, EntryMode::Path(steps), false));
            }
            match restore_marker(steps, id) {
                Some(kind) => EntryMode::Restore(kind),
                None => EntryMode::Default,
            }
        }
        other => other,
    };

    let resolved = match mode {
        EntryMode::Restore(kind) => Some(kind),
        EntryMode::Default => hierarchy.node(id).history,
        EntryMode::Path(_) => None,
    };

    match (resolved, hierarchy.remembered(id)) {
        (Some(HistoryKind::Deep), Some(child)) => {
            Some((child, EntryMode::Restore(HistoryKind::Deep), true))
        }
        (Some(HistoryKind::Shallow), Some(child)) => Some((child, EntryMode::Default, true)),
        _ => Some((initial, EntryMode::Default, false)),
    }
}

/// How a region of parallel state `id` is entered.
///
/// Restoring a parallel restores each region: deep history recurses all the
/// way down, shallow history restores the remembered child of every region.
pub(crate) fn region_mode<'a, S>(
    hierarchy: &Hierarchy<S>,
    id: StateId,
    region: StateId,
    mode: EntryMode<'a>,
) -> EntryMode<'a>
where
    S: Clone + Debug + Eq + Hash,
{
    let restore = match mode {
        EntryMode::Path(steps) => {
            if steps.contains(&EntryStep::Enter(region)) {
                return EntryMode::Path(steps);
            }
            restore_marker(steps, id).or(hierarchy.node(id).history)
        }
        EntryMode::Restore(kind) => Some(kind),
        EntryMode::Default => hierarchy.node(id).history,
    };
    match restore {
        Some(kind) => EntryMode::Restore(kind),
        None => EntryMode::Default,
    }
}

fn restore_marker(steps: &[EntryStep], owner: StateId) -> Option<HistoryKind> {
    steps.iter().find_map(|step| match step {
        EntryStep::Restore(id, kind) if *id == owner => Some(*kind),
        _ => None,
    })
}
