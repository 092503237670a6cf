//! Build-time path computation.
//!
//! For every transition the builder computes, once:
//!
//! - the *domain*: the least common ancestor of the source and all
//!   destinations that stays active while the transition runs,
//! - the exit path, source up to (excluding) the domain, innermost first,
//! - the entry path, domain (excluded) down to each destination, outer first,
//!   with parallel branches interleaved in region order.
//!
//! A destination that *is* the common ancestor has to be exited and entered
//! again, so the domain moves to its parent; the same happens when the
//! source sits inside a parallel state and the transition leaves its region.
//! When that would require leaving the top state, there is no common
//! ancestor and the topology is rejected.

use crate::state::{HistoryKind, Hierarchy, StateId};
use crate::transition::EntryStep;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;

/// A destination resolved to arena ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolvedTarget {
    State(StateId),
    History(StateId, HistoryKind),
}

impl ResolvedTarget {
    pub(crate) fn state(self) -> StateId {
        match self {
            ResolvedTarget::State(id) | ResolvedTarget::History(id, _) => id,
        }
    }
}

/// Precomputed paths of one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransitionPaths {
    pub domain: StateId,
    pub exit_path: Vec<StateId>,
    pub entry_path: Vec<EntryStep>,
}

/// Computes the domain, exit path and entry path of a transition declared on
/// `source`. An empty `targets` list is an internal transition.
pub(crate) fn compute<S>(
    hierarchy: &Hierarchy<S>,
    source: StateId,
    targets: &[ResolvedTarget],
) -> Result<TransitionPaths, String>
where
    S: Clone + Debug + Eq + Hash,
{
    if targets.is_empty() {
        return Ok(TransitionPaths {
            domain: source,
            exit_path: Vec::new(),
            entry_path: Vec::new(),
        });
    }

    for target in targets {
        if let ResolvedTarget::History(owner, _) = target {
            if hierarchy.children(*owner).is_empty() {
                return Err(format!(
                    "history target {:?} is not a composite or parallel state",
                    hierarchy.key(*owner)
                ));
            }
        }
    }

    let dests: Vec<StateId> = targets.iter().map(|t| t.state()).collect();
    if dests.len() > 1 {
        validate_fork(hierarchy, source, &dests)?;
    }

    let mut domain = dests
        .iter()
        .fold(source, |acc, dest| hierarchy.lca(acc, *dest));

    let reenters_domain = dests.contains(&domain);
    let leaves_region = domain != source && hierarchy.is_parallel(domain);
    if reenters_domain || leaves_region {
        domain = hierarchy.parent(domain).ok_or_else(|| {
            format!(
                "transition from {:?} has no common ancestor: it would have to exit the top state",
                hierarchy.key(source)
            )
        })?;
    }

    let mut exit_path = hierarchy.chain_below(domain, source);
    exit_path.reverse();

    Ok(TransitionPaths {
        domain,
        exit_path,
        entry_path: entry_path(hierarchy, domain, targets),
    })
}

/// Fork destinations must fall into distinct regions of a single parallel
/// state.
fn validate_fork<S>(
    hierarchy: &Hierarchy<S>,
    source: StateId,
    dests: &[StateId],
) -> Result<(), String>
where
    S: Clone + Debug + Eq + Hash,
{
    let fork_root = dests[1..]
        .iter()
        .fold(dests[0], |acc, dest| hierarchy.lca(acc, *dest));

    if !hierarchy.is_parallel(fork_root) {
        return Err(format!(
            "fork from {:?}: destinations {:?} do not meet in a parallel state",
            hierarchy.key(source),
            dests.iter().map(|d| hierarchy.key(*d)).collect::<Vec<_>>()
        ));
    }

    let mut regions = HashSet::new();
    for dest in dests {
        let region = hierarchy.child_toward(fork_root, *dest).ok_or_else(|| {
            format!(
                "fork from {:?}: destination {:?} is the parallel state itself",
                hierarchy.key(source),
                hierarchy.key(*dest)
            )
        })?;
        if !regions.insert(region) {
            return Err(format!(
                "fork from {:?}: two destinations share region {:?} of {:?}",
                hierarchy.key(source),
                hierarchy.key(region),
                hierarchy.key(fork_root)
            ));
        }
    }
    Ok(())
}

/// Depth-first, outer-to-inner entry steps below `domain`; each state once.
fn entry_path<S>(
    hierarchy: &Hierarchy<S>,
    domain: StateId,
    targets: &[ResolvedTarget],
) -> Vec<EntryStep>
where
    S: Clone + Debug + Eq + Hash,
{
    let mut on_path = HashSet::new();
    for target in targets {
        on_path.extend(hierarchy.chain_below(domain, target.state()));
    }

    let mut steps = Vec::with_capacity(on_path.len() + targets.len());
    let mut stack: Vec<StateId> = hierarchy.children(domain).iter().rev().copied().collect();
    while let Some(id) = stack.pop() {
        if !on_path.contains(&id) {
            continue;
        }
        steps.push(EntryStep::Enter(id));
        for target in targets {
            if let ResolvedTarget::History(owner, kind) = target {
                if *owner == id {
                    steps.push(EntryStep::Restore(id, *kind));
                }
            }
        }
        stack.extend(hierarchy.children(id).iter().rev().copied());
    }
    steps
}

/// Join sources must be able to be active together: any two of them are
/// either nested or meet in a parallel state from different regions.
pub(crate) fn validate_join<S>(
    hierarchy: &Hierarchy<S>,
    declaring: StateId,
    sources: &[StateId],
) -> Result<(), String>
where
    S: Clone + Debug + Eq + Hash,
{
    if sources.len() < 2 {
        return Err(format!(
            "join on {:?} needs at least two source states",
            hierarchy.key(declaring)
        ));
    }
    for (i, a) in sources.iter().enumerate() {
        for b in &sources[i + 1..] {
            if hierarchy.is_ancestor_or_self(*a, *b) || hierarchy.is_ancestor_or_self(*b, *a) {
                continue;
            }
            if !hierarchy.is_parallel(hierarchy.lca(*a, *b)) {
                return Err(format!(
                    "join on {:?}: {:?} and {:?} can never be active together",
                    hierarchy.key(declaring),
                    hierarchy.key(*a),
                    hierarchy.key(*b)
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::sample;

    fn id(h: &Hierarchy<&'static str>, key: &'static str) -> StateId {
        h.id_of(&key).unwrap()
    }

    fn to(h: &Hierarchy<&'static str>, key: &'static str) -> ResolvedTarget {
        ResolvedTarget::State(id(h, key))
    }

    fn keys(h: &Hierarchy<&'static str>, ids: &[StateId]) -> Vec<&'static str> {
        ids.iter().map(|i| *h.key(*i)).collect()
    }

    fn entered(h: &Hierarchy<&'static str>, steps: &[EntryStep]) -> Vec<String> {
        steps
            .iter()
            .map(|s| match s {
                EntryStep::Enter(i) => h.key(*i).to_string(),
                EntryStep::Restore(i, k) => format!("{:?}({})", k, h.key(*i)),
            })
            .collect()
    }

    #[test]
    fn test_sibling_transition() {
        let h = sample();
        let paths = compute(&h, id(&h, "S1"), &[to(&h, "S2")]).unwrap();
        assert_eq!(h.key(paths.domain), &"C");
        assert_eq!(keys(&h, &paths.exit_path), vec!["S1"]);
        assert_eq!(entered(&h, &paths.entry_path), vec!["S2"]);
    }

    #[test]
    fn test_cross_branch_transition() {
        let h = sample();
        let paths = compute(&h, id(&h, "S1"), &[to(&h, "B2")]).unwrap();
        assert_eq!(h.key(paths.domain), &"Top");
        assert_eq!(keys(&h, &paths.exit_path), vec!["S1", "C"]);
        assert_eq!(entered(&h, &paths.entry_path), vec!["P", "R2", "B2"]);
    }

    #[test]
    fn test_self_transition_is_external() {
        let h = sample();
        let paths = compute(&h, id(&h, "S1"), &[to(&h, "S1")]).unwrap();
        assert_eq!(h.key(paths.domain), &"C");
        assert_eq!(keys(&h, &paths.exit_path), vec!["S1"]);
        assert_eq!(entered(&h, &paths.entry_path), vec!["S1"]);
    }

    #[test]
    fn test_local_transition_from_ancestor() {
        let h = sample();
        let paths = compute(&h, id(&h, "C"), &[to(&h, "S2")]).unwrap();
        assert_eq!(h.key(paths.domain), &"C");
        assert!(paths.exit_path.is_empty());
        assert_eq!(entered(&h, &paths.entry_path), vec!["S2"]);
    }

    #[test]
    fn test_cross_region_transition_reenters_parallel() {
        let h = sample();
        let paths = compute(&h, id(&h, "A1"), &[to(&h, "B2")]).unwrap();
        assert_eq!(h.key(paths.domain), &"Top");
        assert_eq!(keys(&h, &paths.exit_path), vec!["A1", "R1", "P"]);
        assert_eq!(entered(&h, &paths.entry_path), vec!["P", "R2", "B2"]);
    }

    #[test]
    fn test_region_reset_keeps_parallel() {
        let h = sample();
        let paths = compute(&h, id(&h, "A2"), &[to(&h, "R1")]).unwrap();
        assert_eq!(h.key(paths.domain), &"P");
        assert_eq!(keys(&h, &paths.exit_path), vec!["A2", "R1"]);
        assert_eq!(entered(&h, &paths.entry_path), vec!["R1"]);
    }

    #[test]
    fn test_fork_interleaves_regions() {
        let h = sample();
        let paths = compute(&h, id(&h, "S2"), &[to(&h, "B2"), to(&h, "A2")]).unwrap();
        assert_eq!(h.key(paths.domain), &"Top");
        assert_eq!(
            entered(&h, &paths.entry_path),
            vec!["P", "R1", "A2", "R2", "B2"]
        );
    }

    #[test]
    fn test_fork_errors() {
        let h = sample();
        let err = compute(&h, id(&h, "S1"), &[to(&h, "A1"), to(&h, "A2")]).unwrap_err();
        assert!(err.contains("do not meet in a parallel"));

        let err = compute(&h, id(&h, "S1"), &[to(&h, "S2"), to(&h, "B2")]).unwrap_err();
        assert!(err.contains("parallel"));

        let err = compute(&h, id(&h, "S1"), &[to(&h, "P"), to(&h, "B2")]).unwrap_err();
        assert!(err.contains("parallel state itself"));
    }

    #[test]
    fn test_history_target() {
        let h = sample();
        let target = ResolvedTarget::History(id(&h, "C"), HistoryKind::Deep);
        let paths = compute(&h, id(&h, "B1"), &[target]).unwrap();
        assert_eq!(h.key(paths.domain), &"Top");
        assert_eq!(keys(&h, &paths.exit_path), vec!["B1", "R2", "P"]);
        assert_eq!(entered(&h, &paths.entry_path), vec!["C", "Deep(C)"]);

        let err = compute(
            &h,
            id(&h, "S1"),
            &[ResolvedTarget::History(id(&h, "S2"), HistoryKind::Shallow)],
        )
        .unwrap_err();
        assert!(err.contains("not a composite"));
    }

    #[test]
    fn test_transition_to_top_has_no_common_ancestor() {
        let h = sample();
        let err = compute(&h, id(&h, "S1"), &[to(&h, "Top")]).unwrap_err();
        assert!(err.contains("no common ancestor"));
    }

    #[test]
    fn test_internal_transition() {
        let h = sample();
        let paths = compute(&h, id(&h, "S1"), &[]).unwrap();
        assert_eq!(paths.domain, id(&h, "S1"));
        assert!(paths.exit_path.is_empty() && paths.entry_path.is_empty());
    }

    #[test]
    fn test_join_validation() {
        let h = sample();
        assert!(validate_join(&h, id(&h, "P"), &[id(&h, "A2"), id(&h, "B2")]).is_ok());
        let err = validate_join(&h, id(&h, "C"), &[id(&h, "S1"), id(&h, "S2")]).unwrap_err();
        assert!(err.contains("never be active together"));
        assert!(validate_join(&h, id(&h, "P"), &[id(&h, "A2")]).is_err());
    }
}
