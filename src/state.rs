//! State hierarchy: the arena of states and their activation bookkeeping.
//!
//! All states of a machine live in one [`Hierarchy`], addressed by a stable
//! [`StateId`] index. Parent, child and `current` references are indices, so
//! the tree has no ownership cycles. Topology is fixed once assembled; only
//! the `active` flag, the activation epoch, the composite `current` slot and
//! the armed timer change at runtime.

use crate::timer::{TimerHandle, TimerToken};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Index of a state in the hierarchy arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub(crate) usize);

impl StateId {
    /// Raw arena index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Declared kind of a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateKind<S> {
    /// A leaf state.
    Simple,
    /// A state with exactly one active child at a time.
    Composite {
        /// Child entered by default.
        initial: S,
    },
    /// A state whose children are regions that are all active together.
    Parallel,
}

impl<S> StateKind<S> {
    /// Shorthand for [`StateKind::Composite`].
    pub fn composite(initial: S) -> Self {
        StateKind::Composite { initial }
    }
}

/// How a composite or parallel state restores its previous configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryKind {
    /// Restore the remembered child only; below it, default entry.
    Shallow,
    /// Restore the whole remembered subtree.
    Deep,
}

#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
    Simple,
    Composite {
        children: Vec<StateId>,
        initial: StateId,
        /// Doubles as shallow history: never cleared on exit.
        current: Option<StateId>,
    },
    Parallel {
        regions: Vec<StateId>,
    },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ArmedTimer {
    pub token: TimerToken,
    pub handle: TimerHandle,
}

#[derive(Debug, Clone)]
pub(crate) struct Node<S> {
    pub key: S,
    pub parent: Option<StateId>,
    pub depth: usize,
    pub kind: NodeKind,
    pub history: Option<HistoryKind>,
    pub active: bool,
    /// Bumped on every entry; lets a dispatch frame notice it was exited.
    pub epoch: u64,
    pub armed: Option<ArmedTimer>,
}

/// A state declaration as collected by the builder.
#[derive(Debug, Clone)]
pub(crate) struct StateDecl<S> {
    pub key: S,
    pub parent: Option<S>,
    pub kind: StateKind<S>,
    pub history: Option<HistoryKind>,
}

/// The owned tree of states.
#[derive(Debug, Clone)]
pub struct Hierarchy<S> {
    nodes: Vec<Node<S>>,
    index: HashMap<S, StateId>,
    top: StateId,
}

impl<S> Hierarchy<S>
where
    S: Clone + Debug + Eq + Hash,
{
    /// Validate declarations and lay them out in the arena.
    ///
    /// Ids follow declaration order, so children and regions keep the order
    /// they were declared in.
    pub(crate) fn assemble(decls: Vec<StateDecl<S>>) -> Result<Self, String> {
        if decls.is_empty() {
            return Err("no states declared".to_string());
        }

        let mut index = HashMap::with_capacity(decls.len());
        for (i, decl) in decls.iter().enumerate() {
            if index.insert(decl.key.clone(), StateId(i)).is_some() {
                return Err(format!("state {:?} declared twice", decl.key));
            }
        }

        let mut tops = decls.iter().filter(|d| d.parent.is_none());
        let top = match (tops.next(), tops.next()) {
            (Some(top), None) => index[&top.key],
            (None, _) => return Err("no top state declared".to_string()),
            (Some(a), Some(b)) => {
                return Err(format!(
                    "more than one top state: {:?} and {:?}",
                    a.key, b.key
                ))
            }
        };

        let mut parents = Vec::with_capacity(decls.len());
        let mut children: Vec<Vec<StateId>> = vec![Vec::new(); decls.len()];
        for (i, decl) in decls.iter().enumerate() {
            let parent = match &decl.parent {
                None => None,
                Some(p) => {
                    let pid = *index.get(p).ok_or_else(|| {
                        format!("parent {:?} of state {:?} is not declared", p, decl.key)
                    })?;
                    if matches!(decls[pid.0].kind, StateKind::Simple) {
                        return Err(format!(
                            "state {:?} has simple state {:?} as parent",
                            decl.key, p
                        ));
                    }
                    children[pid.0].push(StateId(i));
                    Some(pid)
                }
            };
            parents.push(parent);
        }

        let mut depths = vec![0usize; decls.len()];
        for (i, decl) in decls.iter().enumerate() {
            let mut depth = 0;
            let mut cursor = parents[i];
            while let Some(p) = cursor {
                depth += 1;
                if depth > decls.len() {
                    return Err(format!("parent cycle through state {:?}", decl.key));
                }
                cursor = parents[p.0];
            }
            depths[i] = depth;
        }

        let mut nodes = Vec::with_capacity(decls.len());
        for (i, decl) in decls.into_iter().enumerate() {
            let kids = std::mem::take(&mut children[i]);
            let kind = match decl.kind {
                StateKind::Simple => NodeKind::Simple,
                StateKind::Composite { initial } => {
                    if kids.is_empty() {
                        return Err(format!("composite state {:?} has no children", decl.key));
                    }
                    let initial = index
                        .get(&initial)
                        .copied()
                        .filter(|id| kids.contains(id))
                        .ok_or_else(|| {
                            format!(
                                "default substate {:?} of {:?} is not one of its children",
                                initial, decl.key
                            )
                        })?;
                    NodeKind::Composite {
                        children: kids,
                        initial,
                        current: None,
                    }
                }
                StateKind::Parallel => {
                    if kids.len() < 2 {
                        return Err(format!(
                            "parallel state {:?} needs at least two regions",
                            decl.key
                        ));
                    }
                    NodeKind::Parallel { regions: kids }
                }
            };
            if decl.history.is_some() && matches!(kind, NodeKind::Simple) {
                return Err(format!(
                    "history declared on simple state {:?}",
                    decl.key
                ));
            }
            nodes.push(Node {
                key: decl.key,
                parent: parents[i],
                depth: depths[i],
                kind,
                history: decl.history,
                active: false,
                epoch: 0,
                armed: None,
            });
        }

        let hierarchy = Self { nodes, index, top };
        for node in &hierarchy.nodes {
            if let NodeKind::Parallel { regions } = &node.kind {
                if let Some(r) = regions
                    .iter()
                    .find(|r| matches!(hierarchy.nodes[r.0].kind, NodeKind::Parallel { .. }))
                {
                    return Err(format!(
                        "region {:?} of parallel state {:?} must be simple or composite",
                        hierarchy.key(*r),
                        node.key
                    ));
                }
            }
        }
        Ok(hierarchy)
    }

    pub(crate) fn top(&self) -> StateId {
        self.top
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn id_of(&self, key: &S) -> Option<StateId> {
        self.index.get(key).copied()
    }

    pub(crate) fn key(&self, id: StateId) -> &S {
        &self.nodes[id.0].key
    }

    pub(crate) fn node(&self, id: StateId) -> &Node<S> {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: StateId) -> &mut Node<S> {
        &mut self.nodes[id.0]
    }

    pub(crate) fn parent(&self, id: StateId) -> Option<StateId> {
        self.nodes[id.0].parent
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = StateId> {
        (0..self.nodes.len()).map(StateId)
    }

    pub(crate) fn children(&self, id: StateId) -> &[StateId] {
        match &self.nodes[id.0].kind {
            NodeKind::Simple => &[],
            NodeKind::Composite { children, .. } => children,
            NodeKind::Parallel { regions } => regions,
        }
    }

    pub(crate) fn is_parallel(&self, id: StateId) -> bool {
        matches!(self.nodes[id.0].kind, NodeKind::Parallel { .. })
    }

    /// Whether `ancestor` is `id` or one of its ancestors.
    pub(crate) fn is_ancestor_or_self(&self, ancestor: StateId, id: StateId) -> bool {
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            if c == ancestor {
                return true;
            }
            cursor = self.parent(c);
        }
        false
    }

    /// Least common ancestor-or-self of two states.
    pub(crate) fn lca(&self, a: StateId, b: StateId) -> StateId {
        let (mut a, mut b) = (a, b);
        while self.nodes[a.0].depth > self.nodes[b.0].depth {
            a = self.nodes[a.0].parent.unwrap_or(a);
        }
        while self.nodes[b.0].depth > self.nodes[a.0].depth {
            b = self.nodes[b.0].parent.unwrap_or(b);
        }
        while a != b {
            match (self.parent(a), self.parent(b)) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                _ => break,
            }
        }
        a
    }

    /// The child of `ancestor` on the way down to `descendant`.
    pub(crate) fn child_toward(&self, ancestor: StateId, descendant: StateId) -> Option<StateId> {
        let mut cursor = descendant;
        while let Some(p) = self.parent(cursor) {
            if p == ancestor {
                return Some(cursor);
            }
            cursor = p;
        }
        None
    }

    /// Chain from just below `ancestor` down to `descendant`, outer first.
    pub(crate) fn chain_below(&self, ancestor: StateId, descendant: StateId) -> Vec<StateId> {
        let mut chain = Vec::new();
        let mut cursor = descendant;
        while cursor != ancestor {
            chain.push(cursor);
            match self.parent(cursor) {
                Some(p) => cursor = p,
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    pub(crate) fn is_active(&self, id: StateId) -> bool {
        self.nodes[id.0].active
    }

    /// Children currently active: the `current` child of a composite, every
    /// region of a parallel.
    pub(crate) fn active_children(&self, id: StateId) -> Vec<StateId> {
        match &self.nodes[id.0].kind {
            NodeKind::Simple => Vec::new(),
            NodeKind::Composite { current, .. } => current
                .filter(|c| self.nodes[c.0].active)
                .into_iter()
                .collect(),
            NodeKind::Parallel { regions } => regions
                .iter()
                .copied()
                .filter(|r| self.nodes[r.0].active)
                .collect(),
        }
    }

    /// Active leaves below `id` in region order; `[id]` for an active leaf.
    pub(crate) fn active_leaves(&self, id: StateId) -> Vec<StateId> {
        let mut leaves = Vec::new();
        self.collect_leaves(id, &mut leaves);
        leaves
    }

    fn collect_leaves(&self, id: StateId, out: &mut Vec<StateId>) {
        if !self.nodes[id.0].active {
            return;
        }
        let children = self.active_children(id);
        if children.is_empty() {
            out.push(id);
        }
        for child in children {
            self.collect_leaves(child, out);
        }
    }

    /// Active configuration in depth-first pre-order from the top.
    pub(crate) fn current_path(&self) -> Vec<StateId> {
        let mut path = Vec::new();
        let mut stack = vec![self.top];
        while let Some(id) = stack.pop() {
            if !self.nodes[id.0].active {
                continue;
            }
            path.push(id);
            stack.extend(self.active_children(id).into_iter().rev());
        }
        path
    }

    /// Marks `id` active and records it as its parent's current child.
    /// Returns the new activation epoch.
    pub(crate) fn activate(&mut self, id: StateId) -> u64 {
        let node = &mut self.nodes[id.0];
        node.active = true;
        node.epoch += 1;
        let epoch = node.epoch;
        if let Some(parent) = node.parent {
            if let NodeKind::Composite { current, .. } = &mut self.nodes[parent.0].kind {
                *current = Some(id);
            }
        }
        epoch
    }

    pub(crate) fn deactivate(&mut self, id: StateId) {
        self.nodes[id.0].active = false;
    }

    /// Remembered child of a composite (its last `current`), if it was ever entered.
    pub(crate) fn remembered(&self, id: StateId) -> Option<StateId> {
        match &self.nodes[id.0].kind {
            NodeKind::Composite { current, .. } => *current,
            _ => None,
        }
    }

    /// Checks the configuration invariants below an active `id`.
    ///
    /// Returns the first violation found, described for diagnostics.
    pub(crate) fn check_configuration(&self, id: StateId) -> Result<(), String> {
        let node = &self.nodes[id.0];
        if !node.active {
            return Ok(());
        }
        match &node.kind {
            NodeKind::Simple => Ok(()),
            NodeKind::Composite { children, .. } => {
                let active: Vec<_> = children
                    .iter()
                    .filter(|c| self.nodes[c.0].active)
                    .collect();
                if active.len() != 1 || node.kind_current() != Some(*active[0]) {
                    return Err(format!(
                        "composite {:?} has {} active children",
                        node.key,
                        active.len()
                    ));
                }
                self.check_configuration(*active[0])
            }
            NodeKind::Parallel { regions } => {
                for region in regions {
                    if !self.nodes[region.0].active {
                        return Err(format!(
                            "region {:?} of {:?} is inactive",
                            self.nodes[region.0].key, node.key
                        ));
                    }
                    self.check_configuration(*region)?;
                }
                Ok(())
            }
        }
    }
}

impl<S> Node<S> {
    fn kind_current(&self) -> Option<StateId> {
        match &self.kind {
            NodeKind::Composite { current, .. } => *current,
            _ => None,
        }
    }
}
