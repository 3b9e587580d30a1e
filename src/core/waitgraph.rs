//! Wait-for graph and cycle detection
//!
//! Every BLOCKED thread with a known lock owner contributes one edge
//! `waiter -> owner`. A deadlock is a strongly connected component with more
//! than one thread, or a thread blocked on a lock it owns itself. Threads that
//! merely wait on a deadlocked thread are not part of the cycle and are not
//! reported.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::thread::{ThreadId, ThreadRecord, ThreadState};

/// Blocking edges between threads
#[derive(Debug, Clone, Default)]
pub struct WaitGraph {
    edges: BTreeMap<ThreadId, Vec<ThreadId>>,
}

impl WaitGraph {
    /// Build from lock-owner edges of blocked threads
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ThreadRecord>) -> Self {
        let mut graph = Self::default();
        for record in records {
            match record.lock_owner {
                Some(owner) if record.state == ThreadState::Blocked => {
                    graph.add_edge(record.id, owner)
                }
                _ => {}
            }
        }
        graph
    }

    pub fn add_edge(&mut self, waiter: ThreadId, owner: ThreadId) {
        self.edges.entry(waiter).or_default().push(owner);
        self.edges.entry(owner).or_default();
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    /// Every cycle, each sorted ascending; cycles ordered by smallest member
    pub fn cycles(&self) -> Vec<Vec<ThreadId>> {
        let mut cycles: Vec<Vec<ThreadId>> = tarjan_scc(&self.edges)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1
                    || scc
                        .first()
                        .is_some_and(|&id| self.edges.get(&id).is_some_and(|out| out.contains(&id)))
            })
            .map(|mut scc| {
                scc.sort_unstable();
                scc
            })
            .collect();
        cycles.sort();
        cycles
    }

    /// Ids of all threads on any cycle, ascending
    pub fn deadlocked(&self) -> Vec<ThreadId> {
        let ids: BTreeSet<ThreadId> = self.cycles().into_iter().flatten().collect();
        ids.into_iter().collect()
    }
}

// ── Tarjan's strongly connected components ──────────────────────
//
// Iterative, so a lock chain of any length runs in constant native stack.

struct TarjanState {
    index_counter: usize,
    stack: Vec<ThreadId>,
    on_stack: HashSet<ThreadId>,
    index: HashMap<ThreadId, usize>,
    sccs: Vec<Vec<ThreadId>>,
}

/// One suspended `strongconnect` call
struct Frame {
    node: ThreadId,
    index: usize,
    lowlink: usize,
    next_edge: usize,
}

impl TarjanState {
    fn visit(&mut self, node: ThreadId) -> Frame {
        let index = self.index_counter;
        self.index_counter += 1;
        self.index.insert(node, index);
        self.stack.push(node);
        self.on_stack.insert(node);
        Frame {
            node,
            index,
            lowlink: index,
            next_edge: 0,
        }
    }
}

fn tarjan_scc(adj: &BTreeMap<ThreadId, Vec<ThreadId>>) -> Vec<Vec<ThreadId>> {
    let mut state = TarjanState {
        index_counter: 0,
        stack: Vec::new(),
        on_stack: HashSet::new(),
        index: HashMap::new(),
        sccs: Vec::new(),
    };

    for &node in adj.keys() {
        if !state.index.contains_key(&node) {
            strongconnect(node, adj, &mut state);
        }
    }

    state.sccs
}

fn strongconnect(
    root: ThreadId,
    adj: &BTreeMap<ThreadId, Vec<ThreadId>>,
    state: &mut TarjanState,
) {
    let mut frames = vec![state.visit(root)];

    while let Some(frame) = frames.last_mut() {
        let neighbors = adj.get(&frame.node).map(Vec::as_slice).unwrap_or(&[]);

        if let Some(&w) = neighbors.get(frame.next_edge) {
            frame.next_edge += 1;
            match state.index.get(&w).copied() {
                None => {
                    let child = state.visit(w);
                    frames.push(child);
                }
                Some(w_index) if state.on_stack.contains(&w) => {
                    frame.lowlink = frame.lowlink.min(w_index);
                }
                Some(_) => {}
            }
            continue;
        }

        // All edges done: return to the caller
        let Some(done) = frames.pop() else { break };
        if let Some(parent) = frames.last_mut() {
            parent.lowlink = parent.lowlink.min(done.lowlink);
        }

        // done.node is the root of an SCC
        if done.lowlink == done.index {
            let mut scc = Vec::new();
            while let Some(w) = state.stack.pop() {
                state.on_stack.remove(&w);
                scc.push(w);
                if w == done.node {
                    break;
                }
            }
            state.sccs.push(scc);
        }
    }
}
