use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexSet;
use log::Level;
use logging_timer::timer;

use crate::error::UpgradeError;
use crate::patch::{Patch, PatchType};

/// Whether reachability expands past the target of an open patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPatches {
    /// Open targets are reachable but not expanded (target discovery)
    Stop,
    /// Open patches are ordinary edges (explicit or wildcard targets)
    Follow,
}

/// All patches of an upgrade file, indexed by source version.
///
/// Outgoing patches keep their definition order, which is the tie-break
/// order for equal-length paths.
#[derive(Debug, Default)]
pub struct PatchGraph {
    initial: Vec<Patch>,
    patches: HashMap<String, Vec<Patch>>,
    setups: Vec<Patch>,
    versions: HashSet<String>,
}

impl PatchGraph {
    pub fn load(patches: impl IntoIterator<Item = Patch>) -> Result<Self, UpgradeError> {
        let mut graph = PatchGraph::default();

        for patch in patches {
            if patch.is_setup() {
                if let Some(existing) = graph.setups.iter().find(|p| p.source() == patch.source()) {
                    return Err(UpgradeError::Config(format!(
                        "Setup patch {} conflicts with {}",
                        patch, existing
                    )));
                }
                graph.setups.push(patch);
                continue;
            }

            let outgoing = match patch.source() {
                None => &mut graph.initial,
                Some(source) => graph.patches.entry(source.to_owned()).or_default(),
            };

            // Upgrade blocks are addressed by source and target, so the type can't disambiguate
            if let Some(existing) = outgoing.iter().find(|p| p.target() == patch.target()) {
                return Err(UpgradeError::Config(format!(
                    "Patch {} conflicts with {}",
                    patch, existing
                )));
            }

            if let Some(source) = patch.source() {
                graph.versions.insert(source.to_owned());
            }
            graph.versions.insert(patch.target().to_owned());
            outgoing.push(patch);
        }

        Ok(graph)
    }

    pub fn contains_version(&self, version: &str) -> bool {
        self.versions.contains(version)
    }

    fn outgoing(&self, source: Option<&str>) -> &[Patch] {
        match source {
            None => &self.initial,
            Some(version) => self.patches.get(version).map(Vec::as_slice).unwrap_or(&[]),
        }
    }

    fn permitted(patch: &Patch, allow_downgrades: bool) -> bool {
        allow_downgrades || patch.patch_type() != PatchType::Downgrade
    }

    /// Versions reachable from `from`, in breadth-first discovery order.
    ///
    /// With `through_target`, `from` is the committed version of a store that is part
    /// way into a patch towards `through_target`: only that target and what lies beyond
    /// it count. An empty result means `from` is not a version this graph knows.
    pub fn reachable(
        &self,
        from: Option<&str>,
        through_target: Option<&str>,
        allow_downgrades: bool,
        open: OpenPatches,
    ) -> IndexSet<String> {
        let _tmr = timer!(Level::Trace; "PatchGraph::reachable", "{:?} {:?}", from, through_target);

        let mut result = IndexSet::new();
        let mut expanded: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&Patch> = VecDeque::new();

        match through_target {
            Some(target) => {
                let Some(path) = self.path(from, target, allow_downgrades) else {
                    return result;
                };
                result.insert(target.to_owned());
                let stop = open == OpenPatches::Stop && path.last().is_some_and(Patch::is_open);
                if !stop {
                    expanded.insert(target);
                    queue.extend(
                        self.outgoing(Some(target))
                            .iter()
                            .filter(|p| Self::permitted(p, allow_downgrades)),
                    );
                }
            }
            None => {
                match from {
                    Some(version) if !self.versions.contains(version) => return result,
                    Some(version) => {
                        result.insert(version.to_owned());
                        expanded.insert(version);
                    }
                    None if self.initial.is_empty() => return result,
                    None => {}
                }
                queue.extend(
                    self.outgoing(from)
                        .iter()
                        .filter(|p| Self::permitted(p, allow_downgrades)),
                );
            }
        }

        while let Some(patch) = queue.pop_front() {
            result.insert(patch.target().to_owned());
            if open == OpenPatches::Stop && patch.is_open() {
                continue;
            }
            if expanded.insert(patch.target()) {
                queue.extend(
                    self.outgoing(Some(patch.target()))
                        .iter()
                        .filter(|p| Self::permitted(p, allow_downgrades)),
                );
            }
        }

        result
    }

    /// Reduces `versions` to those that have no Upgrade edge into the (prefix-filtered) set.
    pub fn tips(&self, versions: &IndexSet<String>, prefix: Option<&str>) -> IndexSet<String> {
        let filtered: IndexSet<&str> = versions
            .iter()
            .map(String::as_str)
            .filter(|v| prefix.is_none_or(|p| v.starts_with(p)))
            .collect();

        filtered
            .iter()
            .filter(|v| {
                !self.outgoing(Some(**v)).iter().any(|p| {
                    p.patch_type() == PatchType::Upgrade && filtered.contains(p.target())
                })
            })
            .map(|v| v.to_string())
            .collect()
    }

    /// Shortest sequence of patches leading from `from` to `to`, open patches included.
    /// Equal-length alternatives resolve to the first-defined edge.
    pub fn path(&self, from: Option<&str>, to: &str, allow_downgrades: bool) -> Option<Vec<Patch>> {
        let _tmr = timer!(Level::Trace; "PatchGraph::path", "{:?} -> {}", from, to);

        if from == Some(to) {
            return Some(Vec::new());
        }

        // Interned so the visited set can borrow from the graph
        let start = match from {
            Some(version) => Some(self.versions.get(version)?.as_str()),
            None => None,
        };

        let mut visited = HashSet::new();
        if let Some(version) = start {
            visited.insert(version);
        }

        self.search(start, to, allow_downgrades, visited)
            .map(|patches| patches.into_iter().cloned().collect())
    }

    fn search<'g>(
        &'g self,
        from: Option<&'g str>,
        to: &str,
        allow_downgrades: bool,
        mut visited: HashSet<&'g str>,
    ) -> Option<Vec<&'g Patch>> {
        let mut result: Vec<&'g Patch> = Vec::new();
        let mut current = from;

        loop {
            let candidates: Vec<&'g Patch> = self
                .outgoing(current)
                .iter()
                .filter(|p| Self::permitted(p, allow_downgrades) && !visited.contains(p.target()))
                .collect();

            match candidates.as_slice() {
                [] => return None,
                // Linear stretch: walk it without recursing
                [only] => {
                    let only = *only;
                    result.push(only);
                    if only.target() == to {
                        return Some(result);
                    }
                    visited.insert(only.target());
                    current = Some(only.target());
                }
                _ => {
                    let mut best: Option<Vec<&'g Patch>> = None;
                    for &patch in &candidates {
                        let found = if patch.target() == to {
                            Some(vec![patch])
                        } else {
                            let mut branch_visited = visited.clone();
                            branch_visited.insert(patch.target());
                            self.search(Some(patch.target()), to, allow_downgrades, branch_visited)
                                .map(|rest| {
                                    let mut found = Vec::with_capacity(rest.len() + 1);
                                    found.push(patch);
                                    found.extend(rest);
                                    found
                                })
                        };

                        if let Some(found) = found {
                            if best.as_ref().is_none_or(|b| found.len() < b.len()) {
                                best = Some(found);
                            }
                        }
                    }

                    return best.map(|tail| {
                        result.extend(tail);
                        result
                    });
                }
            }
        }
    }

    /// The chain of setup patches that brings the store from `spec` to the newest spec.
    pub fn setup_path(&self, spec: Option<&str>) -> Vec<Patch> {
        let mut result = Vec::new();
        let mut seen = HashSet::new();
        let mut current = spec;

        while let Some(patch) = self.setups.iter().find(|p| p.source() == current) {
            if !seen.insert(patch.target()) {
                break;
            }
            result.push(patch.clone());
            current = Some(patch.target());
        }

        result
    }
}
