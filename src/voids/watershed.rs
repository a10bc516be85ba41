//! Priority-flood watershed over a [`DensityGraph`].
//!
//! Nodes below the threshold are popped from a global min-heap keyed on
//! `(density, index)`. A node with no flooded neighbour starts a basin; a node
//! touching one basin joins it; a node touching several is a saddle where the
//! basins meet. Basins are arena-indexed and merged through a union-find over
//! basin ids, so later nodes always join the surviving root.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tracing::debug;

use super::graph::DensityGraph;
use super::MergePolicy;

const UNLABELLED: u32 = u32::MAX;

/// Heap key: density first, node index breaks ties.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Level {
    density: f64,
    index: u32,
}

impl Eq for Level {}

impl Ord for Level {
    fn cmp(&self, other: &Self) -> Ordering {
        self.density
            .total_cmp(&other.density)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for Level {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One flooded region.
#[derive(Debug, Clone)]
pub(crate) struct Basin {
    /// Lowest-density node (the seed).
    pub core: u32,
    pub core_density: f64,
    /// Nodes flooded directly into this basin.
    pub members: Vec<u32>,
    /// Basins merged outright into this one.
    pub absorbed: Vec<u32>,
    /// Basins kept as child voids of this one.
    pub children: Vec<u32>,
    /// Set when this basin was kept as a child.
    pub parent: Option<u32>,
    /// Set when this basin was absorbed.
    pub absorbed_into: Option<u32>,
}

impl Basin {
    /// `true` for basins that become catalogue records.
    pub fn is_void(&self) -> bool {
        self.absorbed_into.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Basins {
    pub basins: Vec<Basin>,
    pub saddles: usize,
}

impl Basins {
    /// All nodes of basin `id`: its own members plus every absorbed or child
    /// basin below it.
    pub fn all_members(&self, id: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(b) = stack.pop() {
            let basin = &self.basins[b as usize];
            out.extend_from_slice(&basin.members);
            stack.extend_from_slice(&basin.absorbed);
            stack.extend_from_slice(&basin.children);
        }
        out
    }
}

fn find(parent: &mut [u32], mut x: u32) -> u32 {
    while parent[x as usize] != x {
        parent[x as usize] = parent[parent[x as usize] as usize];
        x = parent[x as usize];
    }
    x
}

/// Flood every non-excluded node with density strictly below `threshold`.
pub(crate) fn flood<G: DensityGraph>(graph: &G, threshold: f64, policy: MergePolicy) -> Basins {
    let n = graph.len();
    let mut heap: BinaryHeap<Reverse<Level>> = (0..n)
        .filter(|&i| !graph.is_excluded(i) && graph.density(i) < threshold)
        .map(|i| {
            Reverse(Level {
                density: graph.density(i),
                index: i as u32,
            })
        })
        .collect();
    debug!("Watershed: {} of {} nodes below threshold {}", heap.len(), n, threshold);

    let mut label = vec![UNLABELLED; n];
    let mut uf: Vec<u32> = Vec::new();
    let mut out = Basins::default();
    let mut nbrs: Vec<u32> = Vec::new();
    let mut roots: Vec<u32> = Vec::new();

    while let Some(Reverse(level)) = heap.pop() {
        let node = level.index;
        graph.neighbours(node as usize, &mut nbrs);
        roots.clear();
        for &nb in &nbrs {
            let l = label[nb as usize];
            if l != UNLABELLED {
                let r = find(&mut uf, l);
                if !roots.contains(&r) {
                    roots.push(r);
                }
            }
        }

        let target = match roots.len() {
            0 => {
                let id = out.basins.len() as u32;
                uf.push(id);
                out.basins.push(Basin {
                    core: node,
                    core_density: level.density,
                    members: Vec::new(),
                    absorbed: Vec::new(),
                    children: Vec::new(),
                    parent: None,
                    absorbed_into: None,
                });
                id
            }
            1 => roots[0],
            _ => {
                out.saddles += 1;
                roots.sort_by(|&a, &b| {
                    let (ba, bb) = (&out.basins[a as usize], &out.basins[b as usize]);
                    ba.core_density
                        .total_cmp(&bb.core_density)
                        .then(ba.core.cmp(&bb.core))
                });
                let deepest = roots[0];
                if policy == MergePolicy::Disjoint {
                    // Basins stay separate; the saddle node goes to the deepest
                    out.basins[deepest as usize].members.push(node);
                    label[node as usize] = deepest;
                    continue;
                }
                for &other in &roots[1..] {
                    let keep = match policy {
                        MergePolicy::Flat | MergePolicy::Disjoint => false,
                        MergePolicy::Hierarchical { min_density_ratio } => {
                            density_ratio(level.density, out.basins[other as usize].core_density)
                                >= min_density_ratio
                        }
                    };
                    if keep {
                        out.basins[other as usize].parent = Some(deepest);
                        out.basins[deepest as usize].children.push(other);
                    } else {
                        out.basins[other as usize].absorbed_into = Some(deepest);
                        out.basins[deepest as usize].absorbed.push(other);
                    }
                    uf[other as usize] = deepest;
                }
                deepest
            }
        };
        out.basins[target as usize].members.push(node);
        label[node as usize] = target;
    }

    debug!(
        "Watershed: {} basins, {} saddles",
        out.basins.len(),
        out.saddles
    );
    out
}

/// `(1 + δ_ridge) / (1 + δ_core)`, infinite for an empty core.
pub(crate) fn density_ratio(ridge: f64, core: f64) -> f64 {
    if 1.0 + core <= 0.0 {
        f64::INFINITY
    } else {
        (1.0 + ridge) / (1.0 + core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridSpec;
    use crate::Vector3;

    /// Periodic 1D chain of nodes with given densities.
    struct Chain(Vec<f64>);

    impl DensityGraph for Chain {
        fn len(&self) -> usize {
            self.0.len()
        }
        fn density(&self, node: usize) -> f64 {
            self.0[node]
        }
        fn volume(&self, _node: usize) -> f64 {
            1.0
        }
        fn position(&self, node: usize) -> Vector3 {
            Vector3::new(node as f64, 0.0, 0.0)
        }
        fn is_excluded(&self, _node: usize) -> bool {
            false
        }
        fn touches_boundary(&self, _node: usize) -> bool {
            false
        }
        fn neighbours(&self, node: usize, out: &mut Vec<u32>) {
            out.clear();
            let n = self.0.len();
            out.push(((node + n - 1) % n) as u32);
            out.push(((node + 1) % n) as u32);
        }
        fn periodic_box(&self) -> Option<&GridSpec> {
            None
        }
    }

    // Two dips separated by a ridge at -0.3
    fn two_dips() -> Chain {
        Chain(vec![0.5, -0.2, -0.8, -0.4, -0.3, -0.5, -0.6, -0.1, 0.4, 0.6])
    }

    #[test]
    fn flat_policy_merges_into_deepest() {
        let basins = flood(&two_dips(), 0.0, MergePolicy::Flat);
        assert_eq!(basins.basins.len(), 2);
        assert_eq!(basins.saddles, 1);
        let voids: Vec<u32> = (0..basins.basins.len() as u32)
            .filter(|&b| basins.basins[b as usize].is_void())
            .collect();
        assert_eq!(voids.len(), 1);
        let mut members = basins.all_members(voids[0]);
        members.sort_unstable();
        assert_eq!(members, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(basins.basins[voids[0] as usize].core, 2);
    }

    #[test]
    fn hierarchical_policy_keeps_significant_child() {
        // Ridge -0.3 over core -0.6: ratio 0.7 / 0.4 = 1.75
        let keep = flood(
            &two_dips(),
            0.0,
            MergePolicy::Hierarchical {
                min_density_ratio: 1.5,
            },
        );
        let child = keep
            .basins
            .iter()
            .find(|b| b.parent.is_some())
            .expect("child void");
        assert_eq!(child.core, 6);
        let mut members = child.members.clone();
        members.sort_unstable();
        assert_eq!(members, vec![5, 6]);

        let merge = flood(
            &two_dips(),
            0.0,
            MergePolicy::Hierarchical {
                min_density_ratio: 2.0,
            },
        );
        assert!(merge.basins.iter().all(|b| b.parent.is_none()));
        assert_eq!(merge.basins.iter().filter(|b| b.is_void()).count(), 1);
    }

    #[test]
    fn disjoint_policy_never_merges() {
        let basins = flood(&two_dips(), 0.0, MergePolicy::Disjoint);
        assert_eq!(basins.saddles, 1);
        assert!(basins
            .basins
            .iter()
            .all(|b| b.is_void() && b.parent.is_none() && b.absorbed.is_empty()));
        let mut first = basins.all_members(0);
        let mut second = basins.all_members(1);
        first.sort_unstable();
        second.sort_unstable();
        // The saddle at node 4 joins the deeper basin
        assert_eq!(first, vec![1, 2, 3, 4]);
        assert_eq!(second, vec![5, 6, 7]);
    }

    #[test]
    fn ties_break_on_lowest_index() {
        let flat = Chain(vec![-1.0; 6]);
        let basins = flood(&flat, 0.0, MergePolicy::Flat);
        assert_eq!(basins.basins.len(), 1);
        assert_eq!(basins.basins[0].core, 0);
        assert_eq!(basins.basins[0].members.len(), 6);
    }

    #[test]
    fn nothing_below_threshold_gives_no_basins() {
        let basins = flood(&two_dips(), -0.9, MergePolicy::Flat);
        assert!(basins.basins.is_empty());
    }

    #[test]
    fn empty_core_ratio_is_infinite() {
        assert!(density_ratio(0.0, -1.0).is_infinite());
        assert!((density_ratio(-0.5, -0.75) - 2.0).abs() < 1e-12);
    }
}
