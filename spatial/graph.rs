use crate::logdet::ParameterInterval;
use crate::weights::{Neighbours, SpatialWeights, WeightsStyle};
use ahash::AHashSet;
use std::collections::VecDeque;

/// Connected-component labelling of a neighbour relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Components {
    /// Component id of each entity, numbered in order of first appearance.
    pub labels: Vec<usize>,
    pub count: usize,
}

impl Components {
    /// Number of entities in each component.
    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.count];
        for &label in &self.labels {
            sizes[label] += 1;
        }
        sizes
    }
}

/// Undirected closure of the relation: asymmetric links count in both directions.
fn undirected(nb: &Neighbours) -> Vec<Vec<usize>> {
    let mut adjacency: Vec<Vec<usize>> = nb.lists().to_vec();
    for (i, list) in nb.lists().iter().enumerate() {
        for &j in list {
            if !nb.get(j).contains(&i) {
                adjacency[j].push(i);
            }
        }
    }
    adjacency
}

/// Breadth-first component labelling; isolates form singleton components.
pub fn components(nb: &Neighbours) -> Components {
    let adjacency = undirected(nb);
    let n = adjacency.len();
    let mut labels = vec![usize::MAX; n];
    let mut count = 0;
    let mut queue = VecDeque::new();
    for start in 0..n {
        if labels[start] != usize::MAX {
            continue;
        }
        labels[start] = count;
        queue.push_back(start);
        while let Some(i) = queue.pop_front() {
            for &j in &adjacency[i] {
                if labels[j] == usize::MAX {
                    labels[j] = count;
                    queue.push_back(j);
                }
            }
        }
        count += 1;
    }
    Components { labels, count }
}

/// True when no two neighbours of any entity are themselves neighbours.
///
/// Equivalently, linked entities never share a neighbour: `N(i) ∩ N(j)` is
/// empty for every link `i - j`.
pub fn is_cyclical(nb: &Neighbours) -> bool {
    let adjacency = undirected(nb);
    let sets: Vec<AHashSet<usize>> = adjacency
        .iter()
        .map(|list| list.iter().copied().collect())
        .collect();
    adjacency.iter().enumerate().all(|(i, list)| {
        list.iter()
            .all(|&j| sets[i].iter().all(|k| !sets[j].contains(k)))
    })
}

/// Two-colouring check of the undirected closure.
pub fn is_bipartite(nb: &Neighbours) -> bool {
    bipartite_components(nb).iter().all(|&(_, bipartite)| bipartite)
}

/// `(component size, bipartite)` for every component.
fn bipartite_components(nb: &Neighbours) -> Vec<(usize, bool)> {
    let adjacency = undirected(nb);
    let n = adjacency.len();
    let mut colour: Vec<Option<bool>> = vec![None; n];
    let mut out = Vec::new();
    let mut queue = VecDeque::new();
    for start in 0..n {
        if colour[start].is_some() {
            continue;
        }
        colour[start] = Some(false);
        queue.push_back(start);
        let mut size = 0;
        let mut bipartite = true;
        while let Some(i) = queue.pop_front() {
            size += 1;
            let ci = colour[i] == Some(true);
            for &j in &adjacency[i] {
                match colour[j] {
                    None => {
                        colour[j] = Some(!ci);
                        queue.push_back(j);
                    }
                    Some(cj) if cj == ci => bipartite = false,
                    Some(_) => {}
                }
            }
        }
        out.push((size, bipartite));
    }
    out
}

/// Admissible coefficient interval implied by the graph alone.
///
/// Row-standardised weights over a symmetric relation have largest eigenvalue
/// one, and a bipartite component with at least one link contributes the
/// eigenvalue minus one. When both hold the interval is `(-1, 1)`; otherwise an
/// eigen solve is needed and `None` is returned.
pub fn structural_interval(weights: &SpatialWeights) -> Option<ParameterInterval> {
    if weights.style() != WeightsStyle::W {
        return None;
    }
    let nb = weights.neighbours();
    if nb.link_count() == 0 || !nb.is_symmetric() {
        return None;
    }
    let has_bipartite_block = bipartite_components(nb)
        .iter()
        .any(|&(size, bipartite)| size > 1 && bipartite);
    has_bipartite_block.then_some(ParameterInterval {
        lower: -1.0,
        upper: 1.0,
    })
}
