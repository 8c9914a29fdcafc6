use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;

use anyhow::bail;
use anyhow::Result;
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::ClusteringConfig;
use crate::config::Linkage;
use crate::core::EntityId;

pub const ALGORITHM_NAMES: &[&str] =
    &["components", "louvain", "label_propagation", "hierarchical", "dbscan"];

const EPS: f64 = 1e-12;

/// Index-compressed weighted graph handed to the algorithms. Nodes are
/// every entity that appears in any relationship row (thresholded-out
/// entities stay as isolated nodes and come back as singleton clusters);
/// edges are the pairs at or above `min_weight`.
#[derive(Debug, Clone)]
pub struct CouplingGraph {
    nodes: Vec<EntityId>,
    adjacency: Vec<Vec<(usize, f64)>>,
}

impl CouplingGraph {
    /// `pairs` carries the selected weight column for every persisted edge;
    /// only those at or above `min_weight` become graph edges.
    pub fn build(pairs: &[(EntityId, EntityId, f64)], min_weight: f64) -> Self {
        let nodes: Vec<EntityId> =
            pairs.iter().flat_map(|&(a, b, _)| [a, b]).sorted_unstable().dedup().collect();
        let index: HashMap<EntityId, usize> =
            nodes.iter().enumerate().map(|(i, &id)| (id, i)).collect();

        let mut adjacency = vec![Vec::new(); nodes.len()];

        for &(a, b, weight) in pairs {
            if weight < min_weight || a == b {
                continue;
            }
            let (i, j) = (index[&a], index[&b]);
            adjacency[i].push((j, weight));
            adjacency[j].push((i, weight));
        }

        for list in &mut adjacency {
            list.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        }

        Self { nodes, adjacency }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> EntityId {
        self.nodes[index]
    }

    pub fn neighbors(&self, index: usize) -> &[(usize, f64)] {
        &self.adjacency[index]
    }

    fn edge_weight_sum(&self) -> f64 {
        self.adjacency.iter().enumerate()
            .flat_map(|(i, list)| list.iter().filter(move |(j, _)| *j > i))
            .map(|(_, w)| w)
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct ClusterParams {
    pub resolution: f64,
    pub seed: u64,
    pub max_iterations: usize,
    pub linkage: Linkage,
    pub cut_threshold: f64,
    pub eps: f64,
    pub min_samples: usize,
}

impl From<&ClusteringConfig> for ClusterParams {
    fn from(config: &ClusteringConfig) -> Self {
        Self {
            resolution: config.resolution,
            seed: config.seed,
            max_iterations: config.max_iterations,
            linkage: config.linkage,
            cut_threshold: config.cut_threshold,
            eps: config.eps,
            min_samples: config.min_samples,
        }
    }
}

/// An algorithm turns the graph into a partition: every node in exactly
/// one cluster.
pub trait ClusterAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, graph: &CouplingGraph, params: &ClusterParams) -> Result<Vec<Vec<EntityId>>>;
}

/// Algorithms registered at startup and dispatched by name from config.
pub struct AlgorithmRegistry {
    algorithms: Vec<Box<dyn ClusterAlgorithm>>,
}

impl AlgorithmRegistry {
    pub fn standard() -> Self {
        Self {
            algorithms: vec![
                Box::new(ConnectedComponents),
                Box::new(Louvain),
                Box::new(LabelPropagation),
                Box::new(Hierarchical),
                Box::new(Dbscan),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Result<&dyn ClusterAlgorithm> {
        match self.algorithms.iter().find(|a| a.name() == name) {
            Some(algorithm) => Ok(algorithm.as_ref()),
            None => bail!(
                "unknown clustering algorithm '{}' (expected one of: {})",
                name,
                ALGORITHM_NAMES.join(", ")
            ),
        }
    }
}

/// Order clusters and members deterministically: members ascending, then
/// clusters by size descending and first member ascending.
fn normalize(graph: &CouplingGraph, membership: &[usize]) -> Vec<Vec<EntityId>> {
    let mut groups: BTreeMap<usize, Vec<EntityId>> = BTreeMap::new();

    for (index, &label) in membership.iter().enumerate() {
        groups.entry(label).or_default().push(graph.node(index));
    }

    let mut clusters: Vec<Vec<EntityId>> = groups.into_values().collect();

    for cluster in &mut clusters {
        cluster.sort_unstable();
    }

    clusters.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a[0].cmp(&b[0])));
    clusters
}

struct ConnectedComponents;

impl ClusterAlgorithm for ConnectedComponents {
    fn name(&self) -> &'static str {
        "components"
    }

    fn run(&self, graph: &CouplingGraph, _params: &ClusterParams) -> Result<Vec<Vec<EntityId>>> {
        let n = graph.len();
        let mut label = vec![usize::MAX; n];
        let mut next = 0;

        for start in 0..n {
            if label[start] != usize::MAX {
                continue;
            }

            let mut queue = vec![start];
            label[start] = next;

            while let Some(node) = queue.pop() {
                for &(neighbor, _) in graph.neighbors(node) {
                    if label[neighbor] == usize::MAX {
                        label[neighbor] = next;
                        queue.push(neighbor);
                    }
                }
            }

            next += 1;
        }

        Ok(normalize(graph, &label))
    }
}

struct Louvain;

impl ClusterAlgorithm for Louvain {
    fn name(&self) -> &'static str {
        "louvain"
    }

    fn run(&self, graph: &CouplingGraph, params: &ClusterParams) -> Result<Vec<Vec<EntityId>>> {
        let n = graph.len();
        let total = graph.edge_weight_sum();

        if total <= 0.0 {
            let singleton: Vec<usize> = (0..n).collect();
            return Ok(normalize(graph, &singleton));
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut overall: Vec<usize> = (0..n).collect();

        let mut work = WorkGraph::from_graph(graph);

        for _level in 0..32 {
            let (membership, moved) = local_move(&work, params.resolution, &mut rng);

            if !moved {
                break;
            }

            let (renumbered, count) = renumber(&membership);

            for label in overall.iter_mut() {
                *label = renumbered[*label];
            }

            if count == work.len() {
                break;
            }

            work = work.aggregate(&renumbered, count);
        }

        Ok(normalize(graph, &overall))
    }
}

struct WorkGraph {
    adjacency: Vec<Vec<(usize, f64)>>,
    self_weight: Vec<f64>,
    two_m: f64,
}

impl WorkGraph {
    fn from_graph(graph: &CouplingGraph) -> Self {
        let adjacency = graph.adjacency.clone();
        let self_weight = vec![0.0; graph.len()];
        let two_m = 2.0 * graph.edge_weight_sum();
        Self { adjacency, self_weight, two_m }
    }

    fn len(&self) -> usize {
        self.adjacency.len()
    }

    fn degree(&self, node: usize) -> f64 {
        self.adjacency[node].iter().map(|(_, w)| w).sum::<f64>() + 2.0 * self.self_weight[node]
    }

    fn aggregate(&self, membership: &[usize], count: usize) -> WorkGraph {
        let mut adjacency: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); count];
        let mut self_weight = vec![0.0; count];

        for (node, &community) in membership.iter().enumerate() {
            self_weight[community] += self.self_weight[node];

            for &(neighbor, weight) in &self.adjacency[node] {
                if neighbor < node {
                    continue;
                }
                let other = membership[neighbor];
                if other == community {
                    self_weight[community] += weight;
                } else {
                    *adjacency[community].entry(other).or_default() += weight;
                    *adjacency[other].entry(community).or_default() += weight;
                }
            }
        }

        let adjacency = adjacency.into_iter().map(|m| m.into_iter().collect()).collect();
        Self { adjacency, self_weight, two_m: self.two_m }
    }
}

fn local_move(work: &WorkGraph, resolution: f64, rng: &mut StdRng) -> (Vec<usize>, bool) {
    let n = work.len();
    let degrees: Vec<f64> = (0..n).map(|i| work.degree(i)).collect();
    let mut community: Vec<usize> = (0..n).collect();
    let mut tot = degrees.clone();
    let mut moved_any = false;

    for _pass in 0..64 {
        let mut moved_this_pass = false;
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);

        for &node in &order {
            let k = degrees[node];
            let current = community[node];

            let mut links: BTreeMap<usize, f64> = BTreeMap::new();
            for &(neighbor, weight) in &work.adjacency[node] {
                if neighbor != node {
                    *links.entry(community[neighbor]).or_default() += weight;
                }
            }

            tot[current] -= k;

            let stay = links.get(&current).copied().unwrap_or(0.0)
                - resolution * tot[current] * k / work.two_m;
            let mut best = (current, stay);

            for (&candidate, &weight) in &links {
                let gain = weight - resolution * tot[candidate] * k / work.two_m;
                if gain > best.1 + EPS {
                    best = (candidate, gain);
                }
            }

            tot[best.0] += k;
            community[node] = best.0;

            if best.0 != current {
                moved_this_pass = true;
                moved_any = true;
            }
        }

        if !moved_this_pass {
            break;
        }
    }

    (community, moved_any)
}

fn renumber(membership: &[usize]) -> (Vec<usize>, usize) {
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    let mut result = Vec::with_capacity(membership.len());

    for &label in membership {
        let next = mapping.len();
        let compact = *mapping.entry(label).or_insert(next);
        result.push(compact);
    }

    (result, mapping.len())
}

struct LabelPropagation;

impl ClusterAlgorithm for LabelPropagation {
    fn name(&self) -> &'static str {
        "label_propagation"
    }

    fn run(&self, graph: &CouplingGraph, params: &ClusterParams) -> Result<Vec<Vec<EntityId>>> {
        let n = graph.len();
        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut label: Vec<usize> = (0..n).collect();

        for _iteration in 0..params.max_iterations.max(1) {
            let mut changed = false;
            let mut order: Vec<usize> = (0..n).collect();
            order.shuffle(&mut rng);

            for &node in &order {
                if graph.neighbors(node).is_empty() {
                    continue;
                }

                let mut votes: BTreeMap<usize, f64> = BTreeMap::new();
                for &(neighbor, weight) in graph.neighbors(node) {
                    *votes.entry(label[neighbor]).or_default() += weight;
                }

                // Heaviest label wins; ties go to the smallest label, which
                // BTreeMap iteration guarantees.
                let mut winner = (label[node], f64::MIN);
                for (&candidate, &weight) in &votes {
                    if weight > winner.1 + EPS {
                        winner = (candidate, weight);
                    }
                }

                if winner.0 != label[node] {
                    label[node] = winner.0;
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }

        Ok(normalize(graph, &label))
    }
}

struct Hierarchical;

impl ClusterAlgorithm for Hierarchical {
    fn name(&self) -> &'static str {
        "hierarchical"
    }

    /// Agglomerative merging on distance `1 - weight`, single cut. Pairs
    /// with no co-change edge sit at distance 1.0, so clusters only ever
    /// grow along real edges (for any cut below 1).
    fn run(&self, graph: &CouplingGraph, params: &ClusterParams) -> Result<Vec<Vec<EntityId>>> {
        let n = graph.len();
        let mut members: Vec<Option<Vec<usize>>> = (0..n).map(|i| Some(vec![i])).collect();

        // Sparse cluster-pair link stats over existing edges: (sum of
        // distances, max distance, edge count). Absent pairs are all-1.0.
        let mut links: HashMap<(usize, usize), (f64, f64, usize)> = HashMap::new();

        for i in 0..n {
            for &(j, weight) in graph.neighbors(i) {
                if j > i {
                    let distance = 1.0 - weight;
                    links.insert((i, j), (distance, distance, 1));
                }
            }
        }

        loop {
            let mut best: Option<((usize, usize), f64)> = None;

            for (&(a, b), &(sum, max, count)) in
                links.iter().sorted_by_key(|(&key, _)| key)
            {
                let size_a = members[a].as_ref().map_or(0, Vec::len);
                let size_b = members[b].as_ref().map_or(0, Vec::len);
                let possible = size_a * size_b;

                let distance = match params.linkage {
                    Linkage::Average => {
                        (sum + ((possible - count) as f64)) / possible as f64
                    }
                    Linkage::Complete => {
                        if count < possible {
                            1.0
                        } else {
                            max
                        }
                    }
                };

                if distance <= params.cut_threshold
                    && best.map_or(true, |(_, d)| distance < d - EPS)
                {
                    best = Some(((a, b), distance));
                }
            }

            let Some(((a, b), _)) = best else { break };

            // Merge b into a.
            let absorbed = members[b].take().expect("cluster b is active");
            members[a].as_mut().expect("cluster a is active").extend(absorbed);

            let mut merged: HashMap<usize, (f64, f64, usize)> = HashMap::new();

            for (&(x, y), &stats) in &links {
                let other = if x == a || x == b {
                    y
                } else if y == a || y == b {
                    x
                } else {
                    continue;
                };

                if other == a || other == b {
                    continue;
                }

                let entry = merged.entry(other).or_insert((0.0, 0.0, 0));
                entry.0 += stats.0;
                entry.1 = entry.1.max(stats.1);
                entry.2 += stats.2;
            }

            links.retain(|&(x, y), _| x != a && x != b && y != a && y != b);

            for (other, stats) in merged {
                links.insert((a.min(other), a.max(other)), stats);
            }
        }

        let mut label = vec![0usize; n];
        for (cluster, group) in members.iter().enumerate() {
            if let Some(group) = group {
                for &node in group {
                    label[node] = cluster;
                }
            }
        }

        Ok(normalize(graph, &label))
    }
}

struct Dbscan;

impl ClusterAlgorithm for Dbscan {
    fn name(&self) -> &'static str {
        "dbscan"
    }

    /// Density clustering on distance `1 - weight`. Noise points are
    /// emitted as singleton clusters so the result stays a partition.
    fn run(&self, graph: &CouplingGraph, params: &ClusterParams) -> Result<Vec<Vec<EntityId>>> {
        let n = graph.len();
        let min_weight = 1.0 - params.eps;

        let neighborhoods: Vec<Vec<usize>> = (0..n)
            .map(|i| {
                graph
                    .neighbors(i)
                    .iter()
                    .filter(|&&(_, w)| w >= min_weight)
                    .map(|&(j, _)| j)
                    .collect()
            })
            .collect();

        // The point itself counts toward density.
        let core: Vec<bool> =
            neighborhoods.iter().map(|nb| nb.len() + 1 >= params.min_samples).collect();

        let mut label: Vec<Option<usize>> = vec![None; n];
        let mut next = 0;

        for start in 0..n {
            if label[start].is_some() || !core[start] {
                continue;
            }

            label[start] = Some(next);
            let mut queue = vec![start];

            while let Some(node) = queue.pop() {
                for &neighbor in &neighborhoods[node] {
                    if label[neighbor].is_none() {
                        label[neighbor] = Some(next);
                        if core[neighbor] {
                            queue.push(neighbor);
                        }
                    }
                }
            }

            next += 1;
        }

        // Unclaimed points become singletons.
        let mut final_label = vec![0usize; n];
        for (node, assigned) in label.iter().enumerate() {
            final_label[node] = match assigned {
                Some(cluster) => *cluster,
                None => {
                    next += 1;
                    next - 1
                }
            };
        }

        Ok(normalize(graph, &final_label))
    }
}

const GENERIC_TOKENS: &[&str] = &[
    "index", "util", "utils", "helper", "helpers", "model", "models", "test", "tests", "spec",
    "main", "mod", "lib", "core", "common", "base", "impl", "get", "set", "handle", "make",
    "create", "new", "init", "data", "src", "app", "file", "files", "type", "types",
];

/// Pick a human name from the most frequent meaningful path tokens. `None`
/// when nothing meaningful remains; callers fall back to `Cluster N`.
pub fn smart_name(paths: &[&str]) -> Option<String> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();

    for path in paths {
        let mut seen = HashSet::new();

        for segment in path.split('/') {
            let stem = segment.split('.').next().unwrap_or(segment);

            for token in stem.split(|c: char| c == '_' || c == '-') {
                let token = token.to_lowercase();

                if token.len() < 3
                    || GENERIC_TOKENS.contains(&token.as_str())
                    || token.chars().all(|c| c.is_ascii_digit())
                {
                    continue;
                }

                if seen.insert(token.clone()) {
                    *counts.entry(token).or_default() += 1;
                }
            }
        }
    }

    let picked: Vec<String> = counts
        .iter()
        .filter(|(_, &count)| count >= 2.min(paths.len()))
        .sorted_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)))
        .take(2)
        .map(|(token, _)| {
            let mut chars = token.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();

    if picked.is_empty() {
        None
    } else {
        Some(picked.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ClusterParams {
        ClusterParams::from(&ClusteringConfig::default())
    }

    fn two_triangles() -> Vec<(EntityId, EntityId, f64)> {
        // A tight triangle {1, 2, 3}, a tight triangle {4, 5, 6}, one weak
        // bridge between them.
        vec![
            (1, 2, 0.9),
            (1, 3, 0.8),
            (2, 3, 0.9),
            (4, 5, 0.9),
            (4, 6, 0.8),
            (5, 6, 0.9),
            (3, 4, 0.1),
        ]
    }

    fn assert_partition(graph: &CouplingGraph, clusters: &[Vec<EntityId>]) {
        let mut seen = HashSet::new();
        for cluster in clusters {
            for &entity in cluster {
                assert!(seen.insert(entity), "entity {} appears twice", entity);
            }
        }
        assert_eq!(seen.len(), graph.len(), "partition must cover every node");
    }

    #[test]
    fn every_algorithm_yields_a_partition() {
        let graph = CouplingGraph::build(&two_triangles(), 0.0);
        let registry = AlgorithmRegistry::standard();

        for name in ALGORITHM_NAMES {
            let clusters = registry.get(name).unwrap().run(&graph, &params()).unwrap();
            assert_partition(&graph, &clusters);
        }
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let registry = AlgorithmRegistry::standard();
        assert!(registry.get("kmeans").is_err());
    }

    #[test]
    fn components_respect_the_weight_threshold() {
        // The 0.1 bridge is below min_weight, splitting the triangles.
        let graph = CouplingGraph::build(&two_triangles(), 0.5);
        let clusters =
            AlgorithmRegistry::standard().get("components").unwrap().run(&graph, &params()).unwrap();

        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0], vec![1, 2, 3]);
        assert_eq!(clusters[1], vec![4, 5, 6]);
    }

    #[test]
    fn louvain_separates_dense_groups() {
        let graph = CouplingGraph::build(&two_triangles(), 0.0);
        let clusters =
            AlgorithmRegistry::standard().get("louvain").unwrap().run(&graph, &params()).unwrap();

        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0], vec![1, 2, 3]);
        assert_eq!(clusters[1], vec![4, 5, 6]);
    }

    #[test]
    fn louvain_is_deterministic_under_a_fixed_seed() {
        let graph = CouplingGraph::build(&two_triangles(), 0.0);
        let algorithm = AlgorithmRegistry::standard();
        let louvain = algorithm.get("louvain").unwrap();

        let first = louvain.run(&graph, &params()).unwrap();
        let second = louvain.run(&graph, &params()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn label_propagation_finds_the_same_groups() {
        let graph = CouplingGraph::build(&two_triangles(), 0.0);
        let clusters = AlgorithmRegistry::standard()
            .get("label_propagation")
            .unwrap()
            .run(&graph, &params())
            .unwrap();

        assert_partition(&graph, &clusters);
        assert!(clusters.len() >= 2);
        let first: HashSet<EntityId> = clusters[0].iter().copied().collect();
        assert!(first == [1, 2, 3].into() || first == [4, 5, 6].into());
    }

    #[test]
    fn hierarchical_cuts_at_the_threshold() {
        let graph = CouplingGraph::build(&two_triangles(), 0.0);
        let mut p = params();
        p.cut_threshold = 0.3;
        let clusters =
            AlgorithmRegistry::standard().get("hierarchical").unwrap().run(&graph, &p).unwrap();

        assert_partition(&graph, &clusters);
        // The 0.1-weight bridge sits at distance 0.9, far above the cut.
        assert!(clusters.iter().all(|c| c.len() <= 3));
        assert!(clusters.contains(&vec![1, 2, 3]) || clusters.iter().any(|c| c.len() > 1));
    }

    #[test]
    fn dbscan_marks_sparse_points_as_singletons() {
        let mut p = params();
        p.eps = 0.25;
        p.min_samples = 2;

        let pairs = vec![(1, 2, 0.9), (2, 3, 0.85), (3, 9, 0.1)];
        let graph = CouplingGraph::build(&pairs, 0.0);
        let clusters =
            AlgorithmRegistry::standard().get("dbscan").unwrap().run(&graph, &p).unwrap();

        assert_partition(&graph, &clusters);
        assert_eq!(clusters[0], vec![1, 2, 3]);
        assert!(clusters.iter().any(|c| c == &vec![9]));
    }

    #[test]
    fn sparse_graphs_come_back_as_singletons() {
        // min_weight above every edge: all nodes isolated, one cluster each.
        let graph = CouplingGraph::build(&two_triangles(), 0.99);
        let clusters =
            AlgorithmRegistry::standard().get("louvain").unwrap().run(&graph, &params()).unwrap();
        assert_eq!(clusters.len(), 6);
        assert!(clusters.iter().all(|c| c.len() == 1));
    }

    #[test]
    fn smart_names_skip_generic_tokens() {
        let paths = vec![
            "billing/invoice_builder.rs",
            "billing/invoice_model.rs",
            "billing/tests/invoice_spec.rs",
        ];
        let name = smart_name(&paths).unwrap();
        assert!(name.contains("Invoice"), "got '{}'", name);
        assert!(!name.contains("Tests"));
    }

    #[test]
    fn smart_name_gives_up_on_generic_paths() {
        assert_eq!(smart_name(&["lib.rs", "mod.rs"]), None);
        assert_eq!(smart_name(&[]), None);
    }
}
