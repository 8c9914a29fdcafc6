use std::collections::HashMap;
use std::collections::HashSet;
use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use itertools::Itertools;
use rayon::prelude::*;

use crate::changesets::LogicalChangeset;
use crate::config::AnalysisConfig;
use crate::core::ComponentEdgeRow;
use crate::core::EntityId;
use crate::core::RelationshipRow;

/// Changesets per parallel accumulation shard.
const SHARD_SIZE: usize = 8_192;

/// Changesets held in memory before the buffer spills a segment to disk.
const BUFFER_SEGMENT: usize = 100_000;

type PairKey = (EntityId, EntityId);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct PairAcc {
    count: u64,
    shared_w: f64,
    shared_decayed: f64,
}

impl PairAcc {
    fn merge(&mut self, other: &PairAcc) {
        self.count += other.count;
        self.shared_w += other.shared_w;
        self.shared_decayed += other.shared_decayed;
    }
}

#[derive(Debug, Default)]
pub struct EdgeBuildOutcome {
    pub relationships: Vec<RelationshipRow>,
    pub component_edges: Vec<ComponentEdgeRow>,
    pub changeset_count: u64,
    /// Entities pruned by `min_revisions` before pair enumeration. This is
    /// the prune reported to consumers, distinct from per-file commit
    /// counts shown in hotspot views.
    pub pruned_entities: u64,
}

/// Build the weighted co-change graph from a stream of logical changesets.
///
/// Two passes: the first accumulates per-entity supports while the stream
/// is buffered (spilling past a memory bound), the second enumerates pairs
/// among surviving entities. Pair accumulation is associative and
/// commutative, so shard outputs merge in a fixed order regardless of how
/// workers interleave.
pub fn build_edges<I>(
    config: &AnalysisConfig,
    reference_ts: i64,
    changesets: I,
    component_of: &HashMap<EntityId, EntityId>,
    tick: &mut dyn FnMut(u64, u64) -> Result<()>,
) -> Result<EdgeBuildOutcome>
where
    I: IntoIterator<Item = LogicalChangeset>,
{
    let decay = config.decay_half_life_days;
    let mut buffer = ChangesetBuffer::new(BUFFER_SEGMENT);

    let mut support: HashMap<EntityId, u64> = HashMap::new();
    let mut wsupport: HashMap<EntityId, f64> = HashMap::new();
    let mut dsupport: HashMap<EntityId, f64> = HashMap::new();
    let mut comp_support: HashMap<EntityId, u64> = HashMap::new();
    let mut comp_cooccurrence: HashMap<PairKey, u64> = HashMap::new();
    let mut ingested = 0u64;

    for changeset in changesets {
        let decayed_w = decayed_weight(changeset.weight, changeset.timestamp, reference_ts, decay);

        for &entity in &changeset.entities {
            *support.entry(entity).or_default() += 1;
            *wsupport.entry(entity).or_default() += changeset.weight;
            *dsupport.entry(entity).or_default() += decayed_w;
        }

        let components: Vec<EntityId> = changeset
            .entities
            .iter()
            .filter_map(|e| component_of.get(e).copied())
            .unique()
            .sorted_unstable()
            .collect();

        for &component in &components {
            *comp_support.entry(component).or_default() += 1;
        }

        for (i, &a) in components.iter().enumerate() {
            for &b in &components[i + 1..] {
                *comp_cooccurrence.entry((a, b)).or_default() += 1;
            }
        }

        buffer.push(changeset)?;
        ingested += 1;

        if ingested % 10_000 == 0 {
            tick(ingested, 0)?;
        }
    }

    let eligible: HashSet<EntityId> = support
        .iter()
        .filter(|(_, &count)| count as i64 >= config.min_revisions)
        .map(|(&entity, _)| entity)
        .collect();
    let pruned_entities = (support.len() - eligible.len()) as u64;

    // Pass 2: pair enumeration over the buffered stream.
    let mut pairs = PairTable::new(config.max_active_pairs);
    let mut processed = 0u64;
    let total = buffer.len() as u64;

    buffer.replay_chunks(SHARD_SIZE, &mut |chunk| {
        let part_size = (chunk.len() / rayon::current_num_threads().max(1)).max(1_024);
        let shard_maps: Vec<HashMap<PairKey, PairAcc>> = chunk
            .par_chunks(part_size)
            .map(|part| accumulate_shard(part, &eligible, reference_ts, decay))
            .collect();

        // Merge in shard order: float sums stay deterministic run to run.
        for map in shard_maps {
            for (key, acc) in map.into_iter().sorted_by_key(|(key, _)| *key) {
                pairs.add(key, acc);
            }
        }
        pairs.maybe_spill()?;

        processed += chunk.len() as u64;
        tick(processed, total)
    })?;

    let mut relationships = Vec::new();

    pairs.drain_sorted(&mut |(src, dst), acc| {
        if (acc.count as i64) < config.min_cooccurrence {
            return Ok(());
        }

        let support_src = support[&src] as i64;
        let support_dst = support[&dst] as i64;
        let pair_count = acc.count as i64;

        let union = (support_src + support_dst - pair_count) as f64;
        let jaccard = pair_count as f64 / union;

        let w_union = wsupport[&src] + wsupport[&dst] - acc.shared_w;
        let jaccard_weighted = if w_union > 0.0 { acc.shared_w / w_union } else { 0.0 };

        let decayed_weight = decay.map(|_| {
            let d_union = dsupport[&src] + dsupport[&dst] - acc.shared_decayed;
            if d_union > 0.0 {
                acc.shared_decayed / d_union
            } else {
                0.0
            }
        });

        relationships.push(RelationshipRow {
            src_id: src,
            dst_id: dst,
            weight: jaccard,
            support_src,
            support_dst,
            pair_count,
            p_dst_given_src: pair_count as f64 / support_src as f64,
            p_src_given_dst: pair_count as f64 / support_dst as f64,
            jaccard_weighted,
            decayed_weight,
        });
        Ok(())
    })?;

    let component_edges = project_components(
        config,
        &relationships,
        component_of,
        &comp_support,
        &comp_cooccurrence,
    );

    let relationships = apply_topk(relationships, config.topk_edges_per_file);

    Ok(EdgeBuildOutcome {
        relationships,
        component_edges,
        changeset_count: ingested,
        pruned_entities,
    })
}

fn decayed_weight(weight: f64, timestamp: i64, reference_ts: i64, half_life: Option<f64>) -> f64 {
    match half_life {
        Some(half_life) => {
            let age_days = ((reference_ts - timestamp).max(0) as f64) / 86_400.0;
            weight * (-std::f64::consts::LN_2 * age_days / half_life).exp()
        }
        None => weight,
    }
}

fn accumulate_shard(
    changesets: &[LogicalChangeset],
    eligible: &HashSet<EntityId>,
    reference_ts: i64,
    decay: Option<f64>,
) -> HashMap<PairKey, PairAcc> {
    let mut map: HashMap<PairKey, PairAcc> = HashMap::new();

    for changeset in changesets {
        let members: Vec<EntityId> =
            changeset.entities.iter().copied().filter(|e| eligible.contains(e)).collect();
        let decayed = decayed_weight(changeset.weight, changeset.timestamp, reference_ts, decay);

        for (i, &a) in members.iter().enumerate() {
            for &b in &members[i + 1..] {
                // Entities are sorted within a changeset, so (a, b) is
                // already canonical.
                let acc = map.entry((a, b)).or_default();
                acc.count += 1;
                acc.shared_w += changeset.weight;
                acc.shared_decayed += decayed;
            }
        }
    }

    map
}

/// Keep an edge iff it ranks in the top K neighbors of at least one
/// endpoint (by primary weight, ties broken by neighbor id).
fn apply_topk(relationships: Vec<RelationshipRow>, k: usize) -> Vec<RelationshipRow> {
    if k == 0 {
        return relationships;
    }

    let mut by_endpoint: HashMap<EntityId, Vec<usize>> = HashMap::new();

    for (index, rel) in relationships.iter().enumerate() {
        by_endpoint.entry(rel.src_id).or_default().push(index);
        by_endpoint.entry(rel.dst_id).or_default().push(index);
    }

    let mut keep = vec![false; relationships.len()];

    for (&entity, indices) in &by_endpoint {
        let ranked = indices
            .iter()
            .sorted_by(|&&a, &&b| {
                let ra = &relationships[a];
                let rb = &relationships[b];
                rb.weight
                    .partial_cmp(&ra.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| other_endpoint(ra, entity).cmp(&other_endpoint(rb, entity)))
            })
            .take(k);

        for &index in ranked {
            keep[index] = true;
        }
    }

    relationships.into_iter().enumerate().filter(|(i, _)| keep[*i]).map(|(_, r)| r).collect()
}

fn other_endpoint(rel: &RelationshipRow, entity: EntityId) -> EntityId {
    if rel.src_id == entity {
        rel.dst_id
    } else {
        rel.src_id
    }
}

/// Aggregate file edges to folder-component granularity. Intra-component
/// edges stay file-level only; the jaccard is computed from changeset-level
/// component co-occurrence (summed file pair counts are not a set measure).
fn project_components(
    config: &AnalysisConfig,
    relationships: &[RelationshipRow],
    component_of: &HashMap<EntityId, EntityId>,
    comp_support: &HashMap<EntityId, u64>,
    comp_cooccurrence: &HashMap<PairKey, u64>,
) -> Vec<ComponentEdgeRow> {
    let mut aggregated: HashMap<PairKey, (i64, i64)> = HashMap::new();

    for rel in relationships {
        let (Some(&ca), Some(&cb)) = (component_of.get(&rel.src_id), component_of.get(&rel.dst_id))
        else {
            continue;
        };

        if ca == cb {
            continue;
        }

        let key = (ca.min(cb), ca.max(cb));
        let entry = aggregated.entry(key).or_default();
        entry.0 += rel.pair_count;
        entry.1 += 1;
    }

    let mut edges = Vec::new();

    for ((src, dst), (pair_count, file_edge_count)) in
        aggregated.into_iter().sorted_by_key(|(key, _)| *key)
    {
        if pair_count < config.min_component_cooccurrence {
            continue;
        }

        let cooccurrence = comp_cooccurrence.get(&(src, dst)).copied().unwrap_or(0) as i64;
        let support_src = comp_support.get(&src).copied().unwrap_or(0) as i64;
        let support_dst = comp_support.get(&dst).copied().unwrap_or(0) as i64;
        let union = support_src + support_dst - cooccurrence;
        let jaccard = if union > 0 { cooccurrence as f64 / union as f64 } else { 0.0 };

        edges.push(ComponentEdgeRow {
            src_id: src,
            dst_id: dst,
            pair_count,
            cooccurrence,
            jaccard,
            file_edge_count,
        });
    }

    edges
}

/// Holds the changeset stream for the second pass, spilling JSON-line
/// segments to a temp dir past the in-memory bound.
struct ChangesetBuffer {
    memory: Vec<LogicalChangeset>,
    segment_size: usize,
    spill_dir: Option<tempfile::TempDir>,
    segments: Vec<PathBuf>,
}

impl ChangesetBuffer {
    fn new(segment_size: usize) -> Self {
        Self { memory: Vec::new(), segment_size, spill_dir: None, segments: Vec::new() }
    }

    fn len(&self) -> usize {
        self.memory.len() + self.segments.len() * self.segment_size
    }

    fn push(&mut self, changeset: LogicalChangeset) -> Result<()> {
        self.memory.push(changeset);

        if self.memory.len() >= self.segment_size {
            self.spill()?;
        }

        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        if self.spill_dir.is_none() {
            self.spill_dir = Some(tempfile::TempDir::new().context("failed to create spill dir")?);
        }

        let dir = self.spill_dir.as_ref().expect("created above");
        let path = dir.path().join(format!("changesets-{}.jsonl", self.segments.len()));
        let mut writer = BufWriter::new(std::fs::File::create(&path)?);

        for changeset in &self.memory {
            serde_json::to_writer(&mut writer, changeset)?;
            writer.write_all(b"\n")?;
        }

        writer.flush()?;
        self.segments.push(path);
        self.memory.clear();
        log::debug!("spilled changeset segment {} to disk", self.segments.len());
        Ok(())
    }

    fn replay_chunks(
        &self,
        chunk_size: usize,
        f: &mut dyn FnMut(&[LogicalChangeset]) -> Result<()>,
    ) -> Result<()> {
        for path in &self.segments {
            let reader = BufReader::new(std::fs::File::open(path)?);
            let mut chunk = Vec::with_capacity(chunk_size);

            for line in reader.lines() {
                let line = line?;
                chunk.push(serde_json::from_str(&line)?);

                if chunk.len() >= chunk_size {
                    f(&chunk)?;
                    chunk.clear();
                }
            }

            if !chunk.is_empty() {
                f(&chunk)?;
            }
        }

        for chunk in self.memory.chunks(chunk_size) {
            f(chunk)?;
        }

        Ok(())
    }
}

/// Active-pair map with sorted-run spilling. Keys drain in canonical order
/// with duplicate keys combined across runs, so downstream rows come out
/// identical however the spilling fell.
struct PairTable {
    live: HashMap<PairKey, PairAcc>,
    limit: usize,
    spill_dir: Option<tempfile::TempDir>,
    runs: Vec<PathBuf>,
}

impl PairTable {
    fn new(limit: usize) -> Self {
        Self { live: HashMap::new(), limit: limit.max(1), spill_dir: None, runs: Vec::new() }
    }

    fn add(&mut self, key: PairKey, acc: PairAcc) {
        self.live.entry(key).or_default().merge(&acc);
    }

    fn maybe_spill(&mut self) -> Result<()> {
        if self.live.len() < self.limit {
            return Ok(());
        }

        if self.spill_dir.is_none() {
            self.spill_dir = Some(tempfile::TempDir::new().context("failed to create spill dir")?);
        }

        let dir = self.spill_dir.as_ref().expect("created above");
        let path = dir.path().join(format!("pairs-{}.jsonl", self.runs.len()));
        let mut writer = BufWriter::new(std::fs::File::create(&path)?);

        for (key, acc) in std::mem::take(&mut self.live).into_iter().sorted_by_key(|(key, _)| *key)
        {
            let row = (key.0, key.1, acc.count, acc.shared_w, acc.shared_decayed);
            serde_json::to_writer(&mut writer, &row)?;
            writer.write_all(b"\n")?;
        }

        writer.flush()?;
        self.runs.push(path);
        log::debug!("spilled pair run {} to disk", self.runs.len());
        Ok(())
    }

    fn drain_sorted(
        mut self,
        f: &mut dyn FnMut(PairKey, PairAcc) -> Result<()>,
    ) -> Result<()> {
        let live: Vec<(PairKey, PairAcc)> =
            std::mem::take(&mut self.live).into_iter().sorted_by_key(|(key, _)| *key).collect();

        if self.runs.is_empty() {
            for (key, acc) in live {
                f(key, acc)?;
            }
            return Ok(());
        }

        let mut sources: Vec<Box<dyn Iterator<Item = Result<(PairKey, PairAcc)>>>> = Vec::new();

        for path in &self.runs {
            let reader = BufReader::new(std::fs::File::open(path)?);
            sources.push(Box::new(reader.lines().map(|line| {
                let line = line?;
                let (a, b, count, shared_w, shared_decayed): (i64, i64, u64, f64, f64) =
                    serde_json::from_str(&line)?;
                Ok(((a, b), PairAcc { count, shared_w, shared_decayed }))
            })));
        }

        sources.push(Box::new(live.into_iter().map(Ok)));

        // K-way merge over sorted runs; same-key entries combine in run
        // order.
        let mut heads: Vec<Option<(PairKey, PairAcc)>> = Vec::with_capacity(sources.len());
        for source in &mut sources {
            heads.push(source.next().transpose()?);
        }

        loop {
            let min_key = match heads.iter().flatten().map(|(key, _)| *key).min() {
                Some(key) => key,
                None => break,
            };

            let mut combined = PairAcc::default();

            for (index, head) in heads.iter_mut().enumerate() {
                while matches!(head, Some((key, _)) if *key == min_key) {
                    if let Some((_, acc)) = head.take() {
                        combined.merge(&acc);
                    }
                    *head = sources[index].next().transpose()?;
                }
            }

            f(min_key, combined)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changesets::changeset_weight;

    fn changeset(key: &str, entities: Vec<EntityId>, timestamp: i64) -> LogicalChangeset {
        let weight = changeset_weight(entities.len());
        LogicalChangeset { key: key.to_string(), entities, weight, timestamp }
    }

    fn build(
        config: &AnalysisConfig,
        changesets: Vec<LogicalChangeset>,
    ) -> EdgeBuildOutcome {
        build_edges(config, 0, changesets, &HashMap::new(), &mut |_, _| Ok(())).unwrap()
    }

    fn lockfile_history() -> Vec<LogicalChangeset> {
        // package.json (1) in 522 changesets, package-lock.json (2) in 525,
        // both together in 498.
        let mut changesets = Vec::new();
        for i in 0..498 {
            changesets.push(changeset(&format!("both-{}", i), vec![1, 2], i));
        }
        for i in 0..24 {
            changesets.push(changeset(&format!("a-{}", i), vec![1], 600 + i));
        }
        for i in 0..27 {
            changesets.push(changeset(&format!("b-{}", i), vec![2], 700 + i));
        }
        changesets
    }

    #[test]
    fn lockfile_coupling_matches_expected_jaccard() {
        let config = AnalysisConfig::default();
        let outcome = build(&config, lockfile_history());

        assert_eq!(outcome.relationships.len(), 1);
        let rel = &outcome.relationships[0];
        assert_eq!((rel.src_id, rel.dst_id), (1, 2));
        assert_eq!(rel.pair_count, 498);
        assert_eq!((rel.support_src, rel.support_dst), (522, 525));
        assert!((rel.weight - 0.9070).abs() < 0.001, "jaccard was {}", rel.weight);
        assert!((rel.p_dst_given_src - 498.0 / 522.0).abs() < 1e-9);
        assert!((rel.p_src_given_dst - 498.0 / 525.0).abs() < 1e-9);
        assert!(rel.decayed_weight.is_none());
    }

    #[test]
    fn invariants_hold_on_a_mixed_history() {
        let config = AnalysisConfig { min_revisions: 2, min_cooccurrence: 2, ..Default::default() };
        let mut changesets = Vec::new();
        for i in 0..6 {
            changesets.push(changeset(&format!("ab-{}", i), vec![1, 2], i));
        }
        for i in 0..3 {
            changesets.push(changeset(&format!("bc-{}", i), vec![2, 3], 100 + i));
        }
        changesets.push(changeset("c", vec![3], 200));

        let outcome = build(&config, changesets);

        for rel in &outcome.relationships {
            assert!(rel.src_id < rel.dst_id);
            assert!(rel.pair_count <= rel.support_src.min(rel.support_dst));
            let expected = rel.pair_count as f64
                / (rel.support_src + rel.support_dst - rel.pair_count) as f64;
            assert!((rel.weight - expected).abs() < 1e-12);
            assert!(rel.pair_count >= config.min_cooccurrence);
        }
    }

    #[test]
    fn min_revisions_prunes_before_pairing() {
        let config = AnalysisConfig { min_revisions: 5, min_cooccurrence: 1, ..Default::default() };

        // Entities 1 and 2 co-change 3 times; neither reaches 5 appearances.
        let changesets =
            (0..3).map(|i| changeset(&format!("c{}", i), vec![1, 2], i)).collect::<Vec<_>>();

        let outcome = build(&config, changesets);
        assert!(outcome.relationships.is_empty());
        assert_eq!(outcome.pruned_entities, 2);
    }

    #[test]
    fn jaccard_weighted_uses_changeset_weights() {
        let config = AnalysisConfig { min_revisions: 1, min_cooccurrence: 1, ..Default::default() };

        // One shared changeset of size 3 (w = 0.5), one singleton each side.
        let changesets = vec![
            changeset("shared", vec![1, 2, 3], 0),
            changeset("a", vec![1], 1),
            changeset("b", vec![2], 2),
        ];

        let outcome = build(&config, changesets);
        let rel = outcome.relationships.iter().find(|r| (r.src_id, r.dst_id) == (1, 2)).unwrap();

        // Shared w = 0.5; union w = (0.5 + 1) + (0.5 + 1) - 0.5 = 2.5.
        assert!((rel.jaccard_weighted - 0.5 / 2.5).abs() < 1e-12);
        // Plain jaccard counts changesets: 1 / (2 + 2 - 1).
        assert!((rel.weight - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn decay_discounts_old_changesets() {
        let reference = 200 * 86_400;
        let config = AnalysisConfig {
            min_revisions: 1,
            min_cooccurrence: 1,
            decay_half_life_days: Some(100.0),
            ..Default::default()
        };

        // Pair (1, 2) co-changes only at t = 0; pair (1, 3) only at the
        // reference instant. Same counts, different recency.
        let changesets = vec![
            changeset("old", vec![1, 2], 0),
            changeset("new", vec![1, 3], reference),
        ];

        let outcome =
            build_edges(&config, reference, changesets, &HashMap::new(), &mut |_, _| Ok(()))
                .unwrap();

        let old = outcome.relationships.iter().find(|r| r.dst_id == 2).unwrap();
        let new = outcome.relationships.iter().find(|r| r.dst_id == 3).unwrap();

        let old_decayed = old.decayed_weight.unwrap();
        let new_decayed = new.decayed_weight.unwrap();
        assert!(old_decayed < new_decayed, "{} vs {}", old_decayed, new_decayed);
        assert_eq!(old.pair_count, new.pair_count);
    }

    #[test]
    fn topk_keeps_edges_in_either_endpoints_top_k() {
        let config = AnalysisConfig {
            min_revisions: 1,
            min_cooccurrence: 1,
            topk_edges_per_file: 1,
            ..Default::default()
        };

        // Hub 1 pairs strongly with 2 (twice) and weakly with 3 (once).
        // The (1, 3) edge is 3's best edge, so it must survive the cap.
        let changesets = vec![
            changeset("h1", vec![1, 2], 0),
            changeset("h2", vec![1, 2], 1),
            changeset("h3", vec![1, 3], 2),
        ];

        let outcome = build(&config, changesets);
        let pairs: Vec<PairKey> =
            outcome.relationships.iter().map(|r| (r.src_id, r.dst_id)).collect();
        assert!(pairs.contains(&(1, 2)));
        assert!(pairs.contains(&(1, 3)));
    }

    #[test]
    fn components_aggregate_crossing_edges_only() {
        let config = AnalysisConfig {
            min_revisions: 1,
            min_cooccurrence: 1,
            min_component_cooccurrence: 1,
            ..Default::default()
        };

        // Files 1, 2 live in component 100; file 3 in component 200.
        let component_of: HashMap<EntityId, EntityId> =
            [(1, 100), (2, 100), (3, 200)].into_iter().collect();

        let changesets = vec![
            changeset("x1", vec![1, 2], 0),
            changeset("x2", vec![1, 3], 1),
            changeset("x3", vec![1, 3], 2),
            changeset("x4", vec![2, 3], 3),
        ];

        let outcome =
            build_edges(&config, 10, changesets, &component_of, &mut |_, _| Ok(())).unwrap();

        assert_eq!(outcome.component_edges.len(), 1);
        let edge = &outcome.component_edges[0];
        assert_eq!((edge.src_id, edge.dst_id), (100, 200));
        // (1,3) pair_count 2 + (2,3) pair_count 1.
        assert_eq!(edge.pair_count, 3);
        assert_eq!(edge.file_edge_count, 2);
        // Component 100 appears in 4 changesets, 200 in 3, together in 3.
        assert_eq!(edge.cooccurrence, 3);
        assert!((edge.jaccard - 3.0 / 4.0).abs() < 1e-12);
    }

    #[test]
    fn spilling_does_not_change_results() {
        let config = AnalysisConfig {
            min_revisions: 1,
            min_cooccurrence: 1,
            max_active_pairs: 2,
            ..Default::default()
        };

        let changesets = vec![
            changeset("c1", vec![1, 2, 3], 0),
            changeset("c2", vec![2, 3, 4], 1),
            changeset("c3", vec![1, 4], 2),
            changeset("c4", vec![1, 2, 3, 4], 3),
        ];

        let spilled = build(&config, changesets.clone());

        let unspilled_config = AnalysisConfig { max_active_pairs: 1_000_000, ..config };
        let unspilled = build(&unspilled_config, changesets);

        assert_eq!(spilled.relationships, unspilled.relationships);
    }

    #[test]
    fn empty_stream_builds_an_empty_graph() {
        let outcome = build(&AnalysisConfig::default(), Vec::new());
        assert!(outcome.relationships.is_empty());
        assert!(outcome.component_edges.is_empty());
        assert_eq!(outcome.changeset_count, 0);
    }
}
