//! Connected-component clustering for semantic deduplication

use std::collections::{HashMap, HashSet, VecDeque};

use newsstore::{build_alt_sources, ClusterMember, DedupCandidate, DedupCluster};

use super::embedder::cosine_similarity;
use crate::ingestion::cleaning::sha1_hex;

/// Cluster candidates by pairwise similarity threshold.
pub fn cluster_candidates(
    candidates: &[DedupCandidate],
    embeddings: &HashMap<String, Vec<f32>>,
    threshold: f32,
) -> Vec<DedupCluster> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let by_id: HashMap<&str, &DedupCandidate> = candidates
        .iter()
        .map(|candidate| (candidate.article_id.as_str(), candidate))
        .collect();
    let adjacency = build_adjacency(candidates, embeddings, threshold);

    let mut visited: HashSet<String> = HashSet::new();
    let mut clusters = Vec::new();
    for candidate in candidates {
        if visited.contains(&candidate.article_id) {
            continue;
        }
        let component_ids = collect_component(&candidate.article_id, &adjacency, &mut visited);
        let component: Vec<&DedupCandidate> = component_ids
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).copied())
            .collect();
        clusters.push(build_cluster(&component, embeddings));
    }
    clusters
}

/// Duplicate (non-representative) items across all clusters.
pub fn count_duplicates(clusters: &[DedupCluster]) -> i64 {
    clusters
        .iter()
        .flat_map(|cluster| cluster.members.iter())
        .filter(|member| !member.is_representative)
        .count() as i64
}

fn build_adjacency(
    candidates: &[DedupCandidate],
    embeddings: &HashMap<String, Vec<f32>>,
    threshold: f32,
) -> HashMap<String, HashSet<String>> {
    let mut adjacency: HashMap<String, HashSet<String>> = HashMap::new();
    for (index, left) in candidates.iter().enumerate() {
        let Some(left_vec) = embeddings.get(&left.article_id) else {
            continue;
        };
        for right in &candidates[index + 1..] {
            let Some(right_vec) = embeddings.get(&right.article_id) else {
                continue;
            };
            if cosine_similarity(left_vec, right_vec) >= threshold {
                adjacency
                    .entry(left.article_id.clone())
                    .or_default()
                    .insert(right.article_id.clone());
                adjacency
                    .entry(right.article_id.clone())
                    .or_default()
                    .insert(left.article_id.clone());
            }
        }
    }
    adjacency
}

fn collect_component(
    start_id: &str,
    adjacency: &HashMap<String, HashSet<String>>,
    visited: &mut HashSet<String>,
) -> Vec<String> {
    let mut queue: VecDeque<String> = VecDeque::from([start_id.to_string()]);
    let mut component = Vec::new();

    while let Some(current) = queue.pop_front() {
        if !visited.insert(current.clone()) {
            continue;
        }
        component.push(current.clone());
        if let Some(neighbors) = adjacency.get(&current) {
            for neighbor in neighbors {
                if !visited.contains(neighbor) {
                    queue.push_back(neighbor.clone());
                }
            }
        }
    }
    component
}

fn build_cluster(
    candidates: &[&DedupCandidate],
    embeddings: &HashMap<String, Vec<f32>>,
) -> DedupCluster {
    let representative = choose_representative(candidates);
    let representative_vec = embeddings.get(&representative.article_id);

    let mut sorted: Vec<&DedupCandidate> = candidates.to_vec();
    sorted.sort_by(|left, right| left.article_id.cmp(&right.article_id));

    let members: Vec<ClusterMember> = sorted
        .iter()
        .map(|candidate| {
            let member_vec = embeddings.get(&candidate.article_id);
            let similarity = match (representative_vec, member_vec) {
                (Some(rep), Some(member)) => cosine_similarity(rep, member),
                _ => 1.0,
            };
            ClusterMember {
                article_id: candidate.article_id.clone(),
                similarity_to_representative: similarity,
                is_representative: candidate.article_id == representative.article_id,
            }
        })
        .collect();

    let owned: Vec<DedupCandidate> = candidates.iter().map(|c| (*c).clone()).collect();
    DedupCluster {
        cluster_id: build_cluster_id(&members),
        representative_article_id: representative.article_id.clone(),
        alt_sources: build_alt_sources(&owned),
        members,
    }
}

/// Longest clean text wins; ties break on earliest publish date, then id.
fn choose_representative<'a>(candidates: &[&'a DedupCandidate]) -> &'a DedupCandidate {
    let mut sorted: Vec<&DedupCandidate> = candidates.to_vec();
    sorted.sort_by(|left, right| {
        right
            .clean_text_chars
            .cmp(&left.clean_text_chars)
            .then_with(|| left.published_at.cmp(&right.published_at))
            .then_with(|| left.article_id.cmp(&right.article_id))
    });
    sorted[0]
}

fn build_cluster_id(members: &[ClusterMember]) -> String {
    let mut ids: Vec<&str> = members
        .iter()
        .map(|member| member.article_id.as_str())
        .collect();
    ids.sort_unstable();
    format!("cluster:{}", sha1_hex(ids.join("|").as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn candidate(article_id: &str, chars: i64, published_at: &str) -> DedupCandidate {
        DedupCandidate {
            article_id: article_id.to_string(),
            title: format!("Title {article_id}"),
            url: format!("https://example.com/{article_id}"),
            source_domain: "example.com".to_string(),
            published_at: published_at.parse::<DateTime<Utc>>().unwrap(),
            clean_text: "x".repeat(chars as usize),
            clean_text_chars: chars,
        }
    }

    fn embeddings_for(pairs: &[(&str, Vec<f32>)]) -> HashMap<String, Vec<f32>> {
        pairs
            .iter()
            .map(|(id, vector)| (id.to_string(), vector.clone()))
            .collect()
    }

    #[test]
    fn test_two_similar_articles_form_one_cluster() {
        let candidates = vec![
            candidate("a", 100, "2026-03-01T10:00:00Z"),
            candidate("b", 50, "2026-03-01T11:00:00Z"),
        ];
        let embeddings = embeddings_for(&[("a", vec![1.0, 0.0]), ("b", vec![0.999, 0.04])]);
        let clusters = cluster_candidates(&candidates, &embeddings, 0.95);

        assert_eq!(clusters.len(), 1);
        let cluster = &clusters[0];
        assert_eq!(cluster.representative_article_id, "a");
        assert_eq!(cluster.members.len(), 2);
        let representative_count = cluster
            .members
            .iter()
            .filter(|member| member.is_representative)
            .count();
        assert_eq!(representative_count, 1);
        for member in &cluster.members {
            assert!((-1.0..=1.0).contains(&member.similarity_to_representative));
        }
        assert_eq!(count_duplicates(&clusters), 1);
    }

    #[test]
    fn test_dissimilar_articles_stay_separate() {
        let candidates = vec![
            candidate("a", 100, "2026-03-01T10:00:00Z"),
            candidate("b", 100, "2026-03-01T10:00:00Z"),
        ];
        let embeddings = embeddings_for(&[("a", vec![1.0, 0.0]), ("b", vec![0.0, 1.0])]);
        let clusters = cluster_candidates(&candidates, &embeddings, 0.95);
        assert_eq!(clusters.len(), 2);
        assert_eq!(count_duplicates(&clusters), 0);
    }

    #[test]
    fn test_transitive_similarity_merges_components() {
        // a~b and b~c but a!~c: one component of three.
        let candidates = vec![
            candidate("a", 10, "2026-03-01T10:00:00Z"),
            candidate("b", 20, "2026-03-01T10:00:00Z"),
            candidate("c", 30, "2026-03-01T10:00:00Z"),
        ];
        let embeddings = embeddings_for(&[
            ("a", vec![1.0, 0.0]),
            ("b", vec![0.97, 0.243]),
            ("c", vec![0.88, 0.475]),
        ]);
        let clusters = cluster_candidates(&candidates, &embeddings, 0.96);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members.len(), 3);
        assert_eq!(clusters[0].representative_article_id, "c");
    }

    #[test]
    fn test_representative_tie_breaks() {
        // Same length: earliest published wins; same date: smallest id.
        let candidates = vec![
            candidate("b", 100, "2026-03-01T09:00:00Z"),
            candidate("a", 100, "2026-03-01T09:00:00Z"),
        ];
        let embeddings = embeddings_for(&[("a", vec![1.0]), ("b", vec![1.0])]);
        let clusters = cluster_candidates(&candidates, &embeddings, 0.9);
        assert_eq!(clusters[0].representative_article_id, "a");
    }

    #[test]
    fn test_cluster_id_is_order_independent() {
        let members_forward = vec![
            ClusterMember {
                article_id: "a".to_string(),
                similarity_to_representative: 1.0,
                is_representative: true,
            },
            ClusterMember {
                article_id: "b".to_string(),
                similarity_to_representative: 0.97,
                is_representative: false,
            },
        ];
        let members_reverse: Vec<ClusterMember> =
            members_forward.iter().rev().cloned().collect();
        assert_eq!(
            build_cluster_id(&members_forward),
            build_cluster_id(&members_reverse)
        );
        assert!(build_cluster_id(&members_forward).starts_with("cluster:"));
    }

    #[test]
    fn test_empty_candidates_produce_no_clusters() {
        let clusters = cluster_candidates(&[], &HashMap::new(), 0.95);
        assert!(clusters.is_empty());
    }
}
