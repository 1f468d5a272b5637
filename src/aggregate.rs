use std::collections::HashMap;

use rayon::prelude::*;

use crate::forest::ApproximateIndex;
use crate::hamming::Descriptor;
use crate::search_config::SearchConfig;
use crate::store::ImageId;

/// 近似阶段为每张候选图片计算的初步分数，搜索结束后丢弃
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateScore {
    pub image_id: ImageId,
    /// 该图片的描述符出现在查询结果中的次数
    pub neighbor_hits: usize,
    /// neighbor_hits / 查询描述符数量，截断到 [0, 1]
    pub preliminary_score: f32,
}

/// 对每个查询描述符在索引中查找近邻，按所属图片统计命中次数
///
/// 初步分数低于 `min_threshold` 的图片被丢弃
pub fn aggregate(
    query: &[Descriptor],
    index: &ApproximateIndex,
    config: &SearchConfig,
) -> HashMap<ImageId, CandidateScore> {
    let k = config.neighbors_per_descriptor();

    let hits = query
        .par_iter()
        .fold(HashMap::new, |mut acc: HashMap<ImageId, usize>, descriptor| {
            for neighbor in index.query(descriptor, k) {
                *acc.entry(neighbor.entry.owner).or_default() += 1;
            }
            acc
        })
        .reduce(HashMap::new, |mut a, b| {
            for (id, n) in b {
                *a.entry(id).or_default() += n;
            }
            a
        });

    let total = query.len().max(1) as f32;
    hits.into_iter()
        .map(|(image_id, neighbor_hits)| {
            let preliminary_score = (neighbor_hits as f32 / total).clamp(0.0, 1.0);
            (image_id, CandidateScore { image_id, neighbor_hits, preliminary_score })
        })
        .filter(|(_, c)| c.preliminary_score >= config.min_threshold)
        .collect()
}

/// 按初步分数降序选出前 n 个候选，分数相同时 ID 小的在前
pub fn top_candidates(candidates: HashMap<ImageId, CandidateScore>, n: usize) -> Vec<CandidateScore> {
    let mut v = candidates.into_values().collect::<Vec<_>>();
    v.sort_unstable_by(|a, b| {
        b.preliminary_score.total_cmp(&a.preliminary_score).then(a.image_id.cmp(&b.image_id))
    });
    v.truncate(n);
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::{ForestParams, IndexEntry};

    fn descriptor(seed: u8) -> Descriptor {
        let mut d = [0u8; 32];
        for (i, b) in d.iter_mut().enumerate() {
            *b = seed.wrapping_mul(31).wrapping_add(i as u8).rotate_left(seed as u32 % 8);
        }
        d
    }

    fn index() -> ApproximateIndex {
        // 图片 1 拥有描述符 0..20，图片 2 拥有描述符 100..120
        // 叶子足够大，整棵树只有一个叶子，查询结果是精确的
        let mut entries = vec![];
        for s in 0..20u8 {
            entries.push(IndexEntry { descriptor: descriptor(s), owner: ImageId(1) });
            entries.push(IndexEntry { descriptor: descriptor(s + 100), owner: ImageId(2) });
        }
        ApproximateIndex::build_with(entries, &ForestParams { tree_count: 4, leaf_size: 64, seed: 3 })
            .unwrap()
    }

    #[test]
    fn test_hits_and_scores() {
        let index = index();
        let config = SearchConfig { search_k: 1, search_k_expansion_factor: 1, min_threshold: 0.0, ..Default::default() };
        let query = (0..10u8).map(descriptor).collect::<Vec<_>>();

        let c = aggregate(&query, &index, &config);
        let img1 = c[&ImageId(1)];
        assert_eq!(img1.neighbor_hits, 10);
        assert_eq!(img1.preliminary_score, 1.0);
        assert!(!c.contains_key(&ImageId(2)));
    }

    #[test]
    fn test_score_clamped() {
        let index = index();
        // 每个描述符请求 40 个近邻，命中次数远超查询数量
        let config = SearchConfig { search_k: 20, search_k_expansion_factor: 2, min_threshold: 0.0, ..Default::default() };
        let query = vec![descriptor(0); 2];
        let c = aggregate(&query, &index, &config);
        for score in c.values() {
            assert!(score.preliminary_score <= 1.0);
            assert!(score.neighbor_hits >= 1);
        }
    }

    #[test]
    fn test_min_threshold_filters() {
        let index = index();
        let config = SearchConfig { search_k: 1, search_k_expansion_factor: 1, min_threshold: 0.6, ..Default::default() };
        // 一半查询来自图片 1，一半来自图片 2
        let query = (0..5u8).map(descriptor).chain((100..105u8).map(descriptor)).collect::<Vec<_>>();
        let c = aggregate(&query, &index, &config);
        assert!(c.is_empty());
    }

    #[test]
    fn test_empty_query() {
        let c = aggregate(&[], &index(), &SearchConfig::default());
        assert!(c.is_empty());
    }

    #[test]
    fn test_top_candidates_order() {
        let mut m = HashMap::new();
        for (id, s) in [(3, 0.5), (1, 0.5), (2, 0.9), (4, 0.1)] {
            m.insert(ImageId(id), CandidateScore { image_id: ImageId(id), neighbor_hits: 1, preliminary_score: s });
        }
        let top = top_candidates(m, 3);
        let ids = top.iter().map(|c| c.image_id.0).collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 1, 3]);
    }
}
