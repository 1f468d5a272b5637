use serde::Serialize;

use crate::aggregate::CandidateScore;
use crate::error::{Error, Result};
use crate::refine::RefineOutcome;
use crate::search_config::SearchConfig;
use crate::store::ImageId;

/// 搜索结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub image_id: ImageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub orb_similarity: f32,
    pub annoy_similarity: f32,
    pub hybrid_score: f32,
    pub matched_descriptor_count: usize,
    /// 候选图片的描述符数量
    pub descriptor_count: usize,
    /// 该结果触发了提前结束
    pub early_stopped: bool,
}

/// 两种相似度的加权和
pub fn hybrid_score(orb_similarity: f32, preliminary_score: f32, config: &SearchConfig) -> Result<f32> {
    if (config.orb_weight + config.annoy_weight - 1.0).abs() > 1e-4 {
        return Err(Error::InvalidConfig(format!(
            "orb_weight + annoy_weight must be 1, got {} + {}",
            config.orb_weight, config.annoy_weight
        )));
    }
    Ok(config.orb_weight * orb_similarity + config.annoy_weight * preliminary_score)
}

/// 组合近似阶段和精确阶段的分数
///
/// `candidate` 为 `None` 表示暴力搜索，此时混合分数直接等于 ORB 相似度
pub fn score(
    image_id: ImageId,
    candidate: Option<&CandidateScore>,
    outcome: &RefineOutcome,
    config: &SearchConfig,
) -> Result<MatchResult> {
    let (annoy_similarity, hybrid_score) = match candidate {
        Some(c) => (c.preliminary_score, hybrid_score(outcome.orb_similarity, c.preliminary_score, config)?),
        None => (0.0, outcome.orb_similarity),
    };
    Ok(MatchResult {
        image_id,
        path: None,
        orb_similarity: outcome.orb_similarity,
        annoy_similarity,
        hybrid_score,
        matched_descriptor_count: outcome.matched_descriptor_count,
        descriptor_count: 0,
        early_stopped: false,
    })
}

impl MatchResult {
    /// 至少有一个描述符落入匹配等级
    ///
    /// 初步分数只反映近邻命中，没有任何精确匹配的候选单靠它可以达到 `annoy_weight`
    pub fn has_matches(&self) -> bool {
        self.matched_descriptor_count > 0
    }

    pub fn passes(&self, config: &SearchConfig) -> bool {
        self.has_matches() && self.hybrid_score >= config.hybrid_threshold
    }

    pub fn triggers_early_stop(&self, config: &SearchConfig) -> bool {
        self.has_matches() && self.hybrid_score >= config.early_stop_threshold
    }
}

/// 排序并截断结果：混合分数降序，其次 ORB 相似度降序，最后 ID 升序
pub fn rank(mut results: Vec<MatchResult>, top_k: usize) -> Vec<MatchResult> {
    results.sort_by(|a, b| {
        b.hybrid_score
            .total_cmp(&a.hybrid_score)
            .then(b.orb_similarity.total_cmp(&a.orb_similarity))
            .then(a.image_id.cmp(&b.image_id))
    });
    results.truncate(top_k);
    results
}
