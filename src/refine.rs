use crate::error::Result;
use crate::hamming::{Descriptor, MAX_DISTANCE, min_hamming};
use crate::search_config::RefineParams;
use crate::store::ImageRecord;

/// 精确匹配的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineOutcome {
    pub orb_similarity: f32,
    /// 落入任一等级的查询描述符数量
    pub matched_descriptor_count: usize,
    pub tiers: TierCounts,
}

/// 各等级的匹配数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierCounts {
    pub excellent: usize,
    pub good: usize,
    pub decent: usize,
}

impl TierCounts {
    pub fn matched(&self) -> usize {
        self.excellent + self.good + self.decent
    }
}

/// 将每个查询描述符的最小距离分级统计
pub fn classify(query: &[Descriptor], candidate: &[Descriptor], params: &RefineParams) -> (TierCounts, Option<f32>) {
    let mut tiers = TierCounts::default();
    let mut distance_sum = 0u64;
    for q in query {
        let Some((_, d)) = min_hamming(q, candidate) else {
            continue;
        };
        if d < params.excellent_distance {
            tiers.excellent += 1;
        } else if d < params.good_distance {
            tiers.good += 1;
        } else if d < params.decent_distance {
            tiers.decent += 1;
        } else {
            continue;
        }
        distance_sum += d as u64;
    }
    let avg = match tiers.matched() {
        0 => None,
        n => Some(distance_sum as f32 / n as f32),
    };
    (tiers, avg)
}

/// 暴力计算查询描述符与候选图片之间的相似度，结果在 [0, 1] 之间
///
/// 候选记录损坏时返回 [`crate::Error::CorruptRecord`]
pub fn refine(query: &[Descriptor], candidate: &ImageRecord, params: &RefineParams) -> Result<RefineOutcome> {
    candidate.validate()?;
    if query.is_empty() {
        return Ok(RefineOutcome { orb_similarity: 0.0, matched_descriptor_count: 0, tiers: TierCounts::default() });
    }

    let (tiers, avg_distance) = classify(query, &candidate.descriptors, params);
    // 没有任何匹配时按最差情况处理
    let avg_distance = avg_distance.unwrap_or(MAX_DISTANCE as f32);

    let n = query.len() as f32;
    let excellent_ratio = tiers.excellent as f32 / n;
    let good_ratio = tiers.good as f32 / n;
    let decent_ratio = tiers.decent as f32 / n;

    let quality_score = (excellent_ratio + good_ratio * params.good_weight + decent_ratio * params.decent_weight)
        / params.quality_divisor;
    let distance_score = ((params.distance_norm - avg_distance) / params.distance_norm).max(0.0);
    let coverage_score = tiers.matched() as f32 / candidate.descriptor_count.max(1) as f32;

    let mut orb_similarity = quality_score * params.quality_weight
        + distance_score * params.distance_weight
        + coverage_score * params.coverage_weight;
    if excellent_ratio > params.bonus_trigger {
        orb_similarity += (excellent_ratio * params.bonus_factor).min(params.bonus_cap);
    }

    Ok(RefineOutcome {
        orb_similarity: orb_similarity.clamp(0.0, 1.0),
        matched_descriptor_count: tiers.matched(),
        tiers,
    })
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;

    use super::*;
    use crate::error::Error;
    use crate::store::ImageId;

    fn random_descriptors(n: usize, seed: u64) -> Vec<Descriptor> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let mut d = [0u8; 32];
                rng.fill_bytes(&mut d);
                d
            })
            .collect()
    }

    /// 翻转前 bits 个比特
    fn flip(d: &Descriptor, bits: usize) -> Descriptor {
        let mut d = *d;
        for i in 0..bits {
            d[i / 8] ^= 1 << (i % 8);
        }
        d
    }

    #[test]
    fn test_identical_images() {
        let des = random_descriptors(200, 1);
        let record = ImageRecord::new(ImageId(1), "a", des.clone());
        let r = refine(&des, &record, &RefineParams::default()).unwrap();
        assert!(r.orb_similarity >= 0.95, "{}", r.orb_similarity);
        assert_eq!(r.matched_descriptor_count, 200);
        assert_eq!(r.tiers.excellent, 200);
    }

    #[test]
    fn test_tiers() {
        let base = random_descriptors(1, 2)[0];
        // 其余 9 个随机描述符与查询的距离都远大于 60
        let mut des = vec![base];
        des.extend(random_descriptors(9, 20));
        let record = ImageRecord::new(ImageId(1), "a", des);
        // 距离分别为 10、30、50、70
        let query = [flip(&base, 10), flip(&base, 30), flip(&base, 50), flip(&base, 70)];
        let (tiers, avg) = classify(&query, &record.descriptors, &RefineParams::default());
        assert_eq!(tiers, TierCounts { excellent: 1, good: 1, decent: 1 });
        assert_eq!(avg, Some(30.0));

        let r = refine(&query, &record, &RefineParams::default()).unwrap();
        assert_eq!(r.matched_descriptor_count, 3);
        // quality = (0.25 + 0.25 * 0.7 + 0.25 * 0.4) = 0.525
        // distance = (80 - 30) / 80 = 0.625
        // coverage = 3 / 10，excellent 比例 0.25 触发 0.05 的奖励
        let expected = 0.525 * 0.5 + 0.625 * 0.3 + 0.3 * 0.2 + 0.05;
        assert!((r.orb_similarity - expected).abs() < 1e-5, "{}", r.orb_similarity);
    }

    #[test]
    fn test_unrelated_images_score_low() {
        let query = random_descriptors(100, 3);
        let record = ImageRecord::new(ImageId(1), "a", random_descriptors(100, 4));
        let r = refine(&query, &record, &RefineParams::default()).unwrap();
        // 随机的 256 位向量之间的最小距离远大于 60
        assert_eq!(r.matched_descriptor_count, 0);
        assert_eq!(r.orb_similarity, 0.0);
    }

    #[test]
    fn test_similarity_bounds() {
        let params = RefineParams::default();
        for seed in 0..10 {
            let base = random_descriptors(30, seed);
            let query = base.iter().enumerate().map(|(i, d)| flip(d, i * 3)).collect::<Vec<_>>();
            let record = ImageRecord::new(ImageId(seed), "a", base[..(seed as usize + 1)].to_vec());
            let r = refine(&query, &record, &params).unwrap();
            assert!((0.0..=1.0).contains(&r.orb_similarity));
            let (tiers, _) = classify(&query, &record.descriptors, &params);
            assert!(tiers.matched() <= query.len());
        }
    }

    #[test]
    fn test_corrupt_record() {
        let mut record = ImageRecord::new(ImageId(5), "a", random_descriptors(3, 5));
        record.descriptor_count = 10;
        let r = refine(&random_descriptors(3, 6), &record, &RefineParams::default());
        assert!(matches!(r, Err(Error::CorruptRecord { .. })));
    }

    #[test]
    fn test_custom_tiers() {
        let base = random_descriptors(1, 7)[0];
        let record = ImageRecord::new(ImageId(1), "a", vec![base]);
        let query = [flip(&base, 70)];
        let params = RefineParams { decent_distance: 80, ..Default::default() };
        let r = refine(&query, &record, &params).unwrap();
        assert_eq!(r.tiers.decent, 1);
    }
}
