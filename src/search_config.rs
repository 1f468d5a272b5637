use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use clap::Args;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hamming::MAX_DISTANCE;

/// 权重之和与 1 的最大允许误差
const WEIGHT_EPSILON: f32 = 1e-4;

/// 精确匹配阶段的分级阈值与评分常数
///
/// 这些数值来自经验，对不同的数据集未必最优，所以作为可调整的默认值而不是常量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineParams {
    /// 最小距离低于该值为 excellent
    pub excellent_distance: u32,
    /// 最小距离低于该值为 good
    pub good_distance: u32,
    /// 最小距离低于该值为 decent，否则视为不匹配
    pub decent_distance: u32,
    /// 平均距离归一化的上限
    pub distance_norm: f32,
    /// good 在质量分中的权重
    pub good_weight: f32,
    /// decent 在质量分中的权重
    pub decent_weight: f32,
    /// 质量分的除数，设为 3.0 时完全相同的图片最高只能得到约 0.77
    pub quality_divisor: f32,
    pub quality_weight: f32,
    pub distance_weight: f32,
    pub coverage_weight: f32,
    /// excellent 比例超过该值时给予额外加分
    pub bonus_trigger: f32,
    pub bonus_factor: f32,
    pub bonus_cap: f32,
}

impl Default for RefineParams {
    fn default() -> Self {
        Self {
            excellent_distance: 25,
            good_distance: 40,
            decent_distance: 60,
            distance_norm: 80.0,
            good_weight: 0.7,
            decent_weight: 0.4,
            quality_divisor: 1.0,
            quality_weight: 0.5,
            distance_weight: 0.3,
            coverage_weight: 0.2,
            bonus_trigger: 0.1,
            bonus_factor: 0.2,
            bonus_cap: 0.1,
        }
    }
}

impl RefineParams {
    fn validate(&self) -> Result<()> {
        if !(self.excellent_distance < self.good_distance
            && self.good_distance < self.decent_distance
            && self.decent_distance <= MAX_DISTANCE)
        {
            return Err(Error::InvalidConfig(format!(
                "tier distances must satisfy excellent < good < decent <= {MAX_DISTANCE}"
            )));
        }
        check_positive("refine.distance_norm", self.distance_norm)?;
        check_positive("refine.quality_divisor", self.quality_divisor)?;
        for (name, value) in [
            ("refine.good_weight", self.good_weight),
            ("refine.decent_weight", self.decent_weight),
            ("refine.quality_weight", self.quality_weight),
            ("refine.distance_weight", self.distance_weight),
            ("refine.coverage_weight", self.coverage_weight),
            ("refine.bonus_trigger", self.bonus_trigger),
            ("refine.bonus_factor", self.bonus_factor),
            ("refine.bonus_cap", self.bonus_cap),
        ] {
            check_non_negative(name, value)?;
        }
        Ok(())
    }
}

/// 全局搜索配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// 每张图片期望保留的描述符数量
    pub descriptor_count_target: usize,
    /// 随机投影树的数量
    pub tree_count: usize,
    /// 每个查询描述符在索引中查找的近邻数量
    pub search_k: usize,
    /// 近邻数量的放大倍数
    pub search_k_expansion_factor: usize,
    /// 精确匹配后混合分数达到该值立即结束搜索，大于 1 等同于关闭
    pub early_stop_threshold: f32,
    /// 初步分数低于该值的候选图片被丢弃
    pub min_threshold: f32,
    /// 混合分数低于该值的结果被丢弃
    pub hybrid_threshold: f32,
    pub orb_weight: f32,
    pub annoy_weight: f32,
    /// 进入精确匹配阶段的最大候选数量
    pub max_candidates_refined: usize,
    /// 并行匹配的线程数
    pub max_workers: usize,
    /// 构建索引和并行匹配时的批次大小
    pub batch_size: usize,
    /// 是否并行执行精确匹配
    pub parallel: bool,
    /// 是否使用近似索引，关闭时总是暴力搜索
    pub use_index: bool,
    /// 构建随机投影树的随机数种子
    pub seed: u64,
    /// 叶子节点最多包含的描述符数量
    pub leaf_size: usize,
    /// 预计内存占用超过可用内存的该比例时发出警告
    pub memory_warn_ratio: f32,
    /// 预计内存占用超过可用内存的该比例时放弃构建
    pub memory_abort_ratio: f32,
    pub refine: RefineParams,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            descriptor_count_target: 1000,
            tree_count: 10,
            search_k: 5,
            search_k_expansion_factor: 2,
            early_stop_threshold: 0.4,
            min_threshold: 0.05,
            hybrid_threshold: 0.3,
            orb_weight: 0.7,
            annoy_weight: 0.3,
            max_candidates_refined: 100,
            max_workers: num_cpus::get().clamp(1, 16),
            batch_size: 25,
            parallel: true,
            use_index: true,
            seed: 42,
            leaf_size: 64,
            memory_warn_ratio: 0.75,
            memory_abort_ratio: 0.9,
            refine: RefineParams::default(),
        }
    }
}

impl SearchConfig {
    /// 每个查询描述符实际请求的近邻数量
    pub fn neighbors_per_descriptor(&self) -> usize {
        self.search_k * self.search_k_expansion_factor
    }

    /// 检查所有字段的取值范围以及字段之间的约束
    pub fn validate(&self) -> Result<()> {
        check_range("descriptor_count_target", self.descriptor_count_target, 1, usize::MAX)?;
        check_range("tree_count", self.tree_count, 1, 1024)?;
        check_range("search_k", self.search_k, 1, 10_000)?;
        check_range("search_k_expansion_factor", self.search_k_expansion_factor, 1, 100)?;
        check_range("max_candidates_refined", self.max_candidates_refined, 1, usize::MAX)?;
        check_range("max_workers", self.max_workers, 1, 256)?;
        check_range("batch_size", self.batch_size, 1, 100_000)?;
        check_range("leaf_size", self.leaf_size, 2, 100_000)?;

        check_non_negative("early_stop_threshold", self.early_stop_threshold)?;
        check_non_negative("hybrid_threshold", self.hybrid_threshold)?;
        check_non_negative("min_threshold", self.min_threshold)?;
        if self.min_threshold > 1.0 {
            return Err(Error::InvalidConfig("min_threshold must be within [0, 1]".to_string()));
        }

        check_non_negative("orb_weight", self.orb_weight)?;
        check_non_negative("annoy_weight", self.annoy_weight)?;
        let sum = self.orb_weight + self.annoy_weight;
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(Error::InvalidConfig(format!(
                "orb_weight + annoy_weight must be 1.0, got {sum}"
            )));
        }

        check_positive("memory_warn_ratio", self.memory_warn_ratio)?;
        check_positive("memory_abort_ratio", self.memory_abort_ratio)?;
        if self.memory_warn_ratio > self.memory_abort_ratio {
            return Err(Error::InvalidConfig(
                "memory_warn_ratio must not exceed memory_abort_ratio".to_string(),
            ));
        }

        self.refine.validate()
    }

    /// 基于当前配置应用部分更新，返回校验通过的新配置，自身不受影响
    pub fn apply(&self, update: &ConfigUpdate) -> Result<SearchConfig> {
        let mut new = self.clone();
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = &update.$field {
                    new.$field = v.clone();
                })*
            };
        }
        merge!(
            descriptor_count_target,
            tree_count,
            search_k,
            search_k_expansion_factor,
            early_stop_threshold,
            min_threshold,
            hybrid_threshold,
            orb_weight,
            annoy_weight,
            max_candidates_refined,
            max_workers,
            batch_size,
            parallel,
            use_index,
            seed,
            leaf_size,
            memory_warn_ratio,
            memory_abort_ratio,
            refine,
        );
        new.validate()?;
        Ok(new)
    }
}

/// 配置的部分更新，未设置的字段保持不变
#[derive(Args, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigUpdate {
    /// 每张图片期望保留的描述符数量
    #[arg(long, value_name = "N")]
    pub descriptor_count_target: Option<usize>,
    /// 随机投影树的数量
    #[arg(long, value_name = "N")]
    pub tree_count: Option<usize>,
    /// 每个查询描述符查找的近邻数量
    #[arg(long, value_name = "K")]
    pub search_k: Option<usize>,
    /// 近邻数量的放大倍数
    #[arg(long, value_name = "N")]
    pub search_k_expansion_factor: Option<usize>,
    /// 提前结束搜索的混合分数
    #[arg(long, value_name = "SCORE")]
    pub early_stop_threshold: Option<f32>,
    /// 候选图片的最低初步分数
    #[arg(long, value_name = "SCORE")]
    pub min_threshold: Option<f32>,
    /// 结果的最低混合分数
    #[arg(long, value_name = "SCORE")]
    pub hybrid_threshold: Option<f32>,
    /// 精确匹配分数的权重
    #[arg(long, value_name = "WEIGHT")]
    pub orb_weight: Option<f32>,
    /// 近似索引分数的权重
    #[arg(long, value_name = "WEIGHT")]
    pub annoy_weight: Option<f32>,
    /// 精确匹配的最大候选数量
    #[arg(long, value_name = "N")]
    pub max_candidates_refined: Option<usize>,
    /// 并行匹配的线程数
    #[arg(long, value_name = "N")]
    pub max_workers: Option<usize>,
    /// 批次大小
    #[arg(long, value_name = "SIZE")]
    pub batch_size: Option<usize>,
    /// 是否并行执行精确匹配
    #[arg(long, value_name = "BOOL")]
    pub parallel: Option<bool>,
    /// 是否使用近似索引
    #[arg(long, value_name = "BOOL")]
    pub use_index: Option<bool>,
    /// 随机数种子
    #[arg(long, value_name = "SEED")]
    pub seed: Option<u64>,
    /// 叶子节点大小
    #[arg(long, value_name = "N")]
    pub leaf_size: Option<usize>,
    /// 内存警告比例
    #[arg(long, value_name = "RATIO")]
    pub memory_warn_ratio: Option<f32>,
    /// 内存硬上限比例
    #[arg(long, value_name = "RATIO")]
    pub memory_abort_ratio: Option<f32>,
    #[arg(skip)]
    pub refine: Option<RefineParams>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// 可热更新的共享配置
///
/// 读取方拿到的是完整的快照，更新通过写锁串行化，校验失败时旧配置保持不变
pub struct SharedConfig {
    current: ArcSwap<SearchConfig>,
    write_lock: Mutex<()>,
}

impl SharedConfig {
    /// 使用校验过的配置创建
    pub fn new(config: SearchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { current: ArcSwap::from_pointee(config), write_lock: Mutex::new(()) })
    }

    /// 当前配置的快照
    pub fn get(&self) -> Arc<SearchConfig> {
        self.current.load_full()
    }

    /// 应用部分更新，成功时返回新配置
    pub fn update(&self, update: &ConfigUpdate) -> Result<Arc<SearchConfig>> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let new = Arc::new(self.current.load().apply(update)?);
        self.current.store(new.clone());
        info!("search config updated: {:?}", update);
        Ok(new)
    }

    /// 整体替换配置
    pub fn replace(&self, config: SearchConfig) -> Result<Arc<SearchConfig>> {
        config.validate()?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let new = Arc::new(config);
        self.current.store(new.clone());
        Ok(new)
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self { current: ArcSwap::from_pointee(SearchConfig::default()), write_lock: Mutex::new(()) }
    }
}

fn check_range(name: &str, value: usize, min: usize, max: usize) -> Result<()> {
    if value < min || value > max {
        return Err(Error::InvalidConfig(format!("{name} must be within [{min}, {max}], got {value}")));
    }
    Ok(())
}

fn check_non_negative(name: &str, value: f32) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::InvalidConfig(format!("{name} must be a non-negative number, got {value}")));
    }
    Ok(())
}

fn check_positive(name: &str, value: f32) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(Error::InvalidConfig(format!("{name} must be a positive number, got {value}")));
    }
    Ok(())
}
