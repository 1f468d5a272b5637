//! 两阶段搜索
//!
//! 第一阶段在近似索引中为每个查询描述符查找近邻，按图片统计得到候选；
//! 第二阶段对初步分数最高的候选做暴力匹配，计算混合分数并排序。
//! 索引不可用时跳过第一阶段，直接对所有图片做暴力匹配。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_channel::{Receiver, bounded};
use log::{debug, info, warn};
use serde::Serialize;

use crate::aggregate::{CandidateScore, aggregate, top_candidates};
use crate::builder::{self, ProgressObserver};
use crate::error::{Error, Result};
use crate::forest::ApproximateIndex;
use crate::hamming::Descriptor;
use crate::memory::MemoryMonitor;
use crate::metrics;
use crate::refine::refine;
use crate::scorer::{MatchResult, rank, score};
use crate::search_config::{ConfigUpdate, SearchConfig, SharedConfig};
use crate::store::{DescriptorStore, ImageId};

/// 单次搜索的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchState {
    Idle,
    Phase1Running,
    Phase2Running,
    Scoring,
    Done,
    Aborted,
}

/// 实际使用的搜索方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// 近似索引 + 精确匹配
    Index,
    /// 对所有图片做精确匹配
    BruteForce,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Index => "index",
            SearchMode::BruteForce => "brute_force",
        }
    }
}

/// 搜索结果以及搜索过程的统计
#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub results: Vec<MatchResult>,
    pub state: SearchState,
    pub mode: SearchMode,
    pub early_stopped: bool,
    /// 进入第二阶段的候选数量
    pub candidates: usize,
    /// 完成精确匹配的候选数量
    pub refined: usize,
    /// 因记录损坏被跳过的候选数量
    pub skipped: usize,
    pub elapsed: Duration,
}

/// 第二阶段的一个候选，暴力搜索时没有初步分数
type Candidate = (ImageId, Option<CandidateScore>);

/// 第二阶段的累计结果
#[derive(Debug, Default)]
struct Merged {
    results: Vec<MatchResult>,
    refined: usize,
    skipped: usize,
    early_stopped: bool,
}

/// 检索上下文，持有索引、描述符和配置
///
/// 索引和描述符都可以在搜索进行时被原子地替换，进行中的搜索继续使用开始时的快照
pub struct SearchContext {
    index: ArcSwapOption<ApproximateIndex>,
    store: ArcSwap<DescriptorStore>,
    config: SharedConfig,
}

impl SearchContext {
    pub fn new(store: DescriptorStore, config: SearchConfig) -> Result<Self> {
        Ok(Self {
            index: ArcSwapOption::empty(),
            store: ArcSwap::from_pointee(store),
            config: SharedConfig::new(config)?,
        })
    }

    /// 替换当前索引，返回旧的索引
    pub fn install_index(&self, index: ApproximateIndex) -> Option<Arc<ApproximateIndex>> {
        self.index.swap(Some(Arc::new(index)))
    }

    pub fn clear_index(&self) -> Option<Arc<ApproximateIndex>> {
        self.index.swap(None)
    }

    /// 替换描述符，已有的索引不会自动重建
    pub fn replace_store(&self, store: DescriptorStore) -> Arc<DescriptorStore> {
        self.store.swap(Arc::new(store))
    }

    pub fn index(&self) -> Option<Arc<ApproximateIndex>> {
        self.index.load_full()
    }

    pub fn store(&self) -> Arc<DescriptorStore> {
        self.store.load_full()
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn get_config(&self) -> Arc<SearchConfig> {
        self.config.get()
    }

    pub fn update_config(&self, update: &ConfigUpdate) -> Result<Arc<SearchConfig>> {
        self.config.update(update)
    }

    /// 使用当前的描述符重建索引，成功后替换旧索引
    ///
    /// 构建失败时旧索引保持不变
    pub fn ingest(&self, monitor: &dyn MemoryMonitor, observer: &dyn ProgressObserver) -> Result<Arc<ApproximateIndex>> {
        let config = self.config.get();
        let store = self.store();
        let index = Arc::new(builder::ingest(&store, &config, monitor, observer)?);
        self.index.store(Some(index.clone()));
        Ok(index)
    }

    /// 搜索最相似的 top_k 张图片
    pub fn search(&self, query: &[Descriptor], top_k: usize) -> Result<Vec<MatchResult>> {
        Ok(self.search_report(query, top_k)?.results)
    }

    pub fn search_report(&self, query: &[Descriptor], top_k: usize) -> Result<SearchReport> {
        self.search_with_abort(query, top_k, &AtomicBool::new(false))
    }

    /// 可以被中止的搜索，`abort` 被设置后返回 [`Error::Aborted`]
    pub fn search_with_abort(&self, query: &[Descriptor], top_k: usize, abort: &AtomicBool) -> Result<SearchReport> {
        let run = SearchRun {
            query,
            config: self.config.get(),
            store: self.store(),
            index: self.index().filter(|index| !index.is_empty()),
            abort,
            state: SearchState::Idle,
            start: Instant::now(),
        };
        run.execute(top_k)
    }
}

/// 一次搜索使用的全部快照
struct SearchRun<'a> {
    query: &'a [Descriptor],
    config: Arc<SearchConfig>,
    store: Arc<DescriptorStore>,
    index: Option<Arc<ApproximateIndex>>,
    abort: &'a AtomicBool,
    state: SearchState,
    start: Instant,
}

impl SearchRun<'_> {
    fn transition(&mut self, to: SearchState) {
        debug!("search state: {:?} -> {:?}", self.state, to);
        self.state = to;
    }

    fn check_abort(&mut self) -> Result<()> {
        if self.abort.load(Ordering::Acquire) {
            self.transition(SearchState::Aborted);
            return Err(Error::Aborted);
        }
        Ok(())
    }

    fn execute(mut self, top_k: usize) -> Result<SearchReport> {
        let mode = match &self.index {
            Some(_) if self.config.use_index => SearchMode::Index,
            _ => SearchMode::BruteForce,
        };

        if self.query.is_empty() || top_k == 0 {
            debug!("empty query, nothing to search");
            self.transition(SearchState::Done);
            return Ok(self.report(mode, Merged::default(), 0));
        }

        self.transition(SearchState::Phase1Running);
        self.check_abort()?;
        let candidates = self.collect_candidates(mode);
        debug!("{} candidates for refinement ({})", candidates.len(), mode.as_str());

        self.transition(SearchState::Phase2Running);
        self.check_abort()?;
        // 暴力搜索总是顺序执行
        let merged = if self.config.parallel && mode == SearchMode::Index {
            self.refine_parallel(&candidates)?
        } else {
            self.refine_sequential(&candidates)?
        };
        self.check_abort()?;

        self.transition(SearchState::Scoring);
        let merged = Merged { results: rank(merged.results, top_k), ..merged };

        self.transition(SearchState::Done);
        let report = self.report(mode, merged, candidates.len());
        metrics::observe_search(
            mode.as_str(),
            report.elapsed.as_secs_f32(),
            report.results.first().map(|r| r.hybrid_score),
            report.early_stopped,
        );
        info!(
            "search finished in {:.3}s: {} results, {}/{} candidates refined, {} skipped{}",
            report.elapsed.as_secs_f32(),
            report.results.len(),
            report.refined,
            report.candidates,
            report.skipped,
            if report.early_stopped { ", early stopped" } else { "" }
        );
        Ok(report)
    }

    fn report(&self, mode: SearchMode, merged: Merged, candidates: usize) -> SearchReport {
        SearchReport {
            results: merged.results,
            state: self.state,
            mode,
            early_stopped: merged.early_stopped,
            candidates,
            refined: merged.refined,
            skipped: merged.skipped,
            elapsed: self.start.elapsed(),
        }
    }

    /// 第一阶段：使用索引选出候选，暴力搜索时返回所有图片
    fn collect_candidates(&self, mode: SearchMode) -> Vec<Candidate> {
        match (&self.index, mode) {
            (Some(index), SearchMode::Index) => {
                let scores = aggregate(self.query, index, &self.config);
                top_candidates(scores, self.config.max_candidates_refined)
                    .into_iter()
                    .map(|c| (c.image_id, Some(c)))
                    .collect()
            }
            _ => self.store.iter().map(|r| (r.id, None)).collect(),
        }
    }

    /// 精确匹配单个候选，记录损坏时返回 `None`
    fn evaluate(&self, id: ImageId, candidate: Option<&CandidateScore>) -> Result<Option<MatchResult>> {
        let outcome = self
            .store
            .get(id)
            .ok_or_else(|| Error::CorruptRecord { id, reason: "missing from store".to_string() })
            .and_then(|record| Ok((record, refine(self.query, record, &self.config.refine)?)));
        match outcome {
            Ok((record, outcome)) => {
                let mut result = score(id, candidate, &outcome, &self.config)?;
                result.path = Some(record.path.clone());
                result.descriptor_count = record.descriptor_count;
                Ok(Some(result))
            }
            Err(e @ Error::CorruptRecord { .. }) => {
                warn!("skipping candidate: {e}");
                metrics::inc_refine_failure();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn refine_sequential(&self, candidates: &[Candidate]) -> Result<Merged> {
        let mut merged = Merged::default();
        for (id, candidate) in candidates {
            if self.abort.load(Ordering::Acquire) {
                break;
            }
            let Some(mut result) = self.evaluate(*id, candidate.as_ref())? else {
                merged.skipped += 1;
                continue;
            };
            merged.refined += 1;
            let stop = result.triggers_early_stop(&self.config);
            if stop {
                result.early_stopped = true;
                info!("early stop at {} with score {:.3}", result.image_id, result.hybrid_score);
            }
            if result.passes(&self.config) {
                merged.results.push(result);
            }
            if stop {
                merged.early_stopped = true;
                break;
            }
        }
        Ok(merged)
    }

    /// 分批并行匹配，任一线程得到足够高的分数后其他线程在批次边界停止
    fn refine_parallel(&self, candidates: &[Candidate]) -> Result<Merged> {
        let batch_size = self.config.batch_size.max(1);
        let workers = self.config.max_workers.clamp(1, candidates.len().div_ceil(batch_size).max(1));
        let cancel = AtomicBool::new(false);
        let merged = Mutex::new(Merged::default());

        thread::scope(|s| -> Result<()> {
            let (tx, rx) = bounded(workers);
            let handles = (0..workers)
                .map(|_| {
                    let rx = rx.clone();
                    let (cancel, merged) = (&cancel, &merged);
                    s.spawn(move || self.refine_batches(rx, cancel, merged))
                })
                .collect::<Vec<_>>();
            drop(rx);

            for batch in candidates.chunks(batch_size) {
                if cancel.load(Ordering::Acquire) || self.abort.load(Ordering::Acquire) {
                    break;
                }
                if tx.send(batch).is_err() {
                    break;
                }
            }
            drop(tx);

            for handle in handles {
                handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e))?;
            }
            Ok(())
        })?;

        Ok(merged.into_inner().unwrap_or_else(|e| e.into_inner()))
    }

    fn refine_batches(&self, rx: Receiver<&[Candidate]>, cancel: &AtomicBool, merged: &Mutex<Merged>) -> Result<()> {
        while let Ok(batch) = rx.recv() {
            let mut local = Merged::default();
            // 只有成功设置取消信号的线程负责合并触发结果
            let mut triggered = false;
            for (id, candidate) in batch {
                if cancel.load(Ordering::Acquire) || self.abort.load(Ordering::Acquire) {
                    break;
                }
                let Some(mut result) = self.evaluate(*id, candidate.as_ref())? else {
                    local.skipped += 1;
                    continue;
                };
                local.refined += 1;
                let stop = result.triggers_early_stop(&self.config);
                result.early_stopped = stop;
                if result.passes(&self.config) {
                    local.results.push(result);
                }
                if stop {
                    triggered = !cancel.swap(true, Ordering::AcqRel);
                    break;
                }
            }

            let mut m = merged.lock().unwrap_or_else(|e| e.into_inner());
            m.refined += local.refined;
            m.skipped += local.skipped;
            if triggered {
                info!("early stop with {} results in the last batch", local.results.len());
                m.early_stopped = true;
                m.results.append(&mut local.results);
            } else if cancel.load(Ordering::Acquire) {
                debug!("discarding {} results after cancellation", local.results.len());
            } else {
                m.results.append(&mut local.results);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ImageRecord;

    fn descriptors(seed: u64, n: usize) -> Vec<Descriptor> {
        use rand::prelude::*;
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let mut d = [0u8; 32];
                rng.fill_bytes(&mut d);
                d
            })
            .collect()
    }

    fn context(images: u64) -> SearchContext {
        let mut store = DescriptorStore::new();
        for id in 0..images {
            store.insert(ImageRecord::new(ImageId(id), format!("{id}.npy"), descriptors(id, 50)));
        }
        let config = SearchConfig { early_stop_threshold: 2.0, ..Default::default() };
        SearchContext::new(store, config).unwrap()
    }

    #[test]
    fn test_brute_force_without_index() {
        let ctx = context(5);
        let report = ctx.search_report(&descriptors(3, 50), 3).unwrap();
        assert_eq!(report.mode, SearchMode::BruteForce);
        assert_eq!(report.state, SearchState::Done);
        assert_eq!(report.candidates, 5);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].image_id, ImageId(3));
        assert_eq!(report.results[0].annoy_similarity, 0.0);
        assert_eq!(report.results[0].path.as_deref(), Some("3.npy"));
    }

    #[test]
    fn test_empty_query() {
        let ctx = context(3);
        let report = ctx.search_report(&[], 3).unwrap();
        assert!(report.results.is_empty());
        assert_eq!(report.state, SearchState::Done);
    }

    #[test]
    fn test_abort() {
        let ctx = context(3);
        let abort = AtomicBool::new(true);
        let r = ctx.search_with_abort(&descriptors(1, 50), 3, &abort);
        assert!(matches!(r, Err(Error::Aborted)));
    }

    #[test]
    fn test_index_mode() {
        let ctx = context(20);
        ctx.ingest(&crate::memory::FixedMemoryMonitor::available(u64::MAX), &|_: &builder::ProgressEvent| {})
            .unwrap();
        let report = ctx.search_report(&descriptors(7, 50), 5).unwrap();
        assert_eq!(report.mode, SearchMode::Index);
        assert_eq!(report.results[0].image_id, ImageId(7));
        assert!(report.results[0].annoy_similarity > 0.0);
    }

    #[test]
    fn test_missing_record_is_skipped() {
        let ctx = context(4);
        ctx.ingest(&crate::memory::FixedMemoryMonitor::available(u64::MAX), &|_: &builder::ProgressEvent| {})
            .unwrap();
        // 索引仍然引用图片 2，但描述符已经被删除
        let mut store = (*ctx.store()).clone();
        store.remove(ImageId(2));
        ctx.replace_store(store);

        let report = ctx.search_report(&descriptors(2, 50), 5).unwrap();
        assert_eq!(report.skipped, 1);
        assert!(report.results.iter().all(|r| r.image_id != ImageId(2)));
    }
}
