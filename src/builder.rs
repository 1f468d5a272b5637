use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::forest::{ApproximateIndex, ForestParams, IndexEntry};
use crate::hamming::DESCRIPTOR_BYTES;
use crate::memory::{MemoryMonitor, MemoryUsage};
use crate::metrics;
use crate::search_config::SearchConfig;
use crate::store::{DescriptorStore, ImageRecord};

/// 估算内存占用时每个描述符的额外开销倍数
pub const ENTRY_OVERHEAD: u64 = 4;

/// 估算 n 个描述符的内存占用
pub fn estimate_footprint(entries: usize) -> u64 {
    entries as u64 * DESCRIPTOR_BYTES as u64 * ENTRY_OVERHEAD
}

/// 每个批次处理完成后的进度
#[derive(Debug, Clone)]
pub struct BatchProgress {
    /// 批次序号，从 1 开始
    pub batch: usize,
    pub images_processed: usize,
    pub images_total: usize,
    /// 目前累计的描述符数量
    pub entries: usize,
    pub projected_bytes: u64,
    pub elapsed: Duration,
    pub memory: MemoryUsage,
}

/// 构建索引过程中的事件
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    IngestStarted { images: usize, projected_entries: usize },
    BatchIngested(BatchProgress),
    /// 内存压力警告，构建仍会继续
    MemoryPressure { projected_bytes: u64, available_bytes: u64 },
    /// 损坏的记录被跳过
    RecordSkipped { record: String, reason: String },
    /// 开始构建森林，这是内存和 CPU 占用最高的阶段
    ForestBuildStarted { entries: usize, tree_count: usize },
    ForestBuildFinished { entries: usize, estimated_bytes: u64, elapsed: Duration },
}

/// 进度事件的接收者
pub trait ProgressObserver: Sync {
    fn report(&self, event: &ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressEvent) + Sync,
{
    fn report(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// 将进度输出到日志
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn report(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::IngestStarted { images, projected_entries } => {
                info!("开始读取 {images} 张图片，预计描述符数量：{projected_entries}");
            }
            ProgressEvent::BatchIngested(p) => {
                info!(
                    "批次 {}：{}/{} 张图片，{} 个描述符，预计占用 {:.1} MiB，可用内存 {:.1} MiB，耗时 {:.2}s",
                    p.batch,
                    p.images_processed,
                    p.images_total,
                    p.entries,
                    mib(p.projected_bytes),
                    mib(p.memory.available_bytes),
                    p.elapsed.as_secs_f32()
                );
            }
            ProgressEvent::MemoryPressure { projected_bytes, available_bytes } => {
                warn!(
                    "内存压力：预计占用 {:.1} MiB，可用内存 {:.1} MiB",
                    mib(*projected_bytes),
                    mib(*available_bytes)
                );
            }
            ProgressEvent::RecordSkipped { record, reason } => {
                warn!("跳过损坏的记录 {record}：{reason}");
            }
            ProgressEvent::ForestBuildStarted { entries, tree_count } => {
                info!("开始构建索引：{entries} 个描述符，{tree_count} 棵树");
            }
            ProgressEvent::ForestBuildFinished { entries, estimated_bytes, elapsed } => {
                info!(
                    "索引构建完成：{entries} 个描述符，约 {:.1} MiB，耗时 {:.2}s",
                    mib(*estimated_bytes),
                    elapsed.as_secs_f32()
                );
            }
        }
    }
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// 分批读取描述符并构建索引，构建过程中持续检查内存占用
pub struct IncrementalIndexBuilder<'a> {
    config: &'a SearchConfig,
    monitor: &'a dyn MemoryMonitor,
    observer: &'a dyn ProgressObserver,
}

impl<'a> IncrementalIndexBuilder<'a> {
    pub fn new(
        config: &'a SearchConfig,
        monitor: &'a dyn MemoryMonitor,
        observer: &'a dyn ProgressObserver,
    ) -> Self {
        Self { config, monitor, observer }
    }

    /// 读取全部图片并构建索引
    ///
    /// 超过内存硬上限时返回 [`Error::MemoryBudgetExceeded`]，已读取的数据全部丢弃
    pub fn ingest(&self, store: &DescriptorStore) -> Result<ApproximateIndex> {
        let start = Instant::now();
        let batch_size = self.config.batch_size.max(1);
        let records = store.iter().collect::<Vec<_>>();
        let images_total = records.len();

        self.observer.report(&ProgressEvent::IngestStarted {
            images: images_total,
            projected_entries: images_total * self.config.descriptor_count_target,
        });

        let mut entries: Vec<IndexEntry> = Vec::new();
        let mut images_processed = 0;
        let mut warned = false;

        for (batch_no, batch) in records.chunks(batch_size).enumerate() {
            let valid = batch.iter().copied().filter(|r| self.check_record(r)).collect::<Vec<_>>();

            let batch_entries = valid.iter().map(|r| r.descriptors.len()).sum::<usize>();
            let projected_bytes = estimate_footprint(entries.len() + batch_entries);
            let memory = self.monitor.current_usage();
            let available = memory.available_bytes as f64;

            if projected_bytes as f64 > available * self.config.memory_abort_ratio as f64 {
                warn!(
                    "预计内存占用 {} 字节超过硬上限（可用 {} 字节），放弃构建",
                    projected_bytes, memory.available_bytes
                );
                return Err(Error::MemoryBudgetExceeded {
                    projected: projected_bytes,
                    available: memory.available_bytes,
                });
            }
            if !warned && projected_bytes as f64 > available * self.config.memory_warn_ratio as f64 {
                warned = true;
                self.observer.report(&ProgressEvent::MemoryPressure {
                    projected_bytes,
                    available_bytes: memory.available_bytes,
                });
            }

            entries.reserve(batch_entries);
            entries.par_extend(valid.par_iter().flat_map_iter(|&r| {
                r.descriptors.iter().map(move |d| IndexEntry { descriptor: *d, owner: r.id })
            }));
            images_processed += batch.len();

            self.observer.report(&ProgressEvent::BatchIngested(BatchProgress {
                batch: batch_no + 1,
                images_processed,
                images_total,
                entries: entries.len(),
                projected_bytes,
                elapsed: start.elapsed(),
                memory,
            }));
        }

        if entries.is_empty() {
            return Err(Error::Build("descriptor store contains no descriptors".to_string()));
        }

        let total = entries.len();
        let params = ForestParams {
            tree_count: self.config.tree_count,
            leaf_size: self.config.leaf_size,
            seed: self.config.seed,
        };
        self.observer.report(&ProgressEvent::ForestBuildStarted {
            entries: total,
            tree_count: params.tree_count,
        });
        let build_start = Instant::now();
        let index = ApproximateIndex::build_with(entries, &params)?;
        let estimated_bytes = index.estimated_bytes();
        self.observer.report(&ProgressEvent::ForestBuildFinished {
            entries: total,
            estimated_bytes,
            elapsed: build_start.elapsed(),
        });

        metrics::set_indexed_descriptors(total);
        debug!("ingest finished in {:.2}s", start.elapsed().as_secs_f32());
        Ok(index)
    }

    fn check_record(&self, record: &ImageRecord) -> bool {
        match record.validate() {
            Ok(()) => true,
            Err(e) => {
                self.observer.report(&ProgressEvent::RecordSkipped {
                    record: record.id.to_string(),
                    reason: e.to_string(),
                });
                false
            }
        }
    }
}

/// 使用给定配置构建索引
pub fn ingest(
    store: &DescriptorStore,
    config: &SearchConfig,
    monitor: &dyn MemoryMonitor,
    observer: &dyn ProgressObserver,
) -> Result<ApproximateIndex> {
    IncrementalIndexBuilder::new(config, monitor, observer).ingest(store)
}
