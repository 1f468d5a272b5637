use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressIterator};
use log::{info, warn};
use regex::Regex;
use tokio::sync::mpsc::{Sender, channel};
use tokio::task::{JoinHandle, block_in_place};
use walkdir::WalkDir;

use crate::cli::SubCommandExtend;
use crate::config::Opts;
use crate::imdb::{AddOutcome, IMDB};
use crate::store::ImageId;
use crate::utils::{self, pb_style};

#[derive(Parser, Debug, Clone)]
pub struct AddCommand {
    /// 描述符文件所在目录，每个文件是 N x 32 的 u8 矩阵
    pub path: PathBuf,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "npy")]
    pub suffix: String,
    /// 最少描述符数量，低于该值的文件会被过滤
    #[arg(short, long, default_value_t = 10)]
    pub min_descriptors: usize,
    /// 如果图片已添加，是否覆盖旧的记录
    #[arg(long)]
    pub overwrite: bool,
}

impl SubCommandExtend for AddCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let re_suf = Regex::new(&format!("(?i)^({})$", self.suffix.replace(',', "|")))?;
        let root = std::fs::canonicalize(&self.path)?;
        let mut db = block_in_place(|| IMDB::open(opts.conf_dir.clone()))?;

        let pb = ProgressBar::no_length().with_style(pb_style());

        // task1: 读取文件并计算哈希
        let (hash_tx, mut hash_rx) = channel(num_cpus::get() * 2);
        let task_hash: JoinHandle<Result<()>> = tokio::spawn({
            let pb = pb.clone();
            async move { hash_directory(root, re_suf, hash_tx, pb).await }
        });

        // task2: 解析描述符并添加到数据库
        let mut added = 0;
        while let Some((entry, data, id)) = hash_rx.recv().await {
            pb.inc(1);
            let descriptors = match block_in_place(|| utils::parse_descriptors(&data)) {
                Ok(descriptors) => descriptors,
                Err(e) => {
                    pb.println(format!("读取描述符失败: {entry}: {e}"));
                    continue;
                }
            };
            if descriptors.len() < self.min_descriptors {
                pb.set_message(format!("描述符少于 {}: {}", self.min_descriptors, entry));
                continue;
            }
            match db.add_image(id, &entry, descriptors, self.overwrite) {
                AddOutcome::Added => {
                    added += 1;
                    pb.set_message(entry);
                }
                AddOutcome::PathUpdated => pb.set_message(format!("更新图片路径: {entry}")),
                AddOutcome::Skipped => pb.set_message(format!("跳过图片: {entry}")),
            }
        }
        task_hash.await??;

        pb.finish_with_message("描述符添加完成");
        block_in_place(|| db.save_store())?;
        info!("新增 {} 张图片，共 {} 张", added, db.store().len());
        if added > 0 && block_in_place(|| db.remove_index())? {
            warn!("旧索引不包含新增的图片，请重新运行 build");
        }
        Ok(())
    }
}

async fn hash_directory(
    path: impl AsRef<Path>,
    re_suf: Regex,
    hash_tx: Sender<(String, Vec<u8>, ImageId)>,
    pb: ProgressBar,
) -> Result<()> {
    info!("开始扫描目录: {}", path.as_ref().display());
    let pb2 = ProgressBar::no_length().with_style(pb_style());
    let entries = WalkDir::new(path)
        .into_iter()
        .progress_with(pb2)
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let path = entry.path();
            let ext = path.extension()?;
            (path.is_file() && re_suf.is_match(&ext.to_string_lossy()))
                .then(|| path.to_string_lossy().to_string())
        })
        .collect::<Vec<_>>();
    info!("扫描完成，共 {} 个文件", entries.len());

    pb.set_length(entries.len() as u64);

    for entry in entries {
        let data = tokio::fs::read(&entry).await?;
        let id = block_in_place(|| utils::hash_bytes(&data));
        hash_tx.send((entry, data, id)).await?;
    }
    Ok(())
}
