use anyhow::Result;
use clap::Parser;
use indicatif::ProgressBar;
use log::info;
use tokio::task::block_in_place;

use crate::builder::{LogObserver, ProgressEvent, ProgressObserver};
use crate::cli::SubCommandExtend;
use crate::imdb::IMDB;
use crate::memory::SystemMemoryMonitor;
use crate::search_config::ConfigUpdate;
use crate::utils::pb_style;
use crate::Opts;

#[derive(Parser, Debug, Clone)]
pub struct BuildCommand {
    /// 只对本次构建生效的配置
    #[command(flatten)]
    pub config: ConfigUpdate,
}

impl SubCommandExtend for BuildCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let mut db = block_in_place(|| IMDB::open(opts.conf_dir.clone()))?;
        db.override_config(&self.config)?;

        let observer = BarObserver { pb: ProgressBar::no_length().with_style(pb_style()) };
        let index = block_in_place(|| db.build_index(&SystemMemoryMonitor, &observer))?;
        observer.pb.finish_with_message("索引构建完成");
        info!("构建索引成功: {} 个描述符, {} 棵树", index.len(), index.tree_count());
        Ok(())
    }
}

/// 在进度条上显示构建进度，警告同时写入日志
struct BarObserver {
    pb: ProgressBar,
}

impl ProgressObserver for BarObserver {
    fn report(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::IngestStarted { images, .. } => {
                self.pb.set_length(*images as u64);
                self.pb.set_message("读取描述符");
            }
            ProgressEvent::BatchIngested(p) => {
                self.pb.set_position(p.images_processed as u64);
                self.pb.set_message(format!("{} 个描述符", p.entries));
            }
            ProgressEvent::ForestBuildStarted { entries, tree_count } => {
                self.pb.set_message(format!("正在构建 {tree_count} 棵树 ({entries} 个描述符)"));
            }
            _ => self.pb.suspend(|| LogObserver.report(event)),
        }
    }
}
