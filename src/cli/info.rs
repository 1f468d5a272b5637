use anyhow::Result;
use clap::Parser;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::imdb::IMDB;
use crate::Opts;

#[derive(Parser, Debug, Clone)]
pub struct InfoCommand {}

impl SubCommandExtend for InfoCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let db = block_in_place(|| IMDB::open(opts.conf_dir.clone()))?;
        println!("配置目录: {}", db.conf_dir());
        println!("图片数量: {}", db.store().len());
        println!("描述符数量: {}", db.store().total_descriptors());
        match block_in_place(|| db.load_index())? {
            Some(index) => println!(
                "索引: {} 个描述符, {} 棵树, 约 {:.1} MiB",
                index.len(),
                index.tree_count(),
                index.estimated_bytes() as f64 / (1024.0 * 1024.0)
            ),
            None => println!("索引: 未构建"),
        }
        Ok(())
    }
}
