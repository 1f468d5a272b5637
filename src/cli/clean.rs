use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::imdb::IMDB;
use crate::Opts;

#[derive(Parser, Debug, Clone)]
pub struct CleanCommand {}

impl SubCommandExtend for CleanCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let mut db = block_in_place(|| IMDB::open(opts.conf_dir.clone()))?;
        info!("清理记录中……");
        let removed = block_in_place(|| db.clean())?;
        info!("清理完成，删除 {} 条记录", removed);
        Ok(())
    }
}
