use anyhow::Result;
use clap::Parser;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::imdb::IMDB;
use crate::search_config::ConfigUpdate;
use crate::Opts;

#[derive(Parser, Debug, Clone)]
pub struct ConfigCommand {
    /// 不指定任何参数时只显示当前配置
    #[command(flatten)]
    pub update: ConfigUpdate,
    /// 从 JSON 文件读取配置更新
    #[arg(long, value_name = "FILE")]
    pub from_json: Option<String>,
}

impl SubCommandExtend for ConfigCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let mut db = block_in_place(|| IMDB::open(opts.conf_dir.clone()))?;
        if let Some(file) = &self.from_json {
            let update: ConfigUpdate = serde_json::from_slice(&tokio::fs::read(file).await?)?;
            block_in_place(|| db.update_config(&update).map(|_| ()))?;
        }
        if !self.update.is_empty() {
            block_in_place(|| db.update_config(&self.update).map(|_| ()))?;
        }
        println!("{}", serde_json::to_string_pretty(db.config())?);
        Ok(())
    }
}
