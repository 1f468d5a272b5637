use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::debug;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{Opts, SearchOptions};
use crate::imdb::IMDB;
use crate::metrics;
use crate::scorer::MatchResult;
use crate::search_config::ConfigUpdate;
use crate::utils;

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub search: SearchOptions,
    /// 只对本次搜索生效的配置
    #[command(flatten)]
    pub config: ConfigUpdate,
    /// 查询图片的描述符文件
    pub query: String,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
    /// 搜索完成后将 prometheus 指标输出到 stderr
    #[arg(long)]
    pub metrics: bool,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let query = block_in_place(|| utils::read_descriptors(&self.query))?;
        debug!("query descriptors: {}", query.len());

        let mut db = block_in_place(|| IMDB::open(opts.conf_dir.clone()))?;
        db.override_config(&self.config)?;
        db.override_config(&ConfigUpdate {
            use_index: self.search.brute_force.then_some(false),
            parallel: self.search.sequential.then_some(false),
            ..Default::default()
        })?;

        let ctx = block_in_place(|| db.into_context())?;
        let report = block_in_place(|| ctx.search_report(&query, self.search.count))?;
        debug!(
            "mode: {}, candidates: {}, refined: {}, skipped: {}, early stopped: {}",
            report.mode.as_str(),
            report.candidates,
            report.refined,
            report.skipped,
            report.early_stopped
        );

        print_result(&report.results, self)?;
        if self.metrics {
            eprintln!("{}", metrics::gather_text());
        }
        Ok(())
    }
}

fn print_result(result: &[MatchResult], opts: &SearchCommand) -> Result<()> {
    match opts.output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?)
        }
        OutputFormat::Table => {
            for r in result {
                let path = r.path.as_deref().unwrap_or_default();
                println!(
                    "{:.2}\t{:.2}\t{:.2}\t{}\t{}",
                    r.hybrid_score, r.orb_similarity, r.annoy_similarity, r.image_id, path
                );
            }
        }
    }
    Ok(())
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}
