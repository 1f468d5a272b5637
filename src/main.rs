use clap::Parser;
use imatch::cli::SubCommandExtend;
use imatch::config::{Opts, SubCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();

    match &opts.subcmd {
        SubCommand::Add(cmd) => cmd.run(&opts).await,
        SubCommand::Build(cmd) => cmd.run(&opts).await,
        SubCommand::Search(cmd) => cmd.run(&opts).await,
        SubCommand::Config(cmd) => cmd.run(&opts).await,
        SubCommand::Info(cmd) => cmd.run(&opts).await,
        SubCommand::Clean(cmd) => cmd.run(&opts).await,
    }
}
