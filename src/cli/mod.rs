mod add;
mod build;
mod clean;
mod config;
mod info;
mod search;

pub use add::*;
pub use build::*;
pub use clean::*;
pub use config::*;
pub use info::*;
pub use search::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}
