use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cli::*;

static CONF_DIR: LazyLock<ConfDir> = LazyLock::new(|| {
    let path = match ProjectDirs::from("", "imatch", "imatch") {
        Some(dirs) => dirs.config_dir().to_path_buf(),
        None => PathBuf::from(".imatch"),
    };
    ConfDir { path }
});

fn default_config_dir() -> &'static str {
    CONF_DIR.path().to_str().unwrap_or(".imatch")
}

#[derive(Parser, Debug, Clone)]
pub struct SearchOptions {
    /// 显示的结果数量
    #[arg(long, value_name = "COUNT", default_value_t = 5)]
    pub count: usize,
    /// 强制使用暴力搜索，忽略已构建的索引
    #[arg(long)]
    pub brute_force: bool,
    /// 顺序执行精确匹配
    #[arg(long)]
    pub sequential: bool,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "imatch", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// imatch 配置文件目录
    #[arg(short, long, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 添加描述符文件到数据库
    Add(AddCommand),
    /// 使用已添加的描述符构建索引
    Build(BuildCommand),
    /// 从数据库中搜索图片
    Search(SearchCommand),
    /// 查看或修改搜索配置
    Config(ConfigCommand),
    /// 显示数据库信息
    Info(InfoCommand),
    /// 删除源文件已不存在的记录
    Clean(CleanCommand),
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回描述符文件的路径
    pub fn features(&self) -> PathBuf {
        self.path.join("features.bin")
    }

    /// 返回索引文件的路径
    pub fn index(&self) -> PathBuf {
        self.path.join("index.bin")
    }

    /// 返回搜索配置文件的路径
    pub fn search_config(&self) -> PathBuf {
        self.path.join("config.json")
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}

impl std::fmt::Display for ConfDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}
