use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};

use crate::builder::ProgressObserver;
use crate::config::ConfDir;
use crate::forest::ApproximateIndex;
use crate::hamming::Descriptor;
use crate::memory::MemoryMonitor;
use crate::search_config::{ConfigUpdate, SearchConfig};
use crate::searcher::SearchContext;
use crate::store::{DescriptorStore, FeatureCache, ImageId, ImageRecord};

/// 添加图片的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    PathUpdated,
    Skipped,
}

/// 配置目录中的描述符、索引和搜索配置
pub struct IMDB {
    conf_dir: ConfDir,
    store: DescriptorStore,
    config: SearchConfig,
}

impl IMDB {
    /// 打开配置目录，目录不存在时自动创建
    ///
    /// # Arguments
    ///
    /// * `conf_dir` - 配置目录
    pub fn open(conf_dir: ConfDir) -> Result<Self> {
        fs::create_dir_all(conf_dir.path())
            .with_context(|| format!("failed to create {}", conf_dir.path().display()))?;
        let config = read_config(&conf_dir.search_config())?;
        let store = DescriptorStore::open_or_default(conf_dir.features())?;
        Ok(Self { conf_dir, store, config })
    }

    pub fn conf_dir(&self) -> &ConfDir {
        &self.conf_dir
    }

    pub fn store(&self) -> &DescriptorStore {
        &self.store
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// 校验并保存配置更新，失败时配置文件保持不变
    pub fn update_config(&mut self, update: &ConfigUpdate) -> Result<&SearchConfig> {
        let new = self.config.apply(update)?;
        let path = self.conf_dir.search_config();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&new)?)?;
        fs::rename(&tmp, &path)?;
        info!("配置已保存到 {}", path.display());
        self.config = new;
        Ok(&self.config)
    }

    /// 临时修改本次运行的配置，不写入文件
    pub fn override_config(&mut self, update: &ConfigUpdate) -> Result<&SearchConfig> {
        self.config = self.config.apply(update)?;
        Ok(&self.config)
    }

    /// 添加一张图片的描述符
    ///
    /// # Arguments
    ///
    /// * `id` - 源文件的哈希
    /// * `path` - 记录的图片路径
    /// * `descriptors` - 描述符，超过 `descriptor_count_target` 的部分被截断
    /// * `overwrite` - 图片已存在时是否更新路径
    pub fn add_image(
        &mut self,
        id: ImageId,
        path: &str,
        mut descriptors: Vec<Descriptor>,
        overwrite: bool,
    ) -> AddOutcome {
        if self.store.load(id).is_some() {
            if overwrite {
                self.store.update_path(id, path);
                return AddOutcome::PathUpdated;
            }
            return AddOutcome::Skipped;
        }
        descriptors.truncate(self.config.descriptor_count_target);
        self.store.insert(ImageRecord::new(id, path, descriptors));
        AddOutcome::Added
    }

    /// 删除源文件已不存在的记录，返回删除的数量
    ///
    /// 有记录被删除时旧的索引一并删除
    pub fn clean(&mut self) -> Result<usize> {
        let removed = self.store.retain(|record| Path::new(&record.path).exists());
        if removed > 0 {
            self.save_store()?;
            self.remove_index()?;
        }
        Ok(removed)
    }

    /// 删除已保存的索引，返回索引是否存在
    ///
    /// 索引不包含之后添加的图片，描述符变化后需要重新构建
    pub fn remove_index(&self) -> Result<bool> {
        let index = self.conf_dir.index();
        if !index.exists() {
            return Ok(false);
        }
        fs::remove_file(&index)?;
        info!("已删除过期的索引 {}", index.display());
        Ok(true)
    }

    pub fn save_store(&self) -> Result<()> {
        self.store.save(self.conf_dir.features())?;
        Ok(())
    }

    /// 构建索引并保存到配置目录
    pub fn build_index(&self, monitor: &dyn MemoryMonitor, observer: &dyn ProgressObserver) -> Result<ApproximateIndex> {
        let index = crate::builder::ingest(&self.store, &self.config, monitor, observer)?;
        index.save(self.conf_dir.index())?;
        Ok(index)
    }

    /// 读取已保存的索引
    pub fn load_index(&self) -> Result<Option<ApproximateIndex>> {
        let path = self.conf_dir.index();
        if !path.exists() {
            debug!("no index at {}", path.display());
            return Ok(None);
        }
        Ok(Some(ApproximateIndex::open(path)?))
    }

    /// 转换为搜索上下文，已保存的索引会被加载
    pub fn into_context(self) -> Result<SearchContext> {
        let index = self.load_index()?;
        let ctx = SearchContext::new(self.store, self.config)?;
        if let Some(index) = index {
            ctx.install_index(index);
        }
        Ok(ctx)
    }
}

fn read_config(path: &Path) -> Result<SearchConfig> {
    if !path.exists() {
        return Ok(SearchConfig::default());
    }
    let config: SearchConfig = serde_json::from_slice(&fs::read(path)?)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}
