use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hamming::Descriptor;

/// 图片的唯一标识，只要源文件不变就保持稳定
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImageId(pub u64);

impl ImageId {
    /// 使用文件内容的哈希值生成 ID
    pub fn from_hash(hash: &blake3::Hash) -> Self {
        let bytes = hash.as_bytes();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        Self(u64::from_le_bytes(buf))
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// 一张图片及其全部描述符
///
/// `descriptor_count` 必须等于 `descriptors.len()`，反序列化得到的记录可能不满足，
/// 使用前应调用 [`ImageRecord::validate`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: ImageId,
    pub path: String,
    pub descriptors: Vec<Descriptor>,
    pub descriptor_count: usize,
}

impl ImageRecord {
    pub fn new(id: ImageId, path: impl Into<String>, descriptors: Vec<Descriptor>) -> Self {
        let descriptor_count = descriptors.len();
        Self { id, path: path.into(), descriptors, descriptor_count }
    }

    /// 检查记录是否可以参与匹配
    pub fn validate(&self) -> Result<()> {
        if self.descriptor_count != self.descriptors.len() {
            return Err(Error::CorruptRecord {
                id: self.id,
                reason: format!(
                    "descriptor_count is {} but {} descriptors are stored",
                    self.descriptor_count,
                    self.descriptors.len()
                ),
            });
        }
        if self.descriptors.is_empty() {
            return Err(Error::CorruptRecord { id: self.id, reason: "no descriptors".to_string() });
        }
        Ok(())
    }
}

/// 特征缓存，避免重复提取描述符
pub trait FeatureCache {
    /// 读取图片的描述符，未命中时返回 None
    fn load(&self, id: ImageId) -> Option<Vec<Descriptor>>;

    /// 保存图片的描述符
    fn store(&mut self, id: ImageId, descriptors: Vec<Descriptor>);
}

/// 图片 ID 到描述符序列的映射，不包含任何搜索逻辑
///
/// 使用 BTreeMap 保证遍历顺序稳定，相同的数据总能构建出相同的索引
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DescriptorStore {
    records: BTreeMap<ImageId, ImageRecord>,
}

impl DescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入一条记录，如果 ID 已存在则替换并返回旧记录
    pub fn insert(&mut self, record: ImageRecord) -> Option<ImageRecord> {
        self.records.insert(record.id, record)
    }

    pub fn remove(&mut self, id: ImageId) -> Option<ImageRecord> {
        self.records.remove(&id)
    }

    pub fn get(&self, id: ImageId) -> Option<&ImageRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: ImageId) -> bool {
        self.records.contains_key(&id)
    }

    /// 更新图片路径，返回图片是否存在
    pub fn update_path(&mut self, id: ImageId, path: impl Into<String>) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.path = path.into();
                true
            }
            None => false,
        }
    }

    /// 只保留满足条件的记录，返回被删除的数量
    pub fn retain(&mut self, mut f: impl FnMut(&ImageRecord) -> bool) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| f(record));
        before - self.records.len()
    }

    /// 按 ID 升序遍历所有记录
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &ImageRecord> + '_ {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 所有图片的描述符总数
    pub fn total_descriptors(&self) -> usize {
        self.records.values().map(|r| r.descriptors.len()).sum()
    }

    /// 从文件中加载
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("reading descriptor store from {}", path.display());
        let reader = BufReader::new(File::open(path)?);
        let store: Self = bincode::deserialize_from(reader)?;
        info!("已加载 {} 张图片，共 {} 个描述符", store.len(), store.total_descriptors());
        Ok(store)
    }

    /// 文件不存在时返回空的存储
    pub fn open_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() { Self::open(path) } else { Ok(Self::default()) }
    }

    /// 保存到文件，先写入临时文件再重命名，避免写到一半的文件覆盖旧数据
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            bincode::serialize_into(&mut writer, self)?;
        }
        std::fs::rename(&tmp, path)?;
        debug!("descriptor store saved to {}", path.display());
        Ok(())
    }
}

impl FeatureCache for DescriptorStore {
    fn load(&self, id: ImageId) -> Option<Vec<Descriptor>> {
        self.records.get(&id).map(|r| r.descriptors.clone())
    }

    fn store(&mut self, id: ImageId, descriptors: Vec<Descriptor>) {
        let path = match self.records.get(&id) {
            Some(record) => record.path.clone(),
            None => id.to_string(),
        };
        self.insert(ImageRecord::new(id, path, descriptors));
    }
}
