//! 基于随机超平面划分的近似最近邻索引（随机投影森林）
//!
//! 每棵树在每个节点随机选出两个参考描述符，按照距离哪一个更近将描述符分到左右子树，
//! 直到叶子节点足够小。查询时使用一个跨所有树的优先队列，优先展开距离分界面更远
//! 的分支，收集到足够多的候选后再计算精确的汉明距离并排序。
//!
//! 索引构建完成后只读，可以在多个线程之间直接共享。

use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::{debug, info};
use rand::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hamming::{Descriptor, hamming};
use crate::store::ImageId;

/// 树的最大深度，防止大量重复描述符导致退化
const MAX_DEPTH: usize = 64;

/// 选择两个不同参考点的最大尝试次数
const MAX_PIVOT_TRIES: usize = 8;

/// 插入索引的最小单元
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub descriptor: Descriptor,
    pub owner: ImageId,
}

/// 一次查询返回的近邻
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbor<'a> {
    pub entry: &'a IndexEntry,
    /// 到查询描述符的汉明距离
    pub distance: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForestParams {
    pub tree_count: usize,
    pub leaf_size: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self { tree_count: 10, leaf_size: 64, seed: 42 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Split { left_ref: Descriptor, right_ref: Descriptor, left: u32, right: u32 },
    Leaf { items: Vec<u32> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
    root: u32,
}

/// 随机投影森林
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproximateIndex {
    entries: Vec<IndexEntry>,
    trees: Vec<Tree>,
    params: ForestParams,
}

impl ApproximateIndex {
    /// 使用默认的叶子大小和随机数种子构建索引
    pub fn build(entries: Vec<IndexEntry>, tree_count: usize) -> Result<Self> {
        Self::build_with(entries, &ForestParams { tree_count, ..Default::default() })
    }

    /// 构建索引，每棵树使用由种子派生出的独立随机数生成器，结果与线程调度无关
    pub fn build_with(entries: Vec<IndexEntry>, params: &ForestParams) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::Build("no entries to index".to_string()));
        }
        if params.tree_count < 1 {
            return Err(Error::Build(format!("tree_count must be >= 1, got {}", params.tree_count)));
        }
        if params.leaf_size < 2 {
            return Err(Error::Build(format!("leaf_size must be >= 2, got {}", params.leaf_size)));
        }
        if entries.len() > u32::MAX as usize {
            return Err(Error::Build(format!("too many entries: {}", entries.len())));
        }

        info!("正在构建 {} 棵树，描述符数量：{}", params.tree_count, entries.len());
        let trees = (0..params.tree_count)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(tree_seed(params.seed, i));
                let mut builder = TreeBuilder { entries: &entries, leaf_size: params.leaf_size, nodes: vec![] };
                let items = (0..entries.len() as u32).collect::<Vec<_>>();
                let root = builder.build_node(items, 0, &mut rng);
                Tree { nodes: builder.nodes, root }
            })
            .collect::<Vec<_>>();

        let index = Self { entries, trees, params: params.clone() };
        debug!("森林构建完成，节点总数：{}", index.node_count());
        Ok(index)
    }

    /// 查询最近的 k 个描述符，候选数量预算为 k * 树的数量
    pub fn query(&self, descriptor: &Descriptor, k: usize) -> Vec<Neighbor<'_>> {
        self.query_with_budget(descriptor, k, k * self.trees.len())
    }

    /// 查询最近的 k 个描述符，在收集到 search_k 个候选后停止展开
    ///
    /// 结果按距离升序排列，距离相同时按插入顺序排列，长度不超过 k
    pub fn query_with_budget(&self, descriptor: &Descriptor, k: usize, search_k: usize) -> Vec<Neighbor<'_>> {
        if k == 0 {
            return vec![];
        }
        let search_k = search_k.max(k);

        let mut heap = BinaryHeap::with_capacity(self.trees.len() * 4);
        for (t, tree) in self.trees.iter().enumerate() {
            heap.push((i32::MAX, t as u32, tree.root));
        }

        let mut candidates: Vec<u32> = Vec::with_capacity(search_k + self.params.leaf_size);
        while candidates.len() < search_k {
            let Some((priority, t, n)) = heap.pop() else {
                break;
            };
            match &self.trees[t as usize].nodes[n as usize] {
                Node::Leaf { items } => candidates.extend_from_slice(items),
                Node::Split { left_ref, right_ref, left, right } => {
                    // margin > 0 表示更靠近左侧参考点
                    let margin = hamming(descriptor, right_ref) as i32 - hamming(descriptor, left_ref) as i32;
                    heap.push((priority.min(margin), t, *left));
                    heap.push((priority.min(-margin), t, *right));
                }
            }
        }

        candidates.sort_unstable();
        candidates.dedup();

        let mut scored = candidates
            .into_iter()
            .map(|i| (hamming(descriptor, &self.entries[i as usize].descriptor), i))
            .collect::<Vec<_>>();
        if k < scored.len() {
            scored.select_nth_unstable(k);
            scored.truncate(k);
        }
        scored.sort_unstable();

        scored
            .into_iter()
            .map(|(distance, i)| Neighbor { entry: &self.entries[i as usize], distance })
            .collect()
    }

    /// 索引中的描述符数量
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    fn node_count(&self) -> usize {
        self.trees.iter().map(|t| t.nodes.len()).sum()
    }

    /// 粗略估计索引占用的内存
    pub fn estimated_bytes(&self) -> u64 {
        let entries = self.entries.len() * size_of::<IndexEntry>();
        // 每个描述符在每棵树的叶子中出现一次
        let items = self.entries.len() * self.trees.len() * size_of::<u32>();
        let nodes = self.node_count() * size_of::<Node>();
        (entries + items + nodes) as u64
    }

    /// 从文件中加载索引
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("reading index from {}", path.display());
        let reader = BufReader::new(File::open(path)?);
        let index: Self = bincode::deserialize_from(reader)?;
        if index.is_empty() || index.trees.is_empty() {
            return Err(Error::Build(format!("index file {} is empty", path.display())));
        }
        debug!("indexed descriptors: {}", index.len());
        Ok(index)
    }

    /// 保存索引，先写入临时文件再重命名
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            bincode::serialize_into(&mut writer, self)?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn tree_seed(seed: u64, tree: usize) -> u64 {
    seed.wrapping_add((tree as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

struct TreeBuilder<'a> {
    entries: &'a [IndexEntry],
    leaf_size: usize,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    fn push(&mut self, node: Node) -> u32 {
        self.nodes.push(node);
        (self.nodes.len() - 1) as u32
    }

    fn build_node(&mut self, mut items: Vec<u32>, depth: usize, rng: &mut StdRng) -> u32 {
        if items.len() <= self.leaf_size || depth >= MAX_DEPTH {
            return self.push(Node::Leaf { items });
        }

        let (left_ref, right_ref) = self.pick_pivots(&items, rng);

        let mut left_items = Vec::with_capacity(items.len() / 2 + 1);
        let mut right_items = Vec::with_capacity(items.len() / 2 + 1);
        for &i in &items {
            let x = &self.entries[i as usize].descriptor;
            let (dl, dr) = (hamming(x, &left_ref), hamming(x, &right_ref));
            let go_left = match dl.cmp(&dr) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => rng.random(),
            };
            if go_left {
                left_items.push(i);
            } else {
                right_items.push(i);
            }
        }

        // 参考点无法区分这些描述符时（例如全部相同），随机对半切分
        if left_items.is_empty() || right_items.is_empty() {
            items.shuffle(rng);
            right_items = items.split_off(items.len() / 2);
            left_items = items;
        }

        // 先占位，子节点编号确定后再回填
        let id = self.push(Node::Leaf { items: vec![] });
        let left = self.build_node(left_items, depth + 1, rng);
        let right = self.build_node(right_items, depth + 1, rng);
        self.nodes[id as usize] = Node::Split { left_ref, right_ref, left, right };
        id
    }

    fn pick_pivots(&self, items: &[u32], rng: &mut StdRng) -> (Descriptor, Descriptor) {
        let first = self.entries[*items.choose(rng).unwrap_or(&items[0]) as usize].descriptor;
        let mut second = first;
        for _ in 0..MAX_PIVOT_TRIES {
            second = self.entries[*items.choose(rng).unwrap_or(&items[0]) as usize].descriptor;
            if second != first {
                break;
            }
        }
        (first, second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_entries(n: usize, images: u64, seed: u64) -> Vec<IndexEntry> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let mut descriptor = [0u8; 32];
                rng.fill_bytes(&mut descriptor);
                IndexEntry { descriptor, owner: ImageId(i as u64 % images) }
            })
            .collect()
    }

    #[test]
    fn test_build_rejects_empty() {
        assert!(matches!(ApproximateIndex::build(vec![], 10), Err(Error::Build(_))));
    }

    #[test]
    fn test_build_rejects_zero_trees() {
        let entries = random_entries(10, 2, 1);
        assert!(matches!(ApproximateIndex::build(entries, 0), Err(Error::Build(_))));
    }

    #[test]
    fn test_query_len_bounded_by_k() {
        let index = ApproximateIndex::build(random_entries(300, 5, 2), 4).unwrap();
        let q = index.entries()[0].descriptor;
        assert!(index.query(&q, 7).len() <= 7);
        assert!(index.query(&q, 0).is_empty());

        let small = ApproximateIndex::build(random_entries(3, 1, 3), 2).unwrap();
        assert_eq!(small.query(&q, 10).len(), 3);
    }

    #[test]
    fn test_results_sorted_by_distance() {
        let index = ApproximateIndex::build(random_entries(500, 5, 4), 5).unwrap();
        let q = [0x5au8; 32];
        let r = index.query(&q, 20);
        assert!(r.windows(2).all(|w| w[0].distance <= w[1].distance));
        for n in &r {
            assert_eq!(n.distance, hamming(&q, &n.entry.descriptor));
        }
    }

    #[test]
    fn test_self_recall() {
        let params = ForestParams { tree_count: 10, leaf_size: 16, seed: 7 };
        let index = ApproximateIndex::build_with(random_entries(500, 10, 5), &params).unwrap();
        let found = index
            .entries()
            .iter()
            .filter(|e| index.query(&e.descriptor, 1).first().map(|n| n.distance) == Some(0))
            .count();
        assert!(found >= 490, "self recall too low: {found}/500");
    }

    #[test]
    fn test_deterministic_given_seed() {
        let params = ForestParams { tree_count: 6, leaf_size: 8, seed: 99 };
        let a = ApproximateIndex::build_with(random_entries(400, 4, 6), &params).unwrap();
        let b = ApproximateIndex::build_with(random_entries(400, 4, 6), &params).unwrap();
        for q in random_entries(20, 1, 7) {
            let ra = a.query(&q.descriptor, 5);
            let rb = b.query(&q.descriptor, 5);
            assert_eq!(ra, rb);
        }
    }

    #[test]
    fn test_identical_descriptors() {
        let entries = (0..200).map(|i| IndexEntry { descriptor: [1u8; 32], owner: ImageId(i) }).collect();
        let params = ForestParams { tree_count: 2, leaf_size: 4, seed: 1 };
        let index = ApproximateIndex::build_with(entries, &params).unwrap();
        let r = index.query(&[1u8; 32], 10);
        assert_eq!(r.len(), 10);
        assert!(r.iter().all(|n| n.distance == 0));
    }

    #[test]
    fn test_save_open() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("index.bin");
        let index = ApproximateIndex::build(random_entries(100, 3, 8), 3).unwrap();
        index.save(&path).unwrap();
        let loaded = ApproximateIndex::open(&path).unwrap();
        assert_eq!(loaded.len(), 100);
        assert_eq!(loaded.tree_count(), 3);
        let q = index.entries()[10].descriptor;
        assert_eq!(index.query(&q, 5), loaded.query(&q, 5));
    }
}
