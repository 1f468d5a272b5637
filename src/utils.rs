use std::path::Path;

use indicatif::ProgressStyle;
use ndarray::Array2;
use ndarray_npy::{ReadNpyExt, read_npy, write_npy};

use crate::error::{Error, Result};
use crate::hamming::{DESCRIPTOR_BYTES, Descriptor};
use crate::store::ImageId;

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap()
        .progress_chars("#>-")
}

/// 计算数据的哈希并转换为图片 ID
pub fn hash_bytes(data: &[u8]) -> ImageId {
    ImageId::from_hash(&blake3::hash(data))
}

/// 读取 N x 32 的 u8 矩阵作为描述符
pub fn read_descriptors(path: impl AsRef<Path>) -> Result<Vec<Descriptor>> {
    let path = path.as_ref();
    let array: Array2<u8> =
        read_npy(path).map_err(|e| Error::InvalidDescriptors(format!("{}: {e}", path.display())))?;
    descriptors_from_array(&array)
}

/// 解析内存中的 npy 数据
pub fn parse_descriptors(data: &[u8]) -> Result<Vec<Descriptor>> {
    let array = Array2::<u8>::read_npy(data).map_err(|e| Error::InvalidDescriptors(e.to_string()))?;
    descriptors_from_array(&array)
}

pub fn descriptors_from_array(array: &Array2<u8>) -> Result<Vec<Descriptor>> {
    if array.ncols() != DESCRIPTOR_BYTES {
        return Err(Error::InvalidDescriptors(format!(
            "expected {DESCRIPTOR_BYTES} columns, got {}",
            array.ncols()
        )));
    }
    Ok(array
        .rows()
        .into_iter()
        .map(|row| {
            let mut d = [0u8; DESCRIPTOR_BYTES];
            d.iter_mut().zip(row.iter()).for_each(|(a, b)| *a = *b);
            d
        })
        .collect())
}

/// 将描述符写入 npy 文件
pub fn write_descriptors(path: impl AsRef<Path>, descriptors: &[Descriptor]) -> Result<()> {
    let flat = descriptors.iter().flatten().copied().collect::<Vec<_>>();
    let array = Array2::from_shape_vec((descriptors.len(), DESCRIPTOR_BYTES), flat)
        .map_err(|e| Error::InvalidDescriptors(e.to_string()))?;
    write_npy(path, &array).map_err(|e| Error::InvalidDescriptors(e.to_string()))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_npy_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.npy");
        let des = vec![[1u8; 32], [2u8; 32], [255u8; 32]];
        write_descriptors(&path, &des).unwrap();
        assert_eq!(read_descriptors(&path).unwrap(), des);
    }

    #[test]
    fn test_parse_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.npy");
        write_descriptors(&path, &[[7u8; 32]]).unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(parse_descriptors(&data).unwrap(), vec![[7u8; 32]]);
        assert!(parse_descriptors(b"not a npy file").is_err());
    }

    #[test]
    fn test_wrong_shape() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.npy");
        write_npy(&path, &Array2::<u8>::zeros((3, 16))).unwrap();
        assert!(matches!(read_descriptors(&path), Err(Error::InvalidDescriptors(_))));
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_bytes(b"hello"), hash_bytes(b"hello"));
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"world"));
    }
}
