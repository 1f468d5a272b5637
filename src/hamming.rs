use bytemuck::pod_read_unaligned;

/// 描述符的字节长度（256 位）
pub const DESCRIPTOR_BYTES: usize = 32;

/// 二进制局部特征描述符，例如 ORB
pub type Descriptor = [u8; DESCRIPTOR_BYTES];

/// 两个描述符之间可能出现的最大汉明距离
pub const MAX_DISTANCE: u32 = (DESCRIPTOR_BYTES * 8) as u32;

#[inline(always)]
pub fn hamming(va: &Descriptor, vb: &Descriptor) -> u32 {
    // 这里的数组按字节对齐，不能直接 cast_slice 成 u64
    let va: [u64; 4] = pod_read_unaligned(va);
    let vb: [u64; 4] = pod_read_unaligned(vb);
    (va[0] ^ vb[0]).count_ones()
        + (va[1] ^ vb[1]).count_ones()
        + (va[2] ^ vb[2]).count_ones()
        + (va[3] ^ vb[3]).count_ones()
}

#[inline(always)]
pub fn hamming_naive(va: &[u8], vb: &[u8]) -> u32 {
    va.iter().zip(vb).map(|(a, b)| (a ^ b).count_ones()).sum()
}

/// 在 vb 中寻找与 va 距离最近的描述符，返回 (索引, 距离)
///
/// vb 为空时返回 None
pub fn min_hamming(va: &Descriptor, vb: &[Descriptor]) -> Option<(usize, u32)> {
    let mut best: Option<(usize, u32)> = None;
    for (i, code) in vb.iter().enumerate() {
        let d = hamming(va, code);
        match best {
            Some((_, bd)) if bd <= d => {}
            _ => best = Some((i, d)),
        }
        if d == 0 {
            break;
        }
    }
    best
}

/// 计算向量 va 和 vb 的汉明距离，并返回距离最小的 k 个索引和距离，按距离升序排列
///
/// 距离相同时，索引较小的在前
pub fn knn_hamming(va: &Descriptor, vb: &[Descriptor], k: usize) -> Vec<(usize, u32)> {
    let mut all = vb.iter().enumerate().map(|(i, code)| (i, hamming(va, code))).collect::<Vec<_>>();
    if k < all.len() {
        all.select_nth_unstable_by_key(k, |&(i, d)| (d, i));
        all.truncate(k);
    }
    all.sort_unstable_by_key(|&(i, d)| (d, i));
    all
}
