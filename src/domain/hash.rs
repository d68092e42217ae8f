// ==========================================
// 配送路线引擎 - 稳定哈希
// ==========================================
// 职责: 显式种子的非加密字符串哈希 (FNV-1a 32 位)
// 红线: 相同输入必须永远得到相同输出，禁止替换为随机数
// ==========================================

/// FNV-1a 32 位偏移基
pub const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a 32 位质数
pub const FNV_PRIME: u32 = 0x0100_0193;

/// 以指定种子计算字符串的 FNV-1a 哈希
pub fn stable_hash_seeded(input: &str, seed: u32) -> u32 {
    input.bytes().fold(seed, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// 以默认偏移基计算哈希
pub fn stable_hash(input: &str) -> u32 {
    stable_hash_seeded(input, FNV_OFFSET_BASIS)
}

/// 64 位版本（用于站点标识，降低碰撞概率）
pub fn stable_hash64(input: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    input
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}
