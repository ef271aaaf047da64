//! 选择算法：按注册顺序轮询。
//!
//! 从上次选中位置的下一个开始扫描一圈，取第一个 active 且余量足够的 key；
//! 余量不足的 key 只是被跳过，不会移出轮询（重置后恢复可选）。

use crate::key_pool::types::CredentialKey;
use std::collections::HashSet;

/// 返回被选中的下标；`cursor` 是下一轮扫描的起点。
pub fn select_round_robin(
    keys: &[CredentialKey],
    cursor: usize,
    cost: u32,
    exclude: &HashSet<String>,
) -> Option<usize> {
    let len = keys.len();
    if len == 0 {
        return None;
    }
    let start = cursor % len;
    (0..len)
        .map(|offset| (start + offset) % len)
        .find(|&idx| {
            let k = &keys[idx];
            k.can_serve(cost) && !exclude.contains(&k.secret)
        })
}
