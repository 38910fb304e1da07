//! # tracker 模块说明
//!
//! ## 角色定位（Why）
//! - 记录“有多少存活测试实例依赖作用域 X”：派生类实例签入会连带签入
//!   全部基类与程序集，确保基类清理必须等到所有派生实例离开；
//! - 签出在每作用域的串行纪律下完成计数转换，恰好一个调用者观察到
//!   归零，该调用者负责触发清理链。
//!
//! ## 不变量（What）
//! - 计数恒非负；每次签入对应恰好一次签出；
//! - 无配对的签出是驱动方缺陷，以致命的 `tracker.underflow` 上浮；
//! - 计数条目只会被驱回 0，从不删除。

use dashmap::DashMap;
use tracing::trace;

use crate::error::CrucibleError;
use crate::owner::{OwnerChain, OwnerId};

/// 每作用域的实例计数器。
#[derive(Debug, Default)]
pub struct InstanceTracker {
    counts: DashMap<OwnerId, usize>,
}

impl InstanceTracker {
    /// 创建空计数器。
    pub fn new() -> Self {
        Self::default()
    }

    /// 为单个作用域签入。
    pub fn check_in(&self, owner: &OwnerId) -> usize {
        let mut count = self.counts.entry(owner.clone()).or_insert(0);
        *count += 1;
        trace!(owner = %owner, count = *count, "instance checked in");
        *count
    }

    /// 沿作用域链签入：程序集与每个类作用域各递增一次。
    pub fn check_in_chain(&self, chain: &OwnerChain) {
        for owner in chain.setup_order() {
            self.check_in(owner);
        }
    }

    /// 为单个作用域签出，返回新计数。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 返回 `Ok(0)` 的调用者（且仅该调用者）观察到归零转换，负责
    ///     触发该作用域的清理链；
    ///   - 计数已为 0 或条目不存在时返回 `tracker.underflow`；
    /// - **逻辑 (How)**：`DashMap::get_mut` 持有分片写锁，递减与归零判定
    ///   在同一临界区内完成，临界区只做常数工作。
    pub fn check_out(&self, owner: &OwnerId) -> Result<usize, CrucibleError> {
        match self.counts.get_mut(owner) {
            Some(mut count) => {
                if *count == 0 {
                    return Err(CrucibleError::CounterUnderflow {
                        scope: owner.to_string(),
                    });
                }
                *count -= 1;
                trace!(owner = %owner, count = *count, "instance checked out");
                Ok(*count)
            }
            None => Err(CrucibleError::CounterUnderflow {
                scope: owner.to_string(),
            }),
        }
    }

    /// 查询作用域当前计数。
    pub fn count(&self, owner: &OwnerId) -> usize {
        self.counts.get(owner).map(|c| *c).unwrap_or(0)
    }
}
