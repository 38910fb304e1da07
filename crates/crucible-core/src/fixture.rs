//! # fixture 模块说明
//!
//! ## 角色定位（Why）
//! - 并行测试可能共享按键、按类、按进程三种作用域的夹具实例，本模块提供
//!   键控、引用计数的实例缓存：懒创建、并发去重、最后一个使用者离开时
//!   恰好一次拆卸；
//! - 计数转换（含归零判定）全部在分片锁内完成，工厂与拆卸等耗时操作
//!   一律在锁外执行，符合“锁只护计数、不跨钩子体”的并发纪律。
//!
//! ## 行为契约（What）
//! - [`FixtureStore::get_or_create`]：并发调用收敛为恰好一次工厂执行，
//!   工厂失败不缓存，下一位调用者可重试；
//! - [`FixtureStore::acquire`] / [`FixtureStore::release`]：使用计数严格
//!   配对；只有把计数原子地降到 0 的那次释放会移除条目并取回实例交由
//!   调用方拆卸，并发释放不会双重拆卸；
//! - 归零后键位保持可用：下一次 `get_or_create` 会重新懒创建实例。
//!
//! ## 风险提示（Trade-offs）
//! - 使用计数应在 `get_or_create` 之前（测试实例登记时）完成递增；
//!   若在计数为 0 时发起创建，归零释放可能与在途工厂竞争，产生无人
//!   拆卸的孤儿实例，该时序属于驱动方缺陷。

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::BoxFuture;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::error::CrucibleError;
use crate::owner::OwnerId;

/// 共享夹具的键：显式字符串键、按拥有者类型、或进程级全局。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FixtureKey {
    /// 显式字符串键。
    Key(Arc<str>),
    /// 按拥有者类型共享（同一测试类的所有实例共享一份）。
    OwnerType(OwnerId),
    /// 进程级全局共享。
    Global,
}

impl FixtureKey {
    /// 以显式字符串构造键。
    pub fn key(name: impl Into<Arc<str>>) -> Self {
        FixtureKey::Key(name.into())
    }

    /// 以拥有者类型构造键。
    pub fn owner_type(owner: OwnerId) -> Self {
        FixtureKey::OwnerType(owner)
    }
}

impl fmt::Display for FixtureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixtureKey::Key(name) => write!(f, "fixture:key:{name}"),
            FixtureKey::OwnerType(owner) => write!(f, "fixture:{owner}"),
            FixtureKey::Global => write!(f, "fixture:global"),
        }
    }
}

/// 共享夹具实例的统一能力面。
///
/// # 教案式注释
/// - **意图 (Why)**：存储层不关心夹具的具体类型，只需要“可拆卸”这一项
///   能力；消费方通过向下转型取回具体类型；
/// - **契约 (What)**：
///   - [`teardown`](Self::teardown) 默认无操作；带外部资源的夹具应覆写，
///     在最后一个使用者释放后被调用恰好一次；
///   - 实现必须 `Send + Sync + 'static`，实例会跨任务共享。
pub trait SharedFixture: Any + Send + Sync {
    /// 最后一个使用者释放后执行的拆卸动作。
    fn teardown(&self) -> BoxFuture<'static, Result<(), CrucibleError>> {
        Box::pin(async { Ok(()) })
    }
}

impl dyn SharedFixture {
    /// 将夹具实例向下转型为具体类型。
    pub fn downcast_ref<T: SharedFixture>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }
}

impl fmt::Debug for dyn SharedFixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedFixture")
    }
}

#[derive(Default)]
struct FixtureEntry {
    usage: AtomicUsize,
    slot: OnceCell<Arc<dyn SharedFixture>>,
}

impl FixtureEntry {
    fn with_usage(initial: usize) -> Self {
        Self {
            usage: AtomicUsize::new(initial),
            slot: OnceCell::new(),
        }
    }
}

/// 键控、引用计数的共享夹具存储。
///
/// # 教案式注释
/// - **意图 (Why)**：集中裁决“谁来执行工厂”“谁来触发拆卸”这两个并发
///   竞态，调用方无需自行协调；
/// - **逻辑 (How)**：
///   - `DashMap` 条目持有每键的使用计数与一个异步 `OnceCell` 实例槽；
///   - 计数读写仅在条目（分片）锁内进行，保证每键串行化；
///   - 工厂通过 `OnceCell::get_or_try_init` 在锁外收敛为单次执行；
/// - **契约 (What)**：见模块级文档；
/// - **风险 (Trade-offs)**：`DashMap` 分片锁在持有期间阻塞同分片操作，
///   所有临界区都只做常数工作。
#[derive(Default)]
pub struct FixtureStore {
    entries: DashMap<FixtureKey, Arc<FixtureEntry>>,
}

impl FixtureStore {
    /// 创建空存储。
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回键位现存条目，没有则创建计数为 0 的空条目。
    fn entry_handle(&self, key: &FixtureKey) -> Arc<FixtureEntry> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            Entry::Vacant(vacant) => {
                let entry = Arc::new(FixtureEntry::default());
                vacant.insert(Arc::clone(&entry));
                entry
            }
        }
    }

    /// 获取或懒创建键位实例；并发调用收敛为恰好一次工厂执行。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - **前置条件**：调用方（编排器实例登记路径）已通过
    ///     [`acquire`](Self::acquire) 为本实例递增使用计数；
    ///   - **后置条件**：成功时所有并发调用者得到同一个 `Arc` 实例；
    ///   - **错误语义**：工厂失败映射为 `fixture.factory_failed`，不缓存，
    ///     键位保持可重建。
    /// - **逻辑 (How)**：条目句柄在分片锁内取出后立即释放锁，工厂在
    ///   `OnceCell` 的单飞临界区内执行，不持有任何 Map 锁。
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &FixtureKey,
        factory: F,
    ) -> Result<Arc<dyn SharedFixture>, CrucibleError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn SharedFixture>, CrucibleError>>,
    {
        let entry = self.entry_handle(key);
        let instance = entry
            .slot
            .get_or_try_init(|| async {
                trace!(key = %key, "invoking shared fixture factory");
                factory()
                    .await
                    .map_err(|err| CrucibleError::FixtureFactoryFailed {
                        key: key.clone(),
                        detail: err.to_string(),
                    })
            })
            .await?;
        Ok(Arc::clone(instance))
    }

    /// 为键位递增使用计数，返回新计数。
    ///
    /// 签入路径对实例消费的每个键调用一次；键位不存在时创建空条目。
    pub fn acquire(&self, key: &FixtureKey) -> usize {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                // 条目锁内的读改写：每键串行，无需比较交换循环。
                let next = occupied.get().usage.load(Ordering::Acquire) + 1;
                occupied.get().usage.store(next, Ordering::Release);
                next
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(FixtureEntry::with_usage(1)));
                1
            }
        }
    }

    /// 递减使用计数；恰好把计数降到 0 的那次调用取回实例交由调用方拆卸。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 返回 `Ok(Some(instance))` 当且仅当本次释放完成了到 0 的原子
    ///     转换；条目同时从存储中移除，后续 `get_or_create` 将重新创建；
    ///   - 返回 `Ok(None)` 表示仍有其他使用者；
    ///   - 无配对释放返回 `fixture.underflow`，属驱动方缺陷；
    /// - **逻辑 (How)**：判定与移除同在条目锁内完成，并发释放中只有一个
    ///   调用者能观察到归零，天然杜绝双重拆卸；
    /// - **风险 (Trade-offs)**：拆卸本身交由调用方在锁外 `await`，存储
    ///   不会在临界区内执行任何夹具代码。
    pub fn release(
        &self,
        key: &FixtureKey,
    ) -> Result<Option<Arc<dyn SharedFixture>>, CrucibleError> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let current = occupied.get().usage.load(Ordering::Acquire);
                if current == 0 {
                    return Err(CrucibleError::FixtureUnderflow { key: key.clone() });
                }
                occupied.get().usage.store(current - 1, Ordering::Release);
                if current == 1 {
                    let entry = occupied.remove();
                    debug!(key = %key, "fixture usage reached zero, entry removed");
                    return Ok(entry.slot.get().cloned());
                }
                Ok(None)
            }
            Entry::Vacant(_) => Err(CrucibleError::FixtureUnderflow { key: key.clone() }),
        }
    }

    /// 查询键位当前使用计数（仅供诊断与测试）。
    pub fn usage(&self, key: &FixtureKey) -> usize {
        self.entries
            .get(key)
            .map(|entry| entry.usage.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// 当前存活的键位数量。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 存储是否为空。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for FixtureStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}
