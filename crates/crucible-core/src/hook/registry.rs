//! # registry 子模块说明
//!
//! ## 角色定位（Why）
//! - 以拥有者（程序集或类）为键组织有序的安装/清理钩子列表，并保存当前
//!   挂在该作用域下的存活实例记录，供执行与运行报告两侧共同使用；
//! - 执行采用“封闭注册”纪律：首次针对某拥有者的执行会封印其钩子列表，
//!   此后注册返回结构化错误而非与执行竞态。
//!
//! ## 行为契约（What）
//! - [`HookRegistry::execute_set_ups`]：按注册顺序运行安装钩子，每个钩子
//!   经单飞记忆化，失败立即停止后续钩子并把同一错误重放给所有调用者；
//! - [`HookRegistry::execute_clean_ups`]：按注册顺序运行清理钩子，失败
//!   收集进列表、从不短路，无钩子的拥有者得到空列表；
//! - 注册与执行的并发安全由条目内的短临界区保证，任何锁都不会跨
//!   钩子体持有。

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::contract::Cancellation;
use crate::error::{CleanupFailure, CleanupSite, CrucibleError};
use crate::hook::{HookAction, HookKind, MemoizedHook, run_hook};
use crate::owner::OwnerId;

#[derive(Default)]
struct PendingHooks {
    set_ups: Vec<HookAction>,
    clean_ups: Vec<HookAction>,
}

struct SealedHooks {
    set_ups: Vec<MemoizedHook>,
    clean_ups: Vec<HookAction>,
}

#[derive(Default)]
struct OwnerEntry {
    /// 注册窗口；封印时被取走（置 `None`），此后注册被拒绝。
    pending: Mutex<Option<PendingHooks>>,
    /// 封印后的钩子列表，整个运行期共享。
    sealed: OnceLock<Arc<SealedHooks>>,
    /// 当前签入本作用域的实例记录（按标识排序，快照确定性输出）。
    live: Mutex<BTreeSet<Arc<str>>>,
}

impl OwnerEntry {
    fn new() -> Self {
        Self {
            pending: Mutex::new(Some(PendingHooks::default())),
            sealed: OnceLock::new(),
            live: Mutex::new(BTreeSet::new()),
        }
    }

    fn seal(&self) -> Arc<SealedHooks> {
        Arc::clone(self.sealed.get_or_init(|| {
            let taken = self.pending.lock().take().unwrap_or_default();
            Arc::new(SealedHooks {
                set_ups: taken.set_ups.into_iter().map(MemoizedHook::new).collect(),
                clean_ups: taken.clean_ups,
            })
        }))
    }
}

/// 拥有者上下文快照，供运行报告与诊断读取。
#[derive(Clone, Debug)]
pub struct OwnerContextSnapshot {
    owner: OwnerId,
    set_up_hooks: Vec<Arc<str>>,
    clean_up_hooks: Vec<Arc<str>>,
    live_instances: Vec<Arc<str>>,
    sealed: bool,
}

impl OwnerContextSnapshot {
    /// 作用域标识。
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// 已注册的安装钩子名称（注册顺序）。
    pub fn set_up_hooks(&self) -> &[Arc<str>] {
        &self.set_up_hooks
    }

    /// 已注册的清理钩子名称（注册顺序）。
    pub fn clean_up_hooks(&self) -> &[Arc<str>] {
        &self.clean_up_hooks
    }

    /// 当前签入该作用域的实例标识。
    pub fn live_instances(&self) -> &[Arc<str>] {
        &self.live_instances
    }

    /// 注册窗口是否已关闭。
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }
}

/// 按拥有者组织的钩子注册表。
///
/// # 教案式注释
/// - **意图 (Why)**：安装链与清理链在进程初始化阶段构建、运行期只读，
///   注册表据此把“列表构建”与“列表执行”切成两个互不竞态的阶段；
/// - **逻辑 (How)**：`DashMap` 每拥有者一个条目；注册走 `pending` 短锁，
///   首次执行经 `OnceLock` 一次性封印成共享的不可变列表；
/// - **风险 (Trade-offs)**：封印后注册失败是刻意为之——允许晚注册就要
///   在执行路径上加锁，违背“锁不跨钩子体”的纪律。
#[derive(Default)]
pub struct HookRegistry {
    owners: DashMap<OwnerId, Arc<OwnerEntry>>,
}

impl HookRegistry {
    /// 创建空注册表。
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, owner: &OwnerId) -> Arc<OwnerEntry> {
        Arc::clone(
            self.owners
                .entry(owner.clone())
                .or_insert_with(|| Arc::new(OwnerEntry::new()))
                .value(),
        )
    }

    /// 为拥有者追加一个钩子。
    ///
    /// - **前置条件**：该拥有者尚未进入执行阶段；
    /// - **错误语义**：注册窗口已关闭时返回 `registry.sealed`。
    pub fn register(&self, owner: &OwnerId, action: HookAction) -> Result<(), CrucibleError> {
        let entry = self.entry(owner);
        let mut pending = entry.pending.lock();
        match pending.as_mut() {
            Some(hooks) => {
                debug!(owner = %owner, hook = %action.name(), kind = ?action.kind(), "hook registered");
                match action.kind() {
                    HookKind::SetUp => hooks.set_ups.push(action),
                    HookKind::CleanUp => hooks.clean_ups.push(action),
                }
                Ok(())
            }
            None => Err(CrucibleError::RegistrationClosed {
                owner: owner.clone(),
            }),
        }
    }

    /// 按注册顺序执行拥有者的安装钩子（单飞记忆化，失败快速停止）。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 并发调用者对每个钩子观察到至多一次执行与一致结局；
    ///   - 第 N 个钩子失败时，1..N 已各执行至多一次，失败错误被缓存并
    ///     重放给所有（含未来的）调用者，后续钩子不再启动；
    /// - **后置条件**：首次调用会关闭该拥有者的注册窗口。
    pub async fn execute_set_ups(
        &self,
        owner: &OwnerId,
        cancel: &Cancellation,
    ) -> Result<(), Arc<CrucibleError>> {
        let hooks = self.entry(owner).seal();
        for hook in &hooks.set_ups {
            hook.run(owner, cancel).await?;
        }
        Ok(())
    }

    /// 按注册顺序执行拥有者的清理钩子，收集全部失败。
    ///
    /// - **契约 (What)**：链上每个清理钩子无论先前是否失败都会尝试执行；
    ///   返回列表的顺序与执行顺序一致；无钩子时返回空列表；
    /// - **取消语义**：取消源已点火时每个钩子得到取消类结局并被收集，
    ///   不会静默跳过。
    pub async fn execute_clean_ups(
        &self,
        owner: &OwnerId,
        cancel: &Cancellation,
    ) -> Vec<CleanupFailure> {
        let hooks = self.entry(owner).seal();
        let mut failures = Vec::new();
        for action in &hooks.clean_ups {
            match run_hook(action, cancel).await {
                Ok(()) => {
                    debug!(owner = %owner, hook = %action.name(), "clean-up hook completed");
                }
                Err(err) => {
                    let published = if err.is_cancellation() {
                        err
                    } else {
                        CrucibleError::CleanupFailed {
                            owner: owner.clone(),
                            hook: Arc::clone(action.name()),
                            detail: err.to_string(),
                        }
                    };
                    warn!(
                        owner = %owner,
                        hook = %action.name(),
                        code = published.code(),
                        "clean-up hook failed, collected"
                    );
                    failures.push(CleanupFailure::new(
                        CleanupSite::Hook {
                            owner: owner.clone(),
                            hook: Arc::clone(action.name()),
                        },
                        published,
                    ));
                }
            }
        }
        failures
    }

    /// 登记一条存活实例记录。
    pub fn record_instance(&self, owner: &OwnerId, instance: &Arc<str>) {
        self.entry(owner).live.lock().insert(Arc::clone(instance));
    }

    /// 移除一条存活实例记录。
    pub fn remove_instance(&self, owner: &OwnerId, instance: &Arc<str>) {
        self.entry(owner).live.lock().remove(instance);
    }

    /// 生成拥有者上下文快照；拥有者从未出现过时返回 `None`。
    pub fn snapshot(&self, owner: &OwnerId) -> Option<OwnerContextSnapshot> {
        let entry = Arc::clone(self.owners.get(owner)?.value());
        let live_instances: Vec<Arc<str>> = entry.live.lock().iter().cloned().collect();

        if let Some(sealed) = entry.sealed.get() {
            return Some(OwnerContextSnapshot {
                owner: owner.clone(),
                set_up_hooks: sealed.set_ups.iter().map(|h| Arc::clone(h.name())).collect(),
                clean_up_hooks: sealed
                    .clean_ups
                    .iter()
                    .map(|a| Arc::clone(a.name()))
                    .collect(),
                live_instances,
                sealed: true,
            });
        }

        let pending = entry.pending.lock();
        let hooks = pending.as_ref();
        Some(OwnerContextSnapshot {
            owner: owner.clone(),
            set_up_hooks: hooks
                .map(|h| h.set_ups.iter().map(|a| Arc::clone(a.name())).collect())
                .unwrap_or_default(),
            clean_up_hooks: hooks
                .map(|h| h.clean_ups.iter().map(|a| Arc::clone(a.name())).collect())
                .unwrap_or_default(),
            live_instances,
            sealed: false,
        })
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("owners", &self.owners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_hook(kind: HookKind, name: &str) -> HookAction {
        HookAction::new(kind, name, None, |_watcher| async { Ok(()) })
    }

    /// 首次执行封印注册窗口，晚注册得到结构化错误。
    #[tokio::test]
    async fn late_registration_is_rejected_after_execution() {
        let registry = HookRegistry::new();
        let owner = OwnerId::class("Sealed");
        registry
            .register(&owner, noop_hook(HookKind::SetUp, "first"))
            .expect("执行前注册必须成功");

        let cancel = Cancellation::new();
        registry
            .execute_set_ups(&owner, &cancel)
            .await
            .expect("安装链必须成功");

        let err = registry
            .register(&owner, noop_hook(HookKind::SetUp, "late"))
            .expect_err("封印后的注册必须被拒绝");
        assert_eq!(err.code(), crate::error::codes::REGISTRY_SEALED);
    }

    /// 清理链中段失败不影响前后钩子执行，失败被精确收集。
    #[tokio::test]
    async fn cleanup_chain_collects_without_short_circuit() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let registry = HookRegistry::new();
        let owner = OwnerId::class("Cleanups");
        let ran = Arc::new(AtomicUsize::new(0));

        for (name, fails) in [("first", false), ("second", true), ("third", false)] {
            let ran = Arc::clone(&ran);
            registry
                .register(
                    &owner,
                    HookAction::new(HookKind::CleanUp, name, None, move |_watcher| {
                        let ran = Arc::clone(&ran);
                        async move {
                            ran.fetch_add(1, Ordering::AcqRel);
                            if fails {
                                Err(CrucibleError::CleanupFailed {
                                    owner: OwnerId::class("Cleanups"),
                                    hook: name.into(),
                                    detail: "broken".into(),
                                })
                            } else {
                                Ok(())
                            }
                        }
                    }),
                )
                .expect("注册必须成功");
        }

        let cancel = Cancellation::new();
        let failures = registry.execute_clean_ups(&owner, &cancel).await;
        assert_eq!(ran.load(Ordering::Acquire), 3, "三个清理钩子必须全部执行");
        assert_eq!(failures.len(), 1, "仅第二个钩子的失败应被收集");
        match failures[0].site() {
            CleanupSite::Hook { hook, .. } => assert_eq!(hook.as_ref(), "second"),
            other => panic!("失败位置应为清理钩子，实际为 {other:?}"),
        }
    }

    /// Debug 输出只暴露规模信息，不展开钩子体。
    #[test]
    fn debug_output_is_counts_only() {
        let registry = HookRegistry::new();
        registry
            .register(&OwnerId::class("Dbg"), noop_hook(HookKind::SetUp, "init"))
            .expect("注册必须成功");
        assert_eq!(format!("{registry:?}"), "HookRegistry { owners: 1 }");
    }

    /// 无钩子的拥有者清理返回空列表（短路不构成可观察行为）。
    #[tokio::test]
    async fn owner_without_hooks_yields_empty_failures() {
        let registry = HookRegistry::new();
        let owner = OwnerId::assembly("empty");
        let cancel = Cancellation::new();
        assert!(registry.execute_clean_ups(&owner, &cancel).await.is_empty());
    }
}
