//! # orchestrator 模块说明
//!
//! ## 角色定位（Why）
//! - 编排器是驱动方唯一需要面对的门面：注册钩子、签入/签出测试实例、
//!   获取共享夹具、读取作用域快照；取消根、夹具存储、钩子注册表与
//!   实例计数器由它统一持有并协同；
//! - 每个测试实例沿状态机 `Registered → SettingUp → Running →
//!   TearingDown → Done` 演进，任何越序操作都是结构化错误。
//!
//! ## 生命周期数据流（How）
//! - **实例登记**（注册阶段，先于任何执行）：整个执行波次的实例在此
//!   一次性登记——沿作用域链递增计数、递增夹具使用计数、挂存活记录；
//!   全部登记完毕后每个作用域的计数在波次内只经历一次归零；
//! - **签入**：运行安装链（程序集 → 基类 → 派生类，单飞记忆化）；
//! - **签出**（无论测试体成败都必须调用，安装失败或被跳过的实例也
//!   不例外）：沿反向链递减计数，归零的作用域运行清理链（失败收集）；
//!   程序集清理之后释放夹具，使用计数归零的夹具执行拆卸，拆卸失败
//!   并入同一份报告。
//!
//! ## 失败语义（What）
//! - 安装失败被缓存重放：依赖该作用域的所有测试（含未开始的）快速
//!   失败于同一份错误；实例保持签入状态，驱动方仍须签出以配平计数；
//! - 清理失败从不让触发归零的测试失败，统一以 [`CleanupReport`]
//!   交给运行报告层。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::contract::{CancelWatcher, Cancellation};
use crate::error::{CleanupFailure, CleanupReport, CleanupSite, CrucibleError};
use crate::fixture::{FixtureKey, FixtureStore, SharedFixture};
use crate::hook::{HookAction, HookKind, HookRegistry, OwnerContextSnapshot};
use crate::owner::{OwnerId, TestInstance};
use crate::tracker::InstanceTracker;

/// 测试实例的生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    /// 已登记，安装链尚未开始。
    Registered,
    /// 安装链执行中；安装失败的实例停留在此状态直至签出。
    SettingUp,
    /// 安装链成功，测试体可以执行。
    Running,
    /// 签出流程执行中。
    TearingDown,
    /// 签出完成，计数与夹具均已配平。
    Done,
}

/// 夹具生命周期与钩子编排引擎的门面。
///
/// # 教案式注释
/// - **意图 (Why)**：把四个内部组件（取消根、夹具存储、钩子注册表、
///   实例计数器）的协作协议封装在两个生命周期入口之后，驱动方无法
///   绕过计数纪律直接触发清理；
/// - **契约 (What)**：
///   - 注册 API 在进程初始化阶段调用；某作用域首次执行后其注册窗口
///     关闭；
///   - [`check_in`](Self::check_in) 与 [`check_out`](Self::check_out)
///     必须严格配对，签出在测试体成功与失败两种路径下都要调用；
///   - 不相关作用域之间不存在全局锁，并发控制均按作用域键与夹具键
///     分片；
/// - **风险 (Trade-offs)**：编排器按运行（run）实例化，不做跨运行的
///   状态复用；取消根进程级共享是唯一刻意保留的全局信号。
#[derive(Debug, Default)]
pub struct Orchestrator {
    cancellation: Cancellation,
    registry: HookRegistry,
    fixtures: FixtureStore,
    tracker: InstanceTracker,
    instances: DashMap<Arc<str>, InstanceState>,
}

impl Orchestrator {
    /// 以全新的取消根创建编排器。
    pub fn new() -> Self {
        Self::default()
    }

    /// 以外部提供的取消根创建编排器（驱动方可把运行中止信号接入）。
    pub fn with_cancellation(cancellation: Cancellation) -> Self {
        Self {
            cancellation,
            ..Self::default()
        }
    }

    /// 进程级取消根；点火后传播进所有在途与未来的钩子调用。
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// 注册安装钩子。
    ///
    /// - `owner`：作用域（程序集或类）；
    /// - `name`：人类可读名称，用于日志与失败消息；
    /// - `timeout`：声明式超时，`None` 表示仅受父级取消约束。
    pub fn register_set_up<B, F>(
        &self,
        owner: &OwnerId,
        name: impl Into<Arc<str>>,
        timeout: Option<Duration>,
        body: B,
    ) -> Result<(), CrucibleError>
    where
        B: Fn(CancelWatcher) -> F + Send + Sync + 'static,
        F: Future<Output = Result<(), CrucibleError>> + Send + 'static,
    {
        self.registry
            .register(owner, HookAction::new(HookKind::SetUp, name, timeout, body))
    }

    /// 注册清理钩子。参数语义同 [`register_set_up`](Self::register_set_up)。
    pub fn register_clean_up<B, F>(
        &self,
        owner: &OwnerId,
        name: impl Into<Arc<str>>,
        timeout: Option<Duration>,
        body: B,
    ) -> Result<(), CrucibleError>
    where
        B: Fn(CancelWatcher) -> F + Send + Sync + 'static,
        F: Future<Output = Result<(), CrucibleError>> + Send + 'static,
    {
        self.registry.register(
            owner,
            HookAction::new(HookKind::CleanUp, name, timeout, body),
        )
    }

    /// 获取或懒创建共享夹具实例；并发调用收敛为一次工厂执行。
    pub async fn get_or_create_shared<F, Fut>(
        &self,
        key: &FixtureKey,
        factory: F,
    ) -> Result<Arc<dyn SharedFixture>, CrucibleError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn SharedFixture>, CrucibleError>>,
    {
        self.fixtures.get_or_create(key, factory).await
    }

    /// 登记测试实例：沿作用域链递增计数、递增夹具使用计数、挂存活记录。
    ///
    /// # 教案式注释
    /// - **意图 (Why)**：计数递增与安装执行分属两个阶段——整个执行波次
    ///   的实例应在任何 [`check_in`](Self::check_in) 之前全部登记完毕，
    ///   这样每个作用域的计数在波次内只经历一次归零，清理链与夹具拆卸
    ///   不会因实例恰好不重叠而重复触发；
    /// - **契约 (What)**：
    ///   - 每个实例登记恰好一次，重复标识返回
    ///     `orchestrator.duplicate_check_in`；
    ///   - 已登记的实例无论是否执行过签入，最终都必须签出以配平计数。
    pub fn register_instance(&self, instance: &TestInstance) -> Result<(), CrucibleError> {
        match self.instances.entry(Arc::clone(instance.id())) {
            Entry::Occupied(_) => {
                return Err(CrucibleError::DuplicateCheckIn {
                    instance: Arc::clone(instance.id()),
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(InstanceState::Registered);
            }
        }

        self.tracker.check_in_chain(instance.chain());
        for key in instance.fixtures() {
            self.fixtures.acquire(key);
        }
        for owner in instance.chain().setup_order() {
            self.registry.record_instance(owner, instance.id());
        }
        debug!(instance = %instance.id(), "test instance registered");
        Ok(())
    }

    /// 签入测试实例并运行其安装链。
    ///
    /// # 教案式注释
    /// - **前置条件**：实例已经
    ///   [`register_instance`](Self::register_instance) 登记且尚未签入；
    /// - **执行顺序 (How)**：安装链按 程序集 → 基类 → 派生类 运行，
    ///   同类并发实例经记忆化收敛为单次物理执行；
    /// - **后置条件 (What)**：
    ///   - 成功：实例进入 [`InstanceState::Running`]，测试体可以开始；
    ///   - 安装失败：返回缓存重放的错误，实例停留在
    ///     [`InstanceState::SettingUp`]，驱动方仍须调用
    ///     [`check_out`](Self::check_out)；
    /// - **错误语义**：未登记的实例返回 `orchestrator.unknown_instance`，
    ///   重复签入返回 `orchestrator.duplicate_check_in`。
    pub async fn check_in(&self, instance: &TestInstance) -> Result<(), CrucibleError> {
        {
            // 状态校验与迁移在同一分片锁内完成，并发重复签入无竞态窗口。
            let mut state = self.instances.get_mut(instance.id()).ok_or_else(|| {
                CrucibleError::UnknownInstance {
                    instance: Arc::clone(instance.id()),
                }
            })?;
            match *state {
                InstanceState::Registered => *state = InstanceState::SettingUp,
                _ => {
                    return Err(CrucibleError::DuplicateCheckIn {
                        instance: Arc::clone(instance.id()),
                    });
                }
            }
        }
        debug!(instance = %instance.id(), state = ?InstanceState::SettingUp, "instance state transition");

        for owner in instance.chain().setup_order() {
            if let Err(err) = self.registry.execute_set_ups(owner, &self.cancellation).await {
                warn!(
                    instance = %instance.id(),
                    owner = %owner,
                    code = err.code(),
                    "set-up chain failed, dependents will fail fast"
                );
                return Err((*err).clone());
            }
        }

        self.transition(instance.id(), InstanceState::Running);
        Ok(())
    }

    /// 签出测试实例：反向递减计数、运行归零作用域的清理链并释放夹具。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 每个已登记实例必须调用本方法恰好一次：测试体成功、失败、
    ///     安装失败乃至从未签入（快速失败被跳过）的实例都不例外；
    ///   - 返回的 [`CleanupReport`] 面向运行报告层，清理失败从不作为
    ///     `Err` 上浮；
    ///   - `Err` 仅出现在计数不变量被破坏时（驱动方缺陷），此时应终止
    ///     整个运行；
    /// - **顺序 (How)**：派生类 → 基类 → 程序集 逐一签出，归零者立即
    ///   运行其清理链；程序集处理完毕后按登记顺序释放夹具，归零的
    ///   夹具在锁外执行拆卸。
    pub async fn check_out(&self, instance: &TestInstance) -> Result<CleanupReport, CrucibleError> {
        {
            // 状态校验与迁移在同一分片锁内完成：并发的重复签出恰有一个
            // 赢得迁移，其余在递减任何计数之前就被拒绝。
            let mut state = self.instances.get_mut(instance.id()).ok_or_else(|| {
                CrucibleError::UnknownInstance {
                    instance: Arc::clone(instance.id()),
                }
            })?;
            match *state {
                InstanceState::TearingDown | InstanceState::Done => {
                    return Err(CrucibleError::UnknownInstance {
                        instance: Arc::clone(instance.id()),
                    });
                }
                _ => *state = InstanceState::TearingDown,
            }
        }
        debug!(instance = %instance.id(), state = ?InstanceState::TearingDown, "instance state transition");

        let mut report = CleanupReport::default();
        for owner in instance.chain().teardown_order() {
            self.registry.remove_instance(owner, instance.id());
            let remaining = self.tracker.check_out(owner)?;
            if remaining == 0 {
                debug!(owner = %owner, "last instance checked out, running clean-up chain");
                report.extend(
                    self.registry
                        .execute_clean_ups(owner, &self.cancellation)
                        .await,
                );
            }
        }

        for key in instance.fixtures() {
            if let Some(fixture) = self.fixtures.release(key)? {
                debug!(key = %key, "releasing shared fixture");
                if let Err(err) = fixture.teardown().await {
                    warn!(key = %key, code = err.code(), "fixture teardown failed, collected");
                    report.push(CleanupFailure::new(
                        CleanupSite::Fixture { key: key.clone() },
                        CrucibleError::FixtureTeardownFailed {
                            key: key.clone(),
                            detail: err.to_string(),
                        },
                    ));
                }
            }
        }

        self.transition(instance.id(), InstanceState::Done);
        Ok(report)
    }

    /// 查询实例当前生命周期状态。
    pub fn instance_state(&self, instance: &str) -> Option<InstanceState> {
        self.instances.get(instance).map(|state| *state)
    }

    /// 查询作用域上下文快照（注册钩子与存活实例），供运行报告使用。
    pub fn owner_context(&self, owner: &OwnerId) -> Option<OwnerContextSnapshot> {
        self.registry.snapshot(owner)
    }

    /// 查询作用域当前的存活实例计数（诊断用）。
    pub fn live_count(&self, owner: &OwnerId) -> usize {
        self.tracker.count(owner)
    }

    /// 查询夹具键当前使用计数（诊断用）。
    pub fn fixture_usage(&self, key: &FixtureKey) -> usize {
        self.fixtures.usage(key)
    }

    fn transition(&self, instance: &Arc<str>, next: InstanceState) {
        self.instances.insert(Arc::clone(instance), next);
        debug!(instance = %instance, state = ?next, "instance state transition");
    }
}
