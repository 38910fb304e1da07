//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 编排引擎横跨“安装失败、清理失败、取消、计数器失衡”四类语义迥异的
//!   故障，驱动方需要据此执行完全不同的处置策略（快速失败 / 聚合上报 /
//!   区别重试 / 终止运行），因此错误必须在类型层面可区分；
//! - 错误码遵循 `namespace.reason` 稳定命名，供日志、指标与告警系统做
//!   精确分类，避免解析自然语言消息。
//!
//! ## 设计要求（What）
//! - [`CrucibleError`] 实现 `thiserror::Error`，所有变体 `Send + Sync +
//!   'static`，可安全跨任务传播；
//! - 安装失败会被记忆化缓存并原样重放给所有等待者，因此错误派生 `Clone`；
//! - 清理阶段的失败从不中断链路，统一收敛进 [`CleanupReport`] 返回给
//!   运行报告层，而非抛给触发清理的那个测试。

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::fixture::FixtureKey;
use crate::owner::OwnerId;

/// 稳定错误码清单。
///
/// 命名遵循 `<领域>.<语义>`；新增码值需同步更新告警与运行报告的映射表。
pub mod codes {
    /// 安装钩子执行失败（缓存重放，依赖该作用域的测试快速失败）。
    pub const HOOK_SETUP_FAILED: &str = "hook.setup_failed";
    /// 清理钩子执行失败（聚合上报，从不中断其余清理）。
    pub const HOOK_CLEANUP_FAILED: &str = "hook.cleanup_failed";
    /// 钩子或等待者观察到取消信号。
    pub const HOOK_CANCELLED: &str = "hook.cancelled";
    /// 钩子声明的超时先于自然完成触发。
    pub const HOOK_TIMEOUT: &str = "hook.timeout";
    /// 实例计数器出现无配对的递减，属驱动方缺陷，致命。
    pub const TRACKER_UNDERFLOW: &str = "tracker.underflow";
    /// 作用域已进入执行阶段，注册窗口关闭。
    pub const REGISTRY_SEALED: &str = "registry.sealed";
    /// 共享夹具工厂构造失败（不缓存，下一位调用者可重试）。
    pub const FIXTURE_FACTORY_FAILED: &str = "fixture.factory_failed";
    /// 共享夹具拆卸失败（聚合上报）。
    pub const FIXTURE_TEARDOWN_FAILED: &str = "fixture.teardown_failed";
    /// 夹具释放次数超过使用计数。
    pub const FIXTURE_UNDERFLOW: &str = "fixture.underflow";
    /// 作用域链结构非法（程序集/类错位）。
    pub const OWNER_INVALID_CHAIN: &str = "owner.invalid_chain";
    /// 同一实例标识被重复签入。
    pub const ORCHESTRATOR_DUPLICATE_CHECK_IN: &str = "orchestrator.duplicate_check_in";
    /// 对未签入的实例执行签出。
    pub const ORCHESTRATOR_UNKNOWN_INSTANCE: &str = "orchestrator.unknown_instance";
}

/// 编排引擎错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合夹具生命周期与钩子编排关键路径的异常，按处置
///   策略拆分变体，驱动方可直接 `match` 决策而无需解析消息。
/// - **契约 (What)**：
///   - 每个变体对应一个稳定错误码，见 [`CrucibleError::code`]；
///   - `SetupFailed` 与 `Cancelled`/`TimedOut` 必须可区分：前者是业务
///     失败，后两者来自取消源或超时源，报告层执行不同的重试策略；
///   - `CounterUnderflow` 表示编排驱动自身的缺陷，调用方应终止本次运行。
/// - **设计权衡 (Trade-offs)**：上下文以 `String` 承载，牺牲少量堆分配
///   换取排障可读性；记忆化重放通过 `Arc<CrucibleError>` 共享，克隆
///   成本可控。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CrucibleError {
    /// 安装钩子失败。该错误会被记忆化：所有依赖同一作用域的测试
    /// （包括尚未开始的）都将收到同一份错误，而不会重试钩子。
    #[error("set-up hook `{hook}` for {owner} failed: {detail}")]
    SetupFailed {
        owner: OwnerId,
        hook: Arc<str>,
        detail: String,
    },

    /// 清理钩子失败。仅出现在 [`CleanupReport`] 中，从不抛给触发
    /// 零穿越的那个测试。
    #[error("clean-up hook `{hook}` for {owner} failed: {detail}")]
    CleanupFailed {
        owner: OwnerId,
        hook: Arc<str>,
        detail: String,
    },

    /// 取消源先于自然完成触发。`context` 指明被打断的操作。
    #[error("operation `{context}` observed cancellation before completion")]
    Cancelled { context: String },

    /// 钩子声明的超时先于父级取消与自然完成触发。
    #[error("operation `{context}` exceeded its declared timeout of {timeout:?}")]
    TimedOut { context: String, timeout: Duration },

    /// 实例计数器递减时未发现匹配的递增。
    ///
    /// - **意图 (Why)**：该不变量被破坏意味着清理时机不再可信，继续运行
    ///   可能双重释放夹具，必须立即终止；
    /// - **契约 (What)**：`scope` 描述失衡的计数器（作用域或夹具键）。
    #[error("counter underflow detected for {scope}: check-out without matching check-in")]
    CounterUnderflow { scope: String },

    /// 作用域的注册窗口已随首次执行关闭。
    #[error("hook registration for {owner} is closed: execution already started")]
    RegistrationClosed { owner: OwnerId },

    /// 共享夹具工厂构造失败。
    #[error("shared fixture factory for {key} failed: {detail}")]
    FixtureFactoryFailed { key: FixtureKey, detail: String },

    /// 共享夹具拆卸失败。
    #[error("shared fixture teardown for {key} failed: {detail}")]
    FixtureTeardownFailed { key: FixtureKey, detail: String },

    /// 夹具释放与使用计数不配对。
    #[error("fixture usage underflow for {key}: release without matching acquire")]
    FixtureUnderflow { key: FixtureKey },

    /// 作用域链结构非法。
    #[error("invalid owner chain: {detail}")]
    InvalidChain { detail: String },

    /// 同一实例标识被重复签入。
    #[error("test instance `{instance}` is already checked in")]
    DuplicateCheckIn { instance: Arc<str> },

    /// 对未签入（或已签出）的实例执行操作。
    #[error("test instance `{instance}` is not checked in")]
    UnknownInstance { instance: Arc<str> },
}

impl CrucibleError {
    /// 返回变体对应的稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            CrucibleError::SetupFailed { .. } => codes::HOOK_SETUP_FAILED,
            CrucibleError::CleanupFailed { .. } => codes::HOOK_CLEANUP_FAILED,
            CrucibleError::Cancelled { .. } => codes::HOOK_CANCELLED,
            CrucibleError::TimedOut { .. } => codes::HOOK_TIMEOUT,
            CrucibleError::CounterUnderflow { .. } => codes::TRACKER_UNDERFLOW,
            CrucibleError::RegistrationClosed { .. } => codes::REGISTRY_SEALED,
            CrucibleError::FixtureFactoryFailed { .. } => codes::FIXTURE_FACTORY_FAILED,
            CrucibleError::FixtureTeardownFailed { .. } => codes::FIXTURE_TEARDOWN_FAILED,
            CrucibleError::FixtureUnderflow { .. } => codes::FIXTURE_UNDERFLOW,
            CrucibleError::InvalidChain { .. } => codes::OWNER_INVALID_CHAIN,
            CrucibleError::DuplicateCheckIn { .. } => codes::ORCHESTRATOR_DUPLICATE_CHECK_IN,
            CrucibleError::UnknownInstance { .. } => codes::ORCHESTRATOR_UNKNOWN_INSTANCE,
        }
    }

    /// 是否属于“取消类”结局（父级取消或声明超时触发）。
    ///
    /// 报告层据此与普通失败区分：取消类结局可能随重试策略重新调度，
    /// 业务失败则直接计入失败报告。
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            CrucibleError::Cancelled { .. } | CrucibleError::TimedOut { .. }
        )
    }
}

/// 清理失败的发生位置：某作用域的清理钩子，或某共享夹具的拆卸。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CleanupSite {
    /// 作用域清理钩子。
    Hook { owner: OwnerId, hook: Arc<str> },
    /// 共享夹具拆卸。
    Fixture { key: FixtureKey },
}

/// 单条清理失败记录。
#[derive(Clone, Debug)]
pub struct CleanupFailure {
    site: CleanupSite,
    error: CrucibleError,
}

impl CleanupFailure {
    pub(crate) fn new(site: CleanupSite, error: CrucibleError) -> Self {
        Self { site, error }
    }

    /// 失败位置。
    pub fn site(&self) -> &CleanupSite {
        &self.site
    }

    /// 失败详情。
    pub fn error(&self) -> &CrucibleError {
        &self.error
    }
}

/// 一次签出产生的清理失败聚合。
///
/// # 教案式注释
/// - **意图 (Why)**：清理失败的契约是“收集而非短路”——链上每个清理钩子
///   无论先前是否有失败都要尝试执行，全部失败统一返回给运行报告层；
/// - **契约 (What)**：
///   - [`is_clean`](Self::is_clean) 为 `true` 表示本次签出没有任何清理
///     或拆卸失败；
///   - 记录顺序与执行顺序一致（派生类 → 基类 → 程序集 → 夹具）；
/// - **风险 (Trade-offs)**：报告不去重，同一钩子在不同零穿越事件中失败
///   会产生多条记录，由报告层决定展示策略。
#[derive(Clone, Debug, Default)]
pub struct CleanupReport {
    failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub(crate) fn push(&mut self, failure: CleanupFailure) {
        self.failures.push(failure);
    }

    pub(crate) fn extend(&mut self, failures: impl IntoIterator<Item = CleanupFailure>) {
        self.failures.extend(failures);
    }

    /// 是否无任何清理失败。
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// 失败条数。
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// 报告是否为空（与 [`is_clean`](Self::is_clean) 等价，满足惯用 API）。
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// 遍历失败记录。
    pub fn failures(&self) -> impl Iterator<Item = &CleanupFailure> {
        self.failures.iter()
    }
}
