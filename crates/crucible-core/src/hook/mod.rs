//! # hook 模块说明
//!
//! ## 角色定位（Why）
//! - 钩子（SetUp / CleanUp）是作用域生命周期的执行单元：注册阶段按序
//!   挂到拥有者名下，执行阶段按“程序集 → 基类 → 派生类”的链路运行；
//! - 安装钩子以单飞记忆化保证并发调用者观察到恰好一次执行与一致结局；
//!   清理钩子收集失败、从不短路。
//!
//! ## 子模块导览
//! - [`invoke`]：单次钩子调用的取消/超时组合封装；
//! - [`memo`]：安装钩子的单飞记忆化外壳；
//! - [`registry`]：按拥有者组织的钩子注册表与执行入口。

mod invoke;
mod memo;
mod registry;

pub use memo::MemoizedHook;
pub use registry::{HookRegistry, OwnerContextSnapshot};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::contract::CancelWatcher;
use crate::error::CrucibleError;

pub(crate) use invoke::run_hook;

/// 钩子种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    /// 作用域安装钩子，失败后缓存重放、快速失败依赖者。
    SetUp,
    /// 作用域清理钩子，失败收集上报、从不短路。
    CleanUp,
}

type HookBody = Arc<dyn Fn(CancelWatcher) -> BoxFuture<'static, Result<(), CrucibleError>> + Send + Sync>;

/// 一个钩子动作：可读名称、可选超时与以取消观察者为参的执行体。
///
/// # 教案式注释
/// - **意图 (Why)**：执行体以 `BoxFuture` 承载，注册表无需关心具体类型；
///   名称用于日志与失败消息（对应原方法名），超时为声明式，组合逻辑
///   见 [`invoke`]；
/// - **契约 (What)**：
///   - 执行体收到的 [`CancelWatcher`] 只能观察、不能触发取消；
///   - 执行体返回 `Err` 时由调用侧按钩子种类包装为安装/清理失败；
/// - **风险 (Trade-offs)**：执行体以 `Arc` 共享，注册后不可变。
#[derive(Clone)]
pub struct HookAction {
    name: Arc<str>,
    kind: HookKind,
    timeout: Option<Duration>,
    body: HookBody,
}

impl HookAction {
    /// 构造钩子动作。
    pub fn new<B, F>(
        kind: HookKind,
        name: impl Into<Arc<str>>,
        timeout: Option<Duration>,
        body: B,
    ) -> Self
    where
        B: Fn(CancelWatcher) -> F + Send + Sync + 'static,
        F: Future<Output = Result<(), CrucibleError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind,
            timeout,
            body: Arc::new(move |watcher| Box::pin(body(watcher))),
        }
    }

    /// 钩子名称。
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// 钩子种类。
    pub fn kind(&self) -> HookKind {
        self.kind
    }

    /// 声明的超时。
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn invoke(&self, watcher: CancelWatcher) -> BoxFuture<'static, Result<(), CrucibleError>> {
        (self.body)(watcher)
    }
}

impl fmt::Debug for HookAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookAction")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
