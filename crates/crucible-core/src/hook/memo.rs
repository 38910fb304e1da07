//! 安装钩子的单飞记忆化外壳。
//!
//! - **意图 (Why)**：契约要求并发调用者对同一安装钩子观察到“恰好一次
//!   执行、一致结局”：首位调用者执行钩子体并发布结果（成功或失败），
//!   所有调用者（包括首位）都从同一槽位读取；失败同样缓存，依赖该
//!   作用域的后来者快速失败而非重试；
//! - **逻辑 (How)**：`tokio::sync::OnceCell` 的 `get_or_init` 即“每键
//!   一次性 Future 槽”——并发初始化收敛为单次执行，其余调用者挂起
//!   等待发布；
//! - **契约 (What)**：结局以 `Arc<CrucibleError>` 共享重放；取消类结局
//!   （`hook.cancelled` / `hook.timeout`）保持原变体不被包装，业务失败
//!   包装为带作用域与钩子名的 `hook.setup_failed`。

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::debug;

use crate::contract::Cancellation;
use crate::error::CrucibleError;
use crate::hook::{HookAction, run_hook};
use crate::owner::OwnerId;

/// 记忆化安装钩子：首次执行的结局被捕获并重放给所有后续调用者。
pub struct MemoizedHook {
    action: HookAction,
    outcome: OnceCell<Result<(), Arc<CrucibleError>>>,
}

impl MemoizedHook {
    pub(crate) fn new(action: HookAction) -> Self {
        Self {
            action,
            outcome: OnceCell::new(),
        }
    }

    /// 钩子名称。
    pub fn name(&self) -> &Arc<str> {
        self.action.name()
    }

    /// 是否已有缓存结局（诊断用）。
    pub fn is_settled(&self) -> bool {
        self.outcome.initialized()
    }

    /// 执行或重放钩子。
    ///
    /// - **后置条件**：对任意并发度 N，钩子体至多执行一次；N 个调用者
    ///   收到的 `Result` 完全一致；
    /// - **取消语义**：取消源在执行中点火时，取消结局同样被缓存——
    ///   所有等待者观察到取消而非悬挂或伪成功。
    pub async fn run(
        &self,
        owner: &OwnerId,
        cancel: &Cancellation,
    ) -> Result<(), Arc<CrucibleError>> {
        self.outcome
            .get_or_init(|| async {
                let result = run_hook(&self.action, cancel).await;
                match result {
                    Ok(()) => {
                        debug!(owner = %owner, hook = %self.action.name(), "set-up hook completed");
                        Ok(())
                    }
                    Err(err) => {
                        let published = if err.is_cancellation() {
                            err
                        } else {
                            CrucibleError::SetupFailed {
                                owner: owner.clone(),
                                hook: Arc::clone(self.action.name()),
                                detail: err.to_string(),
                            }
                        };
                        debug!(
                            owner = %owner,
                            hook = %self.action.name(),
                            code = published.code(),
                            "set-up hook settled with failure, outcome cached"
                        );
                        Err(Arc::new(published))
                    }
                }
            })
            .await
            .clone()
    }
}
