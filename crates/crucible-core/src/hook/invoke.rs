//! 单次钩子调用的取消/超时组合。
//!
//! - **意图 (Why)**：每次钩子调用派生“父级取消 OR 声明超时”的联合信号，
//!   任一源点火都给出可区分的“取消类”结局，而非静默空转；
//! - **逻辑 (How)**：前置快速检查后，以 `tokio::select!`（biased）把取消
//!   等待、超时计时与钩子体三路竞速；取消优先于超时，超时优先于完成，
//!   保证结局判定确定；
//! - **契约 (What)**：返回 `hook.cancelled` / `hook.timeout` / 钩子体自身
//!   的成功或失败；组合信号不暴露给钩子体，钩子体仅持有只读观察者。

use tracing::trace;

use crate::contract::Cancellation;
use crate::error::CrucibleError;
use crate::hook::HookAction;

pub(crate) async fn run_hook(
    action: &HookAction,
    cancel: &Cancellation,
) -> Result<(), CrucibleError> {
    if cancel.is_cancelled() {
        return Err(CrucibleError::Cancelled {
            context: action.name().to_string(),
        });
    }

    trace!(hook = %action.name(), kind = ?action.kind(), "invoking hook body");
    let body = action.invoke(cancel.watcher());
    tokio::pin!(body);
    let cancelled = cancel.cancelled();
    tokio::pin!(cancelled);

    match action.timeout() {
        Some(timeout) => {
            let sleep = tokio::time::sleep(timeout);
            tokio::pin!(sleep);
            tokio::select! {
                biased;
                _ = &mut cancelled => Err(CrucibleError::Cancelled {
                    context: action.name().to_string(),
                }),
                _ = &mut sleep => Err(CrucibleError::TimedOut {
                    context: action.name().to_string(),
                    timeout,
                }),
                result = &mut body => result,
            }
        }
        None => {
            tokio::select! {
                biased;
                _ = &mut cancelled => Err(CrucibleError::Cancelled {
                    context: action.name().to_string(),
                }),
                result = &mut body => result,
            }
        }
    }
}
