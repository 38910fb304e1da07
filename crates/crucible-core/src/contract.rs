//! # contract 模块说明
//!
//! ## 角色定位（Why）
//! - 整次测试运行共享一个进程级取消根信号（例如运行中止），所有钩子与
//!   测试体的执行都必须能观察到它；
//! - 每次钩子调用在根信号之上叠加自身声明的超时，组合逻辑集中在
//!   [`crate::hook`] 的调用封装中，本模块只提供可共享、可等待的取消原语。
//!
//! ## 契约要求（What）
//! - [`Cancellation`] 是唯一能触发取消的句柄；钩子体拿到的是只读的
//!   [`CancelWatcher`]，派生信号永远不可能从钩子体内部被点火；
//! - `cancel` 幂等：首次成功翻转返回 `true`，此后恒返回 `false`；
//! - [`Cancellation::cancelled`] / [`CancelWatcher::cancelled`] 是真正的
//!   异步等待，不做周期性轮询，唤醒依赖 `tokio::sync::Notify`。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct CancelState {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelState {
    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    async fn cancelled(&self) {
        // `enable` 先登记等待者，再复查标记，堵住登记间隙丢失
        // `notify_waiters` 的窗口。
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// 取消原语，统一表达“运行中止”的可中断性契约。
///
/// # 教案式注释
/// - **意图 (Why)**：评审共识要求所有长时间运行的钩子都能被外部主动打断，
///   避免失败场景下的资源占用雪崩；取消根由编排器持有，进程内唯一。
/// - **逻辑 (How)**：内部以 [`AtomicBool`] 表达取消位，通过 [`Arc`] 在
///   任务间共享；`cancel` 以比较交换保证首触发语义，成功后唤醒全部
///   异步等待者。
/// - **契约 (What)**：
///   - **前置条件**：无；构造后处于“未取消”状态；
///   - **后置条件**：`cancel` 成功后，`is_cancelled` 对所有克隆与
///     watcher 全局可见，所有在 `cancelled().await` 上挂起的等待者被唤醒。
/// - **风险 (Trade-offs)**：取消只是协作信号，框架不强制终止正在执行的
///   钩子体；钩子调用封装负责在信号点火时给出“取消”结局。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<CancelState>,
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消根。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// 标记取消并唤醒所有等待者。
    ///
    /// 返回 `true` 表示本次调用首次触发取消；`false` 表示此前已取消，
    /// 调用方应避免重复执行业务兜底。
    pub fn cancel(&self) -> bool {
        let fired = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if fired {
            self.inner.notify.notify_waiters();
        }
        fired
    }

    /// 异步等待取消信号；若已取消则立即返回。
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }

    /// 派生只读观察者，交给钩子体与测试体使用。
    pub fn watcher(&self) -> CancelWatcher {
        CancelWatcher {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// 取消信号的只读视图。
///
/// # 教案式注释
/// - **意图 (Why)**：契约要求派生取消信号“绝不能被钩子体自身触发”，
///   因此钩子体收到的句柄在类型层面就不具备 `cancel` 能力；
/// - **契约 (What)**：观察到的状态与生成它的 [`Cancellation`] 完全一致，
///   克隆为常数成本，可跨任务移动。
#[derive(Clone, Debug)]
pub struct CancelWatcher {
    inner: Arc<CancelState>,
}

impl CancelWatcher {
    /// 查询是否已取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// 异步等待取消信号；若已取消则立即返回。
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }
}
