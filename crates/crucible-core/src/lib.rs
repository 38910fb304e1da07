#![doc = r#"
# crucible-core

## 设计动机（Why）
- **定位**：本 crate 是并行测试运行器的夹具生命周期与钩子编排引擎：
  在高并发下对“一次性安装”做记忆化去重、对共享夹具与钩子作用域做
  引用计数、按继承链与程序集边界排序钩子执行，并统一组合取消/超时
  语义。
- **架构角色**：作为测试执行驱动消费的进程内库存在；测试发现、断言
  库与报告格式化都在边界之外，引擎只消费“每作用域的钩子体、实例
  签入/签出事件、共享夹具键与工厂”。
- **设计理念**：强调“至多一次”与“最后一位使用者”两条纪律——安装
  对任意并发调用者物理执行至多一次，清理与夹具拆卸只在最后一个
  使用者离开时恰好触发一次。

## 核心契约（What）
- **注册阶段**：钩子在进程初始化时按作用域注册；整个执行波次的测试
  实例也在此阶段一次性登记（计数与夹具使用在登记时抬升，保证每个
  作用域的计数只归零一次）；某作用域首次执行后注册窗口关闭（封闭
  注册纪律）；
- **安装链**：程序集 → 基类 → 派生类，记忆化单飞，失败缓存重放，
  依赖者快速失败；
- **清理链**：派生类 → 基类 → 程序集，失败收集而非短路，统一以
  [`CleanupReport`] 交给运行报告层；
- **取消语义**：进程级取消根叠加每钩子声明超时，任一源点火给出可
  区分的取消类结局；钩子体只持有只读观察者，无法触发派生信号。

## 并发模型（How)
- 不相关作用域之间没有全局锁；计数转换在每键分片锁的常数临界区内
  完成，任何锁都不会跨钩子体或工厂持有；
- 挂起点仅有三类：等待记忆化安装的单次执行、等待他人正在构造的
  共享夹具、等待声明超时或取消。

## 风险与考量（Trade-offs）
- 引擎按运行实例化（显式注入状态，而非环境单例），取消根是唯一
  刻意保留的进程级信号；
- 安装失败后实例仍处签入状态，驱动方必须照常签出以配平计数，这是
  计数不变量独立于安装成败的代价。
"#]

pub mod contract;
pub mod error;
pub mod fixture;
pub mod hook;
pub mod orchestrator;
pub mod owner;
pub mod tracker;

pub use contract::{CancelWatcher, Cancellation};
pub use error::{CleanupFailure, CleanupReport, CleanupSite, CrucibleError};
pub use fixture::{FixtureKey, FixtureStore, SharedFixture};
pub use hook::{HookAction, HookKind, HookRegistry, MemoizedHook, OwnerContextSnapshot};
pub use orchestrator::{InstanceState, Orchestrator};
pub use owner::{OwnerChain, OwnerId, OwnerKind, TestInstance};
pub use tracker::InstanceTracker;
