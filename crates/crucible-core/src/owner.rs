//! # owner 模块说明
//!
//! ## 角色定位（Why）
//! - 测试运行中的“作用域拥有者”（程序集或测试类）是钩子注册、实例计数与
//!   夹具释放的共同索引，本模块为其提供统一的标识与链路表示；
//! - 继承链顺序（基类在前、派生类在后）在注册阶段一次性给定，运行期不再
//!   做任何动态类型推导，避免热路径上的反射开销。
//!
//! ## 契约要求（What）
//! - [`OwnerId`] 以 `Arc<str>` 承载名称，克隆为常数成本，可直接作为并发
//!   Map 的键；
//! - [`OwnerChain`] 在构造时校验“恰好一个程序集 + 零个或多个类”的结构，
//!   并固化安装顺序（程序集 → 基类 → 派生类）与拆卸顺序（反向）；
//! - [`TestInstance`] 描述一次测试实例的身份、作用域链与其消费的共享夹具。

use std::fmt;
use std::sync::Arc;

use crate::error::CrucibleError;
use crate::fixture::FixtureKey;

/// 作用域种类：程序集或测试类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    /// 程序集作用域，位于所有类作用域之上。
    Assembly,
    /// 类作用域，按继承链排序。
    Class,
}

/// 作用域拥有者标识。
///
/// # 教案式注释
/// - **意图 (Why)**：钩子注册表、实例计数器、夹具存储都需要以拥有者为键，
///   统一标识避免各模块私自约定字符串格式；
/// - **契约 (What)**：同名同类的两个 `OwnerId` 相等；名称建议使用完整限定名
///   （如 `tests.acceptance.LoginTests`）以避免跨程序集冲突；
/// - **风险 (Trade-offs)**：标识不携带类型信息本体，继承关系由
///   [`OwnerChain`] 显式给出，构造错误的链路属于驱动方缺陷。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum OwnerId {
    /// 程序集作用域。
    Assembly(Arc<str>),
    /// 类作用域。
    Class(Arc<str>),
}

impl OwnerId {
    /// 构造程序集作用域标识。
    pub fn assembly(name: impl Into<Arc<str>>) -> Self {
        OwnerId::Assembly(name.into())
    }

    /// 构造类作用域标识。
    pub fn class(name: impl Into<Arc<str>>) -> Self {
        OwnerId::Class(name.into())
    }

    /// 返回作用域名称。
    pub fn name(&self) -> &str {
        match self {
            OwnerId::Assembly(name) | OwnerId::Class(name) => name,
        }
    }

    /// 返回作用域种类。
    pub fn kind(&self) -> OwnerKind {
        match self {
            OwnerId::Assembly(_) => OwnerKind::Assembly,
            OwnerId::Class(_) => OwnerKind::Class,
        }
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            OwnerKind::Assembly => write!(f, "assembly:{}", self.name()),
            OwnerKind::Class => write!(f, "class:{}", self.name()),
        }
    }
}

/// 作用域链：一个程序集加上基类到派生类的有序类列表。
///
/// # 教案式注释
/// - **意图 (Why)**：安装与拆卸顺序必须在注册阶段一次固化为显式有序
///   列表，而非运行期反射，链路因此是不可变值对象；
/// - **契约 (What)**：
///   - `classes` 按基类在前、派生类在后排列；
///   - [`setup_order`](Self::setup_order) 产出 程序集 → 基类 → 派生类；
///   - [`teardown_order`](Self::teardown_order) 产出 派生类 → 基类 → 程序集；
/// - **风险 (Trade-offs)**：构造时仅校验种类（程序集/类各就其位），
///   不校验名称语义上是否真的构成继承关系，该责任在测试发现层。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerChain {
    assembly: OwnerId,
    classes: Vec<OwnerId>,
}

impl OwnerChain {
    /// 以程序集与基类到派生类的类列表构造链路。
    ///
    /// - **前置条件**：`assembly` 必须是 [`OwnerId::Assembly`]，`classes`
    ///   中的每一项必须是 [`OwnerId::Class`]；
    /// - **错误语义**：种类不匹配时返回 `owner.invalid_chain`。
    pub fn new(assembly: OwnerId, classes: Vec<OwnerId>) -> Result<Self, CrucibleError> {
        if assembly.kind() != OwnerKind::Assembly {
            return Err(CrucibleError::InvalidChain {
                detail: format!("链路首元素必须是程序集作用域，实际为 `{assembly}`"),
            });
        }
        if let Some(bad) = classes.iter().find(|o| o.kind() != OwnerKind::Class) {
            return Err(CrucibleError::InvalidChain {
                detail: format!("继承链中混入了非类作用域 `{bad}`"),
            });
        }
        Ok(Self { assembly, classes })
    }

    /// 程序集作用域。
    pub fn assembly(&self) -> &OwnerId {
        &self.assembly
    }

    /// 基类到派生类排列的类作用域切片。
    pub fn classes(&self) -> &[OwnerId] {
        &self.classes
    }

    /// 安装顺序：程序集 → 基类 → … → 派生类。
    pub fn setup_order(&self) -> impl Iterator<Item = &OwnerId> {
        std::iter::once(&self.assembly).chain(self.classes.iter())
    }

    /// 拆卸顺序：派生类 → … → 基类 → 程序集。
    pub fn teardown_order(&self) -> impl Iterator<Item = &OwnerId> {
        self.classes
            .iter()
            .rev()
            .chain(std::iter::once(&self.assembly))
    }

    /// 链路上的作用域总数（程序集 + 类）。
    pub fn depth(&self) -> usize {
        1 + self.classes.len()
    }

    /// 链路是否包含类作用域。
    pub fn has_classes(&self) -> bool {
        !self.classes.is_empty()
    }
}

/// 测试实例描述符，由测试发现层在创建实例时提供。
///
/// # 教案式注释
/// - **契约 (What)**：
///   - `id`：运行内唯一的实例标识，重复签入同一 id 将被编排器拒绝；
///   - `chain`：实例所属的作用域链；
///   - `fixtures`：实例注入的共享夹具键，签入时逐一增加使用计数，
///     签出时逐一释放，严格一一配对；
/// - **风险 (Trade-offs)**：描述符克隆包含 `Vec` 复制，驱动方应在签入/签出
///   间复用同一份描述符而非重建。
#[derive(Clone, Debug)]
pub struct TestInstance {
    id: Arc<str>,
    chain: OwnerChain,
    fixtures: Vec<FixtureKey>,
}

impl TestInstance {
    /// 构造测试实例描述符。
    pub fn new(id: impl Into<Arc<str>>, chain: OwnerChain, fixtures: Vec<FixtureKey>) -> Self {
        Self {
            id: id.into(),
            chain,
            fixtures,
        }
    }

    /// 实例标识。
    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    /// 作用域链。
    pub fn chain(&self) -> &OwnerChain {
        &self.chain
    }

    /// 实例消费的共享夹具键。
    pub fn fixtures(&self) -> &[FixtureKey] {
        &self.fixtures
    }
}
