//! Rule-based audience segmentation: condition model, compiler, dependency
//! resolver and the segment catalog with its lineage graph.

pub mod builder;
pub mod catalog;
pub mod compiler;
pub mod condition;
pub mod legacy;
pub mod lineage;
pub mod resolver;

pub use builder::{Composition, RuleBuilder, RuleDraft};
pub use catalog::{CatalogEntry, CatalogStore, MemoryCatalog, Refresh, Rule, Segment, SegmentSource};
pub use compiler::{CompileWarning, CompiledQuery, ConditionCompiler, TransactionView};
pub use condition::{Condition, ConditionSet, Field, Operator};
pub use legacy::{normalize, ConditionInput};
pub use resolver::{DependencyResolver, Resolution};
