//! Symbolic graph model: arena-owned variables and operations, the shared walker, and the
//! reachability collector.

pub(crate) mod arena;
mod collect;
pub mod operation;
pub mod traversal;
mod variable;

pub use arena::GraphArena;
pub use collect::collect;
pub(crate) use collect::collect_ids;
pub use operation::{attributes, Dictionary, PrimitiveKind};
pub use traversal::{
    postorder_traverse_variables, preorder_traverse_variables, traverse_operations,
    traverse_variables, OperandOrder, VisitOrder,
};
pub use variable::{Operation, OperationId, Variable, VariableId, VariableKind};
