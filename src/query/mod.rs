// Query compiler - expressions, predicates, ordering, projection and the query builder

pub mod entity_query;
pub mod fn_node;
pub mod order_by;
pub mod predicate;
pub mod select;

pub use entity_query::{EntityQuery, QueryRow};
pub use fn_node::{FnNode, NodeKind};
pub use order_by::{ComparerFn, OrderByClause, OrderByItem};
pub use predicate::{BooleanOp, FilterOp, Predicate, PredicateFn};
pub use select::{ProjectedValue, SelectClause};
