//! Check definitions and their evaluation
//!
//! - `model`: check, expression and trigger types with their stored JSON shape
//! - `evaluator`: per-expression evaluation against host, metric and log data
//! - `reducer`: folds expression verdicts into the check verdict
//! - `probes`: ping, SSH and HTTP reachability probes

pub mod evaluator;
pub mod model;
pub mod probes;
pub mod reducer;

pub use evaluator::{ExpressionEvaluator, eval_raw_host_data};
pub use model::{CheckDefinition, CheckId, ClusterId, Expression, ExpressionKind, ExpressionResult};
pub use reducer::reduce;
