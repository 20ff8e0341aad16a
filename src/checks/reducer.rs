//! Folds per-expression verdicts into one check verdict.

use super::model::{BoolOp, Expression, ExpressionKind};

/// Reduce evaluated expressions left to right.
///
/// The first expression seeds the result whatever its kind, so a leading
/// `BooleanOperator` seeds its unset result value (`false`). After that a
/// `BooleanOperator` contributes no verdict of its own; it sets the operator
/// used to fold every following verdict until the next operator. Verdicts
/// that appear before any operator has been declared do not change the seed.
/// An empty list reduces to `false`.
pub fn reduce(expressions: &[Expression]) -> bool {
    let Some((first, rest)) = expressions.split_first() else {
        return false;
    };

    let mut verdict = first.result.value;
    let mut operator = match &first.kind {
        ExpressionKind::BooleanOperator(op) => Some(op.operator),
        _ => None,
    };

    for expression in rest {
        if let ExpressionKind::BooleanOperator(op) = &expression.kind {
            operator = Some(op.operator);
            continue;
        }

        let value = expression.result.value;
        verdict = match operator {
            Some(BoolOp::And) => verdict && value,
            Some(BoolOp::Or) => verdict || value,
            None => verdict,
        };
    }

    verdict
}
