// =============================================================================
// Evaluation Plan — AST compiled into set algebra
// =============================================================================
//
// The AST is walked once at registration time and turned into a tree of
// closures over symbol sets, so tick-time evaluation never touches the AST.
// The evaluation context maps each leaf's fingerprint to its current matched
// snapshot; fingerprint keys (rather than module names) keep expressions
// correct when the same module appears twice with different parameters.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::alert::leaf::{LeafSpec, ResolveError};
use crate::alert::parser::Expr;

/// leaf fingerprint → matched snapshot.
pub type Context = HashMap<String, Arc<HashSet<String>>>;

/// Pure function from leaf snapshots to triggered symbols.
pub type PlanFn = Box<dyn Fn(&Context) -> HashSet<String> + Send + Sync>;

/// Compile an expression into its evaluation plan.
///
/// `Condition` reads the leaf snapshot, `And` intersects, `Or` unions.
/// A root `Cooldown` is transparent here — the composite applies it after
/// evaluation.
pub fn compile_plan(expr: &Expr) -> Result<PlanFn, ResolveError> {
    match expr {
        Expr::Condition(cond) => {
            let key = LeafSpec::from_condition(cond)?.fingerprint();
            Ok(Box::new(move |ctx: &Context| {
                ctx.get(&key).map(|s| (**s).clone()).unwrap_or_default()
            }))
        }
        Expr::And(items) => {
            let subplans = items
                .iter()
                .map(compile_plan)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(move |ctx: &Context| {
                let mut iter = subplans.iter();
                let Some(first) = iter.next() else {
                    return HashSet::new();
                };
                let mut acc = first(ctx);
                for plan in iter {
                    if acc.is_empty() {
                        break;
                    }
                    let next = plan(ctx);
                    acc.retain(|s| next.contains(s));
                }
                acc
            }))
        }
        Expr::Or(items) => {
            let subplans = items
                .iter()
                .map(compile_plan)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(move |ctx: &Context| {
                let mut acc = HashSet::new();
                for plan in &subplans {
                    acc.extend(plan(ctx));
                }
                acc
            }))
        }
        Expr::Cooldown(inner, _) => compile_plan(inner),
    }
}
