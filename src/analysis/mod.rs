//! Static platform analysis of recipes
//!
//! `constraint` handles one step at a time; `policy` aggregates a whole recipe.

pub mod constraint;
pub mod policy;

pub use constraint::{Constraint, StepAnalysis, WhenClause};
pub use policy::{classify, classify_recipe, plan_targets, PlatformTarget, RecipeFamilyPolicy};
