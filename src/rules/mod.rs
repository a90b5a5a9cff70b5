//! Watch-rule lifecycle: boundary validation, the match predicate, and the
//! scheduler/runner that drives rules against live provider data.

pub mod matcher;
pub mod runner;
pub mod scheduler;
pub mod validation;

pub use matcher::{create_match_if_needed, rule_matches_listing};
pub use runner::{run_rule, RuleRunSummary};
pub use scheduler::{reschedule_after_failure, run_tick, TickOutcome};
pub use validation::{validate_poll_interval_seconds, validate_rule_query};
