//! Scenario runner – execute scripted flows from YAML files.
//!
//! All steps run against the same context, so engine state carries over
//! from one step to the next.

use crate::commands::CommandRegistry;
use crate::context::PbfContext;
use crate::probes;
use crate::types::*;

/// Load a scenario from a YAML string.
pub fn load_scenario(yaml: &str) -> Result<Scenario, String> {
    serde_yaml::from_str(yaml).map_err(|e| format!("failed to parse scenario YAML: {}", e))
}

/// Execute a scenario and return the overall result.
pub fn run_scenario(
    scenario: &Scenario,
    ctx: &PbfContext,
    registry: &CommandRegistry,
) -> ScenarioResult {
    let mut step_results = Vec::new();
    let mut overall = Status::Pass;

    for (i, step) in scenario.steps.iter().enumerate() {
        let result = match step {
            ScenarioStep::Call {
                call,
                args,
                expect_status,
            } => {
                let r = registry.execute(call, args.clone(), ctx);
                let actual_status = serde_json::to_value(r.status)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default();
                if actual_status != *expect_status {
                    tracing::warn!(
                        step = i,
                        call = %call,
                        expected = %expect_status,
                        actual = %actual_status,
                        "scenario step status mismatch"
                    );
                    overall = Status::Fail;
                }
                r
            }
            ScenarioStep::Probe { probe } => {
                let r = probes::run_probe(probe, ctx);
                if r.status != Status::Pass && r.status != Status::Skip {
                    overall = Status::Fail;
                }
                r
            }
        };
        step_results.push(result);
    }

    ScenarioResult {
        name: scenario.name.clone(),
        overall_status: overall,
        step_results,
    }
}
