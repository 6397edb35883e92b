use std::collections::HashSet;

use tracing::warn;

use conclave_core::types::WorkflowStep;

/// Group steps into execution layers.
///
/// Each pass collects every remaining step whose dependencies all sit in
/// earlier layers. When a pass finds nothing eligible (a cycle, or a
/// dependency on an unknown step) the remaining steps form one final layer.
/// Every step lands in exactly one layer, in declaration order within it.
pub fn resolve_layers(steps: &[WorkflowStep]) -> Vec<Vec<&WorkflowStep>> {
    let mut layers: Vec<Vec<&WorkflowStep>> = Vec::new();
    let mut done: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&WorkflowStep> = steps.iter().collect();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&WorkflowStep>, Vec<&WorkflowStep>) = remaining
            .into_iter()
            .partition(|step| step.depends_on.iter().all(|dep| done.contains(dep.as_str())));

        if ready.is_empty() {
            let forced: Vec<&str> = blocked.iter().map(|s| s.id.as_str()).collect();
            warn!(
                steps = ?forced,
                "Unresolvable step dependencies, forcing remaining steps into a final layer"
            );
            layers.push(blocked);
            break;
        }

        done.extend(ready.iter().map(|s| s.id.as_str()));
        layers.push(ready);
        remaining = blocked;
    }
    layers
}
