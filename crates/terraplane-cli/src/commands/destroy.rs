use super::{core_err, exit_code_for, follow, print_request, vars_map};
use terraplane_core::{DestroyInput, Orchestrator};

pub fn run(
    orchestrator: &Orchestrator,
    workspace: &str,
    template: Option<&str>,
    vars: &[(String, String)],
    json: bool,
) -> Result<u8, String> {
    // No --var at all means "reuse the variables of the last run".
    let variables = if vars.is_empty() {
        None
    } else {
        Some(vars_map(vars))
    };
    let ticket = orchestrator
        .destroy(DestroyInput {
            workspace: workspace.to_owned(),
            template: template.map(str::to_owned),
            variables,
        })
        .map_err(|e| core_err(&e))?;
    let req = follow(orchestrator, &ticket.provision_id, json)?;
    print_request(&req, json)?;
    Ok(exit_code_for(&req))
}
