use super::{core_err, exit_code_for, follow, print_request, vars_map};
use terraplane_core::{Orchestrator, ProvisionInput};

pub fn run(
    orchestrator: &Orchestrator,
    workspace: &str,
    template: &str,
    vars: &[(String, String)],
    json: bool,
) -> Result<u8, String> {
    let ticket = orchestrator
        .provision(ProvisionInput {
            workspace: workspace.to_owned(),
            template: template.to_owned(),
            variables: vars_map(vars),
        })
        .map_err(|e| core_err(&e))?;
    let req = follow(orchestrator, &ticket.provision_id, json)?;
    print_request(&req, json)?;
    Ok(exit_code_for(&req))
}
