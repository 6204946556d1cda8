use super::{core_err, print_request, EXIT_SUCCESS};
use terraplane_core::Orchestrator;

pub fn run(orchestrator: &Orchestrator, provision_id: &str, json: bool) -> Result<u8, String> {
    let req = orchestrator
        .get_status(provision_id)
        .map_err(|e| core_err(&e))?;
    print_request(&req, json)?;
    Ok(EXIT_SUCCESS)
}
