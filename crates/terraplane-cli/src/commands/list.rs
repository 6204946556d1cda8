use super::{colorize_state, core_err, json_pretty, EXIT_SUCCESS};
use terraplane_core::Orchestrator;

pub fn run(orchestrator: &Orchestrator, json: bool) -> Result<u8, String> {
    let requests = orchestrator.list().map_err(|e| core_err(&e))?;
    if json {
        println!("{}", json_pretty(&requests)?);
    } else if requests.is_empty() {
        println!("no provisioning requests found");
    } else {
        println!(
            "{:<32} {:<20} {:<10} {:<14} STARTED",
            "PROVISION_ID", "WORKSPACE", "KIND", "STATE"
        );
        for req in &requests {
            // Pad outside the color codes so columns stay aligned.
            let state = req.state.as_str();
            let pad = " ".repeat(14usize.saturating_sub(state.len()));
            println!(
                "{:<32} {:<20} {:<10} {}{pad} {}",
                req.provision_id.as_str(),
                req.workspace_id.as_str(),
                req.kind.to_string(),
                colorize_state(state),
                req.started_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
