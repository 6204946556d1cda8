pub mod cancel;
pub mod destroy;
pub mod list;
pub mod provision;
pub mod status;

use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::time::Duration;
use terraplane_core::{shutdown_requested, CoreError, Orchestrator};
use terraplane_schema::{Failure, PlanSummary, ProvisionRequest, ProvisionState};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_BUSY: u8 = 3;

const FOLLOW_POLL: Duration = Duration::from_millis(250);
/// Lines of tool output echoed to stderr when a request fails.
const FAILURE_TAIL_LINES: usize = 20;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Busy conflicts get their own prefix so `main` can give them a distinct exit code.
pub fn core_err(e: &CoreError) -> String {
    if e.is_retriable() {
        format!("busy: {e}")
    } else {
        e.to_string()
    }
}

/// Parse one `--var KEY=VALUE` argument.
pub fn parse_var(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{s}'"));
    }
    Ok((key.to_owned(), value.to_owned()))
}

pub fn vars_map(vars: &[(String, String)]) -> BTreeMap<String, String> {
    vars.iter().cloned().collect()
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "completed" => Style::new().green().apply_to(state).to_string(),
        "destroyed" => Style::new().blue().apply_to(state).to_string(),
        "failed" => Style::new().red().bold().apply_to(state).to_string(),
        "pending" => Style::new().yellow().apply_to(state).to_string(),
        "initializing" | "planning" | "applying" | "destroying" => {
            Style::new().cyan().apply_to(state).to_string()
        }
        other => other.to_owned(),
    }
}

/// Block until the request is terminal, showing its state on a spinner.
///
/// The first Ctrl-C cancels the request and keeps waiting for the worker
/// to record the cancellation.
pub fn follow(
    orchestrator: &Orchestrator,
    provision_id: &str,
    json: bool,
) -> Result<ProvisionRequest, String> {
    let pb = if json {
        None
    } else {
        Some(spinner(&format!("{provision_id}: pending")))
    };
    let mut cancelling = false;
    let req = loop {
        let snapshot = orchestrator
            .wait(provision_id, FOLLOW_POLL)
            .map_err(|e| core_err(&e))?;
        if snapshot.is_terminal() {
            break snapshot;
        }
        if shutdown_requested() && !cancelling {
            cancelling = true;
            orchestrator
                .cancel(provision_id)
                .map_err(|e| core_err(&e))?;
        }
        if let Some(ref pb) = pb {
            if cancelling {
                pb.set_message(format!("{provision_id}: cancelling..."));
            } else {
                pb.set_message(format!("{provision_id}: {}", snapshot.state));
            }
        }
    };
    if let Some(ref pb) = pb {
        let msg = format!("{provision_id}: {}", req.state);
        if req.state == ProvisionState::Failed {
            spin_fail(pb, &msg);
        } else {
            spin_ok(pb, &msg);
        }
    }
    Ok(req)
}

pub fn exit_code_for(req: &ProvisionRequest) -> u8 {
    if req.state == ProvisionState::Failed {
        EXIT_FAILURE
    } else {
        EXIT_SUCCESS
    }
}

/// Print a request as JSON or as an aligned summary.
pub fn print_request(req: &ProvisionRequest, json: bool) -> Result<(), String> {
    if json {
        println!("{}", json_pretty(req)?);
        return Ok(());
    }
    println!("provision_id: {}", req.provision_id);
    println!("workspace:    {}", req.workspace_id);
    println!("kind:         {}", req.kind);
    println!("template:     {}", req.template);
    println!("state:        {}", colorize_state(req.state.as_str()));
    println!("started_at:   {}", req.started_at.to_rfc3339());
    println!("updated_at:   {}", req.updated_at.to_rfc3339());
    println!("elapsed:      {}s", req.elapsed().num_seconds());
    if let Some(plan) = &req.plan_summary {
        println!("plan:         {}", plan_line(plan));
    }
    if let Some(failure) = &req.failure {
        println!("failure:      {}", failure_line(failure));
        let lines: Vec<&str> = failure.output.lines().collect();
        let tail = &lines[lines.len().saturating_sub(FAILURE_TAIL_LINES)..];
        for line in tail {
            eprintln!("  | {line}");
        }
    }
    if !req.outputs.is_empty() {
        println!("outputs:");
        for (name, value) in &req.outputs {
            match value.as_str() {
                Some(s) => println!("  {name} = {s}"),
                None => println!("  {name} = {value}"),
            }
        }
    }
    Ok(())
}

fn plan_line(plan: &PlanSummary) -> String {
    if plan.has_changes() {
        format!(
            "{} to add, {} to change, {} to destroy",
            plan.add, plan.change, plan.remove
        )
    } else {
        "no changes".to_owned()
    }
}

fn failure_line(failure: &Failure) -> String {
    let mut line = format!("{}: {}", failure.kind, failure.message);
    if failure.kind.is_retriable() {
        line.push_str(" (safe to resubmit)");
    }
    line
}
