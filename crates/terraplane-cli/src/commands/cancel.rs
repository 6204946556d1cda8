use super::{json_pretty, EXIT_FAILURE, EXIT_SUCCESS};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Cancel a request owned by a running server.
///
/// Workers live inside the process that accepted the request, so
/// cancellation goes through that server's HTTP API.
pub fn run(server: &str, provision_id: &str, json: bool) -> Result<u8, String> {
    let url = format!(
        "{}/api/v1/provision/{provision_id}/cancel",
        server.trim_end_matches('/')
    );
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(REQUEST_TIMEOUT))
        .build()
        .into();
    let mut resp = agent
        .post(&url)
        .send_empty()
        .map_err(|e| format!("cannot reach {server}: {e}"))?;
    let status = resp.status().as_u16();
    let text = resp
        .body_mut()
        .read_to_string()
        .map_err(|e| format!("invalid response from {server}: {e}"))?;
    let body: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| format!("invalid response from {server}: {e}"))?;

    match status {
        200 => {
            let cancelled = body["cancelled"].as_bool().unwrap_or(false);
            if json {
                println!("{}", json_pretty(&body)?);
            } else if cancelled {
                println!("cancellation requested for {provision_id}");
            } else {
                println!("{provision_id} is not running");
            }
            Ok(if cancelled { EXIT_SUCCESS } else { EXIT_FAILURE })
        }
        404 => Err(format!("provisioning request not found: {provision_id}")),
        code => Err(format!(
            "server returned {code}: {}",
            body["error"].as_str().unwrap_or("unknown error")
        )),
    }
}
