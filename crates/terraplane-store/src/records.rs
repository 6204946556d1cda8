use crate::layout::StoreLayout;
use crate::StoreError;
use std::fs;
use terraplane_schema::ProvisionRequest;

/// Compute the checksum over a record, excluding the checksum field itself.
fn compute_checksum(req: &ProvisionRequest) -> Result<String, StoreError> {
    let mut copy = req.clone();
    copy.checksum = None;
    let json = serde_json::to_string_pretty(&copy)?;
    Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
}

/// Durable storage for provisioning request records, one JSON file per request.
pub struct RequestStore {
    layout: StoreLayout,
}

impl RequestStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn put(&self, req: &ProvisionRequest) -> Result<(), StoreError> {
        let mut with_checksum = req.clone();
        with_checksum.checksum = Some(compute_checksum(req)?);
        let content = serde_json::to_string_pretty(&with_checksum)?;

        fs::create_dir_all(self.layout.requests_dir())?;
        crate::write_atomic(
            &self.layout.request_record(&req.provision_id),
            content.as_bytes(),
        )
    }

    pub fn get(&self, provision_id: &str) -> Result<ProvisionRequest, StoreError> {
        let path = self.layout.request_record(provision_id);
        if !path.exists() {
            return Err(StoreError::RequestNotFound(provision_id.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        let req: ProvisionRequest = serde_json::from_str(&content)?;

        if let Some(ref expected) = req.checksum {
            let actual = compute_checksum(&req)?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    id: provision_id.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(req)
    }

    pub fn exists(&self, provision_id: &str) -> bool {
        self.layout.request_record(provision_id).exists()
    }

    /// All readable records, newest first. Corrupt entries are skipped with a warning.
    pub fn list(&self) -> Result<Vec<ProvisionRequest>, StoreError> {
        let dir = self.layout.requests_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match self.get(id) {
                Ok(req) => results.push(req),
                Err(e) => tracing::warn!("skipping corrupted request record '{id}': {e}"),
            }
        }
        results.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(results)
    }
}
