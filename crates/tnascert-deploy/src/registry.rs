//! Certificate registry
//!
//! Local map from certificate name to the identifier assigned by the
//! appliance. The import job does not reliably report the new certificate's
//! identifier, so the registry is rebuilt from the certificate listing after
//! every import and the new certificate is found by name.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tnascert_proto::methods::CERTIFICATE_CHOICES;
use tnascert_transport::{RemoteClient, TransportError};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("certificate listing failed: {0}")]
    Listing(#[source] TransportError),

    #[error("malformed certificate listing: {0}")]
    Malformed(String),

    #[error("the server returned an empty certificate listing")]
    Empty,

    #[error("certificate {0} was not found after the import")]
    Missing(String),
}

/// Name to identifier map, restricted to one name prefix
#[derive(Debug, Clone)]
pub struct CertificateRegistry {
    prefix: String,
    expected: String,
    entries: HashMap<String, i64>,
}

impl CertificateRegistry {
    /// `expected` is the name of the certificate deployed by this run
    pub fn new(prefix: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            expected: expected.into(),
            entries: HashMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn expected_name(&self) -> &str {
        &self.expected
    }

    /// Merge a decoded `app.certificate_choices` result
    ///
    /// Only names with the registry's prefix are kept. Names already known
    /// keep their identifier and are never evicted. Returns the number of
    /// entries in the listing.
    pub fn merge(&mut self, choices: &Value) -> Result<usize, RegistryError> {
        let list = choices.as_array().ok_or_else(|| {
            RegistryError::Malformed(format!("expected a list, got {}", choices))
        })?;

        for choice in list {
            let name = choice.get("name").and_then(Value::as_str);
            let id = choice.get("id").and_then(as_identifier);

            let (Some(name), Some(id)) = (name, id) else {
                warn!("Ignoring malformed certificate entry: {}", choice);
                continue;
            };

            if !name.starts_with(&self.prefix) || self.entries.contains_key(name) {
                continue;
            }

            debug!("Certificate {} has id {}", name, id);
            self.entries.insert(name.to_string(), id);
        }

        Ok(list.len())
    }

    /// List the appliance's certificates and merge them
    ///
    /// Returns the identifier of the expected certificate.
    pub async fn refresh<C>(&mut self, client: &C, timeout: Duration) -> Result<i64, RegistryError>
    where
        C: RemoteClient + ?Sized,
    {
        let choices = client
            .call(CERTIFICATE_CHOICES, timeout, Value::Array(Vec::new()))
            .await
            .map_err(RegistryError::Listing)?;
        debug!("Certificate listing: {}", choices);

        if self.merge(&choices)? == 0 {
            return Err(RegistryError::Empty);
        }

        match self.lookup(&self.expected) {
            Some(id) => {
                info!("Found the new certificate {} with id {}", self.expected, id);
                Ok(id)
            }
            None => Err(RegistryError::Missing(self.expected.clone())),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<i64> {
        self.entries.get(name).copied()
    }

    /// Snapshot of every entry
    pub fn all(&self) -> Vec<(String, i64)> {
        self.entries
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect()
    }

    pub fn remove(&mut self, name: &str) -> Option<i64> {
        self.entries.remove(name)
    }

    /// Every known certificate except the one deployed by this run,
    /// ordered by identifier
    pub fn retirement_candidates(&self) -> Vec<(String, i64)> {
        let mut candidates: Vec<_> = self
            .all()
            .into_iter()
            .filter(|(name, _)| name != &self.expected && name.starts_with(&self.prefix))
            .collect();
        candidates.sort_by_key(|(_, id)| *id);
        candidates
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Identifiers arrive as JSON numbers, sometimes encoded as floats
fn as_identifier(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
}
