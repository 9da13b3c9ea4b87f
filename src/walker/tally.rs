//! Failure aggregation for import runs
//!
//! Many failures share a cause (a sealed node, a denied mount). The tally
//! groups them by signature, the trimmed text after the last `:` of the
//! error message, and keeps every failed payload so the run can be
//! replayed from the failure report.

use crate::vault::SecretData;
use std::collections::BTreeMap;

/// Count and first example of one failure signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureCount {
    pub count: u64,
    pub sample_path: String,
}

/// Aggregated import failures, owned by a single thread
#[derive(Debug, Default)]
pub struct ErrorTally {
    signatures: BTreeMap<String, SignatureCount>,
    failed: BTreeMap<String, SecretData>,
}

/// Normalized error signature
pub fn signature(message: &str) -> String {
    match message.rfind(':') {
        Some(idx) => message[idx + 1..].trim().to_string(),
        None => message.trim().to_string(),
    }
}

impl ErrorTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed path with its payload and error message
    pub fn record(&mut self, path: &str, secret: SecretData, message: &str) {
        self.signatures
            .entry(signature(message))
            .and_modify(|s| s.count += 1)
            .or_insert_with(|| SignatureCount {
                count: 1,
                sample_path: path.to_string(),
            });
        self.failed.insert(path.to_string(), secret);
    }

    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of failed paths
    pub fn len(&self) -> usize {
        self.failed.len()
    }

    pub fn signatures(&self) -> &BTreeMap<String, SignatureCount> {
        &self.signatures
    }

    /// Failed path -> payload, ready for the failure report
    pub fn failed(&self) -> &BTreeMap<String, SecretData> {
        &self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature() {
        assert_eq!(signature("PUT secret/a returned 503: Vault is sealed"), "Vault is sealed");
        assert_eq!(signature("a: b: c "), "c");
        assert_eq!(signature(" no colon "), "no colon");
        assert_eq!(signature("trailing:"), "");
    }

    #[test]
    fn test_record_groups_by_signature() {
        let mut tally = ErrorTally::new();
        tally.record("secret/a", SecretData::new().with("k", "1"), "PUT secret/a: code 503");
        tally.record("secret/b", SecretData::new().with("k", "2"), "PUT secret/b: code 503");
        tally.record("secret/c", SecretData::new(), "PUT secret/c: permission denied");

        assert_eq!(tally.len(), 3);
        let sealed = &tally.signatures()["code 503"];
        assert_eq!(sealed.count, 2);
        assert_eq!(sealed.sample_path, "secret/a");
        assert_eq!(tally.signatures()["permission denied"].count, 1);
        assert_eq!(tally.failed()["secret/b"], SecretData::new().with("k", "2"));
    }
}
