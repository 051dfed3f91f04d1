/// Authority-issued digest listing of its capsule set.
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::capsule::Capsule;
use crate::ArcProtocolError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub node_id: String,
    /// Newest first.
    pub capsule_ids: Vec<String>,
    pub digests: BTreeMap<String, String>,
    pub timestamp: u64,
}

impl Manifest {
    /// Build from the full capsule set, newest first.
    pub fn build(node_id: impl Into<String>, capsules: &[Capsule], timestamp: u64) -> Self {
        let mut ordered: Vec<&Capsule> = capsules.iter().collect();
        ordered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let capsule_ids = ordered.iter().map(|c| c.capsule_id.clone()).collect();
        let digests = ordered
            .iter()
            .map(|c| (c.capsule_id.clone(), c.digest()))
            .collect();

        Self {
            node_id: node_id.into(),
            capsule_ids,
            digests,
            timestamp,
        }
    }

    /// `digests` keys must be exactly the set of `capsule_ids`.
    pub fn validate(&self) -> Result<(), ArcProtocolError> {
        let ids: HashSet<&str> = self.capsule_ids.iter().map(String::as_str).collect();
        if ids.len() != self.capsule_ids.len() {
            return Err(ArcProtocolError::protocol(format!(
                "manifest from {} lists duplicate capsule ids",
                self.node_id
            )));
        }
        let keys: HashSet<&str> = self.digests.keys().map(String::as_str).collect();
        if ids != keys {
            return Err(ArcProtocolError::protocol(format!(
                "manifest from {} has digests not matching its capsule ids",
                self.node_id
            )));
        }
        Ok(())
    }

    /// Ids listed here but absent from `local`, in manifest order.
    pub fn missing<'a>(&'a self, local: &HashSet<String>) -> Vec<&'a str> {
        self.capsule_ids
            .iter()
            .filter(|id| !local.contains(*id))
            .map(String::as_str)
            .collect()
    }

    /// Whether `capsule` matches the digest listed for its id.
    pub fn matches(&self, capsule: &Capsule) -> bool {
        self.digests
            .get(&capsule.capsule_id)
            .is_some_and(|d| *d == capsule.digest())
    }

    pub fn len(&self) -> usize {
        self.capsule_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capsule_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capsule(id: &str, ts: u64) -> Capsule {
        Capsule {
            capsule_id: id.into(),
            question_hash: format!("h-{id}"),
            question_text: "q".into(),
            answer_text: format!("answer {id}"),
            compressed_embedding: None,
            source_id: "main-hub".into(),
            timestamp: ts,
            signature: format!("sig-{id}"),
        }
    }

    #[test]
    fn build_orders_newest_first() {
        let manifest = Manifest::build("main-hub", &[capsule("a", 1), capsule("b", 3), capsule("c", 2)], 10);
        assert_eq!(manifest.capsule_ids, vec!["b", "c", "a"]);
        assert_eq!(manifest.digests.len(), 3);
        assert_eq!(manifest.digests["a"], capsule("a", 1).digest());
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn empty_manifest_is_valid() {
        let manifest = Manifest::build("main-hub", &[], 0);
        assert!(manifest.is_empty());
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn validate_rejects_key_mismatch() {
        let mut manifest = Manifest::build("main-hub", &[capsule("a", 1)], 1);
        manifest.digests.insert("ghost".into(), "00".into());
        assert!(manifest.validate().is_err());

        let mut manifest = Manifest::build("main-hub", &[capsule("a", 1)], 1);
        manifest.capsule_ids.push("a".into());
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn missing_is_set_difference_in_order() {
        let manifest = Manifest::build("main-hub", &[capsule("a", 1), capsule("b", 2), capsule("c", 3)], 1);
        let local: HashSet<String> = ["b".to_string()].into();
        assert_eq!(manifest.missing(&local), vec!["c", "a"]);

        let all: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert!(manifest.missing(&all).is_empty());
    }

    #[test]
    fn matches_detects_altered_capsule() {
        let manifest = Manifest::build("main-hub", &[capsule("a", 1)], 1);
        let mut altered = capsule("a", 1);
        assert!(manifest.matches(&altered));
        altered.answer_text = "changed".into();
        assert!(!manifest.matches(&altered));
    }
}
