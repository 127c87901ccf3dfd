//! Record production and classification collaborators.
//!
//! The orchestrator treats both as opaque: producers turn raw evidence bytes
//! into field-sets plus a quality signal, classifiers grade a merged
//! field-set at commit time.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::commit::merge_fields;
use crate::types::{Classification, FieldSet};

/// Output of one producer invocation.
#[derive(Debug, Clone, Default)]
pub struct Production {
    pub field_sets: Vec<FieldSet>,
    /// Producer-defined confidence in `[0, 1]`.
    pub quality: f64,
}

impl Production {
    pub fn is_empty(&self) -> bool {
        self.field_sets.iter().all(|f| f.is_empty())
    }
}

/// Turns raw captured bytes into structured field-sets.
pub trait RecordProducer: Send + Sync {
    fn produce(&self, source: &str, unit_key: &str, raw: &[u8]) -> Result<Production>;
}

/// Assigns a grade and workflow class to a merged field-set.
pub trait Classifier: Send + Sync {
    fn classify(&self, fields: &FieldSet) -> Result<Classification>;
}

/// Producer that yields nothing. Useful when only evidence capture matters.
pub struct NullProducer;

impl RecordProducer for NullProducer {
    fn produce(&self, _source: &str, _unit_key: &str, _raw: &[u8]) -> Result<Production> {
        Ok(Production::default())
    }
}

/// Per-source producers with a fallback for sources without a dedicated one.
#[derive(Clone)]
pub struct ProducerSet {
    by_source: HashMap<String, Arc<dyn RecordProducer>>,
    fallback: Arc<dyn RecordProducer>,
}

impl ProducerSet {
    pub fn new(fallback: Arc<dyn RecordProducer>) -> Self {
        Self {
            by_source: HashMap::new(),
            fallback,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>, producer: Arc<dyn RecordProducer>) -> Self {
        self.by_source.insert(source.into(), producer);
        self
    }

    pub fn for_source(&self, source: &str) -> &dyn RecordProducer {
        self.by_source
            .get(source)
            .map(|p| p.as_ref())
            .unwrap_or(self.fallback.as_ref())
    }
}

impl Default for ProducerSet {
    fn default() -> Self {
        Self::new(Arc::new(NullProducer))
    }
}

/// Accumulates producer output across the pages of one run.
#[derive(Debug, Default)]
pub(crate) struct Harvest {
    pub fields: FieldSet,
    quality_sum: f64,
    samples: u32,
}

impl Harvest {
    pub fn absorb(&mut self, production: Production) {
        for set in production.field_sets {
            merge_fields(&mut self.fields, set);
        }
        self.quality_sum += production.quality.clamp(0.0, 1.0);
        self.samples += 1;
    }

    pub fn quality(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.quality_sum / f64::from(self.samples)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(&'static str);

    impl RecordProducer for Fixed {
        fn produce(&self, _source: &str, _unit_key: &str, _raw: &[u8]) -> Result<Production> {
            let mut fields = FieldSet::new();
            fields.insert("producer".into(), json!(self.0));
            Ok(Production {
                field_sets: vec![fields],
                quality: 0.5,
            })
        }
    }

    #[test]
    fn test_producer_set_falls_back() {
        let set = ProducerSet::new(Arc::new(Fixed("default"))).with_source("alpha", Arc::new(Fixed("alpha")));
        let alpha = set.for_source("alpha").produce("alpha", "u", b"").unwrap();
        let other = set.for_source("beta").produce("beta", "u", b"").unwrap();
        assert_eq!(alpha.field_sets[0]["producer"], json!("alpha"));
        assert_eq!(other.field_sets[0]["producer"], json!("default"));
    }

    #[test]
    fn test_harvest_merges_and_averages() {
        let mut harvest = Harvest::default();
        let mut a = FieldSet::new();
        a.insert("court".into(), json!("TJSP"));
        let mut b = FieldSet::new();
        b.insert("court".into(), json!(""));
        b.insert("judge".into(), json!("Y"));
        harvest.absorb(Production { field_sets: vec![a], quality: 1.0 });
        harvest.absorb(Production { field_sets: vec![b], quality: 0.5 });

        assert_eq!(harvest.fields["court"], json!("TJSP"));
        assert_eq!(harvest.fields["judge"], json!("Y"));
        assert!((harvest.quality() - 0.75).abs() < 1e-9);
        assert_eq!(Harvest::default().quality(), 0.0);
    }
}
