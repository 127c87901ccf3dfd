//! Default record producer and classifier for the command line.
//!
//! Sources without a dedicated producer get a generic summary of whatever
//! they return: JSON objects pass through, HTML pages are reduced to their
//! title and label/value pairs.

use anyhow::Result;
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value};

use case_ingest::{Classification, Classifier, FieldSet, Production, RecordProducer};

pub struct HtmlSummaryProducer;

impl HtmlSummaryProducer {
    fn summarize(&self, html: &str) -> FieldSet {
        let doc = Html::parse_document(html);
        let mut fields = FieldSet::new();

        if let Ok(sel) = Selector::parse("title") {
            if let Some(title) = doc.select(&sel).next() {
                fields.insert("title".into(), json!(text_of(title)));
            }
        }

        if let (Ok(dl_sel), Ok(pair_sel)) = (Selector::parse("dl"), Selector::parse("dt, dd")) {
            for dl in doc.select(&dl_sel) {
                let mut label: Option<String> = None;
                for el in dl.select(&pair_sel) {
                    match el.value().name() {
                        "dt" => label = Some(field_key(&text_of(el))),
                        _ => {
                            if let Some(key) = label.take().filter(|k| !k.is_empty()) {
                                fields.entry(key).or_insert_with(|| json!(text_of(el)));
                            }
                        }
                    }
                }
            }
        }

        if let (Ok(row_sel), Ok(cell_sel)) = (Selector::parse("tr"), Selector::parse("th, td")) {
            for row in doc.select(&row_sel) {
                let cells: Vec<ElementRef> = row.select(&cell_sel).collect();
                if let [label, value] = cells.as_slice() {
                    let key = field_key(&text_of(*label));
                    if !key.is_empty() {
                        fields.entry(key).or_insert_with(|| json!(text_of(*value)));
                    }
                }
            }
        }

        let text_length: usize = doc.root_element().text().map(|t| t.trim().len()).sum();
        fields.insert("text_length".into(), json!(text_length));
        fields
    }
}

impl RecordProducer for HtmlSummaryProducer {
    fn produce(&self, _source: &str, _unit_key: &str, raw: &[u8]) -> Result<Production> {
        if let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(raw) {
            let quality = filled_share(&fields);
            return Ok(Production {
                field_sets: vec![fields],
                quality,
            });
        }

        let fields = self.summarize(&String::from_utf8_lossy(raw));
        let quality = filled_share(&fields);
        Ok(Production {
            field_sets: vec![fields],
            quality,
        })
    }
}

/// Grades nothing; every record lands in the triage queue.
pub struct UngradedClassifier;

impl Classifier for UngradedClassifier {
    fn classify(&self, _fields: &FieldSet) -> Result<Classification> {
        Ok(Classification {
            grade: Some("ungraded".into()),
            workflow_class: Some("triage".into()),
        })
    }
}

fn text_of(el: ElementRef) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `"Case Number:"` → `"case_number"`.
fn field_key(label: &str) -> String {
    let mut key = String::with_capacity(label.len());
    for c in label.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            key.push(c);
        } else if !key.ends_with('_') && !key.is_empty() {
            key.push('_');
        }
    }
    key.trim_end_matches('_').to_string()
}

fn filled_share(fields: &FieldSet) -> f64 {
    let scored: Vec<&Value> = fields
        .iter()
        .filter(|(k, _)| k.as_str() != "text_length")
        .map(|(_, v)| v)
        .collect();
    if scored.is_empty() {
        return 0.0;
    }
    let filled = scored
        .iter()
        .filter(|v| match v {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
            _ => true,
        })
        .count();
    filled as f64 / scored.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETAIL: &str = r#"
<html><head><title> Case  0001234-56.2026 </title></head>
<body>
  <dl>
    <dt>Court</dt><dd>2nd Civil Court</dd>
    <dt>Judge:</dt><dd></dd>
  </dl>
  <table>
    <tr><th>Filing Date</th><td>2026-05-01</td></tr>
    <tr><td>Party</td><td>Role</td><td>Counsel</td></tr>
  </table>
</body></html>"#;

    #[test]
    fn test_field_key() {
        assert_eq!(field_key("Case Number:"), "case_number");
        assert_eq!(field_key("  Filing -- Date "), "filing_date");
        assert_eq!(field_key("::"), "");
    }

    #[test]
    fn test_summarizes_label_value_pairs() {
        let production = HtmlSummaryProducer
            .produce("alpha", "u", DETAIL.as_bytes())
            .unwrap();
        let fields = &production.field_sets[0];
        assert_eq!(fields["title"], json!("Case 0001234-56.2026"));
        assert_eq!(fields["court"], json!("2nd Civil Court"));
        assert_eq!(fields["judge"], json!(""));
        assert_eq!(fields["filing_date"], json!("2026-05-01"));
        assert!(!fields.contains_key("party"));
        // title, court, filing_date filled; judge blank
        assert!((production.quality - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_json_objects_pass_through() {
        let production = HtmlSummaryProducer
            .produce("beta", "u", br#"{"case": "X-1", "judge": null}"#)
            .unwrap();
        assert_eq!(production.field_sets[0]["case"], json!("X-1"));
        assert!((production.quality - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_page_has_zero_quality() {
        let production = HtmlSummaryProducer.produce("alpha", "u", b"").unwrap();
        assert_eq!(production.quality, 0.0);
    }

    #[test]
    fn test_ungraded_classifier() {
        let class = UngradedClassifier.classify(&FieldSet::new()).unwrap();
        assert_eq!(class.grade.as_deref(), Some("ungraded"));
        assert_eq!(class.workflow_class.as_deref(), Some("triage"));
    }
}
