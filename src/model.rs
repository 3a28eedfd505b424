use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::time::Duration;

/// One extracted row. Fields keep the order the extraction produced them in,
/// which is also the column order of CSV output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: Vec<(String, Option<String>)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name`, replacing an existing value in place so the column
    /// position is kept.
    pub fn insert(&mut self, name: impl Into<String>, value: Option<String>) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K, V> FromIterator<(K, Option<V>)> for Record
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, Option<V>)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k, v.map(Into::into));
        }
        record
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub url: String,
    pub final_url: String,
    pub status: Option<u16>,
    pub body: String,
}

/// Result of scraping a single URL inside a batch.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeOutcome {
    pub url: String,
    #[serde(skip)]
    pub records: Vec<Record>,
    pub record_count: usize,
    pub error: Option<String>,
    pub status: Option<u16>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub success: bool,
}

impl ScrapeOutcome {
    pub fn succeeded(doc: &FetchedDocument, records: Vec<Record>, duration: Duration) -> Self {
        Self {
            url: doc.url.clone(),
            record_count: records.len(),
            records,
            error: None,
            status: doc.status,
            duration,
            success: true,
        }
    }

    pub fn failed(url: &str, error: String, status: Option<u16>, duration: Duration) -> Self {
        Self {
            url: url.to_string(),
            records: Vec::new(),
            record_count: 0,
            error: Some(error),
            status,
            duration,
            success: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub urls: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub records: usize,
    pub output: Option<String>,
    pub outcomes: Vec<ScrapeOutcome>,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_column_position_on_overwrite() {
        let mut record = Record::new();
        record.insert("title", Some("a".to_string()));
        record.insert("price", None);
        record.insert("title", Some("b".to_string()));

        assert_eq!(record.names().collect::<Vec<_>>(), vec!["title", "price"]);
        assert_eq!(record.get("title"), Some("b"));
        assert_eq!(record.get("price"), None);
        assert!(record.contains("price"));
    }

    #[test]
    fn serializes_as_ordered_object_with_nulls() {
        let record: Record = [("z", Some("1")), ("a", None)].into_iter().collect();
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"z":"1","a":null}"#);
    }
}
