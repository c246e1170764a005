//! # Record Formats Module
//!
//! Byte layouts of everything a session writes:
//!
//! ```text
//! recording_<id>/
//! ├── accelerometer.csv   timestamp,x,y,z,label
//! ├── microphone.csv      timestamp,amplitude,label
//! ├── labels.csv          label,startTime,endTime
//! └── info.json           {"id", "name", "startTime", "sources", "recorders"}
//! ```
//!
//! Sample streams and the label stream are append-only CSV. Fields that
//! contain a comma, quote or newline are quoted.

use crate::label::Label;
use crate::sample::Sample;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt::Write;

pub const LABEL_HEADER: &str = "label,startTime,endTime\n";

/// Header row of a sample stream: timestamp, components, then the label column
pub fn stream_header(components: &[&str]) -> String {
    let mut header = String::from("timestamp");
    for component in components {
        header.push(',');
        header.push_str(&csv_field(component));
    }
    header.push_str(",label\n");
    header
}

/// Encode samples as CSV rows, one per sample
pub fn encode_samples(samples: &[Sample]) -> Vec<u8> {
    let mut out = String::with_capacity(samples.len() * 32);
    for sample in samples {
        let _ = write!(out, "{}", sample.time_ms);
        for value in sample.values() {
            let _ = write!(out, ",{}", value);
        }
        out.push(',');
        if let Some(label) = sample.label() {
            out.push_str(&csv_field(&label.name));
        }
        out.push('\n');
    }
    out.into_bytes()
}

/// Encode a finalized label as one row of the label stream
pub fn encode_label(label: &Label) -> String {
    let end = label.end_ms.map(|t| t.to_string()).unwrap_or_default();
    format!("{},{},{}\n", csv_field(&label.name), label.start_ms, end)
}

fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Session description written to `info.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub id: u64,
    pub name: String,
    /// Milliseconds since the Unix epoch; `null` until the session starts
    pub start_time: Option<i64>,
    pub sources: Vec<String>,
    pub recorders: Vec<String>,
}

impl SessionMetadata {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::{LabelId, LabelRef};

    #[test]
    fn test_stream_header() {
        assert_eq!(stream_header(&["x", "y", "z"]), "timestamp,x,y,z,label\n");
        assert_eq!(stream_header(&["amplitude"]), "timestamp,amplitude,label\n");
    }

    #[test]
    fn test_encode_samples_with_and_without_label() {
        let label = LabelRef::new(LabelId(0), "walking");
        let samples = vec![
            Sample::new(1000, vec![0.5, -1.0, 9.81]),
            Sample::new(1025, vec![0.25, 0.0, 9.8]).with_label(Some(label)),
        ];
        let text = String::from_utf8(encode_samples(&samples)).unwrap();
        assert_eq!(text, "1000,0.5,-1,9.81,\n1025,0.25,0,9.8,walking\n");
    }

    #[test]
    fn test_label_names_are_quoted() {
        let label = Label {
            id: LabelId(3),
            name: "run, \"fast\"".into(),
            start_ms: 10,
            end_ms: Some(20),
        };
        assert_eq!(encode_label(&label), "\"run, \"\"fast\"\"\",10,20\n");
    }

    #[test]
    fn test_metadata_json_field_names() {
        let metadata = SessionMetadata {
            id: 7,
            name: "Recording 7".into(),
            start_time: None,
            sources: vec!["accelerometer".into()],
            recorders: vec!["microphone".into()],
        };
        let json: serde_json::Value = serde_json::from_slice(&metadata.to_json().unwrap()).unwrap();
        assert_eq!(json["id"], 7);
        assert!(json["startTime"].is_null());
        assert_eq!(json["recorders"][0], "microphone");
    }
}
