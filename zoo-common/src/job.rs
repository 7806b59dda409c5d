use std::collections::HashMap;
use std::fmt;

use serde::{de::Visitor, Deserialize, Serialize};

/// Symbolic name for a class of analyzer service.
///
/// The wire representation is the upper-case name upstream producers use
/// (e.g. `"YARA"`). Kinds we do not recognize still deserialize, as
/// `TaskKind::Other`, so one unknown entry cannot poison a whole job.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum TaskKind {
    FileMetadata,
    Hashes,
    PeInfo,
    VtSample,
    Yara,
    AssemblyApp,
    Other(String),
}

impl TaskKind {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "FILE_METADATA" => TaskKind::FileMetadata,
            "HASHES" => TaskKind::Hashes,
            "PEINFO" => TaskKind::PeInfo,
            "VTSAMPLE" => TaskKind::VtSample,
            "YARA" => TaskKind::Yara,
            "ASSEMBLYAPP" => TaskKind::AssemblyApp,
            other => TaskKind::Other(other.to_owned()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            TaskKind::FileMetadata => "FILE_METADATA",
            TaskKind::Hashes => "HASHES",
            TaskKind::PeInfo => "PEINFO",
            TaskKind::VtSample => "VTSAMPLE",
            TaskKind::Yara => "YARA",
            TaskKind::AssemblyApp => "ASSEMBLYAPP",
            TaskKind::Other(name) => name,
        }
    }

    /// Whether an enricher invocation exists for this kind.
    ///
    /// `Hashes` and `PeInfo` are accepted on the wire but have no service
    /// behind them yet; they are treated like unknown kinds and never produce
    /// HTTP traffic.
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            TaskKind::FileMetadata | TaskKind::VtSample | TaskKind::Yara | TaskKind::AssemblyApp
        )
    }

    /// Routing key successful results of this kind are published under,
    /// for example `yara.result.static.zoo`.
    pub fn result_routing_key(&self) -> String {
        format!("{}.result.static.zoo", self.as_wire().to_ascii_lowercase())
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

struct TaskKindVisitor;

impl<'de> Visitor<'de> for TaskKindVisitor {
    type Value = TaskKind;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "the string representation of TaskKind")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(TaskKind::from_wire(s))
    }
}

/// Deserialize required to read `TaskKind` both as a value and as a map key.
impl<'de> Deserialize<'de> for TaskKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(TaskKindVisitor)
    }
}

impl Serialize for TaskKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_wire())
    }
}

/// One job as delivered on the work queue.
///
/// This is also the shape published back on the re-queue routing key when
/// some of a job's kinds failed: `tasks` then holds only the failed kinds and
/// `attempts` is carried through untouched. Bounding retries is the
/// producer's responsibility.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct WorkOrder {
    #[serde(rename = "primaryURI")]
    pub primary_uri: String,
    #[serde(rename = "secondaryURI")]
    pub secondary_uri: String,
    pub filename: String,
    pub tasks: HashMap<TaskKind, Vec<String>>,
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names_round_trip() {
        for name in [
            "FILE_METADATA",
            "HASHES",
            "PEINFO",
            "VTSAMPLE",
            "YARA",
            "ASSEMBLYAPP",
            "SOMETHING_ELSE",
        ] {
            assert_eq!(TaskKind::from_wire(name).as_wire(), name);
        }
    }

    #[test]
    fn test_runnable_kinds() {
        assert!(TaskKind::Yara.is_runnable());
        assert!(TaskKind::FileMetadata.is_runnable());
        assert!(TaskKind::VtSample.is_runnable());
        assert!(TaskKind::AssemblyApp.is_runnable());
        assert!(!TaskKind::Hashes.is_runnable());
        assert!(!TaskKind::PeInfo.is_runnable());
        assert!(!TaskKind::Other("FOO".to_owned()).is_runnable());
    }

    #[test]
    fn test_result_routing_key() {
        assert_eq!(TaskKind::Yara.result_routing_key(), "yara.result.static.zoo");
        assert_eq!(
            TaskKind::FileMetadata.result_routing_key(),
            "file_metadata.result.static.zoo"
        );
    }

    #[test]
    fn test_work_order_round_trip_preserves_all_fields() {
        let order = WorkOrder {
            primary_uri: "http://storage/sample".to_owned(),
            secondary_uri: "http://mirror/sample".to_owned(),
            filename: "x.exe".to_owned(),
            tasks: HashMap::from([
                (TaskKind::Yara, vec![]),
                (TaskKind::VtSample, vec!["/report".to_owned()]),
                (TaskKind::Other("FOO".to_owned()), vec!["a".to_owned()]),
            ]),
            attempts: 3,
        };

        let encoded = serde_json::to_string(&order).unwrap();
        let decoded: WorkOrder = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, order);
    }

    #[test]
    fn test_work_order_decodes_upstream_shape() {
        let raw = r#"{
            "primaryURI": "http://a/1",
            "secondaryURI": "http://a/1",
            "filename": "x.exe",
            "tasks": {"YARA": [], "FOO": ["bar"]},
            "attempts": 0
        }"#;

        let order: WorkOrder = serde_json::from_str(raw).unwrap();

        assert_eq!(order.primary_uri, "http://a/1");
        assert_eq!(order.filename, "x.exe");
        assert_eq!(order.attempts, 0);
        assert_eq!(order.tasks.get(&TaskKind::Yara), Some(&vec![]));
        assert_eq!(
            order.tasks.get(&TaskKind::Other("FOO".to_owned())),
            Some(&vec!["bar".to_owned()])
        );
    }

    #[test]
    fn test_work_order_rejects_shape_mismatch() {
        // Valid JSON, but not a work order.
        let raw = r#"{"hello": "world"}"#;
        assert!(serde_json::from_str::<WorkOrder>(raw).is_err());
    }
}
