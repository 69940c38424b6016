//! Typed records decoded from restic's `--json` output

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// restic emits `null` rather than `[]` for empty lists
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<Vec<T>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupKey {
    #[serde(default)]
    pub hostname: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub paths: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tags: Vec<String>,
}

impl GroupKey {
    /// Value of the `path` metric label
    pub fn path_label(&self) -> String {
        self.paths.join(",")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub paths: Vec<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub tree: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GroupedSnapshots {
    #[serde(rename = "group_key")]
    pub key: GroupKey,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub snapshots: Vec<Snapshot>,
}

impl GroupedSnapshots {
    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.iter().max_by_key(|s| s.time)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RestoreSizeStats {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_file_count: u64,
    #[serde(default, rename = "snapshots_count")]
    pub snapshot_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawDataStats {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_uncompressed_size: u64,
    #[serde(default)]
    pub compression_ratio: f64,
    #[serde(default)]
    pub compression_progress: f64,
    #[serde(default)]
    pub compression_space_saving: f64,
    #[serde(default)]
    pub total_blob_count: u64,
    #[serde(default, rename = "snapshots_count")]
    pub snapshot_count: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetentionReason {
    pub snapshot: Snapshot,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub matches: Vec<String>,
}

/// Outcome of a retention pass for one (host, paths) group
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ForgetGroup {
    #[serde(rename = "host", default)]
    pub hostname: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub paths: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub keep: Vec<Snapshot>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub remove: Vec<Snapshot>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub reasons: Vec<RetentionReason>,
}

/// Retention policy applied by `restic forget`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub last_n: u32,
    #[serde(default)]
    pub hourly: u32,
    #[serde(default)]
    pub daily: u32,
    #[serde(default)]
    pub weekly: u32,
    #[serde(default)]
    pub monthly: u32,
    #[serde(default)]
    pub yearly: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl RetentionPolicy {
    /// Command line arguments for `restic forget`, zero counts are omitted
    pub fn to_args(&self) -> Vec<String> {
        let counts = [
            ("--keep-last", self.last_n),
            ("--keep-hourly", self.hourly),
            ("--keep-daily", self.daily),
            ("--keep-weekly", self.weekly),
            ("--keep-monthly", self.monthly),
            ("--keep-yearly", self.yearly),
        ];

        let mut args = Vec::new();
        for (flag, count) in counts {
            if count > 0 {
                args.push(flag.to_string());
                args.push(count.to_string());
            }
        }
        for tag in &self.tags {
            args.push("--keep-tag".to_string());
            args.push(tag.clone());
        }
        args
    }

    pub fn is_empty(&self) -> bool {
        self.to_args().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_retention_args_order() {
        let policy = RetentionPolicy {
            last_n: 3,
            daily: 7,
            yearly: 1,
            tags: vec!["keep".to_string(), "golden".to_string()],
            ..Default::default()
        };

        assert_eq!(
            policy.to_args(),
            vec![
                "--keep-last", "3", "--keep-daily", "7", "--keep-yearly", "1", "--keep-tag",
                "keep", "--keep-tag", "golden",
            ]
        );
    }

    #[test]
    fn test_empty_retention_has_no_args() {
        assert!(RetentionPolicy::default().is_empty());
    }

    #[quickcheck]
    fn prop_retention_arg_count(counts: (u32, u32, u32, u32, u32, u32), tags: Vec<String>) -> bool {
        let policy = RetentionPolicy {
            last_n: counts.0,
            hourly: counts.1,
            daily: counts.2,
            weekly: counts.3,
            monthly: counts.4,
            yearly: counts.5,
            tags: tags.clone(),
        };
        let nonzero = [counts.0, counts.1, counts.2, counts.3, counts.4, counts.5]
            .iter()
            .filter(|c| **c > 0)
            .count();

        policy.to_args().len() == 2 * (nonzero + tags.len())
    }

    #[test]
    fn test_forget_group_decodes_null_lists() {
        let json = r#"[{
            "tags": null,
            "host": "web-1",
            "paths": ["/srv", "/etc"],
            "keep": [{"id": "aaa", "short_id": "aaa", "time": "2024-03-01T10:00:00.123456789+01:00", "tree": "t1"}],
            "remove": null,
            "reasons": []
        }]"#;

        let groups: Vec<ForgetGroup> = serde_json::from_str(json).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].hostname, "web-1");
        assert_eq!(groups[0].paths, vec!["/srv", "/etc"]);
        assert_eq!(groups[0].keep.len(), 1);
        assert!(groups[0].remove.is_empty());
    }

    #[test]
    fn test_latest_snapshot_by_time() {
        let json = r#"{
            "group_key": {"hostname": "db", "paths": ["/var/lib/pg"], "tags": null},
            "snapshots": [
                {"id": "b", "time": "2024-01-02T00:00:00Z"},
                {"id": "c", "time": "2024-01-03T00:00:00Z"},
                {"id": "a", "time": "2024-01-01T00:00:00Z"}
            ]
        }"#;

        let group: GroupedSnapshots = serde_json::from_str(json).unwrap();
        assert_eq!(group.key.path_label(), "/var/lib/pg");
        assert_eq!(group.latest().map(|s| s.id.as_str()), Some("c"));
    }

    #[test]
    fn test_raw_stats_tolerates_missing_fields() {
        let stats: RawDataStats =
            serde_json::from_str(r#"{"total_size": 1024, "total_blob_count": 9}"#).unwrap();
        assert_eq!(stats.total_size, 1024);
        assert_eq!(stats.total_blob_count, 9);
        assert_eq!(stats.total_uncompressed_size, 0);
    }
}
