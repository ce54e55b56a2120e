//! Subvolume graph records and the metadata header exchanged during
//! migration and stored inside optimized backups.

use serde::{Deserialize, Serialize};

/// One entry in a volume's subvolume graph.
///
/// The wire and manifest field names are fixed; both the migration JSON
/// header and the backup YAML manifest share this shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subvolume {
    /// Snapshot short name this subvolume belongs to; empty for the main volume.
    #[serde(rename = "Snapshot")]
    pub snapshot: String,

    /// Path relative to the volume root; `"/"` for the root subvolume.
    #[serde(rename = "Path")]
    pub path: String,

    /// Whether the subvolume is read-only.
    #[serde(rename = "Readonly")]
    pub readonly: bool,

    /// Subvolume UUID.
    #[serde(rename = "UUID", default)]
    pub uuid: String,

    /// UUID imprinted when the subvolume was materialized from a receive
    /// stream; empty otherwise.
    #[serde(rename = "ReceivedUUID", default)]
    pub received_uuid: String,
}

impl Subvolume {
    /// Whether this is the root subvolume of its volume.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.path == "/"
    }
}

/// Ordered sequence of subvolume records describing a volume and its
/// snapshots, or on the reverse migration leg the subset the receiver
/// still needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDataHeader {
    #[serde(rename = "Subvolumes")]
    pub subvolumes: Vec<Subvolume>,
}

impl MetaDataHeader {
    /// Subvolumes belonging to the given snapshot short name (empty string
    /// selects the main volume's subvolumes).
    pub fn for_snapshot<'a>(&'a self, snapshot: &'a str) -> impl Iterator<Item = &'a Subvolume> {
        self.subvolumes.iter().filter(move |s| s.snapshot == snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let header = MetaDataHeader {
            subvolumes: vec![Subvolume {
                snapshot: "s1".to_string(),
                path: "/".to_string(),
                readonly: true,
                uuid: "c8f8bd5d-0000-0000-0000-000000000001".to_string(),
                received_uuid: String::new(),
            }],
        };

        let json = serde_json::to_value(&header).unwrap();
        let entry = &json["Subvolumes"][0];
        assert_eq!(entry["Snapshot"], "s1");
        assert_eq!(entry["Path"], "/");
        assert_eq!(entry["Readonly"], true);
        assert_eq!(entry["UUID"], "c8f8bd5d-0000-0000-0000-000000000001");
        assert_eq!(entry["ReceivedUUID"], "");
    }

    #[test]
    fn test_json_yaml_round_trip() {
        let header = MetaDataHeader {
            subvolumes: vec![
                Subvolume { snapshot: String::new(), path: "/".to_string(), ..Default::default() },
                Subvolume {
                    snapshot: String::new(),
                    path: "/data".to_string(),
                    readonly: true,
                    ..Default::default()
                },
            ],
        };

        let json = serde_json::to_string(&header).unwrap();
        let from_json: MetaDataHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(from_json, header);

        let yaml = serde_yaml::to_string(&header).unwrap();
        let from_yaml: MetaDataHeader = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(from_yaml, header);
    }

    #[test]
    fn test_for_snapshot_filter() {
        let header = MetaDataHeader {
            subvolumes: vec![
                Subvolume { snapshot: "s1".into(), path: "/".into(), ..Default::default() },
                Subvolume { snapshot: String::new(), path: "/".into(), ..Default::default() },
                Subvolume { snapshot: String::new(), path: "/data".into(), ..Default::default() },
            ],
        };

        assert_eq!(header.for_snapshot("s1").count(), 1);
        assert_eq!(header.for_snapshot("").count(), 2);
    }
}
