use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One command dispatched to a reader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub timestamp: DateTime<Utc>,
    pub reader: String,
    pub kind: DispatchKind,
    pub input: Vec<u8>,
    pub output: Vec<u8>,
    pub outcome: String,
    pub success: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchKind {
    Ecm { caid: u16, provid: u32, srvid: u16 },
    Emm,
    RawCmd,
}

/// Log of dispatched commands
#[derive(Debug, Clone, Default)]
pub struct DispatchHistory {
    records: Vec<DispatchRecord>,
}

impl DispatchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: DispatchRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[DispatchRecord] {
        &self.records
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Append another reader's history
    pub fn merge(&mut self, other: DispatchHistory) {
        self.records.extend(other.records);
        self.records.sort_by_key(|r| r.timestamp);
    }

    pub fn export_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.records).context("Failed to serialize dispatch history")
    }

    pub fn import_json(&mut self, json: &str) -> Result<()> {
        let imported: Vec<DispatchRecord> =
            serde_json::from_str(json).context("Failed to deserialize dispatch history")?;
        self.records.extend(imported);
        Ok(())
    }

    pub fn statistics(&self) -> DispatchStatistics {
        let total = self.records.len();
        let successful = self.records.iter().filter(|r| r.success).count();
        let count = |kind: fn(&DispatchKind) -> bool| self.records.iter().filter(|r| kind(&r.kind)).count();

        let average_duration_ms = if total > 0 {
            self.records.iter().map(|r| r.duration_ms).sum::<u64>() / total as u64
        } else {
            0
        };

        DispatchStatistics {
            total,
            successful,
            failed: total - successful,
            ecm: count(|k| matches!(k, DispatchKind::Ecm { .. })),
            emm: count(|k| matches!(k, DispatchKind::Emm)),
            raw: count(|k| matches!(k, DispatchKind::RawCmd)),
            average_duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchStatistics {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub ecm: usize,
    pub emm: usize,
    pub raw: usize,
    pub average_duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: DispatchKind, success: bool, duration_ms: u64) -> DispatchRecord {
        DispatchRecord {
            timestamp: Utc::now(),
            reader: "sci0".to_string(),
            kind,
            input: vec![0x80, 0x70, 0x01],
            output: Vec::new(),
            outcome: if success { "Found" } else { "NotFound" }.to_string(),
            success,
            duration_ms,
        }
    }

    #[test]
    fn test_statistics_empty() {
        let stats = DispatchHistory::new().statistics();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.average_duration_ms, 0);
    }

    #[test]
    fn test_statistics() {
        let mut history = DispatchHistory::new();
        history.record(record(
            DispatchKind::Ecm {
                caid: 0x0500,
                provid: 0x023800,
                srvid: 0x1234,
            },
            true,
            20,
        ));
        history.record(record(DispatchKind::Emm, false, 30));
        history.record(record(DispatchKind::RawCmd, true, 10));

        let stats = history.statistics();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!((stats.ecm, stats.emm, stats.raw), (1, 1, 1));
        assert_eq!(stats.average_duration_ms, 20);

        history.clear();
        assert!(history.records().is_empty());
    }

    #[test]
    fn test_export_import() {
        let mut history = DispatchHistory::new();
        history.record(record(DispatchKind::Emm, true, 5));
        let json = history.export_json().unwrap();
        assert!(json.contains("Emm"));

        let mut imported = DispatchHistory::new();
        imported.import_json(&json).unwrap();
        assert_eq!(imported.records().len(), 1);
        assert_eq!(imported.records()[0].kind, DispatchKind::Emm);

        assert!(imported.import_json("not json").is_err());
        assert_eq!(DispatchHistory::new().export_json().unwrap().trim(), "[]");
    }

    #[test]
    fn test_merge_orders_by_time() {
        let mut a = DispatchHistory::new();
        let mut first = record(DispatchKind::Emm, true, 1);
        first.timestamp = Utc::now() - chrono::Duration::seconds(10);
        let second = record(DispatchKind::RawCmd, true, 1);
        a.record(second);
        let mut b = DispatchHistory::new();
        b.record(first);
        a.merge(b);
        assert_eq!(a.records()[0].kind, DispatchKind::Emm);
    }
}
