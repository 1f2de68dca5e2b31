/*!
 * Memory-Usage Statistics
 * Per-sibling append-only file, one line per merge pass
 */

use crate::core::limits::STAT_BUFFER_CAPACITY;
use crate::core::types::SiblingId;
use log::{debug, warn};
use nix::unistd::gethostname;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// One snapshot of the node's memory picture, all byte totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemSnapshot {
    /// All private pages across siblings, plus local-heap footprints
    pub private_total: i64,
    /// Small-object allocator footprint across siblings
    pub local_heap_total: i64,
    /// This sibling's pages collapsed onto the zero frame
    pub zero_total: i64,
    /// Truly shared frames
    pub shared_total: i64,
    /// Hypothetical footprint were merging disabled
    pub unmerged_total: i64,
    /// Actual footprint with merging
    pub merged_total: i64,
}

impl MemSnapshot {
    /// The six space-separated counters, as written to the file
    pub fn line(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.private_total,
            self.local_heap_total,
            self.zero_total,
            self.shared_total,
            self.unmerged_total,
            self.merged_total
        )
    }
}

/// Buffered writer for `memusage.<hostname>.<rank>` (fallback
/// `memusage.<rank>` when the hostname is unavailable)
pub struct StatWriter {
    file: Option<File>,
    buffer: Vec<MemSnapshot>,
}

impl StatWriter {
    /// Open the per-sibling statistics file in `dir`
    pub fn open(dir: &Path, rank: SiblingId) -> Self {
        let name = match gethostname().ok().and_then(|h| h.into_string().ok()) {
            Some(host) => format!("memusage.{host}.{rank}"),
            None => format!("memusage.{rank}"),
        };
        let path = dir.join(name);
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                debug!("recording memory usage to {}", path.display());
                Some(file)
            }
            Err(err) => {
                warn!("cannot open {}: {err}, statistics disabled", path.display());
                None
            }
        };
        Self {
            file,
            buffer: Vec::with_capacity(STAT_BUFFER_CAPACITY),
        }
    }

    /// A writer that records nothing (merge disabled)
    pub fn disabled() -> Self {
        Self {
            file: None,
            buffer: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    /// Buffer one snapshot, flushing when the buffer fills
    pub fn record(&mut self, snapshot: MemSnapshot) {
        if self.file.is_none() {
            return;
        }
        self.buffer.push(snapshot);
        if self.buffer.len() >= STAT_BUFFER_CAPACITY {
            self.flush();
        }
    }

    /// Write all buffered snapshots out
    pub fn flush(&mut self) {
        let Some(file) = self.file.as_mut() else {
            self.buffer.clear();
            return;
        };
        for snapshot in self.buffer.drain(..) {
            if writeln!(file, "{}", snapshot.line()).is_err() {
                break;
            }
        }
        let _ = file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snapshot(seed: i64) -> MemSnapshot {
        MemSnapshot {
            private_total: seed,
            local_heap_total: seed + 1,
            zero_total: seed + 2,
            shared_total: seed + 3,
            unmerged_total: seed + 4,
            merged_total: seed + 5,
        }
    }

    #[test]
    fn test_line_format_is_six_space_separated_counters() {
        let line = snapshot(10).line();
        assert_eq!(line, "10 11 12 13 14 15");
        assert_eq!(line.split(' ').count(), 6);
    }

    #[test]
    fn test_writer_appends_one_line_per_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = StatWriter::open(dir.path(), 0);
        assert!(writer.is_enabled());

        writer.record(snapshot(0));
        writer.record(snapshot(100));
        writer.flush();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("memusage."), "{name}");
        assert!(name.ends_with(".0") || name == "memusage.0", "{name}");

        let contents = std::fs::read_to_string(&entries[0]).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines, vec!["0 1 2 3 4 5", "100 101 102 103 104 105"]);
    }

    #[test]
    fn test_disabled_writer_swallows_snapshots() {
        let mut writer = StatWriter::disabled();
        assert!(!writer.is_enabled());
        writer.record(snapshot(1));
        writer.flush();
        assert!(writer.buffer.is_empty());
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_string(&snapshot(5)).unwrap();
        let back: MemSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot(5));
    }
}
