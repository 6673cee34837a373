use std::io::Write;

use crate::{util, worker::ProgressEvent};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadStatistics {
    pub bytes_downloaded: u64,
    pub segments_downloaded: u64,
    pub segments_failed: u64,
    pub segments_total: u64,
    pub first_chunk_bytes: Option<u64>,
}

impl DownloadStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started { total_chunks } => self.segments_total = *total_chunks as u64,
            ProgressEvent::ChunkCompleted {
                bytes,
                first_chunk_bytes,
                ..
            } => {
                self.segments_downloaded += 1;
                self.bytes_downloaded += bytes;
                self.first_chunk_bytes.get_or_insert(*first_chunk_bytes);
            }
            ProgressEvent::ChunkFailed { .. } => self.segments_failed += 1,
            ProgressEvent::State(_) => (),
        }
    }

    /// Rough size of the whole download, assuming every chunk is as large as
    /// the first one.
    pub fn estimated_total_bytes(&self) -> Option<u64> {
        self.first_chunk_bytes.map(|b| b * self.segments_total)
    }

    pub fn print(&self) {
        let estimate = self
            .estimated_total_bytes()
            .map(|b| format!(" of ~{}", util::format_bytes(b)))
            .unwrap_or_default();
        print!(
            "\x1b[2K\rDownloaded {} of {} segments, {} failed ({}{})",
            self.segments_downloaded,
            self.segments_total,
            self.segments_failed,
            util::format_bytes(self.bytes_downloaded),
            estimate,
        );
        let _ = std::io::stdout().lock().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_events() {
        let mut stats = DownloadStatistics::new();
        stats.apply(&ProgressEvent::Started { total_chunks: 10 });
        assert_eq!(stats.estimated_total_bytes(), None);

        stats.apply(&ProgressEvent::ChunkCompleted {
            index: 3,
            bytes: 100,
            first_chunk_bytes: 100,
        });
        stats.apply(&ProgressEvent::ChunkCompleted {
            index: 1,
            bytes: 120,
            first_chunk_bytes: 100,
        });
        stats.apply(&ProgressEvent::ChunkFailed {
            index: 2,
            attempts: 5,
        });

        assert_eq!(stats.segments_downloaded, 2);
        assert_eq!(stats.segments_failed, 1);
        assert_eq!(stats.bytes_downloaded, 220);
        assert_eq!(stats.estimated_total_bytes(), Some(1000));
    }
}
