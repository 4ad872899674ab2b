//! Structured record export
//!
//! Turns a completed aggregation into the exported JSON array, one entry per
//! region ordered by index.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::geometry::normalize;
use crate::pipeline::aggregator::{AggregatedResult, RegionRecord};

/// Bounding box representation in the export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxFormat {
    /// `{x1, y1, x2, y2}` from the detector's normalized box
    #[default]
    Corners,
    /// `{x, y, width, height}` normalized from the pixel crop box
    Extent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExportBox {
    Corners { x1: f64, y1: f64, x2: f64, y2: f64 },
    Extent { x: f64, y: f64, width: f64, height: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportEntry {
    pub index: usize,
    pub label: String,
    pub ocr_text: String,
    pub bounding_box: ExportBox,
}

/// Consumer of completed aggregations
pub trait RecordSink: Send {
    fn publish(&mut self, result: &AggregatedResult);
    /// Forget anything published for a discarded image
    fn clear(&mut self) {}
}

/// Forwards completed aggregations over a channel
pub struct ChannelSink {
    tx: Sender<AggregatedResult>,
    /// Receiver clone used to take back records nobody consumed
    unread: Receiver<AggregatedResult>,
}

impl ChannelSink {
    /// Sink plus the receiving end for consumers
    pub fn channel() -> (Self, Receiver<AggregatedResult>) {
        let (tx, rx) = unbounded();
        let sink = Self {
            tx,
            unread: rx.clone(),
        };
        (sink, rx)
    }
}

impl RecordSink for ChannelSink {
    fn publish(&mut self, result: &AggregatedResult) {
        if self.tx.send(result.clone()).is_err() {
            debug!("Record receiver gone; dropping result {}", result.ticket);
        }
    }

    fn clear(&mut self) {
        let discarded = self.unread.try_iter().count();
        if discarded > 0 {
            debug!("Discarded {} unread record(s)", discarded);
        }
    }
}

fn round_to(value: f32, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value as f64 * factor).round() / factor
}

/// Newlines collapse to single spaces
pub fn collapse_newlines(text: &str) -> String {
    text.split(['\n', '\r'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn export_box(record: &RegionRecord, image_size: (u32, u32), format: BoxFormat, decimals: u32) -> ExportBox {
    match format {
        BoxFormat::Corners => {
            let b = &record.normalized_box;
            ExportBox::Corners {
                x1: round_to(b.x1, decimals),
                y1: round_to(b.y1, decimals),
                x2: round_to(b.x2, decimals),
                y2: round_to(b.y2, decimals),
            }
        }
        BoxFormat::Extent => {
            let b = normalize(&record.pixel_box, image_size.0, image_size.1);
            ExportBox::Extent {
                x: round_to(b.x1, decimals),
                y: round_to(b.y1, decimals),
                width: round_to(b.x2 - b.x1, decimals),
                height: round_to(b.y2 - b.y1, decimals),
            }
        }
    }
}

/// Exported entries, ordered by index
pub fn to_entries(result: &AggregatedResult, format: BoxFormat, decimals: u32) -> Vec<ExportEntry> {
    let mut entries: Vec<ExportEntry> = result
        .records
        .iter()
        .map(|record| ExportEntry {
            index: record.index,
            label: record.label.clone(),
            ocr_text: collapse_newlines(&record.ocr_text),
            bounding_box: export_box(record, result.image_size, format, decimals),
        })
        .collect();
    entries.sort_by_key(|e| e.index);
    entries
}

pub fn to_json(result: &AggregatedResult, format: BoxFormat, decimals: u32) -> Result<String> {
    Ok(serde_json::to_string_pretty(&to_entries(result, format, decimals))?)
}

pub fn write_json(result: &AggregatedResult, format: BoxFormat, decimals: u32, path: &Path) -> Result<()> {
    let json = to_json(result, format, decimals)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write record to {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Epoch;
    use crate::geometry::{NormalizedBox, PixelBox};
    use crate::pipeline::aggregator::SessionTicket;

    fn result() -> AggregatedResult {
        AggregatedResult {
            ticket: SessionTicket { epoch: Epoch(1), session: 1 },
            inference_time_ms: 9,
            image_size: (200, 100),
            records: vec![
                RegionRecord {
                    index: 1,
                    label: "exit".into(),
                    ocr_text: "N/A".into(),
                    normalized_box: NormalizedBox::new(0.5, 0.5, 1.0, 1.0),
                    pixel_box: PixelBox { x1: 100, y1: 50, x2: 200, y2: 100 },
                },
                RegionRecord {
                    index: 0,
                    label: "stop".into(),
                    ocr_text: "STOP\nHERE".into(),
                    normalized_box: NormalizedBox::new(0.123456, 0.0, 0.333333, 0.25),
                    pixel_box: PixelBox { x1: 25, y1: 0, x2: 67, y2: 25 },
                },
            ],
        }
    }

    #[test]
    fn test_entries_sorted_and_text_collapsed() {
        let entries = to_entries(&result(), BoxFormat::Corners, 4);
        assert_eq!(entries[0].index, 0);
        assert_eq!(entries[0].ocr_text, "STOP HERE");
        assert_eq!(entries[1].ocr_text, "N/A");
    }

    #[test]
    fn test_corners_rounded_to_four_decimals() {
        let json: serde_json::Value = serde_json::from_str(&to_json(&result(), BoxFormat::Corners, 4).unwrap()).unwrap();
        let bbox = &json[0]["bounding_box"];
        assert_eq!(bbox["x1"].as_f64().unwrap(), 0.1235);
        assert_eq!(bbox["x2"].as_f64().unwrap(), 0.3333);
        assert_eq!(json[0]["label"], "stop");
        assert!(bbox.get("width").is_none());
    }

    #[test]
    fn test_extent_from_pixel_box() {
        let entries = to_entries(&result(), BoxFormat::Extent, 4);
        assert_eq!(
            entries[1].bounding_box,
            ExportBox::Extent { x: 0.5, y: 0.5, width: 0.5, height: 0.5 }
        );
        let ExportBox::Extent { width, .. } = entries[0].bounding_box else {
            panic!("expected extent");
        };
        assert_eq!(width, 0.21);
    }

    #[test]
    fn test_collapse_newlines() {
        assert_eq!(collapse_newlines("a\nb\r\nc"), "a b c");
        assert_eq!(collapse_newlines("single"), "single");
    }

    #[test]
    fn test_channel_sink_publishes() {
        let (mut sink, rx) = ChannelSink::channel();
        sink.publish(&result());
        assert_eq!(rx.try_recv().unwrap().inference_time_ms, 9);
    }

    #[test]
    fn test_channel_sink_clear_discards_unread() {
        let (mut sink, rx) = ChannelSink::channel();
        sink.publish(&result());
        sink.publish(&result());
        sink.clear();
        assert!(rx.try_recv().is_err());

        sink.publish(&result());
        assert_eq!(rx.try_recv().unwrap().ticket.epoch, Epoch(1));
    }
}
