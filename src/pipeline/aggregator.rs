//! Region Aggregator
//!
//! Scatter/gather over the regions of one detection result. Opening a
//! session crops every region and hands back one recognition request per
//! region; each outcome is fed back through [`RegionAggregator::resolve`]
//! in any order. The session closes, and its result is returned, on exactly
//! the resolution that accounts for the last region.
//!
//! Every request carries a [`SessionTicket`]. Outcomes whose ticket does not
//! match the open session (abandoned, superseded, or never opened) are
//! dropped without touching any state.

use image::RgbaImage;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

use crate::capture::{Epoch, SourceImage};
use crate::geometry::{to_pixel_box, NormalizedBox, PixelBox};
use crate::vision::{DetectionResult, RecognitionError};

/// Text recorded for a region whose recognition failed or found nothing
pub const NOT_AVAILABLE: &str = "N/A";

/// Identity of one aggregation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionTicket {
    /// Image the session was opened against
    pub epoch: Epoch,
    /// Unique per session, even for the same image
    pub session: u64,
}

impl fmt::Display for SessionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.epoch, self.session)
    }
}

/// One recognition request, carrying its own copy of the crop
#[derive(Debug, Clone)]
pub struct RegionRequest {
    pub ticket: SessionTicket,
    pub index: usize,
    pub crop: RgbaImage,
}

/// Outcome for one region
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionRecord {
    /// Position in the originating detection result
    pub index: usize,
    pub label: String,
    /// Recognized text or `"N/A"`
    pub ocr_text: String,
    pub normalized_box: NormalizedBox,
    pub pixel_box: PixelBox,
}

/// Everything recognized for one detection result, ordered by index
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedResult {
    pub ticket: SessionTicket,
    pub inference_time_ms: u64,
    pub image_size: (u32, u32),
    pub records: Vec<RegionRecord>,
}

impl AggregatedResult {
    /// One line per region: `"<n>. <label> - <text>"`
    pub fn summary(&self) -> String {
        self.records
            .iter()
            .map(|r| format!("{}. {} - {}", r.index + 1, r.label, r.ocr_text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Why an outcome was ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No session is open
    NoSession,
    /// The outcome belongs to an abandoned or superseded session
    Stale,
    /// The region was already resolved
    Duplicate,
    /// The index is not part of the session
    UnknownRegion,
}

/// What a call to `resolve` did
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Dropped(DropReason),
    /// Recorded; other regions are still pending
    Recorded(RegionRecord),
    /// Recorded the last pending region; the session is closed
    Completed {
        record: RegionRecord,
        result: AggregatedResult,
    },
}

/// Map a recognizer outcome to the text stored for the region
pub fn text_or_not_available(outcome: &Result<String, RecognitionError>) -> String {
    match outcome {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        _ => NOT_AVAILABLE.to_string(),
    }
}

struct Region {
    label: String,
    normalized_box: NormalizedBox,
    pixel_box: PixelBox,
    resolved: bool,
}

struct Session {
    ticket: SessionTicket,
    regions: Vec<Region>,
    completed: usize,
    /// Arrival order
    records: Vec<RegionRecord>,
    inference_time_ms: u64,
    image_size: (u32, u32),
}

impl Session {
    fn total(&self) -> usize {
        self.regions.len()
    }
}

/// Owner of the (at most one) open aggregation session
#[derive(Default)]
pub struct RegionAggregator {
    next_session: u64,
    open: Option<Session>,
}

impl RegionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for `result` computed against `image`.
    ///
    /// Any open session is abandoned first. An empty result opens nothing.
    pub fn open(&mut self, image: &SourceImage, result: &DetectionResult) -> Vec<RegionRequest> {
        self.abandon();

        if result.is_empty() {
            return Vec::new();
        }

        self.next_session += 1;
        let ticket = SessionTicket {
            epoch: image.epoch,
            session: self.next_session,
        };
        let (width, height) = image.dimensions();

        let mut regions = Vec::with_capacity(result.len());
        let mut requests = Vec::with_capacity(result.len());
        for (index, detection) in result.detections.iter().enumerate() {
            let pixel_box = to_pixel_box(&detection.bbox, width, height);
            requests.push(RegionRequest {
                ticket,
                index,
                crop: image.crop(&pixel_box),
            });
            regions.push(Region {
                label: detection.label.clone(),
                normalized_box: detection.bbox,
                pixel_box,
                resolved: false,
            });
        }

        info!("Session {} opened with {} regions", ticket, regions.len());
        self.open = Some(Session {
            ticket,
            regions,
            completed: 0,
            records: Vec::new(),
            inference_time_ms: result.inference_time_ms,
            image_size: (width, height),
        });

        requests
    }

    /// Feed back the outcome for one region
    pub fn resolve(
        &mut self,
        ticket: SessionTicket,
        index: usize,
        outcome: Result<String, RecognitionError>,
    ) -> Resolution {
        let Some(session) = self.open.as_mut() else {
            debug!("Outcome for {} region {} with no open session", ticket, index);
            return Resolution::Dropped(DropReason::NoSession);
        };
        if session.ticket != ticket {
            debug!("Stale outcome for {} region {} dropped", ticket, index);
            return Resolution::Dropped(DropReason::Stale);
        }
        let Some(region) = session.regions.get_mut(index) else {
            return Resolution::Dropped(DropReason::UnknownRegion);
        };
        if region.resolved {
            return Resolution::Dropped(DropReason::Duplicate);
        }
        region.resolved = true;

        let record = RegionRecord {
            index,
            label: region.label.clone(),
            ocr_text: text_or_not_available(&outcome),
            normalized_box: region.normalized_box,
            pixel_box: region.pixel_box,
        };
        session.records.push(record.clone());
        session.completed += 1;

        if session.completed < session.total() {
            return Resolution::Recorded(record);
        }

        // the transition to completed == total; take() makes it the only one
        let Some(session) = self.open.take() else {
            return Resolution::Recorded(record);
        };
        let mut records = session.records;
        records.sort_by_key(|r| r.index);
        info!("Session {} complete", session.ticket);

        Resolution::Completed {
            record,
            result: AggregatedResult {
                ticket: session.ticket,
                inference_time_ms: session.inference_time_ms,
                image_size: session.image_size,
                records,
            },
        }
    }

    /// Drop the open session, if any. Later outcomes for it are ignored.
    pub fn abandon(&mut self) -> bool {
        match self.open.take() {
            Some(session) => {
                info!(
                    "Session {} abandoned with {}/{} regions resolved",
                    session.ticket,
                    session.completed,
                    session.total()
                );
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Regions still waiting in the open session
    pub fn pending(&self) -> usize {
        self.open
            .as_ref()
            .map(|s| s.total() - s.completed)
            .unwrap_or(0)
    }

}
