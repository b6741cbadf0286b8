//! # Shared Echo Types
//!
//! Capabilities and constants shared by the server pipeline and its clients.
//!
//! ## Timestamp ownership
//!
//! Each lifecycle milestone of an [`EchoResponse`] is written by exactly one
//! pipeline stage:
//!
//! | field                  | owner                      |
//! |------------------------|----------------------------|
//! | `received_at`          | call recorder (on arrival) |
//! | `handler_reached_at`   | echo handler (on entry)    |
//! | `handler_responded_at` | echo handler (on return)   |
//! | `sent_at`              | call recorder (on exit)    |
//!
//! Every setter is write-once: a second write to the same milestone is
//! ignored, so a stage can never overwrite another stage's observation.

use crate::proto::EchoResponse;
use prost_types::Timestamp;
use std::time::SystemTime;

/// Fully qualified name of the echo service, as registered with the health
/// registry and the reflection service.
pub const ECHO_SERVICE_NAME: &str = crate::proto::echo_service_server::SERVICE_NAME;

/// Health registry key reporting the status of the server as a whole.
pub const OVERALL_HEALTH: &str = "";

/// A response that records when it entered and left the server pipeline.
///
/// Implemented by response types whose routes carry the call recorder. Routes
/// whose responses do not implement it cannot be wrapped by the recorder.
pub trait Timestamped {
    /// Records the moment the call arrived. Ignored if already set.
    fn stamp_received(&mut self, at: SystemTime);

    /// Records the moment the response was handed back to the transport.
    /// Ignored if already set.
    fn stamp_sent(&mut self, at: SystemTime);
}

impl Timestamped for EchoResponse {
    fn stamp_received(&mut self, at: SystemTime) {
        self.received_at.get_or_insert_with(|| Timestamp::from(at));
    }

    fn stamp_sent(&mut self, at: SystemTime) {
        self.sent_at.get_or_insert_with(|| Timestamp::from(at));
    }
}

impl EchoResponse {
    /// Records the moment the echo handler started. Ignored if already set.
    pub fn stamp_handler_reached(&mut self, at: SystemTime) {
        self.handler_reached_at
            .get_or_insert_with(|| Timestamp::from(at));
    }

    /// Records the moment the echo handler finished. Ignored if already set.
    pub fn stamp_handler_responded(&mut self, at: SystemTime) {
        self.handler_responded_at
            .get_or_insert_with(|| Timestamp::from(at));
    }

    /// Returns the four lifecycle milestones in pipeline order, if all are
    /// present.
    pub fn milestones(&self) -> Option<[SystemTime; 4]> {
        let convert = |ts: &Option<Timestamp>| {
            ts.as_ref()
                .and_then(|ts| SystemTime::try_from(ts.clone()).ok())
        };
        Some([
            convert(&self.received_at)?,
            convert(&self.handler_reached_at)?,
            convert(&self.handler_responded_at)?,
            convert(&self.sent_at)?,
        ])
    }
}
