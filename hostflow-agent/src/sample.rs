//! Hand-off point to the wire serializer.

use std::sync::Arc;

use crate::flush::MetricsSnapshot;

#[derive(Debug)]
pub struct SerializedSample {
    pub ts: u64,
    pub buffer: Vec<u8>,
}

/// Turns a metrics tree into the transport wire format. The production
/// implementation ships with the transport layer; the JSON handler below is
/// what the bundled binary and the tests use.
pub trait SampleHandler: Send + Sync {
    fn handle_uncompressed_sample(
        &self,
        ts: u64,
        metrics: &Arc<MetricsSnapshot>,
    ) -> anyhow::Result<SerializedSample>;
}

pub struct JsonSampleHandler;

impl SampleHandler for JsonSampleHandler {
    fn handle_uncompressed_sample(
        &self,
        ts: u64,
        metrics: &Arc<MetricsSnapshot>,
    ) -> anyhow::Result<SerializedSample> {
        let buffer = serde_json::to_vec(metrics.as_ref())?;
        Ok(SerializedSample { ts, buffer })
    }
}
