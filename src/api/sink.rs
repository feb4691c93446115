//! Output sink descriptors carried by requests.

use serde::{Deserialize, Serialize};

/// Where job output should be delivered.
///
/// A request may name any number of sinks; feature collections are written
/// to object-store sinks as one GeoJSON document per job and streamed to bus
/// sinks in batches as regions complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutputSink {
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: String,
    },
    Kinesis {
        stream: String,
        /// Features per PutRecords batch; the service default applies when
        /// absent.
        #[serde(rename = "batchSize", default, skip_serializing_if = "Option::is_none")]
        batch_size: Option<usize>,
    },
}
