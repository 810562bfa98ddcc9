pub mod auth;
pub mod blobs;
pub mod manifests;
pub mod models;
pub mod routes;
pub mod signatures;

use opentelemetry::metrics::{Counter, Histogram, Meter, Unit};

/// Set on every registry response.
pub const API_VERSION_HEADER: &str = "Docker-Distribution-Api-Version";
pub const API_VERSION: &str = "registry/2.0";

/// Set on blob and manifest responses.
pub const CONTENT_DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Set on upload responses.
pub const UPLOAD_UUID_HEADER: &str = "Docker-Upload-UUID";

/// Advertises the signature API extension on authenticated resources.
pub const SIGNATURES_HEADER: &str = "X-Registry-Supports-Signatures";

/// Request-level metrics shared across handlers.
pub struct AppMetrics {
    pub request_counter: Counter<u64>,
    pub blob_size_histogram: Histogram<f64>,
}

impl AppMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            request_counter: meter
                .u64_counter("registry_requests_total")
                .with_description("Total number of registry API requests")
                .with_unit(Unit::new("requests"))
                .init(),
            blob_size_histogram: meter
                .f64_histogram("content_size_bytes")
                .with_description("Size of served and stored content")
                .with_unit(Unit::new("bytes"))
                .init(),
        }
    }
}
