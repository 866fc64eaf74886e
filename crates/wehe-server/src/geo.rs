//! Contract with the external reverse geocoder.
//!
//! The GeoNames ingestion tool and the k-d-tree lookup live outside this
//! server; all the session layer needs is "nearest city for a coordinate".
//! Deployments without the dataset plug in [`NoReverseGeocoder`] and mobile
//! stats pass through without location annotation.

#[derive(Debug, Clone, PartialEq)]
pub struct GeoLocation {
    pub city: String,
    pub country: String,
    /// IANA time zone name, e.g. `America/New_York`.
    pub time_zone: String,
}

pub trait ReverseGeocoder: Send + Sync {
    /// Resolve a coordinate to the closest known city, or `None` when no
    /// dataset is available.
    fn locate(&self, latitude: f64, longitude: f64) -> anyhow::Result<Option<GeoLocation>>;
}

/// Geocoder used when no city dataset is configured.
#[derive(Debug, Default)]
pub struct NoReverseGeocoder;

impl ReverseGeocoder for NoReverseGeocoder {
    fn locate(&self, _latitude: f64, _longitude: f64) -> anyhow::Result<Option<GeoLocation>> {
        Ok(None)
    }
}
