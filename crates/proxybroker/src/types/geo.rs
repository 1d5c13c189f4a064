//! Geolocation record attached to a proxy. Country/region/city fields
//! sit behind a trait so a no-op implementation can stand in without
//! pulling in a MaxMind reader dependency nothing else in the workspace
//! needs.

use std::net::IpAddr;

use broker_core::Strng;

/// Country/region/city fields attached to a proxy, all optional since a
/// no-op or partial geo backend may not resolve every field.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GeoRecord {
	pub country_code: Option<Strng>,
	pub country_name: Option<Strng>,
	pub region_code: Option<Strng>,
	pub region_name: Option<Strng>,
	pub city: Option<Strng>,
}

/// Resolves geolocation for a proxy's IP. Implementations must not block
/// the calling task; a database-backed implementation should do its
/// lookup synchronously (MaxMind readers are in-memory mmaps) or offload
/// to `spawn_blocking`.
pub trait GeoIp: Send + Sync {
	fn lookup(&self, ip: IpAddr) -> GeoRecord;
}

/// Default backend: returns an empty record. Geolocation is populated
/// on a best-effort basis only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeoIp;

impl GeoIp for NoGeoIp {
	fn lookup(&self, _ip: IpAddr) -> GeoRecord {
		GeoRecord::default()
	}
}
