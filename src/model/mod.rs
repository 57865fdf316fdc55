//! Core data types shared by the collectors.
//!
//! - [`DiscoveredVersion`] - a tag or release found upstream, after filtering
//!
//! # Example
//!
//! ```
//! use apprelease_exporter::model::DiscoveredVersion;
//!
//! let version = DiscoveredVersion::new("v1.2.0", "1.2.0");
//! assert!(version.created_at.is_none());
//! ```

mod release;

pub use release::*;
