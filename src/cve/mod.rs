//! CVE correlation against a cve-search instance.
//!
//! [`CveClient`] fetches `GET {base}/api/search/{vendor}/{product}` and keeps
//! the raw payload in a [`ReportCache`](crate::cache::ReportCache). The
//! payload is parsed into a [`CveReport`], which maps versions to the CVEs
//! that list them as vulnerable.

mod client;
mod report;

pub use client::CveClient;
pub(crate) use client::USER_AGENT;
pub use report::{CveAccess, CveEntry, CveImpact, CveReport};
