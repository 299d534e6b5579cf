//! Shared policy model for focuswall.
//!
//! Everything in this crate is pure: no file, network or process access.
//! Temporal evaluation always takes the current time as an argument so the
//! enforcer, the watchdog and the CLI agree on what "now" means.

#[cfg(feature = "serde")]
extern crate serde;

pub mod domain;
pub mod list;
pub mod packet;
pub mod policy;
pub mod schedule;
pub mod session;

pub use domain::{clean_domain, clean_domains};
pub use list::BlockList;
pub use packet::{ipv4_endpoints, Ipv4Endpoints, MIN_IPV4_HEADER_LEN};
pub use policy::{PolicyError, PolicyState, DEFAULT_MAX_ACTIVE_SECS};
pub use schedule::ScheduleItem;
pub use session::BlockSession;
