extern crate bincode;
#[macro_use]
extern crate log;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate sha3;
extern crate thiserror;
extern crate time;

mod error;
mod key;
mod node;
mod overlay;
mod peer;
mod protocol;
mod rally;
mod routing;
mod session;
mod twiddle;

pub use self::error::{Error, OverlayError, Result};
pub use self::key::Key;
pub use self::node::node_data::NodeData;
pub use self::node::Node;
pub use self::overlay::{Overlay, OverlayHandle, UdpOverlay};
pub use self::peer::filter_valid;
pub use self::rally::{rally_point, tag_of, Tag};
pub use self::session::policy::{decide, Decision};
pub use self::session::{Event, Session, SessionOptions, State};
pub use self::twiddle::twiddle_march;

/// The number of bytes in a key.
const KEY_LENGTH: usize = 20;

/// The number of trailing key bytes shared by every member of a rally.
const TAG_LENGTH: usize = 2;

/// The number of leading key bits that relocation may change.
const MUTABLE_BITS: usize = (KEY_LENGTH - TAG_LENGTH) * 8;

/// The maximum length of the message in bytes.
const MESSAGE_LENGTH: usize = 8196;

/// The maximum number of k-buckets in the routing table.
const ROUTING_TABLE_SIZE: usize = KEY_LENGTH * 8;

/// The maximum number of entries in a k-bucket.
const REPLICATION_PARAM: usize = 20;

/// The maximum number of active RPCs during `lookup_nodes`.
const CONCURRENCY_PARAM: usize = 3;

/// Request timeout time in milliseconds
const REQUEST_TIMEOUT: u64 = 5000;

/// Bucket refresh interval in seconds
const BUCKET_REFRESH_INTERVAL: u64 = 3600;

/// Interval between searches for the rally point in seconds
pub const SEARCH_INTERVAL: u64 = 60;

/// The number of nodes close to the rally point considered on every search.
pub const RALLY_LOOKUP_COUNT: usize = 40;
