//! GarlicNet network database
//!
//! A Kademlia-flavored store of router descriptors and lease sets. One task
//! owns the maps; everything else reads through snapshots or sends query
//! messages. Closeness is the XOR metric against a daily-rotating routing
//! key, so the set of floodfills responsible for a given key migrates once
//! a day.

pub mod messages;
pub mod netdb;
pub mod profile;
pub mod requests;
pub mod routing_key;

pub use messages::{DatabaseLookupMsg, DatabaseSearchReplyMsg, DatabaseStoreMsg, LookupKind};
pub use netdb::{NetDb, NetDbError, NetDbEvent, NetDbSnapshot};
pub use profile::{ProfileStore, RouterProfile};
pub use requests::{LookupResult, RequestManager, RequestedDestination};
pub use routing_key::{routing_key, routing_key_for_day};

pub type Result<T> = std::result::Result<T, NetDbError>;
