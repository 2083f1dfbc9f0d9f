pub use crate::asset::{Asset, AssetTree, EventSink, MapEvent};
pub use crate::client::{Client, ClientConfig, Target};
pub use crate::csp::{Csp, ViewKind};
pub use crate::dispatch::{Dispatcher, EventKind};
pub use crate::evloop::{EventLoop, Priority, Pump};
pub use crate::net::channel::{Channel, ChannelId, ChannelState};
pub use crate::net::endpoint::{ConnectionChange, Endpoint};
pub use crate::repl::hub::{PeerSession, SessionState, StreamPump};
pub use crate::repl::iter::ModIter;
pub use crate::repl::state::{ApplyOutcome, ReplicatedMap, ReplicationEntry, MAX_PEERS};
pub use crate::subs::SubRegistry;
pub use crate::wire::{Document, Value, WireFormat};
