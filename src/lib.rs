//! Webhook relay and delivery toolkit.
//!
//! - [`http_server`]: relay that accepts provider webhooks on a channel and
//!   fans them out to SSE subscribers through the [`broker`]
//! - [`consumer`] and [`legacy`]: clients that follow a relay and re-deliver
//!   each webhook to a local target
//! - [`poller`]: upstream commit polling with persisted state ([`store`])
//! - [`replay`]: re-sends historical hook deliveries from the GitHub API
//! - [`invalidate`]: clears a local cache when something upstream changes

pub mod backoff;
pub mod broker;
pub mod capture;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod deliver;
pub mod github;
pub mod http_server;
pub mod invalidate;
pub mod legacy;
pub mod poller;
pub mod replay;
pub mod sse;
pub mod store;
pub mod types;
pub mod verification;
pub mod wire;

pub use broker::{EventBroker, PublishReport, Subscriber};
pub use channel::Channel;
pub use config::{ClientConfig, PollTarget, PollerConfig, RelayConfig};
pub use consumer::Consumer;
pub use deliver::{DecodedWebhook, Deliver, DeliveryStatus, Forwarder};
pub use invalidate::{cache_invalidator, CacheInvalidator};
pub use legacy::LegacyClient;
pub use poller::{ChangeObserver, CommitSource, PollObserver, Poller, StatefulPoller};
pub use replay::{ReplayConfig, ReplayReport, Replayer};
pub use types::{CommitChange, PollState, PollUpdate};
pub use wire::RelayEvent;
