//! Payment detection: the push path (WebSocket subscriptions), the pull path
//! (balance/history reconciliation) and the periodic sweeper that ties them
//! together when the stream is degraded.

pub mod backoff;
pub mod error;
pub mod events;
pub mod intents;
pub mod reconciler;
pub mod service;
pub mod stream;
pub mod subscription;
pub mod sweeper;

pub use backoff::{ReconnectDecision, ReconnectPolicy, ReconnectTracker};
pub use error::{FatalConnectionError, MonitorError, ReconcileError, ServiceError};
pub use events::{ConnectionStatus, EventBus, MonitorEvent};
pub use intents::ChainWriteIntent;
pub use reconciler::{CheckState, PaymentCheck, Reconciler, Shortfall};
pub use service::{PaymentService, CHAIN_TX_KEY};
pub use stream::{ControlMessage, StreamMessage, TransactionNotice};
pub use subscription::{ConnectionState, MonitorConfig, SubscriptionMonitor};
pub use sweeper::{SweepReport, Sweeper, SweeperConfig, SweeperHandle};
