// ABOUTME: Replication pipeline - connectors, realtime path, reconciliation and deletion log
// ABOUTME: Wires the components together under SyncDaemon

pub mod daemon;
pub mod events;
pub mod realtime;
pub mod reconciler;
pub mod row;
pub mod source;
pub mod state;
pub mod target;
pub mod tombstones;

pub use daemon::{CycleStats, RunSummary, SyncDaemon, WorkerContext};
pub use events::{event_queue, EventProcessor, EventReceiver, EventSender, ProcessorStats};
pub use realtime::{RealtimeSubscriber, SubscriberStats};
pub use reconciler::{since_timestamp, ReconcileResult, Reconciler};
pub use row::{Change, ChangeEvent, ChangeKind, RawChange, Row, RowKey};
pub use source::{ChannelMessage, ChannelStatus, PgSource, ProbeError, SourceStore, Subscription};
pub use state::{CursorRecord, CursorStore};
pub use target::{PgTarget, TargetStore};
pub use tombstones::{DeletionLogEntry, DeletionLogProcessor, TombstoneStats};
