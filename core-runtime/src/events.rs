//! # Event Bus System
//!
//! Provides an event-driven architecture for the sync core using `tokio::sync::broadcast`.
//! The monitor loop, the batcher and the link projector publish progress here so
//! status surfaces can push updates instead of polling stats.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: Strongly-typed enums per pipeline stage
//! - **EventBus**: Central broadcast channel for publishing events
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    emit      ┌───────────┐
//! │ Monitor Loop ├─────────────>│           │
//! └──────────────┘              │           │
//!                               │ EventBus  │
//! ┌──────────────┐    emit      │ (broadcast│     subscribe    ┌────────────┐
//! │ Batcher      ├─────────────>│  channel) ├─────────────────>│ Subscriber │
//! └──────────────┘              │           │                  └────────────┘
//!                               │           │
//! ┌──────────────┐    emit      │           │
//! │ Projector    ├─────────────>│           │
//! └──────────────┘              └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, MonitorEvent};
//! use tokio::sync::broadcast::error::RecvError;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Monitor(MonitorEvent::Started {
//!         scan_root: String::new(),
//!     }))
//!     .ok();
//!
//! match stream.recv().await {
//!     Ok(event) => println!("Received: {:?}", event),
//!     Err(RecvError::Lagged(n)) => eprintln!("Missed {} events", n),
//!     Err(RecvError::Closed) => {}
//! }
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Emitters ignore the "no subscribers" error; publishing never fails the
//! pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast::{self, error::SendError};

pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Subscribers that can't keep up will receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Scan scheduling and lifecycle
    Monitor(MonitorEvent),
    /// Batch dispatch and media server refreshes
    Batch(BatchEvent),
    /// Bulk link maintenance
    Links(LinkEvent),
}

// ============================================================================
// Monitor Events
// ============================================================================

/// Events emitted by the monitor loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum MonitorEvent {
    /// The loop authenticated and launched.
    Started {
        /// Remote root being watched.
        scan_root: String,
    },
    /// One scan committed.
    ScanCompleted {
        scan_id: String,
        added: u64,
        modified: u64,
        deleted: u64,
        duration_ms: u64,
    },
    /// One scan failed and was rolled back.
    ScanFailed {
        message: String,
        /// Consecutive failures so far.
        retry_count: u32,
        /// False when the loop is about to stop.
        will_retry: bool,
    },
    /// Expired snapshot records were removed.
    RecordsSwept { removed: u64 },
    /// The loop left the running state.
    Stopped { reason: String },
}

// ============================================================================
// Batch Events
// ============================================================================

/// Events emitted by the event batcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum BatchEvent {
    /// A batch finished its filesystem operations.
    Dispatched {
        batch_id: String,
        events: u64,
        processed: u64,
        failed: u64,
        changed_paths: u64,
    },
    /// The media server was asked to refresh the libraries touched by a batch.
    RefreshCompleted {
        batch_id: String,
        success: u64,
        failed: u64,
        libraries: Vec<String>,
    },
    /// Library roots could not be fetched for a batch.
    RefreshFailed { batch_id: String, message: String },
}

// ============================================================================
// Link Events
// ============================================================================

/// Events emitted by bulk link maintenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum LinkEvent {
    /// Every link was cleared and recreated from the snapshot.
    Rebuilt { valid: u64, invalid: u64, missing: u64 },
    /// Old backup files were deleted.
    BackupsCleaned { removed: u64 },
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Non-blocking sends (events are cloned for each subscriber)
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
///
/// # Example
///
/// ```rust
/// use core_runtime::events::{EventBus, CoreEvent, MonitorEvent};
///
/// # #[tokio::main]
/// # async fn main() {
/// let event_bus = EventBus::new(100);
///
/// // Subscribe to events
/// let mut subscriber1 = event_bus.subscribe();
/// let mut subscriber2 = event_bus.subscribe();
///
/// // Emit an event
/// let event = CoreEvent::Monitor(MonitorEvent::Started {
///     scan_root: "movies".to_string(),
/// });
/// event_bus.emit(event).ok();
///
/// // Both subscribers receive the event
/// # tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
/// # }
/// ```
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of events to buffer per subscriber.
    ///   When a subscriber falls behind by more than this amount, it will
    ///   receive a `RecvError::Lagged` error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use core_runtime::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a new event bus with the default buffer size.
    ///
    /// # Example
    ///
    /// ```rust
    /// use core_runtime::events::EventBus;
    ///
    /// let event_bus = EventBus::default();
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    /// Returns an error if there are no active subscribers.
    ///
    /// # Example
    ///
    /// ```rust
    /// use core_runtime::events::{EventBus, CoreEvent, MonitorEvent};
    ///
    /// let event_bus = EventBus::new(100);
    /// let event = CoreEvent::Monitor(MonitorEvent::Stopped {
    ///     reason: "requested".to_string(),
    /// });
    ///
    /// match event_bus.emit(event) {
    ///     Ok(n) => println!("Event sent to {} subscribers", n),
    ///     Err(_) => println!("No active subscribers"),
    /// }
    /// ```
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber to receive events.
    ///
    /// Each call creates an independent receiver that will receive all future events.
    /// Past events are not replayed.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use core_runtime::events::EventBus;
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let event_bus = EventBus::new(100);
    /// let mut subscriber = event_bus.subscribe();
    ///
    /// tokio::spawn(async move {
    ///     while let Ok(event) = subscriber.recv().await {
    ///         println!("Received: {:?}", event);
    ///     }
    /// });
    /// # }
    /// ```
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    ///
    /// # Example
    ///
    /// ```rust
    /// use core_runtime::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// assert_eq!(event_bus.subscriber_count(), 0);
    ///
    /// let _subscriber = event_bus.subscribe();
    /// assert_eq!(event_bus.subscriber_count(), 1);
    /// ```
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
