//! Session event types and fan-out.
//!
//! The IDE boundary, the CLI and tests consume these events to react to
//! asynchronous target state changes without polling. The remote session
//! publishes them from the control thread and from its poller; every
//! subscriber receives every event in publication order.

use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex, PoisonError};

use tracing::trace;

use crate::breakpoints::BreakpointId;
use crate::symbols::LoadStatus;
use crate::types::{Address, Architecture, StopReason, ThreadId};

/// Event emitted by a debug session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent
{
    /// Handshake finished; the session is open.
    Opened
    {
        architecture: Architecture,
        /// Module the stub reported (or the configured override)
        module: Option<PathBuf>,
    },
    /// Symbols for the module were (or failed to be) loaded.
    ModuleLoaded
    {
        path: PathBuf,
        status: LoadStatus,
    },
    /// Target stopped. Temporary breakpoints are already gone.
    Stopped
    {
        reason: StopReason,
        /// Thread responsible for the stop (if known)
        thread: Option<ThreadId>,
        /// PC after the stop, already rewound past a breakpoint trap
        pc: Option<Address>,
        /// User breakpoint the target stopped on
        breakpoint: Option<BreakpointId>,
    },
    /// Target resumed execution.
    Continuing,
    /// A source-level step finished.
    StepFinished
    {
        thread: Option<ThreadId>,
    },
    /// Program output forwarded by the stub (`O` packets).
    Output(String),
    /// Session closed.
    Closed,
}

impl SessionEvent
{
    /// Human-readable description of the event.
    #[must_use]
    pub fn describe(&self) -> String
    {
        match self {
            Self::Opened { architecture, module } => match module {
                Some(module) => format!("Session opened ({architecture}, {})", module.display()),
                None => format!("Session opened ({architecture})"),
            },
            Self::ModuleLoaded { status, .. } => status.message.clone(),
            Self::Stopped {
                reason,
                thread,
                pc,
                breakpoint,
            } => {
                let mut description = format!("Target {reason}");
                if let Some(pc) = pc {
                    description.push_str(&format!(" at {pc}"));
                }
                if let Some(breakpoint) = breakpoint {
                    description.push_str(&format!(" (breakpoint {})", breakpoint.raw()));
                }
                if let Some(thread) = thread {
                    description.push_str(&format!(" [thread {thread}]"));
                }
                description
            }
            Self::Continuing => "Target resumed execution".to_string(),
            Self::StepFinished { .. } => "Step finished".to_string(),
            Self::Output(text) => text.clone(),
            Self::Closed => "Session closed".to_string(),
        }
    }
}

/// Sender side of a session event channel.
pub type SessionEventSender = mpsc::Sender<SessionEvent>;
/// Receiver side of a session event channel.
pub type SessionEventReceiver = mpsc::Receiver<SessionEvent>;

/// Fans events out to every subscriber.
///
/// Publishing never blocks on a listener and never calls back into the
/// session; subscribers whose receiver was dropped are forgotten.
#[derive(Debug, Clone, Default)]
pub struct EventBus
{
    listeners: Arc<Mutex<Vec<SessionEventSender>>>,
}

impl EventBus
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Register a new listener.
    #[must_use]
    pub fn subscribe(&self) -> SessionEventReceiver
    {
        let (sender, receiver) = mpsc::channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        receiver
    }

    /// Deliver `event` to every live listener.
    pub fn publish(&self, event: &SessionEvent)
    {
        trace!(event = %event.describe(), "publishing session event");
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|listener| listener.send(event.clone()).is_ok());
    }

    /// Number of live listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize
    {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_every_subscriber_sees_events_in_order()
    {
        let bus = EventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();
        bus.publish(&SessionEvent::Continuing);
        bus.publish(&SessionEvent::Closed);
        for receiver in [first, second] {
            assert_eq!(receiver.try_recv().unwrap(), SessionEvent::Continuing);
            assert_eq!(receiver.try_recv().unwrap(), SessionEvent::Closed);
        }
    }

    #[test]
    fn test_dropped_listeners_are_forgotten()
    {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        bus.publish(&SessionEvent::Output("hello\n".into()));
        assert_eq!(bus.listener_count(), 1);
        assert_eq!(kept.try_recv().unwrap(), SessionEvent::Output("hello\n".into()));
    }

    #[test]
    fn test_describe_stop()
    {
        let event = SessionEvent::Stopped {
            reason: StopReason::Signal(5),
            thread: Some(ThreadId(1)),
            pc: Some(Address::new(0x1000)),
            breakpoint: None,
        };
        assert_eq!(event.describe(), "Target stopped by signal 5 at 0x0000000000001000 [thread 1]");
    }
}
