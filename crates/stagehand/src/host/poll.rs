//! # Pollables and the Monotonic Clock
//!
//! A [`Pollable`] is a readiness token over some event. Two families exist:
//!
//! * event-driven pollables wrap a [`Subscribe`] source (stream buffers, accept queues,
//!   datagram queues, name lookups) and are woken by the source's notifier;
//! * deadline pollables fire when the monotonic clock passes an instant.
//!
//! [`poll_list`] waits on a mixed set of both and re-checks deadlines on a bounded
//! interval, so a deadline is honored even when no event source ever fires.

use futures::future::{self, BoxFuture};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::bridge::Call;
use crate::errors::{Error, ErrorCode};
use crate::handler::{unsupported, Handler, HandlerResult};
use crate::opcode::{BaseOp, ResourceTag};
use crate::store::IoStore;
use crate::table::Handle;
use crate::value::Value;

/// An event source that can report and await readiness.
pub trait Subscribe: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Resolve once the source is ready. May resolve spuriously; callers re-check.
    fn wait(&self) -> BoxFuture<'_, ()>;
}

#[derive(Clone)]
enum Trigger {
    Ready,
    Never,
    Deadline(Instant),
    Event {
        source: Arc<dyn Subscribe>,
        one_shot: bool,
    },
}

#[derive(Clone)]
pub struct Pollable {
    trigger: Trigger,
    /// Set once a deadline or one-shot source has fired. Never cleared.
    latched: Arc<AtomicBool>,
}

impl fmt::Debug for Pollable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.trigger {
            Trigger::Ready => "ready",
            Trigger::Never => "never",
            Trigger::Deadline(_) => "deadline",
            Trigger::Event { one_shot: true, .. } => "one-shot",
            Trigger::Event { .. } => "event",
        };
        f.debug_struct("Pollable")
            .field("kind", &kind)
            .field("latched", &self.latched.load(Ordering::Acquire))
            .finish()
    }
}

impl Pollable {
    fn with_trigger(trigger: Trigger) -> Self {
        Self {
            trigger,
            latched: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn ready() -> Self {
        Self::with_trigger(Trigger::Ready)
    }

    pub fn never() -> Self {
        Self::with_trigger(Trigger::Never)
    }

    pub fn deadline(at: Instant) -> Self {
        Self::with_trigger(Trigger::Deadline(at))
    }

    /// Readiness follows the source; it may become unready again.
    pub fn event(source: impl Subscribe + 'static) -> Self {
        Self::with_trigger(Trigger::Event {
            source: Arc::new(source),
            one_shot: false,
        })
    }

    /// Stays ready once the source has completed.
    pub fn one_shot(source: impl Subscribe + 'static) -> Self {
        Self::with_trigger(Trigger::Event {
            source: Arc::new(source),
            one_shot: true,
        })
    }

    pub fn expires_at(&self) -> Option<Instant> {
        match self.trigger {
            Trigger::Deadline(at) => Some(at),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        if self.latched.load(Ordering::Acquire) {
            return true;
        }
        match &self.trigger {
            Trigger::Ready => true,
            Trigger::Never => false,
            Trigger::Deadline(at) => {
                let fired = Instant::now() >= *at;
                if fired {
                    self.latched.store(true, Ordering::Release);
                }
                fired
            }
            Trigger::Event { source, one_shot } => {
                let ready = source.is_ready();
                if ready && *one_shot {
                    self.latched.store(true, Ordering::Release);
                }
                ready
            }
        }
    }

    /// Wait until ready.
    pub async fn block(&self) {
        loop {
            if self.is_ready() {
                return;
            }
            self.wait_once().await;
        }
    }

    /// A single wait on the underlying trigger. May resolve before the pollable is ready.
    fn wait_once(&self) -> BoxFuture<'_, ()> {
        match &self.trigger {
            Trigger::Ready => Box::pin(future::ready(())),
            Trigger::Never => Box::pin(future::pending::<()>()),
            Trigger::Deadline(at) => Box::pin(tokio::time::sleep_until(*at)),
            Trigger::Event { source, .. } => source.wait(),
        }
    }
}

/// Wait for at least one pollable and return the indices of every ready entry.
///
/// Event sources are raced against a timer. The timer fires at the earliest deadline in
/// the list, but never later than `recheck` from now, after which readiness of the whole
/// list is evaluated again.
pub async fn poll_list(pollables: &[Pollable], recheck: Duration) -> Vec<u32> {
    loop {
        let ready: Vec<u32> = pollables
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_ready())
            .map(|(index, _)| index as u32)
            .collect();
        if !ready.is_empty() {
            trace!("poll list ready: {:?}", ready);
            return ready;
        }

        let earliest = pollables.iter().filter_map(Pollable::expires_at).min();
        let events: Vec<BoxFuture<'_, ()>> = pollables
            .iter()
            .filter(|p| p.expires_at().is_none())
            .map(Pollable::wait_once)
            .collect();

        match earliest {
            Some(at) => {
                let wake = at.min(Instant::now() + recheck);
                if events.is_empty() {
                    tokio::time::sleep_until(wake).await;
                } else {
                    tokio::select! {
                        _ = future::select_all(events) => {}
                        _ = tokio::time::sleep_until(wake) => {}
                    }
                }
            }
            None => {
                if !events.is_empty() {
                    future::select_all(events).await;
                }
            }
        }
    }
}

/// Nanosecond clock anchored at I/O context start.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    pub fn resolution(&self) -> u64 {
        1
    }

    /// Deadline at an absolute clock reading. Readings in the past are already due.
    pub fn instant(&self, when: u64) -> Instant {
        self.epoch + Duration::from_nanos(when)
    }
}

pub struct PollHandler;

impl PollHandler {
    async fn dispatch(store: Arc<IoStore>, op: BaseOp, tag: ResourceTag, call: Call) -> HandlerResult {
        match (op, tag) {
            (BaseOp::Create, ResourceTag::Pollable) => {
                let ready = call.arg(Value::as_bool, "bool")?;
                let pollable = if ready {
                    Pollable::ready()
                } else {
                    Pollable::never()
                };
                Ok(store.table().push(pollable).map(Value::Handle))
            }
            (BaseOp::Drop, ResourceTag::Pollable) => {
                let handle = call.handle()?;
                Ok(store.table().delete::<Pollable>(handle).map(|_| Value::Unit))
            }
            (BaseOp::Ready, ResourceTag::Pollable) => {
                let handle = call.handle()?;
                let pollable = store.table().get::<Pollable>(handle).map(Pollable::clone);
                Ok(pollable.map(|p| Value::Bool(p.is_ready())))
            }
            (BaseOp::Block, ResourceTag::Pollable) => {
                let handle = call.handle()?;
                let pollable = match store.table().get::<Pollable>(handle) {
                    Ok(pollable) => pollable.clone(),
                    Err(e) => return Ok(Err(e)),
                };
                pollable.block().await;
                Ok(Ok(Value::Unit))
            }
            (BaseOp::PollList, ResourceTag::Pollable) => {
                let handles = call.arg(Value::as_handles, "handle list")?;
                let pollables = match collect_pollables(&store, &handles) {
                    Ok(pollables) => pollables,
                    Err(e) => return Ok(Err(e)),
                };
                let recheck = store.config().poll.recheck_interval();
                debug!("polling {} pollables", pollables.len());
                Ok(Ok(Value::Indices(poll_list(&pollables, recheck).await)))
            }
            (BaseOp::Now, ResourceTag::Clock) => Ok(Ok(Value::U64(store.clock().now()))),
            (BaseOp::Resolution, ResourceTag::Clock) => {
                Ok(Ok(Value::U64(store.clock().resolution())))
            }
            (BaseOp::SubscribeInstant, ResourceTag::Clock) => {
                let when = call.arg(Value::as_u64, "instant")?;
                let pollable = Pollable::deadline(store.clock().instant(when));
                Ok(store.table().push(pollable).map(Value::Handle))
            }
            (BaseOp::SubscribeDuration, ResourceTag::Clock) => {
                let nanos = call.arg(Value::as_u64, "duration")?;
                let pollable = Pollable::deadline(Instant::now() + Duration::from_nanos(nanos));
                Ok(store.table().push(pollable).map(Value::Handle))
            }
            _ => Err(unsupported(op, tag)),
        }
    }
}

fn collect_pollables(store: &IoStore, handles: &[Handle]) -> Result<Vec<Pollable>, Error> {
    if handles.is_empty() {
        return Err(Error::detailed(
            ErrorCode::InvalidArgument,
            "poll list is empty",
        ));
    }
    let table = store.table();
    handles
        .iter()
        .map(|handle| table.get::<Pollable>(*handle).map(Pollable::clone))
        .collect()
}

impl Handler for PollHandler {
    fn name(&self) -> &str {
        "poll"
    }

    fn tags(&self) -> &'static [ResourceTag] {
        &[ResourceTag::Pollable, ResourceTag::Clock]
    }

    fn handle(
        &self,
        store: Arc<IoStore>,
        op: BaseOp,
        tag: ResourceTag,
        call: Call,
    ) -> BoxFuture<'static, HandlerResult> {
        Box::pin(Self::dispatch(store, op, tag, call))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::shared::{Readiness, Shared};

    #[tokio::test]
    async fn test_deadline_latches() {
        let pollable = Pollable::deadline(Instant::now() + Duration::from_millis(10));
        assert!(!pollable.is_ready());
        pollable.block().await;
        assert!(pollable.is_ready());
        assert!(pollable.is_ready());
    }

    #[tokio::test]
    async fn test_poll_list_returns_deadline_index_when_other_never_fires() {
        let pollables = vec![
            Pollable::never(),
            Pollable::deadline(Instant::now() + Duration::from_millis(30)),
        ];
        let ready = tokio::time::timeout(
            Duration::from_secs(2),
            poll_list(&pollables, Duration::from_millis(5)),
        )
        .await
        .expect("poll list hung");
        assert_eq!(ready, vec![1]);
    }

    #[tokio::test]
    async fn test_poll_list_reports_all_ready_entries() {
        let pollables = vec![Pollable::ready(), Pollable::never(), Pollable::ready()];
        let ready = poll_list(&pollables, Duration::from_millis(5)).await;
        assert_eq!(ready, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_event_pollable_follows_source_and_one_shot_latches() {
        let flag = Shared::new(false);
        let follows = Pollable::event(Readiness::new(&flag, |set| *set));
        let latches = Pollable::one_shot(Readiness::new(&flag, |set| *set));

        flag.update(|set| *set = true);
        assert!(follows.is_ready());
        assert!(latches.is_ready());

        flag.update(|set| *set = false);
        assert!(!follows.is_ready());
        assert!(latches.is_ready());
    }

    #[tokio::test]
    async fn test_poll_list_wakes_on_event() {
        let flag = Shared::new(false);
        let pollables = vec![
            Pollable::deadline(Instant::now() + Duration::from_secs(60)),
            Pollable::event(Readiness::new(&flag, |set| *set)),
        ];
        let setter = {
            let flag = Arc::clone(&flag);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.update(|set| *set = true);
            })
        };
        let ready = tokio::time::timeout(
            Duration::from_secs(2),
            poll_list(&pollables, Duration::from_millis(500)),
        )
        .await
        .expect("poll list hung");
        assert_eq!(ready, vec![1]);
        setter.await.unwrap();
    }

    #[test]
    fn test_clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
        assert_eq!(clock.resolution(), 1);
    }
}
