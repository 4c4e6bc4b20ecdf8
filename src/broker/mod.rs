//! Log event broker
//!
//! Fans out structured log events for a running pipeline to any number of
//! live subscribers, and retains a bounded per-run replay buffer so late or
//! reconnecting subscribers can catch up from a sequence number. Each run's
//! buffer and subscriber channel are guarded by their own lock, so runs for
//! different services never contend. A run's channel lives only while the
//! run does: the terminal marker drops it, and finished runs replay from
//! the registry snapshot through [`LogStream::from_history`].

use crate::core::{LogEvent, LogLevel, RunStatus};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default replay buffer capacity per run
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no log channel for run {0}")]
    UnknownRun(Uuid),
}

/// Message delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    /// An ordered log event
    Event(LogEvent),

    /// The requested starting sequence predates the replay window; `missed`
    /// events are not available. Subscribers are told about the gap rather
    /// than silently missing events.
    Gap { missed: u64 },

    /// Terminal marker: the run finished with the given status and the
    /// stream is closed.
    Completed { status: RunStatus },
}

struct RunChannel {
    buffer: VecDeque<LogEvent>,
    next_seq: u64,
    tx: broadcast::Sender<StreamMessage>,
}

impl RunChannel {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        RunChannel {
            buffer: VecDeque::new(),
            next_seq: 0,
            tx,
        }
    }

    /// Sequence of the oldest event still buffered.
    fn earliest(&self) -> u64 {
        self.buffer.front().map(|e| e.sequence).unwrap_or(self.next_seq)
    }
}

/// In-memory broker with one bounded channel per run
pub struct LogBroker {
    capacity: usize,
    runs: Mutex<HashMap<Uuid, Arc<Mutex<RunChannel>>>>,
}

impl Default for LogBroker {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl LogBroker {
    pub fn new(capacity: usize) -> Self {
        LogBroker {
            capacity,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Open the channel for a run. Called once when the run is allocated.
    pub fn register(&self, run_id: Uuid) {
        let mut runs = self.runs.lock().expect("broker lock");
        runs.entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(RunChannel::new(self.capacity))));
    }

    fn channel(&self, run_id: Uuid) -> Option<Arc<Mutex<RunChannel>>> {
        self.runs.lock().expect("broker lock").get(&run_id).cloned()
    }

    /// Append an event and push it to live subscribers. Returns the
    /// assigned sequence number, or `None` if the run is unknown or its
    /// channel was already dropped by the terminal marker.
    pub fn publish(
        &self,
        run_id: Uuid,
        step: Option<&str>,
        level: LogLevel,
        message: &str,
    ) -> Option<u64> {
        let channel = self.channel(run_id)?;
        let mut chan = channel.lock().expect("run channel lock");

        let event = LogEvent {
            run_id,
            sequence: chan.next_seq,
            step: step.map(str::to_string),
            level,
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        chan.next_seq += 1;

        if chan.buffer.len() >= self.capacity {
            chan.buffer.pop_front();
        }
        chan.buffer.push_back(event.clone());

        // send only fails when there are no subscribers, which is fine
        let _ = chan.tx.send(StreamMessage::Event(event));
        Some(chan.next_seq - 1)
    }

    /// Emit the terminal marker to live subscribers and drop the run's
    /// channel. The buffer must be snapshotted to the registry first;
    /// later subscriptions replay from that snapshot.
    pub fn complete(&self, run_id: Uuid, status: RunStatus) {
        let channel = self.runs.lock().expect("broker lock").remove(&run_id);
        if let Some(channel) = channel {
            let chan = channel.lock().expect("run channel lock");
            let _ = chan.tx.send(StreamMessage::Completed { status });
        }
    }

    /// Drop a run's channel without a terminal marker. Used when a start
    /// is aborted before the executor takes over.
    pub fn remove(&self, run_id: Uuid) {
        self.runs.lock().expect("broker lock").remove(&run_id);
    }

    /// Subscribe from a sequence number: buffered events with
    /// `sequence >= from_seq` are replayed first, then live events follow
    /// in order. The receiver is registered under the same lock as the
    /// replay snapshot, so no event is lost or duplicated in between.
    pub fn subscribe(&self, run_id: Uuid, from_seq: u64) -> Result<LogStream, BrokerError> {
        let channel = self.channel(run_id).ok_or(BrokerError::UnknownRun(run_id))?;
        let chan = channel.lock().expect("run channel lock");

        let earliest = chan.earliest();
        let pending_gap = if from_seq < earliest {
            Some(earliest - from_seq)
        } else {
            None
        };

        let replay: VecDeque<LogEvent> = chan
            .buffer
            .iter()
            .filter(|e| e.sequence >= from_seq)
            .cloned()
            .collect();

        Ok(LogStream {
            rx: chan.tx.subscribe(),
            replay,
            pending_gap,
            closed_at_subscribe: None,
            from_seq,
            last_seen: None,
            done: false,
        })
    }

    /// Snapshot of the buffered events for a run, oldest first.
    pub fn snapshot(&self, run_id: Uuid) -> Vec<LogEvent> {
        match self.channel(run_id) {
            Some(channel) => {
                let chan = channel.lock().expect("run channel lock");
                chan.buffer.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }
}

/// Ordered, replayable view of a run's log events.
///
/// Yields `None` after the `Completed` marker has been delivered.
pub struct LogStream {
    rx: broadcast::Receiver<StreamMessage>,
    replay: VecDeque<LogEvent>,
    pending_gap: Option<u64>,
    closed_at_subscribe: Option<RunStatus>,
    from_seq: u64,
    last_seen: Option<u64>,
    done: bool,
}

impl LogStream {
    /// Stream over the persisted events of a finished run: the matching
    /// events replay in order, then the terminal marker closes the stream.
    /// Events evicted before the snapshot surface as a leading `Gap`.
    pub fn from_history(events: Vec<LogEvent>, from_seq: u64, status: RunStatus) -> Self {
        let earliest = events.first().map(|e| e.sequence).unwrap_or(from_seq);
        let pending_gap = if from_seq < earliest {
            Some(earliest - from_seq)
        } else {
            None
        };
        let replay: VecDeque<LogEvent> = events
            .into_iter()
            .filter(|e| e.sequence >= from_seq)
            .collect();

        // the receiver is never read; the stream closes from the replay
        let (_tx, rx) = broadcast::channel(1);
        LogStream {
            rx,
            replay,
            pending_gap,
            closed_at_subscribe: Some(status),
            from_seq,
            last_seen: None,
            done: false,
        }
    }

    pub async fn next(&mut self) -> Option<StreamMessage> {
        if self.done {
            return None;
        }

        if let Some(missed) = self.pending_gap.take() {
            return Some(StreamMessage::Gap { missed });
        }

        if let Some(event) = self.replay.pop_front() {
            self.last_seen = Some(event.sequence);
            return Some(StreamMessage::Event(event));
        }

        // Run was already terminal when we subscribed: replay is all
        // there is.
        if let Some(status) = self.closed_at_subscribe {
            self.done = true;
            return Some(StreamMessage::Completed { status });
        }

        loop {
            match self.rx.recv().await {
                Ok(StreamMessage::Event(event)) => {
                    // skip anything the replay already covered
                    if event.sequence < self.from_seq {
                        continue;
                    }
                    if let Some(last) = self.last_seen {
                        if event.sequence <= last {
                            continue;
                        }
                    }
                    self.last_seen = Some(event.sequence);
                    return Some(StreamMessage::Event(event));
                }
                Ok(StreamMessage::Completed { status }) => {
                    self.done = true;
                    return Some(StreamMessage::Completed { status });
                }
                Ok(StreamMessage::Gap { missed }) => {
                    return Some(StreamMessage::Gap { missed });
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Some(StreamMessage::Gap { missed });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    /// Drain the stream to completion, returning all events and the
    /// terminal status (if one arrived).
    pub async fn collect(mut self) -> (Vec<LogEvent>, Option<RunStatus>) {
        let mut events = Vec::new();
        let mut status = None;
        while let Some(message) = self.next().await {
            match message {
                StreamMessage::Event(event) => events.push(event),
                StreamMessage::Completed { status: s } => {
                    status = Some(s);
                    break;
                }
                StreamMessage::Gap { .. } => {}
            }
        }
        (events, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_replay() {
        let broker = LogBroker::default();
        let run_id = Uuid::new_v4();
        broker.register(run_id);

        assert_eq!(broker.publish(run_id, None, LogLevel::Info, "one"), Some(0));
        assert_eq!(
            broker.publish(run_id, Some("build"), LogLevel::Info, "two"),
            Some(1)
        );

        let stream = broker.subscribe(run_id, 0).unwrap();
        broker.complete(run_id, RunStatus::Succeeded);

        let (events, status) = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 0);
        assert_eq!(events[1].sequence, 1);
        assert_eq!(events[1].step.as_deref(), Some("build"));
        assert_eq!(status, Some(RunStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_replay_from_offset_is_pure() {
        let broker = LogBroker::default();
        let run_id = Uuid::new_v4();
        broker.register(run_id);
        for i in 0..5 {
            broker.publish(run_id, None, LogLevel::Info, &format!("msg {}", i));
        }

        let first = broker.subscribe(run_id, 3).unwrap();
        let second = broker.subscribe(run_id, 3).unwrap();
        broker.complete(run_id, RunStatus::Succeeded);

        let (first, _) = first.collect().await;
        let (second, _) = second.collect().await;

        let first_seqs: Vec<u64> = first.iter().map(|e| e.sequence).collect();
        let second_seqs: Vec<u64> = second.iter().map(|e| e.sequence).collect();
        assert_eq!(first_seqs, vec![3, 4]);
        assert_eq!(first_seqs, second_seqs);
    }

    #[tokio::test]
    async fn test_gap_reported_when_window_passed() {
        let broker = LogBroker::new(3);
        let run_id = Uuid::new_v4();
        broker.register(run_id);
        for i in 0..10 {
            broker.publish(run_id, None, LogLevel::Info, &format!("msg {}", i));
        }

        let mut stream = broker.subscribe(run_id, 0).unwrap();
        match stream.next().await {
            Some(StreamMessage::Gap { missed }) => assert_eq!(missed, 7),
            other => panic!("expected gap, got {:?}", other),
        }
        // events 7, 8, 9 are still available, in order
        for expected in 7..10u64 {
            match stream.next().await {
                Some(StreamMessage::Event(e)) => assert_eq!(e.sequence, expected),
                other => panic!("expected event {}, got {:?}", expected, other),
            }
        }
    }

    #[tokio::test]
    async fn test_completion_evicts_the_channel() {
        let broker = LogBroker::default();
        let run_id = Uuid::new_v4();
        broker.register(run_id);
        broker.publish(run_id, None, LogLevel::Info, "before");
        broker.complete(run_id, RunStatus::Failed);

        // nothing lands after the terminal marker, and no memory is held
        assert_eq!(broker.publish(run_id, None, LogLevel::Info, "after"), None);
        assert!(broker.subscribe(run_id, 0).is_err());
        assert!(broker.snapshot(run_id).is_empty());
    }

    #[tokio::test]
    async fn test_history_stream_replays_and_closes() {
        let run_id = Uuid::new_v4();
        let events: Vec<LogEvent> = (3..6)
            .map(|i| LogEvent {
                run_id,
                sequence: i,
                step: None,
                level: LogLevel::Info,
                message: format!("msg {}", i),
                timestamp: Utc::now(),
            })
            .collect();

        let mut stream = LogStream::from_history(events, 0, RunStatus::Failed);
        match stream.next().await {
            Some(StreamMessage::Gap { missed }) => assert_eq!(missed, 3),
            other => panic!("expected gap, got {:?}", other),
        }
        for expected in 3..6u64 {
            match stream.next().await {
                Some(StreamMessage::Event(e)) => assert_eq!(e.sequence, expected),
                other => panic!("expected event {}, got {:?}", expected, other),
            }
        }
        assert!(matches!(
            stream.next().await,
            Some(StreamMessage::Completed {
                status: RunStatus::Failed
            })
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_live_subscriber_sees_events_in_order() {
        let broker = Arc::new(LogBroker::default());
        let run_id = Uuid::new_v4();
        broker.register(run_id);
        broker.publish(run_id, None, LogLevel::Info, "early");

        let stream = broker.subscribe(run_id, 0).unwrap();

        let publisher = {
            let broker = broker.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    broker.publish(run_id, None, LogLevel::Info, &format!("live {}", i));
                    tokio::task::yield_now().await;
                }
                broker.complete(run_id, RunStatus::Succeeded);
            })
        };

        let (events, status) = stream.collect().await;
        publisher.await.unwrap();

        assert_eq!(status, Some(RunStatus::Succeeded));
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        let expected: Vec<u64> = (0..21).collect();
        assert_eq!(seqs, expected);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let broker = LogBroker::default();
        assert!(broker.subscribe(Uuid::new_v4(), 0).is_err());
    }
}
