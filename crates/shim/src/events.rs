/*
   Copyright The containerd Authors.

   Licensed under the Apache License, Version 2.0 (the "License");
   you may not use this file except in compliance with the License.
   You may obtain a copy of the License at

       http://www.apache.org/licenses/LICENSE-2.0

   Unless required by applicable law or agreed to in writing, software
   distributed under the License is distributed on an "AS IS" BASIS,
   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
   See the License for the specific language governing permissions and
   limitations under the License.
*/

//! Lifecycle event pipeline.
//!
//! Producers enqueue typed event messages onto one bounded queue; a single
//! forwarder thread drains it, either into containerd's event service
//! (when `TTRPC_ADDRESS` is set) or into the structured log. Publish
//! failures are logged and dropped, never propagated.
//!
//! The queue also owns the send-order lock: an operation that must get its
//! own event out before any exit event for the same process (Start) holds
//! the lock across its emission, and the exit pipeline takes the same lock
//! for every `TaskExit`. The event bus makes no ordering promise across
//! producers, so the serialization happens here.

use std::env;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use containerd_shim::protos::protobuf::{text_format, Message};
use containerd_shim::protos::ttrpc::context;
use containerd_shim::publisher::RemotePublisher;
use log::{info, warn};

/// Queue depth; producers briefly block when the forwarder falls behind.
const QUEUE_DEPTH: usize = 128;
const PUBLISH_TIMEOUT_NS: i64 = 5_000_000_000;

pub const TTRPC_ADDRESS_ENV: &str = "TTRPC_ADDRESS";

pub const TASK_CREATE_TOPIC: &str = "/tasks/create";
pub const TASK_START_TOPIC: &str = "/tasks/start";
pub const TASK_OOM_TOPIC: &str = "/tasks/oom";
pub const TASK_EXIT_TOPIC: &str = "/tasks/exit";
pub const TASK_DELETE_TOPIC: &str = "/tasks/delete";
pub const TASK_EXEC_ADDED_TOPIC: &str = "/tasks/exec-added";
pub const TASK_EXEC_STARTED_TOPIC: &str = "/tasks/exec-started";
pub const TASK_PAUSED_TOPIC: &str = "/tasks/paused";
pub const TASK_RESUMED_TOPIC: &str = "/tasks/resumed";
pub const TASK_CHECKPOINTED_TOPIC: &str = "/tasks/checkpointed";
pub const TASK_UNKNOWN_TOPIC: &str = "/tasks/?";

pub type EventMessage = Box<dyn Message + Send>;

/// Topic for an event message, derived from its proto type.
pub fn topic_for(event: &dyn Message) -> &'static str {
    match event.descriptor().name() {
        "TaskCreate" => TASK_CREATE_TOPIC,
        "TaskStart" => TASK_START_TOPIC,
        "TaskOOM" => TASK_OOM_TOPIC,
        "TaskExit" => TASK_EXIT_TOPIC,
        "TaskDelete" => TASK_DELETE_TOPIC,
        "TaskExecAdded" => TASK_EXEC_ADDED_TOPIC,
        "TaskExecStarted" => TASK_EXEC_STARTED_TOPIC,
        "TaskPaused" => TASK_PAUSED_TOPIC,
        "TaskResumed" => TASK_RESUMED_TOPIC,
        "TaskCheckpointed" => TASK_CHECKPOINTED_TOPIC,
        _ => TASK_UNKNOWN_TOPIC,
    }
}

enum Forwarder {
    Containerd {
        publisher: RemotePublisher,
        namespace: String,
    },
    Log,
    #[cfg(test)]
    Collect(SyncSender<(String, EventMessage)>),
}

#[derive(Clone)]
pub struct EventQueue {
    tx: Arc<Mutex<Option<SyncSender<EventMessage>>>>,
    order: Arc<Mutex<()>>,
    forwarder: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
}

impl EventQueue {
    /// Selects the forwarder from the environment: containerd publishing
    /// when `TTRPC_ADDRESS` is set, the structured log otherwise.
    pub fn new(namespace: &str) -> EventQueue {
        let forwarder = match env::var(TTRPC_ADDRESS_ENV) {
            Ok(address) if !address.is_empty() => match RemotePublisher::new(&address) {
                Ok(publisher) => Forwarder::Containerd {
                    publisher,
                    namespace: namespace.to_string(),
                },
                Err(e) => {
                    warn!("connect event publisher at {}: {}; logging events", address, e);
                    Forwarder::Log
                }
            },
            _ => Forwarder::Log,
        };
        Self::with_forwarder(forwarder)
    }

    fn with_forwarder(forwarder: Forwarder) -> EventQueue {
        let (tx, rx): (SyncSender<EventMessage>, Receiver<EventMessage>) =
            sync_channel(QUEUE_DEPTH);
        let handle = thread::spawn(move || forward(forwarder, rx));
        EventQueue {
            tx: Arc::new(Mutex::new(Some(tx))),
            order: Arc::new(Mutex::new(())),
            forwarder: Arc::new(Mutex::new(Some(handle))),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> (EventQueue, Receiver<(String, EventMessage)>) {
        let (tx, rx) = sync_channel(QUEUE_DEPTH);
        (Self::with_forwarder(Forwarder::Collect(tx)), rx)
    }

    /// Serializes start-type emissions against the exit pipeline.
    pub fn order_lock(&self) -> MutexGuard<'_, ()> {
        self.order.lock().unwrap()
    }

    pub fn send(&self, event: EventMessage) {
        let tx = self.tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    warn!("event forwarder is gone, dropping event");
                }
            }
            None => warn!("event queue closed, dropping event"),
        }
    }

    /// Closes the queue and waits for the forwarder to drain it.
    pub fn close(&self) {
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        if let Some(handle) = self.forwarder.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn forward(forwarder: Forwarder, rx: Receiver<EventMessage>) {
    for event in rx {
        let topic = topic_for(event.as_ref());
        match &forwarder {
            Forwarder::Containerd {
                publisher,
                namespace,
            } => {
                let ctx = context::with_timeout(PUBLISH_TIMEOUT_NS);
                if let Err(e) = publisher.publish(ctx, topic, namespace, event) {
                    warn!("publish event on {}: {}", topic, e);
                }
            }
            Forwarder::Log => {
                info!(
                    "event topic={} event={}",
                    topic,
                    text_format::print_to_string(event.as_ref())
                );
            }
            #[cfg(test)]
            Forwarder::Collect(tx) => {
                let _ = tx.send((topic.to_string(), event));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use containerd_shim::protos::events::task::{
        TaskCreate, TaskDelete, TaskExecAdded, TaskExecStarted, TaskExit, TaskOOM, TaskPaused,
        TaskResumed, TaskStart,
    };
    use containerd_shim::protos::protobuf::well_known_types::Empty as WktEmpty;

    #[test]
    fn topics_follow_event_type() {
        assert_eq!(topic_for(&TaskCreate::new()), TASK_CREATE_TOPIC);
        assert_eq!(topic_for(&TaskStart::new()), TASK_START_TOPIC);
        assert_eq!(topic_for(&TaskOOM::new()), TASK_OOM_TOPIC);
        assert_eq!(topic_for(&TaskExit::new()), TASK_EXIT_TOPIC);
        assert_eq!(topic_for(&TaskDelete::new()), TASK_DELETE_TOPIC);
        assert_eq!(topic_for(&TaskExecAdded::new()), TASK_EXEC_ADDED_TOPIC);
        assert_eq!(topic_for(&TaskExecStarted::new()), TASK_EXEC_STARTED_TOPIC);
        assert_eq!(topic_for(&TaskPaused::new()), TASK_PAUSED_TOPIC);
        assert_eq!(topic_for(&TaskResumed::new()), TASK_RESUMED_TOPIC);
        assert_eq!(topic_for(&WktEmpty::new()), TASK_UNKNOWN_TOPIC);
    }

    #[test]
    fn queue_delivers_in_order_and_drains_on_close() {
        let (queue, rx) = EventQueue::for_tests();
        let mut start = TaskStart::new();
        start.set_container_id("c1".to_string());
        queue.send(Box::new(start));
        let mut exit = TaskExit::new();
        exit.set_container_id("c1".to_string());
        queue.send(Box::new(exit));
        queue.close();

        let topics: Vec<String> = rx.iter().map(|(t, _)| t).collect();
        assert_eq!(topics, vec![TASK_START_TOPIC, TASK_EXIT_TOPIC]);
    }
}
