//! Routing of commands to partitions
//!
//! Messages and subscriptions sharing a correlation key always live on the
//! partition owning the key, so a message never has to look for subscriptions
//! elsewhere. An instance may run on any partition: its subscriptions are
//! registered with the owning partition, which reports correlations back. The
//! broker delivers those commands between partitions in the order they were
//! written. Commands on an existing entity go to the partition encoded in its
//! key.

use anyhow::{anyhow, Context};
use futures::stream::{select_all, Stream};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, span, warn, Instrument, Level};

use crate::config::Opts;
use crate::document::Document;
use crate::engine::{
    partition_for_key, partition_of, Command, Engine, Outbound, ProcessDefinition,
    PublishMessage, Record,
};
use crate::partition::{Error, Mailbox, Partition};

pub struct Broker {
    partitions: Vec<Partition>,
    router: JoinHandle<()>,
    // process id -> correlation variables of its message catch elements
    correlation_variables: RwLock<HashMap<String, Vec<String>>>,
    next: AtomicUsize,
}

/// Deliver the commands partitions address to each other
///
/// Runs until every partition stopped. A command refused by its target is
/// only logged, the partition that wrote it does not wait for the outcome.
async fn route(mailboxes: Vec<Mailbox>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(Outbound { partition, command }) = rx.recv().await {
        let name = command.name();
        let Some(mailbox) = mailboxes.get(partition as usize) else {
            warn!(to = partition, command = name, "unknown partition");
            continue;
        };
        if let Err(err) = mailbox.execute(command).await {
            warn!(to = partition, command = name, "{err}");
        }
    }
    debug!("stopped");
}

impl Broker {
    /// Start a broker with the configured number of partitions
    pub fn start(opts: Opts) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let partitions: Vec<Partition> = (0..opts.get_partitions())
            .map(|id| Partition::routed(id, &opts, tx.clone()))
            .collect();
        let mailboxes = partitions.iter().map(|p| p.mailbox()).collect();
        let router = tokio::spawn(route(mailboxes, rx).instrument(span!(Level::DEBUG, "router")));

        Self {
            partitions,
            router,
            correlation_variables: RwLock::new(HashMap::new()),
            next: AtomicUsize::new(0),
        }
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition(&self, id: u16) -> Option<&Partition> {
        self.partitions.get(id as usize)
    }

    /// The partition owning a correlation key
    pub fn partition_for(&self, correlation_key: &str) -> u16 {
        partition_for_key(correlation_key, self.partitions.len() as u16)
    }

    fn owner(&self, key: u64) -> Result<&Partition, Error> {
        let id = partition_of(key);
        self.partition(id)
            .ok_or_else(|| Error::from(anyhow!("key {key} belongs to unknown partition {id}")))
    }

    /// Deploy a process on every partition
    ///
    /// Returns the process key on the first partition. The definition is
    /// validated there first, a rejected definition reaches no other partition.
    #[instrument(skip_all, fields(process_id = %definition.id))]
    pub async fn deploy(&self, definition: ProcessDefinition) -> Result<u64, Error> {
        let variables = definition
            .validate()
            .map(|process| {
                process
                    .correlation_variables()
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let mut key = 0;
        for (i, partition) in self.partitions.iter().enumerate() {
            let deployed = partition
                .execute(Command::Deploy {
                    definition: definition.clone(),
                })
                .await?;
            if i == 0 {
                key = deployed;
            }
        }

        self.correlation_variables
            .write()
            .await
            .insert(definition.id.clone(), variables);
        debug!(key, "deployed");
        Ok(key)
    }

    /// Create a process instance
    ///
    /// The instance is placed on the partition owning the value of the first
    /// correlation variable found in `variables`, so its subscriptions usually
    /// do not need another partition. Instances without one are spread
    /// round-robin.
    #[instrument(skip_all, fields(process_id = process_id))]
    pub async fn create_instance(
        &self,
        process_id: &str,
        variables: Option<Document>,
    ) -> Result<u64, Error> {
        let correlation_key = {
            let known = self.correlation_variables.read().await;
            known.get(process_id).and_then(|names| {
                names.iter().find_map(|name| {
                    variables
                        .as_ref()
                        .and_then(|vars| vars.get(name))
                        .and_then(|value| match value {
                            Value::String(s) => Some(s.clone()),
                            Value::Number(n) => Some(n.to_string()),
                            _ => None,
                        })
                })
            })
        };

        let id = match correlation_key {
            Some(key) => self.partition_for(&key),
            None => {
                (self.next.fetch_add(1, Ordering::Relaxed) % self.partitions.len()) as u16
            }
        };
        debug!(partition = id, "routing instance");

        self.partitions[id as usize]
            .execute(Command::CreateInstance {
                process_id: process_id.to_string(),
                variables,
            })
            .await
    }

    pub async fn complete_task(&self, task_key: u64, payload: Option<Document>) -> Result<u64, Error> {
        self.owner(task_key)?
            .execute(Command::CompleteTask { task_key, payload })
            .await
    }

    pub async fn update_payload(&self, scope_key: u64, payload: Document) -> Result<u64, Error> {
        self.owner(scope_key)?
            .execute(Command::UpdatePayload { scope_key, payload })
            .await
    }

    pub async fn cancel_instance(&self, instance_key: u64) -> Result<u64, Error> {
        self.owner(instance_key)?
            .execute(Command::CancelInstance { instance_key })
            .await
    }

    pub async fn close_subscription(&self, instance_key: u64, element_id: &str) -> Result<u64, Error> {
        self.owner(instance_key)?
            .execute(Command::CloseSubscription {
                instance_key,
                element_id: element_id.to_string(),
            })
            .await
    }

    /// Publish a message on the partition owning its correlation key
    #[instrument(skip_all, fields(name = %message.name, correlation_key = %message.correlation_key))]
    pub async fn publish_message(&self, message: PublishMessage) -> Result<u64, Error> {
        let id = self.partition_for(&message.correlation_key);
        self.partitions[id as usize].execute(message).await
    }

    /// Records written by every partition from now on
    pub fn records(&self) -> impl Stream<Item = Record> + Send + Unpin + 'static {
        select_all(self.partitions.iter().map(|p| p.records()))
    }

    /// Stop every partition, returning their engines in partition order
    ///
    /// Commands between partitions still in flight are dropped.
    pub async fn stop(self) -> Result<Vec<Engine>, Error> {
        let mut engines = Vec::with_capacity(self.partitions.len());
        for partition in self.partitions {
            engines.push(partition.stop().await?);
        }
        self.router.await.context("router task panicked")?;
        Ok(engines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn it_routes_correlation_keys_consistently() {
        let broker = Broker::start(Opts::default().partitions(4));
        let id = broker.partition_for("order-1");
        assert!(id < 4);
        assert_eq!(broker.partition_for("order-1"), id);
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn it_starts_with_zero_values_read_from_json() {
        let opts: Opts = serde_json::from_value(serde_json::json!({
            "partitions": 0,
            "sweep_interval_ms": 0,
            "channel_capacity": 0
        }))
        .unwrap();
        let broker = Broker::start(opts);
        assert_eq!(broker.partitions().len(), 1);

        let process = ProcessDefinition::new("process").service_task(
            "service",
            "external",
            crate::mapping::IoMapping::new(),
        );
        broker.deploy(process).await.unwrap();
        broker.create_instance("process", None).await.unwrap();
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn it_rejects_keys_of_unknown_partitions() {
        let broker = Broker::start(Opts::default().partitions(2));
        let key = crate::engine::encode_key(7, 1);
        let err = broker.cancel_instance(key).await.unwrap_err();
        assert!(err.rejection().is_none());
        assert!(err.to_string().contains("unknown partition 7"));
        broker.stop().await.unwrap();
    }
}
