//! Sequential stream processor of a partition
//!
//! The [`Engine`] applies one [`Command`] at a time. Processing a command
//! writes [`Record`]s to the partition log and every state change happens by
//! applying the event of a record, so the state can be rebuilt at any time by
//! [replaying](Engine::replay) the log.
//!
//! A subscription is registered with the partition owning its correlation key,
//! where the messages with that key are published. When the instance runs on
//! another partition, the engine addresses [`Outbound`] commands to the owner
//! and back, collected with [`Engine::take_outbound`].

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::config::Opts;
use crate::document::Document;
use crate::incident::{ErrorType, Incident};
use crate::mapping::Mappings;
use crate::message::{Message, Subscription, SubscriptionState};
use crate::scope::changes;

mod command;
mod process;
mod record;
mod state;

pub use command::*;
pub use process::*;
pub use record::*;
pub use state::*;

pub struct Engine {
    state: State,
    log: Vec<Record>,
    partitions: u16,
    default_ttl_ms: u64,
    id_retention_ms: u64,
    outbound: Vec<Outbound>,
}

fn rejected(rejection: Rejection) -> Rejection {
    warn!(rejection_type = rejection.rejection_type().as_str(), "{rejection}");
    rejection
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a map",
    }
}

impl Engine {
    pub fn new(partition_id: u16, opts: &Opts) -> Self {
        Self {
            state: State::new(partition_id),
            log: Vec::new(),
            partitions: opts.get_partitions(),
            default_ttl_ms: opts.default_ttl_ms,
            id_retention_ms: opts.id_retention_ms,
            outbound: Vec::new(),
        }
    }

    /// Rebuild an engine from the records of a partition log
    #[instrument(skip_all, fields(partition = partition_id))]
    pub fn replay(partition_id: u16, opts: &Opts, records: impl IntoIterator<Item = Record>) -> Self {
        let mut engine = Self::new(partition_id, opts);
        for record in records {
            engine.state.apply(record.key, &record.event);
            engine.log.push(record);
        }
        debug!(records = engine.log.len(), "log replayed");
        engine
    }

    pub fn partition_id(&self) -> u16 {
        self.state.partition_id()
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn records(&self) -> &[Record] {
        &self.log
    }

    /// Records written after the given position
    pub fn records_after(&self, position: u64) -> &[Record] {
        let start = self.log.partition_point(|r| r.position <= position);
        &self.log[start..]
    }

    /// Position of the last written record, 0 if the log is empty
    pub fn position(&self) -> u64 {
        self.log.last().map_or(0, |r| r.position)
    }

    /// Commands for other partitions written since the last call
    ///
    /// They are not part of the log, replaying an engine produces none.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    /// The partition owning a correlation key
    fn owner_of(&self, correlation_key: &str) -> u16 {
        partition_for_key(correlation_key, self.partitions)
    }

    fn send(&mut self, partition: u16, command: Command) {
        debug!(to = partition, command = command.name(), "command for another partition");
        self.outbound.push(Outbound { partition, command });
    }

    fn write(&mut self, key: u64, event: Event) {
        let position = self.position() + 1;
        debug!(position, key, intent = event.intent(), "record written");
        self.state.apply(key, &event);
        self.log.push(Record {
            position,
            key,
            event,
        });
    }

    /// Process a command at time `now` (ms)
    pub fn process(&mut self, command: Command, now: u64) -> Result<u64, Rejection> {
        match command {
            Command::Deploy { definition } => self.deploy(&definition),
            Command::CreateInstance {
                process_id,
                variables,
            } => self.create_instance(&process_id, variables, now),
            Command::CompleteTask { task_key, payload } => {
                self.complete_task(task_key, payload, now)
            }
            Command::UpdatePayload { scope_key, payload } => {
                self.update_payload(scope_key, payload)
            }
            Command::PublishMessage(cmd) => self.publish_message(cmd, now),
            Command::CancelInstance { instance_key } => self.cancel_instance(instance_key),
            Command::CloseSubscription {
                instance_key,
                element_id,
            } => self.close_subscription(instance_key, &element_id),
            Command::OpenMessageSubscription { subscription } => {
                self.open_message_subscription(subscription, now)
            }
            Command::ConfirmSubscription { element_key } => self.confirm_subscription(element_key),
            Command::CorrelateSubscription {
                element_key,
                message_key,
                variables,
            } => self.correlate_subscription(element_key, message_key, variables, now),
            Command::CloseMessageSubscription { element_key } => {
                self.close_message_subscription(element_key)
            }
        }
    }

    /// Deploy a process definition, returning the key of the deployed process
    ///
    /// Redeploying a process id creates a new version used by new instances.
    #[instrument(skip_all, fields(partition = self.partition_id(), process_id = %definition.id))]
    pub fn deploy(&mut self, definition: &ProcessDefinition) -> Result<u64, Rejection> {
        let mut process = definition.validate().map_err(|reason| {
            rejected(Rejection::InvalidDeployment {
                process_id: definition.id.clone(),
                reason,
            })
        })?;

        let key = self.state.peek_key();
        process.key = key;
        process.version = self
            .state
            .latest_process(&process.id)
            .map_or(1, |p| p.version + 1);
        debug!(key, version = process.version, "process deployed");
        self.write(key, Event::ProcessDeployed { process });
        Ok(key)
    }

    /// Create an instance of the latest version of a process
    ///
    /// The instance runs until it reaches a task or a message catch event.
    #[instrument(skip_all, fields(partition = self.partition_id(), process_id = process_id))]
    pub fn create_instance(
        &mut self,
        process_id: &str,
        variables: Option<Document>,
        now: u64,
    ) -> Result<u64, Rejection> {
        let Some(process) = self.state.latest_process(process_id) else {
            return Err(rejected(Rejection::ProcessNotFound(process_id.to_string())));
        };
        let process_key = process.key;

        let key = self.state.peek_key();
        self.write(
            key,
            Event::InstanceCreated {
                process_key,
                process_id: process_id.to_string(),
                variables: Document::or_empty(variables),
            },
        );
        debug!(instance_key = key, "instance created");
        self.activate(key, 0, now);
        Ok(key)
    }

    /// Complete a task with the payload supplied by the worker
    ///
    /// The output mappings merge the payload into the instance scope. A mapping
    /// failure raises an incident on the task element, the task itself is
    /// completed either way.
    #[instrument(skip_all, fields(partition = self.partition_id(), task_key = task_key))]
    pub fn complete_task(
        &mut self,
        task_key: u64,
        payload: Option<Document>,
        now: u64,
    ) -> Result<u64, Rejection> {
        let Some(task) = self.state.task(task_key).cloned() else {
            return Err(rejected(Rejection::TaskNotFound(task_key)));
        };

        let payload = Document::or_empty(payload);
        self.write(
            task_key,
            Event::TaskCompleted {
                element_key: task.element_key,
                payload: payload.clone(),
            },
        );

        let instance_key = task.instance_key;
        let Some(element) = self
            .state
            .instance(instance_key)
            .and_then(|i| i.element.clone())
        else {
            return Ok(task_key);
        };
        let Some(Activity::Task(activity)) = self.activity(instance_key, element.index) else {
            return Ok(task_key);
        };

        let scope = self.scope_of(instance_key);
        match activity.mappings.outputs.apply(&payload, &scope) {
            Ok(merged) => {
                self.write_variables(instance_key, &scope, &merged);
                self.complete_element(instance_key, now);
            }
            Err(err) => self.raise(element.key, |key| {
                Incident::io_mapping(key, &err, element.key, instance_key, &activity.id)
            }),
        }
        Ok(task_key)
    }

    /// Replace the whole document of a variable scope
    #[instrument(skip_all, fields(partition = self.partition_id(), scope_key = scope_key))]
    pub fn update_payload(&mut self, scope_key: u64, payload: Document) -> Result<u64, Rejection> {
        if !self.state.scopes().contains(scope_key) {
            return Err(rejected(Rejection::ScopeNotFound(scope_key)));
        }
        self.write(scope_key, Event::PayloadUpdated { payload });
        Ok(scope_key)
    }

    /// Publish a message, returning the message key
    ///
    /// The message correlates with the waiting subscription of the lowest
    /// element key for its name and correlation key. Without a match it is
    /// buffered for its time to live, unless that is zero. Only the partition
    /// owning the correlation key accepts the message.
    #[instrument(skip_all, fields(partition = self.partition_id(), name = %cmd.name, correlation_key = %cmd.correlation_key))]
    pub fn publish_message(&mut self, cmd: PublishMessage, now: u64) -> Result<u64, Rejection> {
        let PublishMessage {
            name,
            correlation_key,
            variables,
            id,
            ttl_ms,
        } = cmd;

        if name.is_empty() {
            return Err(rejected(Rejection::EmptyMessageName));
        }

        let owner = self.owner_of(&correlation_key);
        if owner != self.partition_id() {
            return Err(rejected(Rejection::WrongPartition {
                correlation_key,
                owner,
                partition: self.partition_id(),
            }));
        }

        let variables = Document::or_empty(variables);
        if !variables.is_map() {
            return Err(rejected(Rejection::InvalidMessageVariables));
        }

        let ttl_ms = ttl_ms.unwrap_or(self.default_ttl_ms);
        let message = Message {
            name,
            correlation_key,
            id,
            variables,
            ttl_ms,
        };

        if let Some(id) = message.id() {
            if self.state.messages().has_id(&message.name, id, now) {
                return Err(rejected(Rejection::DuplicateMessageId(id.to_string())));
            }
        }

        let key = self.state.peek_key();
        let matched = self
            .state
            .subscriptions()
            .first_opened(&message.name, &message.correlation_key)
            .map(|s| s.element_key);
        let deadline = (matched.is_none() && ttl_ms > 0).then(|| now.saturating_add(ttl_ms));
        let retain_id_until = message
            .id()
            .map(|_| now.saturating_add(ttl_ms.max(self.id_retention_ms)));
        let variables = message.variables.clone();

        debug!(key, buffered = deadline.is_some(), "message published");
        self.write(
            key,
            Event::MessagePublished {
                message,
                deadline,
                retain_id_until,
            },
        );

        if let Some(element_key) = matched {
            self.correlate(element_key, key, variables, now);
        }
        Ok(key)
    }

    /// Cancel a process instance with its tasks, subscriptions and incidents
    #[instrument(skip_all, fields(partition = self.partition_id(), instance_key = instance_key))]
    pub fn cancel_instance(&mut self, instance_key: u64) -> Result<u64, Rejection> {
        let Some(instance) = self.state.instance(instance_key) else {
            return Err(rejected(Rejection::InstanceNotFound(instance_key)));
        };
        let process_id = instance.process_id.clone();

        let subscriptions: Vec<_> = self
            .state
            .subscriptions()
            .of_instance(instance_key)
            .into_iter()
            .filter_map(|key| self.state.subscriptions().get(key).cloned())
            .collect();
        for subscription in subscriptions {
            self.close(subscription);
        }

        let tasks: Vec<(u64, u64)> = self
            .state
            .tasks_of(instance_key)
            .iter()
            .map(|t| (t.key, t.element_key))
            .collect();
        for (key, element_key) in tasks {
            self.write(key, Event::TaskCanceled { element_key });
        }

        let incidents: Vec<(u64, u64)> = self
            .state
            .incidents()
            .of_instance(instance_key)
            .iter()
            .map(|i| (i.key, i.subject_key))
            .collect();
        for (key, subject_key) in incidents {
            self.write(key, Event::IncidentResolved { subject_key });
        }

        self.write(instance_key, Event::InstanceCanceled { process_id });
        debug!("instance canceled");
        Ok(instance_key)
    }

    /// Close the subscription of a waiting element that was terminated
    ///
    /// A subscription that already started correlating cannot be closed.
    #[instrument(skip_all, fields(partition = self.partition_id(), instance_key = instance_key, element_id = element_id))]
    pub fn close_subscription(
        &mut self,
        instance_key: u64,
        element_id: &str,
    ) -> Result<u64, Rejection> {
        let Some(subscription) = self
            .state
            .subscriptions()
            .find(instance_key, element_id)
            .cloned()
        else {
            return Err(rejected(Rejection::SubscriptionNotFound {
                instance_key,
                element_id: element_id.to_string(),
            }));
        };

        if subscription.state == SubscriptionState::Correlating {
            return Err(rejected(Rejection::SubscriptionCorrelating {
                instance_key,
                element_id: element_id.to_string(),
            }));
        }

        let key = subscription.element_key;
        self.close(subscription);
        Ok(key)
    }

    /// Register the subscription of an element of another partition
    ///
    /// The subscription waits here, on the partition owning its correlation
    /// key, and may correlate with a buffered message right away.
    #[instrument(skip_all, fields(partition = self.partition_id(), element_key = subscription.element_key))]
    pub fn open_message_subscription(
        &mut self,
        subscription: Subscription,
        now: u64,
    ) -> Result<u64, Rejection> {
        let element_key = subscription.element_key;
        if self.state.subscriptions().get(element_key).is_some() {
            return Err(rejected(Rejection::SubscriptionExists(element_key)));
        }

        let mut subscription = subscription;
        subscription.state = SubscriptionState::Opening;
        subscription.message_key = None;
        self.write(
            element_key,
            Event::SubscriptionOpening {
                subscription: subscription.clone(),
            },
        );
        self.send(
            partition_of(subscription.instance_key),
            Command::ConfirmSubscription { element_key },
        );
        self.wait_for_message(subscription, now);
        Ok(element_key)
    }

    /// Mark an opening subscription as registered by the owning partition
    #[instrument(skip_all, fields(partition = self.partition_id(), element_key = element_key))]
    pub fn confirm_subscription(&mut self, element_key: u64) -> Result<u64, Rejection> {
        let Some(mut subscription) = self.state.subscriptions().get(element_key).cloned() else {
            return Err(rejected(Rejection::UnknownSubscription(element_key)));
        };

        // already matched by the owning partition
        if subscription.state != SubscriptionState::Opening {
            return Ok(element_key);
        }
        subscription.state = SubscriptionState::Opened;
        self.write(element_key, Event::SubscriptionOpened { subscription });
        Ok(element_key)
    }

    /// Correlate the message chosen by the owning partition with a subscription
    /// of this partition
    #[instrument(skip_all, fields(partition = self.partition_id(), element_key = element_key, message_key = message_key))]
    pub fn correlate_subscription(
        &mut self,
        element_key: u64,
        message_key: u64,
        variables: Document,
        now: u64,
    ) -> Result<u64, Rejection> {
        let Some(mut subscription) = self.state.subscriptions().get(element_key).cloned() else {
            return Err(rejected(Rejection::UnknownSubscription(element_key)));
        };
        if subscription.state == SubscriptionState::Correlating {
            return Err(rejected(Rejection::SubscriptionNotWaiting(element_key)));
        }

        subscription.state = SubscriptionState::Correlating;
        subscription.message_key = Some(message_key);
        self.write(
            element_key,
            Event::SubscriptionCorrelating {
                subscription: subscription.clone(),
            },
        );
        debug!("message correlated");
        self.merge_message(subscription, variables, now);
        Ok(element_key)
    }

    /// Drop the registration of a subscription of another partition
    ///
    /// The partition running the instance decides, so the registration is
    /// dropped even while correlating.
    #[instrument(skip_all, fields(partition = self.partition_id(), element_key = element_key))]
    pub fn close_message_subscription(&mut self, element_key: u64) -> Result<u64, Rejection> {
        let Some(mut subscription) = self.state.subscriptions().get(element_key).cloned() else {
            return Err(rejected(Rejection::UnknownSubscription(element_key)));
        };
        subscription.state = SubscriptionState::Closed;
        self.write(element_key, Event::SubscriptionClosed { subscription });
        Ok(element_key)
    }

    /// Expire buffered messages and release message ids whose time has passed
    ///
    /// Returns the number of records written.
    #[instrument(skip_all, fields(partition = self.partition_id(), now = now))]
    pub fn sweep(&mut self, now: u64) -> usize {
        let start = self.log.len();

        let expired: Vec<(u64, String, String)> = self
            .state
            .messages()
            .expired(now)
            .into_iter()
            .filter_map(|key| self.state.messages().get(key))
            .map(|b| {
                (
                    b.key,
                    b.message.name.clone(),
                    b.message.correlation_key.clone(),
                )
            })
            .collect();
        for (key, name, correlation_key) in expired {
            self.write(
                key,
                Event::MessageExpired {
                    name,
                    correlation_key,
                },
            );
        }

        for (key, name, id) in self.state.messages().expired_ids(now) {
            self.write(key, Event::MessageIdReleased { name, id });
        }

        let written = self.log.len() - start;
        if written > 0 {
            debug!(records = written, "sweep");
        }
        written
    }

    fn activity(&self, instance_key: u64, index: usize) -> Option<Activity> {
        let instance = self.state.instance(instance_key)?;
        self.state
            .process(instance.process_key)?
            .activity(index)
            .cloned()
    }

    fn scope_of(&self, key: u64) -> Document {
        self.state
            .scopes()
            .document(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Enter the element at `index`, completing the instance past the last one
    fn activate(&mut self, instance_key: u64, index: usize, now: u64) {
        let Some(instance) = self.state.instance(instance_key) else {
            return;
        };
        let process_id = instance.process_id.clone();

        let Some(activity) = self.activity(instance_key, index) else {
            self.write(instance_key, Event::InstanceCompleted { process_id });
            debug!(instance_key, "instance completed");
            return;
        };

        let element_key = self.state.peek_key();
        self.write(
            element_key,
            Event::ElementActivated {
                instance_key,
                element_id: activity.id().to_string(),
                index,
            },
        );

        match activity {
            Activity::Task(task) => self.create_task(instance_key, element_key, task),
            Activity::MessageCatch(catch) => {
                self.open_subscription(instance_key, element_key, catch, now)
            }
        }
    }

    fn complete_element(&mut self, instance_key: u64, now: u64) {
        let Some(element) = self
            .state
            .instance(instance_key)
            .and_then(|i| i.element.clone())
        else {
            return;
        };

        self.write(
            element.key,
            Event::ElementCompleted {
                instance_key,
                element_id: element.id,
            },
        );
        self.activate(instance_key, element.index + 1, now);
    }

    fn create_task(&mut self, instance_key: u64, element_key: u64, task: TaskActivity) {
        let scope = self.scope_of(instance_key);
        match task.mappings.inputs.apply(&scope, &Document::empty()) {
            Ok(payload) => {
                let key = self.state.peek_key();
                debug!(task_key = key, task_type = %task.task_type, "task created");
                self.write(
                    key,
                    Event::TaskCreated {
                        element_key,
                        instance_key,
                        task_type: task.task_type,
                        retries: task.retries,
                        payload,
                    },
                );
            }
            Err(err) => self.raise(element_key, |key| {
                Incident::io_mapping(key, &err, element_key, instance_key, &task.id)
            }),
        }
    }

    fn open_subscription(
        &mut self,
        instance_key: u64,
        element_key: u64,
        catch: CatchActivity,
        now: u64,
    ) {
        let variable = &catch.correlation_key;
        let correlation_key = match self.state.scopes().variable(instance_key, variable) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            other => {
                let message = match other {
                    Some(value) => format!(
                        "Failed to extract the correlation key by '{variable}': The value must be either a string or a number, but was {}.",
                        type_name(value)
                    ),
                    None => format!(
                        "Failed to extract the correlation key by '{variable}': no variable found with that name."
                    ),
                };
                self.raise(element_key, |key| {
                    Incident::new(
                        key,
                        ErrorType::ExtractValueError,
                        message,
                        element_key,
                        instance_key,
                        &catch.id,
                    )
                });
                return;
            }
        };

        let subscription = Subscription::new(
            element_key,
            instance_key,
            catch.id.as_str(),
            catch.message_name.as_str(),
            correlation_key,
        );
        self.write(
            element_key,
            Event::SubscriptionOpening {
                subscription: subscription.clone(),
            },
        );

        let owner = self.owner_of(&subscription.correlation_key);
        if owner != self.partition_id() {
            self.send(owner, Command::OpenMessageSubscription { subscription });
            return;
        }
        self.wait_for_message(subscription, now);
    }

    /// Open a subscription for correlation, trying the buffered messages first
    fn wait_for_message(&mut self, subscription: Subscription, now: u64) {
        let mut subscription = subscription;
        let element_key = subscription.element_key;
        subscription.state = SubscriptionState::Opened;
        debug!(
            element_key,
            message_name = %subscription.message_name,
            correlation_key = %subscription.correlation_key,
            "subscription opened"
        );
        let (name, correlation_key) = (
            subscription.message_name.clone(),
            subscription.correlation_key.clone(),
        );
        self.write(element_key, Event::SubscriptionOpened { subscription });

        if let Some(buffered) = self
            .state
            .messages()
            .first_match(&name, &correlation_key, now)
        {
            let (message_key, variables) = (buffered.key, buffered.message.variables.clone());
            self.correlate(element_key, message_key, variables, now);
        }
    }

    /// Correlate a message with an opened subscription
    ///
    /// The message is consumed here. The variables are merged right away when
    /// the instance runs on this partition, otherwise the partition running it
    /// is asked to.
    fn correlate(&mut self, element_key: u64, message_key: u64, variables: Document, now: u64) {
        let Some(mut subscription) = self.state.subscriptions().get(element_key).cloned() else {
            return;
        };

        subscription.state = SubscriptionState::Correlating;
        subscription.message_key = Some(message_key);
        self.write(
            element_key,
            Event::SubscriptionCorrelating {
                subscription: subscription.clone(),
            },
        );
        debug!(element_key, message_key, "message correlated");

        let partition = partition_of(subscription.instance_key);
        if partition != self.partition_id() {
            self.send(
                partition,
                Command::CorrelateSubscription {
                    element_key,
                    message_key,
                    variables,
                },
            );
            return;
        }
        self.merge_message(subscription, variables, now);
    }

    /// Merge the variables of a correlated message into the instance scope at
    /// its root
    ///
    /// If the merge fails, the subscription remains correlating and an incident
    /// is raised on the waiting element.
    fn merge_message(&mut self, subscription: Subscription, variables: Document, now: u64) {
        let instance_key = subscription.instance_key;
        let element_key = subscription.element_key;
        let scope = self.scope_of(instance_key);
        match Mappings::default().apply(&variables, &scope) {
            Ok(merged) => {
                self.write_variables(instance_key, &scope, &merged);
                self.close(subscription);
                self.complete_element(instance_key, now);
            }
            Err(err) => {
                let element_id = subscription.element_id;
                self.raise(element_key, |key| {
                    Incident::io_mapping(key, &err, element_key, instance_key, element_id)
                })
            }
        }
    }

    /// Close the subscription of an element of this partition, along with its
    /// registration on the partition owning the correlation key
    fn close(&mut self, subscription: Subscription) {
        let mut subscription = subscription;
        let element_key = subscription.element_key;
        let owner = self.owner_of(&subscription.correlation_key);
        subscription.state = SubscriptionState::Closed;
        self.write(element_key, Event::SubscriptionClosed { subscription });
        if owner != self.partition_id() {
            self.send(owner, Command::CloseMessageSubscription { element_key });
        }
    }

    /// Write a variable record for every top level member changed by a merge
    fn write_variables(&mut self, scope_key: u64, old: &Document, new: &Document) {
        for change in changes(old, new) {
            let event = if change.created {
                Event::VariableCreated {
                    scope_key,
                    name: change.name,
                    value: change.value,
                }
            } else {
                Event::VariableUpdated {
                    scope_key,
                    name: change.name,
                    value: change.value,
                }
            };
            self.write(scope_key, event);
        }
    }

    /// Raise the incident built for the next key, unless the element already
    /// has one open
    fn raise(&mut self, element_key: u64, incident: impl FnOnce(u64) -> Incident) {
        if self.state.incidents().is_open(element_key) {
            return;
        }
        let key = self.state.peek_key();
        let incident = incident(key);
        warn!(
            incident_key = key,
            error_type = incident.error_type.as_str(),
            element_id = %incident.element_id,
            "{}",
            incident.error_message
        );
        self.write(key, Event::IncidentCreated { incident });
    }
}
