#![cfg_attr(docsrs, feature(doc_cfg))]
//! broker-core is the variable mapping and message correlation core of a workflow-automation broker.
//!
//! Process instances carry their data in a tree of variable scopes. When an instance enters a
//! task, the [input mappings](`mapping`) of the task select parts of the scope into the task
//! payload; when a worker completes the task, the output mappings merge the result back into the
//! scope. Instances waiting on a message catch event open a [subscription](`message::Subscription`)
//! that published messages are correlated with, by message name and correlation key.
//!
//! # Features
//!
//! - Declarative input/output mappings using a subset of [JSONPath](https://goessner.net/articles/JsonPath/),
//!   validated at deployment so ambiguous or unsupported expressions never reach runtime.
//! - Runtime mapping faults become [incidents](`incident::Incident`) that stall one element instance,
//!   never the broker.
//! - Message correlation with time-to-live buffering, late correlation and duplicate message id rejection.
//! - Event sourced partitions. The [engine](`engine::Engine`) state is only changed by applying log records,
//!   so replaying the log rebuilds it exactly.
//! - Partitions run on their own tokio task. Messages and subscriptions live on the partition owning
//!   their correlation key; an instance running elsewhere registers its subscriptions there and is
//!   told when a message correlates.
//!
//! # Broker
//!
//! ```rust,no_run
//! use broker_core::broker::Broker;
//! use broker_core::config::Opts;
//! use broker_core::document::Document;
//! use broker_core::engine::{ProcessDefinition, PublishMessage};
//! use broker_core::mapping::IoMapping;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let broker = Broker::start(Opts::default().partitions(3));
//!
//! // wait for the cancellation of an order, then notify the customer
//! let process = ProcessDefinition::new("order-process")
//!     .message_catch("order-canceled", "order canceled", "orderId")
//!     .service_task(
//!         "notify",
//!         "email",
//!         IoMapping::new().input("$.customer.email", "$.to"),
//!     );
//! broker.deploy(process).await.unwrap();
//!
//! let variables = json!({"orderId": "order-123", "customer": {"email": "jane@example.com"}});
//! broker
//!     .create_instance("order-process", Some(Document::new(variables)))
//!     .await
//!     .unwrap();
//!
//! broker
//!     .publish_message(PublishMessage::new("order canceled", "order-123").id("cancel-123"))
//!     .await
//!     .unwrap();
//! # })
//! ```
//!
//! # Mappings
//!
//! A mapping copies the value at a source path of one document to a target path of another. Paths
//! start at the root `$` followed by member (`.name`, `['name']`) and index (`[0]`) steps.
//! Wildcards, recursive descent and filters are rejected at deployment, and so is a mapping from or
//! to the root combined with other mappings of the same direction.
//!
//! When no mapping is declared, the whole document is copied. A missing payload is the empty map.
//!
//! # Logging
//!
//! The library uses the [tracing crate](https://crates.io/crates/tracing). Partitions run in a
//! `partition` span and every command handler is instrumented.

pub mod broker;
pub mod config;
pub mod document;
pub mod engine;
pub mod incident;
pub mod mapping;
pub mod message;
pub mod partition;
pub mod path;
pub mod scope;
