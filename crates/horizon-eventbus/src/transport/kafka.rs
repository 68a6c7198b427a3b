//! Kafka transport backed by rdkafka.

use super::{
    ConsumerSpec, DeliveryReceipt, InboundMessage, MessageConsumer, MessageProducer,
    OutboundMessage, TopicSpec, Transport,
};
use crate::config::KafkaConfig;
use crate::error::BusError;
use crate::health::HealthStatus;
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, info};

const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection to a Kafka cluster.
pub struct KafkaTransport {
    config: KafkaConfig,
    admin: AdminClient<DefaultClientContext>,
    metadata: FutureProducer,
}

impl KafkaTransport {
    /// Create admin and metadata clients. Connections are established lazily.
    pub fn new(config: KafkaConfig) -> Result<Self, BusError> {
        let admin: AdminClient<DefaultClientContext> = base_config(&config)
            .create()
            .map_err(|e| connection_failed(&config, e))?;

        let metadata: FutureProducer = base_config(&config)
            .create()
            .map_err(|e| connection_failed(&config, e))?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            client_id = %config.client_id,
            "Kafka transport created"
        );

        Ok(Self {
            config,
            admin,
            metadata,
        })
    }
}

fn base_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("client.id", &config.client_id)
        .set("security.protocol", config.security_protocol.as_str());

    if let Some(sasl) = &config.sasl {
        client_config
            .set("sasl.mechanism", sasl.mechanism.as_str())
            .set("sasl.username", &sasl.username)
            .set("sasl.password", &sasl.password);
    }

    client_config
}

fn connection_failed(config: &KafkaConfig, e: KafkaError) -> BusError {
    BusError::ConnectionFailed {
        broker: config.bootstrap_servers.clone(),
        cause: e.to_string(),
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    fn broker(&self) -> &str {
        &self.config.bootstrap_servers
    }

    async fn ensure_topic(&self, spec: &TopicSpec) -> Result<(), BusError> {
        let topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor),
        );
        let options = AdminOptions::new().operation_timeout(Some(ADMIN_TIMEOUT));

        let results = self
            .admin
            .create_topics(&[topic], &options)
            .await
            .map_err(|e| connection_failed(&self.config, e))?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, partitions = spec.partitions, "Topic created"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Topic already exists");
                }
                Err((name, code)) => {
                    return Err(BusError::ConnectionFailed {
                        broker: self.config.bootstrap_servers.clone(),
                        cause: format!("creating topic {name}: {code}"),
                    });
                }
            }
        }

        Ok(())
    }

    fn producer(&self, publish_timeout: Duration) -> Result<Box<dyn MessageProducer>, BusError> {
        let mut client_config = base_config(&self.config);
        client_config
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", publish_timeout.as_millis().to_string());

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| connection_failed(&self.config, e))?;

        Ok(Box::new(KafkaProducer {
            producer,
            publish_timeout,
        }))
    }

    fn consumer(&self, spec: &ConsumerSpec) -> Result<Box<dyn MessageConsumer>, BusError> {
        let mut client_config = base_config(&self.config);
        client_config
            .set("group.id", &spec.group_id)
            .set("auto.offset.reset", spec.start_offset.as_str())
            .set("enable.auto.commit", "false")
            .set(
                "session.timeout.ms",
                spec.session_timeout.as_millis().to_string(),
            );

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| connection_failed(&self.config, e))?;

        consumer
            .subscribe(&[spec.topic.as_str()])
            .map_err(|e| BusError::ConsumeFailed {
                topic: spec.topic.clone(),
                cause: e.to_string(),
            })?;

        info!(topic = %spec.topic, group_id = %spec.group_id, "Subscribed to topic");

        Ok(Box::new(KafkaConsumer {
            consumer,
            topic: spec.topic.clone(),
            assignment: Vec::new(),
            generation: 0,
        }))
    }

    async fn health(&self, topic: &str) -> Result<HealthStatus, BusError> {
        let client = self.metadata.clone();
        let topic_name = topic.to_string();
        let broker = self.config.bootstrap_servers.clone();

        tokio::task::spawn_blocking(move || {
            let metadata = client
                .client()
                .fetch_metadata(Some(&topic_name), METADATA_TIMEOUT)
                .map_err(|e| BusError::ConnectionFailed {
                    broker: broker.clone(),
                    cause: e.to_string(),
                })?;

            let partitions = metadata
                .topics()
                .iter()
                .filter(|t| t.name() == topic_name && t.error().is_none())
                .map(|t| t.partitions().iter().filter(|p| p.leader() >= 0).count())
                .sum();

            Ok(HealthStatus {
                connected: true,
                brokers: metadata.brokers().len(),
                partitions,
            })
        })
        .await
        .map_err(|e| BusError::ConnectionFailed {
            broker: self.config.bootstrap_servers.clone(),
            cause: e.to_string(),
        })?
    }
}

struct KafkaProducer {
    producer: FutureProducer,
    publish_timeout: Duration,
}

#[async_trait]
impl MessageProducer for KafkaProducer {
    async fn send(&self, message: OutboundMessage) -> Result<DeliveryReceipt, BusError> {
        let headers = message
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(&value[..]),
                })
            });

        let record = FutureRecord::to(&message.topic)
            .key(&message.key[..])
            .payload(&message.payload[..])
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, self.publish_timeout)
            .await
            .map_err(|(err, _)| match err {
                KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut) => {
                    BusError::PublishTimeout {
                        topic: message.topic.clone(),
                    }
                }
                other => BusError::PublishFailed {
                    topic: message.topic.clone(),
                    cause: other.to_string(),
                },
            })?;

        Ok(DeliveryReceipt { partition, offset })
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BusError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BusError::PublishFailed {
                topic: String::new(),
                cause: e.to_string(),
            })?
            .map_err(BusError::from)
    }
}

struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
    assignment: Vec<i32>,
    generation: u64,
}

impl KafkaConsumer {
    fn track_assignment(&mut self) {
        let Ok(list) = self.consumer.assignment() else {
            return;
        };
        let mut partitions: Vec<i32> = list.elements().iter().map(|e| e.partition()).collect();
        partitions.sort_unstable();

        if partitions != self.assignment {
            debug!(topic = %self.topic, partitions = ?partitions, "Partition assignment changed");
            self.assignment = partitions;
            self.generation += 1;
        }
    }
}

#[async_trait]
impl MessageConsumer for KafkaConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, BusError> {
        let received = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => None,
            Ok(Err(e)) => {
                return Err(BusError::ConsumeFailed {
                    topic: self.topic.clone(),
                    cause: e.to_string(),
                })
            }
            Ok(Ok(message)) => Some(InboundMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(Bytes::copy_from_slice),
                payload: message.payload().map(Bytes::copy_from_slice),
            }),
        };

        self.track_assignment();
        Ok(received)
    }

    fn commit(&mut self, message: &InboundMessage) -> Result<(), BusError> {
        let commit_failed = |e: KafkaError| BusError::CommitFailed {
            topic: message.topic.clone(),
            partition: message.partition,
            cause: e.to_string(),
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )
        .map_err(commit_failed)?;

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(commit_failed)
    }

    fn assignment_generation(&self) -> u64 {
        self.generation
    }

    async fn close(self: Box<Self>) {
        self.consumer.unsubscribe();
        debug!(topic = %self.topic, "Consumer left group");
    }
}
