//! Kafka message bus, the managed cloud broker transport

use crate::messaging::config::{KafkaConfig, MessagingConfig, TransportMode};
use crate::messaging::consumer::{dispatch, log_unacknowledged, redelivery_delay, Disposition};
use crate::messaging::credentials::CredentialCache;
use crate::messaging::envelope::MessageEnvelope;
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::metrics::{record_outbound, Outbound};
use crate::messaging::traits::{EnvelopeHandler, MessageBus, SubscriptionHandle};
use async_trait::async_trait;
use parking_lot::RwLock;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Message, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Client configuration shared by producers, consumers and admin clients
pub fn base_client_config(config: &KafkaConfig, sasl_password: Option<&str>) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("client.id", &config.client_id)
        .set("security.protocol", config.security_protocol());

    if config.enable_sasl {
        let password = sasl_password.or(config.sasl_password.as_deref());
        if let (Some(mechanism), Some(username), Some(password)) =
            (&config.sasl_mechanism, &config.sasl_username, password)
        {
            client_config
                .set("sasl.mechanism", mechanism)
                .set("sasl.username", username)
                .set("sasl.password", password);
        }
    }

    client_config
}

/// librdkafka's upper bound for `max.poll.interval.ms`
pub const MAX_POLL_INTERVAL_LIMIT_MS: u64 = 86_400_000;

/// Poll interval that survives one full retry cycle: the configured
/// allowance for handler time plus every backoff wait of the retry policy
pub fn max_poll_interval_for(configured_ms: u64, retry_backoff: Duration) -> u64 {
    let backoff_ms = u64::try_from(retry_backoff.as_millis()).unwrap_or(u64::MAX);
    configured_ms.saturating_add(backoff_ms).min(MAX_POLL_INTERVAL_LIMIT_MS)
}

/// Consumer settings layered on the shared client configuration
fn consumer_config(mut client_config: ClientConfig, kafka: &KafkaConfig, group: &str) -> ClientConfig {
    client_config
        .set("group.id", group)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", kafka.session_timeout_ms.to_string())
        .set("max.poll.interval.ms", kafka.max_poll_interval_ms.to_string());
    client_config
}

/// Whether the broker rejected the client's credentials
pub fn is_authentication_error(err: &KafkaError) -> bool {
    matches!(
        err.rdkafka_error_code(),
        Some(RDKafkaErrorCode::Authentication) | Some(RDKafkaErrorCode::SaslAuthenticationFailed)
    )
}

/// Map a Kafka client error onto the messaging taxonomy
pub fn map_kafka_error(context: &str, err: &KafkaError) -> MessagingError {
    let detail = format!("{}: {}", context, err);
    if is_authentication_error(err) {
        return MessagingError::AuthenticationFailed(detail);
    }
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::QueueFull) | Some(RDKafkaErrorCode::ThrottlingQuotaExceeded) => {
            MessagingError::Throttled(detail)
        }
        Some(RDKafkaErrorCode::MessageTimedOut)
        | Some(RDKafkaErrorCode::RequestTimedOut)
        | Some(RDKafkaErrorCode::OperationTimedOut) => MessagingError::Timeout(detail),
        Some(RDKafkaErrorCode::BrokerTransportFailure)
        | Some(RDKafkaErrorCode::AllBrokersDown)
        | Some(RDKafkaErrorCode::BrokerNotAvailable)
        | Some(RDKafkaErrorCode::NetworkException) => MessagingError::BrokerUnreachable(detail),
        Some(RDKafkaErrorCode::MessageSizeTooLarge) | Some(RDKafkaErrorCode::InvalidMessage) => {
            MessagingError::SerializationError(detail)
        }
        _ => MessagingError::PublishFailed(detail),
    }
}

/// Create topics, treating "already exists" as success
pub async fn create_topics(
    admin: &AdminClient<DefaultClientContext>,
    topics: &[NewTopic<'_>],
) -> MessagingResult<()> {
    let results = admin
        .create_topics(topics, &AdminOptions::new().operation_timeout(Some(Duration::from_secs(30))))
        .await
        .map_err(|e| map_kafka_error("Kafka topic creation failed", &e))?;

    for result in results {
        match result {
            Ok(topic) => info!(topic = %topic, "Kafka topic created"),
            Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                debug!(topic = %topic, "Kafka topic already exists")
            }
            Err((topic, code)) => {
                return Err(MessagingError::ConfigurationError(format!(
                    "failed to create Kafka topic '{}': {}",
                    topic, code
                )))
            }
        }
    }
    Ok(())
}

/// Topics sharing one partition count and replication factor
fn new_topics<'a>(names: &'a [String], partitions: i32, replication_factor: i32) -> Vec<NewTopic<'a>> {
    names
        .iter()
        .map(|name| NewTopic::new(name, partitions, TopicReplication::Fixed(replication_factor)))
        .collect()
}

fn create_producer(
    kafka: &KafkaConfig,
    settings: &[(&'static str, String)],
    sasl_password: Option<&str>,
) -> MessagingResult<FutureProducer> {
    let mut client_config = base_client_config(kafka, sasl_password);
    for (key, value) in settings {
        client_config.set(*key, value);
    }
    client_config
        .create()
        .map_err(|e| MessagingError::ConnectionFailed(format!("Kafka producer creation failed: {}", e)))
}

struct ProducerSlot {
    producer: Arc<FutureProducer>,
    secret: Option<String>,
}

/// Producer that follows the credential cache.
///
/// librdkafka reads the SASL password once, at creation, so whenever the
/// cache hands out a different secret the producer is rebuilt. A send the
/// broker rejects for authentication drops the cached secret and is retried
/// once with a fresh one.
pub struct RefreshingProducer {
    kafka: KafkaConfig,
    settings: Vec<(&'static str, String)>,
    credentials: Option<CredentialCache>,
    slot: RwLock<ProducerSlot>,
}

impl RefreshingProducer {
    pub async fn new(
        kafka: KafkaConfig,
        settings: Vec<(&'static str, String)>,
        credentials: Option<CredentialCache>,
    ) -> MessagingResult<Self> {
        let secret = match &credentials {
            Some(cache) => Some(cache.get().await?.secret),
            None => None,
        };
        let producer = Arc::new(create_producer(&kafka, &settings, secret.as_deref())?);

        Ok(Self {
            kafka,
            settings,
            credentials,
            slot: RwLock::new(ProducerSlot { producer, secret }),
        })
    }

    /// Producer built with the most recent secret, without consulting the cache
    pub fn current(&self) -> Arc<FutureProducer> {
        self.slot.read().producer.clone()
    }

    /// Client configuration carrying the most recent secret
    pub fn client_config(&self) -> ClientConfig {
        base_client_config(&self.kafka, self.slot.read().secret.as_deref())
    }

    /// Producer for the secret the cache currently holds
    pub async fn producer(&self) -> MessagingResult<Arc<FutureProducer>> {
        let cache = match &self.credentials {
            Some(cache) => cache,
            None => return Ok(self.current()),
        };
        let secret = cache.get().await?.secret;

        {
            let slot = self.slot.read();
            if slot.secret.as_deref() == Some(secret.as_str()) {
                return Ok(slot.producer.clone());
            }
        }

        let producer = Arc::new(create_producer(&self.kafka, &self.settings, Some(&secret))?);
        info!(bootstrap_servers = %self.kafka.bootstrap_servers, "Kafka producer rebuilt with refreshed credential");

        let mut slot = self.slot.write();
        slot.producer = producer.clone();
        slot.secret = Some(secret);
        Ok(producer)
    }

    /// Forget the cached secret so the next send fetches a new one
    pub async fn reject_credential(&self) {
        if let Some(cache) = &self.credentials {
            cache.invalidate().await;
        }
    }

    /// Produce one record and return its partition and offset
    pub async fn send(
        &self,
        context: &str,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: OwnedHeaders,
    ) -> MessagingResult<(i32, i64)> {
        let mut refreshed = false;
        loop {
            let producer = self.producer().await?;
            let record = FutureRecord::to(topic)
                .key(key)
                .payload(payload)
                .headers(headers.clone());

            match producer.send(record, Duration::from_secs(0)).await {
                Ok(position) => return Ok(position),
                Err((e, _)) if is_authentication_error(&e) && self.credentials.is_some() && !refreshed => {
                    warn!(topic = %topic, error = %e, "Kafka rejected credential, refreshing");
                    self.reject_credential().await;
                    refreshed = true;
                }
                Err((e, _)) => return Err(map_kafka_error(context, &e)),
            }
        }
    }
}

/// Offsets a consumer seeked back to, per partition.
///
/// Messages fetched before the seek took effect can still arrive from later
/// offsets; they are skipped so that committing one of them never covers the
/// message waiting to be redelivered.
#[derive(Debug, Default)]
struct Rewinds {
    pending: HashMap<(String, i32), i64>,
}

impl Rewinds {
    fn rewind(&mut self, topic: &str, partition: i32, offset: i64) {
        self.pending.insert((topic.to_string(), partition), offset);
    }

    /// False for a message fetched ahead of a rewound offset
    fn admit(&mut self, topic: &str, partition: i32, offset: i64) -> bool {
        let key = (topic.to_string(), partition);
        match self.pending.get(&key) {
            Some(&pending) if offset > pending => false,
            Some(&pending) if offset == pending => {
                self.pending.remove(&key);
                true
            }
            _ => true,
        }
    }
}

/// Seek back to `message` so the partition delivers it again
fn rewind(consumer: &StreamConsumer, message: &OwnedMessage, rewinds: &mut Rewinds) {
    rewinds.rewind(message.topic(), message.partition(), message.offset());
    if let Err(e) = consumer.seek(
        message.topic(),
        message.partition(),
        Offset::Offset(message.offset()),
        Duration::from_secs(5),
    ) {
        error!(
            topic = %message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            error = %e,
            "Kafka seek failed, partition waits for the next rebalance"
        );
    }
}

/// Message bus over Kafka topics
pub struct KafkaMessageBus {
    producer: RefreshingProducer,
    config: MessagingConfig,
}

impl KafkaMessageBus {
    /// Create a new Kafka message bus
    pub async fn new(config: MessagingConfig, credentials: Option<CredentialCache>) -> MessagingResult<Self> {
        let settings = vec![
            ("compression.type", config.kafka.compression_type.clone()),
            ("message.timeout.ms", config.kafka.message_timeout_ms.to_string()),
            ("enable.idempotence", "true".to_string()),
        ];
        let producer = RefreshingProducer::new(config.kafka.clone(), settings, credentials).await?;

        info!(bootstrap_servers = %config.kafka.bootstrap_servers, "Kafka message bus created");

        Ok(Self { producer, config })
    }

    async fn produce(&self, topic: &str, envelope: &MessageEnvelope) -> MessagingResult<()> {
        let payload = envelope.to_bytes()?;
        let mut headers = OwnedHeaders::new().insert(Header {
            key: "payload_type",
            value: Some(envelope.payload_type.as_str()),
        });
        if let Some(correlation_id) = &envelope.correlation_id {
            headers = headers.insert(Header {
                key: "correlation_id",
                value: Some(correlation_id.as_str()),
            });
        }

        self.producer
            .send("Kafka publish failed", topic, &envelope.message_id, &payload, headers)
            .await?;

        debug!(message_id = %envelope.message_id, topic = %topic, "Message published to Kafka");
        Ok(())
    }

    /// Consumers take the credential current at subscribe time
    fn consume(
        &self,
        topic: String,
        group: String,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> MessagingResult<SubscriptionHandle> {
        let consumer: StreamConsumer = consumer_config(self.producer.client_config(), &self.config.kafka, &group)
            .create()
            .map_err(|e| MessagingError::ConnectionFailed(format!("Kafka consumer creation failed: {}", e)))?;

        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|e| MessagingError::SubscribeFailed(format!("Kafka subscribe failed: {}", e)))?;

        info!(
            topic = %topic,
            group = %group,
            max_poll_interval_ms = self.config.kafka.max_poll_interval_ms,
            "Kafka subscription started"
        );

        Ok(SubscriptionHandle::spawn(group, move |signal| async move {
            let mut rewinds = Rewinds::default();
            let mut redeliveries = 0u32;

            loop {
                let received = tokio::select! {
                    _ = signal.cancelled() => break,
                    received = consumer.recv() => received.map(|message| message.detach()),
                };

                let message = match received {
                    Ok(message) => message,
                    Err(e) => {
                        error!(topic = %topic, error = %e, "Kafka receive failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                if !rewinds.admit(message.topic(), message.partition(), message.offset()) {
                    debug!(
                        topic = %topic,
                        partition = message.partition(),
                        offset = message.offset(),
                        "Skipping message fetched ahead of a redelivery"
                    );
                    continue;
                }

                let payload = message.payload().unwrap_or_default();
                let result = dispatch(&handler, payload, &topic, TransportMode::ManagedCloudBroker).await;

                match Disposition::of(&result) {
                    Disposition::Ack => {
                        redeliveries = 0;
                        if let Err(e) = commit_offset(&consumer, &message) {
                            warn!(topic = %topic, error = %e, "Kafka offset commit failed");
                        }
                    }
                    Disposition::Redeliver => {
                        redeliveries = redeliveries.saturating_add(1);
                        rewind(&consumer, &message, &mut rewinds);
                        let delay = redelivery_delay(redeliveries);
                        warn!(
                            topic = %topic,
                            partition = message.partition(),
                            offset = message.offset(),
                            redeliveries,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "Message not acknowledged, redelivering"
                        );

                        tokio::select! {
                            biased;
                            _ = signal.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Disposition::Abandon => {
                        rewind(&consumer, &message, &mut rewinds);
                        log_unacknowledged(payload, &topic, "handler cancelled, offset left uncommitted");
                        break;
                    }
                }
            }
            consumer.unsubscribe();
        }))
    }
}

/// Commit the offset following `message` for its partition
fn commit_offset(consumer: &StreamConsumer, message: &OwnedMessage) -> MessagingResult<()> {
    let mut offsets = TopicPartitionList::new();
    offsets
        .add_partition_offset(message.topic(), message.partition(), Offset::Offset(message.offset() + 1))
        .map_err(|e| MessagingError::ConsumeFailed(format!("invalid offset: {}", e)))?;
    consumer
        .commit(&offsets, CommitMode::Async)
        .map_err(|e| MessagingError::ConsumeFailed(format!("Kafka commit failed: {}", e)))
}

#[async_trait]
impl MessageBus for KafkaMessageBus {
    async fn send(&self, envelope: MessageEnvelope, destination: Option<&str>) -> MessagingResult<()> {
        let queue = self.config.queue_or_default(destination);
        let result = self.produce(&self.config.full_topic(queue), &envelope).await;
        record_outbound(Outbound::Send, queue, TransportMode::ManagedCloudBroker, &result);
        result
    }

    async fn publish(&self, envelope: MessageEnvelope, topic: Option<&str>) -> MessagingResult<()> {
        let topic = self.config.topic_or_default(topic);
        let result = self.produce(&self.config.full_topic(topic), &envelope).await;
        record_outbound(Outbound::Publish, topic, TransportMode::ManagedCloudBroker, &result);
        result
    }

    async fn subscribe(
        &self,
        handler: Arc<dyn EnvelopeHandler>,
        subscription_name: Option<&str>,
    ) -> MessagingResult<SubscriptionHandle> {
        let topic = self.config.full_topic(&self.config.default_topic);
        let group = subscription_name.unwrap_or(&self.config.kafka.group_id).to_string();
        self.consume(topic, group, handler)
    }

    async fn subscribe_queue(
        &self,
        queue: &str,
        handler: Arc<dyn EnvelopeHandler>,
        subscription_name: Option<&str>,
    ) -> MessagingResult<SubscriptionHandle> {
        let topic = self.config.full_topic(queue);
        let group = subscription_name.unwrap_or(&self.config.kafka.group_id).to_string();
        self.consume(topic, group, handler)
    }

    async fn ensure_infrastructure(&self) -> MessagingResult<()> {
        let admin: AdminClient<DefaultClientContext> = self
            .producer
            .client_config()
            .create()
            .map_err(|e| MessagingError::ConnectionFailed(format!("Kafka admin client creation failed: {}", e)))?;

        let names = [
            self.config.full_topic(&self.config.default_queue),
            self.config.full_topic(&self.config.default_topic),
        ];
        let topics = new_topics(&names, self.config.kafka.partitions, self.config.kafka.replication_factor);

        create_topics(&admin, &topics).await
    }

    async fn is_connected(&self) -> bool {
        self.producer
            .current()
            .client()
            .fetch_metadata(None, Duration::from_secs(5))
            .is_ok()
    }

    async fn close(&self) -> MessagingResult<()> {
        self.producer
            .current()
            .flush(Duration::from_secs(10))
            .map_err(|e| map_kafka_error("Kafka flush failed", &e))
    }

    fn transport(&self) -> TransportMode {
        TransportMode::ManagedCloudBroker
    }
}
