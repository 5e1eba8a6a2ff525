//! Client Handles
//!
//! The wrapper-facing surface: one typed handle per client kind, each bundling the
//! engine with admin queries over the same cluster context, plus [`ClientHandle`]
//! for callers that keep producers and consumers in one collection.
//!
//! Handles own their cluster; `close` releases every connection the handle opened.

use std::sync::Arc;
use std::time::Duration;

use brokerlink_core::protocol::TopicConfig;
use brokerlink_core::Connector;
use bytes::Bytes;

use crate::admin::{Admin, PartitionDetails, TopicInfo};
use crate::config::{ConsumerConfig, ProducerConfig};
use crate::consumer::{ConsumedRecord, Consumer};
use crate::error::{ClientError, Result};
use crate::producer::{Message, Producer, RecordAck};

/// Producer plus admin queries.
#[derive(Debug)]
pub struct ProducerHandle {
    producer: Producer,
    admin: Admin,
}

impl ProducerHandle {
    /// Contact the bootstrap brokers and start a producer.
    ///
    /// Fails with `Connection` if no bootstrap broker answers.
    pub async fn connect<S: AsRef<str>>(
        connector: Arc<dyn Connector>,
        bootstrap_servers: &[S],
        config: ProducerConfig,
    ) -> Result<Self> {
        let producer = Producer::builder()
            .config(config)
            .bootstrap_servers(bootstrap_servers.iter().map(|s| s.as_ref().to_string()))
            .connector(connector)
            .build()
            .await?;
        let admin = Admin::new(producer.cluster().clone());
        Ok(Self { producer, admin })
    }

    /// Send one record and wait for its acknowledgement.
    pub async fn send(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        value: &[u8],
        partition: Option<i32>,
    ) -> Result<RecordAck> {
        let mut message = Message::new(topic, Bytes::copy_from_slice(value));
        if let Some(key) = key {
            message = message.with_key(Bytes::copy_from_slice(key));
        }
        if let Some(partition) = partition {
            message = message.with_partition(partition);
        }
        self.producer.send(message).await?.await
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    /// Admin queries over this handle's cluster. Fails with `Closed` after `close`.
    pub fn admin(&self) -> Result<&Admin> {
        if self.producer.is_closed() {
            return Err(ClientError::Closed("producer"));
        }
        Ok(&self.admin)
    }

    pub async fn close(&self) -> Result<()> {
        self.producer.close().await
    }
}

/// Consumer plus admin queries.
#[derive(Debug)]
pub struct ConsumerHandle {
    consumer: Consumer,
    admin: Admin,
}

impl ConsumerHandle {
    /// Contact the bootstrap brokers and start a consumer in `group_id`.
    pub async fn connect<S: AsRef<str>>(
        connector: Arc<dyn Connector>,
        bootstrap_servers: &[S],
        group_id: &str,
        config: ConsumerConfig,
    ) -> Result<Self> {
        let consumer = Consumer::builder()
            .config(config)
            .bootstrap_servers(bootstrap_servers.iter().map(|s| s.as_ref().to_string()))
            .group_id(group_id)
            .connector(connector)
            .build()
            .await?;
        let admin = Admin::new(consumer.cluster().clone());
        Ok(Self { consumer, admin })
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.consumer.subscribe(&[topic]).await
    }

    pub async fn poll(&self, timeout: Duration) -> Result<Vec<ConsumedRecord>> {
        Ok(self.consumer.poll(timeout).await?.records)
    }

    pub async fn seek_to_timestamp(&self, topic: &str, timestamp_ms: i64) -> Result<()> {
        self.consumer
            .seek_to_timestamp(topic, timestamp_ms)
            .await
            .map(|_| ())
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    /// Admin queries over this handle's cluster. Fails with `Closed` after `close`.
    pub fn admin(&self) -> Result<&Admin> {
        if self.consumer.is_closed() {
            return Err(ClientError::Closed("consumer"));
        }
        Ok(&self.admin)
    }

    pub async fn close(&self) -> Result<()> {
        self.consumer.close().await
    }
}

/// Either kind of handle.
#[derive(Debug)]
pub enum ClientHandle {
    Producer(ProducerHandle),
    Consumer(ConsumerHandle),
}

impl ClientHandle {
    fn admin(&self) -> Result<&Admin> {
        match self {
            ClientHandle::Producer(h) => h.admin(),
            ClientHandle::Consumer(h) => h.admin(),
        }
    }

    pub async fn list_topics(&self, timeout: Duration) -> Result<Vec<String>> {
        self.admin()?.list_topics(timeout).await
    }

    pub async fn topic_info(&self, topic: &str) -> Result<TopicInfo> {
        self.admin()?.topic_info(topic).await
    }

    pub async fn partition_details(&self, topic: &str) -> Result<Vec<PartitionDetails>> {
        self.admin()?.partition_details(topic).await
    }

    pub async fn describe_topic_config(&self, topic: &str) -> Result<TopicConfig> {
        self.admin()?.describe_topic_config(topic).await
    }

    pub fn as_producer(&self) -> Option<&ProducerHandle> {
        match self {
            ClientHandle::Producer(h) => Some(h),
            ClientHandle::Consumer(_) => None,
        }
    }

    pub fn as_consumer(&self) -> Option<&ConsumerHandle> {
        match self {
            ClientHandle::Consumer(h) => Some(h),
            ClientHandle::Producer(_) => None,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            ClientHandle::Producer(h) => h.close().await,
            ClientHandle::Consumer(h) => h.close().await,
        }
    }
}

impl From<ProducerHandle> for ClientHandle {
    fn from(handle: ProducerHandle) -> Self {
        ClientHandle::Producer(handle)
    }
}

impl From<ConsumerHandle> for ClientHandle {
    fn from(handle: ConsumerHandle) -> Self {
        ClientHandle::Consumer(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OffsetReset;
    use crate::error::ErrorKind;
    use brokerlink_sim::SimCluster;

    #[tokio::test]
    async fn test_producer_handle_unreachable_bootstrap() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let err = ProducerHandle::connect(
            Arc::new(sim),
            &["localhost:1"],
            ProducerConfig::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_handles_share_one_enum() {
        let sim = SimCluster::builder().topic("orders", 2).build();
        let producer = ProducerHandle::connect(
            Arc::new(sim.clone()),
            &["localhost:9092"],
            ProducerConfig::default(),
        )
        .await
        .unwrap();
        let config = ConsumerConfig {
            auto_offset_reset: OffsetReset::Earliest,
            ..ConsumerConfig::default()
        };
        let consumer = ConsumerHandle::connect(Arc::new(sim), &["localhost:9092"], "g1", config)
            .await
            .unwrap();

        let handles: Vec<ClientHandle> = vec![producer.into(), consumer.into()];
        for handle in &handles {
            assert_eq!(
                handle.list_topics(Duration::from_secs(1)).await.unwrap(),
                vec!["orders".to_string()]
            );
        }

        let ack = handles[0]
            .as_producer()
            .unwrap()
            .send("orders", None, b"hello", Some(1))
            .await
            .unwrap();
        assert_eq!((ack.partition, ack.offset), (1, 0));

        let consumer = handles[1].as_consumer().unwrap();
        consumer.subscribe("orders").await.unwrap();
        let records = consumer.poll(Duration::from_secs(1)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, Bytes::from_static(b"hello"));

        for handle in &handles {
            handle.close().await.unwrap();
            handle.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_admin_queries_rejected_after_close() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let producer = ProducerHandle::connect(
            Arc::new(sim.clone()),
            &["localhost:9092"],
            ProducerConfig::default(),
        )
        .await
        .unwrap();
        let consumer = ConsumerHandle::connect(
            Arc::new(sim.clone()),
            &["localhost:9092"],
            "g1",
            ConsumerConfig::default(),
        )
        .await
        .unwrap();
        let handles: Vec<ClientHandle> = vec![producer.into(), consumer.into()];

        for handle in &handles {
            handle.close().await.unwrap();
        }
        let opened = sim.connection_count();

        for handle in &handles {
            let err = handle.list_topics(Duration::from_secs(1)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Closed);
            let err = handle.topic_info("orders").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Closed);
        }
        assert!(handles[0].as_producer().unwrap().admin().is_err());
        assert!(handles[1].as_consumer().unwrap().admin().is_err());
        assert_eq!(sim.connection_count(), opened);
    }
}
