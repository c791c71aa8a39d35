/// RabbitMq publisher and consumer over pooled channels
///
/// Each server gets one shared AMQP connection, redialed once it drops.
/// The pool lends out channels opened on those connections and shards them
/// over the hash ring by op code. Messages go to the `pgo.<exchange>`
/// exchange under the routing key `pgo.<exchange>.<opCode>`, with a JSON
/// body and `logId`, `service` and `opUid` headers.
use crate::clients::log_failure;
use crate::config::RabbitMqConfig;
use crate::core::pool::{Handle, Pool, PooledConn, Protocol};
use crate::core::value::Encode;
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info};

const NAME_PREFIX: &str = "pgo.";

/// An open channel plus its share of the per-server channel limit
pub struct ChannelBox {
    addr: String,
    channel: Channel,
    last_active: Instant,
    _permit: OwnedSemaphorePermit,
}

impl ChannelBox {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl Handle for ChannelBox {
    fn addr(&self) -> &str {
        &self.addr
    }

    fn is_down(&self) -> bool {
        !self.channel.status().connected()
    }

    fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    fn park(&mut self) {
        self.last_active = Instant::now();
    }
}

/// Opens channels on one shared connection per server
pub struct AmqpProtocol {
    user: String,
    pass: String,
    max_channels: usize,
    max_wait: Duration,
    connections: tokio::sync::Mutex<HashMap<String, Connection>>,
    limits: parking_lot::Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl AmqpProtocol {
    pub fn new(user: &str, pass: &str, max_channels: usize, max_wait: Duration) -> Self {
        Self {
            user: user.to_string(),
            pass: pass.to_string(),
            max_channels: max_channels.max(1),
            max_wait,
            connections: tokio::sync::Mutex::new(HashMap::new()),
            limits: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn uri(&self, addr: &str) -> String {
        format!("amqp://{}:{}@{}", self.user, self.pass, addr)
    }

    /// Wait up to `max_wait` for a free channel slot on `addr`
    async fn channel_permit(&self, addr: &str) -> CacheResult<OwnedSemaphorePermit> {
        let limiter = {
            let mut limits = self.limits.lock();
            let limiter = limits
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_channels)));
            Arc::clone(limiter)
        };

        match timeout(self.max_wait, limiter.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(CacheError::internal("channel limiter closed")),
            Err(_) => Err(CacheError::timeout(format!("channel on {}", addr))),
        }
    }
}

#[async_trait]
impl Protocol for AmqpProtocol {
    type Handle = ChannelBox;

    fn name(&self) -> &'static str {
        "rabbitmq"
    }

    async fn connect(&self, addr: &str, net_timeout: Duration) -> CacheResult<ChannelBox> {
        let permit = self.channel_permit(addr).await?;

        let mut connections = self.connections.lock().await;
        let channel = match connections.get(addr) {
            Some(connection) if connection.status().connected() => connection.create_channel().await?,
            _ => {
                let uri = self.uri(addr);
                let dial = Connection::connect(&uri, ConnectionProperties::default());
                let connection = timeout(net_timeout, dial)
                    .await
                    .map_err(|_| CacheError::timeout(format!("connect to {}", addr)))??;
                info!("rabbitmq: connected to {}", addr);
                let channel = connection.create_channel().await?;
                connections.insert(addr.to_string(), connection);
                channel
            }
        };

        Ok(ChannelBox {
            addr: addr.to_string(),
            channel,
            last_active: Instant::now(),
            _permit: permit,
        })
    }

    async fn keepalive(&self, channel: &mut ChannelBox) -> CacheResult<()> {
        if channel.is_down() {
            Err(CacheError::protocol(format!("channel {} closed", channel.channel.id())))
        } else {
            Ok(())
        }
    }
}

/// Queue subscription parameters
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub queue: String,
    /// Bound to the queue as `pgo.<exchange>.<opCode>`
    pub op_codes: Vec<String>,
    /// Unacknowledged deliveries in flight
    pub prefetch: u16,
    /// Without it every delivery needs an explicit ack
    pub auto_ack: bool,
    pub no_wait: bool,
    pub exclusive: bool,
}

impl ConsumeOptions {
    pub fn new(queue: &str, op_codes: &[&str]) -> Self {
        Self {
            queue: queue.to_string(),
            op_codes: op_codes.iter().map(|c| c.to_string()).collect(),
            prefetch: 1,
            auto_ack: false,
            no_wait: false,
            exclusive: false,
        }
    }
}

/// A consumer and the channel it lives on; the channel never returns to
/// the pool
pub struct Subscription {
    channel: ChannelBox,
    consumer: Consumer,
}

impl Subscription {
    pub fn channel(&self) -> &Channel {
        self.channel.channel()
    }

    /// Stream of deliveries
    pub fn consumer(&mut self) -> &mut Consumer {
        &mut self.consumer
    }
}

/// Metadata carried by a published message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    pub exchange: String,
    pub route_key: String,
    pub log_id: String,
    pub service: String,
    pub op_uid: String,
    /// Seconds since the epoch
    pub timestamp: Option<u64>,
    pub message_id: Option<String>,
}

/// Map a configured exchange type onto its AMQP kind
pub fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

/// Headers of a delivery, unknown header names are ignored
pub fn decode_headers(exchange: &str, route_key: &str, properties: &BasicProperties) -> MessageHeaders {
    let mut headers = MessageHeaders {
        exchange: exchange.to_string(),
        route_key: route_key.to_string(),
        timestamp: *properties.timestamp(),
        message_id: properties.message_id().as_ref().map(|id| id.as_str().to_string()),
        ..Default::default()
    };

    let Some(table) = properties.headers() else {
        return headers;
    };
    for (name, value) in table.inner() {
        let value = match value {
            AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
            AMQPValue::ShortString(s) => s.as_str().to_string(),
            _ => continue,
        };
        match name.as_str() {
            "logId" => headers.log_id = value,
            "service" => headers.service = value,
            "opUid" => headers.op_uid = value,
            _ => {}
        }
    }
    headers
}

pub fn delivery_headers(delivery: &Delivery) -> MessageHeaders {
    decode_headers(
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        &delivery.properties,
    )
}

/// Deserialize a JSON message body
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> CacheResult<T> {
    Ok(serde_json::from_slice(body)?)
}

/// RabbitMq client
#[derive(Clone)]
pub struct Client {
    pool: Pool<AmqpProtocol>,
    exchange_name: String,
    exchange_type: String,
    service_name: String,
}

impl Client {
    pub async fn new(config: &RabbitMqConfig) -> CacheResult<Self> {
        config.validate()?;
        let protocol = AmqpProtocol::new(
            &config.user,
            &config.pass,
            config.max_channel_num,
            config.max_wait_time(),
        );

        Ok(Self {
            pool: Pool::new(protocol, config.pool_options()).await?,
            exchange_name: config.exchange_name.clone(),
            exchange_type: config.exchange_type.clone(),
            service_name: config.service_name.clone(),
        })
    }

    pub fn pool(&self) -> &Pool<AmqpProtocol> {
        &self.pool
    }

    pub fn exchange_name(&self) -> String {
        format!("{}{}", NAME_PREFIX, self.exchange_name)
    }

    pub fn route_key(&self, op_code: &str) -> String {
        format!("{}{}.{}", NAME_PREFIX, self.exchange_name, op_code)
    }

    async fn channel_for(&self, key: &str) -> CacheResult<PooledConn<AmqpProtocol>> {
        let addr = self.pool.route("PUBLISH", key)?;
        self.pool.acquire(&addr).await
    }

    /// Declare the durable exchange on the server serving `op_code`
    pub async fn declare_exchange(&self, op_code: &str) -> bool {
        log_failure("rabbitmq", "declare", self.try_declare_exchange(op_code).await).is_some()
    }

    pub async fn try_declare_exchange(&self, op_code: &str) -> CacheResult<()> {
        let channel = self.channel_for(op_code).await?;
        let result = self.declare(channel.channel()).await;
        finish(channel, result)
    }

    async fn declare(&self, channel: &Channel) -> CacheResult<()> {
        let options = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        channel
            .exchange_declare(
                &self.exchange_name(),
                exchange_kind(&self.exchange_type),
                options,
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Properties stamped on every published message
    pub fn publish_properties(&self, op_uid: &str, log_id: &str) -> BasicProperties {
        let mut headers = FieldTable::default();
        headers.insert("logId".into(), AMQPValue::LongString(log_id.into()));
        headers.insert("service".into(), AMQPValue::LongString(self.service_name.as_str().into()));
        headers.insert("opUid".into(), AMQPValue::LongString(op_uid.into()));

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        BasicProperties::default()
            .with_content_type("text/plain".into())
            .with_headers(headers)
            .with_timestamp(now)
    }

    pub async fn publish<V: Encode>(&self, op_code: &str, data: V, op_uid: &str, log_id: &str) -> bool {
        let result = self.try_publish(op_code, data, op_uid, log_id).await;
        log_failure("rabbitmq", "publish", result).is_some()
    }

    /// Publish `data` under `op_code`; the exchange must already exist
    pub async fn try_publish<V: Encode>(
        &self,
        op_code: &str,
        data: V,
        op_uid: &str,
        log_id: &str,
    ) -> CacheResult<()> {
        if op_code.is_empty() {
            return Err(CacheError::command("op code cannot be empty"));
        }
        let body = data.encode()?;
        let properties = self.publish_properties(op_uid, log_id);

        let channel = self.channel_for(op_code).await?;
        let result = async {
            channel
                .channel()
                .basic_publish(
                    &self.exchange_name(),
                    &self.route_key(op_code),
                    BasicPublishOptions::default(),
                    &body,
                    properties,
                )
                .await?
                .await?;
            Ok::<_, CacheError>(())
        }
        .await;
        debug!("rabbitmq: published {} to {}", op_code, channel.addr());
        finish(channel, result)
    }

    /// Declare the exchange and a durable queue, bind the op codes and
    /// start consuming
    pub async fn consume(&self, options: &ConsumeOptions) -> CacheResult<Subscription> {
        let channel = self.channel_for(&options.queue).await?;
        let subscribed = self.subscribe(channel.channel(), options).await;
        let consumer = match subscribed {
            Ok(consumer) => consumer,
            Err(e) => {
                channel.close(true);
                return Err(e);
            }
        };

        let channel = channel
            .detach()
            .ok_or_else(|| CacheError::internal("channel released while subscribing"))?;
        info!("rabbitmq: consuming {} on {}", options.queue, channel.addr());
        Ok(Subscription { channel, consumer })
    }

    async fn subscribe(&self, channel: &Channel, options: &ConsumeOptions) -> CacheResult<Consumer> {
        self.declare(channel).await?;

        let queue_options = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };
        channel
            .queue_declare(&options.queue, queue_options, FieldTable::default())
            .await?;

        let exchange = self.exchange_name();
        for op_code in &options.op_codes {
            channel
                .queue_bind(
                    &options.queue,
                    &exchange,
                    &self.route_key(op_code),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        channel
            .basic_qos(options.prefetch, BasicQosOptions::default())
            .await?;

        let consume_options = BasicConsumeOptions {
            no_ack: options.auto_ack,
            exclusive: options.exclusive,
            nowait: options.no_wait,
            ..Default::default()
        };
        Ok(channel
            .basic_consume(&options.queue, "", consume_options, FieldTable::default())
            .await?)
    }
}

/// Return the channel to the pool, or close it when the call failed
fn finish<T>(channel: PooledConn<AmqpProtocol>, result: CacheResult<T>) -> CacheResult<T> {
    channel.close(result.is_err());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Json;
    use crate::testutil::FakeServer;
    use serde::{Deserialize, Serialize};
    use tokio_test::assert_err;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: u32,
        sku: String,
    }

    fn config(servers: Vec<String>) -> RabbitMqConfig {
        RabbitMqConfig {
            servers,
            service_name: "orders".to_string(),
            exchange_name: "shop".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_exchange_and_route_names() {
        let client = Client::new(&config(vec!["10.0.0.1:5672".to_string()])).await.unwrap();
        assert_eq!(client.exchange_name(), "pgo.shop");
        assert_eq!(client.route_key("created"), "pgo.shop.created");
        assert_eq!(client.pool().dial_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let mut config = config(vec!["10.0.0.1:5672".to_string()]);
        config.service_name.clear();
        assert!(matches!(Client::new(&config).await, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_exchange_kind() {
        assert!(matches!(exchange_kind("direct"), ExchangeKind::Direct));
        assert!(matches!(exchange_kind("topic"), ExchangeKind::Topic));
        assert!(matches!(exchange_kind("x-delayed"), ExchangeKind::Custom(name) if name == "x-delayed"));
    }

    #[tokio::test]
    async fn test_published_headers_decode() {
        let client = Client::new(&config(vec!["10.0.0.1:5672".to_string()])).await.unwrap();
        let properties = client
            .publish_properties("u-42", "log-7")
            .with_message_id("m-1".into());

        let headers = decode_headers("pgo.shop", "pgo.shop.created", &properties);
        assert_eq!(headers.exchange, "pgo.shop");
        assert_eq!(headers.route_key, "pgo.shop.created");
        assert_eq!(headers.log_id, "log-7");
        assert_eq!(headers.service, "orders");
        assert_eq!(headers.op_uid, "u-42");
        assert_eq!(headers.message_id.as_deref(), Some("m-1"));
        assert!(headers.timestamp.is_some_and(|t| t > 0));

        let bare = decode_headers("e", "r", &BasicProperties::default());
        assert_eq!(bare.log_id, "");
        assert_eq!(bare.timestamp, None);
    }

    #[test]
    fn test_decode_body() {
        let order = Order {
            id: 9,
            sku: "A-1".to_string(),
        };
        let body = Json(&order).encode().unwrap();
        assert_eq!(decode_body::<Order>(&body).unwrap(), order);
        assert!(decode_body::<Order>(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_channel_limit() {
        let protocol = AmqpProtocol::new("guest", "guest", 1, Duration::from_millis(20));

        let first = protocol.channel_permit("a:5672").await.unwrap();
        assert!(matches!(
            protocol.channel_permit("a:5672").await,
            Err(CacheError::Timeout { .. })
        ));
        // limits are per server
        let other = protocol.channel_permit("b:5672").await.unwrap();

        drop(first);
        assert!(protocol.channel_permit("a:5672").await.is_ok());
        drop(other);
    }

    #[tokio::test]
    async fn test_publish_to_unreachable_server() {
        let dead = FakeServer::unused_addr().await;
        let client = Client::new(&config(vec![dead.clone()])).await.unwrap();

        assert!(!client.publish("created", "payload", "", "log-1").await);
        assert_err!(client.try_publish("", "payload", "", "log-1").await);
        assert_eq!(client.pool().dial_count(), 1);
        assert_eq!(client.pool().idle_count(&dead), 0);

        // the failed dial gave its channel slot back
        assert!(client.pool().protocol().channel_permit(&dead).await.is_ok());
    }
}
