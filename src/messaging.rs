use async_trait::async_trait;
use lapin::{Connection, ConnectionProperties, Channel, BasicProperties};
use lapin::options::{BasicAckOptions, BasicGetOptions, BasicPublishOptions, QueueDeclareOptions, QueuePurgeOptions};
use lapin::types::FieldTable;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info};
use crate::error::{DispatchError, Result};

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

/// Upper bound on a single receive, mirroring a long-poll receive.
pub const LONG_POLL_WAIT: Duration = Duration::from_secs(20);
const GET_INTERVAL: Duration = Duration::from_millis(250);

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> anyhow::Result<Channel> {
  let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await?;
  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

pub async fn publish_message(channel: &Channel, queue: &str, payload: &[u8]) -> anyhow::Result<()> {
  Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || async {
    channel.basic_publish("", queue, BasicPublishOptions::default(), payload, BasicProperties::default()).await
  })
    .await?;
  Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
  pub receipt: u64,
  pub body: String,
}

impl QueueMessage {
  pub fn body(&self) -> &str {
    &self.body
  }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
  fn name(&self) -> &str;

  /// Waits up to the queue's long-poll window for one message.
  async fn receive_one(&self) -> Result<Option<QueueMessage>>;

  /// Removes a received message from the queue for good.
  async fn acknowledge(&self, message: &QueueMessage) -> Result<()>;

  async fn send(&self, body: &str) -> Result<()>;

  async fn purge(&self) -> Result<()>;

  /// Messages currently waiting, where the backend can tell.
  async fn depth(&self) -> Result<u32>;
}

pub struct RabbitQueue {
  channel: Channel,
  name: String,
  wait: Duration,
}

impl RabbitQueue {
  pub async fn declare(channel: Channel, name: &str) -> Result<Self> {
    channel
      .queue_declare(name, QueueDeclareOptions::default(), FieldTable::default())
      .await
      .map_err(|e| DispatchError::queue(name, e))?;
    Ok(Self { channel, name: name.to_string(), wait: LONG_POLL_WAIT })
  }
}

#[async_trait]
impl MessageQueue for RabbitQueue {
  fn name(&self) -> &str {
    &self.name
  }

  async fn receive_one(&self) -> Result<Option<QueueMessage>> {
    let deadline = Instant::now() + self.wait;
    loop {
      let fetched = self.channel
        .basic_get(&self.name, BasicGetOptions::default())
        .await
        .map_err(|e| DispatchError::queue(&self.name, e))?;
      if let Some(message) = fetched {
        let delivery = message.delivery;
        debug!(queue = %self.name, receipt = delivery.delivery_tag, "Received message");
        return Ok(Some(QueueMessage {
          receipt: delivery.delivery_tag,
          body: String::from_utf8_lossy(&delivery.data).into_owned(),
        }));
      }
      if Instant::now() >= deadline {
        return Ok(None);
      }
      tokio::time::sleep(GET_INTERVAL).await;
    }
  }

  async fn acknowledge(&self, message: &QueueMessage) -> Result<()> {
    self.channel
      .basic_ack(message.receipt, BasicAckOptions::default())
      .await
      .map_err(|e| DispatchError::queue(&self.name, e))?;
    debug!(queue = %self.name, receipt = message.receipt, "Deleted message");
    Ok(())
  }

  async fn send(&self, body: &str) -> Result<()> {
    publish_message(&self.channel, &self.name, body.as_bytes())
      .await
      .map_err(|e| DispatchError::queue(&self.name, e))
  }

  async fn purge(&self) -> Result<()> {
    let purged = self.channel
      .queue_purge(&self.name, QueuePurgeOptions::default())
      .await
      .map_err(|e| DispatchError::queue(&self.name, e))?;
    info!(queue = %self.name, purged, "Purged queue");
    Ok(())
  }

  async fn depth(&self) -> Result<u32> {
    let queue = self.channel
      .queue_declare(&self.name, QueueDeclareOptions { passive: true, ..Default::default() }, FieldTable::default())
      .await
      .map_err(|e| DispatchError::queue(&self.name, e))?;
    Ok(queue.message_count())
  }
}

/// Queue held in process memory. Received messages stay in flight until
/// acknowledged.
pub struct InMemoryQueue {
  name: String,
  ready: Mutex<VecDeque<String>>,
  in_flight: Mutex<HashMap<u64, String>>,
  next_receipt: AtomicU64,
}

impl InMemoryQueue {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      ready: Mutex::new(VecDeque::new()),
      in_flight: Mutex::new(HashMap::new()),
      next_receipt: AtomicU64::new(1),
    }
  }

  pub async fn in_flight(&self) -> usize {
    self.in_flight.lock().await.len()
  }

  /// Drains every waiting message without acknowledgement bookkeeping.
  pub async fn drain(&self) -> Vec<String> {
    self.ready.lock().await.drain(..).collect()
  }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
  fn name(&self) -> &str {
    &self.name
  }

  async fn receive_one(&self) -> Result<Option<QueueMessage>> {
    let Some(body) = self.ready.lock().await.pop_front() else {
      return Ok(None);
    };
    let receipt = self.next_receipt.fetch_add(1, Ordering::SeqCst);
    self.in_flight.lock().await.insert(receipt, body.clone());
    Ok(Some(QueueMessage { receipt, body }))
  }

  async fn acknowledge(&self, message: &QueueMessage) -> Result<()> {
    self.in_flight.lock().await.remove(&message.receipt);
    Ok(())
  }

  async fn send(&self, body: &str) -> Result<()> {
    self.ready.lock().await.push_back(body.to_string());
    Ok(())
  }

  async fn purge(&self) -> Result<()> {
    self.ready.lock().await.clear();
    Ok(())
  }

  async fn depth(&self) -> Result<u32> {
    Ok(self.ready.lock().await.len() as u32)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn received_message_stays_in_flight_until_acknowledged() {
    let queue = InMemoryQueue::new("problems");
    queue.send("first").await.unwrap();
    queue.send("second").await.unwrap();

    let message = queue.receive_one().await.unwrap().unwrap();
    assert_eq!(message.body(), "first");
    assert_eq!(queue.in_flight().await, 1);
    assert_eq!(queue.depth().await.unwrap(), 1);

    queue.acknowledge(&message).await.unwrap();
    assert_eq!(queue.in_flight().await, 0);
  }

  #[tokio::test]
  async fn purge_empties_queue() {
    let queue = InMemoryQueue::new("results");
    queue.send("a").await.unwrap();
    queue.purge().await.unwrap();
    assert!(queue.receive_one().await.unwrap().is_none());
  }
}
