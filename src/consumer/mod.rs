//! Orchestrates connections for one `(topic, channel)`: lookupd-driven
//! discovery, reconnection with backoff, and a single stream of delivered
//! messages backed by a bounded queue for backpressure.

use crate::config::ConsumerConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionHandle, Delivery};
use crate::error::NsqResult;
use crate::lookup::LookupdClient;
use crate::rdy::{RdyController, RdyControllerHandle};
use crate::topic::{Channel, Topic};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tracing::{debug, info, warn};

const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const RETRY_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// A consumer of one `(topic, channel)`, backed by one or more connections
/// either statically configured or discovered via lookupd.
pub struct Consumer {
    message_rx: mpsc::Receiver<Delivery>,
    stop_tx: mpsc::UnboundedSender<()>,
    supervisor: tokio::task::JoinHandle<()>,
}

struct Supervisor {
    topic: Topic,
    channel: Channel,
    config: ConsumerConfig,
    connections: Arc<Mutex<HashMap<String, ConnectionHandle>>>,
    join_handles: Arc<Mutex<HashMap<String, tokio::task::JoinHandle<()>>>>,
    message_tx: mpsc::Sender<Delivery>,
    rdy: RdyControllerHandle,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    lookupd_clients: Vec<LookupdClient>,
    backoff: HashMap<String, Duration>,
    stop_rx: mpsc::UnboundedReceiver<()>,
}

impl Consumer {
    /// Connect to every configured source: lookupd if configured (lookupd
    /// takes priority over the static list), otherwise every address in
    /// `nsqd_tcp_addresses` — all of which are connected and registered,
    /// not just the last one.
    pub async fn connect(topic: Topic, channel: Channel, config: ConsumerConfig) -> NsqResult<Consumer> {
        let queue_capacity = config.queue_capacity();
        let (message_tx, message_rx) = mpsc::channel(queue_capacity);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();

        let (rdy_controller, rdy_handle) =
            RdyController::new(config.max_in_flight, config.idle_timeout, config.redistribute_timeout);
        tokio::spawn(rdy_controller.run());

        let lookupd_clients = config
            .lookupd_http_addresses
            .iter()
            .map(|addr| LookupdClient::new(addr.clone(), config.lookupd_connect_timeout, config.lookupd_read_timeout))
            .collect::<NsqResult<Vec<_>>>()?;

        let connections = Arc::new(Mutex::new(HashMap::new()));
        let join_handles = Arc::new(Mutex::new(HashMap::new()));

        let mut supervisor = Supervisor {
            topic,
            channel,
            config,
            connections,
            join_handles,
            message_tx,
            rdy: rdy_handle,
            event_tx,
            event_rx,
            lookupd_clients,
            backoff: HashMap::new(),
            stop_rx,
        };

        supervisor.initial_connect().await?;

        let handle = tokio::spawn(async move { supervisor.run().await });

        Ok(Consumer {
            message_rx,
            stop_tx,
            supervisor: handle,
        })
    }

    /// Receive the next delivered message. Returns `None` once the consumer
    /// has stopped and drained.
    pub async fn next_message(&mut self) -> Option<Delivery> {
        self.message_rx.recv().await
    }

    /// Stop subscribing, send `CLS` to every connection, and wait up to the
    /// configured grace period for outstanding messages to drain.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.supervisor.await;
    }
}

impl Supervisor {
    async fn initial_connect(&mut self) -> NsqResult<()> {
        if self.config.uses_lookupd() {
            self.poll_lookupd().await;
        } else {
            let addrs = self.config.nsqd_tcp_addresses.clone();
            for addr in addrs {
                // Every address is connected and stored here, in the loop
                // body: a prior version of this discovery path stored only
                // the last address's connection because the insert sat
                // outside the loop.
                if let Err(e) = self.connect_one(&addr).await {
                    warn!(addr = %addr, error = %e, "failed to connect to static nsqd address");
                }
            }
        }
        Ok(())
    }

    async fn connect_one(&mut self, addr: &str) -> NsqResult<()> {
        let (mut connection, handle) =
            Connection::open(addr, &self.config.identify, self.config.dial_timeout).await?;
        connection.subscribe(&self.topic, &self.channel).await?;

        self.connections
            .lock()
            .await
            .insert(handle.id.clone(), handle.clone());
        self.rdy.add_connection(handle);

        let message_tx = self.message_tx.clone();
        let event_tx = self.event_tx.clone();
        let task = tokio::spawn(async move { connection.run(message_tx, event_tx).await });
        self.join_handles.lock().await.insert(addr.to_string(), task);

        info!(addr, "connected and subscribed");
        Ok(())
    }

    /// Re-identify and re-subscribe exactly the one connection that broke,
    /// rather than re-running lookupd and re-subscribing every connection.
    async fn reconnect_one(&mut self, addr: String) {
        let backoff = self
            .backoff
            .get(&addr)
            .copied()
            .unwrap_or(MIN_BACKOFF);

        tokio::time::sleep(jittered(backoff)).await;

        match self.connect_one(&addr).await {
            Ok(()) => {
                self.backoff.remove(&addr);
                debug!(addr, "reconnected");
            }
            Err(e) => {
                let next = (backoff * 2).min(MAX_BACKOFF);
                self.backoff.insert(addr.clone(), next);
                warn!(addr, error = %e, next_backoff_ms = next.as_millis() as u64, "reconnect attempt failed");
            }
        }
    }

    async fn poll_lookupd(&mut self) {
        if self.lookupd_clients.is_empty() {
            return;
        }
        let idx = rand::thread_rng().gen_range(0..self.lookupd_clients.len());
        let topic = self.topic.as_str().to_string();
        let producers = match self.lookupd_clients[idx].lookup(&topic).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "lookupd query failed, will retry next poll");
                return;
            }
        };

        let existing: HashSet<String> = self.connections.lock().await.keys().cloned().collect();
        for producer in producers {
            let addr = producer.tcp_addr();
            if !existing.contains(&addr) {
                if let Err(e) = self.connect_one(&addr).await {
                    warn!(addr, error = %e, "failed to connect to lookupd-discovered producer");
                }
            }
        }
    }

    async fn run(mut self) {
        let mut lookupd_ticker = interval(jittered(self.config.lookupd_poll_time));
        lookupd_ticker.tick().await;
        let mut retry_ticker = interval(RETRY_SCAN_INTERVAL);
        retry_ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = self.stop_rx.recv() => {
                    self.shutdown().await;
                    return;
                }

                event = self.event_rx.recv() => {
                    match event {
                        Some(ConnectionEvent::Broken { conn_id }) => {
                            self.connections.lock().await.remove(&conn_id);
                            self.join_handles.lock().await.remove(&conn_id);
                            self.rdy.remove_connection(conn_id.clone());
                            self.reconnect_one(conn_id).await;
                        }
                        Some(_) => {}
                        None => return,
                    }
                }

                _ = lookupd_ticker.tick() => {
                    if self.config.uses_lookupd() {
                        self.poll_lookupd().await;
                    }
                }

                _ = retry_ticker.tick() => {
                    // `reconnect_one` only fires once per `Broken` event; this
                    // keeps retrying any address still sitting in backoff so a
                    // transient outage doesn't permanently drop the connection.
                    let pending: Vec<String> = self.backoff.keys().cloned().collect();
                    for addr in pending {
                        if self.backoff.contains_key(&addr) {
                            self.reconnect_one(addr).await;
                        }
                    }
                }
            }
        }
    }

    /// Send `CLS` to every connection and wait up to `stop_grace_period` for
    /// each to acknowledge; any connection still running after the grace
    /// period is forced closed rather than left to linger past `stop()`.
    async fn shutdown(&mut self) {
        let handles_snapshot: Vec<(String, ConnectionHandle)> = self
            .connections
            .lock()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        for (_, conn) in &handles_snapshot {
            conn.send_close();
        }

        let grace = self.config.stop_grace_period;
        let mut join_handles = self.join_handles.lock().await;
        for (addr, conn) in handles_snapshot {
            let Some(mut task) = join_handles.remove(&addr) else {
                continue;
            };
            tokio::select! {
                res = &mut task => {
                    if let Err(e) = res {
                        warn!(addr, error = %e, "connection task panicked while closing");
                    }
                }
                _ = tokio::time::sleep(grace) => {
                    warn!(addr, "connection did not close within grace period, forcing");
                    conn.force_close();
                    let _ = task.await;
                }
            }
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_stays_within_plus_or_minus_twenty_percent() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let got = jittered(base);
            assert!(got >= Duration::from_secs_f64(7.9));
            assert!(got <= Duration::from_secs_f64(12.1));
        }
    }

    #[test]
    fn backoff_doubles_and_caps_at_max() {
        let mut backoff = MIN_BACKOFF;
        for _ in 0..20 {
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        assert_eq!(backoff, MAX_BACKOFF);
    }
}
