/*
 * Copyright 2025 MED Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Per-instance transmission workers
//!
//! One worker task per instance, living as long as the instance. The worker
//! blocks on its capacity-1 batch channel, owns the instance's socket
//! exclusively, drains received batches to the first reachable destination
//! and keeps the failure/retry bookkeeping: a batch survives up to
//! `buffer_on_failures` consecutive failed cycles before it is dropped.

use crate::engine::InstanceSettings;
use crate::model::ExportStats;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the single non-blocking response read.
pub const RESPONSE_CAPACITY: usize = 4096;

/// Longest response sample quoted in the log.
const RESPONSE_SAMPLE_MAX: usize = 200;

/// Everything a worker needs from its instance.
pub struct WorkerContext {
    /// Instance name, for logs.
    pub name: String,

    pub settings: Arc<InstanceSettings>,

    pub stats: Arc<ExportStats>,
}

/// Spawn the transmission worker of one instance. Returns the batch channel
/// (capacity 1, so at most one batch is in flight) and the task handle.
pub fn spawn_worker(ctx: WorkerContext) -> (mpsc::Sender<String>, JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel(1);
    let handle = tokio::spawn(simple_connector_worker(ctx, receiver));
    (sender, handle)
}

/// The worker loop: wait for a batch, deliver it, peek at the backend's
/// response. A closed channel means engine shutdown; the worker then makes a
/// final delivery attempt for anything it still holds and exits.
async fn simple_connector_worker(ctx: WorkerContext, mut receiver: mpsc::Receiver<String>) {
    let mut connection: Option<TcpStream> = None;
    let mut failures: u32 = 0;
    let mut reconnects: u64 = 0;
    let mut pending = String::new();

    while let Some(batch) = receiver.recv().await {
        pending.push_str(&batch);
        if pending.is_empty() {
            continue;
        }
        attempt_delivery(&ctx, &mut connection, &mut failures, &mut reconnects, &mut pending).await;
        if let Some(stream) = connection.as_mut() {
            if !receive_response(stream, &ctx) {
                connection = None;
            }
        }
    }

    if !pending.is_empty() {
        attempt_delivery(&ctx, &mut connection, &mut failures, &mut reconnects, &mut pending).await;
        if !pending.is_empty() {
            warn!(
                "Instance '{}' dropping {} undelivered bytes on shutdown",
                ctx.name,
                pending.len()
            );
        }
    }
    debug!("Worker of instance '{}' exiting", ctx.name);
}

/// One delivery cycle: ensure a connection, send the whole pending buffer.
/// Connection and transmission errors share the failure counter.
async fn attempt_delivery(
    ctx: &WorkerContext,
    connection: &mut Option<TcpStream>,
    failures: &mut u32,
    reconnects: &mut u64,
    pending: &mut String,
) {
    if connection.is_none() {
        *connection = connect_to_one_of(&ctx.settings, &ctx.name, reconnects).await;
    }

    match connection.as_mut() {
        Some(stream) => match send_buffer(stream, pending, &ctx.stats).await {
            Ok(()) => {
                *failures = 0;
            }
            Err(e) => {
                error!("Instance '{}' failed to send buffer: {}", ctx.name, e);
                *connection = None;
                record_transmission_failure(ctx, failures, pending);
            }
        },
        None => {
            record_transmission_failure(ctx, failures, pending);
        }
    }
}

/// Bookkeeping for a failed cycle. The pending buffer is kept for retry until
/// `buffer_on_failures` consecutive failures, then dropped and the counter
/// reset.
fn record_transmission_failure(ctx: &WorkerContext, failures: &mut u32, pending: &mut String) {
    ExportStats::add(&ctx.stats.transmission_failures, 1);
    *failures += 1;
    if *failures >= ctx.settings.buffer_on_failures {
        warn!(
            "Instance '{}' reached {} consecutive failures, dropping {} buffered bytes",
            ctx.name,
            failures,
            pending.len()
        );
        ExportStats::add(&ctx.stats.data_lost_events, 1);
        pending.clear();
        *failures = 0;
    }
}

/// Append the default port to a destination that does not carry one.
fn with_default_port(destination: &str, default_port: u16) -> String {
    match destination.rsplit_once(':') {
        Some((_, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            destination.to_string()
        }
        _ => format!("{}:{}", destination, default_port),
    }
}

/// Try the destination list in order; each attempt is bounded by the
/// configured connect timeout. The reconnect counter grows per attempt and
/// resets when a connection is established.
async fn connect_to_one_of(
    settings: &InstanceSettings,
    name: &str,
    reconnects: &mut u64,
) -> Option<TcpStream> {
    for destination in &settings.destinations {
        *reconnects += 1;
        let address = with_default_port(destination, settings.default_port);
        match tokio::time::timeout(settings.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => {
                info!("EXPORTING: instance '{}' connected to '{}'", name, address);
                *reconnects = 0;
                return Some(stream);
            }
            Ok(Err(e)) => {
                warn!(
                    "EXPORTING: instance '{}' failed to connect to '{}': {}",
                    name, address, e
                );
            }
            Err(_) => {
                warn!(
                    "EXPORTING: instance '{}' timed out connecting to '{}'",
                    name, address
                );
            }
        }
    }
    None
}

/// Write the whole pending buffer as one logical send. On success the buffer
/// is truncated to empty and the sent counters advance by its size.
async fn send_buffer(
    stream: &mut TcpStream,
    pending: &mut String,
    stats: &ExportStats,
) -> std::io::Result<()> {
    let bytes = pending.len() as u64;
    let metrics = pending.bytes().filter(|b| *b == b'\n').count() as u64;

    stream.write_all(pending.as_bytes()).await?;

    ExportStats::add(&stats.sent_bytes, bytes);
    ExportStats::add(&stats.sent_metrics, metrics);
    ExportStats::add(&stats.transmission_successes, 1);
    pending.clear();
    Ok(())
}

/// Best-effort single non-blocking read of the backend's response; anything
/// received is counted, logged and discarded. Returns false when the
/// connection is no longer usable.
fn receive_response(stream: &mut TcpStream, ctx: &WorkerContext) -> bool {
    let mut response = [0u8; RESPONSE_CAPACITY];
    match stream.try_read(&mut response) {
        Ok(0) => {
            info!("EXPORTING: instance '{}' connection closed by backend", ctx.name);
            false
        }
        Ok(received) => {
            ExportStats::add(&ctx.stats.received_bytes, received as u64);
            ExportStats::add(&ctx.stats.receptions, 1);
            let sample = String::from_utf8_lossy(&response[..received.min(RESPONSE_SAMPLE_MAX)]);
            info!(
                "EXPORTING: received {} bytes from {} connector instance. Ignoring them. Sample: '{}'",
                received,
                ctx.name,
                sample.trim_end()
            );
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
        Err(e) => {
            warn!(
                "EXPORTING: instance '{}' failed to read response: {}",
                ctx.name, e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataSource;
    use crate::filters::SimplePattern;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_settings(destinations: Vec<String>, buffer_on_failures: u32) -> Arc<InstanceSettings> {
        Arc::new(InstanceSettings {
            destinations,
            default_port: 2003,
            update_every: 1,
            buffer_on_failures,
            timeout: Duration::from_millis(1000),
            hosts_pattern: SimplePattern::parse("*"),
            charts_pattern: SimplePattern::parse("*"),
            send_names: true,
            data_source: DataSource::AsCollected,
        })
    }

    fn test_context(destinations: Vec<String>, buffer_on_failures: u32) -> WorkerContext {
        WorkerContext {
            name: "graphite:test".to_string(),
            settings: test_settings(destinations, buffer_on_failures),
            stats: Arc::new(ExportStats::default()),
        }
    }

    const LINE: &str =
        "netdata.test-host.chart_name.dimension_name;TAG1=VALUE1 TAG2=VALUE2 123000321 15051\n";

    #[test]
    fn test_with_default_port() {
        assert_eq!(with_default_port("localhost", 2003), "localhost:2003");
        assert_eq!(with_default_port("localhost:2004", 2003), "localhost:2004");
        assert_eq!(with_default_port("10.0.0.1", 2003), "10.0.0.1:2003");
        assert_eq!(with_default_port("backend:x", 2003), "backend:x:2003");
    }

    #[test]
    fn test_failure_keeps_buffer_until_threshold() {
        let ctx = test_context(vec!["localhost".to_string()], 3);
        let mut failures = 0u32;
        let mut pending = LINE.to_string();

        record_transmission_failure(&ctx, &mut failures, &mut pending);
        assert_eq!(failures, 1);
        assert_eq!(pending, LINE);
        assert_eq!(ctx.stats.transmission_failures.load(Ordering::Relaxed), 1);

        record_transmission_failure(&ctx, &mut failures, &mut pending);
        assert_eq!(failures, 2);
        assert_eq!(pending, LINE);

        // third consecutive failure reaches the threshold: batch dropped,
        // counter reset
        record_transmission_failure(&ctx, &mut failures, &mut pending);
        assert_eq!(failures, 0);
        assert!(pending.is_empty());
        assert_eq!(ctx.stats.transmission_failures.load(Ordering::Relaxed), 3);
        assert_eq!(ctx.stats.data_lost_events.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_send_buffer_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let mut stream = TcpStream::connect(address).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let stats = ExportStats::default();
        let mut pending = LINE.to_string();

        send_buffer(&mut stream, &mut pending, &stats).await.unwrap();

        assert!(pending.is_empty());
        assert_eq!(stats.sent_bytes.load(Ordering::Relaxed), 84);
        assert_eq!(stats.sent_metrics.load(Ordering::Relaxed), 1);
        assert_eq!(stats.transmission_successes.load(Ordering::Relaxed), 1);
        assert_eq!(stats.transmission_failures.load(Ordering::Relaxed), 0);

        let mut received = vec![0u8; LINE.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, LINE.as_bytes());
    }

    #[tokio::test]
    async fn test_connect_failure_counts_without_consuming_buffer() {
        // grab a port with no listener behind it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let ctx = test_context(vec![address.to_string()], 10);
        let mut connection = None;
        let mut failures = 0u32;
        let mut reconnects = 0u64;
        let mut pending = LINE.to_string();

        attempt_delivery(&ctx, &mut connection, &mut failures, &mut reconnects, &mut pending)
            .await;

        assert!(connection.is_none());
        assert_eq!(failures, 1);
        assert_eq!(pending, LINE);
        assert_eq!(ctx.stats.transmission_failures.load(Ordering::Relaxed), 1);
        assert_eq!(reconnects, 1);
    }

    #[tokio::test]
    async fn test_successful_delivery_resets_failure_counter() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let ctx = test_context(vec![address.to_string()], 10);
        let mut connection = None;
        let mut failures = 3u32;
        let mut reconnects = 0u64;
        let mut pending = LINE.to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = vec![0u8; LINE.len()];
            stream.read_exact(&mut received).await.unwrap();
            received
        });

        attempt_delivery(&ctx, &mut connection, &mut failures, &mut reconnects, &mut pending)
            .await;

        assert!(pending.is_empty());
        assert_eq!(failures, 0);
        assert_eq!(ctx.stats.transmission_successes.load(Ordering::Relaxed), 1);
        assert_eq!(server.await.unwrap(), LINE.as_bytes());
    }

    #[tokio::test]
    async fn test_connect_to_one_of_falls_back_in_order() {
        // first destination unreachable, second accepts
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_address = dead.local_addr().unwrap();
        drop(dead);
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_address = live.local_addr().unwrap();

        let settings = test_settings(
            vec![dead_address.to_string(), live_address.to_string()],
            10,
        );
        let mut reconnects = 5u64;
        let stream = connect_to_one_of(&settings, "graphite:test", &mut reconnects).await;

        assert!(stream.is_some());
        assert_eq!(reconnects, 0);
        assert_eq!(
            stream.unwrap().peer_addr().unwrap().port(),
            live_address.port()
        );
    }

    #[tokio::test]
    async fn test_receive_response_counts_and_discards() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let mut stream = TcpStream::connect(address).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        tokio::io::AsyncWriteExt::write_all(&mut server, b"Test recv")
            .await
            .unwrap();
        stream.readable().await.unwrap();

        let ctx = test_context(vec![address.to_string()], 10);
        let mut stream = stream;
        assert!(receive_response(&mut stream, &ctx));

        assert_eq!(ctx.stats.received_bytes.load(Ordering::Relaxed), 9);
        assert_eq!(ctx.stats.receptions.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_receive_response_would_block_is_quiet() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let mut stream = TcpStream::connect(address).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();

        let ctx = test_context(vec![address.to_string()], 10);
        assert!(receive_response(&mut stream, &ctx));
        assert_eq!(ctx.stats.receptions.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_worker_delivers_batch_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let ctx = test_context(vec![address.to_string()], 10);
        let stats = Arc::clone(&ctx.stats);
        let (sender, handle) = spawn_worker(ctx);

        sender.send(LINE.to_string()).await.unwrap();

        let (mut server, _) = listener.accept().await.unwrap();
        let mut received = vec![0u8; LINE.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, LINE.as_bytes());

        // closing the channel shuts the worker down
        drop(sender);
        handle.await.unwrap();

        assert_eq!(stats.sent_metrics.load(Ordering::Relaxed), 1);
        assert_eq!(stats.transmission_successes.load(Ordering::Relaxed), 1);
    }
}
