/*!
 * The read/write loop behind every hardware link.
 *
 * A [`LinkDriver`] owns one background task. Each iteration drains the
 * outbound queue (encode, write, pause for the inter-send delay), polls the
 * transport for inbound bytes, pairs decoded replies with outstanding
 * requests by the digest of the request bytes, dispatches everything else
 * to subscribers by address, and re-queues requests whose reply is late.
 */
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use bytes::BytesMut;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, trace, warn, Instrument};

use homeflow_core::logging::link_span;
use homeflow_core::types::{Address, Command, DriverId};

use crate::codec::{request_digest, Codec, Inbound};
use crate::device::{DeviceError, Result};
use crate::driver::{Driver, DriverOptions, EventSink, Subscribers};
use crate::transport::Transport;

type Responder = oneshot::Sender<Result<Option<Inbound>>>;

struct Request {
    address: Address,
    command: Command,
    /// Writes so far
    attempts: u32,
    responder: Option<Responder>,
}

impl Request {
    fn finish(self, outcome: Result<Option<Inbound>>) {
        match self.responder {
            Some(responder) => {
                let _ = responder.send(outcome);
            }
            None => {
                if let Err(e) = outcome {
                    warn!(address = %self.address, command = %self.command, "Command failed: {}", e);
                }
            }
        }
    }
}

struct Pending {
    request: Request,
    deadline: Instant,
}

/// A driver running a [`Transport`] and a [`Codec`] on a background task
#[derive(Debug)]
pub struct LinkDriver {
    id: DriverId,
    name: String,
    outbound: mpsc::UnboundedSender<Request>,
    subscribers: Arc<Subscribers>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("address", &self.address)
            .field("command", &self.command)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl LinkDriver {
    /// Start the loop for a link
    pub fn spawn<T, C>(name: &str, transport: T, codec: C, options: DriverOptions) -> Arc<Self>
    where
        T: Transport,
        C: Codec,
    {
        let id = DriverId::next();
        let (outbound, inbox) = mpsc::unbounded_channel();
        let subscribers = Arc::new(Subscribers::new());

        let link = LinkLoop {
            id,
            name: name.to_string(),
            transport,
            codec,
            options,
            inbox,
            queue: VecDeque::new(),
            pending: HashMap::new(),
            buffer: BytesMut::with_capacity(1024),
            subscribers: subscribers.clone(),
        };
        let span = link_span(name, Some(&id.to_string()));
        let task = tokio::spawn(link.run().instrument(span));

        Arc::new(Self {
            id,
            name: name.to_string(),
            outbound,
            subscribers,
            task: Mutex::new(Some(task)),
        })
    }

    fn enqueue(&self, address: &Address, command: Command, responder: Option<Responder>) -> bool {
        let request = Request {
            address: address.clone(),
            command,
            attempts: 0,
            responder,
        };
        match self.outbound.send(request) {
            Ok(()) => true,
            Err(mpsc::error::SendError(request)) => {
                request.finish(Err(DeviceError::link_closed(&self.name)));
                false
            }
        }
    }

    /// Send a command and wait for its acknowledgement.
    ///
    /// Returns the decoded reply, `None` when the codec expects no reply,
    /// or [`DeviceError::IoTimeout`] once the retry bound is exhausted.
    pub async fn request(&self, address: &Address, command: Command) -> Result<Option<Inbound>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(address, command, Some(tx));
        rx.await
            .map_err(|_| DeviceError::link_closed(&self.name))?
    }

    /// Whether the loop is still running
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().map_or(false, |t| !t.is_finished()))
            .unwrap_or(false)
    }

    /// Stop the loop
    pub fn shutdown(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                debug!(driver = %self.name, "Stopping link loop");
                task.abort();
            }
        }
    }
}

impl Driver for LinkDriver {
    fn id(&self) -> DriverId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, address: &Address, command: Command) {
        self.enqueue(address, command, None);
    }

    fn status(&self, address: &Address) {
        self.enqueue(address, Command::Status, None);
    }

    fn subscribe(&self, sink: Weak<dyn EventSink>, address: Option<Address>) {
        self.subscribers.add(sink, address);
    }
}

impl Drop for LinkDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct LinkLoop<T, C> {
    id: DriverId,
    name: String,
    transport: T,
    codec: C,
    options: DriverOptions,
    inbox: mpsc::UnboundedReceiver<Request>,
    queue: VecDeque<Request>,
    pending: HashMap<u64, VecDeque<Pending>>,
    buffer: BytesMut,
    subscribers: Arc<Subscribers>,
}

impl<T: Transport, C: Codec> LinkLoop<T, C> {
    async fn run(mut self) {
        debug!(link = %self.name, "Link loop started");
        match self.serve().await {
            Ok(()) => debug!(link = %self.name, "Link loop finished"),
            Err(e) => {
                error!(link = %self.name, "Link loop failed: {}", e);
                self.fail_all(&e);
            }
        }
    }

    async fn serve(&mut self) -> Result<()> {
        let mut closed = false;
        loop {
            // Collect new outbound work without blocking
            while !closed {
                match self.inbox.try_recv() {
                    Ok(request) => self.queue.push_back(request),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => closed = true,
                }
            }
            if closed && self.queue.is_empty() && self.pending.is_empty() {
                return Ok(());
            }

            while let Some(request) = self.queue.pop_front() {
                self.write(request).await?;
                if !self.options.inter_send_delay.is_zero() {
                    sleep(self.options.inter_send_delay).await;
                }
            }

            match timeout(self.options.poll_interval, self.transport.read(&mut self.buffer)).await {
                Ok(Ok(0)) => return Err(DeviceError::link_closed(&self.name)),
                Ok(Ok(n)) => {
                    trace!(link = %self.name, bytes = n, "Read from link");
                    self.decode_frames();
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {}
            }

            self.expire(Instant::now());
        }
    }

    async fn write(&mut self, mut request: Request) -> Result<()> {
        let bytes = match self.codec.encode(&request.address, request.command) {
            Ok(bytes) => bytes,
            Err(e) => {
                request.finish(Err(e));
                return Ok(());
            }
        };

        trace!(link = %self.name, address = %request.address, command = %request.command, "Writing frame");
        self.transport.write(&bytes).await?;
        request.attempts += 1;

        if self.codec.expects_reply(request.command) {
            let deadline = Instant::now() + self.options.response_timeout;
            self.pending
                .entry(request_digest(&bytes))
                .or_default()
                .push_back(Pending { request, deadline });
        } else {
            request.finish(Ok(None));
        }
        Ok(())
    }

    fn decode_frames(&mut self) {
        loop {
            let before = self.buffer.len();
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(inbound)) => self.handle(inbound),
                Ok(None) => break,
                Err(e) => {
                    warn!(link = %self.name, "Discarding frame: {}", e);
                    if self.buffer.len() == before {
                        self.buffer.clear();
                        break;
                    }
                }
            }
        }
    }

    fn handle(&mut self, inbound: Inbound) {
        if let Some(digest) = inbound.reply_to {
            if let Some(waiting) = self.pending.get_mut(&digest) {
                if let Some(pending) = waiting.pop_front() {
                    if waiting.is_empty() {
                        self.pending.remove(&digest);
                    }
                    trace!(link = %self.name, address = %inbound.address, "Reply matched");
                    pending.request.finish(Ok(Some(inbound)));
                    return;
                }
            }
        }

        self.subscribers
            .dispatch(inbound.command, &inbound.address, self.id);
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, waiting)| waiting.front().map_or(false, |p| p.deadline <= now))
            .map(|(digest, _)| *digest)
            .collect();

        for digest in expired {
            let Some(waiting) = self.pending.get_mut(&digest) else {
                continue;
            };
            let mut late = Vec::new();
            while waiting.front().map_or(false, |p| p.deadline <= now) {
                if let Some(pending) = waiting.pop_front() {
                    late.push(pending.request);
                }
            }
            if waiting.is_empty() {
                self.pending.remove(&digest);
            }

            for request in late {
                if request.attempts <= self.options.retry_limit {
                    debug!(
                        link = %self.name,
                        address = %request.address,
                        command = %request.command,
                        attempt = request.attempts,
                        "No reply, retrying"
                    );
                    self.queue.push_back(request);
                } else {
                    let attempts = request.attempts;
                    request.finish(Err(DeviceError::IoTimeout { attempts }));
                }
            }
        }
    }

    fn fail_all(&mut self, cause: &DeviceError) {
        let reason = format!("{}: {}", self.name, cause);
        let pending = self.pending.drain().flat_map(|(_, waiting)| waiting.into_iter().map(|p| p.request));
        let queued: Vec<Request> = self.queue.drain(..).chain(pending).collect();
        for request in queued {
            request.finish(Err(DeviceError::link_closed(&reason)));
        }
        self.inbox.close();
        while let Ok(request) = self.inbox.try_recv() {
            request.finish(Err(DeviceError::link_closed(&reason)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LineCodec;
    use crate::transport::StreamTransport;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn options() -> DriverOptions {
        DriverOptions::default()
            .with_inter_send_delay(Duration::from_millis(5))
            .with_poll_interval(Duration::from_millis(10))
            .with_response_timeout(Duration::from_millis(100))
            .with_retry_limit(2)
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<(Command, Address)>>);

    impl EventSink for Collect {
        fn on_event(&self, command: Command, address: &Address, _driver: DriverId) {
            self.0.lock().unwrap().push((command, address.clone()));
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_request_is_acknowledged() {
        let (transport, hardware) = StreamTransport::memory(1024);
        let link = LinkDriver::spawn("line", transport, LineCodec::new(), options());

        let (read_half, mut write_half) = tokio::io::split(hardware);
        let hardware = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            assert_eq!(line, "A1 ON");
            write_half.write_all(b"OK A1 ON\n").await.unwrap();
        });

        let reply = link.request(&Address::new("a1"), Command::On).await.unwrap();
        assert_eq!(reply.unwrap().command, Command::On);
        hardware.await.unwrap();
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_request_times_out_after_retries() {
        let (transport, hardware) = StreamTransport::memory(1024);
        let link = LinkDriver::spawn("line", transport, LineCodec::new(), options());

        let (read_half, _write_half) = tokio::io::split(hardware);
        let writes = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            let mut count = 0;
            while let Ok(Some(_)) = lines.next_line().await {
                count += 1;
                if count == 3 {
                    break;
                }
            }
            count
        });

        let result = link.request(&Address::new("A1"), Command::Off).await;
        assert!(matches!(result, Err(DeviceError::IoTimeout { attempts: 3 })));
        assert_eq!(writes.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unsolicited_events_reach_subscribers() {
        let (transport, mut hardware) = StreamTransport::memory(1024);
        let link = LinkDriver::spawn("line", transport, LineCodec::new(), options());

        let sink = Arc::new(Collect::default());
        let as_sink: Arc<dyn EventSink> = sink.clone();
        link.subscribe(Arc::downgrade(&as_sink), Some(Address::new("B2")));

        hardware
            .write_all(b"garbage line\nA1 ON\nB2 MOTION\n")
            .await
            .unwrap();

        for _ in 0..50 {
            if !sink.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            sink.0.lock().unwrap().clone(),
            vec![(Command::Motion, Address::new("B2"))]
        );
    }

    #[tokio::test]
    async fn test_closed_link_fails_requests() {
        let (transport, hardware) = StreamTransport::memory(1024);
        let link = LinkDriver::spawn("line", transport, LineCodec::new(), options());
        drop(hardware);

        let result = link.request(&Address::new("A1"), Command::On).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unacknowledged_codec_completes_immediately() {
        let (transport, _hardware) = StreamTransport::memory(1024);
        let codec = LineCodec::new().with_acknowledgements(false);
        let link = LinkDriver::spawn("line", transport, codec, options());

        let reply = link.request(&Address::new("A1"), Command::On).await.unwrap();
        assert!(reply.is_none());
        assert!(link.is_running());

        link.shutdown();
        tokio::task::yield_now().await;
    }
}
