use crate::compression::{DeflateCodec, PayloadCodec};
use crate::config::ParloConfig;
use crate::control_packets::{ids, unix_millis, GoodbyePayload, HeartbeatPayload, CLIENT_GRACE_PERIOD};
use crate::error::{ParloError, Result};
use crate::listener::Listener;
use crate::packet::{Packet, MAX_PACKET_SIZE};
use crate::processing_buffer::ProcessingBuffer;
use crate::socket::{StreamSocket, TcpStreamSocket};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

pub type ClientHandler = Arc<dyn Fn(&Arc<NetworkClient>) + Send + Sync>;
pub type DataHandler = Arc<dyn Fn(&Arc<NetworkClient>, &Packet) + Send + Sync>;

#[derive(Default)]
struct EventHandlers {
    on_client_disconnected: Option<ClientHandler>,
    on_server_disconnected: Option<ClientHandler>,
    on_connection_lost: Option<ClientHandler>,
    on_received_heartbeat: Option<ClientHandler>,
    on_received_data: Option<DataHandler>,
}

/// One end of a connection: sends and receives framed packets, keeps the
/// peer alive with heartbeats, watches for the peer going silent, and raises
/// the installed event handlers.
///
/// Handlers run synchronously on whichever task noticed the event - the
/// reassembly worker for packet events, the monitor for liveness - so they
/// observe packets in arrival order without extra synchronization. They must
/// not block; anything slow belongs in a spawned task.
///
/// Constructors must run inside a tokio runtime, which the background tasks
/// are spawned on.
pub struct NetworkClient {
    id: Uuid,
    config: Arc<ParloConfig>,

    socket: RwLock<Option<Arc<dyn StreamSocket>>>,
    processing_buffer: ProcessingBuffer,
    codec: Arc<dyn PayloadCodec>,

    connected: AtomicBool,
    is_alive: AtomicBool,
    missed_heartbeats: AtomicU32,
    /// Estimated round trip in milliseconds, 0 until the first heartbeat
    /// arrives. Written only on the dispatch path, read by senders.
    last_rtt_ms: AtomicI64,
    apply_compression: AtomicBool,

    handlers: RwLock<EventHandlers>,
    owner: RwLock<Weak<Listener>>,

    stopped: AtomicBool,
    stop_tasks: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PartialEq for NetworkClient {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for NetworkClient {}

impl NetworkClient {
    /// Creates an unconnected client. Install handlers, then call
    /// [`connect`](NetworkClient::connect).
    pub fn new(config: Arc<ParloConfig>) -> Arc<NetworkClient> {
        let client = Arc::new(NetworkClient {
            id: Uuid::new_v4(),
            config,
            socket: RwLock::new(None),
            processing_buffer: ProcessingBuffer::new(),
            codec: Arc::new(DeflateCodec),
            connected: AtomicBool::new(false),
            is_alive: AtomicBool::new(true),
            missed_heartbeats: AtomicU32::new(0),
            last_rtt_ms: AtomicI64::new(0),
            apply_compression: AtomicBool::new(false),
            handlers: RwLock::new(EventHandlers::default()),
            owner: RwLock::new(Weak::new()),
            stopped: AtomicBool::new(false),
            stop_tasks: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&client);
        client.processing_buffer.set_on_packet_processed(Arc::new(move |packet| {
            if let Some(client) = weak.upgrade() {
                client.dispatch_packet(packet);
            }
        }));

        let weak = Arc::downgrade(&client);
        client.processing_buffer.set_on_framing_error(Arc::new(move |e| {
            if let Some(client) = weak.upgrade() {
                error!(client = %client.id, "framing error, closing connection: {}", e);
                tokio::spawn(async move { client.teardown_after_fault().await });
            }
        }));

        client
    }

    /// Wraps an already-connected stream (e.g. an accepted connection) and
    /// starts the receive and heartbeat tasks.
    pub fn from_socket(socket: Arc<dyn StreamSocket>, config: Arc<ParloConfig>) -> Arc<NetworkClient> {
        let client = Self::new(config);
        client.attach_and_start(socket);
        client
    }

    /// Connects to a remote endpoint and starts the background tasks. On
    /// failure the `on_connection_lost` handler fires and the transport
    /// error is returned.
    pub async fn connect(self: &Arc<Self>, endpoint: SocketAddr) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            return Err(ParloError::InvalidArgument("client is already connected"));
        }

        match TcpStreamSocket::connect(endpoint).await {
            Ok(socket) => {
                info!(client = %self.id, "connected to {}", endpoint);
                self.attach_and_start(Arc::new(socket));
                Ok(())
            }
            Err(e) => {
                error!(client = %self.id, "error connecting to {}: {}", endpoint, e);
                self.fire_connection_lost();
                Err(e.into())
            }
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Acquire)
    }

    pub fn last_rtt_ms(&self) -> i64 {
        self.last_rtt_ms.load(Ordering::Acquire)
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket().and_then(|s| s.peer_addr())
    }

    /// The listener this connection was accepted by, if any.
    pub fn owner(&self) -> Weak<Listener> {
        self.owner.read().expect("owner lock poisoned").clone()
    }

    pub(crate) fn set_owner(&self, listener: Weak<Listener>) {
        *self.owner.write().expect("owner lock poisoned") = listener;
    }

    pub fn set_apply_compression(&self, apply: bool) {
        self.apply_compression.store(apply, Ordering::Release);
    }

    pub fn set_on_client_disconnected(&self, handler: ClientHandler) {
        self.handlers().on_client_disconnected = Some(handler);
    }

    pub fn set_on_server_disconnected(&self, handler: ClientHandler) {
        self.handlers().on_server_disconnected = Some(handler);
    }

    pub fn set_on_connection_lost(&self, handler: ClientHandler) {
        self.handlers().on_connection_lost = Some(handler);
    }

    pub fn set_on_received_heartbeat(&self, handler: ClientHandler) {
        self.handlers().on_received_heartbeat = Some(handler);
    }

    pub fn set_on_received_data(&self, handler: DataHandler) {
        self.handlers().on_received_data = Some(handler);
    }

    /// Sends raw bytes to the peer, compressing first when the gating policy
    /// says it pays off. A write failure marks the connection lost.
    pub async fn send(self: &Arc<Self>, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(ParloError::InvalidArgument("send data must not be empty"));
        }
        if data.len() > MAX_PACKET_SIZE {
            return Err(ParloError::packet_overflow(data.len()));
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(ParloError::NotConnected);
        }
        let socket = self.socket().ok_or(ParloError::NotConnected)?;

        let wire = if self.should_compress(data, self.last_rtt_ms()) {
            let compressed = self.codec.compress(data)?;
            let packet = Packet::new(data[0], compressed, true)?;
            trace!(from = data.len(), to = packet.frame_len(), "compressed outgoing data");
            packet.build()
        }
        else {
            data.to_vec()
        };

        if let Err(e) = socket.write_all(&wire).await {
            error!(client = %self.id, "error writing to socket: {}", e);
            self.mark_connection_lost();
            return Err(e.into());
        }
        Ok(())
    }

    /// Orderly teardown: optionally announce the disconnect to the peer,
    /// shut the transport down both ways, and stop the background tasks.
    /// Calling this on an already-disconnected client is a no-op.
    pub async fn disconnect(self: &Arc<Self>, send_goodbye: bool) -> Result<()> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(client = %self.id, "disconnecting");

        if let Some(socket) = self.socket() {
            if socket.is_open() {
                if send_goodbye {
                    let payload = GoodbyePayload::new(CLIENT_GRACE_PERIOD).to_payload();
                    let goodbye = Packet::new(ids::CLIENT_GOODBYE, payload, false)
                        .expect("goodbye payload is non-empty and fixed-size");
                    if let Err(e) = socket.write_all(&goodbye.build()).await {
                        debug!(client = %self.id, "could not send goodbye: {}", e);
                    }
                }
                socket.shutdown().await;
                socket.close();
            }
        }

        self.stopped.store(true, Ordering::Release);
        self.stop_tasks.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().expect("task list lock poisoned").drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// True when the gating policy selects compression: it is enabled, the
    /// data is at least a full packet, and the link is slow enough that the
    /// codec time is hidden by the round trip.
    pub fn should_compress(&self, data: &[u8], rtt_ms: i64) -> bool {
        if !self.apply_compression.load(Ordering::Acquire) {
            return false;
        }
        if data.len() < self.config.compression_threshold {
            return false;
        }
        rtt_ms > self.config.rtt_compression_threshold_ms
    }

    fn socket(&self) -> Option<Arc<dyn StreamSocket>> {
        self.socket.read().expect("socket lock poisoned").clone()
    }

    fn handlers(&self) -> std::sync::RwLockWriteGuard<'_, EventHandlers> {
        self.handlers.write().expect("handler lock poisoned")
    }

    fn handler(&self, pick: impl Fn(&EventHandlers) -> Option<ClientHandler>) -> Option<ClientHandler> {
        pick(&self.handlers.read().expect("handler lock poisoned"))
    }

    pub(crate) fn attach_and_start(self: &Arc<Self>, socket: Arc<dyn StreamSocket>) {
        self.attach(socket);
        self.start_tasks();
    }

    fn attach(&self, socket: Arc<dyn StreamSocket>) {
        *self.socket.write().expect("socket lock poisoned") = Some(socket);
        self.stopped.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
    }

    fn start_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        tasks.push(tokio::spawn(Self::receive_loop(Arc::downgrade(self))));
        tasks.push(tokio::spawn(Self::heartbeat_send_loop(
            Arc::downgrade(self),
            self.stop_tasks.clone(),
            self.config.heartbeat_interval,
        )));
        tasks.push(tokio::spawn(Self::heartbeat_monitor_loop(
            Arc::downgrade(self),
            self.stop_tasks.clone(),
            self.config.heartbeat_interval,
        )));
    }

    /// Dispatches one reassembled packet. Runs on the processing buffer's
    /// worker, so invocations are serialized and in stream order.
    fn dispatch_packet(self: &Arc<Self>, packet: Packet) {
        match packet.id() {
            ids::SERVER_GOODBYE => {
                debug!(client = %self.id, "server announced disconnect");
                if let Some(handler) = self.handler(|h| h.on_server_disconnected.clone()) {
                    handler(self);
                }
            }
            ids::CLIENT_GOODBYE => {
                debug!(client = %self.id, "client announced disconnect");
                if let Some(handler) = self.handler(|h| h.on_client_disconnected.clone()) {
                    handler(self);
                }
            }
            ids::HEARTBEAT => self.on_heartbeat(&packet),
            _ => self.deliver_data(packet),
        }
    }

    fn on_heartbeat(self: &Arc<Self>, packet: &Packet) {
        self.is_alive.store(true, Ordering::Release);
        self.missed_heartbeats.store(0, Ordering::Release);

        let mut body = packet.payload();
        let heartbeat = match HeartbeatPayload::deser(&mut body) {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                warn!(client = %self.id, "discarding malformed heartbeat: {}", e);
                return;
            }
        };

        let now_ms = unix_millis(SystemTime::now());
        let rtt = (now_ms - heartbeat.sent_timestamp_ms).abs() + heartbeat.time_since_last_ms;
        self.last_rtt_ms.store(rtt, Ordering::Release);
        trace!(client = %self.id, rtt_ms = rtt, "received heartbeat");

        if let Some(handler) = self.handler(|h| h.on_received_heartbeat.clone()) {
            handler(self);
        }
    }

    fn deliver_data(self: &Arc<Self>, packet: Packet) {
        let packet = if packet.is_compressed() {
            let restored = self
                .codec
                .decompress(packet.payload())
                .and_then(|plain| Packet::new(packet.id(), plain, false));
            match restored {
                Ok(packet) => packet,
                Err(e) => {
                    error!(client = %self.id, "could not restore compressed payload: {}", e);
                    self.fire_connection_lost();
                    return;
                }
            }
        }
        else {
            packet
        };

        let handler = self.handlers.read().expect("handler lock poisoned").on_received_data.clone();
        if let Some(handler) = handler {
            handler(self, &packet);
        }
    }

    /// Transport-level failure: flips the connected flag and raises the
    /// handler, at most once per connection.
    fn mark_connection_lost(self: &Arc<Self>) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.fire_connection_lost();
        }
    }

    fn fire_connection_lost(self: &Arc<Self>) {
        if let Some(handler) = self.handler(|h| h.on_connection_lost.clone()) {
            handler(self);
        }
    }

    /// The stream is beyond recovery (framing fault or reassembly overflow):
    /// close the transport and report the loss.
    async fn teardown_after_fault(self: &Arc<Self>) {
        if let Some(socket) = self.socket() {
            socket.shutdown().await;
            socket.close();
        }
        self.mark_connection_lost();
    }

    async fn receive_loop(weak: Weak<NetworkClient>) {
        loop {
            let socket = match weak.upgrade().and_then(|client| client.socket()) {
                Some(socket) => socket,
                None => break,
            };

            // only the socket handle is held across the await, so dropping
            // the last client handle is not kept from freeing the client
            let result = socket.receive().await;

            let client = match weak.upgrade() {
                Some(client) => client,
                None => break,
            };

            match result {
                Ok(chunk) if chunk.is_empty() => {
                    debug!(client = %client.id, "peer closed the stream");
                    client.mark_connection_lost();
                    break;
                }
                Ok(chunk) => {
                    if let Err(e) = client.processing_buffer.add_data(&chunk) {
                        // the reassembly window cannot hold the chunk, so the
                        // stream offset is no longer trustworthy
                        error!(client = %client.id, "closing connection: {}", e);
                        client.teardown_after_fault().await;
                        break;
                    }
                }
                Err(e) => {
                    if client.is_connected() {
                        debug!(client = %client.id, "receive failed: {}", e);
                    }
                    client.mark_connection_lost();
                    break;
                }
            }
        }
    }

    async fn heartbeat_send_loop(weak: Weak<NetworkClient>, stop: Arc<Notify>, period: Duration) {
        // first tick fires right away, announcing the connection
        let mut ticks = interval(period);
        let mut last_sent = SystemTime::now();

        loop {
            let stopped = stop.notified();
            if Self::is_stopped(&weak) {
                break;
            }

            tokio::select! {
                _ = stopped => break,
                _ = ticks.tick() => {
                    let Some(client) = weak.upgrade() else { break };

                    let now = SystemTime::now();
                    let delta_ms = match now.duration_since(last_sent) {
                        Ok(elapsed) => elapsed.as_millis() as i64,
                        Err(e) => e.duration().as_millis() as i64,
                    };
                    last_sent = now;

                    let payload = HeartbeatPayload {
                        time_since_last_ms: delta_ms,
                        sent_timestamp_ms: unix_millis(now),
                    };
                    let pulse = Packet::new(ids::HEARTBEAT, payload.to_payload(), false)
                        .expect("heartbeat payload is non-empty and fixed-size");

                    match client.send(&pulse.build()).await {
                        Ok(()) => trace!(client = %client.id, "sent heartbeat"),
                        Err(ParloError::NotConnected) => break,
                        Err(e) => error!(client = %client.id, "error sending heartbeat: {}", e),
                    }
                }
            }
        }
    }

    async fn heartbeat_monitor_loop(weak: Weak<NetworkClient>, stop: Arc<Notify>, period: Duration) {
        // the first window only ends after a full period
        let mut ticks = interval_at(Instant::now() + period, period);

        loop {
            let stopped = stop.notified();
            if Self::is_stopped(&weak) {
                break;
            }

            tokio::select! {
                _ = stopped => break,
                _ = ticks.tick() => {
                    let Some(client) = weak.upgrade() else { break };

                    let missed = client.missed_heartbeats.fetch_add(1, Ordering::AcqRel) + 1;
                    if missed > client.config.max_missed_heartbeats {
                        // fire once per liveness epoch; a future heartbeat
                        // starts a new epoch
                        if client.is_alive.swap(false, Ordering::AcqRel) {
                            warn!(client = %client.id, missed, "peer missed too many heartbeats");
                            client.fire_connection_lost();
                        }
                    }
                }
            }
        }
    }

    fn is_stopped(weak: &Weak<NetworkClient>) -> bool {
        match weak.upgrade() {
            Some(client) => client.stopped.load(Ordering::Acquire),
            None => true,
        }
    }
}

impl Drop for NetworkClient {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().expect("task list lock poisoned").drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::MockStreamSocket;
    use async_trait::async_trait;
    use rstest::rstest;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use tokio::runtime::Builder;
    use tokio::sync::mpsc;

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within timeout");
    }

    fn quiet_config() -> Arc<ParloConfig> {
        // heartbeats far enough out that they never fire during a test
        Arc::new(ParloConfig {
            heartbeat_interval: Duration::from_secs(600),
            ..ParloConfig::default()
        })
    }

    /// Hand-rolled socket for driving a full client: incoming chunks come
    /// from a channel (so `receive` pends like a quiet connection), writes
    /// are recorded.
    struct ScriptedSocket {
        incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<Vec<u8>>>>,
        written: Mutex<Vec<Vec<u8>>>,
        open: AtomicBool,
        was_shut_down: AtomicBool,
        recv_shutdown: Notify,
    }

    impl ScriptedSocket {
        fn new() -> (Arc<ScriptedSocket>, mpsc::UnboundedSender<io::Result<Vec<u8>>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let socket = Arc::new(ScriptedSocket {
                incoming: tokio::sync::Mutex::new(rx),
                written: Mutex::new(Vec::new()),
                open: AtomicBool::new(true),
                was_shut_down: AtomicBool::new(false),
                recv_shutdown: Notify::new(),
            });
            (socket, tx)
        }

        fn frames_with_id(&self, id: u8) -> Vec<Vec<u8>> {
            self.written
                .lock()
                .unwrap()
                .iter()
                .filter(|frame| frame.first() == Some(&id))
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl StreamSocket for ScriptedSocket {
        async fn receive(&self) -> io::Result<Vec<u8>> {
            let shut_down = self.recv_shutdown.notified();
            if !self.open.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
            }

            let mut guard = self.incoming.lock().await;
            tokio::select! {
                _ = shut_down => Err(io::Error::new(io::ErrorKind::NotConnected, "shut down")),
                chunk = guard.recv() => match chunk {
                    Some(result) => result,
                    None => Ok(Vec::new()),
                },
            }
        }

        async fn write_all(&self, data: &[u8]) -> io::Result<()> {
            self.written.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn shutdown(&self) {
            self.was_shut_down.store(true, Ordering::Release);
            self.recv_shutdown.notify_waiters();
        }

        async fn shutdown_send(&self) {}

        fn shutdown_receive(&self) {
            self.recv_shutdown.notify_waiters();
        }

        fn close(&self) {
            self.open.store(false, Ordering::Release);
            self.recv_shutdown.notify_waiters();
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn lost_counter(client: &Arc<NetworkClient>) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        client.set_on_connection_lost(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        count
    }

    #[tokio::test]
    async fn test_send_rejects_bad_input() {
        let client = NetworkClient::new(quiet_config());

        assert!(matches!(client.send(&[]).await, Err(ParloError::InvalidArgument(_))));
        assert!(matches!(
            client.send(&[0u8; MAX_PACKET_SIZE + 1]).await,
            Err(ParloError::Overflow { .. })
        ));
        assert!(matches!(client.send(&[1, 2, 3]).await, Err(ParloError::NotConnected)));
    }

    #[rstest]
    #[case::disabled(false, 1024, 150, false)]
    #[case::small_payload(true, 1023, 150, false)]
    #[case::fast_link(true, 1024, 100, false)]
    #[case::all_criteria_met(true, 1024, 101, true)]
    #[case::zero_rtt(true, 1024, 0, false)]
    fn test_should_compress_gating(
        #[case] enabled: bool,
        #[case] data_len: usize,
        #[case] rtt_ms: i64,
        #[case] expected: bool,
    ) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let client = NetworkClient::new(Arc::new(ParloConfig::default()));
            client.set_apply_compression(enabled);
            assert_eq!(client.should_compress(&vec![0u8; data_len], rtt_ms), expected);
        });
    }

    #[tokio::test]
    async fn test_send_passes_data_through_unchanged() {
        let mut socket = MockStreamSocket::new();
        socket
            .expect_write_all()
            .withf(|data| data == [9u8, 9, 9].as_slice())
            .once()
            .returning(|_| Ok(()));

        let client = NetworkClient::new(quiet_config());
        client.attach(Arc::new(socket));

        client.send(&[9, 9, 9]).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_error_marks_connection_lost() {
        let mut socket = MockStreamSocket::new();
        socket
            .expect_write_all()
            .once()
            .returning(|_| Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe")));

        let client = NetworkClient::new(quiet_config());
        client.attach(Arc::new(socket));
        let lost = lost_counter(&client);

        assert!(matches!(client.send(&[1]).await, Err(ParloError::Transport(_))));
        assert!(!client.is_connected());
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_compresses_when_gating_selects_it() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut socket = MockStreamSocket::new();
        {
            let written = written.clone();
            socket.expect_write_all().returning(move |data| {
                written.lock().unwrap().push(data.to_vec());
                Ok(())
            });
        }

        let client = NetworkClient::new(quiet_config());
        client.attach(Arc::new(socket));
        client.set_apply_compression(true);
        client.last_rtt_ms.store(150, Ordering::Release);

        let data = vec![0x17u8; MAX_PACKET_SIZE];
        client.send(&data).await.unwrap();

        let frames = written.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame[0], 0x17);
        assert_eq!(frame[1], 1);
        let frame_len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        assert_eq!(frame_len, frame.len());
        assert!(frame.len() < data.len());

        let restored = DeflateCodec.decompress(&frame[4..]).unwrap();
        assert_eq!(restored, data);
    }

    #[tokio::test]
    async fn test_dispatch_goodbyes() {
        let client = NetworkClient::new(quiet_config());

        let client_byes = Arc::new(AtomicUsize::new(0));
        let server_byes = Arc::new(AtomicUsize::new(0));
        {
            let count = client_byes.clone();
            let expected_id = client.id();
            client.set_on_client_disconnected(Arc::new(move |from| {
                assert_eq!(from.id(), expected_id);
                count.fetch_add(1, Ordering::SeqCst);
            }));
            let count = server_byes.clone();
            client.set_on_server_disconnected(Arc::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let payload = GoodbyePayload::new(CLIENT_GRACE_PERIOD).to_payload();
        client.dispatch_packet(Packet::new(ids::CLIENT_GOODBYE, payload.clone(), false).unwrap());
        client.dispatch_packet(Packet::new(ids::SERVER_GOODBYE, payload, false).unwrap());

        assert_eq!(client_byes.load(Ordering::SeqCst), 1);
        assert_eq!(server_byes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_rtt_and_resets_misses() {
        let client = NetworkClient::new(quiet_config());
        client.missed_heartbeats.store(3, Ordering::Release);
        client.is_alive.store(false, Ordering::Release);

        let heartbeats = Arc::new(AtomicUsize::new(0));
        {
            let count = heartbeats.clone();
            client.set_on_received_heartbeat(Arc::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let payload = HeartbeatPayload {
            time_since_last_ms: 10,
            sent_timestamp_ms: unix_millis(SystemTime::now()) - 40,
        };
        client.dispatch_packet(Packet::new(ids::HEARTBEAT, payload.to_payload(), false).unwrap());

        assert_eq!(heartbeats.load(Ordering::SeqCst), 1);
        assert_eq!(client.missed_heartbeats(), 0);
        assert!(client.is_alive());
        // 40ms one-way + 10ms sender jitter, plus a little dispatch slack
        assert!((50..150).contains(&client.last_rtt_ms()), "rtt was {}", client.last_rtt_ms());
    }

    #[tokio::test]
    async fn test_malformed_heartbeat_is_skipped() {
        let client = NetworkClient::new(quiet_config());
        let heartbeats = Arc::new(AtomicUsize::new(0));
        {
            let count = heartbeats.clone();
            client.set_on_received_heartbeat(Arc::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        client.dispatch_packet(Packet::new(ids::HEARTBEAT, vec![1, 2, 3], false).unwrap());

        assert_eq!(heartbeats.load(Ordering::SeqCst), 0);
        assert_eq!(client.last_rtt_ms(), 0);
    }

    #[tokio::test]
    async fn test_compressed_data_is_restored_before_delivery() {
        let client = NetworkClient::new(quiet_config());

        let received = Arc::new(Mutex::new(Vec::new()));
        {
            let received = received.clone();
            client.set_on_received_data(Arc::new(move |_, packet| {
                received.lock().unwrap().push(packet.clone());
            }));
        }

        let original = vec![0x5Au8; 2000];
        let compressed = DeflateCodec.compress(&original).unwrap();
        client.dispatch_packet(Packet::new(0x21, compressed, true).unwrap());

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id(), 0x21);
        assert!(!received[0].is_compressed());
        assert_eq!(received[0].payload(), &original[..]);
    }

    #[tokio::test]
    async fn test_undecompressable_payload_is_a_connection_fault() {
        let client = NetworkClient::new(quiet_config());
        let lost = lost_counter(&client);
        let received = Arc::new(AtomicUsize::new(0));
        {
            let count = received.clone();
            client.set_on_received_data(Arc::new(move |_, _| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        client.dispatch_packet(Packet::new(0x21, vec![0xde, 0xad, 0xbe, 0xef], true).unwrap());

        assert_eq!(received.load(Ordering::SeqCst), 0);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_goodbye_through_the_stream_fires_handler() {
        let (socket, chunks) = ScriptedSocket::new();
        let client = NetworkClient::from_socket(socket, quiet_config());

        let byes = Arc::new(AtomicUsize::new(0));
        {
            let count = byes.clone();
            client.set_on_client_disconnected(Arc::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let payload = GoodbyePayload::new(CLIENT_GRACE_PERIOD).to_payload();
        let goodbye = Packet::new(ids::CLIENT_GOODBYE, payload, false).unwrap();
        chunks.send(Ok(goodbye.build())).unwrap();

        eventually(|| byes.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_disconnect_sends_goodbye_and_stops() {
        let (socket, _chunks) = ScriptedSocket::new();
        let client = NetworkClient::from_socket(socket.clone(), quiet_config());

        client.disconnect(true).await.unwrap();

        assert!(!client.is_connected());
        assert!(socket.was_shut_down.load(Ordering::Acquire));
        assert!(!socket.is_open());

        let goodbyes = socket.frames_with_id(ids::CLIENT_GOODBYE);
        assert_eq!(goodbyes.len(), 1);
        let frame = &goodbyes[0];
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 20);
        let parsed = GoodbyePayload::deser(&mut &frame[4..]).unwrap();
        assert_eq!(parsed.timeout_seconds, CLIENT_GRACE_PERIOD.as_secs() as i64);

        // double disconnect is a no-op
        client.disconnect(true).await.unwrap();
        assert_eq!(socket.frames_with_id(ids::CLIENT_GOODBYE).len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_without_goodbye() {
        let (socket, _chunks) = ScriptedSocket::new();
        let client = NetworkClient::from_socket(socket.clone(), quiet_config());

        client.disconnect(false).await.unwrap();

        assert!(socket.frames_with_id(ids::CLIENT_GOODBYE).is_empty());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_receive_error_fires_connection_lost_once() {
        let (socket, chunks) = ScriptedSocket::new();
        let client = NetworkClient::from_socket(socket, quiet_config());
        let lost = lost_counter(&client);

        chunks
            .send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .unwrap();

        eventually(|| lost.load(Ordering::SeqCst) == 1).await;
        assert!(!client.is_connected());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missed_heartbeats_fire_once_per_epoch() {
        let config = Arc::new(ParloConfig {
            heartbeat_interval: Duration::from_millis(20),
            max_missed_heartbeats: 2,
            ..ParloConfig::default()
        });
        let (socket, chunks) = ScriptedSocket::new();
        let client = NetworkClient::from_socket(socket, config);
        let lost = lost_counter(&client);

        // 3 silent intervals exceed the allowance of 2
        eventually(|| lost.load(Ordering::SeqCst) == 1).await;
        assert!(!client.is_alive());

        // a heartbeat starts a new epoch
        let payload = HeartbeatPayload {
            time_since_last_ms: 0,
            sent_timestamp_ms: unix_millis(SystemTime::now()),
        };
        let pulse = Packet::new(ids::HEARTBEAT, payload.to_payload(), false).unwrap();
        chunks.send(Ok(pulse.build())).unwrap();
        eventually(|| client.is_alive()).await;
        assert_eq!(client.missed_heartbeats(), 0);

        // silence again - exactly one more notification
        eventually(|| lost.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lost.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_heartbeats_are_sent_on_the_wire() {
        let config = Arc::new(ParloConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..ParloConfig::default()
        });
        let (socket, _chunks) = ScriptedSocket::new();
        let _client = NetworkClient::from_socket(socket.clone(), config);

        eventually(|| socket.frames_with_id(ids::HEARTBEAT).len() >= 2).await;

        let frame = &socket.frames_with_id(ids::HEARTBEAT)[0];
        assert_eq!(frame[1], 0);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 20);
        let parsed = HeartbeatPayload::deser(&mut &frame[4..]).unwrap();
        let now = unix_millis(SystemTime::now());
        assert!((now - parsed.sent_timestamp_ms).abs() < 5_000);
    }
}
