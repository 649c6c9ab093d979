use crate::error::{ParloError, Result};
use crate::packet::{Packet, HEADER_LEN_STANDARD, MAX_PACKET_SIZE};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

pub type PacketCallback = Arc<dyn Fn(Packet) + Send + Sync>;
pub type FramingErrorCallback = Arc<dyn Fn(ParloError) + Send + Sync>;

/// Reassembles whole packets from an arbitrarily chunked byte stream.
///
/// Bytes go in through [`add_data`](ProcessingBuffer::add_data) in whatever
/// chunks the transport produces; a dedicated worker task slices out complete
/// frames and hands each one to the packet callback. Packets are delivered in
/// the exact order their header bytes appeared in the stream, and callbacks
/// never overlap - there is only the one worker.
pub struct ProcessingBuffer {
    inner: Arc<Mutex<ProcessingBufferInner>>,
    data_available: Arc<Notify>,
    worker: JoinHandle<()>,
}

struct ProcessingBufferInner {
    fifo: VecDeque<u8>,

    has_header: bool,
    current_id: u8,
    current_compressed: bool,
    current_length: u16,

    on_packet: Option<PacketCallback>,
    on_framing_error: Option<FramingErrorCallback>,

    /// Set after a framing fault. The stream offset is unknowable from that
    /// point on, so parsing stops for good; the owner is expected to tear the
    /// connection down.
    desynchronized: bool,
}

enum SliceOutcome {
    Packet(Packet),
    Fault(ParloError),
    NeedMoreData,
}

impl ProcessingBufferInner {
    fn try_slice_packet(&mut self) -> SliceOutcome {
        if self.desynchronized {
            return SliceOutcome::NeedMoreData;
        }

        if !self.has_header {
            if self.fifo.len() < HEADER_LEN_STANDARD {
                return SliceOutcome::NeedMoreData;
            }

            self.current_id = self.fifo.pop_front().expect("checked above");
            // the flag byte is 0 or 1 by contract; anything else is treated
            // as not compressed rather than desynchronizing the stream
            self.current_compressed = self.fifo.pop_front().expect("checked above") == 1;
            let length_low = self.fifo.pop_front().expect("checked above");
            let length_high = self.fifo.pop_front().expect("checked above");
            self.current_length = u16::from_le_bytes([length_low, length_high]);
            self.has_header = true;

            let length = self.current_length as usize;
            if length < HEADER_LEN_STANDARD + 1 || length > MAX_PACKET_SIZE + HEADER_LEN_STANDARD {
                self.desynchronized = true;
                return SliceOutcome::Fault(ParloError::Framing(format!(
                    "header declares impossible frame length {}",
                    length,
                )));
            }
        }

        let payload_len = self.current_length as usize - HEADER_LEN_STANDARD;
        if self.fifo.len() < payload_len {
            return SliceOutcome::NeedMoreData;
        }

        let payload: Vec<u8> = self.fifo.drain(..payload_len).collect();
        self.has_header = false;

        match Packet::new(self.current_id, payload, self.current_compressed) {
            Ok(packet) => SliceOutcome::Packet(packet),
            Err(e) => {
                self.desynchronized = true;
                SliceOutcome::Fault(e)
            }
        }
    }
}

impl ProcessingBuffer {
    /// Creates the buffer and spawns its worker task on the current runtime.
    pub fn new() -> ProcessingBuffer {
        let inner = Arc::new(Mutex::new(ProcessingBufferInner {
            fifo: VecDeque::new(),
            has_header: false,
            current_id: 0,
            current_compressed: false,
            current_length: 0,
            on_packet: None,
            on_framing_error: None,
            desynchronized: false,
        }));
        let data_available = Arc::new(Notify::new());

        let worker = tokio::spawn(Self::worker_loop(inner.clone(), data_available.clone()));

        ProcessingBuffer {
            inner,
            data_available,
            worker,
        }
    }

    /// Installs the per-packet sink. Must be set before data arrives for
    /// meaningful operation - packets sliced without a sink are dropped.
    pub fn set_on_packet_processed(&self, callback: PacketCallback) {
        self.lock().on_packet = Some(callback);
    }

    /// Installs the sink for unrecoverable framing faults.
    pub fn set_on_framing_error(&self, callback: FramingErrorCallback) {
        self.lock().on_framing_error = Some(callback);
    }

    /// Appends a chunk of stream bytes and wakes the worker. A chunk bigger
    /// than [`MAX_PACKET_SIZE`] is rejected without touching the buffer.
    pub fn add_data(&self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(ParloError::packet_overflow(data.len()));
        }

        self.lock().fifo.extend(data);
        self.data_available.notify_one();
        Ok(())
    }

    /// Current number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.lock().fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().fifo.is_empty()
    }

    /// Reads the byte at a logical position without consuming it.
    pub fn byte_at(&self, index: usize) -> Option<u8> {
        self.lock().fifo.get(index).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProcessingBufferInner> {
        self.inner.lock().expect("processing buffer mutex poisoned")
    }

    async fn worker_loop(inner: Arc<Mutex<ProcessingBufferInner>>, data_available: Arc<Notify>) {
        loop {
            data_available.notified().await;

            loop {
                // slice under the lock, dispatch outside it - the callback may
                // want to feed more data in
                let (outcome, on_packet, on_framing_error) = {
                    let mut guard = inner.lock().expect("processing buffer mutex poisoned");
                    let outcome = guard.try_slice_packet();
                    (outcome, guard.on_packet.clone(), guard.on_framing_error.clone())
                };

                match outcome {
                    SliceOutcome::Packet(packet) => {
                        trace!(?packet, "sliced packet from stream");
                        if let Some(callback) = on_packet {
                            callback(packet);
                        }
                    }
                    SliceOutcome::Fault(e) => {
                        warn!("framing fault, parsing stopped: {}", e);
                        if let Some(callback) = on_framing_error {
                            callback(e);
                        }
                        break;
                    }
                    SliceOutcome::NeedMoreData => break,
                }
            }
        }
    }
}

impl Drop for ProcessingBuffer {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
