//! Packet cache service (§4.9): a named service holding the most recent
//! `capacity` [`DataPacket`]s per sensor, answering [`DataRequest`] with
//! every cached packet overlapping the requested window.
//!
//! Grounded in `crate::directory::Operator`'s `Reply`-over-`DashMap` shape:
//! since the cache lives entirely in memory, the per-request logic never
//! awaits anything and fits `Reply::start`'s synchronous callback contract
//! directly, unlike [`crate::services::counter::CounterService`].

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::message::{AnyMessage, DataPacket, DataRequest, DataResponse, Message};
use crate::socket::reqrep::Reply;
use crate::socket::{SocketError, SocketOptions};
use crate::transport::Context;

/// Packet-cache service errors.
#[derive(Error, Debug)]
pub enum PacketCacheError {
    /// A socket-level failure while serving or populating the cache.
    #[error(transparent)]
    Socket(#[from] SocketError),

    /// `capacity` was zero.
    #[error("packet cache capacity must be at least 1")]
    ZeroCapacity,
}

/// The end of a packet's sample window, computed from its sampling rate.
fn packet_end(packet: &DataPacket) -> chrono::DateTime<chrono::Utc> {
    if packet.samples.is_empty() || packet.sampling_rate_hz <= 0.0 {
        return packet.start_time;
    }
    let duration_s = (packet.samples.len() - 1) as f64 / packet.sampling_rate_hz;
    packet.start_time + chrono::Duration::milliseconds((duration_s * 1000.0) as i64)
}

/// Whether `packet`'s `[start_time, packet_end]` window overlaps
/// `[start, end]`.
fn overlaps(
    packet: &DataPacket,
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
) -> bool {
    packet.start_time <= end && packet_end(packet) >= start
}

/// A fixed-capacity, oldest-first-evicting ring of packets for one sensor.
struct SensorRing {
    packets: VecDeque<DataPacket>,
    capacity: usize,
}

impl SensorRing {
    fn new(capacity: usize) -> Self {
        Self {
            packets: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, packet: DataPacket) {
        if self.packets.len() == self.capacity {
            self.packets.pop_front();
        }
        self.packets.push_back(packet);
    }

    fn window(
        &self,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Vec<DataPacket> {
        self.packets
            .iter()
            .filter(|p| overlaps(p, start, end))
            .cloned()
            .collect()
    }
}

/// The in-memory, per-sensor packet cache.
struct Cache {
    rings: DashMap<String, SensorRing>,
    capacity: usize,
}

impl Cache {
    fn new(capacity: usize) -> Self {
        Self {
            rings: DashMap::new(),
            capacity,
        }
    }

    fn insert(&self, packet: DataPacket) {
        self.rings
            .entry(packet.sensor_key())
            .or_insert_with(|| SensorRing::new(self.capacity))
            .push(packet);
    }

    fn query(
        &self,
        sensor_key: &str,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Vec<DataPacket> {
        self.rings
            .get(sensor_key)
            .map(|ring| ring.window(start, end))
            .unwrap_or_default()
    }
}

/// The reply-socket-backed packet cache, dispatching `DataRequest` against
/// an in-memory cache fed by [`PacketCacheService::ingest`].
pub struct PacketCacheService {
    reply: Reply,
    cache: Arc<Cache>,
}

impl PacketCacheService {
    /// A not-yet-initialized packet cache retaining the most recent
    /// `capacity` packets per sensor.
    ///
    /// # Errors
    ///
    /// Returns [`PacketCacheError::ZeroCapacity`] if `capacity` is `0`.
    pub fn new(context: Context, capacity: usize) -> Result<Self, PacketCacheError> {
        if capacity == 0 {
            return Err(PacketCacheError::ZeroCapacity);
        }
        Ok(Self {
            reply: Reply::new(context),
            cache: Arc::new(Cache::new(capacity)),
        })
    }

    /// Bind the service's reply socket.
    ///
    /// # Errors
    ///
    /// Propagates [`SocketError`] from the underlying `Reply::initialize`.
    pub fn initialize(&mut self, options: SocketOptions) -> Result<(), PacketCacheError> {
        self.reply.initialize(options)?;
        Ok(())
    }

    /// Record a packet arriving off a subscribed broadcast, evicting the
    /// oldest cached packet for its sensor if at capacity.
    pub fn ingest(&self, packet: DataPacket) {
        self.cache.insert(packet);
    }

    /// Run the serve loop until [`PacketCacheService::stop`] is called.
    ///
    /// # Errors
    ///
    /// Propagates [`SocketError`] from the underlying reply loop.
    pub async fn start(&mut self) -> Result<(), PacketCacheError> {
        let cache = Arc::clone(&self.cache);
        debug!("packet cache service starting");
        self.reply
            .start(move |type_name, payload| {
                if type_name != DataRequest::TYPE_NAME {
                    return Err(format!("unsupported request type: {type_name}"));
                }
                let request = DataRequest::from_wire(payload).map_err(|e| e.to_string())?;
                if request.start_time > request.end_time {
                    return Err("start_time must not be after end_time".to_string());
                }
                let packets = cache.query(&request.sensor_key, request.start_time, request.end_time);
                Ok(AnyMessage::DataResponse(DataResponse { packets }))
            })
            .await
            .map_err(|e| {
                warn!("packet cache service stopped: {e}");
                PacketCacheError::Socket(e)
            })
    }

    /// Stop the serve loop after its current iteration.
    pub fn stop(&mut self) {
        self.reply.stop();
    }
}
