use std::cmp::max;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use derivative::Derivative;
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::codec::beacon::{
    decode_discovery_beacon, device_time, DEFAULT_SYNC_ID, DISCOVERY_PORT,
};
use crate::codec::TimeSyncPacket;

/// A device heard on the discovery port.
///
/// Equality and hashing ignore the timestamps, so the same device heard
/// twice is one entry in a set.
#[derive(Derivative)]
#[derivative(Hash, PartialEq, Eq, PartialOrd)]
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    /// Where the beacon came from; time-sync replies go here.
    pub address: SocketAddr,
    /// Address the device announces in its beacon.
    pub ip_address: Ipv4Addr,
    /// Raw id from the beacon, echoed back in time-sync replies.
    pub sender_id: u32,

    #[derivative(Hash = "ignore", PartialEq = "ignore", PartialOrd = "ignore")]
    pub device_time: u32,

    #[derivative(Hash = "ignore", PartialEq = "ignore", PartialOrd = "ignore")]
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    pub bind_address: SocketAddr,
    /// Devices silent for longer than this are forgotten.
    pub device_timeout: Duration,
    pub sweep_interval: Duration,
    /// Answer every beacon with a time-sync packet.
    pub time_sync: bool,
    pub sync_id: u32,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptions {
            bind_address: SocketAddr::from(([0, 0, 0, 0], DISCOVERY_PORT)),
            device_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            time_sync: false,
            sync_id: DEFAULT_SYNC_ID,
        }
    }
}

impl DiscoveryOptions {
    pub fn with_bind_address(mut self, bind_address: SocketAddr) -> Self {
        self.bind_address = bind_address;
        self
    }

    pub fn with_device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_time_sync(mut self, enabled: bool) -> Self {
        self.time_sync = enabled;
        self
    }

    pub fn with_sync_id(mut self, sync_id: u32) -> Self {
        self.sync_id = sync_id;
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ListenerState {
    devices: Mutex<HashMap<IpAddr, DiscoveredDevice>>,
    time_sync: AtomicBool,
    device_timeout: Duration,
    sync_id: u32,
}

impl ListenerState {
    fn new(options: &DiscoveryOptions) -> Self {
        ListenerState {
            devices: Mutex::new(HashMap::new()),
            time_sync: AtomicBool::new(options.time_sync),
            device_timeout: options.device_timeout,
            sync_id: options.sync_id,
        }
    }

    /// Records a datagram. Returns the time-sync reply to send, if any.
    fn handle_packet(&self, data: &[u8], source: SocketAddr, now: DateTime<Utc>) -> Option<Bytes> {
        let packet = match decode_discovery_beacon(data) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("ignoring datagram from {}: {}", source, err);
                return None;
            }
        };

        if packet.is_beacon() {
            let device = DiscoveredDevice {
                address: source,
                ip_address: packet.ip_address(),
                sender_id: packet.sender_id,
                device_time: packet.device_time,
                last_seen: now,
            };
            if lock(&self.devices).insert(source.ip(), device).is_none() {
                info!("found device {} ({})", packet.ip_address(), source);
            }

            if self.time_sync.load(Ordering::SeqCst) {
                let reply = TimeSyncPacket::reply_to(&packet, self.sync_id, device_time(now));
                return Some(reply.encode());
            }
        } else if packet.is_time_sync() {
            if self.time_sync.swap(false, Ordering::SeqCst) {
                info!("{} is providing time sync, disabling ours", source);
            }
        } else {
            trace!("ignoring packet type {} from {}", packet.packet_type, source);
        }
        None
    }

    fn sweep(&self, now: DateTime<Utc>) {
        lock(&self.devices).retain(|ip, device| {
            let silent = now
                .signed_duration_since(device.last_seen)
                .to_std()
                .unwrap_or_default();
            let keep = silent <= self.device_timeout;
            if !keep {
                info!("device {} timed out", ip);
            }
            keep
        });
    }

    fn snapshot(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<DiscoveredDevice> = lock(&self.devices).values().cloned().collect();
        devices.sort_by_key(|device| device.address);
        devices
    }
}

async fn listen(
    socket: UdpSocket,
    state: Arc<ListenerState>,
    sweep_interval: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut buffer = [0u8; 1024];
    let mut sweep = interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = sweep.tick() => state.sweep(Utc::now()),
            received = socket.recv_from(&mut buffer) => match received {
                Ok((number_of_bytes, source)) => {
                    let reply = state.handle_packet(&buffer[..number_of_bytes], source, Utc::now());
                    if let Some(reply) = reply {
                        if let Err(err) = socket.send_to(&reply, source).await {
                            warn!("failed to send time sync to {}: {}", source, err);
                        }
                    }
                }
                Err(err) => {
                    error!("discovery socket failed: {}", err);
                    break;
                }
            }
        }
    }
    debug!("discovery listener stopped");
}

/// Keeps a live view of the devices broadcasting beacons.
pub struct DiscoveryListener {
    local_addr: SocketAddr,
    state: Arc<ListenerState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl DiscoveryListener {
    pub async fn start(options: DiscoveryOptions) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(options.bind_address)
            .await
            .with_context(|| format!("Failed to bind discovery socket to {}", options.bind_address))?;
        socket
            .set_broadcast(true)
            .context("Failed to enable broadcast on discovery socket")?;
        let local_addr = socket.local_addr()?;
        info!("listening for beacons on {}", local_addr);

        let state = Arc::new(ListenerState::new(&options));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(listen(
            socket,
            state.clone(),
            options.sweep_interval,
            shutdown_rx,
        ));

        Ok(DiscoveryListener {
            local_addr,
            state,
            shutdown: Some(shutdown),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of the known devices, ordered by address.
    pub fn list(&self) -> Vec<DiscoveredDevice> {
        self.state.snapshot()
    }

    pub fn set_time_sync(&self, enabled: bool) {
        self.state.time_sync.store(enabled, Ordering::SeqCst);
    }

    pub fn is_time_sync_enabled(&self) -> bool {
        self.state.time_sync.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!("discovery task ended abnormally: {}", err);
            }
        }
    }
}

impl Drop for DiscoveryListener {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

pub struct Discovery;

impl Discovery {
    /// Listens on the discovery port for `given_timeout` and returns every
    /// device heard.
    pub async fn find_devices(given_timeout: Duration) -> anyhow::Result<HashSet<DiscoveredDevice>> {
        Self::find_devices_with(DiscoveryOptions::default(), given_timeout).await
    }

    pub async fn find_devices_with(
        options: DiscoveryOptions,
        given_timeout: Duration,
    ) -> anyhow::Result<HashSet<DiscoveredDevice>> {
        let mut listener = DiscoveryListener::start(options).await?;
        sleep(given_timeout).await;
        let devices = listener.list().into_iter().collect();
        listener.stop().await;
        Ok(devices)
    }

    pub fn pretty_print_devices(devices: &HashSet<DiscoveredDevice>) {
        let mut devices: Vec<&DiscoveredDevice> = devices.iter().collect();
        devices.sort_by_key(|device| device.address);

        let max_ip_width = max(
            devices
                .iter()
                .map(|d| d.ip_address.to_string().len())
                .max()
                .unwrap_or(0),
            "IP Address".len(),
        );
        let max_source_width = max(
            devices
                .iter()
                .map(|d| d.address.to_string().len())
                .max()
                .unwrap_or(0),
            "Source".len(),
        );
        let max_time_width = max(
            devices
                .iter()
                .map(|d| d.device_time.to_string().len())
                .max()
                .unwrap_or(0),
            "Device Time".len(),
        );

        println!(
            "{:<ip_width$} {:<source_width$} {:<time_width$} {}",
            "IP Address",
            "Source",
            "Device Time",
            "Last Seen",
            ip_width = max_ip_width + 2,
            source_width = max_source_width + 2,
            time_width = max_time_width + 2,
        );
        println!(
            "{:<ip_width$} {:<source_width$} {:<time_width$} {}",
            "-".repeat(max_ip_width),
            "-".repeat(max_source_width),
            "-".repeat(max_time_width),
            "-".repeat(20),
            ip_width = max_ip_width + 2,
            source_width = max_source_width + 2,
            time_width = max_time_width + 2,
        );
        for device in devices {
            println!(
                "{:<ip_width$} {:<source_width$} {:<time_width$} {}",
                device.ip_address,
                device.address,
                device.device_time,
                device.last_seen.format("%Y-%m-%d %H:%M:%S"),
                ip_width = max_ip_width + 2,
                source_width = max_source_width + 2,
                time_width = max_time_width + 2,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::beacon::{decode_time_sync, encode_time_sync_reply};
    use chrono::TimeDelta;

    fn beacon(ip: [u8; 4], time: u32) -> Vec<u8> {
        let mut bytes = 42u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&ip);
        bytes.extend_from_slice(&time.to_le_bytes());
        bytes
    }

    fn source(last_octet: u8) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, last_octet], 1889))
    }

    #[test]
    fn test_beacons_are_keyed_by_source() {
        let state = ListenerState::new(&DiscoveryOptions::default());
        let now = Utc::now();
        state.handle_packet(&beacon([192, 168, 1, 10], 1), source(10), now);
        state.handle_packet(&beacon([192, 168, 1, 10], 2), source(10), now);
        state.handle_packet(&beacon([192, 168, 1, 11], 3), source(11), now);

        let devices = state.snapshot();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_time, 2);
        assert_eq!(devices[1].ip_address, Ipv4Addr::new(192, 168, 1, 11));
    }

    #[test]
    fn test_silent_devices_are_evicted() {
        let options = DiscoveryOptions::default().with_device_timeout(Duration::from_secs(30));
        let state = ListenerState::new(&options);
        let start = Utc::now();
        state.handle_packet(&beacon([10, 0, 0, 1], 0), source(1), start);
        state.handle_packet(&beacon([10, 0, 0, 2], 0), source(2), start + TimeDelta::seconds(20));

        state.sweep(start + TimeDelta::seconds(30));
        assert_eq!(state.snapshot().len(), 2);

        state.sweep(start + TimeDelta::seconds(31));
        let remaining = state.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].address, source(2));
    }

    #[test]
    fn test_time_sync_reply_echoes_beacon() {
        let state = ListenerState::new(&DiscoveryOptions::default().with_time_sync(true));
        let now = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let reply = state
            .handle_packet(&beacon([10, 0, 0, 9], 777), source(9), now)
            .expect("time sync enabled");

        let packet = decode_time_sync(&reply).unwrap();
        assert_eq!(packet.sync_id, 890);
        assert_eq!(packet.now, device_time(now));
        assert_eq!(packet.sender_id, u32::from_le_bytes([10, 0, 0, 9]));
        assert_eq!(packet.sender_time, 777);
    }

    #[test]
    fn test_defers_to_other_time_source() {
        let state = ListenerState::new(&DiscoveryOptions::default().with_time_sync(true));
        let other = encode_time_sync_reply(1234, 1, 2, 3);
        assert!(state.handle_packet(&other, source(50), Utc::now()).is_none());
        assert!(!state.time_sync.load(Ordering::SeqCst));
        assert!(state
            .handle_packet(&beacon([10, 0, 0, 9], 1), source(9), Utc::now())
            .is_none());
    }

    #[test]
    fn test_ignores_garbage() {
        let state = ListenerState::new(&DiscoveryOptions::default());
        assert!(state.handle_packet(b"\x01discover", source(3), Utc::now()).is_none());
        assert!(state.snapshot().is_empty());
    }
}
