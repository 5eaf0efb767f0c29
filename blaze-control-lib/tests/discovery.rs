use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

use blaze_control_lib::codec::beacon::{decode_time_sync, BEACON_PACKET, TIMESYNC_PACKET};
use blaze_control_lib::util::discovery::{DiscoveryListener, DiscoveryOptions};

fn beacon(ip: [u8; 4], device_time: u32) -> Vec<u8> {
    let mut bytes = BEACON_PACKET.to_le_bytes().to_vec();
    bytes.extend_from_slice(&ip);
    bytes.extend_from_slice(&device_time.to_le_bytes());
    bytes
}

fn loopback_options() -> DiscoveryOptions {
    DiscoveryOptions::default()
        .with_bind_address(SocketAddr::from(([127, 0, 0, 1], 0)))
        .with_sweep_interval(Duration::from_millis(50))
}

async fn wait_for_devices(listener: &DiscoveryListener, count: usize) {
    for _ in 0..40 {
        if listener.list().len() == count {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("expected {} devices, have {:?}", count, listener.list());
}

#[tokio::test]
async fn test_beacon_is_listed_and_answered() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut listener = DiscoveryListener::start(loopback_options().with_time_sync(true))
        .await
        .unwrap();

    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    device
        .send_to(&beacon([192, 168, 1, 40], 123_456), listener.local_addr())
        .await
        .unwrap();

    let mut buffer = [0u8; 64];
    let (length, _) = timeout(Duration::from_secs(2), device.recv_from(&mut buffer))
        .await
        .unwrap()
        .unwrap();
    let reply = decode_time_sync(&buffer[..length]).unwrap();
    assert_eq!(reply.sender_time, 123_456);
    assert_eq!(reply.sender_id, u32::from_le_bytes([192, 168, 1, 40]));

    wait_for_devices(&listener, 1).await;
    let devices = listener.list();
    assert_eq!(devices[0].ip_address, Ipv4Addr::new(192, 168, 1, 40));
    assert_eq!(devices[0].address, device.local_addr().unwrap());

    listener.stop().await;
    assert!(!listener.is_running());
}

#[tokio::test]
async fn test_silent_device_is_evicted() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut listener = DiscoveryListener::start(
        loopback_options().with_device_timeout(Duration::from_millis(200)),
    )
    .await
    .unwrap();

    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    device
        .send_to(&beacon([10, 0, 0, 7], 1), listener.local_addr())
        .await
        .unwrap();
    wait_for_devices(&listener, 1).await;

    sleep(Duration::from_millis(400)).await;
    assert!(listener.list().is_empty());

    listener.stop().await;
}

#[tokio::test]
async fn test_other_time_source_disables_time_sync() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut listener = DiscoveryListener::start(loopback_options().with_time_sync(true))
        .await
        .unwrap();
    assert!(listener.is_time_sync_enabled());

    let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut packet = TIMESYNC_PACKET.to_le_bytes().to_vec();
    packet.extend_from_slice(&[0u8; 16]);
    other.send_to(&packet, listener.local_addr()).await.unwrap();

    for _ in 0..40 {
        if !listener.is_time_sync_enabled() {
            break;
        }
        sleep(Duration::from_millis(25)).await;
    }
    assert!(!listener.is_time_sync_enabled());

    listener.stop().await;
}
