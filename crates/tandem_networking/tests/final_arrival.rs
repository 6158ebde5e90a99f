//! Exactly one barrier arrival leaves a client after `stop` trips its exit
//! latch, however `sync` and `stop` interleave.

mod common;

use common::{directory, publish_fake, wait_until, MockConnector, DEADLINE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tandem_networking::BarrierClient;

const SERVICE: &str = "FRAMES_BARRIER/tandem";

fn run_once(delay: Duration, syncing: bool) -> usize {
    let directory = directory();
    publish_fake(&directory, SERVICE, 7001);
    let connector = Arc::new(MockConnector::default());
    let client = Arc::new(BarrierClient::new("mock", connector.clone()));
    connector.watch(client.exit_handle());
    client.init(directory);
    client.set_service_name(SERVICE);
    client.start().unwrap();

    assert!(wait_until(DEADLINE, || client.check_connection()));
    assert!(client.request_activation());

    let looping = Arc::clone(&client);
    let exit = client.exit_handle();
    let syncer = thread::spawn(move || {
        let mut rounds = 0_u64;
        while syncing && !exit.is_tripped() {
            looping.sync();
            rounds += 1;
        }
        rounds
    });

    thread::sleep(delay);
    client.stop();
    syncer.join().unwrap();
    connector.arrivals_after_exit.load(Ordering::Acquire)
}

#[test]
fn test_stop_without_sync_sends_one_final_arrival() {
    assert_eq!(run_once(Duration::from_millis(5), false), 1);
}

#[test]
fn test_random_interleavings_send_one_final_arrival() {
    let mut rng = StdRng::seed_from_u64(0x7a4d_e11);
    for _ in 0..20 {
        let delay = Duration::from_micros(rng.gen_range(0..3_000));
        assert_eq!(run_once(delay, true), 1, "delay {delay:?}");
    }
}

#[test]
fn test_stop_during_unanswered_activation_returns() {
    let directory = directory();
    publish_fake(&directory, SERVICE, 7002);
    let connector = Arc::new(MockConnector {
        ignore_handshakes: true,
        ..MockConnector::default()
    });
    let client = Arc::new(BarrierClient::new("mock", connector.clone()));
    connector.watch(client.exit_handle());
    client.init(directory);
    client.set_service_name(SERVICE);
    client.start().unwrap();
    assert!(wait_until(DEADLINE, || client.check_connection()));

    let requester = Arc::clone(&client);
    let activating = thread::spawn(move || requester.request_activation());
    thread::sleep(Duration::from_millis(50));
    assert!(!activating.is_finished());

    let started = Instant::now();
    client.stop();
    assert!(activating.join().unwrap());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(client.check_activation());
    assert_eq!(connector.arrivals_after_exit.load(Ordering::Acquire), 1);
}
