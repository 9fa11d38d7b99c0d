//! Tests for machine leases.

use std::sync::atomic::{AtomicUsize, Ordering};

use rstest::rstest;

use super::*;
use crate::test_support::{FakePower, FakeProbe};

const ADDRESS: &str = "192.168.1.105";

fn managed(power: &FakePower, probe: &FakeProbe) -> Machine {
    Machine::new("proxmox", Arc::new(probe.clone())).with_power(Arc::new(power.clone()))
}

#[tokio::test]
async fn unmanaged_machine_never_touches_power_or_probe() {
    let probe = FakeProbe::fixed(false);
    let machine = Machine::new("mac-mini", Arc::new(probe.clone()));

    let lease = machine.acquire(ADDRESS).await.expect("acquire");
    assert!(!lease.is_owning());
    assert!(machine.is_leased());
    lease.release().await.expect("release");

    assert!(!machine.is_leased());
    assert_eq!(probe.probe_count(), 0);
}

#[tokio::test]
async fn running_guest_is_left_running_on_release() {
    let power = FakePower::new(PowerState::Running);
    let probe = FakeProbe::following(&power);
    let machine = managed(&power, &probe);

    let lease = machine.acquire(ADDRESS).await.expect("acquire");
    assert!(!lease.is_owning());
    lease.release().await.expect("release");

    assert_eq!(power.start_count(), 0);
    assert_eq!(power.stop_count(), 0);
    assert_eq!(power.state(), PowerState::Running);
}

#[tokio::test]
async fn stopped_guest_is_started_and_stopped_again() {
    let power = FakePower::new(PowerState::Stopped);
    let probe = FakeProbe::following(&power);
    let machine = managed(&power, &probe);

    let lease = machine.acquire(ADDRESS).await.expect("acquire");
    assert!(lease.is_owning());
    assert_eq!(power.state(), PowerState::Running);
    lease.release().await.expect("release");

    assert_eq!(power.start_count(), 1);
    assert_eq!(power.stop_count(), 1);
    assert_eq!(power.state(), PowerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn acquire_polls_until_reachable() {
    let power = FakePower::new(PowerState::Stopped);
    let probe = FakeProbe::following(&power).scripted([false, false, false]);
    let machine = managed(&power, &probe).with_poll_interval(Duration::from_secs(10));
    let started = Instant::now();

    let lease = machine.acquire(ADDRESS).await.expect("acquire");

    assert_eq!(probe.probe_count(), 4);
    assert!(started.elapsed() >= Duration::from_secs(30));
    drop(lease);
}

#[tokio::test(start_paused = true)]
async fn release_waits_until_guest_is_unreachable() {
    let power = FakePower::new(PowerState::Stopped);
    let probe = FakeProbe::following(&power).scripted([true, true, true]);
    let machine = managed(&power, &probe);
    let lease = machine.acquire(ADDRESS).await.expect("acquire");
    let started = Instant::now();

    lease.release().await.expect("release");

    assert_eq!(probe.probe_count(), 4);
    assert!(started.elapsed() >= Duration::from_secs(20));
    assert!(!machine.is_leased());
}

#[rstest]
#[case(Duration::from_secs(30))]
#[case(Duration::from_secs(1))]
#[tokio::test(start_paused = true)]
async fn reachability_timeout_yields_unavailable_and_frees_lock(#[case] limit: Duration) {
    let power = FakePower::new(PowerState::Stopped);
    let probe = FakeProbe::fixed(false);
    let machine = managed(&power, &probe).with_reachability_timeout(Some(limit));

    let err = machine
        .acquire(ADDRESS)
        .await
        .expect_err("never reachable");

    assert!(matches!(
        err,
        LeaseError::Unavailable { ref address, ref wanted, .. }
            if address == ADDRESS && wanted == "reachable"
    ));
    assert!(!machine.is_leased());
    assert_eq!(power.stop_count(), 1, "the lease started the guest, so it stops it");
}

#[tokio::test]
async fn power_failure_frees_lock() {
    let power = FakePower::new(PowerState::Stopped).failing_start();
    let probe = FakeProbe::following(&power);
    let machine = managed(&power, &probe);

    let err = machine.acquire(ADDRESS).await.expect_err("start fails");

    assert!(matches!(err, LeaseError::Power { machine: ref name, .. } if name == "proxmox"));
    assert!(!machine.is_leased());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_are_exclusive() {
    let machine = Arc::new(Machine::new("shared", Arc::new(FakeProbe::fixed(true))));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for index in 0..8 {
        let task_machine = Arc::clone(&machine);
        let task_active = Arc::clone(&active);
        let task_peak = Arc::clone(&peak);
        let task_completed = Arc::clone(&completed);
        handles.push(tokio::spawn(async move {
            let address = format!("10.0.0.{index}");
            let lease = task_machine.acquire(&address).await.expect("acquire");
            let now = task_active.fetch_add(1, Ordering::SeqCst) + 1;
            task_peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            task_active.fetch_sub(1, Ordering::SeqCst);
            lease.release().await.expect("release");
            task_completed.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for handle in handles {
        handle.await.expect("task");
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(completed.load(Ordering::SeqCst), 8);
}

#[derive(Debug, thiserror::Error)]
enum BodyError {
    #[error("lease: {0}")]
    Lease(#[from] LeaseError),
    #[error("body failed")]
    Failed,
}

#[tokio::test]
async fn with_lease_releases_when_body_fails() {
    let power = FakePower::new(PowerState::Stopped);
    let probe = FakeProbe::following(&power);
    let machine = managed(&power, &probe);

    let result: Result<(), BodyError> = machine
        .with_lease(ADDRESS, || async { Err(BodyError::Failed) })
        .await;

    assert!(matches!(result, Err(BodyError::Failed)));
    assert_eq!(power.stop_count(), 1);
    assert!(!machine.is_leased());
}

#[tokio::test]
async fn with_lease_returns_body_value() {
    let machine = Machine::new("mac-mini", Arc::new(FakeProbe::fixed(true)));

    let value: Result<u32, BodyError> = machine.with_lease(ADDRESS, || async { Ok(7) }).await;

    assert_eq!(value.ok(), Some(7));
}
