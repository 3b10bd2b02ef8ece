//! Admission control for the processing stage.
//!
//! Wraps a Tokio semaphore to bound how many units are in `Processing` at
//! once. Tokio's semaphore queues waiters fairly, so admission is FIFO among
//! units waiting for a slot.
//!
//! Every permit also carries a slot index in `0..capacity` that no other
//! live permit holds. When devices (GPU ids) are configured, slot `i` runs
//! on device `devices[i % devices.len()]`, so two units never share a
//! device unless there are fewer devices than slots.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of concurrently processing units.
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

/// Why a unit was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("No processing slot became free within {0:?}")]
    Timeout(Duration),

    #[error("Admission control is closed")]
    Closed,
}

#[derive(Debug)]
struct Counters {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Bounded pool of processing slots, shared by every unit of a run.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<Counters>,
    free_slots: Arc<Mutex<BTreeSet<usize>>>,
    devices: Arc<[u32]>,
}

impl Default for AdmissionControl {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

impl AdmissionControl {
    /// Creates admission control with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(Counters {
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }),
            free_slots: Arc::new(Mutex::new((0..capacity).collect())),
            devices: Arc::from(Vec::new()),
        }
    }

    /// Assigns devices to slots round-robin.
    pub fn with_devices(mut self, devices: Vec<u32>) -> Self {
        self.devices = Arc::from(devices);
        self
    }

    pub fn devices(&self) -> &[u32] {
        &self.devices
    }

    /// Waits for a slot, giving up after `timeout` when one is set.
    pub async fn admit(&self, timeout: Option<Duration>) -> Result<AdmissionPermit, AdmissionError> {
        let acquire = self.semaphore.clone().acquire_owned();
        let permit = match timeout {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| AdmissionError::Timeout(limit))?,
            None => acquire.await,
        }
        .map_err(|_| AdmissionError::Closed)?;

        let current = self.counters.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters
            .peak_in_flight
            .fetch_max(current, Ordering::Relaxed);

        // Each available semaphore permit is matched by one free slot.
        let slot = self.free_slots.lock().pop_first().unwrap_or_default();
        let device = (!self.devices.is_empty()).then(|| self.devices[slot % self.devices.len()]);

        Ok(AdmissionPermit {
            slot,
            device,
            free_slots: Arc::clone(&self.free_slots),
            counters: Arc::clone(&self.counters),
            _permit: permit,
        })
    }

    /// Rejects every current and future waiter.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::Relaxed)
    }

    /// Highest number of simultaneously admitted units observed.
    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::Relaxed)
    }
}

/// A processing slot. Released when dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    slot: usize,
    device: Option<u32>,
    free_slots: Arc<Mutex<BTreeSet<usize>>>,
    counters: Arc<Counters>,
    _permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    /// Slot index, unique among live permits.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Device assigned to this slot, if devices are configured.
    pub fn device(&self) -> Option<u32> {
        self.device
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        // The slot goes back before the semaphore permit (a later field).
        self.free_slots.lock().insert(self.slot);
        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admit_counts_in_flight() {
        let admission = AdmissionControl::new(2);
        let a = admission.admit(None).await.unwrap();
        let _b = admission.admit(None).await.unwrap();
        assert_eq!(admission.in_flight(), 2);
        assert_eq!(admission.available(), 0);

        drop(a);
        assert_eq!(admission.in_flight(), 1);
        assert_eq!(admission.available(), 1);
        assert_eq!(admission.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_admit_times_out_when_full() {
        let admission = AdmissionControl::new(1);
        let _held = admission.admit(None).await.unwrap();

        let err = admission
            .admit(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::Timeout(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_slots_are_unique_and_reused() {
        let admission = AdmissionControl::new(3);
        let a = admission.admit(None).await.unwrap();
        let b = admission.admit(None).await.unwrap();
        let c = admission.admit(None).await.unwrap();
        assert_eq!([a.slot(), b.slot(), c.slot()], [0, 1, 2]);
        assert_eq!(a.device(), None);

        drop(b);
        let d = admission.admit(None).await.unwrap();
        assert_eq!(d.slot(), 1);
    }

    #[tokio::test]
    async fn test_devices_follow_slots() {
        let admission = AdmissionControl::new(3).with_devices(vec![4, 7]);
        let a = admission.admit(None).await.unwrap();
        let b = admission.admit(None).await.unwrap();
        let c = admission.admit(None).await.unwrap();
        assert_eq!(a.device(), Some(4));
        assert_eq!(b.device(), Some(7));
        // Fewer devices than slots wraps around.
        assert_eq!(c.device(), Some(4));

        drop(b);
        let d = admission.admit(None).await.unwrap();
        assert_eq!(d.device(), Some(7));
    }

    #[tokio::test]
    async fn test_zero_capacity_is_clamped() {
        assert_eq!(AdmissionControl::new(0).capacity(), 1);
    }

    #[tokio::test]
    async fn test_close_rejects_waiters() {
        let admission = AdmissionControl::new(1);
        let _held = admission.admit(None).await.unwrap();
        admission.close();
        assert_eq!(admission.admit(None).await.unwrap_err(), AdmissionError::Closed);
    }

    #[tokio::test]
    async fn test_fifo_admission() {
        let admission = AdmissionControl::new(1);
        let held = admission.admit(None).await.unwrap();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..3 {
            let admission = admission.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _permit = admission.admit(None).await.unwrap();
                order.lock().push(i);
            }));
            // Let each waiter enqueue before the next one.
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
