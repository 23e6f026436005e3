//! Sensor sample buffers and the time-horizon synchronizer
//!
//! Sensors arrive asynchronously and with different latencies, while the core estimator runs once per
//! inertial sample on a delayed time horizon. This module decouples the two:
//!
//! - [`RingBuffer`] is a fixed-depth, index-addressed arena of timestamped samples. Pushing into a full
//!   buffer silently overwrites the oldest entry. The same arena backs the output predictor's history,
//!   which is why it exposes [`RingBuffer::apply_to_all`].
//! - [`SensorBuffers`] holds one ring per sensor kind, converts push time stamps into times of validity
//!   (push time minus the configured sensor delay) and hands out at most one aligned sample per kind
//!   and cycle through [`SensorBuffers::pop_aligned`].
//! - [`SampleInbox`] / [`SampleSender`] let driver threads hand samples to the single thread that owns
//!   the estimator. The owner drains the inbox without blocking at the start of each cycle.

use std::sync::mpsc::{self, Receiver, Sender};

use log::debug;

use crate::config::EstimatorConfig;
use crate::messages::{
    AirspeedSample, BaroSample, FlowSample, GnssSample, MagSample, RangeSample, SensorKind,
    SensorSample, Timestamped, VisionSample,
};

/// Fixed capacity FIFO of `Copy` samples.
///
/// Index `0` is always the oldest entry. Storage is allocated once at construction.
#[derive(Clone, Debug)]
pub struct RingBuffer<T> {
    slots: Vec<T>,
    head: usize,
    len: usize,
}
impl<T: Copy + Default> RingBuffer<T> {
    /// Create an empty buffer. A capacity of zero is raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        RingBuffer {
            slots: vec![T::default(); capacity.max(1)],
            head: 0,
            len: 0,
        }
    }
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }
    /// Append `item`; returns the overwritten oldest entry when the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let capacity = self.slots.len();
        if self.len == capacity {
            let dropped = self.slots[self.head];
            self.slots[self.head] = item;
            self.head = (self.head + 1) % capacity;
            Some(dropped)
        } else {
            let tail = (self.head + self.len) % capacity;
            self.slots[tail] = item;
            self.len += 1;
            None
        }
    }
    /// Remove and return the oldest entry.
    pub fn pop_oldest(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head];
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        Some(item)
    }
    pub fn get(&self, index: usize) -> Option<&T> {
        if index < self.len {
            Some(&self.slots[(self.head + index) % self.slots.len()])
        } else {
            None
        }
    }
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index < self.len {
            let capacity = self.slots.len();
            Some(&mut self.slots[(self.head + index) % capacity])
        } else {
            None
        }
    }
    pub fn oldest(&self) -> Option<&T> {
        self.get(0)
    }
    pub fn newest(&self) -> Option<&T> {
        self.len.checked_sub(1).and_then(|i| self.get(i))
    }
    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).map(move |i| &self.slots[(self.head + i) % self.slots.len()])
    }
    /// Apply `f` to every stored entry, oldest first.
    pub fn apply_to_all<F: FnMut(&mut T)>(&mut self, mut f: F) {
        let capacity = self.slots.len();
        for i in 0..self.len {
            f(&mut self.slots[(self.head + i) % capacity]);
        }
    }
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}
impl<T: Copy + Default + Timestamped> RingBuffer<T> {
    /// Remove and return the oldest entry if its time stamp is at or before `horizon_us`.
    pub fn pop_first_older_than(&mut self, horizon_us: u64) -> Option<T> {
        match self.oldest() {
            Some(item) if item.time_us() <= horizon_us => self.pop_oldest(),
            _ => None,
        }
    }
    /// Append a sample only if it does not go back in time relative to the newest entry.
    pub fn push_ordered(&mut self, item: T) -> bool {
        if self.newest().is_some_and(|newest| item.time_us() < newest.time_us()) {
            return false;
        }
        self.push(item);
        true
    }
}

/// Samples released by the synchronizer for one fusion instant.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlignedSamples {
    pub gnss: Option<GnssSample>,
    pub baro: Option<BaroSample>,
    pub mag: Option<MagSample>,
    pub range: Option<RangeSample>,
    pub flow: Option<FlowSample>,
    pub vision: Option<VisionSample>,
    pub airspeed: Option<AirspeedSample>,
}

/// One ring buffer per sensor kind plus the time-of-validity bookkeeping.
#[derive(Clone, Debug)]
pub struct SensorBuffers {
    pub gnss: RingBuffer<GnssSample>,
    pub baro: RingBuffer<BaroSample>,
    pub mag: RingBuffer<MagSample>,
    pub range: RingBuffer<RangeSample>,
    pub flow: RingBuffer<FlowSample>,
    pub vision: RingBuffer<VisionSample>,
    pub airspeed: RingBuffer<AirspeedSample>,
    delays_us: [u64; SensorKind::COUNT],
    /// Time of validity of the newest sample accepted per kind
    newest_us: [Option<u64>; SensorKind::COUNT],
}
impl SensorBuffers {
    pub fn new(config: &EstimatorConfig) -> Self {
        let depth = config.observation_buffer_length();
        let mut delays_us = [0u64; SensorKind::COUNT];
        for kind in SensorKind::ALL {
            delays_us[kind.index()] = config.delays.delay_us(kind);
        }
        SensorBuffers {
            gnss: RingBuffer::with_capacity(depth),
            baro: RingBuffer::with_capacity(depth),
            mag: RingBuffer::with_capacity(depth),
            range: RingBuffer::with_capacity(depth),
            flow: RingBuffer::with_capacity(depth),
            vision: RingBuffer::with_capacity(depth),
            airspeed: RingBuffer::with_capacity(depth),
            delays_us,
            newest_us: [None; SensorKind::COUNT],
        }
    }
    pub fn delay_us(&self, kind: SensorKind) -> u64 {
        self.delays_us[kind.index()]
    }
    /// Buffer a sample, converting its push time into its time of validity.
    ///
    /// Returns false when the sample goes back in time relative to the newest buffered sample of the
    /// same kind; such samples are dropped so that every channel stays FIFO in time.
    pub fn push(&mut self, sample: SensorSample) -> bool {
        let kind = sample.kind();
        let time_us = sample.time_us().saturating_sub(self.delay_us(kind));
        let accepted = match sample {
            SensorSample::Gnss(mut s) => {
                s.time_us = time_us;
                self.gnss.push_ordered(s)
            }
            SensorSample::Baro(mut s) => {
                s.time_us = time_us;
                self.baro.push_ordered(s)
            }
            SensorSample::Mag(mut s) => {
                s.time_us = time_us;
                self.mag.push_ordered(s)
            }
            SensorSample::Range(mut s) => {
                s.time_us = time_us;
                self.range.push_ordered(s)
            }
            SensorSample::Flow(mut s) => {
                s.time_us = time_us;
                self.flow.push_ordered(s)
            }
            SensorSample::Vision(mut s) => {
                s.time_us = time_us;
                self.vision.push_ordered(s)
            }
            SensorSample::Airspeed(mut s) => {
                s.time_us = time_us;
                self.airspeed.push_ordered(s)
            }
        };
        if accepted {
            self.newest_us[kind.index()] = Some(time_us);
        } else {
            debug!("dropped out-of-order {} sample at {} us", kind, time_us);
        }
        accepted
    }
    /// Pop at most one sample per kind whose time of validity is at or before `horizon_us`.
    pub fn pop_aligned(&mut self, horizon_us: u64) -> AlignedSamples {
        AlignedSamples {
            gnss: self.gnss.pop_first_older_than(horizon_us),
            baro: self.baro.pop_first_older_than(horizon_us),
            mag: self.mag.pop_first_older_than(horizon_us),
            range: self.range.pop_first_older_than(horizon_us),
            flow: self.flow.pop_first_older_than(horizon_us),
            vision: self.vision.pop_first_older_than(horizon_us),
            airspeed: self.airspeed.pop_first_older_than(horizon_us),
        }
    }
    /// Time of validity of the newest sample ever accepted for `kind`.
    pub fn newest_time_us(&self, kind: SensorKind) -> Option<u64> {
        self.newest_us[kind.index()]
    }
    /// Age of the newest sample of `kind` relative to `now_us`, in microseconds.
    pub fn age_us(&self, kind: SensorKind, now_us: u64) -> Option<u64> {
        self.newest_time_us(kind).map(|t| now_us.saturating_sub(t))
    }
    pub fn clear(&mut self) {
        self.gnss.clear();
        self.baro.clear();
        self.mag.clear();
        self.range.clear();
        self.flow.clear();
        self.vision.clear();
        self.airspeed.clear();
        self.newest_us = [None; SensorKind::COUNT];
    }
}

/// Cloneable handle a driver thread uses to hand samples to the estimator.
#[derive(Clone, Debug)]
pub struct SampleSender {
    tx: Sender<SensorSample>,
}
impl SampleSender {
    /// Send a sample; returns false if the estimator has been dropped.
    pub fn send(&self, sample: SensorSample) -> bool {
        self.tx.send(sample).is_ok()
    }
}

/// Receiving end owned by the estimator.
#[derive(Debug)]
pub struct SampleInbox {
    tx: Sender<SensorSample>,
    rx: Receiver<SensorSample>,
}
impl Default for SampleInbox {
    fn default() -> Self {
        let (tx, rx) = mpsc::channel();
        SampleInbox { tx, rx }
    }
}
impl SampleInbox {
    pub fn sender(&self) -> SampleSender {
        SampleSender {
            tx: self.tx.clone(),
        }
    }
    /// Take every sample currently queued without blocking.
    pub fn drain(&self) -> Vec<SensorSample> {
        self.rx.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ImuSample;

    fn baro(time_us: u64, height: f64) -> BaroSample {
        BaroSample { time_us, height }
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut buffer = RingBuffer::with_capacity(3);
        for i in 0..5u64 {
            buffer.push(baro(i, i as f64));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.oldest().map(|s| s.time_us), Some(2));
        assert_eq!(buffer.newest().map(|s| s.time_us), Some(4));
        let times: Vec<u64> = buffer.iter().map(|s| s.time_us).collect();
        assert_eq!(times, vec![2, 3, 4]);
    }
    #[test]
    fn pop_is_fifo_and_respects_horizon() {
        let mut buffer = RingBuffer::with_capacity(4);
        buffer.push(baro(100, 1.0));
        buffer.push(baro(200, 2.0));
        buffer.push(baro(300, 3.0));
        assert!(buffer.pop_first_older_than(50).is_none());
        assert_eq!(buffer.pop_first_older_than(250).map(|s| s.time_us), Some(100));
        assert_eq!(buffer.pop_first_older_than(250).map(|s| s.time_us), Some(200));
        assert!(buffer.pop_first_older_than(250).is_none());
        assert_eq!(buffer.len(), 1);
    }
    #[test]
    fn apply_to_all_visits_every_entry() {
        let mut buffer = RingBuffer::with_capacity(3);
        for i in 0..4u64 {
            buffer.push(baro(i, 0.0));
        }
        buffer.apply_to_all(|s| s.height += 1.5);
        assert!(buffer.iter().all(|s| s.height == 1.5));
        assert_eq!(buffer.get(2).map(|s| s.time_us), Some(3));
        assert!(buffer.get(3).is_none());
    }
    #[test]
    fn out_of_order_is_rejected() {
        let mut buffer = RingBuffer::with_capacity(3);
        assert!(buffer.push_ordered(baro(10, 0.0)));
        assert!(!buffer.push_ordered(baro(5, 0.0)));
        assert!(buffer.push_ordered(baro(10, 0.0)));
        assert_eq!(buffer.len(), 2);
    }
    #[test]
    fn imu_ring_reports_full() {
        let mut buffer: RingBuffer<ImuSample> = RingBuffer::with_capacity(2);
        assert!(!buffer.is_full());
        buffer.push(ImuSample::default());
        buffer.push(ImuSample::default());
        assert!(buffer.is_full());
        buffer.clear();
        assert!(buffer.is_empty());
    }
    #[test]
    fn sensor_buffers_apply_delay() {
        let mut config = EstimatorConfig::default();
        config.delays.gnss_ms = 100.0;
        let mut buffers = SensorBuffers::new(&config);
        let sample = GnssSample {
            time_us: 1_000_000,
            ..Default::default()
        };
        assert!(buffers.push(SensorSample::Gnss(sample)));
        assert_eq!(buffers.newest_time_us(SensorKind::Gnss), Some(900_000));
        assert!(buffers.pop_aligned(899_999).gnss.is_none());
        let aligned = buffers.pop_aligned(900_000);
        assert_eq!(aligned.gnss.map(|s| s.time_us), Some(900_000));
        assert_eq!(buffers.age_us(SensorKind::Gnss, 1_000_000), Some(100_000));
        assert!(buffers.age_us(SensorKind::Barometer, 1_000_000).is_none());
    }
    #[test]
    fn inbox_crosses_threads() {
        let inbox = SampleInbox::default();
        let sender = inbox.sender();
        let handle = std::thread::spawn(move || {
            for i in 0..10u64 {
                sender.send(SensorSample::Baro(baro(i, 0.0)));
            }
        });
        handle.join().unwrap();
        let samples = inbox.drain();
        assert_eq!(samples.len(), 10);
        assert_eq!(samples[9].time_us(), 9);
        assert!(inbox.drain().is_empty());
    }
}
