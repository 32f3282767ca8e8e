//! Data acquisition: a software-timed one-shot sampler and a
//! hardware-timed continuous sampler feeding a DMA ring buffer.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::{Error, Result};
use crate::chips::adc;
use crate::run::{Run, RunDataHandler};
use crate::sys::{Driver, Pin};

/// Ring capacity in 32-bit words. The hardware enforces wrap-around through
/// the destination-address modulo, so the buffer must be a power of two and
/// aligned to its byte size.
pub const BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Overflow,
    DmaError,
    ShifterError,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Overflow => write!(f, "ring buffer overflow"),
            Self::DmaError => write!(f, "DMA channel error"),
            Self::ShifterError => write!(f, "SPI shifter error"),
        }
    }
}

bitflags! {
    /// Faults latched by the sampling engine, read once at finalize.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HwFault: u8 {
        const DMA_ERROR     = 1 << 0;
        const SHIFTER_ERROR = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaqConfig {
    /// 0 disables acquisition; otherwise one of 1, 2, 4, 8.
    pub num_channels: usize,
    /// Must divide the 1 MHz base clock evenly.
    pub sample_rate: u32,
}

impl Default for DaqConfig {
    fn default() -> Self {
        DaqConfig { num_channels: 0, sample_rate: 500_000 }
    }
}

impl DaqConfig {
    pub fn is_active(&self) -> bool {
        self.num_channels > 0
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.num_channels, 0 | 1 | 2 | 4 | 8)
            && self.sample_rate > 0
            && self.sample_rate <= 1_000_000
            && 1_000_000 % self.sample_rate == 0
    }
}

/// The DMA destination ring plus the flags the transfer-complete interrupts
/// raise. The engine half fills it; the streamer in the main loop drains it.
/// Flags are only cleared after the corresponding half has been consumed;
/// raising an already-raised flag records an overflow.
#[repr(align(1024))]
pub struct Ring {
    words: [AtomicU32; BUFFER_SIZE],
    num_channels: usize,
    filled: AtomicUsize,
    first_data: AtomicBool,
    last_data: AtomicBool,
    overflow: AtomicBool,
}

impl Ring {
    pub fn new(num_channels: usize) -> Arc<Ring> {
        assert!(num_channels > 0 && BUFFER_SIZE / 2 % num_channels == 0);
        Arc::new(Ring {
            words: std::array::from_fn(|_| AtomicU32::new(0)),
            num_channels,
            filled: AtomicUsize::new(0),
            first_data: AtomicBool::new(false),
            last_data: AtomicBool::new(false),
            overflow: AtomicBool::new(false),
        })
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Engine side: deposit one word and raise the half/complete flag when
    /// a buffer half fills up.
    pub fn push(&self, word: u32) {
        let filled = self.filled.load(Ordering::Relaxed);
        self.words[filled % BUFFER_SIZE].store(word, Ordering::Relaxed);
        let filled = filled + 1;
        self.filled.store(filled, Ordering::Release);
        if filled % BUFFER_SIZE == BUFFER_SIZE / 2 {
            if self.first_data.swap(true, Ordering::AcqRel) {
                self.overflow.store(true, Ordering::Release);
            }
        } else if filled % BUFFER_SIZE == 0 {
            if self.last_data.swap(true, Ordering::AcqRel) {
                self.overflow.store(true, Ordering::Release);
            }
        }
    }

    pub fn push_vector(&self, samples: &[u16]) {
        debug_assert_eq!(samples.len(), self.num_channels);
        for &sample in samples {
            self.push(sample as u32);
        }
    }

    pub fn take_first_data(&self) -> bool {
        self.first_data.swap(false, Ordering::AcqRel)
    }

    pub fn take_last_data(&self) -> bool {
        self.last_data.swap(false, Ordering::AcqRel)
    }

    pub fn overflow(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    pub fn word(&self, index: usize) -> u32 {
        self.words[index % BUFFER_SIZE].load(Ordering::Acquire)
    }

    /// Sample vectors deposited in the current buffer cycle. Mirrors the
    /// DMA's iteration counters and resets every time the buffer wraps.
    pub fn vectors_in_buffer(&self) -> usize {
        let filled = self.filled.load(Ordering::Acquire);
        (filled / self.num_channels) % (BUFFER_SIZE / self.num_channels)
    }

    pub fn reset(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
        self.filled.store(0, Ordering::Relaxed);
        self.first_data.store(false, Ordering::Relaxed);
        self.last_data.store(false, Ordering::Relaxed);
        self.overflow.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ring")
            .field("num_channels", &self.num_channels)
            .field("filled", &self.filled.load(Ordering::Relaxed))
            .field("overflow", &self.overflow())
            .finish()
    }
}

/// Software-timed bit-bang sampler: conversion start pulse, then fourteen
/// clock pulses with all channel data lines read in parallel. Used for
/// calibration and low-rate status readings.
#[derive(Debug, Default)]
pub struct OneshotDaq;

impl OneshotDaq {
    pub fn new() -> OneshotDaq {
        OneshotDaq
    }

    pub fn init(&mut self, driver: &mut dyn Driver) -> Result<()> {
        driver.pin_write(Pin::Cnvst, false)?;
        driver.pin_write(Pin::AdcClk, false)?;
        Ok(())
    }

    pub fn sample_raw(&mut self, driver: &mut dyn Driver) -> Result<[u16; adc::NUM_CHANNELS]> {
        driver.pin_write(Pin::Cnvst, true)?;
        driver.delay_ns(1500);
        driver.pin_write(Pin::Cnvst, false)?;
        driver.delay_ns(1000);

        let mut data = [0u16; adc::NUM_CHANNELS];
        for clk in 0..14 {
            driver.pin_write(Pin::AdcClk, true)?;
            driver.delay_ns(100);
            // Data is valid after the rising edge; MSB first.
            for (channel, word) in data.iter_mut().enumerate() {
                if driver.pin_read(Pin::AdcMiso(channel as u8))? {
                    *word |= 1 << (13 - clk);
                }
            }
            driver.delay_ns(100);
            driver.pin_write(Pin::AdcClk, false)?;
            driver.delay_ns(350);
        }
        Ok(data)
    }

    pub fn sample(&mut self, driver: &mut dyn Driver) -> Result<[f32; adc::NUM_CHANNELS]> {
        Ok(self.sample_raw(driver)?.map(adc::raw_to_float))
    }

    pub fn sample_channel(&mut self, driver: &mut dyn Driver, channel: usize) -> Result<f32> {
        Ok(self.sample(driver)?[channel])
    }

    pub fn sample_avg(&mut self, driver: &mut dyn Driver, samples: usize, delay_us: u32)
            -> Result<[f32; adc::NUM_CHANNELS]> {
        let mut sums = [0.0f32; adc::NUM_CHANNELS];
        for _ in 0..samples {
            for (sum, value) in sums.iter_mut().zip(self.sample(driver)?) {
                *sum += value;
            }
            driver.delay_ns(delay_us.saturating_mul(1000));
        }
        Ok(sums.map(|sum| sum / samples as f32))
    }
}

/// Streams completed ring halves out to a data handler and flushes the
/// unaligned tail once acquisition has stopped.
pub struct ContinuousDaq {
    config: DaqConfig,
    ring: Arc<Ring>,
    /// Word offset of the half that may hold partial data after OP ends:
    /// always the half the engine is currently filling.
    partial_start: usize,
}

impl ContinuousDaq {
    pub fn init(driver: &mut dyn Driver, config: DaqConfig) -> Result<ContinuousDaq> {
        if !config.is_valid() {
            return Err(Error::Config(format!(
                "invalid DAQ config: {} channels at {} Hz", config.num_channels, config.sample_rate)));
        }
        let ring = Ring::new(config.num_channels.max(1));
        driver.daq_reset()?;
        if config.is_active() {
            driver.daq_init(config, ring.clone())?;
        }
        Ok(ContinuousDaq { config, ring, partial_start: 0 })
    }

    pub fn enable(&mut self, driver: &mut dyn Driver) -> Result<()> {
        if self.config.is_active() {
            driver.daq_enable()?;
        }
        Ok(())
    }

    /// Publish any completed half to the handler. With `partial` set, also
    /// flush the remaining unaligned samples; this must happen exactly once,
    /// after acquisition has stopped.
    pub fn stream(&mut self, partial: bool, run: &Run, handler: &mut dyn RunDataHandler)
            -> Result<()> {
        if !self.config.is_active() {
            return Ok(());
        }
        if self.ring.overflow() {
            return Err(Error::Daq(Fault::Overflow));
        }

        let half_words = BUFFER_SIZE / 2;
        let half_vectors = half_words / self.config.num_channels;
        let (start, vectors);
        if self.ring.take_first_data() {
            start = 0;
            vectors = half_vectors;
            self.partial_start = half_words;
        } else if self.ring.take_last_data() {
            start = half_words;
            vectors = half_vectors;
            self.partial_start = 0;
        } else if partial {
            start = self.partial_start;
            // The vector counter resets on wrap-around, so it counts only
            // the partial vectors when they sit in the first half, and the
            // full first half plus the partials when they sit in the second.
            let in_buffer = self.ring.vectors_in_buffer();
            vectors = if start == 0 { in_buffer } else { in_buffer.saturating_sub(half_vectors) };
            if vectors == 0 {
                return Ok(());
            }
        } else {
            return Ok(());
        }

        let mut data = Vec::with_capacity(vectors * self.config.num_channels);
        for word_idx in 0..vectors * self.config.num_channels {
            let raw = self.ring.word(start + word_idx) as u16;
            data.push(adc::raw_to_float(raw));
        }
        handler.handle(&data, self.config.num_channels, run);
        Ok(())
    }

    /// Assert the acquisition finished cleanly: no DMA error, no shifter
    /// error, no ring overflow.
    pub fn finalize(&mut self, driver: &mut dyn Driver) -> Result<()> {
        if !self.config.is_active() {
            return Ok(());
        }
        let hw_fault = driver.daq_fault();
        if hw_fault.contains(HwFault::DMA_ERROR) {
            return Err(Error::Daq(Fault::DmaError));
        }
        if hw_fault.contains(HwFault::SHIFTER_ERROR) {
            return Err(Error::Daq(Fault::ShifterError));
        }
        if self.ring.overflow() {
            return Err(Error::Daq(Fault::Overflow));
        }
        Ok(())
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::run::RunConfig;

    struct Collector {
        vectors: Vec<Vec<f32>>,
    }

    impl RunDataHandler for Collector {
        fn prepare(&mut self, _run: &Run) {}

        fn handle(&mut self, data: &[f32], channels: usize, _run: &Run) {
            for vector in data.chunks(channels) {
                self.vectors.push(vector.to_vec());
            }
        }
    }

    fn test_run(num_channels: usize) -> Run {
        Run::new("test".into(), RunConfig::default(),
            DaqConfig { num_channels, sample_rate: 100_000 })
    }

    #[test]
    fn test_ring_advances_in_vector_units() {
        let ring = Ring::new(4);
        assert_eq!(ring.vectors_in_buffer(), 0);
        ring.push_vector(&[1, 2, 3, 4]);
        assert_eq!(ring.vectors_in_buffer(), 1);
        for _ in 0..BUFFER_SIZE / 4 - 1 {
            ring.push_vector(&[0; 4]);
        }
        // Wraps exactly at the buffer size.
        assert_eq!(ring.vectors_in_buffer(), 0);
    }

    #[test]
    fn test_ring_flag_sequence() {
        let ring = Ring::new(1);
        for _ in 0..BUFFER_SIZE / 2 {
            ring.push(0);
        }
        assert!(ring.take_first_data());
        assert!(!ring.take_first_data());
        for _ in 0..BUFFER_SIZE / 2 {
            ring.push(0);
        }
        assert!(ring.take_last_data());
        assert!(!ring.overflow());
    }

    #[test]
    fn test_ring_overflow_on_missed_half() {
        let ring = Ring::new(1);
        for _ in 0..BUFFER_SIZE + BUFFER_SIZE / 2 {
            ring.push(0);
        }
        // first_data raised again before it was consumed.
        assert!(ring.overflow());
    }

    #[test]
    fn test_daq_config_validation() {
        assert!(DaqConfig { num_channels: 1, sample_rate: 1_000_000 }.is_valid());
        assert!(DaqConfig { num_channels: 8, sample_rate: 125_000 }.is_valid());
        assert!(DaqConfig { num_channels: 0, sample_rate: 500_000 }.is_valid());
        assert!(!DaqConfig { num_channels: 3, sample_rate: 500_000 }.is_valid());
        assert!(!DaqConfig { num_channels: 1, sample_rate: 300_000 }.is_valid());
        assert!(!DaqConfig { num_channels: 1, sample_rate: 0 }.is_valid());
    }

    #[test]
    fn test_stream_half_then_partial() {
        let mut driver = crate::sys::mock::MockDriver::new();
        let config = DaqConfig { num_channels: 2, sample_rate: 100_000 };
        let mut daq = ContinuousDaq::init(&mut driver, config).unwrap();
        let run = test_run(2);
        let mut collector = Collector { vectors: Vec::new() };

        // Nothing to stream yet.
        daq.stream(false, &run, &mut collector).unwrap();
        assert!(collector.vectors.is_empty());

        // Fill the first half: one half worth of vectors appears.
        let zero = adc::float_to_raw(0.0);
        for _ in 0..BUFFER_SIZE / 2 / 2 {
            daq.ring().push_vector(&[zero, zero]);
        }
        daq.stream(false, &run, &mut collector).unwrap();
        assert_eq!(collector.vectors.len(), BUFFER_SIZE / 2 / 2);

        // A few more vectors land in the second half; the partial flush
        // picks up exactly those.
        for _ in 0..5 {
            daq.ring().push_vector(&[zero, zero]);
        }
        daq.stream(true, &run, &mut collector).unwrap();
        assert_eq!(collector.vectors.len(), BUFFER_SIZE / 2 / 2 + 5);
    }

    #[test]
    fn test_stream_detects_overflow() {
        let mut driver = crate::sys::mock::MockDriver::new();
        let config = DaqConfig { num_channels: 1, sample_rate: 100_000 };
        let mut daq = ContinuousDaq::init(&mut driver, config).unwrap();
        let run = test_run(1);
        let mut collector = Collector { vectors: Vec::new() };

        for _ in 0..BUFFER_SIZE + BUFFER_SIZE / 2 {
            daq.ring().push(0);
        }
        assert!(matches!(daq.stream(false, &run, &mut collector),
            Err(Error::Daq(Fault::Overflow))));
        assert!(collector.vectors.is_empty());
    }
}
