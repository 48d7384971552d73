//! Adaptive streaming throttle.
//!
//! Turns a continuously sampled multi-axis signal into rate-limited,
//! change-thresholded datagrams. A sample is only considered once
//! `min_interval` has passed since the last send, and an axis is only
//! included when it moved more than `change_threshold` away from the value
//! last *sent* for it (not the last sampled one), so slow drifts still get
//! through eventually.

use std::time::Instant;

use arrayvec::ArrayVec;
use tracing::trace;

use crate::config::{StreamConfig, StreamMode};
use crate::error::ClientError;
use crate::session::ClientSession;
use crate::types::{Command, Params, Value};

pub const MAX_AXES: usize = 8;

pub const SET_PARAMETER_COMMAND: &str = "set_device_parameter";
pub const BATCH_SET_PARAMETERS_COMMAND: &str = "batch_set_device_parameters";

/// Anything that can push one command out as a datagram.
pub trait DatagramSink {
    /// Returns whether the datagram was handed to the network.
    fn send_datagram(&self, command: &Command) -> bool;
}

impl DatagramSink for ClientSession {
    fn send_datagram(&self, command: &Command) -> bool {
        self.send_stream(command)
    }
}

impl<S: DatagramSink + ?Sized> DatagramSink for &S {
    fn send_datagram(&self, command: &Command) -> bool {
        (**self).send_datagram(command)
    }
}

/// Map a raw coordinate in `0..=extent` to `[0, 1]`.
///
/// `invert` flips the result, for screen Y axes that grow downwards.
/// A non-positive extent maps everything to 0.
pub fn normalize(raw: f64, extent: f64, invert: bool) -> f64 {
    if extent.is_nan() || extent <= 0.0 || !raw.is_finite() {
        return 0.0;
    }
    let v = (raw / extent).clamp(0.0, 1.0);
    if invert {
        1.0 - v
    } else {
        v
    }
}

#[derive(Debug, Clone, Copy)]
struct AxisState {
    parameter_index: i64,
    last_sent: Option<f64>,
    last_sampled: Option<f64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub samples: u64,
    pub datagrams: u64,
    pub failed_sends: u64,
}

pub struct StreamThrottle {
    config: StreamConfig,
    base: Params,
    single_command: String,
    batch_command: String,
    axes: ArrayVec<AxisState, MAX_AXES>,
    last_send: Option<Instant>,
    stats: StreamStats,
}

impl StreamThrottle {
    /// `base` is merged into every datagram, typically the target's
    /// `track_index` and `device_index`.
    pub fn new(config: StreamConfig, base: Params) -> Self {
        Self {
            config,
            base,
            single_command: SET_PARAMETER_COMMAND.to_string(),
            batch_command: BATCH_SET_PARAMETERS_COMMAND.to_string(),
            axes: ArrayVec::new(),
            last_send: None,
            stats: StreamStats::default(),
        }
    }

    pub fn with_commands(mut self, single: impl Into<String>, batch: impl Into<String>) -> Self {
        self.single_command = single.into();
        self.batch_command = batch.into();
        self
    }

    /// Bind the next axis to `parameter_index`. Returns the axis position.
    pub fn add_axis(&mut self, parameter_index: i64) -> Result<usize, ClientError> {
        self.axes
            .try_push(AxisState {
                parameter_index,
                last_sent: None,
                last_sampled: None,
            })
            .map_err(|_| ClientError::TooManyAxes(MAX_AXES))?;
        Ok(self.axes.len() - 1)
    }

    pub fn axis_count(&self) -> usize {
        self.axes.len()
    }

    pub fn last_sent(&self, axis: usize) -> Option<f64> {
        self.axes.get(axis).and_then(|a| a.last_sent)
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Feed one sample (one value per axis, in axis order). Returns the
    /// number of datagrams sent.
    pub fn sample<S: DatagramSink>(&mut self, sink: &S, now: Instant, values: &[f64]) -> usize {
        self.stats.samples += 1;
        for (axis, &v) in self.axes.iter_mut().zip(values) {
            axis.last_sampled = Some(v);
        }

        if let Some(last) = self.last_send {
            if now.saturating_duration_since(last) < self.config.min_interval {
                return 0;
            }
        }

        let threshold = self.config.change_threshold;
        let changed: ArrayVec<usize, MAX_AXES> = self
            .axes
            .iter()
            .enumerate()
            .filter(|(_, a)| match (a.last_sampled, a.last_sent) {
                (Some(v), Some(sent)) => (v - sent).abs() > threshold,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .map(|(i, _)| i)
            .collect();

        self.send(sink, now, &changed)
    }

    /// Send every axis whose latest sample differs from its last sent value,
    /// ignoring both the interval and the threshold.
    pub fn flush<S: DatagramSink>(&mut self, sink: &S, now: Instant) -> usize {
        let changed: ArrayVec<usize, MAX_AXES> = self
            .axes
            .iter()
            .enumerate()
            .filter(|(_, a)| matches!(a.last_sampled, Some(v) if a.last_sent != Some(v)))
            .map(|(i, _)| i)
            .collect();
        self.send(sink, now, &changed)
    }

    fn send<S: DatagramSink>(&mut self, sink: &S, now: Instant, changed: &[usize]) -> usize {
        if changed.is_empty() {
            return 0;
        }

        let sent = match self.config.mode {
            StreamMode::Batched => {
                let command = self.batch_datagram(changed);
                if sink.send_datagram(&command) {
                    for &i in changed {
                        self.commit(i);
                    }
                    1
                } else {
                    self.stats.failed_sends += 1;
                    0
                }
            }
            StreamMode::Individual => {
                let mut sent = 0;
                for &i in changed {
                    let command = self.single_datagram(i);
                    if sink.send_datagram(&command) {
                        self.commit(i);
                        sent += 1;
                    } else {
                        self.stats.failed_sends += 1;
                    }
                }
                sent
            }
        };

        if sent > 0 {
            self.last_send = Some(now);
            self.stats.datagrams += sent as u64;
            trace!(datagrams = sent, axes = changed.len(), "stream update");
        }
        sent
    }

    fn commit(&mut self, axis: usize) {
        let a = &mut self.axes[axis];
        a.last_sent = a.last_sampled;
    }

    fn single_datagram(&self, axis: usize) -> Command {
        let a = &self.axes[axis];
        let mut params = self.base.clone();
        params.insert("parameter_index".into(), Value::Int(a.parameter_index));
        params.insert("value".into(), Value::Float(a.last_sampled.unwrap_or_default()));
        Command::new(self.single_command.as_str(), params)
    }

    fn batch_datagram(&self, changed: &[usize]) -> Command {
        let mut indices = Vec::with_capacity(changed.len());
        let mut values = Vec::with_capacity(changed.len());
        for &i in changed {
            let a = &self.axes[i];
            indices.push(Value::Int(a.parameter_index));
            values.push(Value::Float(a.last_sampled.unwrap_or_default()));
        }
        let mut params = self.base.clone();
        params.insert("parameter_indices".into(), Value::List(indices));
        params.insert("values".into(), Value::List(values));
        Command::new(self.batch_command.as_str(), params)
    }
}
