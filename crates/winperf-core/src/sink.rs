//! The metric emission channel.
//!
//! Every collector gets its own [`SampleSink`] for one scrape. All sinks of a
//! scrape feed one bounded channel drained by the registry. A full channel
//! blocks the producer; samples are never dropped while the consumer is
//! listening.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::error::CollectorError;
use crate::metric::{Desc, Sample, ValueKind};

/// Messages from collector threads to the scrape consumer.
#[derive(Debug)]
pub(crate) enum Envelope {
    Sample {
        collector: usize,
        sample: Sample,
    },
    Done {
        collector: usize,
        result: Result<(), CollectorError>,
        duration: Duration,
    },
    Panicked {
        collector: usize,
        message: String,
    },
}

/// Producer half of the emission channel, bound to one collector.
#[derive(Debug, Clone)]
pub struct SampleSink {
    tx: Sender<Envelope>,
    collector: usize,
    /// Descriptors registered by this collector, by fully-qualified name.
    descs: Arc<HashMap<String, Arc<Desc>>>,
}

impl SampleSink {
    pub(crate) fn new(
        tx: Sender<Envelope>,
        collector: usize,
        descs: Arc<HashMap<String, Arc<Desc>>>,
    ) -> Self {
        Self {
            tx,
            collector,
            descs,
        }
    }

    /// Emits one sample.
    ///
    /// # Panics
    ///
    /// If `desc` was not registered by this collector or `label_values` does
    /// not match the descriptor's label count. Both are bugs in the
    /// collector, not runtime conditions.
    pub fn emit(
        &self,
        desc: &Arc<Desc>,
        kind: ValueKind,
        value: f64,
        label_values: &[&str],
    ) -> Result<(), CollectorError> {
        match self.descs.get(desc.fq_name()) {
            Some(registered) if registered == desc => {}
            _ => panic!(
                "sample for unregistered descriptor {} (collector #{})",
                desc.fq_name(),
                self.collector
            ),
        }
        assert_eq!(
            desc.labels().len(),
            label_values.len(),
            "label arity mismatch for {}: expected {:?}, got {:?}",
            desc.fq_name(),
            desc.labels(),
            label_values
        );

        let sample = Sample {
            desc: Arc::clone(desc),
            kind,
            value,
            label_values: label_values.iter().map(|v| v.to_string()).collect(),
        };

        self.tx
            .send(Envelope::Sample {
                collector: self.collector,
                sample,
            })
            .map_err(|_| CollectorError::SinkClosed)
    }

    pub fn counter(
        &self,
        desc: &Arc<Desc>,
        value: f64,
        label_values: &[&str],
    ) -> Result<(), CollectorError> {
        self.emit(desc, ValueKind::Counter, value, label_values)
    }

    pub fn gauge(
        &self,
        desc: &Arc<Desc>,
        value: f64,
        label_values: &[&str],
    ) -> Result<(), CollectorError> {
        self.emit(desc, ValueKind::Gauge, value, label_values)
    }

    /// A sink over its own channel, for driving a single collector directly.
    ///
    /// `descs` are the descriptors the collector registered during `build`.
    pub fn pair(descs: &[Arc<Desc>], capacity: usize) -> (Self, SampleReceiver) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let descs = descs
            .iter()
            .map(|d| (d.fq_name().to_string(), Arc::clone(d)))
            .collect();
        (Self::new(tx, 0, Arc::new(descs)), SampleReceiver { rx })
    }
}

/// Consumer half returned by [`SampleSink::pair`].
#[derive(Debug)]
pub struct SampleReceiver {
    rx: Receiver<Envelope>,
}

impl SampleReceiver {
    /// Samples sent so far, without blocking.
    pub fn drain(&self) -> Vec<Sample> {
        self.rx
            .try_iter()
            .filter_map(|envelope| match envelope {
                Envelope::Sample { sample, .. } => Some(sample),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::DescRegistry;

    fn descs() -> Vec<Arc<Desc>> {
        let mut registry = DescRegistry::new();
        vec![
            registry.register("windows_a".into(), "a", &[]).unwrap(),
            registry
                .register("windows_b".into(), "b", &["process"])
                .unwrap(),
        ]
    }

    #[test]
    fn emits_registered_samples() {
        let descs = descs();
        let (sink, rx) = SampleSink::pair(&descs, 16);
        sink.gauge(&descs[0], 1.5, &[]).unwrap();
        sink.counter(&descs[1], 3.0, &["w3wp"]).unwrap();

        let samples = rx.drain();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].value, 1.5);
        assert_eq!(samples[0].kind, ValueKind::Gauge);
        assert_eq!(samples[1].label_values, vec!["w3wp".to_string()]);
        assert_eq!(samples[1].kind, ValueKind::Counter);
    }

    #[test]
    #[should_panic(expected = "label arity mismatch")]
    fn arity_mismatch_panics() {
        let descs = descs();
        let (sink, _rx) = SampleSink::pair(&descs, 16);
        let _ = sink.gauge(&descs[1], 1.0, &[]);
    }

    #[test]
    #[should_panic(expected = "unregistered descriptor")]
    fn foreign_descriptor_panics() {
        let descs = descs();
        let (sink, _rx) = SampleSink::pair(&descs[..1], 16);
        let _ = sink.gauge(&descs[1], 1.0, &["x"]);
    }

    #[test]
    fn closed_consumer_is_reported() {
        let descs = descs();
        let (sink, rx) = SampleSink::pair(&descs, 1);
        drop(rx);
        assert!(matches!(
            sink.gauge(&descs[0], 1.0, &[]),
            Err(CollectorError::SinkClosed)
        ));
    }

    #[test]
    fn full_channel_blocks_instead_of_dropping() {
        let descs = descs();
        let (sink, rx) = SampleSink::pair(&descs, 1);
        let producer = {
            let sink = sink.clone();
            let desc = Arc::clone(&descs[0]);
            std::thread::spawn(move || {
                for i in 0..50 {
                    sink.gauge(&desc, i as f64, &[]).unwrap();
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 50 {
            match rx.rx.recv_timeout(Duration::from_secs(5)) {
                Ok(Envelope::Sample { sample, .. }) => received.push(sample.value),
                Ok(_) => {}
                Err(e) => panic!("producer stalled: {}", e),
            }
        }
        producer.join().unwrap();
        let expected: Vec<f64> = (0..50).map(|i| i as f64).collect();
        assert_eq!(received, expected);
    }
}
