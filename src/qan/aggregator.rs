use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::qan::class::{Class, Example};
use crate::qan::event::Event;

/// Result of one interval's aggregation.
#[derive(Debug, Clone, Default)]
pub struct AggregateResult {
    pub global: Class,
    pub classes: Vec<Class>,
    /// Sampling rate applied to counts and sums, 0 when unsampled.
    pub rate_limit: u32,
}

#[derive(Debug, Default)]
struct ClassAcc {
    class: Class,
}

impl ClassAcc {
    fn add(&mut self, e: &Event, example_queries: bool) {
        let c = &mut self.class;
        c.total_queries += 1;
        c.seen(e.ts);

        for (k, v) in &e.time_metrics {
            c.metrics.time_metrics.entry(k.clone()).or_default().add(*v);
        }
        for (k, v) in &e.number_metrics {
            c.metrics
                .number_metrics
                .entry(k.clone())
                .or_default()
                .add(*v as f64);
        }
        for (k, v) in &e.bool_metrics {
            let b = c.metrics.bool_metrics.entry(k.clone()).or_default();
            if *v {
                b.sum += 1;
            }
        }

        if example_queries {
            let qt = e.query_time();
            if c.example.as_ref().map_or(true, |ex| qt > ex.query_time) {
                c.example = Some(Example {
                    query: e.query.clone(),
                    db: e.db.clone(),
                    ts: e.ts,
                    query_time: qt,
                });
            }
        }
    }

    fn finish(mut self, rate: u64) -> Class {
        self.class.metrics.finalize(rate);
        self.class.total_queries *= rate.max(1);
        self.class.query_count = self.class.total_queries;
        self.class
    }
}

/// Groups slow log events by class and computes per-class and global
/// statistics.
#[derive(Debug)]
pub struct Aggregator {
    example_queries: bool,
    global: ClassAcc,
    classes: HashMap<String, ClassAcc>,
    rate: Option<(String, u32)>,
    mixed_rate: bool,
}

impl Aggregator {
    pub fn new(example_queries: bool) -> Self {
        Self {
            example_queries,
            global: ClassAcc::default(),
            classes: HashMap::new(),
            rate: None,
            mixed_rate: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.global.class.total_queries == 0
    }

    pub fn add_event(&mut self, e: &Event, fingerprint: &str, id: &str) {
        let limit = e.rate_limit.max(1);
        match &self.rate {
            None => self.rate = Some((e.rate_type.clone(), limit)),
            Some((t, l)) if *t != e.rate_type || *l != limit => self.mixed_rate = true,
            Some(_) => {}
        }

        self.global.add(e, false);
        self.classes
            .entry(id.to_string())
            .or_insert_with(|| ClassAcc {
                class: Class::new(id, fingerprint),
            })
            .add(e, self.example_queries);
    }

    /// Fails if the interval mixes sampling rates; the counts could not be
    /// scaled consistently.
    pub fn finalize(self) -> Result<AggregateResult> {
        if self.mixed_rate {
            bail!("slow log has mixed rate limits; cannot scale metrics");
        }

        let limit = self.rate.map(|(_, l)| l).unwrap_or(1);
        let rate = u64::from(limit);

        let mut classes: Vec<Class> = self
            .classes
            .into_values()
            .map(|acc| acc.finish(rate))
            .collect();
        classes.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(AggregateResult {
            global: self.global.finish(rate),
            classes,
            rate_limit: if limit > 1 { limit } else { 0 },
        })
    }
}
