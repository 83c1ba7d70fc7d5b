use std::collections::VecDeque;

use na::DVector;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub observation: DVector<f64>,
    pub action: DVector<f64>,
}

/// 固定容量のリングバッファ (古い順に並ぶ)
#[derive(Debug, Clone)]
pub struct ExperienceBuffer {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl ExperienceBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfig("buffer capacity must be positive".into()));
        }
        Ok(Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    pub fn push(&mut self, observation: DVector<f64>, action: DVector<f64>) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample {
            observation,
            action,
        });
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.samples.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Sample> + '_ {
        self.samples.iter()
    }

    /// 最新 n 件 (古い順)
    pub fn latest(&self, n: usize) -> impl Iterator<Item = &Sample> + '_ {
        self.samples.iter().skip(self.samples.len().saturating_sub(n))
    }

    pub fn get(&self, i: usize) -> Option<&Sample> {
        self.samples.get(i)
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
