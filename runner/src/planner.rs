use crate::config::RunParameters;
use std::fmt;

/// One replicated slice of an input file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDescriptor {
    /// 0-based index within its input file
    pub index: u64,
    /// `_00001` style label, empty for an unbatched run
    pub label: String,
    /// absolute number of the first event read from the input
    pub start_event: u64,
}

impl fmt::Display for BatchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch {} ({}) from event {}", self.index, self.label, self.start_event)
    }
}

/// Splits every input file into the same sequence of batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlanner {
    pub batches: u64,
    pub events_per_batch: u64,
    pub start_event: u64,
}

impl From<&RunParameters> for BatchPlanner {
    fn from(params: &RunParameters) -> Self {
        Self {
            batches: params.batches,
            events_per_batch: params.events_per_batch,
            start_event: params.start_event,
        }
    }
}

impl BatchPlanner {
    /// Descriptor of batch `index`.
    ///
    /// A single batch starting at event 0 keeps the historic unlabelled layout.
    /// Otherwise the label number is derived from the global start offset, so a
    /// rerun with a different `start_event` never reuses a label.
    pub fn batch(&self, index: u64) -> BatchDescriptor {
        if self.batches == 1 && self.start_event == 0 {
            return BatchDescriptor {
                index,
                label: String::new(),
                start_event: 0,
            };
        }

        let events = self.events_per_batch.max(1);

        BatchDescriptor {
            index,
            label: format!("_{:05}", self.start_event / events + 1 + index),
            start_event: self.start_event + events * index,
        }
    }

    /// all batches of one input file, in order
    pub fn plan(&self) -> impl Iterator<Item = BatchDescriptor> + '_ {
        (0..self.batches).map(move |index| self.batch(index))
    }
}

#[cfg(test)]
#[path = "planner_test.rs"]
mod planner_test;
