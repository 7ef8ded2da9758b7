//! Command-line entry points.

use clap::Args;
use futures::StreamExt as _;

use crate::{async_utils::BoxedStream, prelude::*};

pub mod reconcile;
pub mod schema;
pub mod score;

/// Common options for subcommands that process data streams.
#[derive(Debug, Clone, Args)]
pub struct StreamOpts {
    /// Limit processing to the first N records.
    #[clap(long)]
    pub(crate) take_first: Option<usize>,

    /// Max number of documents to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub(crate) job_count: usize,

    /// What portion of inputs should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "0.01")]
    pub(crate) allowed_failure_rate: f32,
}

impl StreamOpts {
    /// Apply any necessary stream opts to our input stream.
    pub fn apply_stream_input_opts<T>(
        &self,
        input: BoxedStream<Result<T>>,
    ) -> BoxedStream<Result<T>>
    where
        T: 'static,
    {
        if let Some(take_first) = self.take_first {
            input.take(take_first).boxed()
        } else {
            input
        }
    }

    /// How many records will we actually process, given `available`?
    pub fn limit_count(&self, available: Option<usize>) -> Option<usize> {
        match (available, self.take_first) {
            (Some(available), Some(take_first)) => Some(available.min(take_first)),
            (None, Some(take_first)) => Some(take_first),
            (available, None) => available,
        }
    }
}

#[cfg(test)]
impl Default for StreamOpts {
    fn default() -> Self {
        Self {
            take_first: None,
            job_count: 4,
            allowed_failure_rate: 0.01,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::{TryStreamExt as _, stream};

    use super::*;

    #[tokio::test]
    async fn take_first_limits_input() {
        let opts = StreamOpts {
            take_first: Some(2),
            ..StreamOpts::default()
        };
        let input = stream::iter((0..5).map(Ok)).boxed();
        let taken = opts
            .apply_stream_input_opts(input)
            .try_collect::<Vec<i32>>()
            .await
            .unwrap();
        assert_eq!(taken, vec![0, 1]);
        assert_eq!(opts.limit_count(Some(5)), Some(2));
        assert_eq!(opts.limit_count(Some(1)), Some(1));
        assert_eq!(StreamOpts::default().limit_count(None), None);
    }
}
