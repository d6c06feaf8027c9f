//! Implements the write-idle heartbeat ticker

use std::task::Poll;
use std::time::Duration;

use futures_util::Stream;
use tokio_stream::wrappers::IntervalStream;

/// A ticker that fires once per heartbeat period, or never when
/// heartbeats were not negotiated.
#[derive(Debug, Default)]
pub struct HeartBeat {
    interval: Option<IntervalStream>,
}

impl HeartBeat {
    /// A ticker that never fires.
    pub fn never() -> Self {
        Self { interval: None }
    }

    /// A ticker firing every `period`.
    ///
    /// The first tick is delayed a full period so an idle connection is
    /// not probed immediately after tuning.
    pub fn new(period: Duration) -> Self {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self {
            interval: Some(IntervalStream::new(interval)),
        }
    }
}

impl Stream for HeartBeat {
    type Item = ();

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        match self.get_mut().interval.as_mut() {
            Some(interval) => match std::pin::Pin::new(interval).poll_next(cx) {
                Poll::Ready(Some(_instant)) => Poll::Ready(Some(())),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Pending,
        }
    }
}
