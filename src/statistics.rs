use std::time::Duration;

/// TLS progress as seen by a statistics observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsNegotiationStatus {
    /// No TLS handler on the channel.
    #[default]
    None,
    Ongoing,
    Success,
    Failure,
}

/// Cumulative per-channel counters delivered on each flush.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStatistics {
    /// Bytes the terminal handler pulled off the socket.
    pub bytes_read: u64,
    /// Bytes the terminal handler handed to the kernel.
    pub bytes_written: u64,
    pub tls_status: TlsNegotiationStatus,
}

/// Per-channel observer receiving periodic statistics flushes.
///
/// Attach with
/// [`LoopCtx::channel_set_statistics_handler`](crate::event_loop::LoopCtx::channel_set_statistics_handler)
/// from the channel's loop before its first I/O. Flushes ride a scheduled
/// task on the channel's loop and stop when the channel shuts down.
pub trait StatisticsHandler {
    /// How often to flush.
    fn report_interval(&self) -> Duration;

    /// Called with the cumulative counters at each flush.
    fn report(&mut self, stats: &ChannelStatistics);
}
