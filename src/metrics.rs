use prometheus::{
    core::{AtomicI64, AtomicU64, GenericCounter, GenericGauge},
    opts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry,
};

pub const NAMESPACE: &str = "postpilot";

/// Container for gateway metrics.
pub(crate) struct GatewayMetrics {
    refreshes_total: IntCounterVec,
    queued_requests_total: IntCounter,
}

impl GatewayMetrics {
    /// Creates new GatewayMetrics.
    pub fn new() -> Result<GatewayMetrics, prometheus::Error> {
        let refreshes_total = IntCounterVec::new(
            opts!(
                "gateway_refreshes_total",
                "Total number of access token refreshes performed"
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;

        let queued_requests_total = IntCounter::with_opts(
            opts!(
                "gateway_queued_requests_total",
                "Total number of requests that waited for a refresh started by another request"
            )
            .namespace(NAMESPACE),
        )?;

        Ok(GatewayMetrics {
            refreshes_total,
            queued_requests_total,
        })
    }

    /// Registers the metrics in a prometheus registry.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.refreshes_total.clone()))?;
        registry.register(Box::new(self.queued_requests_total.clone()))?;
        Ok(())
    }

    /// Provides access to the refresh counter.
    pub fn refreshes_total(&self, status: RefreshStatus) -> GenericCounter<AtomicU64> {
        self.refreshes_total.with_label_values(&[status.as_str()])
    }

    /// Provides access to the queued requests counter.
    pub fn queued_requests_total(&self) -> GenericCounter<AtomicU64> {
        self.queued_requests_total.clone()
    }
}

/// Outcome of a token refresh.
#[derive(Debug, Copy, Clone)]
pub(crate) enum RefreshStatus {
    Success,
    Error,
}

impl RefreshStatus {
    /// Returns the status as a &str.
    pub fn as_str(&self) -> &str {
        match self {
            RefreshStatus::Success => "success",
            RefreshStatus::Error => "error",
        }
    }
}

/// Container for calendar metrics.
pub(crate) struct CalendarMetrics {
    posts: IntGauge,
    latest_sync_timestamp_seconds: IntGaugeVec,
    syncs_total: IntCounterVec,
}

impl CalendarMetrics {
    /// Creates new CalendarMetrics.
    pub fn new() -> Result<CalendarMetrics, prometheus::Error> {
        let posts = IntGauge::with_opts(
            opts!("calendar_posts", "Number of scheduled posts in the calendar").namespace(NAMESPACE),
        )?;

        let latest_sync_timestamp_seconds = IntGaugeVec::new(
            opts!(
                "calendar_latest_sync_timestamp_seconds",
                "UNIX timestamp seconds of the latest calendar sync"
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;

        let syncs_total = IntCounterVec::new(
            opts!(
                "calendar_syncs_total",
                "Total number of calendar syncs performed"
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;

        Ok(CalendarMetrics {
            posts,
            latest_sync_timestamp_seconds,
            syncs_total,
        })
    }

    /// Registers the metrics in a prometheus registry.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.posts.clone()))?;
        registry.register(Box::new(self.latest_sync_timestamp_seconds.clone()))?;
        registry.register(Box::new(self.syncs_total.clone()))?;
        Ok(())
    }

    /// Provides access to the calendar posts gauge.
    pub fn posts(&self) -> GenericGauge<AtomicI64> {
        self.posts.clone()
    }

    /// Provides access to the latest calendar sync UNIX timestamp gauge.
    pub fn latest_sync_timestamp_seconds(
        &self,
        status: CalendarSyncStatus,
    ) -> GenericGauge<AtomicI64> {
        self.latest_sync_timestamp_seconds
            .with_label_values(&[status.as_str()])
    }

    /// Provides access to the calendar syncs counter.
    pub fn syncs_total(&self, status: CalendarSyncStatus) -> GenericCounter<AtomicU64> {
        self.syncs_total.with_label_values(&[status.as_str()])
    }
}

/// Status of a calendar sync operation.
#[derive(Debug, Copy, Clone)]
pub(crate) enum CalendarSyncStatus {
    /// Calendar sync was successful.
    Success,
    /// An error occurred while syncing the calendar.
    Error,
}

impl CalendarSyncStatus {
    /// Returns the status as a &str.
    pub fn as_str(&self) -> &str {
        match self {
            CalendarSyncStatus::Success => "success",
            CalendarSyncStatus::Error => "error",
        }
    }
}
