use super::Result;
use crate::metrics::{CalendarMetrics, CalendarSyncStatus};
use crate::posts::{Post, PostStatus};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use indexmap::IndexMap;
use prometheus::Registry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::oneshot::{self, Receiver, Sender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Titles longer than this many characters are shortened with an ellipsis.
const TITLE_CHARS: usize = 50;

/// A scheduled post as shown in the calendar.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CalendarEntry {
    /// Id of the post this entry represents.
    pub post_id: String,
    /// Shortened post content.
    pub title: String,
    /// When the post goes out. Posts are instant events.
    pub scheduled_at: DateTime<Utc>,
    /// Status of the post.
    pub status: PostStatus,
}

impl CalendarEntry {
    /// Creates an entry from a post, if the post is scheduled.
    pub fn from_post(post: &Post) -> Option<CalendarEntry> {
        let scheduled_at = post.scheduled_at?;

        let title = if post.content.chars().count() > TITLE_CHARS {
            let short: String = post.content.chars().take(TITLE_CHARS).collect();
            format!("{short}...")
        } else {
            post.content.clone()
        };

        Some(CalendarEntry {
            post_id: post.id.clone(),
            title,
            scheduled_at,
            status: post.status,
        })
    }
}

impl fmt::Display for CalendarEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.title)
    }
}

/// Type alias for calendar entries grouped by local day.
pub type EntriesByDay = IndexMap<NaiveDate, Vec<CalendarEntry>>;

/// Trait that needs to be implemented by a source of posts.
#[async_trait]
pub trait PostSource: Send + Sync {
    /// Fetches posts from the source.
    async fn fetch_posts(&self) -> Result<Vec<Post>>;
}

/// A `PostSource` that returns posts from a static list.
pub struct StaticPostSource {
    posts: Vec<Post>,
}

impl StaticPostSource {
    /// Creates a new `StaticPostSource` from an iterator.
    pub fn new<I>(iter: I) -> StaticPostSource
    where
        I: IntoIterator,
        I::Item: Into<Post>,
    {
        StaticPostSource {
            posts: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PostSource for StaticPostSource {
    async fn fetch_posts(&self) -> Result<Vec<Post>> {
        Ok(self.posts.clone())
    }
}

#[async_trait]
impl<T> PostSource for Box<T>
where
    T: PostSource + ?Sized,
{
    async fn fetch_posts(&self) -> Result<Vec<Post>> {
        (**self).fetch_posts().await
    }
}

#[async_trait]
impl<T> PostSource for Arc<T>
where
    T: PostSource + ?Sized,
{
    async fn fetch_posts(&self) -> Result<Vec<Post>> {
        (**self).fetch_posts().await
    }
}

/// Returns the week containing `date` in `tz`, from Monday 00:00 (inclusive) to the next Monday
/// 00:00 (exclusive).
pub fn week_of(date: NaiveDate, tz: Tz) -> Range<DateTime<Utc>> {
    let monday = date - Days::new(u64::from(date.weekday().num_days_from_monday()));
    let next_monday = monday + Days::new(7);

    start_of_day(monday, tz)..start_of_day(next_monday, tz)
}

/// First instant of `date` in `tz`. Days starting in a DST gap begin at the first valid instant.
fn start_of_day(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();

    (0..=3)
        .find_map(|hours| {
            tz.from_local_datetime(&(midnight + chrono::Duration::hours(hours)))
                .earliest()
        })
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

/// The `Calendar` type caches scheduled posts from a post source.
#[derive(Clone)]
pub struct Calendar {
    post_source: Arc<dyn PostSource>,
    entries: Arc<Mutex<Vec<CalendarEntry>>>,
    metrics: Arc<CalendarMetrics>,
}

impl Calendar {
    /// Creates a new `Calendar` from a post source.
    pub fn new<T>(post_source: T) -> Result<Calendar>
    where
        T: PostSource + 'static,
    {
        Ok(Calendar {
            post_source: Arc::new(post_source),
            entries: Default::default(),
            metrics: Arc::new(CalendarMetrics::new()?),
        })
    }

    /// Registers the calendar metrics in a prometheus registry.
    pub fn register_metrics(&self, registry: &Registry) -> Result<()> {
        Ok(self.metrics.register(registry)?)
    }

    /// Entries scheduled between a start (inclusive) and an end (exclusive).
    pub async fn entries(&self, range: Range<DateTime<Utc>>) -> Vec<CalendarEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|entry| range.contains(&entry.scheduled_at))
            .cloned()
            .collect()
    }

    /// Builds an index of local day to entries, for rendering a day-by-day agenda.
    pub async fn entries_by_day(&self, range: Range<DateTime<Utc>>, tz: Tz) -> EntriesByDay {
        let mut entries_by_day: EntriesByDay = IndexMap::new();

        for entry in self.entries(range).await {
            let day = entry.scheduled_at.with_timezone(&tz).date_naive();
            entries_by_day.entry(day).or_default().push(entry);
        }

        entries_by_day
    }

    /// Synchronize posts from the source into the calendar once.
    pub async fn sync_once(&self) -> Result<()> {
        log::debug!("synchronizing calendar posts");

        let (result, status) = match self.post_source.fetch_posts().await {
            Ok(posts) => {
                let mut entries: Vec<CalendarEntry> =
                    posts.iter().filter_map(CalendarEntry::from_post).collect();

                self.metrics.posts().set(entries.len() as i64);

                // Ensure entries are always sorted by time.
                entries.sort_by_key(|entry| entry.scheduled_at);
                *self.entries.lock().await = entries;

                (Ok(()), CalendarSyncStatus::Success)
            }
            Err(err) => (Err(err), CalendarSyncStatus::Error),
        };

        let now = Utc::now().timestamp();
        self.metrics.latest_sync_timestamp_seconds(status).set(now);
        self.metrics.syncs_total(status).inc();

        result
    }

    /// Starts to periodically sync the calendar every `period` until a message is received via
    /// `stop`.
    async fn start_sync(&self, period: Duration, mut stop: Receiver<()>) {
        log::info!("synchronizing calendar posts every {:?}", period);
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.sync_once().await {
                        log::error!("failed to sync calendar posts: {err}");
                    }
                }
                _ = &mut stop => {
                    log::info!("stopping calendar sync");
                    return;
                }
            }
        }
    }

    /// Starts a background task to sync calendar posts. Returns a `SyncTaskHandle` to stop the
    /// sync.
    pub fn spawn_sync_task(&self, period: Duration) -> SyncTaskHandle {
        let calendar = self.clone();
        let (stop_tx, stop_rx) = oneshot::channel();

        let join_handle = tokio::spawn(async move {
            calendar.start_sync(period, stop_rx).await;
        });

        SyncTaskHandle {
            join_handle,
            stop_tx,
        }
    }
}

/// A handle for stopping a calendar sync task.
pub struct SyncTaskHandle {
    join_handle: JoinHandle<()>,
    stop_tx: Sender<()>,
}

impl SyncTaskHandle {
    /// Stops the calendar sync task. Blocks until the background task is finished.
    pub async fn stop(self) -> io::Result<()> {
        if self.stop_tx.send(()).is_ok() {
            self.join_handle.await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posts::tests::post;
    use indexmap::indexmap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    macro_rules! at {
        ($s:expr) => {
            DateTime::parse_from_rfc3339($s).unwrap().with_timezone(&Utc)
        };
    }

    macro_rules! date {
        ($y:expr, $m:expr, $d:expr) => {
            NaiveDate::from_ymd_opt($y, $m, $d).unwrap()
        };
    }

    fn posts() -> Vec<Post> {
        vec![
            post("c", "SCHEDULED", Some("2026-10-21T09:00:00Z")),
            post("a", "SCHEDULED", Some("2026-10-19T23:30:00Z")),
            post("draft", "DRAFT", None),
            post("b", "PUBLISHED", Some("2026-10-20T08:00:00Z")),
            post("d", "FAILED", Some("2026-10-26T09:00:00Z")),
        ]
    }

    fn ids(entries: &[CalendarEntry]) -> Vec<&str> {
        entries.iter().map(|entry| entry.post_id.as_str()).collect()
    }

    #[test]
    fn long_titles_are_shortened() {
        let mut long = post("p", "SCHEDULED", Some("2026-10-21T09:00:00Z"));
        long.content = "x".repeat(60);

        let entry = CalendarEntry::from_post(&long).unwrap();
        assert_eq!(entry.title, format!("{}...", "x".repeat(50)));

        let short = post("p", "SCHEDULED", Some("2026-10-21T09:00:00Z"));
        assert_eq!(CalendarEntry::from_post(&short).unwrap().title, "post p");

        assert_eq!(CalendarEntry::from_post(&post("p", "DRAFT", None)), None);
    }

    #[test]
    fn weeks_start_on_monday() {
        // 2026-10-21 is a Wednesday.
        assert_eq!(
            week_of(date!(2026, 10, 21), Tz::UTC),
            at!("2026-10-19T00:00:00Z")..at!("2026-10-26T00:00:00Z")
        );
        // The week of the DST switch in Berlin is an hour longer.
        assert_eq!(
            week_of(date!(2026, 10, 25), Tz::Europe__Berlin),
            at!("2026-10-18T22:00:00Z")..at!("2026-10-25T23:00:00Z")
        );
    }

    #[tokio::test]
    async fn entries_between() {
        let calendar = Calendar::new(StaticPostSource::new(posts())).unwrap();
        calendar.sync_once().await.unwrap();

        let week = week_of(date!(2026, 10, 21), Tz::UTC);
        assert_eq!(ids(&calendar.entries(week).await), vec!["a", "b", "c"]);

        let all = at!("2026-01-01T00:00:00Z")..at!("2027-01-01T00:00:00Z");
        assert_eq!(ids(&calendar.entries(all).await), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn entries_by_local_day() {
        let calendar = Calendar::new(StaticPostSource::new(posts())).unwrap();
        calendar.sync_once().await.unwrap();

        let week = week_of(date!(2026, 10, 21), Tz::Europe__Berlin);
        let by_day = calendar.entries_by_day(week, Tz::Europe__Berlin).await;

        // 23:30 UTC on the 19th is already the 20th in Berlin.
        let expected = indexmap! {
            date!(2026, 10, 20) => vec!["a", "b"],
            date!(2026, 10, 21) => vec!["c"],
        };

        assert_eq!(
            by_day
                .iter()
                .map(|(day, entries)| (*day, ids(entries)))
                .collect::<IndexMap<_, _>>(),
            expected
        );
    }

    #[tokio::test]
    async fn calendar_sync() {
        use CalendarSyncStatus::*;

        // A fake `PostSource` which just counts invocations of `fetch_posts` and returns a single
        // scheduled post.
        struct Counter(AtomicUsize);

        #[async_trait]
        impl PostSource for Counter {
            async fn fetch_posts(&self) -> Result<Vec<Post>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(vec![post("p", "SCHEDULED", Some("2026-10-21T09:00:00Z"))])
            }
        }

        let counter = Arc::new(Counter(AtomicUsize::new(0)));

        let calendar = Arc::new(Calendar::new(counter.clone()).unwrap());

        let range = at!("2026-10-21T00:00:00Z")..at!("2026-10-22T00:00:00Z");

        // Initially, there are no entries because no sync happened.
        assert_eq!(calendar.entries(range.clone()).await, vec![]);

        assert_eq!(calendar.metrics.posts().get(), 0);
        assert_eq!(calendar.metrics.syncs_total(Success).get(), 0);
        assert_eq!(calendar.metrics.syncs_total(Error).get(), 0);

        calendar.sync_once().await.unwrap();

        assert_eq!(calendar.metrics.posts().get(), 1);
        assert_eq!(calendar.metrics.syncs_total(Success).get(), 1);
        assert_eq!(ids(&calendar.entries(range.clone()).await), vec!["p"]);

        // We only fetched the posts once from the source.
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);

        let sync_task_handle = calendar.spawn_sync_task(Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(15)).await;

        // Stop the sync again.
        sync_task_handle.stop().await.unwrap();

        // Manual `sync_once` above + initial sync + sync after 10ms = 3 syncs.
        assert_eq!(counter.0.load(Ordering::Relaxed), 3);
        assert_eq!(calendar.metrics.syncs_total(Success).get(), 3);
        assert_eq!(calendar.metrics.syncs_total(Error).get(), 0);

        tokio::time::sleep(Duration::from_millis(15)).await;

        // Since sync is stopped, counter should not increase.
        assert_eq!(counter.0.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn failed_sync_keeps_previous_entries() {
        struct Flaky(AtomicUsize);

        #[async_trait]
        impl PostSource for Flaky {
            async fn fetch_posts(&self) -> Result<Vec<Post>> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(vec![post("p", "SCHEDULED", Some("2026-10-21T09:00:00Z"))])
                } else {
                    Err(crate::Error::Validation("backend unavailable".into()))
                }
            }
        }

        let calendar = Calendar::new(Flaky(AtomicUsize::new(0))).unwrap();
        let range = at!("2026-10-21T00:00:00Z")..at!("2026-10-22T00:00:00Z");

        calendar.sync_once().await.unwrap();
        assert!(calendar.sync_once().await.is_err());

        assert_eq!(ids(&calendar.entries(range).await), vec!["p"]);
        assert_eq!(
            calendar
                .metrics
                .syncs_total(CalendarSyncStatus::Error)
                .get(),
            1
        );
    }
}
