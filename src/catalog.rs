use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::series::{SeriesPayload, Stamp};

/// One change reported by the remote catalog for a series.
#[derive(Debug, Clone)]
pub struct ChangeNote {
    pub description: String,
    pub at: Option<Stamp>,
}

/// The remote catalog service this tracker refreshes from. Only the two
/// queries the refresh logic needs; a concrete HTTP client lives outside
/// this crate.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Cheap existence check: what changed for `series_id` since `since`?
    /// An empty list means a full fetch can be skipped.
    async fn changes(&self, series_id: &str, since: Option<Stamp>) -> Result<Vec<ChangeNote>>;

    /// Full fetch of the series payload, episode list included.
    async fn fetch(&self, series_id: &str, with_details: bool) -> Result<SeriesPayload>;
}

/// Fetch many series concurrently, invoking `progress(done, total)` as each
/// one completes (in completion order, not input order).
pub async fn fetch_many(
    catalog: &Arc<dyn Catalog>,
    series_ids: Vec<String>,
    with_details: bool,
    mut progress: impl FnMut(usize, usize),
) -> Vec<(String, Result<SeriesPayload>)> {
    let total = series_ids.len();
    let mut tasks: FuturesUnordered<_> = series_ids
        .into_iter()
        .map(|series_id| {
            let catalog = Arc::clone(catalog);
            async move {
                let result = catalog.fetch(&series_id, with_details).await;
                (series_id, result)
            }
        })
        .collect();

    let mut results = Vec::with_capacity(total);
    while let Some(done) = tasks.next().await {
        results.push(done);
        progress(results.len(), total);
    }
    results
}


#[cfg(test)]
mod tests {
    use super::testing::FakeCatalog;
    use super::*;

    fn payload(title: &str) -> SeriesPayload {
        SeriesPayload { title: title.to_string(), ..Default::default() }
    }

    #[tokio::test]
    async fn fetch_many_reports_progress_per_completion() {
        let catalog: Arc<dyn Catalog> = Arc::new(
            FakeCatalog::default()
                .with_payload("1", payload("One"))
                .with_payload("2", payload("Two"))
                .with_payload("3", payload("Three")),
        );

        let mut ticks = Vec::new();
        let results = fetch_many(
            &catalog,
            vec!["1".into(), "2".into(), "3".into()],
            true,
            |done, total| ticks.push((done, total)),
        )
        .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(ticks, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn fetch_failures_are_collected_not_fatal() {
        let catalog: Arc<dyn Catalog> =
            Arc::new(FakeCatalog::default().with_payload("1", payload("One")));

        let results =
            fetch_many(&catalog, vec!["1".into(), "missing".into()], false, |_, _| {}).await;

        assert_eq!(results.len(), 2);
        let by_id: std::collections::HashMap<_, _> =
            results.iter().map(|(id, r)| (id.as_str(), r.is_ok())).collect();
        assert!(by_id["1"]);
        assert!(!by_id["missing"]);
    }
}
