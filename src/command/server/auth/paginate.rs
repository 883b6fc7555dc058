use std::future::Future;

use tracing::debug;

use crate::command::server::error::Error;

/// Walks a page-numbered listing (1-based) until a page comes back shorter
/// than `page_size`. The first failing page aborts the whole walk.
pub async fn collect_numbered_pages<T, F, Fut>(
    page_size: usize,
    mut fetch_page: F,
) -> Result<Vec<T>, Error>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = Result<Vec<T>, Error>>,
{
    let mut items = Vec::new();
    let mut page = 1;

    loop {
        let batch = fetch_page(page, page_size).await?;
        let count = batch.len();
        debug!("Page {page} returned {count} items");
        items.extend(batch);

        if count < page_size {
            return Ok(items);
        }
        page += 1;
    }
}

/// Walks a cursor-based listing: each call gets the previous continuation
/// token and returns its items plus the next token. An absent or empty token
/// ends the walk.
pub async fn collect_token_pages<T, F, Fut>(mut fetch_page: F) -> Result<Vec<T>, Error>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<(Vec<T>, Option<String>), Error>>,
{
    let mut items = Vec::new();
    let mut page_token = None;

    loop {
        let (batch, next) = fetch_page(page_token.take()).await?;
        items.extend(batch);

        match next {
            Some(next) if !next.is_empty() => page_token = Some(next),
            _ => return Ok(items),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn page_of(total: usize, page: usize, per_page: usize) -> Vec<usize> {
        let start = (page - 1) * per_page;
        (start..total.min(start + per_page)).collect()
    }

    #[tokio::test]
    async fn test_numbered_pages_stop_on_short_page() {
        let calls = AtomicUsize::new(0);

        let items = collect_numbered_pages(20, |page, per_page| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(page_of(55, page, per_page)) }
        })
        .await
        .unwrap();

        assert_eq!(items.len(), 55);
        assert_eq!(items, (0..55).collect::<Vec<_>>());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_numbered_pages_exact_multiple_needs_empty_page() {
        let calls = AtomicUsize::new(0);

        let items = collect_numbered_pages(25, |page, per_page| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(page_of(50, page, per_page)) }
        })
        .await
        .unwrap();

        assert_eq!(items.len(), 50);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_numbered_pages_error_drops_partial_results() {
        let result = collect_numbered_pages(20, |page, per_page| async move {
            if page == 3 {
                Err(Error::UpstreamTransport("failed to load groups".to_string()))
            } else {
                Ok(page_of(55, page, per_page))
            }
        })
        .await;

        assert_eq!(
            result,
            Err(Error::UpstreamTransport("failed to load groups".to_string()))
        );
    }

    #[tokio::test]
    async fn test_token_pages_follow_continuation() {
        let seen = std::sync::Mutex::new(Vec::new());

        let items = collect_token_pages(|token| {
            seen.lock().unwrap().push(token.clone());
            async move {
                Ok(match token.as_deref() {
                    None => (vec![1, 2], Some("2".to_string())),
                    Some("2") => (vec![3, 4], Some("3".to_string())),
                    _ => (vec![5], Some(String::new())),
                })
            }
        })
        .await
        .unwrap();

        assert_eq!(items, vec![1, 2, 3, 4, 5]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![None, Some("2".to_string()), Some("3".to_string())]
        );
    }
}
