use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use hindsight_models::CrossEncoder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Batch size cap per cross-encoder call.
pub const RERANK_BATCH: usize = 50;

/// One unit's text plus temporal metadata for candidate formatting.
#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub text: String,
    pub occurred_start: Option<DateTime<Utc>>,
    pub occurred_end: Option<DateTime<Utc>>,
}

/// The text fed to the model carries the occurred dates when present.
pub fn format_candidate(candidate: &RerankCandidate) -> String {
    match (candidate.occurred_start, candidate.occurred_end) {
        (Some(start), Some(end)) if end != start => format!(
            "{} (occurred {} to {})",
            candidate.text,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        ),
        (Some(start), _) => format!("{} (occurred {})", candidate.text, start.format("%Y-%m-%d")),
        _ => candidate.text.clone(),
    }
}

struct RerankJob {
    query: String,
    candidates: Vec<RerankCandidate>,
    reply: oneshot::Sender<Result<Vec<f32>>>,
}

/// Handle to the dedicated rerank worker.
///
/// The cross-encoder is a serialisation point: jobs queue FIFO into a
/// single worker task, so at most one batch is in flight per model
/// instance. Callers attach a soft deadline and fall back to fused
/// order when it expires.
#[derive(Clone)]
pub struct RerankHandle {
    tx: mpsc::Sender<RerankJob>,
}

impl RerankHandle {
    pub fn spawn(encoder: Arc<dyn CrossEncoder>) -> Self {
        let (tx, mut rx) = mpsc::channel::<RerankJob>(32);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = score_job(encoder.as_ref(), &job.query, &job.candidates).await;
                // A dropped receiver means the caller gave up on the
                // deadline; nothing to do.
                let _ = job.reply.send(result);
            }
            debug!("rerank worker stopped, channel closed");
        });
        Self { tx }
    }

    /// Score candidates against the query, failing soft on `deadline`.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RerankCandidate>,
        deadline: Duration,
    ) -> Result<Vec<f32>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RerankJob {
                query: query.to_string(),
                candidates,
                reply,
            })
            .await
            .map_err(|_| anyhow!("rerank worker is gone"))?;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(anyhow!("rerank worker dropped the job")),
            Err(_) => {
                warn!("rerank deadline of {:?} elapsed", deadline);
                Err(anyhow!("rerank deadline elapsed"))
            }
        }
    }
}

async fn score_job(
    encoder: &dyn CrossEncoder,
    query: &str,
    candidates: &[RerankCandidate],
) -> Result<Vec<f32>> {
    let mut scores = Vec::with_capacity(candidates.len());
    for batch in candidates.chunks(RERANK_BATCH) {
        let texts: Vec<String> = batch.iter().map(format_candidate).collect();
        let batch_scores = encoder.score_batch(query, &texts).await?;
        if batch_scores.len() != batch.len() {
            return Err(anyhow!(
                "cross-encoder returned {} scores for {} candidates",
                batch_scores.len(),
                batch.len()
            ));
        }
        scores.extend(batch_scores);
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use hindsight_models::LexicalCrossEncoder;

    struct FailingEncoder;

    #[async_trait]
    impl CrossEncoder for FailingEncoder {
        async fn score_batch(&self, _query: &str, _candidates: &[String]) -> Result<Vec<f32>> {
            Err(anyhow!("model crashed"))
        }
    }

    struct SlowEncoder;

    #[async_trait]
    impl CrossEncoder for SlowEncoder {
        async fn score_batch(&self, _query: &str, candidates: &[String]) -> Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(vec![0.5; candidates.len()])
        }
    }

    fn candidate(text: &str) -> RerankCandidate {
        RerankCandidate {
            text: text.into(),
            occurred_start: None,
            occurred_end: None,
        }
    }

    #[test]
    fn test_candidate_formatting() {
        let mut c = candidate("Went to Yosemite");
        assert_eq!(format_candidate(&c), "Went to Yosemite");

        c.occurred_start = Some(Utc.with_ymd_and_hms(2023, 6, 15, 0, 0, 0).unwrap());
        assert_eq!(format_candidate(&c), "Went to Yosemite (occurred 2023-06-15)");

        c.occurred_end = Some(Utc.with_ymd_and_hms(2023, 6, 18, 0, 0, 0).unwrap());
        assert_eq!(
            format_candidate(&c),
            "Went to Yosemite (occurred 2023-06-15 to 2023-06-18)"
        );
    }

    #[tokio::test]
    async fn test_worker_scores_in_candidate_order() {
        let handle = RerankHandle::spawn(Arc::new(LexicalCrossEncoder::new()));
        let scores = handle
            .rerank(
                "Does Alice have gym access at work?",
                vec![
                    candidate("Alice works at Google"),
                    candidate("Google's office in Mountain View has a gym"),
                ],
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores[0] > scores[1]);
    }

    #[tokio::test]
    async fn test_failure_propagates_for_fail_open_callers() {
        let handle = RerankHandle::spawn(Arc::new(FailingEncoder));
        let result = handle
            .rerank("query", vec![candidate("text")], Duration::from_secs(1))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_deadline_elapses_on_slow_model() {
        let handle = RerankHandle::spawn(Arc::new(SlowEncoder));
        let result = handle
            .rerank("query", vec![candidate("text")], Duration::from_millis(20))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_empty_candidates_short_circuit() {
        let handle = RerankHandle::spawn(Arc::new(LexicalCrossEncoder::new()));
        let scores = handle
            .rerank("query", Vec::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(scores.is_empty());
    }
}
