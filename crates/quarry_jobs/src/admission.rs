//! Admission control: storage quota and concurrent job ceilings.

use quarry_protocol::Identity;
use tracing::debug;

use crate::config::QueryConfig;
use crate::error::{JobError, Result};
use crate::store::JobStore;

/// Fail on "query" when the owner's completed results exceed their quota.
pub async fn check_quota(
    config: &QueryConfig,
    store: &JobStore,
    owner: Option<&Identity>,
) -> Result<()> {
    let quota = config.quota_for(owner);
    if quota.is_unlimited() {
        return Ok(());
    }

    let used = store
        .owner_result_size(owner.map(|o| o.username.as_str()))
        .await?;
    debug!(used, quota = quota.get(), "Quota check");
    if used.max(0) as u64 > quota.get() {
        return Err(JobError::validation("query", "Quota is exceeded. Please archive some of your jobs."));
    }
    Ok(())
}

/// Fail on "query" when the owner already has the maximum number of
/// queued or executing jobs.
pub async fn check_active_jobs(
    config: &QueryConfig,
    store: &JobStore,
    owner: Option<&Identity>,
) -> Result<()> {
    let ceiling = config.max_active_jobs_for(owner);
    if ceiling.is_unlimited() {
        return Ok(());
    }

    let active = store
        .count_active_jobs(owner.map(|o| o.username.as_str()))
        .await?;
    debug!(active, ceiling = ceiling.get(), "Active job check");
    if active.max(0) as u64 >= ceiling.get() {
        return Err(JobError::validation(
            "query",
            "Too many active jobs. Please abort some of your active jobs or wait until they are completed.",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limit;
    use crate::models::{JobRecord, QueryDetails, QueryMetadata};
    use quarry_protocol::{JobType, Phase};

    async fn job_in(store: &JobStore, owner: Option<Identity>, phase: Phase) -> JobRecord {
        let job = JobRecord::new(JobType::Query, owner);
        let details = QueryDetails {
            schema_name: "s".into(),
            table_name: job.id.to_string(),
            ..QueryDetails::default()
        };
        store.save_query_job(&job, &details).await.unwrap();
        if phase != Phase::Pending {
            store.transition(&job.id, &[Phase::Pending], phase).await.unwrap();
        }
        job
    }

    #[tokio::test]
    async fn test_active_job_ceiling() {
        let store = JobStore::open_in_memory().await.unwrap();
        let mut config = QueryConfig::default();
        config.max_active_jobs.user = Limit(2);
        let alice = Identity::new("alice");

        check_active_jobs(&config, &store, Some(&alice)).await.unwrap();
        job_in(&store, Some(alice.clone()), Phase::Queued).await;
        check_active_jobs(&config, &store, Some(&alice)).await.unwrap();
        job_in(&store, Some(alice.clone()), Phase::Executing).await;

        let err = check_active_jobs(&config, &store, Some(&alice)).await.unwrap_err();
        assert!(err.is_validation_on("query"));
        // other identities are unaffected
        check_active_jobs(&config, &store, Some(&Identity::new("bob"))).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_means_unlimited() {
        let store = JobStore::open_in_memory().await.unwrap();
        let mut config = QueryConfig::default();
        config.max_active_jobs.anonymous = Limit::UNLIMITED;
        config.quota.anonymous = Limit::UNLIMITED;
        for _ in 0..3 {
            job_in(&store, None, Phase::Queued).await;
        }
        check_active_jobs(&config, &store, None).await.unwrap();
        check_quota(&config, &store, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_quota_counts_completed_results() {
        let store = JobStore::open_in_memory().await.unwrap();
        let mut config = QueryConfig::default();
        config.quota.user = Limit(1000);
        let alice = Identity::new("alice");

        let job = job_in(&store, Some(alice.clone()), Phase::Executing).await;
        store
            .complete_query_job(&job.id, 1, 1000, &QueryMetadata::default())
            .await
            .unwrap();
        check_quota(&config, &store, Some(&alice)).await.unwrap();

        let job = job_in(&store, Some(alice.clone()), Phase::Executing).await;
        store
            .complete_query_job(&job.id, 1, 1, &QueryMetadata::default())
            .await
            .unwrap();
        let err = check_quota(&config, &store, Some(&alice)).await.unwrap_err();
        assert!(err.is_validation_on("query"));
    }
}
