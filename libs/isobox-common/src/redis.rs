use crate::types::{JobRequest, JobResult, JobState};
use redis::{AsyncCommands, RedisResult};

/// Queue boundary keys. API, CLI and worker all derive names from here.
pub const QUEUE_KEY: &str = "isobox:queue";
pub const RESULT_PREFIX: &str = "isobox:result";
pub const STATUS_PREFIX: &str = "isobox:status";
pub const CANCEL_PREFIX: &str = "isobox:cancel";

/// Results and status expire after 24 hours
pub const RESULT_TTL_SECS: u64 = 86400;

pub fn result_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

pub fn status_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

pub fn cancel_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", CANCEL_PREFIX, job_id)
}

fn encode_err(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

fn decode_err(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
}

/// RPUSH onto the shared queue (FIFO with BLPOP on the other end).
pub async fn push_job(conn: &mut redis::aio::ConnectionManager, job: &JobRequest) -> RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(encode_err)?;
    let _: () = conn.rpush(QUEUE_KEY, payload).await?;
    set_status(conn, &job.id, JobState::Ready).await
}

/// BLPOP with a timeout so callers can observe shutdown between polls.
pub async fn pop_job(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<JobRequest>> {
    let result: Option<(String, String)> = conn.blpop(QUEUE_KEY, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let job: JobRequest = serde_json::from_str(&payload).map_err(decode_err)?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

pub async fn set_status(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
    state: JobState,
) -> RedisResult<()> {
    let _: () = conn.set_ex(status_key(job_id), state.to_string(), RESULT_TTL_SECS).await?;
    Ok(())
}

pub async fn get_status(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
) -> RedisResult<Option<String>> {
    conn.get(status_key(job_id)).await
}

/// Publish a terminal result. The status key is written last so a reader that
/// sees a terminal status can always fetch the result.
pub async fn store_result(conn: &mut redis::aio::ConnectionManager, result: &JobResult) -> RedisResult<()> {
    let payload = serde_json::to_string(result).map_err(encode_err)?;
    let _: () = conn.set_ex(result_key(&result.job_id), payload, RESULT_TTL_SECS).await?;
    set_status(conn, &result.job_id, result.state).await?;
    let _: () = conn.del(cancel_key(&result.job_id)).await?;
    Ok(())
}

pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
) -> RedisResult<Option<JobResult>> {
    let payload: Option<String> = conn.get(result_key(job_id)).await?;

    match payload {
        Some(data) => {
            let result: JobResult = serde_json::from_str(&data).map_err(decode_err)?;
            Ok(Some(result))
        }
        None => Ok(None),
    }
}

pub async fn cancel_job(conn: &mut redis::aio::ConnectionManager, job_id: &uuid::Uuid) -> RedisResult<()> {
    let _: () = conn.set_ex(cancel_key(job_id), "1", RESULT_TTL_SECS).await?;
    Ok(())
}

pub async fn is_job_cancelled(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
) -> RedisResult<bool> {
    conn.exists(cancel_key(job_id)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_result_key_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(result_key(&id), result_key(&id));
        assert!(result_key(&id).starts_with("isobox:result:"));
    }

    #[test]
    fn test_status_and_cancel_keys() {
        let id = Uuid::new_v4();
        assert_eq!(status_key(&id), format!("isobox:status:{}", id));
        assert_eq!(cancel_key(&id), format!("isobox:cancel:{}", id));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_queue_round_trip() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let mut conn = redis::aio::ConnectionManager::new(client).await.unwrap();

        let job: JobRequest = serde_json::from_str(
            r#"{"language": "python", "files": [{"name": "main.py", "content": "print(1)"}]}"#,
        )
        .unwrap();
        push_job(&mut conn, &job).await.unwrap();
        assert_eq!(get_status(&mut conn, &job.id).await.unwrap().as_deref(), Some("READY"));

        cancel_job(&mut conn, &job.id).await.unwrap();
        assert!(is_job_cancelled(&mut conn, &job.id).await.unwrap());
    }
}
