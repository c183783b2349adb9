use async_trait::async_trait;
use rand::Rng;
use serde_json::{Value, json};
use std::time::Duration;

use crate::api::{RemoteBackend, TaskState, TaskStatus};
use crate::config::{Config, RetryConfig};
use crate::error::{PipelineError, Result};
use crate::{logi, logw};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const CREATE_TASK_PATH: &str = "/api/v1/jobs/createTask";
const RECORD_INFO_PATH: &str = "/api/v1/jobs/recordInfo";
const UPLOAD_PATH: &str = "/api/file-stream-upload";

/// Deterministic backoff schedule: base delay doubling per attempt, capped.
/// Attempt numbering starts at 1.
pub fn backoff_delay(attempt: u32, retry: &RetryConfig) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let secs = retry.base_delay_secs * f64::from(1u32 << exp);
    Duration::from_secs_f64(secs.min(retry.max_delay_secs))
}

/// Add up to 25% jitter, but never past the cap; at the cap the delay stays
/// fixed so consecutive delays never shrink.
fn jittered(delay: Duration, retry: &RetryConfig) -> Duration {
    let cap = Duration::from_secs_f64(retry.max_delay_secs);
    if delay >= cap {
        return cap;
    }
    let extra = delay.as_secs_f64() * rand::thread_rng().gen_range(0.0..0.25);
    (delay + Duration::from_secs_f64(extra)).min(cap)
}

/// Retry-After seconds from a header value. Malformed, negative, or
/// non-finite values are ignored rather than fed into a sleep.
fn parse_retry_after(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
}

/// Run a fallible operation with exponential backoff. Non-retryable errors
/// propagate immediately without consuming the retry budget; once the budget
/// is spent the last cause comes back wrapped in `ExhaustedRetries`.
pub async fn retry_with_backoff<T, F, Fut>(retry: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= retry.max_attempts {
            return Err(PipelineError::ExhaustedRetries {
                attempts: attempt,
                source: Box::new(err),
            });
        }
        // A server-provided Retry-After overrides the computed schedule,
        // bounded to the same cap as the backoff.
        let delay = match &err {
            PipelineError::RateLimited {
                retry_after: Some(secs),
            } => Duration::from_secs_f64(secs.max(0.0).min(retry.max_delay_secs)),
            _ => jittered(backoff_delay(attempt, retry), retry),
        };
        logw(format!(
            "{err}; retrying in {:.1}s (attempt {attempt}/{})",
            delay.as_secs_f64(),
            retry.max_attempts
        ));
        tokio::time::sleep(delay).await;
    }
}

/// Extract a task id from a task-creation response, tolerating both the
/// nested (`data.task_id`) and flat envelopes and both id spellings.
pub fn parse_task_id(body: &Value) -> Result<String> {
    let candidates = [body.get("data").filter(|v| v.is_object()), Some(body)];
    for scope in candidates.into_iter().flatten() {
        for key in ["task_id", "taskId"] {
            if let Some(id) = scope.get(key).and_then(Value::as_str) {
                return Ok(id.to_string());
            }
        }
    }
    Err(PipelineError::BadResponse(format!(
        "no task id in response: {body}"
    )))
}

/// Normalize a poll response. The upstream API answers with either a nested
/// `data` object or a flat top-level object, and spreads the result URL over
/// `resultJson.resultUrls`, `output.video_url`/`output.image_url`, or a bare
/// `output` string depending on model family. Everything collapses to one
/// shape here; nothing upstream branches on envelope again.
pub fn parse_task_status(body: &Value) -> TaskStatus {
    let task = body
        .get("data")
        .filter(|v| v.is_object())
        .unwrap_or(body);

    let task_id = task
        .get("taskId")
        .or_else(|| task.get("task_id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let raw_state = task
        .get("state")
        .or_else(|| task.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    let mut result_url = task
        .get("resultJson")
        .and_then(Value::as_str)
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|parsed| {
            parsed
                .get("resultUrls")
                .and_then(Value::as_array)
                .and_then(|urls| urls.first().cloned())
                .and_then(|v| v.as_str().map(str::to_string))
        });

    if result_url.is_none() {
        result_url = match task.get("output") {
            Some(Value::Object(output)) => output
                .get("video_url")
                .or_else(|| output.get("image_url"))
                .and_then(Value::as_str)
                .map(str::to_string),
            Some(Value::String(url)) if !url.is_empty() => Some(url.clone()),
            _ => None,
        };
    }

    let error = match task.get("error") {
        Some(Value::Object(err)) => err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        Some(Value::String(msg)) if !msg.is_empty() => Some(msg.clone()),
        _ => None,
    };

    TaskStatus {
        task_id,
        state: TaskState::from_raw(raw_state),
        result_url,
        error,
    }
}

/// Client for the KIE.ai generation API. Holds one HTTP connection pool for
/// the process lifetime; dropping the client releases it.
pub struct KieClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    upload_base_url: String,
    retry: RetryConfig,
}

impl KieClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .gzip(true)
            .build()?;
        Ok(Self {
            http,
            api_key: config.api.api_key.clone(),
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            upload_base_url: config.api.upload_base_url.trim_end_matches('/').to_string(),
            retry: config.retry.clone(),
        })
    }

    /// Map an HTTP response onto the error taxonomy. Consumes the body on
    /// failure so the cause carries the server's message.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.is_server_error() {
            return Err(PipelineError::Server {
                status: status.as_u16(),
            });
        }
        match status.as_u16() {
            401 => Err(PipelineError::Auth(snippet(response).await)),
            402 => Err(PipelineError::Quota(snippet(response).await)),
            422 => Err(PipelineError::Validation(snippet(response).await)),
            429 => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                Err(PipelineError::RateLimited { retry_after })
            }
            code => Err(PipelineError::BadResponse(format!(
                "HTTP {code}: {}",
                snippet(response).await
            ))),
        }
    }

    async fn execute_with_retry<F>(&self, mut make: F) -> Result<reqwest::Response>
    where
        F: FnMut() -> reqwest::RequestBuilder,
    {
        retry_with_backoff(&self.retry, || {
            let request = make();
            async move {
                let response = request.send().await?;
                Self::check(response).await
            }
        })
        .await
    }

}

async fn snippet(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    text.chars().take(300).collect()
}

#[async_trait]
impl RemoteBackend for KieClient {
    async fn submit(&self, request: &Value) -> Result<String> {
        let url = format!("{}{CREATE_TASK_PATH}", self.base_url);
        let response = self
            .execute_with_retry(|| {
                self.http
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(request)
                    .timeout(REQUEST_TIMEOUT)
            })
            .await?;

        let body: Value = response.json().await?;
        tracing::debug!(%body, "createTask response");
        // Some failures come back as HTTP 200 with an application-level code.
        if let Some(code) = body.get("code").and_then(Value::as_i64) {
            if code != 200 {
                let message = body
                    .get("message")
                    .or_else(|| body.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(match code {
                    401 => PipelineError::Auth(message.to_string()),
                    402 => PipelineError::Quota(message.to_string()),
                    422 => PipelineError::Validation(message.to_string()),
                    _ => PipelineError::BadResponse(format!("API code {code}: {message}")),
                });
            }
        }
        parse_task_id(&body)
    }

    async fn poll(&self, task_id: &str) -> Result<TaskStatus> {
        let url = format!("{}{RECORD_INFO_PATH}", self.base_url);
        let response = self
            .execute_with_retry(|| {
                self.http
                    .get(&url)
                    .query(&[("taskId", task_id)])
                    .bearer_auth(&self.api_key)
                    .timeout(REQUEST_TIMEOUT)
            })
            .await?;
        let body: Value = response.json().await?;
        tracing::debug!(%body, "recordInfo response");
        Ok(parse_task_status(&body))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .execute_with_retry(|| self.http.get(url).timeout(DOWNLOAD_TIMEOUT))
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Push file bytes to remote storage; the returned URL stays valid for
    /// roughly three days.
    async fn upload(&self, bytes: Vec<u8>, filename: &str) -> Result<String> {
        let url = format!("{}{UPLOAD_PATH}", self.upload_base_url);
        let response = self
            .execute_with_retry(|| {
                let part = reqwest::multipart::Part::bytes(bytes.clone())
                    .file_name(filename.to_string());
                let form = reqwest::multipart::Form::new()
                    .part("file", part)
                    .text("uploadPath", "elements");
                self.http
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .multipart(form)
                    .timeout(REQUEST_TIMEOUT)
            })
            .await?;

        let body: Value = response.json().await?;
        let ok = body.get("success").and_then(Value::as_bool).unwrap_or(false)
            || body.get("code").and_then(Value::as_i64) == Some(200);
        if !ok {
            return Err(PipelineError::BadResponse(format!(
                "upload rejected: {body}"
            )));
        }
        let file_url = body
            .get("data")
            .and_then(|data| {
                data.get("fileUrl")
                    .or_else(|| data.get("downloadUrl"))
                    .and_then(Value::as_str)
            })
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::BadResponse(format!("no file URL in upload response: {body}"))
            })?;
        logi(format!("Uploaded {filename} -> {file_url}"));
        Ok(file_url)
    }
}

/// Payload for a single reference-image generation task.
pub fn image_task_body(prompt: &str, negative_prompt: &str, aspect_ratio: &str) -> Value {
    json!({
        "model": "kling-3.0/image",
        "task_type": "image_generation",
        "input": {
            "prompt": prompt,
            "negative_prompt": negative_prompt,
            "aspect_ratio": aspect_ratio,
        },
    })
}

/// One shot inside a multi-shot request.
#[derive(Debug, Clone)]
pub struct ShotPrompt {
    pub prompt: String,
    pub duration: u32,
}

/// A named element reference attached to a video request.
#[derive(Debug, Clone)]
pub struct ElementRef {
    pub name: String,
    pub description: String,
    pub image_urls: Vec<String>,
}

/// Payload for a multi-shot video generation task. Limits are enforced by
/// the scene chunker before this is built.
pub fn multi_shot_task_body(
    shots: &[ShotPrompt],
    elements: &[ElementRef],
    negative_prompt: &str,
    mode: &str,
    aspect_ratio: &str,
    cfg_scale: f64,
) -> Value {
    let total_duration: u32 = shots.iter().map(|s| s.duration).sum();
    let multi_prompt: Vec<Value> = shots
        .iter()
        .map(|s| json!({"prompt": s.prompt, "duration": s.duration}))
        .collect();

    let mut input = json!({
        "sound": true,
        "duration": total_duration.to_string(),
        "aspect_ratio": aspect_ratio,
        "mode": mode,
        "cfg_scale": cfg_scale,
        "negative_prompt": negative_prompt,
        "multi_shots": true,
        "multi_prompt": multi_prompt,
    });

    let with_images: Vec<&ElementRef> =
        elements.iter().filter(|e| !e.image_urls.is_empty()).collect();
    if !with_images.is_empty() {
        let kling_elements: Vec<Value> = with_images
            .iter()
            .map(|e| {
                json!({
                    "name": e.name,
                    "description": if e.description.is_empty() { &e.name } else { &e.description },
                    "element_input_urls": e.image_urls,
                })
            })
            .collect();
        input["kling_elements"] = Value::Array(kling_elements);
        input["image_urls"] = json!([with_images[0].image_urls[0]]);
    }

    json!({
        "model": "kling-3.0/video",
        "input": input,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_cfg() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            base_delay_secs: 2.0,
            max_delay_secs: 60.0,
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let retry = retry_cfg();
        assert_eq!(backoff_delay(1, &retry), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, &retry), Duration::from_secs(4));
        assert_eq!(backoff_delay(3, &retry), Duration::from_secs(8));
        assert_eq!(backoff_delay(6, &retry), Duration::from_secs(60));
        assert_eq!(backoff_delay(20, &retry), Duration::from_secs(60));
    }

    #[test]
    fn backoff_is_monotonic() {
        let retry = retry_cfg();
        let mut last = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = backoff_delay(attempt, &retry);
            assert!(delay >= last, "attempt {attempt} shrank the delay");
            last = delay;
        }
    }

    #[test]
    fn jitter_never_exceeds_cap_or_shrinks() {
        let retry = retry_cfg();
        for attempt in 1..=12 {
            let base = backoff_delay(attempt, &retry);
            for _ in 0..50 {
                let delayed = jittered(base, &retry);
                assert!(delayed >= base);
                assert!(delayed <= Duration::from_secs_f64(retry.max_delay_secs));
            }
        }
    }

    #[test]
    fn retry_after_rejects_negative_and_non_finite_values() {
        assert_eq!(parse_retry_after("2.5"), Some(2.5));
        assert_eq!(parse_retry_after(" 30 "), Some(30.0));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("inf"), None);
        assert_eq!(parse_retry_after("NaN"), None);
        assert_eq!(parse_retry_after("soon"), None);
    }

    // Zero delays keep the loop tests fast without touching the semantics.
    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            base_delay_secs: 0.0,
            max_delay_secs: 0.0,
        }
    }

    #[tokio::test]
    async fn non_retryable_error_consumes_one_attempt() {
        let calls = std::cell::Cell::new(0u32);
        let err = retry_with_backoff(&fast_retry(), || {
            calls.set(calls.get() + 1);
            async { Err::<(), _>(PipelineError::Auth("bad key".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::Auth(_)));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_wraps_last_cause_after_max_attempts() {
        let calls = std::cell::Cell::new(0u32);
        let err = retry_with_backoff(&fast_retry(), || {
            calls.set(calls.get() + 1);
            async { Err::<(), _>(PipelineError::Server { status: 503 }) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.get(), 5);
        match err {
            PipelineError::ExhaustedRetries { attempts, source } => {
                assert_eq!(attempts, 5);
                assert!(matches!(*source, PipelineError::Server { status: 503 }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn hostile_retry_after_does_not_derail_the_loop() {
        let calls = std::cell::Cell::new(0u32);
        let value = retry_with_backoff(&fast_retry(), || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    Err(PipelineError::RateLimited {
                        retry_after: Some(-1.0),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn task_id_from_nested_envelope() {
        let body = serde_json::json!({"code": 200, "data": {"task_id": "abc-1"}});
        assert_eq!(parse_task_id(&body).unwrap(), "abc-1");
    }

    #[test]
    fn task_id_from_flat_envelope_camel_case() {
        let body = serde_json::json!({"taskId": "abc-2"});
        assert_eq!(parse_task_id(&body).unwrap(), "abc-2");
    }

    #[test]
    fn missing_task_id_is_an_error() {
        let body = serde_json::json!({"code": 200, "data": {}});
        assert!(matches!(
            parse_task_id(&body),
            Err(PipelineError::BadResponse(_))
        ));
    }

    #[test]
    fn status_from_nested_envelope_with_result_json() {
        let body = serde_json::json!({
            "code": 200,
            "data": {
                "taskId": "t-9",
                "state": "success",
                "resultJson": "{\"resultUrls\": [\"https://cdn.example/v.mp4\"]}",
            }
        });
        let status = parse_task_status(&body);
        assert_eq!(status.task_id, "t-9");
        assert_eq!(status.state, TaskState::Completed);
        assert_eq!(
            status.result_url.as_deref(),
            Some("https://cdn.example/v.mp4")
        );
    }

    #[test]
    fn status_from_flat_envelope_with_output_object() {
        let body = serde_json::json!({
            "task_id": "t-10",
            "status": "completed",
            "output": {"video_url": "https://cdn.example/out.mp4"},
        });
        let status = parse_task_status(&body);
        assert_eq!(status.task_id, "t-10");
        assert_eq!(status.state, TaskState::Completed);
        assert_eq!(
            status.result_url.as_deref(),
            Some("https://cdn.example/out.mp4")
        );
    }

    #[test]
    fn status_failure_carries_error_message() {
        let nested = serde_json::json!({
            "data": {"task_id": "t-11", "state": "fail", "error": {"message": "nsfw rejected"}}
        });
        let status = parse_task_status(&nested);
        assert_eq!(status.state, TaskState::Failed);
        assert_eq!(status.error.as_deref(), Some("nsfw rejected"));

        let flat = serde_json::json!({"task_id": "t-12", "status": "failed", "error": "boom"});
        assert_eq!(parse_task_status(&flat).error.as_deref(), Some("boom"));
    }

    #[test]
    fn multi_shot_body_shape() {
        let shots = vec![
            ShotPrompt {
                prompt: "a".into(),
                duration: 5,
            },
            ShotPrompt {
                prompt: "b".into(),
                duration: 10,
            },
        ];
        let elements = vec![ElementRef {
            name: "Hero".into(),
            description: String::new(),
            image_urls: vec!["https://cdn.example/hero1.png".into()],
        }];
        let body = multi_shot_task_body(&shots, &elements, "blurry", "pro", "16:9", 0.5);
        assert_eq!(body["input"]["duration"], "15");
        assert_eq!(body["input"]["multi_shots"], true);
        assert_eq!(body["input"]["multi_prompt"].as_array().unwrap().len(), 2);
        // Description falls back to the element name.
        assert_eq!(body["input"]["kling_elements"][0]["description"], "Hero");
        assert_eq!(
            body["input"]["image_urls"][0],
            "https://cdn.example/hero1.png"
        );
    }

    #[test]
    fn elements_without_images_are_dropped_from_body() {
        let shots = vec![ShotPrompt {
            prompt: "a".into(),
            duration: 5,
        }];
        let elements = vec![ElementRef {
            name: "Ghost".into(),
            description: "no refs yet".into(),
            image_urls: vec![],
        }];
        let body = multi_shot_task_body(&shots, &elements, "", "std", "9:16", 0.5);
        assert!(body["input"].get("kling_elements").is_none());
    }
}
