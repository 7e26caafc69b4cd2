#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};

use metaphor_pipeline::clients::{GenerationParams, InferenceApi, InferenceError, InferenceRequest};
use metaphor_pipeline::services::{ExternalCaller, RateLimiter, RateLimits, RetryPolicy};
use metaphor_pipeline::utils::ManualClock;
use metaphor_pipeline::workflow::{FlowSettings, MetaphorFlow, PacingStrategy};

pub const DETECTOR_MODEL: &str = "gemini-2.0-flash";
pub const VALIDATOR_MODEL: &str = "gemini-2.5-flash";

/// 足够长、能通过最短长度检查的文本
pub const SPEECH: &str = "Financial stability remains our priority. During the crisis, banks were \
forced into fire sales of assets, and the system came near collapse before policy makers acted \
to weather the downturn.";

type Responder = dyn Fn(&InferenceRequest) -> Result<String, InferenceError> + Send + Sync;

/// 按请求内容给出应答的假推理 API
pub struct ScriptedApi {
    responder: Box<Responder>,
    calls: AtomicU32,
    requests: Mutex<Vec<InferenceRequest>>,
}

impl ScriptedApi {
    pub fn new(
        responder: impl Fn(&InferenceRequest) -> Result<String, InferenceError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// 检测模型和验证模型各自固定返回一段文本
    pub fn by_model(detection: &str, validation: &str) -> Arc<Self> {
        let detection = detection.to_string();
        let validation = validation.to_string();
        Self::new(move |request| {
            if request.model == DETECTOR_MODEL {
                Ok(detection.clone())
            } else {
                Ok(validation.clone())
            }
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, model: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.model == model)
            .count()
    }
}

#[async_trait]
impl InferenceApi for ScriptedApi {
    async fn send(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        (self.responder)(request)
    }
}

pub fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 6, 2)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

pub fn manual_clock(start: NaiveDateTime) -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start))
}

pub fn retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(8),
    }
}

pub fn external_caller(
    api: Arc<ScriptedApi>,
    limits: RateLimits,
    clock: Arc<ManualClock>,
) -> ExternalCaller {
    let limiter = RateLimiter::starting_now(limits, clock);
    ExternalCaller::new(api, limiter, retry_policy(), Duration::from_secs(30))
}

pub fn flow(
    api: Arc<ScriptedApi>,
    limits: RateLimits,
    pacing: PacingStrategy,
    clock: Arc<ManualClock>,
) -> MetaphorFlow {
    let settings = FlowSettings {
        detector_model: DETECTOR_MODEL.to_string(),
        validator_model: VALIDATOR_MODEL.to_string(),
        params: GenerationParams::default(),
        pacing,
    };
    MetaphorFlow::new(external_caller(api, limits, clock), settings)
}

pub fn candidates_json(texts: &[&str]) -> String {
    let items: Vec<_> = texts
        .iter()
        .map(|t| serde_json::json!({"text": t, "context": format!("... {} ...", t)}))
        .collect();
    serde_json::json!({ "candidates": items }).to_string()
}

pub fn metaphors_json(texts: &[&str]) -> String {
    let items: Vec<_> = texts
        .iter()
        .map(|t| serde_json::json!({"text": t, "context": ""}))
        .collect();
    serde_json::json!({ "metaphors": items }).to_string()
}
