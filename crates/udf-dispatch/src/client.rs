use anyhow::{anyhow, Context};
use reqwest::{
    header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, LOCATION},
    redirect, RequestBuilder, Response, StatusCode, Url,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::{fmt, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use udf_core::{Error, ExecutionResult, JobStep, Result, TokenProvider, UdfData};
use udf_sandbox::TileXyz;

use crate::{
    config::RouterConfig,
    constants::{
        DEFAULT_DTYPE_RASTER, DEFAULT_DTYPE_VECTOR, ERROR_HEADER, LOCAL_CLIENT_ID,
        LOCAL_REALTIME_URL, METADATA_HEADER, RECURSION_HEADER,
    },
    decode::{DefaultDecoder, PayloadDecoder},
};

#[derive(Debug, Clone, Deserialize)]
struct RealtimeInstance {
    client_id: String,
    #[serde(default)]
    preference_rank: i64,
}

/// Parameters for the realtime service: containers and booleans travel as JSON text, everything
/// else as-is.
pub fn serialize_realtime_params(params: &Map<String, Value>) -> Map<String, Value> {
    params
        .iter()
        .map(|(k, v)| {
            let v = match v {
                Value::Array(_) | Value::Object(_) | Value::Bool(_) => Value::String(v.to_string()),
                other => other.clone(),
            };
            (k.clone(), v)
        })
        .collect()
}

/// Query-string form of [`serialize_realtime_params`]; nulls are left out.
pub fn query_pairs(params: &Map<String, Value>) -> Vec<(String, String)> {
    let mut pairs = vec![
        ("dtype_out_vector".to_string(), DEFAULT_DTYPE_VECTOR.to_string()),
        ("dtype_out_raster".to_string(), DEFAULT_DTYPE_RASTER.to_string()),
    ];
    for (k, v) in serialize_realtime_params(params) {
        match v {
            Value::Null => {}
            Value::String(s) => pairs.push((k, s)),
            other => pairs.push((k, other.to_string())),
        }
    }
    pairs
}

fn endpoint(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("parse base URL {base}"))?;
    url.path_segments_mut()
        .map_err(|()| anyhow!("base URL cannot carry a path: {base}"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn render_message(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn status_message(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {reason}", status.as_u16()),
        None => status.as_u16().to_string(),
    }
}

/// HTTP client for the compute service's realtime and job endpoints.
///
/// Redirects are not followed automatically; a single `location` hop is followed by hand.
#[derive(Clone)]
pub struct RealtimeClient {
    cfg: RouterConfig,
    http: reqwest::Client,
    auth: Arc<dyn TokenProvider>,
    decoder: Arc<dyn PayloadDecoder>,
    /// Automatically chosen client id, keyed by the session epoch it was looked up in.
    client_id: Arc<Mutex<Option<(u64, String)>>>,
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("base_url", &self.cfg.base_url)
            .finish_non_exhaustive()
    }
}

impl RealtimeClient {
    pub fn new(cfg: RouterConfig, auth: Arc<dyn TokenProvider>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .redirect(redirect::Policy::none())
            .build()
            .context("build realtime HTTP client")?;
        Ok(Self {
            cfg,
            http,
            auth,
            decoder: Arc::new(DefaultDecoder),
            client_id: Arc::new(Mutex::new(None)),
        })
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn PayloadDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.cfg
    }

    fn base(&self) -> &str {
        self.cfg.base_url.trim_end_matches('/')
    }

    /// Base URL of the realtime instance calls go to.
    pub async fn realtime_url(&self) -> Result<String> {
        match self.cfg.realtime_client_id.as_deref() {
            Some(LOCAL_CLIENT_ID) => Ok(LOCAL_REALTIME_URL.to_string()),
            Some(id) => Ok(format!("{}/realtime/{id}", self.base())),
            None => {
                let id = self.automatic_client_id().await?;
                Ok(format!("{}/realtime/{id}", self.base()))
            }
        }
    }

    async fn automatic_client_id(&self) -> Result<String> {
        let epoch = self.auth.session_epoch();
        let mut cached = self.client_id.lock().await;
        if let Some((seen, id)) = cached.as_ref() {
            if *seen == epoch {
                return Ok(id.clone());
            }
        }

        let url = endpoint(self.base(), &["realtime-instance", "available"])?;
        let req = self.auth.with_auth(self.http.get(url)).await?;
        let resp = req.send().await?;
        let resp = check_status(resp).await?;
        let instances: Vec<RealtimeInstance> = resp
            .json()
            .await
            .context("decode realtime instances")?;

        // First of the highest rank wins.
        let mut best: Option<RealtimeInstance> = None;
        for instance in instances {
            if best
                .as_ref()
                .map_or(true, |b| instance.preference_rank > b.preference_rank)
            {
                best = Some(instance);
            }
        }
        let id = best
            .map(|i| i.client_id)
            .ok_or_else(|| Error::config("Failed to detect realtime client ID"))?;
        tracing::info!(event = "udf.dispatch.client_id", client_id = %id);
        *cached = Some((epoch, id.clone()));
        Ok(id)
    }

    /// The signed-in user as the service sees them.
    pub async fn whoami(&self) -> Result<Value> {
        let url = endpoint(self.base(), &["user", "self"])?;
        let req = self.auth.with_auth(self.http.get(url)).await?;
        let resp = req.send().await?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await.context("decode /user/self")?)
    }

    /// Owner of saved definitions referenced without one.
    pub async fn owner_email(&self) -> Result<String> {
        if let Some(email) = self.auth.email().await {
            return Ok(email);
        }
        let me = self.whoami().await?;
        me.get("email")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::config("could not determine the signed-in user's email"))
    }

    /// Modules available on the remote runtime, keyed by module name.
    pub async fn dependency_whitelist(&self) -> Result<Value> {
        let url = endpoint(self.base(), &["internal", "dependency-whitelist"])?;
        let req = self.auth.with_auth(self.http.get(url)).await?;
        let resp = req.send().await?;
        let resp = check_status(resp).await?;
        Ok(resp
            .json()
            .await
            .context("decode dependency whitelist")?)
    }

    pub async fn run_saved_tile(
        &self,
        owner: &str,
        name: &str,
        tile: TileXyz,
        params: &Map<String, Value>,
    ) -> Result<Option<UdfData>> {
        let base = self.realtime_url().await?;
        let (x, y, z) = (tile.x.to_string(), tile.y.to_string(), tile.z.to_string());
        let url = endpoint(
            &base,
            &["api", "v1", "run", "udf", "saved", owner, name, "tiles", &z, &x, &y],
        )?;
        self.get_data(url, params, false).await
    }

    pub async fn run_saved_file(
        &self,
        owner: &str,
        name: &str,
        params: &Map<String, Value>,
    ) -> Result<Option<UdfData>> {
        let base = self.realtime_url().await?;
        let url = endpoint(&base, &["api", "v1", "run", "udf", "saved", owner, name])?;
        self.get_data(url, params, false).await
    }

    pub async fn run_shared_tile(
        &self,
        token: &str,
        tile: TileXyz,
        params: &Map<String, Value>,
    ) -> Result<Option<UdfData>> {
        let (x, y, z) = (tile.x.to_string(), tile.y.to_string(), tile.z.to_string());
        let url = endpoint(
            self.base(),
            &["realtime-shared", token, "run", "tiles", &z, &x, &y],
        )?;
        self.get_data(url, params, true).await
    }

    pub async fn run_shared_file(
        &self,
        token: &str,
        params: &Map<String, Value>,
    ) -> Result<Option<UdfData>> {
        let url = endpoint(self.base(), &["realtime-shared", token, "run", "file"])?;
        self.get_data(url, params, true).await
    }

    /// Run an in-memory job step on a realtime instance, against one tile or the whole input.
    pub async fn run_step(
        &self,
        step: &JobStep,
        tile: Option<TileXyz>,
        params: &Map<String, Value>,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let base = self.realtime_url().await?;
        let url = match tile {
            Some(tile) => {
                let (x, y, z) = (tile.x.to_string(), tile.y.to_string(), tile.z.to_string());
                endpoint(&base, &["api", "v1", "run", "udf", "tiles", &z, &x, &y])?
            }
            None => endpoint(&base, &["api", "v1", "run", "udf"])?,
        };

        let mut step = step.clone();
        step.udf
            .parameters
            .extend(serialize_realtime_params(params));
        let body = json!({
            "data_left": null,
            "data_right": null,
            "step_config": serde_json::to_string(&step.step_config())?,
            "dtype_in": "json",
            "dtype_out_vector": DEFAULT_DTYPE_VECTOR,
            "dtype_out_raster": DEFAULT_DTYPE_RASTER,
        });

        let req = self.authorize(self.http.post(url).json(&body), false).await?;
        let resp = self.send(req).await?;
        self.read_execution_result(resp, started).await
    }

    /// Submit a job step to the batch engine. Returns the service's job record.
    pub async fn submit_batch(&self, step: &JobStep, params: &Map<String, Value>) -> Result<Value> {
        let mut step = step.clone();
        step.udf.parameters.extend(params.clone());

        let url = endpoint(self.base(), &["run"])?;
        let body = json!({ "config": { "steps": [step.step_config()] } });
        let req = self.auth.with_auth(self.http.post(url).json(&body)).await?;
        let resp = req.send().await?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await.context("decode job status")?)
    }

    async fn authorize(&self, req: RequestBuilder, missing_ok: bool) -> Result<RequestBuilder> {
        let req = req.header(RECURSION_HEADER, self.cfg.recursion_depth.to_string());
        if !missing_ok {
            return self.auth.with_auth(req).await;
        }
        match self.auth.current_token().await {
            Ok(token) => Ok(req.header(AUTHORIZATION, token.header_value())),
            Err(err) => {
                tracing::debug!(event = "udf.dispatch.anonymous", reason = %err);
                Ok(req)
            }
        }
    }

    async fn get_data(
        &self,
        url: Url,
        params: &Map<String, Value>,
        missing_ok: bool,
    ) -> Result<Option<UdfData>> {
        let req = self
            .authorize(self.http.get(url).query(&query_pairs(params)), missing_ok)
            .await?;
        let resp = self.send(req).await?;
        let resp = check_status(resp).await?;
        self.read_data(resp).await
    }

    /// Send `req`, following at most one redirect by hand.
    ///
    /// A 307 or 308 replays the original method, headers and body. Any other redirect becomes a
    /// GET that keeps the recursion header, and the credential only when the target has the same
    /// origin.
    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let request = req.build()?;
        let replay = request.try_clone();
        let resp = self.http.execute(request).await?;

        let status = resp.status();
        if !status.is_redirection() {
            return Ok(resp);
        }
        let Some(location) = header_str(resp.headers(), LOCATION.as_str()) else {
            return Ok(resp);
        };
        let target = resp
            .url()
            .join(&location)
            .context("resolve redirect location")?;
        let Some(mut original) = replay else {
            return Ok(resp);
        };
        tracing::debug!(event = "udf.dispatch.redirect", status = status.as_u16(), target = %target);

        let next = if matches!(
            status,
            StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
        ) {
            *original.url_mut() = target;
            original
        } else {
            let same_origin = original.url().origin() == target.origin();
            let mut get = self.http.get(target);
            if let Some(depth) = original.headers().get(RECURSION_HEADER) {
                get = get.header(RECURSION_HEADER, depth.clone());
            }
            if same_origin {
                if let Some(auth) = original.headers().get(AUTHORIZATION) {
                    get = get.header(AUTHORIZATION, auth.clone());
                }
            }
            get.build()?
        };
        Ok(self.http.execute(next).await?)
    }

    async fn read_data(&self, resp: Response) -> Result<Option<UdfData>> {
        let status = resp.status().as_u16();
        let content_type = header_str(resp.headers(), CONTENT_TYPE.as_str())
            .map(|ct| ct.split(';').next().unwrap_or_default().trim().to_string());
        let bytes = resp.bytes().await.context("read response body")?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let payload = self
            .decoder
            .decode(content_type.as_deref(), bytes.to_vec())
            .map_err(|message| Error::Remote {
                status,
                message,
                payload: None,
            })?;
        Ok(Some(UdfData::Payload(payload)))
    }

    /// Job-step responses carry the worker's log in a header, on success and on failure.
    async fn read_execution_result(&self, resp: Response, started: Instant) -> Result<ExecutionResult> {
        let status = resp.status();
        let meta = match header_str(resp.headers(), METADATA_HEADER) {
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(meta)) => meta,
                _ => {
                    return Err(Error::Remote {
                        status: status.as_u16(),
                        message: format!("malformed {METADATA_HEADER} header: {raw}"),
                        payload: None,
                    })
                }
            },
            None => Map::new(),
        };
        let text = |key: &str| meta.get(key).and_then(Value::as_str).map(str::to_string);

        let mut result = ExecutionResult {
            stdout: text("stdout").unwrap_or_default(),
            stderr: text("stderr").unwrap_or_default(),
            exception_class: text("exception_class"),
            has_exception: meta
                .get("has_exception")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            error_lineno: meta
                .get("lineno")
                .and_then(Value::as_u64)
                .and_then(|l| u32::try_from(l).ok()),
            ..Default::default()
        };

        if status == StatusCode::OK {
            result.data = self.read_data(resp).await?;
            result.time_taken = Some(started.elapsed());
            return Ok(result);
        }

        let errormsg = text("errormsg").filter(|s| !s.is_empty());
        let exception = text("exception").filter(|s| !s.is_empty());
        let message = match (errormsg, exception) {
            (Some(errormsg), _) => {
                let chunk = meta.get("chunkinfo").map(render_message).unwrap_or_default();
                let line = meta.get("lineno").map(render_message).unwrap_or_default();
                format!("The UDF returned the following error for chunk {chunk} in line {line}:\n{errormsg}")
            }
            (None, Some(exception)) => exception,
            (None, None) => {
                let body = resp.text().await.unwrap_or_default();
                serde_json::from_str::<Value>(&body)
                    .ok()
                    .and_then(|v| v.get("detail").map(render_message))
                    .unwrap_or(body)
            }
        };
        result.error_message = Some(message);
        result.time_taken = Some(started.elapsed());
        Ok(result)
    }
}

/// Map an error response to the richest error available.
///
/// The error header wins, then a worker-process log in the metadata header, then a JSON body
/// with `detail` or `message`, then the status line.
pub async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if !status.is_client_error() && !status.is_server_error() {
        return Ok(resp);
    }
    let code = status.as_u16();

    if let Some(message) = header_str(resp.headers(), ERROR_HEADER) {
        return Err(Error::Remote {
            status: code,
            message,
            payload: None,
        });
    }

    if let Some(raw) = header_str(resp.headers(), METADATA_HEADER) {
        return Err(match serde_json::from_str::<Value>(&raw) {
            Ok(meta) => {
                let stream = |key: &str| {
                    meta.get(key)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                Error::RemoteChild {
                    status: code,
                    stdout: stream("stdout"),
                    stderr: stream("stderr"),
                }
            }
            Err(_) => Error::Remote {
                status: code,
                message: raw,
                payload: None,
            },
        });
    }

    let body = resp.text().await.unwrap_or_default();
    let payload = serde_json::from_str::<Value>(&body).ok();
    let message = payload
        .as_ref()
        .and_then(|v| v.get("detail").or_else(|| v.get("message")))
        .map(render_message)
        .unwrap_or_else(|| status_message(status));
    Err(Error::Remote {
        status: code,
        message,
        payload,
    })
}
