use crate::backend::cyclestreets::{plan, JourneyResponse};
use crate::backend::http::{classify_reqwest_error, classify_status, endpoint, retry_after, send_json};
use crate::errors::{BackendError, RoutingError};
use crate::quota::QuotaTracker;
use crate::route::{Route, RouteRequest};
use common::types::backend::CycleStreetsBatch;
use common::types::PairId;
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, JsonValue};
use log::{debug, info, warn};
use polars::frame::DataFrame;
use polars::prelude::{CsvReadOptions, SerReader, StringChunked};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;
use std::io::Cursor;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{sleep, Instant};
use url::Url;

/// Routes batches as CycleStreets batch jobs: the desire lines are uploaded as a job, the job is
/// started and polled until it completes, then its results are downloaded as (possibly gzipped)
/// CSV with the journey of each pair in the `json` column.
pub struct BatchJobs {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    username: String,
    password: String,
    batch_size: usize,
    poll_interval: Duration,
    request_timeout: Duration,
    job_timeout: Duration,
    server_id: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JobId {
    Number(u64),
    Text(String),
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobId::Number(id) => write!(f, "{}", id),
            JobId::Text(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedJob {
    id: Option<JobId>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobData {
    status: Option<String>,
    #[serde(rename = "dataGz")]
    data_url: Option<String>,
    error: Option<String>,
}

/// A job created on the server. Unless its results were fetched, it is terminated when dropped,
/// also when the caller stops waiting for it.
struct RunningJob<'a> {
    jobs: &'a BatchJobs,
    id: JobId,
    done: bool,
}

impl RunningJob<'_> {
    async fn terminate(mut self) {
        self.done = true;
        let request = match self.jobs.control(&self.id, "terminate") {
            Ok(request) => request,
            Err(err) => {
                warn!(target: "backend", "Can't terminate batch job {}: {}", self.id, err);
                return;
            }
        };
        terminate(request, self.id.to_string()).await;
    }
}

impl Drop for RunningJob<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Ok(request) = self.jobs.control(&self.id, "terminate") else {
            return;
        };
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(terminate(request, self.id.to_string()));
            }
            Err(_) => warn!(target: "backend", "Batch job {} was abandoned and is still running", self.id),
        }
    }
}

async fn terminate(request: reqwest::RequestBuilder, job: String) {
    match request.send().await.and_then(|response| response.error_for_status()) {
        Ok(_) => info!(target: "backend", "Terminated batch job {}", job),
        Err(err) => warn!(target: "backend", "Terminating batch job {} failed: {}", job, err),
    }
}

impl BatchJobs {
    pub fn new(client: reqwest::Client, config: &CycleStreetsBatch, api_key: String) -> Result<Self, BackendError> {
        if config.batch_size == 0 {
            return Err(BackendError::InvalidConfig("CycleStreets batch_size must be at least 1".into()));
        }
        if config.request_timeout == 0 {
            return Err(BackendError::InvalidConfig("CycleStreets request_timeout must be at least 1".into()));
        }
        if config.base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidConfig(format!("Not a base URL: {}", config.base_url)));
        }

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key,
            username: config.username.resolve()?,
            password: config.password.resolve()?,
            batch_size: config.batch_size,
            poll_interval: Duration::from_secs(config.poll_interval),
            request_timeout: Duration::from_secs(config.request_timeout),
            job_timeout: Duration::from_secs(config.job_timeout),
            server_id: config.server_id,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// All requests of a batch share the profile of the run
    pub(crate) async fn route_batch(
        &self,
        requests: &[RouteRequest],
        quota: &QuotaTracker,
    ) -> Vec<(PairId, Result<Route, RoutingError>)> {
        match self.run_job(requests, quota).await {
            Ok(mut routes) => requests.iter()
                .map(|request| {
                    let route = routes.remove(&request.id()).unwrap_or_else(|| {
                        Err(RoutingError::Permanent(format!("Batch job has no result for pair {}", request.id())))
                    });
                    (request.id(), route)
                })
                .collect(),
            Err(err) => requests.iter().map(|request| (request.id(), Err(err.clone()))).collect(),
        }
    }

    async fn run_job(
        &self,
        requests: &[RouteRequest],
        quota: &QuotaTracker,
    ) -> Result<HashMap<PairId, Result<Route, RoutingError>>, RoutingError> {
        let Some(first) = requests.first() else {
            return Ok(HashMap::new());
        };
        let plan = plan(first.profile.as_str())?;

        let id = self.create_job(requests, plan, quota).await?;
        info!(target: "backend", "Created CycleStreets batch job {} for {} pairs", id, requests.len());
        let mut job = RunningJob { jobs: self, id, done: false };

        let results = self.results_of(&job.id, quota).await;
        match results {
            Ok(data) => {
                job.done = true;
                parse_results(data)
            }
            Err(err) => {
                job.terminate().await;
                Err(err)
            }
        }
    }

    /// Starts the job and waits for its results. Once the job runs, failed polls and downloads
    /// are repeated until the job timeout instead of failing the job.
    async fn results_of(&self, job: &JobId, quota: &QuotaTracker) -> Result<Vec<u8>, RoutingError> {
        let _: JsonValue = send_json(self.control(job, "start")?, quota).await?;
        // A timeout too large to be represented is no timeout
        let deadline = Instant::now().checked_add(self.job_timeout);

        let data_url = self.wait_for(job, deadline, quota).await?;
        debug!(target: "backend", "Downloading results of batch job {} from {}", job, data_url);
        loop {
            match self.download(data_url.clone()).await {
                Ok(data) => return Ok(data),
                Err(err) if err.is_retryable() => {
                    debug!(target: "backend", "Downloading results of batch job {} failed: {}", job, err);
                    self.pause(job, &err, deadline).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn create_job(&self, requests: &[RouteRequest], plan: &str, quota: &QuotaTracker) -> Result<JobId, RoutingError> {
        let geometry = serde_json::to_string(&desire_lines(requests))
            .map_err(|err| RoutingError::Permanent(err.to_string()))?;
        let mut form = vec![
            ("name", format!("routebench {} pairs", requests.len())),
            ("geometry", geometry),
            ("strategies", plan.to_string()),
            ("bothDirections", "0".to_string()),
            ("includeJsonOutput", "1".to_string()),
            ("filename", "routebench".to_string()),
            ("username", self.username.clone()),
            ("password", self.password.clone()),
        ];
        if let Some(server_id) = self.server_id {
            form.push(("serverId", server_id.to_string()));
        }

        let created: CreatedJob = send_json(self.post("v2/batchroutes.createjob")?.form(&form), quota).await?;
        match created {
            CreatedJob { error: Some(error), .. } => Err(RoutingError::Permanent(format!("Batch job rejected: {error}"))),
            CreatedJob { id: Some(id), .. } => Ok(id),
            CreatedJob { id: None, .. } => Err(RoutingError::Permanent("Batch job created without id".into())),
        }
    }

    /// Polls the job until it completes and returns where its results can be downloaded
    async fn wait_for(&self, job: &JobId, deadline: Option<Instant>, quota: &QuotaTracker) -> Result<Url, RoutingError> {
        loop {
            let reply = send_json::<JobData>(
                self.post("v2/batchroutes.jobdata")?.form(&self.credentials(job)),
                quota,
            ).await;
            let data = match reply {
                Ok(data) => data,
                Err(err) if err.is_retryable() => {
                    debug!(target: "backend", "Polling batch job {} failed: {}", job, err);
                    self.pause(job, &err, deadline).await?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            if let Some(error) = data.error {
                return Err(RoutingError::Permanent(format!("Batch job {job}: {error}")));
            }

            match data.status.as_deref() {
                Some("completed") => {
                    let data_url = data.data_url.ok_or_else(|| {
                        RoutingError::Permanent(format!("Batch job {job} completed without results"))
                    })?;
                    // Relative links point to the API server
                    return self.base_url.join(&data_url)
                        .map_err(|err| RoutingError::Permanent(format!("Invalid results URL '{data_url}': {err}")));
                }
                Some(status @ ("failed" | "cancelled")) => {
                    return Err(RoutingError::Permanent(format!("Batch job {job} {status}")));
                }
                status => {
                    debug!(target: "backend", "Batch job {} is {}", job, status.unwrap_or("pending"));
                    self.sleep_until_next_poll(job, self.poll_interval, deadline).await?;
                }
            }
        }
    }

    /// Waits before repeating a failed call, at least as long as the server asks for
    async fn pause(&self, job: &JobId, err: &RoutingError, deadline: Option<Instant>) -> Result<(), RoutingError> {
        let wait = match err {
            RoutingError::RateLimited { retry_after: Some(retry_after), .. } => self.poll_interval.max(*retry_after),
            _ => self.poll_interval,
        };
        self.sleep_until_next_poll(job, wait, deadline).await
    }

    async fn sleep_until_next_poll(&self, job: &JobId, wait: Duration, deadline: Option<Instant>) -> Result<(), RoutingError> {
        if let Some(deadline) = deadline {
            let next_poll = Instant::now().checked_add(wait);
            if next_poll.map_or(true, |next_poll| next_poll >= deadline) {
                warn!(target: "backend", "Batch job {} did not complete within {:?}", job, self.job_timeout);
                return Err(RoutingError::Timeout);
            }
        }
        sleep(wait).await;
        Ok(())
    }

    async fn download(&self, url: Url) -> Result<Vec<u8>, RoutingError> {
        let response = self.client.get(url)
            .timeout(self.request_timeout)
            .send().await
            .map_err(classify_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let bytes = response.bytes().await.map_err(classify_reqwest_error)?;
        Ok(bytes.to_vec())
    }

    fn post(&self, path: &str) -> Result<reqwest::RequestBuilder, RoutingError> {
        let url = endpoint(&self.base_url, path)
            .ok_or_else(|| RoutingError::Permanent(format!("Invalid CycleStreets URL {}", self.base_url)))?;
        Ok(self.client.post(url)
            .query(&[("key", self.api_key.as_str())])
            .timeout(self.request_timeout))
    }

    fn control(&self, job: &JobId, action: &str) -> Result<reqwest::RequestBuilder, RoutingError> {
        let form = [self.credentials(job), vec![("action", action.to_string())]].concat();
        Ok(self.post("v2/batchroutes.controljob")?.form(&form))
    }

    fn credentials(&self, job: &JobId) -> Vec<(&'static str, String)> {
        vec![
            ("id", job.to_string()),
            ("username", self.username.clone()),
            ("password", self.password.clone()),
        ]
    }
}

/// Straight lines between origin and destination, identified by pair id
fn desire_lines(requests: &[RouteRequest]) -> FeatureCollection {
    let features = requests.iter()
        .map(|request| {
            let (origin, destination) = (request.pair.origin, request.pair.destination);
            let mut properties = JsonObject::new();
            properties.insert("id".to_string(), JsonValue::from(request.id().0));

            Feature {
                bbox: None,
                geometry: Some(Geometry::new(geojson::Value::LineString(vec![
                    vec![origin.x, origin.y],
                    vec![destination.x, destination.y],
                ]))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    FeatureCollection { bbox: None, features, foreign_members: None }
}

fn parse_results(data: Vec<u8>) -> Result<HashMap<PairId, Result<Route, RoutingError>>, RoutingError> {
    // Every column as text, the ids are parsed below
    let frame = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .into_reader_with_file_handle(Cursor::new(data))
        .finish()
        .map_err(|err| RoutingError::Permanent(format!("Invalid batch results: {err}")))?;
    let ids = text_column(&frame, "id")?;
    let journeys = text_column(&frame, "json")?;

    let mut routes = HashMap::with_capacity(frame.height());
    for (id, journey) in ids.into_iter().zip(journeys.into_iter()) {
        let Some(id) = id.and_then(|id| id.trim().parse().ok()).map(PairId) else {
            warn!(target: "backend", "Skipping batch result without valid pair id {:?}", id);
            continue;
        };
        let route = match journey {
            Some(journey) if !journey.trim().is_empty() => serde_json::from_str::<JourneyResponse>(journey)
                .map_err(|err| RoutingError::Permanent(format!("Unexpected journey: {err}")))
                .and_then(JourneyResponse::into_route),
            _ => Err(RoutingError::Permanent("CycleStreets found no route".into())),
        };
        routes.insert(id, route);
    }
    Ok(routes)
}

fn text_column<'a>(frame: &'a DataFrame, name: &str) -> Result<&'a StringChunked, RoutingError> {
    frame.column(name)
        .and_then(|column| column.as_materialized_series().str())
        .map_err(|err| RoutingError::Permanent(format!("Invalid batch results: {err}")))
}
