//! The backend seam: where live resources come from and where assignments and experiment events
//! go.
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use reqwest::{blocking::Response, StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    assignment_logger::{AssignmentEvent, ExperimentEvent},
    model::{parsed_rows, Experiment, FeatureFlag, RemoteConfig, Resource, TryParse},
    Error, Result,
};

/// Remote authority for configuration. Implementations may block; callers bound every call with
/// a deadline.
pub trait ConfigBackend: Send + Sync {
    fn fetch_remote_config(&self) -> Result<RemoteConfig>;

    /// Enabled flags only.
    fn fetch_feature_flags(&self) -> Result<Vec<FeatureFlag>>;

    /// Experiments with `running` status only.
    fn fetch_running_experiments(&self) -> Result<Vec<Experiment>>;

    /// Append to `experiment_assignments`.
    fn record_assignment(&self, event: &AssignmentEvent) -> Result<()>;

    /// Append to `experiment_events`.
    fn record_event(&self, event: &ExperimentEvent) -> Result<()>;
}

const ASSIGNMENTS_TABLE: &str = "experiment_assignments";
const EVENTS_TABLE: &str = "experiment_events";

/// A [`ConfigBackend`] speaking to a PostgREST-style HTTP API, where every table is exposed at
/// `{base_url}/{table}` and filtered with `column=eq.value` query parameters.
pub struct HttpBackend {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    base_url: Url,
    api_key: String,
    /// If we receive a 401 Unauthorized error during a request, it means the API key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<HttpBackend> {
        if api_key.is_empty() {
            return Err(Error::MissingCredentials);
        }

        let mut base_url = Url::parse(base_url).map_err(Error::InvalidBaseUrl)?;
        // Url::join drops the last path segment unless it ends with a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(HttpBackend {
            client,
            base_url,
            api_key: api_key.to_owned(),
            unauthorized: AtomicBool::new(false),
        })
    }

    fn endpoint(&self, table: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.base_url.join(table).map_err(Error::InvalidBaseUrl)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn get_rows<T: DeserializeOwned>(
        &self,
        resource: Resource,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let url = self.endpoint(resource.table(), query)?;
        log::debug!(target: "flagkit", resource:display = resource; "fetching resource");
        let response = self
            .client
            .get(url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()?;
        let response = self.check_status(response)?;

        let rows: Vec<TryParse<T>> = response.json()?;
        log::debug!(target: "flagkit",
                    resource:display = resource,
                    rows = rows.len();
                    "successfully fetched resource");
        Ok(parsed_rows(rows, resource))
    }

    fn insert<T: Serialize>(&self, table: &str, row: &T) -> Result<()> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let url = self.endpoint(table, &[])?;
        let response = self
            .client
            .post(url)
            .header("apikey", &self.api_key)
            .header("Prefer", "return=minimal")
            .bearer_auth(&self.api_key)
            .json(row)
            .send()?;
        self.check_status(response)?;
        Ok(())
    }

    fn check_status(&self, response: Response) -> Result<Response> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED => {
                log::warn!(target: "flagkit", "client is not authorized. Check your API key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Err(Error::Unauthorized)
            }
            status => {
                log::warn!(target: "flagkit", "received non-200 response from backend: {:?}", status);
                Err(Error::Http(status.as_u16()))
            }
        }
    }
}

impl ConfigBackend for HttpBackend {
    fn fetch_remote_config(&self) -> Result<RemoteConfig> {
        let rows: Vec<RemoteConfig> =
            self.get_rows(Resource::RemoteConfig, &[("select", "*"), ("limit", "1")])?;
        rows.into_iter().next().ok_or(Error::EmptyResponse)
    }

    fn fetch_feature_flags(&self) -> Result<Vec<FeatureFlag>> {
        self.get_rows(
            Resource::FeatureFlags,
            &[("select", "*"), ("enabled", "eq.true")],
        )
    }

    fn fetch_running_experiments(&self) -> Result<Vec<Experiment>> {
        self.get_rows(
            Resource::Experiments,
            &[("select", "*"), ("status", "eq.running")],
        )
    }

    fn record_assignment(&self, event: &AssignmentEvent) -> Result<()> {
        self.insert(ASSIGNMENTS_TABLE, event)
    }

    fn record_event(&self, event: &ExperimentEvent) -> Result<()> {
        self.insert(EVENTS_TABLE, event)
    }
}
