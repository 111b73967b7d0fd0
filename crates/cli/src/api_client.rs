use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid server URL")?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            token: token.map(str::to_string),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("failed to build API URL")
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let request = self.authorize(req).build()?;
        tracing::debug!(method = %request.method(), url = %request.url(), "sending request");
        Ok(self.http.execute(request).await?)
    }

    async fn send_json<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let response = self.execute(req).await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("API error ({}): {}", status, error_message(&body));
        }
        serde_json::from_str(&body).context("unexpected response body")
    }

    pub async fn list_entries(
        &self,
        key_pattern: Option<&str>,
        limit: Option<i64>,
    ) -> Result<EntryListResponse> {
        let mut url = self.url("/v1/admin/entries")?;
        if let Some(pattern) = key_pattern {
            url.query_pairs_mut().append_pair("key_pattern", pattern);
        }
        if let Some(limit) = limit {
            url.query_pairs_mut()
                .append_pair("limit", &limit.to_string());
        }
        self.send_json(self.http.get(url)).await
    }

    pub async fn get_entry(&self, id: i64) -> Result<EntryView> {
        let url = self.url(&format!("/v1/admin/entries/{id}"))?;
        self.send_json(self.http.get(url)).await
    }

    pub async fn delete_entry(&self, id: i64) -> Result<EntryView> {
        let url = self.url(&format!("/v1/admin/entries/{id}"))?;
        self.send_json(self.http.delete(url)).await
    }

    pub async fn prune(&self, req: &PruneRequest) -> Result<SweepReport> {
        let url = self.url("/v1/admin/prune")?;
        self.send_json(self.http.post(url).json(req)).await
    }

    pub async fn stats(&self, detailed: bool) -> Result<CacheStats> {
        let mut url = self.url("/v1/admin/stats")?;
        if detailed {
            url.query_pairs_mut().append_pair("detailed", "true");
        }
        self.send_json(self.http.get(url)).await
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<EntryListResponse> {
        let mut url = self.url("/v1/admin/search")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("query", &query.query);
            if let Some(scope) = &query.scope {
                pairs.append_pair("scope", scope);
            }
            if let Some(after) = &query.created_after {
                pairs.append_pair("created_after", after);
            }
            if let Some(before) = &query.created_before {
                pairs.append_pair("created_before", before);
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        self.send_json(self.http.get(url)).await
    }

    pub async fn run_sweep(&self, kind: &str) -> Result<SweepRun> {
        let url = self.url(&format!("/v1/admin/sweeps/{kind}"))?;
        self.send_json(self.http.post(url)).await
    }

    /// Health is answered with 503 when degraded, which still carries a report.
    pub async fn health(&self) -> Result<HealthReport> {
        let url = self.url("/v1/health")?;
        let response = self.execute(self.http.get(url)).await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str(&body) {
            Ok(report) => Ok(report),
            Err(_) => anyhow::bail!("API error ({}): {}", status, error_message(&body)),
        }
    }
}

/// Pull `message` out of a JSON error body, else return the body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|e| format!("{} ({})", e.message, e.code))
        .unwrap_or_else(|_| body.to_string())
}

// =============================================================================
// Request/response types (mirrored from server handlers)
// =============================================================================

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryView {
    pub id: i64,
    pub key: String,
    pub version: String,
    pub scope: String,
    pub state: String,
    pub size_bytes: u64,
    pub created_at: String,
    pub updated_at: String,
    pub accessed_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntryListResponse {
    pub entries: Vec<EntryView>,
    pub count: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct PruneRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub older_than_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PruneCandidate {
    pub id: i64,
    pub key: String,
    pub version: String,
    pub scope: String,
    pub size_bytes: u64,
    pub accessed_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: u64,
    pub deleted: u64,
    pub bytes_freed: u64,
    pub errors: u64,
    pub dry_run: bool,
    #[serde(default)]
    pub candidates: Vec<PruneCandidate>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecentActivity {
    pub last_hour: i64,
    pub last_day: i64,
    pub last_week: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheStats {
    pub entry_count: i64,
    pub total_size_bytes: i64,
    pub pending_uploads: i64,
    #[serde(default)]
    pub recent_activity: Option<RecentActivity>,
    #[serde(default)]
    pub recent_entries: Vec<EntryView>,
}

#[derive(Debug, Default)]
pub struct SearchQuery {
    pub query: String,
    pub scope: Option<String>,
    /// RFC 3339 timestamp.
    pub created_after: Option<String>,
    /// RFC 3339 timestamp.
    pub created_before: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SweepRun {
    pub job_id: String,
    pub kind: String,
    pub stats: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    pub backend: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub version: String,
    #[serde(default)]
    pub storage: Option<ComponentHealth>,
    #[serde(default)]
    pub database: Option<ComponentHealth>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "ok"
    }
}
